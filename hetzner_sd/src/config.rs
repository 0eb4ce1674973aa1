//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program.
//!
//! Configuration arrives in three layers: command line flags (or their
//! environment variable twins), an optional config file in YAML or JSON and
//! finally the username/password pair given on the command line. The result
//! is checked by [`Config::validate`] before the daemon starts.

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use rustc_hash::FxHashSet;
use serde::Deserialize;

/// Project name assigned to the credential given on the command line.
pub const DEFAULT_PROJECT: &str = "default";

/// Default base URL of the Hetzner Robot webservice.
pub const DEFAULT_ENDPOINT: &str = "https://robot-ws.your-server.de";

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The output file path is empty.
    #[error("Missing path for output.file")]
    MissingOutputFile,
    /// A username is required but empty.
    #[error("Missing required hetzner.username")]
    MissingUsername,
    /// A password is required but empty.
    #[error("Missing required hetzner.password")]
    MissingPassword,
    /// Neither the command line nor the config file provided a credential.
    #[error("Missing any credentials")]
    MissingAnyCredentials,
    /// The refresh interval must be at least one second.
    #[error("Refresh interval must be at least one second")]
    InvalidRefresh,
    /// The metrics path must be absolute.
    #[error("Web path must start with '/': {0}")]
    InvalidWebPath(String),
    /// Two credentials share a project name.
    #[error("Duplicate project found: {0}")]
    DuplicateProject(String),
    /// A credential from the config file lacks a username or password.
    #[error("Incomplete credentials for project {0}")]
    IncompleteCredential(String),
    /// The config file extension is not one we can parse.
    #[error("Unknown config file format: {0:?}")]
    UnknownFormat(PathBuf),
    /// Error reading the config file.
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error for a serde [`serde_json`].
    #[error("Failed to deserialize json: {0}")]
    SerdeJson(#[from] serde_json::Error),
}

/// Main configuration struct for this program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// The metrics web server
    pub server: Server,
    /// Logging behavior
    pub logs: Logs,
    /// Discovery and output behavior
    pub target: Target,
}

/// Configuration for the metrics web server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    /// Address to bind the metrics server
    pub addr: String,
    /// Path to serve metrics on
    pub path: String,
}

/// Configuration for the logger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Logs {
    /// Only log messages with given severity
    pub level: String,
    /// Human readable output instead of JSON
    pub pretty: bool,
}

/// Configuration for discovery and the `file_sd` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Path to write the `file_sd` config
    pub file: PathBuf,
    /// Discovery refresh interval in seconds
    pub refresh: u64,
    /// Base URL of the inventory API
    pub endpoint: String,
    /// One credential per project to discover
    pub credentials: Vec<Credential>,
}

impl Target {
    /// The refresh interval as a [`Duration`].
    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh)
    }
}

/// API credentials for a single project.
#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Credential {
    /// Name used to label targets discovered with this credential
    pub project: String,
    /// Webservice username
    #[serde(default)]
    pub username: String,
    /// Webservice password
    #[serde(default)]
    pub password: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("project", &self.project)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: Server {
                addr: "0.0.0.0:9000".to_string(),
                path: "/metrics".to_string(),
            },
            logs: Logs {
                level: "info".to_string(),
                pretty: false,
            },
            target: Target {
                file: PathBuf::from("/etc/prometheus/hetzner.json"),
                refresh: 30,
                endpoint: DEFAULT_ENDPOINT.to_string(),
                credentials: Vec::new(),
            },
        }
    }
}

/// Contents of the optional config file.
///
/// All fields are optional. Values present here override whatever was given
/// on the command line, credentials are appended.
#[derive(Debug, Default, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// Overrides for the metrics web server.
    #[serde(default)]
    pub server: FileServer,
    /// Overrides for discovery and output.
    #[serde(default)]
    pub target: FileTarget,
}

/// The `server` section of [`FileConfig`].
#[derive(Debug, Default, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FileServer {
    /// Address to bind the metrics server
    pub addr: Option<String>,
    /// Path to serve metrics on
    pub path: Option<String>,
}

/// The `target` section of [`FileConfig`].
#[derive(Debug, Default, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FileTarget {
    /// Path to write the `file_sd` config
    pub file: Option<PathBuf>,
    /// Discovery refresh interval in seconds
    pub refresh: Option<u64>,
    /// Base URL of the inventory API
    pub endpoint: Option<String>,
    /// Additional credentials
    #[serde(default)]
    pub credentials: Vec<Credential>,
}

/// Load a config file, picking the parser by file extension.
///
/// # Errors
///
/// Returns an error if the extension is not one of `yaml`, `yml` or `json`,
/// if the file cannot be read or if its contents do not deserialize.
pub fn load_file(path: &Path) -> Result<FileConfig, Error> {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    let parse: fn(&str) -> Result<FileConfig, Error> = match ext.as_deref() {
        Some("yaml" | "yml") => |s| serde_yaml::from_str(s).map_err(Error::from),
        Some("json") => |s| serde_json::from_str(s).map_err(Error::from),
        _ => return Err(Error::UnknownFormat(path.to_path_buf())),
    };

    let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
        path: path.to_path_buf(),
        source: Box::new(source),
    })?;
    parse(&contents)
}

impl Config {
    /// Apply a loaded [`FileConfig`] on top of this configuration.
    pub fn merge_file(&mut self, file: FileConfig) {
        if let Some(addr) = file.server.addr {
            self.server.addr = addr;
        }
        if let Some(path) = file.server.path {
            self.server.path = path;
        }
        if let Some(output) = file.target.file {
            self.target.file = output;
        }
        if let Some(refresh) = file.target.refresh {
            self.target.refresh = refresh;
        }
        if let Some(endpoint) = file.target.endpoint {
            self.target.endpoint = endpoint;
        }
        self.target.credentials.extend(file.target.credentials);
    }

    /// Add the credential given on the command line.
    ///
    /// The credential is only added when both username and password were
    /// given. Either of them being empty is an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingUsername`] or [`Error::MissingPassword`] if a
    /// supplied value is empty.
    pub fn add_cli_credential(
        &mut self,
        username: Option<String>,
        password: Option<String>,
    ) -> Result<(), Error> {
        let (Some(username), Some(password)) = (username, password) else {
            return Ok(());
        };

        if username.is_empty() {
            return Err(Error::MissingUsername);
        }
        if password.is_empty() {
            return Err(Error::MissingPassword);
        }

        self.target.credentials.push(Credential {
            project: DEFAULT_PROJECT.to_string(),
            username,
            password,
        });
        Ok(())
    }

    /// Check that an output file is set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingOutputFile`] if the output path is empty.
    pub fn validate_output(&self) -> Result<(), Error> {
        if self.target.file.as_os_str().is_empty() {
            return Err(Error::MissingOutputFile);
        }
        Ok(())
    }

    /// Check that this configuration is runnable.
    ///
    /// # Errors
    ///
    /// Returns an error if the output file is empty, the refresh interval is
    /// zero, the web path is relative, no credential exists, a credential is
    /// incomplete or a project name is used twice.
    pub fn validate(&self) -> Result<(), Error> {
        self.validate_output()?;
        if self.target.refresh == 0 {
            return Err(Error::InvalidRefresh);
        }
        if !self.server.path.starts_with('/') {
            return Err(Error::InvalidWebPath(self.server.path.clone()));
        }
        if self.target.credentials.is_empty() {
            return Err(Error::MissingAnyCredentials);
        }

        let mut seen = FxHashSet::default();
        for credential in &self.target.credentials {
            if credential.username.is_empty() || credential.password.is_empty() {
                return Err(Error::IncompleteCredential(credential.project.clone()));
            }
            if !seen.insert(credential.project.as_str()) {
                return Err(Error::DuplicateProject(credential.project.clone()));
            }
        }
        Ok(())
    }
}
