//! Client for the Hetzner Robot webservice.
//!
//! Only the server listing is needed for discovery. The webservice answers
//! `GET /server` with a JSON array of envelopes, one per dedicated server:
//!
//! ```json
//! [{"server": {"server_ip": "123.123.123.123", "server_number": 321, ...}}]
//! ```
//!
//! An account without servers is reported as a 404 carrying the error code
//! `SERVER_NOT_FOUND`, which this client treats as an empty listing.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use tracing::trace;

use crate::config::Credential;

/// Timeout applied to every request against the webservice.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const NOT_FOUND_CODE: &str = "SERVER_NOT_FOUND";

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Client`]
pub enum Error {
    /// Wrapper for [`reqwest::Error`].
    #[error("Request failed: {0}")]
    Reqwest(#[from] reqwest::Error),
    /// The webservice rejected the credentials.
    #[error("Unauthorized, check username and password")]
    Unauthorized,
    /// The webservice returned an error status.
    #[error("API error {status}: {code}: {message}")]
    Api {
        /// HTTP status of the response
        status: StatusCode,
        /// Error code reported by the webservice
        code: String,
        /// Human readable message reported by the webservice
        message: String,
    },
}

/// A dedicated server as reported by the webservice.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Server {
    /// Main IPv4 address, absent for IPv6-only servers
    #[serde(default)]
    pub server_ip: Option<String>,
    /// Main IPv6 network
    #[serde(default)]
    pub server_ipv6_net: Option<String>,
    /// Unique server number
    pub server_number: u64,
    /// User assigned server name
    #[serde(default)]
    pub server_name: String,
    /// Product name
    #[serde(default)]
    pub product: String,
    /// Data center
    #[serde(default)]
    pub dc: String,
    /// Traffic allowance
    #[serde(default)]
    pub traffic: String,
    /// Flatrate traffic, not reported by every API version
    #[serde(default)]
    pub flatrate: Option<bool>,
    /// Provisioning status, `ready` or `in process`
    #[serde(default)]
    pub status: String,
    /// Bandwidth throttling, not reported by every API version
    #[serde(default)]
    pub throttled: Option<bool>,
    /// Whether the server has been cancelled
    #[serde(default)]
    pub cancelled: bool,
    /// Paid until date, `YYYY-MM-DD`
    #[serde(default)]
    pub paid_until: String,
}

#[derive(Deserialize)]
struct ServerEnvelope {
    server: Server,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Authenticated client for a single project.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    servers_url: String,
    username: String,
    password: String,
}

impl Client {
    /// Create a new [`Client`] for `credential` against `endpoint`.
    ///
    /// # Errors
    ///
    /// Function will error if the underlying HTTP client cannot be built,
    /// for instance when no TLS backend is available.
    pub fn new(endpoint: &str, credential: &Credential, timeout: Duration) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .user_agent(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http,
            servers_url: format!("{}/server", endpoint.trim_end_matches('/')),
            username: credential.username.clone(),
            password: credential.password.clone(),
        })
    }

    /// List every server visible to this client's credentials.
    ///
    /// # Errors
    ///
    /// Function will error if the request fails, the credentials are rejected,
    /// the webservice reports an error or the body is not the expected JSON.
    pub async fn servers(&self) -> Result<Vec<Server>, Error> {
        let resp = self
            .http
            .get(&self.servers_url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        let status = resp.status();
        trace!("GET {url} returned {status}", url = self.servers_url);

        if status.is_success() {
            let envelopes: Vec<ServerEnvelope> = resp.json().await?;
            return Ok(envelopes.into_iter().map(|e| e.server).collect());
        }

        if status == StatusCode::UNAUTHORIZED {
            return Err(Error::Unauthorized);
        }

        // Error bodies are best effort, a proxy in front of the webservice
        // may answer with HTML.
        let body = resp.bytes().await?;
        let (code, message) = match serde_json::from_slice::<ErrorEnvelope>(&body) {
            Ok(envelope) => (envelope.error.code, envelope.error.message),
            Err(_) => (String::new(), String::from_utf8_lossy(&body).into_owned()),
        };

        if status == StatusCode::NOT_FOUND && code == NOT_FOUND_CODE {
            return Ok(Vec::new());
        }

        Err(Error::Api {
            status,
            code,
            message,
        })
    }
}
