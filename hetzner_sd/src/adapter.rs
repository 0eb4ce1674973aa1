//! The `file_sd` output.
//!
//! Prometheus watches a JSON file holding an array of target groups, each a
//! list of addresses plus the labels shared by them. The [`Adapter`] keeps the
//! current set of groups keyed by their source and rewrites the file whenever
//! that set changes.
//!
//! Writes are atomic: the new contents land in a temporary file beside the
//! output, which is then renamed over it. Prometheus never observes a
//! partially written file.
//!
//! ## Metrics
//!
//! `prometheus_hetzner_sd_file_writes_total`: Successful writes of the output
//! `prometheus_hetzner_sd_file_write_failures_total`: Failed writes of the output
//!

use std::{
    collections::BTreeMap,
    ffi::OsString,
    io,
    path::{Path, PathBuf},
};

use metrics::counter;
use serde::Serialize;
use tokio::fs;
use tracing::{debug, info, warn};

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Adapter`]
pub enum Error {
    /// Error serializing the target groups
    #[error("Failed to serialize target groups: {0}")]
    Serialize(#[from] serde_json::Error),
    /// Error writing the temporary file
    #[error("Failed to write {path:?}: {source}")]
    Write {
        /// Temporary file path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// Error moving the temporary file into place
    #[error("Failed to rename {from:?} to {to:?}: {source}")]
    Rename {
        /// Temporary file path
        from: PathBuf,
        /// Output file path
        to: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
}

/// A set of targets sharing labels, identified by its source.
///
/// A group without targets signals that the source has gone away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    /// Unique identifier of the group, e.g. `hetzner/321`
    pub source: String,
    /// Addresses to scrape
    pub targets: Vec<String>,
    /// Labels attached to every target of the group
    pub labels: BTreeMap<String, String>,
}

impl Group {
    /// Create a group that deletes `source`.
    #[must_use]
    pub fn deleted(source: String) -> Self {
        Self {
            source,
            targets: Vec::new(),
            labels: BTreeMap::new(),
        }
    }
}

/// One element of the `file_sd` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct StaticConfig {
    targets: Vec<String>,
    labels: BTreeMap<String, String>,
}

/// Maintains the target groups and writes them to the `file_sd` output.
#[derive(Debug)]
pub struct Adapter {
    output: PathBuf,
    groups: BTreeMap<String, StaticConfig>,
    written: bool,
}

impl Adapter {
    /// Create a new [`Adapter`] writing to `output`.
    #[must_use]
    pub fn new(output: PathBuf) -> Self {
        Self {
            output,
            groups: BTreeMap::new(),
            written: false,
        }
    }

    /// The file this adapter writes.
    #[must_use]
    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Apply `groups` to the current state, writing the output if anything
    /// changed or if nothing has been written yet.
    ///
    /// Returns whether the output was written.
    ///
    /// # Errors
    ///
    /// Function will error if the output cannot be serialized or written. The
    /// state is updated regardless and the next call retries the write.
    pub async fn update(&mut self, groups: Vec<Group>) -> Result<bool, Error> {
        let mut changed = false;
        for group in groups {
            if group.targets.is_empty() {
                if self.groups.remove(&group.source).is_some() {
                    debug!("removed target group {source}", source = group.source);
                    changed = true;
                }
                continue;
            }

            let config = StaticConfig {
                targets: group.targets,
                labels: group.labels,
            };
            if self.groups.get(&group.source) != Some(&config) {
                self.groups.insert(group.source, config);
                changed = true;
            }
        }

        if !changed && self.written {
            return Ok(false);
        }

        // Clear first so a failed write is retried on the next update even
        // when that update carries no changes.
        self.written = false;
        self.write().await?;
        self.written = true;
        Ok(true)
    }

    async fn write(&self) -> Result<(), Error> {
        let configs: Vec<&StaticConfig> = self.groups.values().collect();
        let mut contents = serde_json::to_vec_pretty(&configs)?;
        contents.push(b'\n');

        let tmp = tmp_path(&self.output);
        fs::write(&tmp, &contents).await.map_err(|source| {
            counter!("prometheus_hetzner_sd_file_write_failures_total").increment(1);
            Error::Write {
                path: tmp.clone(),
                source: Box::new(source),
            }
        })?;
        if let Err(source) = fs::rename(&tmp, &self.output).await {
            counter!("prometheus_hetzner_sd_file_write_failures_total").increment(1);
            if let Err(err) = fs::remove_file(&tmp).await {
                warn!("Failed to remove {tmp}: {err}", tmp = tmp.display());
            }
            return Err(Error::Rename {
                from: tmp,
                to: self.output.clone(),
                source: Box::new(source),
            });
        }

        counter!("prometheus_hetzner_sd_file_writes_total").increment(1);
        info!(
            "wrote {groups} target groups to {output}",
            groups = configs.len(),
            output = self.output.display()
        );
        Ok(())
    }
}

/// The temporary sibling of `output`, `<output>.tmp`.
fn tmp_path(output: &Path) -> PathBuf {
    let mut name = OsString::from(output.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}
