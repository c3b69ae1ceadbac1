//! Thin read/write helpers on top of an [`Executor`].
//!
//! Values are passed through as text; no tag catalogue or type conversion
//! happens here.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ProxyConfig;
use crate::process::{ProcessRegistry, ProxyError};
use crate::protocol::{ResponseBatch, DEFAULT_SEPARATOR};
use crate::supervisor::{ExecutionMode, Executor, SupervisorBuilder};

/// Errors from the metadata helpers.
#[derive(thiserror::Error, Debug)]
pub enum MetadataError {
    /// The proxy failed.
    #[error(transparent)]
    Proxy(#[from] ProxyError),

    /// The tool returned nothing where output was required.
    #[error("Empty response for {0:?}")]
    EmptyResponse(Vec<String>),

    /// Tag name that cannot be passed as a flag.
    #[error("Invalid tag name: {0:?}")]
    InvalidTag(String),
}

/// Counts reported by the tool after a write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub updated: u32,
    pub unchanged: u32,
}

impl WriteOutcome {
    /// Parse lines such as `    1 image files updated`.
    #[must_use]
    pub fn parse(batch: &ResponseBatch) -> Self {
        let mut outcome = Self::default();
        for line in batch.lines() {
            let mut words = line.split_whitespace();
            let Some(count) = words.next().and_then(|w| w.parse::<u32>().ok()) else {
                continue;
            };
            match words.last() {
                Some("updated") => outcome.updated += count,
                Some("unchanged") => outcome.unchanged += count,
                _ => {}
            }
        }
        outcome
    }
}

fn validate_tag(tag: &str) -> Result<(), MetadataError> {
    let valid = !tag.is_empty()
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '-' | '_' | '*'));
    if valid {
        Ok(())
    } else {
        Err(MetadataError::InvalidTag(tag.to_string()))
    }
}

/// File argument for `path`. A relative path starting with `-` would be
/// read as an option, so it gets a `./` prefix.
fn path_arg(path: &Path) -> String {
    let arg = path.to_string_lossy().into_owned();
    if arg.starts_with('-') {
        format!("./{arg}")
    } else {
        arg
    }
}

/// Metadata access through a supervised `exiftool`.
#[derive(Clone)]
pub struct ExifTool {
    executor: Arc<dyn Executor>,
    run_timeout: Option<Duration>,
}

impl std::fmt::Debug for ExifTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExifTool")
            .field("mode", &self.executor.mode())
            .field("run_timeout", &self.run_timeout)
            .finish()
    }
}

impl ExifTool {
    #[must_use]
    pub fn new(executor: Arc<dyn Executor>, run_timeout: Option<Duration>) -> Self {
        Self {
            executor,
            run_timeout,
        }
    }

    /// Build the supervisor described by `config`.
    #[must_use]
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::from_config_with_registry(config, ProcessRegistry::global())
    }

    #[must_use]
    pub fn from_config_with_registry(config: &ProxyConfig, registry: Arc<ProcessRegistry>) -> Self {
        let executor = SupervisorBuilder::new(config.tool_path.clone())
            .common_args(config.common_args.iter().cloned())
            .inactivity_timeout(config.inactivity_timeout())
            .registry(registry)
            .build(config.mode());
        Self::new(executor, config.run_timeout())
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.executor.mode()
    }

    /// Run arbitrary arguments and return the raw lines.
    ///
    /// # Errors
    ///
    /// Propagates any proxy error.
    pub async fn execute_raw(&self, args: &[String]) -> Result<ResponseBatch, MetadataError> {
        Ok(self.executor.execute(self.run_timeout, args).await?)
    }

    /// Version string reported by the tool.
    ///
    /// # Errors
    ///
    /// Returns `EmptyResponse` if the tool printed nothing.
    pub async fn version(&self) -> Result<String, MetadataError> {
        let args = vec!["-ver".to_string()];
        let batch = self.execute_raw(&args).await?;
        batch
            .lines()
            .iter()
            .map(|line| line.trim())
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or(MetadataError::EmptyResponse(args))
    }

    /// Read tags from `path` as `name -> value` text. An empty `tags` list
    /// reads every tag the tool reports.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTag` for malformed names, or any proxy error.
    pub async fn read_tags(
        &self,
        path: &Path,
        tags: &[&str],
    ) -> Result<BTreeMap<String, String>, MetadataError> {
        let mut args = vec!["-S".to_string()];
        for tag in tags {
            validate_tag(tag)?;
            args.push(format!("-{tag}"));
        }
        args.push(path_arg(path));

        let batch = self.execute_raw(&args).await?;
        Ok(batch
            .pairs(DEFAULT_SEPARATOR)
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect())
    }

    /// Write `tags` to `path` in place.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTag` for malformed names, or any proxy error.
    pub async fn write_tags(
        &self,
        path: &Path,
        tags: &[(&str, &str)],
    ) -> Result<WriteOutcome, MetadataError> {
        let mut args = vec!["-overwrite_original".to_string()];
        for (tag, value) in tags {
            validate_tag(tag)?;
            args.push(format!("-{tag}={value}"));
        }
        args.push(path_arg(path));

        let batch = self.execute_raw(&args).await?;
        Ok(WriteOutcome::parse(&batch))
    }

    /// Shut the underlying supervisor down.
    pub async fn shutdown(&self) {
        self.executor.shutdown().await;
    }
}
