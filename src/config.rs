//! Daemon Configuration
//!
//! Settings can come from a YAML file; command line flags override them
//! in `main`.

use crate::controller::retry::{RetryPolicy, DEFAULT_RETRY_DELAY};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Finalizer token registered on every ClientMount the daemon acts on
pub const DEFAULT_FINALIZER: &str = "storage.billyronks.io/client-mount";

// =============================================================================
// Daemon Configuration
// =============================================================================

/// Configuration for the mount daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DaemonConfig {
    /// Only watch ClientMounts in this namespace (normally the node name)
    pub namespace: Option<String>,

    /// Ignore ClientMounts in namespaces starting with this prefix
    pub exclude_namespace_prefix: Option<String>,

    /// Timeout for a single host command, in seconds
    pub command_timeout_secs: Option<u64>,

    /// Record host commands instead of running them
    pub mock: bool,

    /// Finalizer token guarding deletion
    pub finalizer: String,

    /// File system types that need shared (clustered) LVM activation
    pub shared_filesystems: Vec<String>,

    /// Retry schedule after a failed pass
    pub retry: RetryConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            exclude_namespace_prefix: None,
            command_timeout_secs: None,
            mock: false,
            finalizer: DEFAULT_FINALIZER.to_string(),
            shared_filesystems: vec!["gfs2".to_string()],
            retry: RetryConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.finalizer.trim().is_empty() {
            return Err(Error::Configuration("finalizer must not be empty".into()));
        }
        if self.command_timeout_secs == Some(0) {
            return Err(Error::Configuration(
                "commandTimeoutSecs must be positive".into(),
            ));
        }
        self.retry.validate()
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }

    /// Whether objects in `namespace` are ignored
    pub fn is_excluded(&self, namespace: &str) -> bool {
        self.exclude_namespace_prefix
            .as_deref()
            .map(|prefix| !prefix.is_empty() && namespace.starts_with(prefix))
            .unwrap_or(false)
    }
}

/// Retry schedule configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Double the delay after each consecutive failure
    pub exponential: bool,

    /// Delay (or initial delay) in seconds
    pub delay_secs: u64,

    /// Cap for exponential delays, in seconds
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            exponential: false,
            delay_secs: DEFAULT_RETRY_DELAY.as_secs(),
            max_delay_secs: 300,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.delay_secs == 0 {
            return Err(Error::Configuration("retry delaySecs must be positive".into()));
        }
        if self.exponential && self.max_delay_secs < self.delay_secs {
            return Err(Error::Configuration(
                "retry maxDelaySecs must not be below delaySecs".into(),
            ));
        }
        Ok(())
    }

    pub fn policy(&self) -> RetryPolicy {
        let delay = Duration::from_secs(self.delay_secs);
        if self.exponential {
            RetryPolicy::Exponential {
                initial: delay,
                max: Duration::from_secs(self.max_delay_secs),
            }
        } else {
            RetryPolicy::Fixed(delay)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();

        assert_eq!(config.finalizer, DEFAULT_FINALIZER);
        assert_eq!(config.shared_filesystems, vec!["gfs2"]);
        assert_eq!(config.retry.policy(), RetryPolicy::Fixed(Duration::from_secs(10)));
        assert_eq!(config.command_timeout(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = DaemonConfig::from_yaml(
            "namespace: compute-0\ncommandTimeoutSecs: 30\nretry:\n  exponential: true\n",
        )
        .unwrap();

        assert_eq!(config.namespace.as_deref(), Some("compute-0"));
        assert_eq!(config.command_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.finalizer, DEFAULT_FINALIZER);
        assert_eq!(
            config.retry.policy(),
            RetryPolicy::Exponential {
                initial: Duration::from_secs(10),
                max: Duration::from_secs(300),
            }
        );
    }

    #[test]
    fn test_invalid_values() {
        assert!(DaemonConfig::from_yaml("finalizer: ''\n").is_err());
        assert!(DaemonConfig::from_yaml("commandTimeoutSecs: 0\n").is_err());
        assert!(DaemonConfig::from_yaml("retry:\n  delaySecs: 0\n").is_err());
        assert!(DaemonConfig::from_yaml(
            "retry:\n  exponential: true\n  delaySecs: 60\n  maxDelaySecs: 30\n"
        )
        .is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "mock: true\nsharedFilesystems: [gfs2, ocfs2]").unwrap();

        let config = DaemonConfig::from_file(file.path()).unwrap();
        assert!(config.mock);
        assert_eq!(config.shared_filesystems, vec!["gfs2", "ocfs2"]);

        assert!(DaemonConfig::from_file(Path::new("/nonexistent/config.yaml")).is_err());
    }

    #[test]
    fn test_namespace_exclusion() {
        let mut config = DaemonConfig::default();
        assert!(!config.is_excluded("rabbit-node-0"));

        config.exclude_namespace_prefix = Some("rabbit".into());
        assert!(config.is_excluded("rabbit-node-0"));
        assert!(!config.is_excluded("compute-0"));

        config.exclude_namespace_prefix = Some(String::new());
        assert!(!config.is_excluded("compute-0"));
    }
}
