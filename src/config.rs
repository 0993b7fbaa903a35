//! Session configuration, loadable from TOML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::interpreter::Interpreter;
use crate::process::SpawnOptions;
use crate::{Error, Result};

/// Configuration shared by REPL and JSON-RPC sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Python executable override; `None` uses the interpreter handle.
    #[serde(default)]
    pub python_executable: Option<PathBuf>,

    /// Seconds to wait for natural exit after SIGTERM before force-killing.
    #[serde(default = "default_grace")]
    pub termination_grace_secs: u64,

    /// Default per-call timeout in seconds; `0` waits indefinitely.
    #[serde(default)]
    pub default_call_timeout_secs: u64,

    /// Capture child stdout/stderr and surface them through tracing.
    #[serde(default = "default_true")]
    pub capture_output: bool,

    /// Terminate the child when the parent receives SIGINT/SIGTERM.
    #[serde(default = "default_true")]
    pub propagate_signals: bool,
}

fn default_grace() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            python_executable: None,
            termination_grace_secs: default_grace(),
            default_call_timeout_secs: 0,
            capture_output: true,
            propagate_signals: true,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {path:?}: {e}")))?;
        Self::from_toml_str(&contents)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| Error::Config(format!("failed to parse TOML: {e}")))
    }

    /// Load `pytether.toml` from the current directory, falling back to
    /// defaults when the file doesn't exist.
    pub fn from_default_file() -> Result<Self> {
        let path = Path::new("pytether.toml");
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// The configured interpreter override, if any.
    pub fn interpreter(&self) -> Option<Interpreter> {
        self.python_executable
            .as_ref()
            .map(Interpreter::from_executable)
    }

    /// Termination grace period as a [`Duration`].
    pub fn termination_grace(&self) -> Duration {
        Duration::from_secs(self.termination_grace_secs)
    }

    /// Default call timeout; `None` waits indefinitely.
    pub fn default_call_timeout(&self) -> Option<Duration> {
        match self.default_call_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Derive process spawn options from this configuration.
    pub fn spawn_options(&self) -> SpawnOptions {
        SpawnOptions {
            capture_output: self.capture_output,
            propagate_signals: self.propagate_signals,
            ..SpawnOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.termination_grace_secs, 5);
        assert!(config.capture_output);
        assert!(config.default_call_timeout().is_none());
    }

    #[test]
    fn test_from_toml_str() {
        let config = SessionConfig::from_toml_str(
            r#"
            python_executable = "/opt/py/bin/python3"
            termination_grace_secs = 2
            default_call_timeout_secs = 30
            capture_output = false
            "#,
        )
        .unwrap();
        assert_eq!(
            config.python_executable,
            Some(PathBuf::from("/opt/py/bin/python3"))
        );
        assert_eq!(config.termination_grace(), Duration::from_secs(2));
        assert_eq!(
            config.default_call_timeout(),
            Some(Duration::from_secs(30))
        );
        assert!(!config.capture_output);
        assert!(config.propagate_signals);
    }

    #[test]
    fn test_rejects_bad_toml() {
        assert!(SessionConfig::from_toml_str("termination_grace_secs = \"soon\"").is_err());
    }
}
