//! Interpreter handle: the interface an external provisioning service
//! yields and this runtime consumes.
//!
//! Creating conda/venv environments and installing packages is out of
//! scope; anything that can point at a Python executable can produce one
//! of these.

use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Handle to a provisioned Python interpreter.
#[derive(Debug, Clone)]
pub struct Interpreter {
    /// Path to the Python executable.
    pub python_path: PathBuf,
    /// Path to the environment's site-packages directory, when known.
    pub site_packages: Option<PathBuf>,
    /// Root directory of the environment, when known.
    pub env_root: Option<PathBuf>,
    /// Interpreter version string, when known.
    pub version: Option<String>,
}

impl Interpreter {
    /// Wrap an existing Python executable.
    pub fn from_executable(python_path: impl Into<PathBuf>) -> Self {
        Self {
            python_path: python_path.into(),
            site_packages: None,
            env_root: None,
            version: None,
        }
    }

    /// Locate a system Python (`python3`, then `python`) on `PATH`.
    pub fn from_system() -> Result<Self> {
        let path_var = std::env::var_os("PATH")
            .ok_or_else(|| Error::Config("PATH is not set".to_string()))?;
        for name in ["python3", "python"] {
            for dir in std::env::split_paths(&path_var) {
                let candidate = dir.join(name);
                if is_executable(&candidate) {
                    return Ok(Self::from_executable(candidate));
                }
            }
        }
        Err(Error::Config(
            "no python3 or python executable found on PATH".to_string(),
        ))
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
