//! Virtual module, package, and program model shipped to the child.
//!
//! A [`PythonProgram`] is serialized once over the program pipe at startup.
//! Module sources travel base64-encoded; the `Path` of every node is a
//! *virtual path*, used inside the child as `__file__` so tracebacks and
//! relative imports work without any real file system backing.

use std::collections::HashMap;
use std::path::Path as FsPath;

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// A named unit of Python source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Module {
    /// Logical name, e.g. `"__main__"` or `"helpers.py"`.
    pub name: String,
    /// Virtual path used as `__file__` inside the child.
    pub path: String,
    /// Base64-encoded source bytes.
    pub source: String,
}

impl Module {
    /// Create a module from an in-memory source string.
    pub fn from_source(name: &str, virtual_path: &str, source: &str) -> Self {
        Self {
            name: name.to_string(),
            path: virtual_path.to_string(),
            source: base64::engine::general_purpose::STANDARD.encode(source.as_bytes()),
        }
    }

    /// Create a module by reading a real file; the file's path becomes the
    /// virtual path.
    pub fn from_file(name: &str, path: &FsPath) -> Result<Self> {
        let source = std::fs::read(path)?;
        Ok(Self {
            name: name.to_string(),
            path: path.display().to_string(),
            source: base64::engine::general_purpose::STANDARD.encode(source),
        })
    }

    /// Decode the module source.
    pub fn decoded_source(&self) -> Result<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.source)
            .map_err(|e| Error::Protocol(format!("invalid base64 module source: {e}")))
    }
}

/// A recursive tree of modules; every non-leaf node carries an initializer
/// module (the child synthesizes an empty one when missing).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Package {
    /// Package name as imported inside the child.
    pub name: String,
    /// Virtual directory path (no trailing filename).
    pub path: String,
    /// Modules directly inside this package.
    pub modules: Vec<Module>,
    /// Nested sub-packages.
    pub packages: Vec<Package>,
}

impl Package {
    /// Create a package from a collection of modules.
    pub fn new(name: &str, path: &str, modules: Vec<Module>) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_string(),
            modules,
            packages: Vec::new(),
        }
    }

    /// Add a nested sub-package.
    pub fn with_subpackage(mut self, package: Package) -> Self {
        self.packages.push(package);
        self
    }

    /// Recursively package a real directory of `.py` files.
    ///
    /// Subdirectories become sub-packages; non-Python files are skipped.
    pub fn from_dir(name: &str, dir: &FsPath) -> Result<Self> {
        let mut package = Self::new(name, &dir.display().to_string(), Vec::new());
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                let sub_name = entry.file_name().to_string_lossy().to_string();
                match Self::from_dir(&sub_name, &path) {
                    Ok(sub) => package.packages.push(sub),
                    Err(e) => tracing::debug!("skipping subdirectory {:?}: {}", path, e),
                }
            } else if path.extension().is_some_and(|ext| ext == "py") {
                let module_name = entry.file_name().to_string_lossy().to_string();
                package.modules.push(Module::from_file(&module_name, &path)?);
            }
        }
        Ok(package)
    }

    /// Whether this package carries its own initializer module.
    pub fn has_init(&self) -> bool {
        self.modules
            .iter()
            .any(|m| m.name == "__init__.py" || m.name == "__init__")
    }
}

/// The complete program specification shipped to the child at startup.
///
/// The pipe descriptor fields are filled in by the bootstrap after pipe
/// creation; callers leave them at zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PythonProgram {
    /// Program label, used for logging only.
    pub name: String,
    /// Virtual root path for the program.
    pub path: String,
    /// The main module, executed as `__main__`.
    pub program: Module,
    /// Top-level packages. The runtime's own support package is always
    /// prepended at spawn time.
    pub packages: Vec<Package>,
    /// Free top-level modules, importable by name.
    pub modules: Vec<Module>,
    /// Child-side descriptor the child reads commands from.
    pub pipe_in: i32,
    /// Child-side descriptor the child writes results to.
    pub pipe_out: i32,
    /// Child-side descriptor the child writes status objects to.
    pub status_in: i32,
    /// Non-zero starts a debug server on this port and waits for attach.
    pub debug_port: u16,
    /// Break at the first line of the main module once a debugger attached.
    pub break_on_start: bool,
    /// Arbitrary values exposed as attributes on the support package.
    #[serde(rename = "KVPairs")]
    pub kv_pairs: Option<HashMap<String, Value>>,
}

impl PythonProgram {
    /// Create a program around a main module.
    pub fn new(name: &str, root_path: &str, main: Module) -> Self {
        Self {
            name: name.to_string(),
            path: root_path.to_string(),
            program: main,
            packages: Vec::new(),
            modules: Vec::new(),
            pipe_in: 0,
            pipe_out: 0,
            status_in: 0,
            debug_port: 0,
            break_on_start: false,
            kv_pairs: None,
        }
    }

    /// Add a top-level package.
    pub fn with_package(mut self, package: Package) -> Self {
        self.packages.push(package);
        self
    }

    /// Add a free top-level module.
    pub fn with_module(mut self, module: Module) -> Self {
        self.modules.push(module);
        self
    }

    /// Expose a key-value pair as an attribute on the support package.
    pub fn with_kv(mut self, key: &str, value: Value) -> Self {
        self.kv_pairs
            .get_or_insert_with(HashMap::new)
            .insert(key.to_string(), value);
        self
    }

    /// Start a debug server on `port` and block until a client attaches.
    pub fn with_debug_port(mut self, port: u16, break_on_start: bool) -> Self {
        self.debug_port = port;
        self.break_on_start = break_on_start;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_module_source_roundtrip() {
        let module = Module::from_source("__main__", "/virtual_modules/main.py", "print('hi')");
        assert_eq!(module.decoded_source().unwrap(), b"print('hi')");
    }

    #[test]
    fn test_wire_field_names() {
        let program = PythonProgram::new(
            "demo",
            "/virtual_modules",
            Module::from_source("__main__", "/virtual_modules/main.py", "pass"),
        )
        .with_kv("ANSWER", json!(42));

        let value = serde_json::to_value(&program).unwrap();
        let object = value.as_object().unwrap();
        for key in [
            "Name",
            "Path",
            "Program",
            "Packages",
            "Modules",
            "PipeIn",
            "PipeOut",
            "StatusIn",
            "DebugPort",
            "BreakOnStart",
            "KVPairs",
        ] {
            assert!(object.contains_key(key), "missing wire field {key}");
        }
        assert_eq!(value["Program"]["Name"], "__main__");
        assert_eq!(value["KVPairs"]["ANSWER"], 42);
    }

    #[test]
    fn test_package_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("__init__.py"), "print('init')").unwrap();
        std::fs::write(dir.path().join("m.py"), "K = 42").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("__init__.py"), "").unwrap();

        let package = Package::from_dir("p", dir.path()).unwrap();
        assert!(package.has_init());
        assert_eq!(package.modules.len(), 2);
        assert_eq!(package.packages.len(), 1);
        assert_eq!(package.packages[0].name, "sub");
    }
}
