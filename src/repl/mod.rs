//! Sentinel-delimited REPL runtime.
//!
//! A REPL session is a [`PythonProgram`] whose main module is the embedded
//! REPL script. Frames in both directions end with a three-byte sentinel
//! plus a line feed; interpreter state persists between executes. There is
//! no in-band cancellation: a timeout destroys the session, because
//! mid-compute Python cannot be safely preempted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};

use crate::config::SessionConfig;
use crate::interpreter::Interpreter;
use crate::process::{spawn_program, PythonProcess, SpawnOptions};
use crate::program::{Module, Package, PythonProgram};
use crate::transport::status::StatusEvent;
use crate::{Error, Result};

const REPL_SCRIPT: &str = include_str!("../../python/repl.py");

/// Frame terminator: three non-printing bytes plus a line feed.
const SENTINEL: &[u8] = b"\x01\x02\x03\n";
/// Variant produced by line-ending translation on some platforms.
const SENTINEL_CRLF: &[u8] = b"\x01\x02\x03\r\n";

const CAPTURE_FLAG: &str = "__CAPTURE_COMBINED__ =";

/// Options for constructing a REPL session.
#[derive(Default)]
pub struct ReplOptions {
    /// Values exposed as attributes on the support package.
    pub kv_pairs: HashMap<String, Value>,
    /// Extra environment variables for the child.
    pub env: HashMap<String, String>,
    /// Free modules importable inside the session.
    pub modules: Vec<Module>,
    /// Packages importable inside the session.
    pub packages: Vec<Package>,
    /// Session configuration.
    pub config: SessionConfig,
}

struct ReplInner {
    reader: BufReader<tokio::fs::File>,
    writer: tokio::fs::File,
    status: mpsc::UnboundedReceiver<StatusEvent>,
    combined_output: bool,
}

/// A child interpreter driven through incremental code execution.
///
/// All executes serialize on a session-wide mutex; between calls the
/// interpreter keeps its imports, bindings, and definitions.
pub struct ReplSession {
    process: PythonProcess,
    inner: Mutex<ReplInner>,
    closed: AtomicBool,
    grace: Duration,
}

impl ReplSession {
    /// Spawn a child interpreter running the REPL script.
    pub async fn spawn(interpreter: &Interpreter, options: ReplOptions) -> Result<Self> {
        let ReplOptions {
            kv_pairs,
            env,
            modules,
            packages,
            config,
        } = options;

        let root = std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "/virtual_modules".to_string());
        let mut program = PythonProgram::new(
            "pytether-repl",
            &root,
            Module::from_source("__main__", &format!("{root}/repl.py"), REPL_SCRIPT),
        );
        program.modules = modules;
        program.packages = packages;
        if !kv_pairs.is_empty() {
            program.kv_pairs = Some(kv_pairs);
        }

        let spawn_options = SpawnOptions {
            env,
            ..config.spawn_options()
        };
        let mut process = spawn_program(interpreter, &program, spawn_options).await?;
        process.forward_output();

        let data_in = process
            .take_data_in()
            .ok_or_else(|| Error::Spawn("data pipe missing".to_string()))?;
        let data_out = process
            .take_data_out()
            .ok_or_else(|| Error::Spawn("data pipe missing".to_string()))?;
        let status = process
            .take_status_events()
            .ok_or_else(|| Error::Spawn("status channel missing".to_string()))?;

        Ok(Self {
            process,
            inner: Mutex::new(ReplInner {
                reader: BufReader::new(tokio::fs::File::from_std(data_in)),
                writer: tokio::fs::File::from_std(data_out),
                status,
                combined_output: true,
            }),
            closed: AtomicBool::new(false),
            grace: config.termination_grace(),
        })
    }

    /// Execute a block of code and return its captured output.
    ///
    /// With `combined_output`, stdout and stderr are captured together and
    /// returned; without it, output goes to the child's real streams and
    /// the returned string is empty. A Python exception raised by the code
    /// surfaces as [`Error::Python`] carrying the captured output.
    pub async fn execute(&self, code: &str, combined_output: bool) -> Result<String> {
        let mut inner = self.inner.lock().await;
        self.send_block(&mut inner, code, combined_output).await?;
        self.receive_block(&mut inner).await
    }

    /// [`execute`](Self::execute) racing the receive path against a
    /// deadline.
    ///
    /// On expiry the session is closed and the child terminated; the cost
    /// of cancellation is the session itself.
    pub async fn execute_with_timeout(
        &self,
        code: &str,
        combined_output: bool,
        timeout: Duration,
    ) -> Result<String> {
        let mut inner = self.inner.lock().await;
        self.send_block(&mut inner, code, combined_output).await?;
        match tokio::time::timeout(timeout, self.receive_block(&mut inner)).await {
            Ok(result) => result,
            Err(_) => {
                self.closed.store(true, Ordering::SeqCst);
                let _ = self.process.terminate_with_grace(self.grace).await;
                Err(Error::Timeout("repl execution".to_string()))
            }
        }
    }

    /// Close the session and terminate the child. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.process.terminate_with_grace(self.grace).await
    }

    /// The supervised child process.
    pub fn process(&self) -> &PythonProcess {
        &self.process
    }

    async fn send_block(
        &self,
        inner: &mut ReplInner,
        code: &str,
        combined_output: bool,
    ) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        // Control lines carry the same sentinel terminator as code frames.
        if inner.combined_output != combined_output {
            let flag = if combined_output { "True" } else { "False" };
            let mut line = format!("{CAPTURE_FLAG} {flag}").into_bytes();
            line.extend_from_slice(SENTINEL);
            inner.writer.write_all(&line).await?;
            inner.writer.flush().await?;
            inner.combined_output = combined_output;
        }

        let mut frame = normalize_code(code).into_bytes();
        frame.extend_from_slice(SENTINEL);
        inner.writer.write_all(&frame).await?;
        inner.writer.flush().await?;
        Ok(())
    }

    async fn receive_block(&self, inner: &mut ReplInner) -> Result<String> {
        // A status or exception object always precedes the end of output.
        let exception = match inner.status.recv().await {
            None => {
                self.closed.store(true, Ordering::SeqCst);
                return Err(Error::Closed);
            }
            Some(StatusEvent::Status(status)) if status == "exit" => {
                self.closed.store(true, Ordering::SeqCst);
                return Err(Error::Closed);
            }
            Some(StatusEvent::Status(_)) => None,
            Some(StatusEvent::Exception(exception)) => Some(exception),
        };

        let mut buffer: Vec<u8> = Vec::new();
        loop {
            let n = inner.reader.read_until(b'\n', &mut buffer).await?;
            if n == 0 {
                self.closed.store(true, Ordering::SeqCst);
                return Err(Error::Transport("unexpected EOF on data pipe".to_string()));
            }
            if let Some(trimmed) = strip_sentinel(&buffer) {
                let output = String::from_utf8_lossy(trimmed)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                return match exception {
                    Some(exception) => Err(Error::Python { exception, output }),
                    None => Ok(output),
                };
            }
        }
    }
}

/// Collapse blank lines and trim trailing whitespace.
fn normalize_code(code: &str) -> String {
    let mut code = code.replace("\r\n", "\n");
    while code.contains("\n\n") {
        code = code.replace("\n\n", "\n");
    }
    code.trim_end_matches([' ', '\t', '\n', '\r']).to_string()
}

/// Strip the frame terminator, accepting the CRLF variant produced by
/// platforms that translate line endings on receipt.
fn strip_sentinel(buffer: &[u8]) -> Option<&[u8]> {
    if buffer.ends_with(SENTINEL_CRLF) {
        Some(&buffer[..buffer.len() - SENTINEL_CRLF.len()])
    } else if buffer.ends_with(SENTINEL) {
        Some(&buffer[..buffer.len() - SENTINEL.len()])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_blank_lines() {
        assert_eq!(normalize_code("a\r\n\r\nb\n\n\nc\n"), "a\nb\nc");
        assert_eq!(normalize_code("x = 1   \t\n"), "x = 1");
        assert_eq!(normalize_code("for i in range(3): print(i)"), "for i in range(3): print(i)");
    }

    #[test]
    fn test_strip_sentinel_accepts_both_variants() {
        assert_eq!(strip_sentinel(b"out\n\x01\x02\x03\n").unwrap(), b"out\n");
        assert_eq!(strip_sentinel(b"out\n\x01\x02\x03\r\n").unwrap(), b"out\n");
        assert!(strip_sentinel(b"partial output\n").is_none());
    }

    #[test]
    fn test_repl_script_embeds_matching_sentinel() {
        assert!(REPL_SCRIPT.contains("\\x01\\x02\\x03\\n"));
        assert!(REPL_SCRIPT.contains("__CAPTURE_COMBINED__ ="));
    }
}
