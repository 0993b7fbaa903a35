//! pytether - embedded-Python integration runtime
//!
//! This crate boots an isolated Python interpreter as a child process,
//! injects a virtual file system of modules and packages into it without
//! touching the host file system, and exposes three interaction modes over
//! private pipes:
//! - a line-delimited REPL with sentinel framing ([`repl::ReplSession`])
//! - a request/response JSON-RPC queue with bidirectional dispatch
//!   ([`rpc::JsonRpcSession`])
//! - a shared-memory data plane with named semaphores ([`shm`])
//!
//! Environment provisioning is out of scope: the runtime consumes a
//! [`Interpreter`] handle pointing at an existing Python executable.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod interpreter;
pub mod process;
pub mod program;
pub mod repl;
pub mod rpc;
pub mod shm;
pub mod transport;

mod error;
pub use error::{Error, Result};

pub use config::SessionConfig;
pub use interpreter::Interpreter;
pub use process::{PythonProcess, SpawnOptions};
pub use program::{Module, Package, PythonProgram};
pub use repl::ReplSession;
pub use rpc::JsonRpcSession;
pub use shm::{NamedSemaphore, SharedArray, SharedMemory};
pub use transport::status::PythonException;

/// Initialize the pytether runtime.
///
/// This should be called once at startup to initialize logging.
pub fn init() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("pytether runtime initialized");
    Ok(())
}
