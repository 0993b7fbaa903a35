//! Bootstrap loader: launches the interpreter with the embedded two-stage
//! bootstrap and ships the serialized program over private pipes.
//!
//! The primary bootstrap goes in-line on the command (`-u -c ...`),
//! templated with the child-side descriptor of the bootstrap pipe. The
//! secondary script and the program document are written to their pipes
//! right after spawn and the write ends closed, so the child reads each to
//! EOF.

use std::collections::HashMap;
use std::io::Write;
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;

use crate::interpreter::Interpreter;
use crate::process::pipes::{inherit_fds, SessionPipes, FIRST_CHILD_FD};
use crate::process::PythonProcess;
use crate::program::{Module, Package, PythonProgram};
use crate::transport::status::spawn_status_reader;
use crate::{Error, Result};

const PRIMARY_BOOTSTRAP: &str = include_str!("../../python/bootstrap.py");
const SECONDARY_BOOTSTRAP: &str = include_str!("../../python/secondary_bootstrap.py");
const SUPPORT_INIT: &str = include_str!("../../python/pytether/__init__.py");
const SUPPORT_JSONQUEUE: &str = include_str!("../../python/pytether/jsonqueue.py");
const SUPPORT_NAMEDSEMAPHORE: &str = include_str!("../../python/pytether/namedsemaphore.py");

const BOOTSTRAP_FD_TOKEN: &str = "__BOOTSTRAP_FD__";

/// Name of the runtime's support package inside the child.
pub(crate) const SUPPORT_PACKAGE_NAME: &str = "pytether";

/// Virtual root for module paths that have no caller-supplied location.
pub(crate) const VIRTUAL_ROOT: &str = "/virtual_modules";

/// Process spawn options.
pub struct SpawnOptions {
    /// Extra environment variables merged into the child environment.
    pub env: HashMap<String, String>,
    /// User arguments, visible as `sys.argv[1:]` inside the child.
    pub args: Vec<String>,
    /// Caller-supplied extra pipes inherited after the private five.
    pub extra_pipes: Vec<OwnedFd>,
    /// Capture child stdout/stderr instead of inheriting the parent's.
    pub capture_output: bool,
    /// Terminate the child when the parent receives SIGINT/SIGTERM.
    pub propagate_signals: bool,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            env: HashMap::new(),
            args: Vec::new(),
            extra_pipes: Vec::new(),
            capture_output: true,
            propagate_signals: true,
        }
    }
}

/// The runtime's own support package, always shipped to the child.
pub(crate) fn support_package() -> Package {
    let root = format!("{VIRTUAL_ROOT}/{SUPPORT_PACKAGE_NAME}");
    Package::new(
        SUPPORT_PACKAGE_NAME,
        &root,
        vec![
            Module::from_source("__init__.py", &format!("{root}/__init__.py"), SUPPORT_INIT),
            Module::from_source(
                "jsonqueue.py",
                &format!("{root}/jsonqueue.py"),
                SUPPORT_JSONQUEUE,
            ),
            Module::from_source(
                "namedsemaphore.py",
                &format!("{root}/namedsemaphore.py"),
                SUPPORT_NAMEDSEMAPHORE,
            ),
        ],
    )
}

/// Launch a child interpreter running `program`.
///
/// Returns a [`PythonProcess`] exposing the child's standard streams, the
/// two data pipes, and the status event stream.
pub async fn spawn_program(
    interpreter: &Interpreter,
    program: &PythonProgram,
    options: SpawnOptions,
) -> Result<PythonProcess> {
    let pipes = SessionPipes::create()?;

    // The support package rides in front of the caller's packages so its
    // initializer runs first inside the child.
    let mut shipped = program.clone();
    shipped.packages.insert(0, support_package());
    shipped.pipe_out = FIRST_CHILD_FD;
    shipped.pipe_in = FIRST_CHILD_FD + 1;
    shipped.status_in = FIRST_CHILD_FD + 2;
    let program_json = serde_json::to_vec(&shipped)?;

    let mut child_fds = pipes.child_fds();
    for extra in &options.extra_pipes {
        child_fds.push(extra.as_raw_fd());
    }

    let mut cmd = tokio::process::Command::new(&interpreter.python_path);
    let fd_strings = inherit_fds(&mut cmd, &child_fds);
    let bootstrap_fd = &fd_strings[3];
    let program_fd = &fd_strings[4];

    let primary = PRIMARY_BOOTSTRAP.replace(BOOTSTRAP_FD_TOKEN, bootstrap_fd);

    // Inheritable pipe count, then each descriptor, then user arguments.
    let inheritable = fd_strings.len() - 3;
    cmd.arg("-u").arg("-c").arg(primary);
    cmd.arg(inheritable.to_string());
    cmd.arg(bootstrap_fd).arg(program_fd);
    cmd.args(&fd_strings[5..]);
    cmd.args(&options.args);

    cmd.envs(&options.env);
    cmd.stdin(Stdio::piped());
    if options.capture_output {
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
    } else {
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
    }

    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Spawn(format!("failed to spawn {:?}: {e}", interpreter.python_path)))?;
    let pid = child
        .id()
        .ok_or_else(|| Error::Spawn("child exited before startup".to_string()))?;
    tracing::info!("spawned python process {pid} for program {:?}", program.name);

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let SessionPipes {
        data_in,
        data_out,
        status,
        bootstrap,
        program: program_pipe,
    } = pipes;

    // Close the child-side ends in the parent; the child keeps its copies.
    drop(data_in.write);
    drop(data_out.read);
    drop(status.write);
    drop(bootstrap.read);
    drop(program_pipe.read);
    drop(options.extra_pipes);

    // One-shot transfers. Each runs off the async runtime because a large
    // program document can exceed the pipe buffer; dropping the file closes
    // the pipe and signals EOF to the child.
    let mut bootstrap_writer = std::fs::File::from(bootstrap.write);
    tokio::task::spawn_blocking(move || {
        if let Err(e) = bootstrap_writer.write_all(SECONDARY_BOOTSTRAP.as_bytes()) {
            tracing::warn!("failed to write secondary bootstrap: {e}");
        }
    });
    let mut program_writer = std::fs::File::from(program_pipe.write);
    tokio::task::spawn_blocking(move || {
        if let Err(e) = program_writer.write_all(&program_json) {
            tracing::warn!("failed to write program data: {e}");
        }
    });

    let status_events = spawn_status_reader(std::fs::File::from(status.read));

    Ok(PythonProcess::new(
        pid,
        child,
        stdin,
        stdout,
        stderr,
        std::fs::File::from(data_in.read),
        std::fs::File::from(data_out.write),
        status_events,
        options.propagate_signals,
    ))
}
