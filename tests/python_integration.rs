//! End-to-end tests against a real Python interpreter.
//!
//! Every test probes for `python3` first and skips when none is available.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::io::AsyncReadExt;

use pytether::repl::ReplOptions;
use pytether::rpc::{typed, HandlerTable, RpcOptions, Service};
use pytether::shm::semaphore;
use pytether::{
    Error, Interpreter, JsonRpcSession, Module, NamedSemaphore, Package, PythonProgram,
    ReplSession, SessionConfig, SpawnOptions,
};

fn interpreter() -> Option<Interpreter> {
    let interp = Interpreter::from_system().ok()?;
    let probe = std::process::Command::new(&interp.python_path)
        .arg("--version")
        .output()
        .ok()?;
    probe.status.success().then_some(interp)
}

fn test_config() -> SessionConfig {
    SessionConfig {
        propagate_signals: false,
        ..SessionConfig::default()
    }
}

fn spawn_options() -> SpawnOptions {
    SpawnOptions {
        propagate_signals: false,
        ..SpawnOptions::default()
    }
}

#[tokio::test]
async fn test_virtual_package_import() {
    let Some(interp) = interpreter() else {
        eprintln!("skipping test: python not available");
        return;
    };

    let package = Package::new(
        "p",
        "/virtual_modules/p",
        vec![
            Module::from_source("__init__.py", "/virtual_modules/p/__init__.py", "print('init')"),
            Module::from_source("m.py", "/virtual_modules/p/m.py", "K = 42"),
        ],
    );
    let program = PythonProgram::new(
        "pkg-demo",
        "/virtual_modules",
        Module::from_source(
            "__main__",
            "/virtual_modules/main.py",
            "import p\nfrom p.m import K\nprint(K)\n",
        ),
    )
    .with_package(package);

    let mut process = pytether::process::spawn_program(&interp, &program, spawn_options())
        .await
        .unwrap();
    let mut stdout = process.take_stdout().unwrap();

    process.wait().await.unwrap();
    let mut output = String::new();
    stdout.read_to_string(&mut output).await.unwrap();
    assert_eq!(output, "init\n42\n");
}

#[tokio::test]
async fn test_traceback_references_virtual_path() {
    let Some(interp) = interpreter() else {
        eprintln!("skipping test: python not available");
        return;
    };

    let program = PythonProgram::new(
        "failing",
        "/virtual_modules",
        Module::from_source(
            "__main__",
            "/virtual_modules/failing.py",
            "def blow_up():\n    raise ValueError('boom')\nblow_up()\n",
        ),
    );

    let mut process = pytether::process::spawn_program(&interp, &program, spawn_options())
        .await
        .unwrap();
    let mut events = process.take_status_events().unwrap();

    let mut exception = None;
    while let Some(event) = events.recv().await {
        if let pytether::transport::StatusEvent::Exception(e) = event {
            exception = Some(e);
            break;
        }
    }
    let exception = exception.expect("no exception delivered on the status channel");
    assert_eq!(exception.exception, "ValueError");
    assert_eq!(exception.message, "boom");
    assert!(exception.traceback.contains("/virtual_modules/failing.py"));
    assert!(exception.traceback.contains("raise ValueError('boom')"));

    let _ = process.wait().await;
}

#[tokio::test]
async fn test_argv_and_environment_passthrough() {
    let Some(interp) = interpreter() else {
        eprintln!("skipping test: python not available");
        return;
    };

    let program = PythonProgram::new(
        "argv-demo",
        "/virtual_modules",
        Module::from_source(
            "__main__",
            "/virtual_modules/argv.py",
            "import os, sys\nprint(' '.join(sys.argv[1:]))\nprint(os.environ['PYT_E2E'])\n",
        ),
    );
    let options = SpawnOptions {
        args: vec!["alpha".to_string(), "beta".to_string()],
        env: HashMap::from([("PYT_E2E".to_string(), "marker".to_string())]),
        ..spawn_options()
    };

    let mut process = pytether::process::spawn_program(&interp, &program, options)
        .await
        .unwrap();
    let mut stdout = process.take_stdout().unwrap();
    process.wait().await.unwrap();

    let mut output = String::new();
    stdout.read_to_string(&mut output).await.unwrap();
    assert_eq!(output, "alpha beta\nmarker\n");
}

#[tokio::test]
async fn test_repl_sentinel_framing() {
    let Some(interp) = interpreter() else {
        eprintln!("skipping test: python not available");
        return;
    };

    let session = ReplSession::spawn(
        &interp,
        ReplOptions {
            config: test_config(),
            ..ReplOptions::default()
        },
    )
    .await
    .unwrap();

    let output = session
        .execute("for i in range(3): print(i)", true)
        .await
        .unwrap();
    assert_eq!(output, "0\n1\n2");

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_repl_state_persists_between_executes() {
    let Some(interp) = interpreter() else {
        eprintln!("skipping test: python not available");
        return;
    };

    let session = ReplSession::spawn(
        &interp,
        ReplOptions {
            config: test_config(),
            ..ReplOptions::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(session.execute("x = 41", true).await.unwrap(), "");
    assert_eq!(session.execute("print(x + 1)", true).await.unwrap(), "42");

    // Definitions survive too.
    session
        .execute("def double(v):\n    return v * 2", true)
        .await
        .unwrap();
    assert_eq!(
        session.execute("print(double(21))", true).await.unwrap(),
        "42"
    );

    session.close().await.unwrap();
    // Idempotent close.
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_repl_exception_carries_output_and_traceback() {
    let Some(interp) = interpreter() else {
        eprintln!("skipping test: python not available");
        return;
    };

    let session = ReplSession::spawn(
        &interp,
        ReplOptions {
            config: test_config(),
            ..ReplOptions::default()
        },
    )
    .await
    .unwrap();

    let err = session
        .execute("print('before')\n1 / 0", true)
        .await
        .unwrap_err();
    match err {
        Error::Python { exception, output } => {
            assert_eq!(exception.exception, "ZeroDivisionError");
            assert!(output.contains("before"));
        }
        other => panic!("expected a python exception, got {other:?}"),
    }

    // The session is still usable after a code-level exception.
    assert_eq!(session.execute("print('ok')", true).await.unwrap(), "ok");

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_repl_kv_pairs_visible_in_child() {
    let Some(interp) = interpreter() else {
        eprintln!("skipping test: python not available");
        return;
    };

    let session = ReplSession::spawn(
        &interp,
        ReplOptions {
            kv_pairs: HashMap::from([("ANSWER".to_string(), json!(7))]),
            config: test_config(),
            ..ReplOptions::default()
        },
    )
    .await
    .unwrap();

    let output = session
        .execute("import pytether\nprint(pytether.ANSWER)", true)
        .await
        .unwrap();
    assert_eq!(output, "7");

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_repl_timeout_destroys_session() {
    let Some(interp) = interpreter() else {
        eprintln!("skipping test: python not available");
        return;
    };

    let session = ReplSession::spawn(
        &interp,
        ReplOptions {
            config: test_config(),
            ..ReplOptions::default()
        },
    )
    .await
    .unwrap();

    let start = Instant::now();
    let err = session
        .execute_with_timeout("while True: pass", true, Duration::from_secs(2))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert!(start.elapsed() >= Duration::from_secs(2));

    // The session is gone for good.
    let err = session.execute("print('late')", true).await.unwrap_err();
    assert!(matches!(err, Error::Closed));

    // The child did not exit cleanly.
    assert!(session.process().wait().await.is_err());
}

const CHILD_RPC_SOURCE: &str = r#"
import time

from pytether import JSONQueueServer, exposed


class Calculator(JSONQueueServer):
    @exposed
    def add(self, x: float, y: float) -> float:
        """Add two numbers."""
        return x + y

    @exposed
    def greet(self, name: str) -> str:
        """Greet someone by name."""
        return f"Hello, {name}!"

    @exposed
    def long_running(self, seconds: float = 5.0) -> str:
        time.sleep(seconds)
        return "done"

    @exposed
    def calculate_with_tax(self, amount: float, state: str) -> float:
        rate = self.call_host("tax", [state])
        return amount * (1.0 + rate)


Calculator().serve_forever()
"#;

fn rpc_program() -> PythonProgram {
    PythonProgram::new(
        "calculator",
        "/virtual_modules",
        Module::from_source("__main__", "/virtual_modules/calculator.py", CHILD_RPC_SOURCE),
    )
}

struct TaxService;

impl Service for TaxService {
    fn export(self: &Arc<Self>, table: &mut HandlerTable) {
        table.insert(
            "tax",
            typed(|(state,): (String,)| {
                Ok(match state.as_str() {
                    "CA" => 0.0725,
                    _ => 0.0,
                })
            }),
        );
    }
}

#[tokio::test]
async fn test_rpc_discovery_calls_and_timeout() {
    let Some(interp) = interpreter() else {
        eprintln!("skipping test: python not available");
        return;
    };

    let session = JsonRpcSession::spawn_with_service(
        &interp,
        &rpc_program(),
        RpcOptions {
            config: test_config(),
            ..RpcOptions::default()
        },
        Arc::new(TaxService),
    )
    .await
    .unwrap();

    // Discovery: the exposed methods and their parameter metadata.
    let methods = session.get_methods();
    for name in ["add", "greet", "long_running", "calculate_with_tax"] {
        assert!(methods.contains(&name.to_string()), "missing {name}");
    }
    let add = session.get_method_info("add").unwrap();
    assert_eq!(add.parameters.len(), 2);
    assert!(add.parameters.iter().all(|p| p.required));
    let long_running = session.get_method_info("long_running").unwrap();
    assert!(!long_running.parameters[0].required);

    // Plain round-trips.
    let sum: f64 = session
        .on("add")
        .arg("x", 2.0)
        .arg("y", 3.25)
        .call_as()
        .await
        .unwrap();
    assert_eq!(sum, 5.25);
    let greeting: String = session
        .on("greet")
        .arg("name", "Ada")
        .call_as()
        .await
        .unwrap();
    assert_eq!(greeting, "Hello, Ada!");

    // Bidirectional: the child calls back into the parent's tax handler.
    let total: f64 = session
        .on("calculate_with_tax")
        .arg("amount", 100.0)
        .arg("state", "CA")
        .call_as()
        .await
        .unwrap();
    assert!((total - 107.25).abs() < 1e-9);

    // Advisory timeout: one call fails, the session survives.
    let start = Instant::now();
    let err = session
        .on("long_running")
        .arg("seconds", 5.0)
        .with_timeout(Duration::from_secs(1))
        .call()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_millis(1500));

    let quick: f64 = session
        .on("add")
        .arg("x", 1.0)
        .arg("y", 1.0)
        .call_as()
        .await
        .unwrap();
    assert_eq!(quick, 2.0);

    // Builder validation against the discovery cache.
    let err = session.on("add").arg("x", 1.0).call().await.unwrap_err();
    assert!(err.to_string().contains("missing required parameter"));

    // Unknown command surfaces the child's error.
    let err = session
        .call("no_such_method", json!({}), Some(Duration::from_secs(10)))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unknown command"));

    session.close().await.unwrap();
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_rpc_cooperative_shutdown() {
    let Some(interp) = interpreter() else {
        eprintln!("skipping test: python not available");
        return;
    };

    let session = JsonRpcSession::spawn(
        &interp,
        &rpc_program(),
        RpcOptions {
            config: test_config(),
            ..RpcOptions::default()
        },
    )
    .await
    .unwrap();

    let sum: f64 = session
        .on("add")
        .arg("x", 20.0)
        .arg("y", 22.0)
        .call_as()
        .await
        .unwrap();
    assert_eq!(sum, 42.0);

    // shutdown is request-reply, then the child exits on its own.
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_named_semaphore_crosses_process_boundary() {
    let Some(interp) = interpreter() else {
        eprintln!("skipping test: python not available");
        return;
    };

    let name = format!("pyt-e2e-{}", std::process::id());
    let sem = NamedSemaphore::create(&name, 0).unwrap();

    let session = ReplSession::spawn(
        &interp,
        ReplOptions {
            kv_pairs: HashMap::from([("SEM_NAME".to_string(), json!(name.clone()))]),
            config: test_config(),
            ..ReplOptions::default()
        },
    )
    .await
    .unwrap();

    session
        .execute(
            "import pytether\nfrom pytether import NamedSemaphore\nsem = NamedSemaphore(pytether.SEM_NAME)\nsem.release()",
            true,
        )
        .await
        .unwrap();

    assert!(sem.acquire_timeout(Duration::from_secs(5)).unwrap());

    session.close().await.unwrap();
    drop(sem);
    semaphore::unlink(&name).unwrap();
}
