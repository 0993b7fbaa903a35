//! JSON-RPC dispatcher over the session data pipes.
//!
//! One background task reads `DATA_IN` and routes each message: responses
//! (ids without the child prefix) resolve pending slots; commands from the
//! child dispatch to registered handlers, each in its own task so a slow
//! handler never stalls the read loop.

mod call;
pub mod methods;
pub mod service;

pub use call::MethodCall;
pub use methods::{MethodInfo, ParameterInfo};
pub use service::{sync_handler, typed, HandlerFn, HandlerTable, Service};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

use crate::config::SessionConfig;
use crate::interpreter::Interpreter;
use crate::process::{spawn_program, PythonProcess, SpawnOptions};
use crate::program::PythonProgram;
use crate::transport::framed::{MessageReader, MessageWriter};
use crate::transport::status::StatusEvent;
use crate::{Error, Result};

/// Prefix distinguishing child-initiated request ids.
pub const CHILD_ID_PREFIX: &str = "py-";

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_DRAIN: Duration = Duration::from_millis(50);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Raw response object keyed by `request_id`.
pub type ResponseMap = serde_json::Map<String, Value>;

/// Options for constructing a JSON-RPC session.
#[derive(Default)]
pub struct RpcOptions {
    /// Extra environment variables for the child.
    pub env: HashMap<String, String>,
    /// User arguments for the child program.
    pub args: Vec<String>,
    /// Session configuration.
    pub config: SessionConfig,
}

struct DispatchState {
    handlers: HandlerTable,
    pending: HashMap<String, oneshot::Sender<ResponseMap>>,
}

struct SessionShared {
    state: StdMutex<DispatchState>,
    methods: StdRwLock<HashMap<String, MethodInfo>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    reading: AtomicBool,
}

impl SessionShared {
    fn new(handlers: HandlerTable) -> Self {
        Self {
            state: StdMutex::new(DispatchState {
                handlers,
                pending: HashMap::new(),
            }),
            methods: StdRwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            reading: AtomicBool::new(false),
        }
    }
}

/// A child interpreter driven through the JSON-RPC queue.
pub struct JsonRpcSession {
    process: Option<PythonProcess>,
    writer: Arc<MessageWriter<BoxedWriter>>,
    shared: Arc<SessionShared>,
    config: SessionConfig,
}

impl JsonRpcSession {
    /// Spawn a child running `program` with no host-side service.
    pub async fn spawn(
        interpreter: &Interpreter,
        program: &PythonProgram,
        options: RpcOptions,
    ) -> Result<Self> {
        Self::spawn_inner(interpreter, program, options, HandlerTable::new()).await
    }

    /// Spawn a child running `program`, exposing `service` to it.
    pub async fn spawn_with_service<S: Service>(
        interpreter: &Interpreter,
        program: &PythonProgram,
        options: RpcOptions,
        service: Arc<S>,
    ) -> Result<Self> {
        let mut table = HandlerTable::new();
        service.export(&mut table);
        Self::spawn_inner(interpreter, program, options, table).await
    }

    async fn spawn_inner(
        interpreter: &Interpreter,
        program: &PythonProgram,
        options: RpcOptions,
        handlers: HandlerTable,
    ) -> Result<Self> {
        let RpcOptions { env, args, config } = options;
        let spawn_options = SpawnOptions {
            env,
            args,
            ..config.spawn_options()
        };
        let mut process = spawn_program(interpreter, program, spawn_options).await?;
        process.forward_output();

        let data_in = process
            .take_data_in()
            .ok_or_else(|| Error::Spawn("data pipe missing".to_string()))?;
        let data_out = process
            .take_data_out()
            .ok_or_else(|| Error::Spawn("data pipe missing".to_string()))?;
        if let Some(mut events) = process.take_status_events() {
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    match event {
                        StatusEvent::Exception(e) => tracing::warn!("python exception: {e}"),
                        StatusEvent::Status(s) => tracing::debug!("child status: {s}"),
                    }
                }
            });
        }

        let writer: Arc<MessageWriter<BoxedWriter>> = Arc::new(MessageWriter::new(Box::new(
            tokio::fs::File::from_std(data_out),
        )));
        let reader: MessageReader<BoxedReader> =
            MessageReader::new(Box::new(tokio::fs::File::from_std(data_in)));

        let shared = Arc::new(SessionShared::new(handlers));
        start_reader(Arc::clone(&shared), Arc::clone(&writer), reader);

        let session = Self {
            process: Some(process),
            writer,
            shared,
            config,
        };

        if let Err(e) = session.discover_methods().await {
            tracing::warn!("failed to discover python methods: {e}");
        }

        Ok(session)
    }

    /// Register a handler for a command from the child.
    pub fn register_handler(&self, command: &str, handler: HandlerFn) {
        self.shared
            .state
            .lock()
            .unwrap()
            .handlers
            .insert(command, handler);
    }

    /// Set the handler for commands without a specific entry.
    pub fn set_default_handler(&self, handler: HandlerFn) {
        self.shared
            .state
            .lock()
            .unwrap()
            .handlers
            .set_default(handler);
    }

    /// The supervised child process, when this session owns one.
    pub fn process(&self) -> Option<&PythonProcess> {
        self.process.as_ref()
    }

    /// Send a command to the child.
    ///
    /// With `wait`, blocks until the response arrives or `timeout` expires
    /// (`None` waits indefinitely); on expiry the pending slot is removed
    /// and any late response is dropped. Without `wait`, returns `None`
    /// immediately after the frame is written.
    pub async fn send_command(
        &self,
        command: &str,
        data: Value,
        timeout: Option<Duration>,
        wait: bool,
    ) -> Result<Option<ResponseMap>> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let request_id = self.next_request_id();
        let receiver = if wait {
            let (tx, rx) = oneshot::channel();
            self.shared
                .state
                .lock()
                .unwrap()
                .pending
                .insert(request_id.clone(), tx);
            Some(rx)
        } else {
            None
        };

        let request = serde_json::json!({
            "command": command,
            "data": data,
            "request_id": request_id,
        });
        if let Err(e) = self.writer.write_message(&request).await {
            if wait {
                self.shared.state.lock().unwrap().pending.remove(&request_id);
            }
            return Err(e);
        }

        let Some(receiver) = receiver else {
            return Ok(None);
        };
        match timeout {
            None => receiver.await.map(Some).map_err(|_| Error::Closed),
            Some(limit) => match tokio::time::timeout(limit, receiver).await {
                Ok(Ok(response)) => Ok(Some(response)),
                Ok(Err(_)) => Err(Error::Closed),
                Err(_) => {
                    self.shared.state.lock().unwrap().pending.remove(&request_id);
                    Err(Error::Timeout(command.to_string()))
                }
            },
        }
    }

    /// Call a Python method by name and extract its result.
    pub async fn call(
        &self,
        method: &str,
        data: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let response = self
            .send_command(method, data, timeout, true)
            .await?
            .ok_or_else(|| Error::Protocol("missing response".to_string()))?;
        extract_result(response)
    }

    /// Begin a fluent call to a Python method.
    pub fn on(&self, method: &str) -> MethodCall<'_> {
        MethodCall::new(self, method, self.config.default_call_timeout())
    }

    /// Names of the methods the child exposed at discovery time.
    pub fn get_methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.methods.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Cached metadata for one exposed method.
    pub fn get_method_info(&self, method: &str) -> Option<MethodInfo> {
        self.shared.methods.read().unwrap().get(method).cloned()
    }

    async fn discover_methods(&self) -> Result<()> {
        let response = self
            .send_command("__get_methods__", Value::Null, Some(DISCOVERY_TIMEOUT), true)
            .await?
            .ok_or_else(|| Error::Protocol("missing response".to_string()))?;
        let result = extract_result(response)?;
        let methods = result
            .get("methods")
            .cloned()
            .ok_or_else(|| Error::Protocol("discovery response without methods".to_string()))?;
        let parsed: HashMap<String, MethodInfo> = serde_json::from_value(methods)?;
        tracing::debug!("discovered {} python methods", parsed.len());
        *self.shared.methods.write().unwrap() = parsed;
        Ok(())
    }

    /// Fire-and-forget `exit`, drain briefly, then force-terminate.
    ///
    /// Idempotent: the first call returns the true disposal outcome,
    /// subsequent calls return success.
    pub async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let request = serde_json::json!({
            "command": "exit",
            "data": Value::Null,
            "request_id": self.next_request_id(),
        });
        if let Err(e) = self.writer.write_message(&request).await {
            tracing::debug!("exit command not delivered: {e}");
        }
        tokio::time::sleep(CLOSE_DRAIN).await;
        match &self.process {
            Some(process) => {
                process
                    .terminate_with_grace(self.config.termination_grace())
                    .await
            }
            None => Ok(()),
        }
    }

    /// Cooperative shutdown: request-reply `shutdown`, then wait for the
    /// child to exit on its own.
    pub async fn shutdown(&self) -> Result<()> {
        let response = self.send_command("shutdown", Value::Null, None, true).await?;
        tracing::debug!("shutdown response: {response:?}");
        self.shared.closed.store(true, Ordering::SeqCst);
        match &self.process {
            Some(process) => process.wait().await,
            None => Ok(()),
        }
    }

    fn next_request_id(&self) -> String {
        format!("req-{}", self.shared.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

/// Extract `result` from a response object, surfacing `error` as a call
/// failure.
fn extract_result(mut response: ResponseMap) -> Result<Value> {
    if let Some(error) = response.get("error").and_then(Value::as_str) {
        return Err(Error::Call(format!("python error: {error}")));
    }
    Ok(response.remove("result").unwrap_or(Value::Null))
}

/// Start the single message-reader task for a session.
///
/// Exactly one reader per channel: a second start request is refused.
fn start_reader(
    shared: Arc<SessionShared>,
    writer: Arc<MessageWriter<BoxedWriter>>,
    mut reader: MessageReader<BoxedReader>,
) {
    if shared.reading.swap(true, Ordering::SeqCst) {
        tracing::warn!("message reader already running; refusing to start another");
        return;
    }
    tokio::spawn(async move {
        loop {
            match reader.next_message().await {
                Ok(Some(message)) => route_message(&shared, &writer, message),
                Ok(None) => {
                    tracing::debug!("data pipe reached EOF");
                    break;
                }
                Err(e) => {
                    tracing::warn!("data pipe read failed: {e}");
                    break;
                }
            }
        }
        // A terminal condition on the data pipe closes the session;
        // dropping the pending senders wakes every waiter with Closed.
        shared.closed.store(true, Ordering::SeqCst);
        shared.state.lock().unwrap().pending.clear();
        shared.reading.store(false, Ordering::SeqCst);
    });
}

fn route_message(
    shared: &Arc<SessionShared>,
    writer: &Arc<MessageWriter<BoxedWriter>>,
    message: Value,
) {
    let object = match message {
        Value::Object(object) => object,
        other => {
            tracing::warn!("ignoring non-object message: {other}");
            return;
        }
    };

    let request_id: Option<String> = object
        .get("request_id")
        .and_then(Value::as_str)
        .map(str::to_string);

    // Responses to parent-initiated calls carry our own id scheme.
    if let Some(id) = request_id.as_deref() {
        if !id.starts_with(CHILD_ID_PREFIX) {
            let sender = shared.state.lock().unwrap().pending.remove(id);
            match sender {
                Some(tx) => {
                    let _ = tx.send(object);
                }
                None => tracing::debug!("dropping late response for {id}"),
            }
            return;
        }
    }

    let Some(request_id) = request_id else {
        tracing::warn!("command without request id: {:?}", object.get("command"));
        return;
    };
    let Some(command) = object.get("command").and_then(Value::as_str).map(str::to_string) else {
        tracing::warn!("message without command: {request_id}");
        return;
    };
    let data = object.get("data").cloned().unwrap_or(Value::Null);
    let handler = shared.state.lock().unwrap().handlers.resolve(&command);

    // Each command runs in its own task so long-running handlers do not
    // stall the read loop.
    let writer = Arc::clone(writer);
    tokio::spawn(async move {
        let result = match handler {
            Some(handler) => handler(data, request_id.clone()).await,
            None => Err(Error::Call(format!("unknown command: {command}"))),
        };
        let mut response = ResponseMap::new();
        response.insert("request_id".to_string(), Value::String(request_id));
        match result {
            Ok(value) => response.insert("result".to_string(), value),
            Err(e) => response.insert("error".to_string(), Value::String(e.to_string())),
        };
        if let Err(e) = writer.write_message(&Value::Object(response)).await {
            tracing::warn!("failed to send response: {e}");
        }
    });
}
