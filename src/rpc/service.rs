//! Host-side command handlers and service binding.
//!
//! Incoming commands resolve against a [`HandlerTable`]. A [`Service`]
//! exports its methods into the table at session construction; the
//! [`typed`] adapter maps a JSON-array payload onto a typed parameter
//! tuple through serde, so arity and per-element conversion failures
//! surface as descriptive call errors.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::{Error, Result};

/// Future returned by a command handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

/// A command handler: receives the request `data` and the request id.
pub type HandlerFn = Arc<dyn Fn(Value, String) -> HandlerFuture + Send + Sync>;

/// Mapping from command name to handler, plus an optional default.
#[derive(Default)]
pub struct HandlerTable {
    handlers: HashMap<String, HandlerFn>,
    default: Option<HandlerFn>,
}

impl HandlerTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a command name.
    pub fn insert(&mut self, command: &str, handler: HandlerFn) {
        self.handlers.insert(command.to_string(), handler);
    }

    /// Set the handler used for commands without a specific entry.
    pub fn set_default(&mut self, handler: HandlerFn) {
        self.default = Some(handler);
    }

    /// Resolve a command, falling back to the default handler.
    pub fn resolve(&self, command: &str) -> Option<HandlerFn> {
        self.handlers
            .get(command)
            .or(self.default.as_ref())
            .cloned()
    }

    /// Registered command names.
    pub fn commands(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}

/// A parent-side object whose exported methods become command handlers.
pub trait Service: Send + Sync + 'static {
    /// Register this service's handlers into the table.
    fn export(self: &Arc<Self>, table: &mut HandlerTable);
}

/// Wrap a synchronous closure as a [`HandlerFn`].
pub fn sync_handler<F>(f: F) -> HandlerFn
where
    F: Fn(Value, &str) -> Result<Value> + Send + Sync + 'static,
{
    Arc::new(move |data, request_id| {
        let output = f(data, &request_id);
        Box::pin(async move { output })
    })
}

/// Wrap a typed closure as a [`HandlerFn`].
///
/// The incoming `data` must be a JSON array whose length and element types
/// match the `Args` tuple, e.g. `typed(|(state,): (String,)| ...)`.
pub fn typed<Args, R, F>(f: F) -> HandlerFn
where
    Args: DeserializeOwned,
    R: Serialize,
    F: Fn(Args) -> Result<R> + Send + Sync + 'static,
{
    Arc::new(move |data, _request_id| {
        let output = match serde_json::from_value::<Args>(data) {
            Ok(args) => f(args).and_then(|r| serde_json::to_value(r).map_err(Error::from)),
            Err(e) => Err(Error::Call(format!("invalid arguments: {e}"))),
        };
        Box::pin(async move { output })
    })
}
