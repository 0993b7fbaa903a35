//! Out-of-band status channel.
//!
//! The child reports lifecycle events and structured exceptions on a
//! dedicated pipe, away from the request/response stream. One reader task
//! per session parses the framed objects and publishes them to the
//! session.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use super::framed::MessageReader;

/// A structured Python exception delivered over the status channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PythonException {
    /// Exception class name.
    pub exception: String,
    /// Exception message.
    pub message: String,
    /// Formatted traceback referencing virtual module paths.
    pub traceback: String,
}

impl fmt::Display for PythonException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}\n{}", self.exception, self.message, self.traceback)
    }
}

/// Event published by the status reader task.
#[derive(Debug, Clone)]
pub enum StatusEvent {
    /// A lifecycle status object, e.g. `"ok"` or `"exit"`.
    Status(String),
    /// A structured exception raised in the child.
    Exception(PythonException),
}

/// Spawn the status reader task for a session.
///
/// The task terminates on an `exit` status or when the pipe reaches EOF;
/// dropping the sender closes the returned receiver either way.
pub(crate) fn spawn_status_reader(
    file: std::fs::File,
) -> mpsc::UnboundedReceiver<StatusEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut reader = MessageReader::new(tokio::fs::File::from_std(file));
        loop {
            match reader.next_message().await {
                Ok(Some(message)) => {
                    if !dispatch_status(&message, &tx) {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("status channel read failed: {e}");
                    break;
                }
            }
        }
        tracing::debug!("status reader terminated");
    });
    rx
}

/// Route one status object; returns `false` when the reader should stop.
fn dispatch_status(message: &Value, tx: &mpsc::UnboundedSender<StatusEvent>) -> bool {
    match message.get("type").and_then(Value::as_str) {
        Some("status") => {
            let status = message
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let exiting = status == "exit";
            let _ = tx.send(StatusEvent::Status(status));
            !exiting
        }
        Some("exception") => {
            match serde_json::from_value::<PythonException>(message.clone()) {
                Ok(exception) => {
                    tracing::debug!("python exception: {}", exception.exception);
                    let _ = tx.send(StatusEvent::Exception(exception));
                }
                Err(e) => tracing::warn!("undecodable exception object: {e}"),
            }
            true
        }
        other => {
            tracing::warn!("unknown status object type: {other:?}");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exception_display() {
        let exception = PythonException {
            exception: "ValueError".to_string(),
            message: "bad value".to_string(),
            traceback: "Traceback ...".to_string(),
        };
        let text = exception.to_string();
        assert!(text.starts_with("ValueError: bad value"));
        assert!(text.contains("Traceback"));
    }

    #[test]
    fn test_dispatch_routes_by_type() {
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert!(dispatch_status(&json!({"type": "status", "status": "ok"}), &tx));
        assert!(dispatch_status(
            &json!({
                "type": "exception",
                "exception": "KeyError",
                "message": "'x'",
                "traceback": "tb",
            }),
            &tx
        ));
        // exit stops the reader
        assert!(!dispatch_status(
            &json!({"type": "status", "status": "exit"}),
            &tx
        ));

        assert!(matches!(rx.try_recv().unwrap(), StatusEvent::Status(s) if s == "ok"));
        assert!(
            matches!(rx.try_recv().unwrap(), StatusEvent::Exception(e) if e.exception == "KeyError")
        );
        assert!(matches!(rx.try_recv().unwrap(), StatusEvent::Status(s) if s == "exit"));
    }
}
