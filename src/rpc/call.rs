//! Fluent call builder for Python-side methods.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use super::JsonRpcSession;
use crate::{Error, Result};

/// A call to a Python method under construction.
///
/// ```ignore
/// let total: f64 = session
///     .on("calculate_with_tax")
///     .arg("amount", 100.0)
///     .arg("state", "CA")
///     .with_timeout(Duration::from_secs(5))
///     .call_as()
///     .await?;
/// ```
pub struct MethodCall<'a> {
    session: &'a JsonRpcSession,
    method: String,
    data: Map<String, Value>,
    timeout: Option<Duration>,
}

impl<'a> MethodCall<'a> {
    pub(crate) fn new(
        session: &'a JsonRpcSession,
        method: &str,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            session,
            method: method.to_string(),
            data: Map::new(),
            timeout,
        }
    }

    /// Add one named argument.
    ///
    /// Panics if the value is not JSON-serializable; that is a programmer
    /// error, not a call failure.
    pub fn arg(mut self, name: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).expect("argument must be JSON-serializable");
        self.data.insert(name.to_string(), value);
        self
    }

    /// Add arguments from an alternating key/value list.
    ///
    /// Panics on an odd-length list or a non-string key; both are
    /// programmer errors.
    pub fn params(mut self, pairs: &[Value]) -> Self {
        assert!(
            pairs.len() % 2 == 0,
            "params requires an even-length key/value list"
        );
        for pair in pairs.chunks(2) {
            let key = pair[0]
                .as_str()
                .expect("params keys must be strings");
            self.data.insert(key.to_string(), pair[1].clone());
        }
        self
    }

    /// Set a deadline for the call; without one the call waits
    /// indefinitely.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Execute the call and return the raw JSON result.
    pub async fn call(self) -> Result<Value> {
        self.validate()?;
        self.session
            .call(&self.method, Value::Object(self.data), self.timeout)
            .await
    }

    /// Execute the call and deserialize the result into `T`.
    pub async fn call_as<T: DeserializeOwned>(self) -> Result<T> {
        let method = self.method.clone();
        let value = self.call().await?;
        serde_json::from_value(value).map_err(|e| {
            Error::Call(format!("cannot convert result of {method:?}: {e}"))
        })
    }

    /// Best-effort validation against the discovery cache: when the method
    /// is known, every required parameter must be present.
    fn validate(&self) -> Result<()> {
        if let Some(info) = self.session.get_method_info(&self.method) {
            for parameter in &info.parameters {
                if parameter.required && !self.data.contains_key(&parameter.name) {
                    return Err(Error::Call(format!(
                        "missing required parameter {:?} for method {:?}",
                        parameter.name, self.method
                    )));
                }
            }
        }
        Ok(())
    }
}
