//! Best-effort metadata about Python-side methods.
//!
//! Populated once at session startup via a `__get_methods__` discovery
//! call. Used for introspection and fluent-builder validation only; never
//! relied on for correctness.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Metadata about one parameter of an exposed Python method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterInfo {
    /// Parameter name.
    pub name: String,
    /// Whether the parameter has no default value.
    pub required: bool,
    /// Annotated type name, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
}

/// Metadata about one exposed Python method.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MethodInfo {
    /// Docstring of the method.
    #[serde(default)]
    pub doc: String,
    /// Declared parameters, in order.
    #[serde(default)]
    pub parameters: Vec<ParameterInfo>,
    /// Return-type hint, e.g. `{"type": "float"}`.
    #[serde(default, rename = "return")]
    pub returns: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_discovery_shape() {
        let raw = serde_json::json!({
            "add": {
                "doc": "Add two numbers.",
                "parameters": [
                    {"name": "x", "required": true, "type": "float"},
                    {"name": "y", "required": true, "type": "float"},
                ],
                "return": {"type": "float"},
            },
            "ping": {"doc": "", "parameters": [], "return": {}},
        });

        let methods: HashMap<String, MethodInfo> = serde_json::from_value(raw).unwrap();
        let add = &methods["add"];
        assert_eq!(add.parameters.len(), 2);
        assert!(add.parameters.iter().all(|p| p.required));
        assert_eq!(add.parameters[0].r#type.as_deref(), Some("float"));
        assert_eq!(add.returns["type"], "float");
        assert!(methods["ping"].parameters.is_empty());
    }
}
