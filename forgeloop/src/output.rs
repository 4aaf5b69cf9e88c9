//! Output mode and the JSON envelope.
//!
//! JSON mode prints exactly one object to stdout: `{"success": true, ...}`
//! on success or `{"success": false, "error": "..."}` on failure.

use clap::ValueEnum;
use serde::Serialize;
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl OutputFormat {
    pub fn is_json(self) -> bool {
        self == OutputFormat::Json
    }
}

/// Success envelope: `payload`'s fields flattened next to `"success": true`.
pub fn success_envelope<T: Serialize>(payload: &T) -> Value {
    let mut object = match serde_json::to_value(payload) {
        Ok(Value::Object(object)) => object,
        Ok(other) => {
            let mut object = Map::new();
            object.insert("result".to_string(), other);
            object
        }
        Err(err) => return error_envelope(&format!("serialize output: {err}"), None),
    };
    object.insert("success".to_string(), Value::Bool(true));
    Value::Object(object)
}

/// Failure envelope. `kind` is a stable machine-readable error code.
pub fn error_envelope(message: &str, kind: Option<&str>) -> Value {
    let mut value = json!({ "success": false, "error": message });
    if let Some(kind) = kind {
        value["error_kind"] = Value::String(kind.to_string());
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Payload {
        workspace: String,
    }

    #[test]
    fn success_flattens_payload() {
        let value = success_envelope(&Payload {
            workspace: "ws".to_string(),
        });
        assert_eq!(value, json!({"success": true, "workspace": "ws"}));
    }

    #[test]
    fn error_carries_message_and_kind() {
        let value = error_envelope("boom", Some("invalid_state"));
        assert_eq!(
            value,
            json!({"success": false, "error": "boom", "error_kind": "invalid_state"})
        );
        assert_eq!(error_envelope("x", None).get("error_kind"), None);
    }
}
