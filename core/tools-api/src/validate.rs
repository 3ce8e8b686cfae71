//! Minimal JSON-schema validation of tool arguments.
//!
//! Checks the subset of JSON Schema the built-in tools actually declare:
//! top-level object shape, `required` properties, and primitive `type`
//! tags on declared properties. Anything the schema does not constrain
//! passes.

use serde_json::Value;

/// Arguments did not match the declared schema.
#[derive(Debug, thiserror::Error, PartialEq)]
#[error("invalid arguments: {message}")]
pub struct ValidationError {
    pub message: String,
}

impl ValidationError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Validate `arguments` against a tool's declared `parameters_schema`.
pub fn validate_tool_arguments(schema: &Value, arguments: &Value) -> Result<(), ValidationError> {
    if schema.get("type").and_then(Value::as_str) == Some("object") {
        let Some(object) = arguments.as_object() else {
            return Err(ValidationError::new(format!(
                "expected an object, got {}",
                type_name(arguments)
            )));
        };

        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for name in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(name) {
                    return Err(ValidationError::new(format!(
                        "missing required property \"{name}\""
                    )));
                }
            }
        }

        if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
            for (name, prop_schema) in properties {
                let Some(value) = object.get(name) else {
                    continue;
                };
                if let Some(expected) = prop_schema.get("type").and_then(Value::as_str) {
                    if !matches_type(value, expected) {
                        return Err(ValidationError::new(format!(
                            "property \"{name}\": expected {expected}, got {}",
                            type_name(value)
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}

fn matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "limit": {"type": "integer"},
            },
            "required": ["path"],
        })
    }

    #[test]
    fn accepts_valid_arguments() {
        assert!(validate_tool_arguments(&schema(), &json!({"path": "foo", "limit": 3})).is_ok());
        assert!(validate_tool_arguments(&schema(), &json!({"path": "foo"})).is_ok());
    }

    #[test]
    fn rejects_missing_required() {
        let err = validate_tool_arguments(&schema(), &json!({"limit": 3})).unwrap_err();
        assert!(err.message.contains("path"));
    }

    #[test]
    fn rejects_wrong_type() {
        let err = validate_tool_arguments(&schema(), &json!({"path": 42})).unwrap_err();
        assert!(err.message.contains("expected string"));
    }

    #[test]
    fn rejects_non_object_arguments() {
        let err = validate_tool_arguments(&schema(), &json!("nope")).unwrap_err();
        assert!(err.message.contains("expected an object"));
    }

    #[test]
    fn unconstrained_schema_passes_anything() {
        assert!(validate_tool_arguments(&json!({}), &json!([1, 2, 3])).is_ok());
    }
}
