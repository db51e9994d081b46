//! MCP-style tool registry: investigation workers resolve and invoke
//! tools by name through one trait, with input validation applied
//! uniformly regardless of which concrete tool server answers the call.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::model::ToolSpec;
use crate::types::SchedulerError;

/// A registry of invocable tools, backed by an MCP-style RPC server in
/// a full deployment. Investigation workers never talk to a tool server
/// directly — every call goes through `invoke`, so argument validation
/// and circuit-breaking stay in one place.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    fn list(&self) -> Vec<ToolSpec>;

    async fn invoke(&self, name: &str, arguments: Value) -> Result<String, SchedulerError>;
}

/// Reject anything that isn't a JSON object, or a primitive/array of
/// primitives — nested objects/arrays-of-objects are rejected so a tool
/// implementation never has to defend against arbitrarily deep input.
pub fn validate_arguments(arguments: &Value) -> Result<(), String> {
    match arguments {
        Value::Object(map) => {
            for (key, value) in map {
                if !is_primitive_or_primitive_array(value) {
                    return Err(format!("argument '{key}' must be a primitive or array of primitives"));
                }
            }
            Ok(())
        }
        _ => Err("tool arguments must be a JSON object".to_string()),
    }
}

fn is_primitive_or_primitive_array(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => true,
        Value::Array(items) => items.iter().all(is_primitive),
        Value::Object(_) => false,
    }
}

fn is_primitive(value: &Value) -> bool {
    matches!(value, Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_))
}

/// An in-memory registry of statically registered tools, used as the
/// investigation pool's default `FINISH` tool plus any tools supplied
/// by an embedding application.
pub struct StaticToolRegistry {
    tools: HashMap<String, ToolSpec>,
}

impl StaticToolRegistry {
    pub fn new(tools: Vec<ToolSpec>) -> Self {
        Self {
            tools: tools.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }
    }
}

#[async_trait]
impl ToolRegistry for StaticToolRegistry {
    fn list(&self) -> Vec<ToolSpec> {
        self.tools.values().cloned().collect()
    }

    async fn invoke(&self, name: &str, arguments: Value) -> Result<String, SchedulerError> {
        if !self.tools.contains_key(name) {
            return Err(SchedulerError::ToolNotFound(name.to_string()));
        }
        validate_arguments(&arguments).map_err(SchedulerError::ToolNotFound)?;
        Ok(format!("tool '{name}' has no registered backend in this deployment"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_object_with_primitive_fields() {
        let args = json!({"pod": "payments-7f4", "lines": 100, "follow": false});
        assert!(validate_arguments(&args).is_ok());
    }

    #[test]
    fn accepts_array_of_primitives() {
        let args = json!({"pods": ["a", "b", "c"]});
        assert!(validate_arguments(&args).is_ok());
    }

    #[test]
    fn rejects_non_object_top_level() {
        let args = json!(["a", "b"]);
        assert!(validate_arguments(&args).is_err());
    }

    #[test]
    fn rejects_nested_object_field() {
        let args = json!({"filter": {"nested": true}});
        assert!(validate_arguments(&args).is_err());
    }

    #[test]
    fn rejects_array_of_objects() {
        let args = json!({"items": [{"a": 1}]});
        assert!(validate_arguments(&args).is_err());
    }

    #[tokio::test]
    async fn invoking_unknown_tool_fails() {
        let registry = StaticToolRegistry::new(vec![]);
        let err = registry.invoke("get_logs", json!({})).await.unwrap_err();
        assert!(matches!(err, SchedulerError::ToolNotFound(_)));
    }
}
