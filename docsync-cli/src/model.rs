//! Generic JSON document model served by the CLI
//!
//! Every scope holds a JSON object. `SET {key, value}` writes a field,
//! `UNSET {key}` removes one and `MERGE {value}` shallow-merges an object.

use docsync_core::core_model::{DocumentModel, ModelError, ModelResult};
use docsync_core::core_store::Action;
use serde_json::{Map, Value};

pub const JSON_TYPE: &str = "json";

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonModel;

fn key(action: &Action) -> ModelResult<&str> {
    action
        .input
        .get("key")
        .and_then(Value::as_str)
        .ok_or_else(|| ModelError::rejected(&action.id, "missing 'key'"))
}

impl DocumentModel for JsonModel {
    fn document_type(&self) -> &str {
        JSON_TYPE
    }

    fn initial_state(&self, _scope: &str) -> Value {
        Value::Object(Map::new())
    }

    fn reduce(&self, _scope: &str, state: &Value, action: &Action) -> ModelResult<Value> {
        let mut fields = state.as_object().cloned().unwrap_or_default();

        match action.action_type.as_str() {
            "SET" => {
                let value = action.input.get("value").cloned().unwrap_or(Value::Null);
                fields.insert(key(action)?.to_string(), value);
            }
            "UNSET" => {
                fields.remove(key(action)?);
            }
            "MERGE" => {
                let patch = action
                    .input
                    .get("value")
                    .and_then(Value::as_object)
                    .ok_or_else(|| ModelError::rejected(&action.id, "MERGE requires an object 'value'"))?;
                fields.extend(patch.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            other => return Err(ModelError::rejected(&action.id, format!("unknown action {}", other))),
        }

        Ok(Value::Object(fields))
    }

    fn validate(&self, action: &Action) -> ModelResult<()> {
        match action.action_type.as_str() {
            "SET" | "UNSET" => key(action).map(|_| ()),
            "MERGE" => self.reduce(&action.scope, &Value::Object(Map::new()), action).map(|_| ()),
            other => Err(ModelError::rejected(&action.id, format!("unknown action {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_core::core_store::GLOBAL_SCOPE;
    use serde_json::json;

    fn apply(state: &Value, action_type: &str, input: Value) -> ModelResult<Value> {
        JsonModel.reduce(GLOBAL_SCOPE, state, &Action::new(action_type, GLOBAL_SCOPE, input))
    }

    #[test]
    fn test_set_unset_merge() {
        let state = JsonModel.initial_state(GLOBAL_SCOPE);
        let state = apply(&state, "SET", json!({ "key": "title", "value": "draft" })).unwrap();
        let state = apply(&state, "MERGE", json!({ "value": { "pages": 3, "title": "final" } })).unwrap();
        assert_eq!(state, json!({ "title": "final", "pages": 3 }));

        let state = apply(&state, "UNSET", json!({ "key": "pages" })).unwrap();
        assert_eq!(state, json!({ "title": "final" }));
    }

    #[test]
    fn test_malformed_actions_are_rejected() {
        let state = json!({});
        assert!(apply(&state, "SET", json!({ "value": 1 })).is_err());
        assert!(apply(&state, "MERGE", json!({ "value": [1, 2] })).is_err());
        assert!(apply(&state, "RENAME", json!({})).is_err());

        let action = Action::new("UNSET", GLOBAL_SCOPE, json!({}));
        assert!(matches!(JsonModel.validate(&action), Err(ModelError::Rejected { .. })));
    }
}
