//! Test fixtures
//!
//! A small counter document model and builders for operations and actions.

use serde_json::{json, Value};

use crate::core_model::{derive_operation_id, DocumentModel, ModelError, ModelResult};
use crate::core_store::{Action, Operation, DEFAULT_BRANCH, GLOBAL_SCOPE};

pub const COUNTER_TYPE: &str = "counter";

/// Counter document: `INCREMENT {by}`, `DECREMENT {by}` and `SET {value}`.
///
/// The state also records the order in which actions were applied, so two
/// replicas only compare equal if they agree on the operation order.
#[derive(Debug, Clone, Default)]
pub struct CounterModel {
    max_step: Option<i64>,
}

impl CounterModel {
    /// Rejects remote increments larger than `max_step`
    pub fn strict(max_step: i64) -> Self {
        Self {
            max_step: Some(max_step),
        }
    }

    fn step(action: &Action) -> ModelResult<i64> {
        action
            .input
            .get("by")
            .and_then(Value::as_i64)
            .ok_or_else(|| ModelError::rejected(&action.id, "missing 'by'"))
    }
}

impl DocumentModel for CounterModel {
    fn document_type(&self) -> &str {
        COUNTER_TYPE
    }

    fn initial_state(&self, _scope: &str) -> Value {
        json!({ "count": 0, "applied": [] })
    }

    fn reduce(&self, _scope: &str, state: &Value, action: &Action) -> ModelResult<Value> {
        let count = state.get("count").and_then(Value::as_i64).unwrap_or(0);

        let count = match action.action_type.as_str() {
            "INCREMENT" => count + Self::step(action)?,
            "DECREMENT" => count - Self::step(action)?,
            "SET" => action
                .input
                .get("value")
                .and_then(Value::as_i64)
                .ok_or_else(|| ModelError::rejected(&action.id, "missing 'value'"))?,
            other => return Err(ModelError::rejected(&action.id, format!("unknown action {}", other))),
        };

        let mut applied = state
            .get("applied")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        applied.push(Value::String(action.id.clone()));

        Ok(json!({ "count": count, "applied": applied }))
    }

    fn validate(&self, action: &Action) -> ModelResult<()> {
        match (self.max_step, action.action_type.as_str()) {
            (Some(max), "INCREMENT") | (Some(max), "DECREMENT") => {
                let step = Self::step(action)?;
                if step.abs() > max {
                    return Err(ModelError::rejected(
                        &action.id,
                        format!("step {} exceeds limit {}", step, max),
                    ));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// `INCREMENT {by}` in the global scope
pub fn increment(by: i64) -> Action {
    Action::new("INCREMENT", GLOBAL_SCOPE, json!({ "by": by }))
}

/// Global-scope operation of document "doc" with a deterministic id
pub fn make_operation(index: u64, action_id: &str, timestamp_utc_ms: u64) -> Operation {
    let action = increment(1).with_id(action_id).with_timestamp(timestamp_utc_ms);

    Operation {
        id: derive_operation_id("doc", GLOBAL_SCOPE, DEFAULT_BRANCH, action_id),
        index,
        skip: 0,
        hash: String::new(),
        timestamp_utc_ms,
        action,
        prev_op_id: None,
        resulting_state: None,
        error: None,
    }
}
