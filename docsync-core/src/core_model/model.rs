//! Document model seam
//!
//! The engine never interprets action payloads. A [`DocumentModel`] supplies
//! the initial state of each scope and a pure reducer; the registry maps
//! document types to models. The `document` scope is handled here for every
//! type: it records creation and deletion.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use super::errors::{ModelError, ModelResult};
use crate::core_store::{Action, DOCUMENT_SCOPE, GLOBAL_SCOPE, LOCAL_SCOPE};

pub const CREATE_DOCUMENT: &str = "CREATE_DOCUMENT";
pub const DELETE_DOCUMENT: &str = "DELETE_DOCUMENT";

/// Opaque "apply action to state" capability for one document type
pub trait DocumentModel: Send + Sync {
    fn document_type(&self) -> &str;

    /// Scopes this model reduces, besides the built-in `document` scope
    fn scopes(&self) -> Vec<String> {
        vec![GLOBAL_SCOPE.to_string(), LOCAL_SCOPE.to_string()]
    }

    fn initial_state(&self, scope: &str) -> Value;

    /// Pure: same state and action always yield the same result
    fn reduce(&self, scope: &str, state: &Value, action: &Action) -> ModelResult<Value>;

    /// Check an action received from a remote before accepting it
    fn validate(&self, _action: &Action) -> ModelResult<()> {
        Ok(())
    }
}

/// Action creating a document of `document_type` in the `document` scope
pub fn create_document_action(document_type: &str) -> Action {
    Action::new(CREATE_DOCUMENT, DOCUMENT_SCOPE, json!({ "documentType": document_type }))
}

pub fn delete_document_action() -> Action {
    Action::new(DELETE_DOCUMENT, DOCUMENT_SCOPE, json!({}))
}

/// Whether a `document` scope state records a deletion
pub fn is_deleted(document_state: &Value) -> bool {
    document_state.get("deleted").and_then(Value::as_bool).unwrap_or(false)
}

fn reduce_document_scope(state: &Value, action: &Action) -> ModelResult<Value> {
    match action.action_type.as_str() {
        CREATE_DOCUMENT => {
            let document_type = action
                .input
                .get("documentType")
                .and_then(Value::as_str)
                .ok_or_else(|| ModelError::rejected(&action.id, "CREATE_DOCUMENT requires documentType"))?;

            Ok(json!({
                "documentType": document_type,
                "createdAtUtcMs": action.timestamp_utc_ms,
                "deleted": false,
            }))
        }
        DELETE_DOCUMENT => {
            let mut next = state.clone();
            if let Some(fields) = next.as_object_mut() {
                fields.insert("deleted".into(), Value::Bool(true));
                fields.insert("deletedAtUtcMs".into(), json!(action.timestamp_utc_ms));
            }
            Ok(next)
        }
        other => Err(ModelError::rejected(
            &action.id,
            format!("unsupported document scope action {}", other),
        )),
    }
}

/// Document type → model
#[derive(Clone, Default)]
pub struct ModelRegistry {
    models: HashMap<String, Arc<dyn DocumentModel>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, model: Arc<dyn DocumentModel>) {
        self.models.insert(model.document_type().to_string(), model);
    }

    pub fn with_model(mut self, model: Arc<dyn DocumentModel>) -> Self {
        self.register(model);
        self
    }

    pub fn get(&self, document_type: &str) -> ModelResult<Arc<dyn DocumentModel>> {
        self.models
            .get(document_type)
            .cloned()
            .ok_or_else(|| ModelError::UnknownDocumentType(document_type.to_string()))
    }

    pub fn contains(&self, document_type: &str) -> bool {
        self.models.contains_key(document_type)
    }

    pub fn document_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.models.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn initial_state(&self, document_type: &str, scope: &str) -> ModelResult<Value> {
        if scope == DOCUMENT_SCOPE {
            return Ok(json!({}));
        }

        let model = self.get(document_type)?;
        if !model.scopes().iter().any(|s| s == scope) {
            return Err(ModelError::UnknownScope {
                document_type: document_type.to_string(),
                scope: scope.to_string(),
            });
        }
        Ok(model.initial_state(scope))
    }

    pub fn reduce(&self, document_type: &str, scope: &str, state: &Value, action: &Action) -> ModelResult<Value> {
        if scope == DOCUMENT_SCOPE {
            return reduce_document_scope(state, action);
        }
        self.get(document_type)?.reduce(scope, state, action)
    }

    /// Validation for actions arriving from remotes; also rejects unknown types
    pub fn validate(&self, document_type: &str, action: &Action) -> ModelResult<()> {
        let model = self.get(document_type)?;
        if action.scope == DOCUMENT_SCOPE {
            return Ok(());
        }
        model.validate(action)
    }
}
