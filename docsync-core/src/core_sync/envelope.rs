//! Sync envelopes: the wire unit exchanged between channels

use serde::{Deserialize, Serialize};

use super::sync_operation::SyncOperation;
use crate::core_store::{OperationWithContext, SyncCursor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeType {
    Operations,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMeta {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEnvelope {
    #[serde(rename = "type")]
    pub envelope_type: EnvelopeType,
    pub channel_meta: ChannelMeta,
    pub operations: Vec<OperationWithContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<SyncCursor>,
    /// Identifies the batch; rejections refer to it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Keys of batches that must be applied first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl SyncEnvelope {
    pub fn operations(channel_id: impl Into<String>, operations: Vec<OperationWithContext>) -> Self {
        Self {
            envelope_type: EnvelopeType::Operations,
            channel_meta: ChannelMeta { id: channel_id.into() },
            operations,
            cursor: None,
            key: None,
            depends_on: Vec::new(),
        }
    }

    /// Envelope carrying one outgoing sync operation, keyed by its job (or
    /// by its own id when no job produced it)
    pub fn from_sync_operation(channel_id: impl Into<String>, sync_op: &SyncOperation) -> Self {
        let mut envelope = Self::operations(channel_id, sync_op.operations.clone());
        envelope.key = Some(if sync_op.job_id.is_empty() {
            sync_op.id.clone()
        } else {
            sync_op.job_id.clone()
        });
        envelope.depends_on = sync_op.job_dependencies.clone();
        envelope
    }

    pub fn first_timestamp(&self) -> u64 {
        self.operations
            .first()
            .map(|item| item.operation.timestamp_utc_ms)
            .unwrap_or(0)
    }
}

/// Order envelopes by the timestamp of their first operation; stable for ties
pub fn sort_envelopes(envelopes: &mut [SyncEnvelope]) {
    envelopes.sort_by_key(SyncEnvelope::first_timestamp);
}

impl SyncOperation {
    /// Split a received envelope into one sync operation per document branch,
    /// in order of first appearance
    pub fn from_envelope(envelope: SyncEnvelope, remote_name: &str) -> Vec<SyncOperation> {
        let mut groups: Vec<((String, String), Vec<OperationWithContext>)> = Vec::new();
        for item in envelope.operations {
            let key = (item.context.document_id.clone(), item.context.branch.clone());
            match groups.iter_mut().find(|(existing, _)| *existing == key) {
                Some((_, items)) => items.push(item),
                None => groups.push((key, vec![item])),
            }
        }

        let job_id = envelope.key.unwrap_or_default();
        groups
            .into_iter()
            .map(|((document_id, branch), items)| {
                SyncOperation::new(remote_name, document_id, branch, items)
                    .with_job(job_id.clone(), envelope.depends_on.clone())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_store::OperationContext;
    use crate::test_utils::fixtures::make_operation;

    fn item(document_id: &str, branch: &str, timestamp: u64) -> OperationWithContext {
        OperationWithContext {
            operation: make_operation(0, &format!("{}-{}", document_id, timestamp), timestamp),
            context: OperationContext {
                document_id: document_id.into(),
                document_type: "counter".into(),
                scope: "global".into(),
                branch: branch.into(),
                ordinal: timestamp,
            },
        }
    }

    #[test]
    fn test_wire_format() {
        let envelope = SyncEnvelope::operations("chan", vec![item("d", "main", 1)]);
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["type"], "operations");
        assert_eq!(value["channelMeta"]["id"], "chan");
        assert_eq!(value["operations"][0]["context"]["documentId"], "d");
        assert!(value.get("key").is_none());
        assert!(value.get("dependsOn").is_none());

        let back: SyncEnvelope = serde_json::from_value(value).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn test_from_envelope_groups_by_document_branch() {
        let mut envelope = SyncEnvelope::operations(
            "chan",
            vec![
                item("d1", "main", 1),
                item("d2", "main", 2),
                item("d1", "main", 3),
                item("d1", "draft", 4),
            ],
        );
        envelope.key = Some("job".into());

        let ops = SyncOperation::from_envelope(envelope, "remote");
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0].document_id, "d1");
        assert_eq!(ops[0].operations.len(), 2);
        assert_eq!(ops[1].document_id, "d2");
        assert_eq!(ops[2].branch, "draft");
        assert!(ops.iter().all(|op| op.job_id == "job" && op.remote_name == "remote"));
    }

    #[test]
    fn test_sort_by_first_timestamp() {
        let mut envelopes = vec![
            SyncEnvelope::operations("c", vec![item("d", "main", 5)]),
            SyncEnvelope::operations("c", vec![item("d", "main", 2), item("d", "main", 9)]),
            SyncEnvelope::operations("c", vec![]),
        ];
        sort_envelopes(&mut envelopes);
        let firsts: Vec<u64> = envelopes.iter().map(SyncEnvelope::first_timestamp).collect();
        assert_eq!(firsts, vec![0, 2, 5]);
    }

    #[test]
    fn test_from_sync_operation_carries_job_keys() {
        let op = SyncOperation::new("remote", "d", "main", vec![item("d", "main", 1)])
            .with_job("job-2", vec!["job-1".into()]);
        let envelope = SyncEnvelope::from_sync_operation("chan", &op);
        assert_eq!(envelope.key.as_deref(), Some("job-2"));
        assert_eq!(envelope.depends_on, vec!["job-1".to_string()]);

        let unkeyed = SyncOperation::new("remote", "d", "main", vec![item("d", "main", 1)]);
        let envelope = SyncEnvelope::from_sync_operation("chan", &unkeyed);
        assert_eq!(envelope.key, Some(unkeyed.id.clone()));
    }
}
