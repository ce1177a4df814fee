//! Remote configuration and health records

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::SyncConfig;
use crate::core_store::{now_utc_ms, OperationContext};

/// How a remote is reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChannelConfig {
    /// Same process: envelopes are handed to the channel registered as `peer`
    Internal { peer: String },
    /// Active side: polls the transport registered under `url` and pushes to it
    #[serde(rename_all = "camelCase")]
    Polling {
        url: String,
        #[serde(with = "humantime_serde")]
        poll_interval: Duration,
        #[serde(with = "humantime_serde")]
        retry_base_delay: Duration,
        #[serde(with = "humantime_serde")]
        retry_max_delay: Duration,
        max_failures: u32,
    },
    /// Passive side: answers a polling counterpart
    Polled,
}

impl ChannelConfig {
    pub fn internal(peer: impl Into<String>) -> Self {
        ChannelConfig::Internal { peer: peer.into() }
    }

    /// Polling channel with the timing of `config`
    pub fn polling(url: impl Into<String>, config: &SyncConfig) -> Self {
        ChannelConfig::Polling {
            url: url.into(),
            poll_interval: config.poll_interval,
            retry_base_delay: config.retry_base_delay,
            retry_max_delay: config.retry_max_delay,
            max_failures: config.max_failures,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChannelConfig::Internal { .. } => "internal",
            ChannelConfig::Polling { .. } => "polling",
            ChannelConfig::Polled => "polled",
        }
    }
}

/// Allow-lists selecting what a remote receives. Empty lists and an empty
/// branch select everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RemoteFilter {
    pub document_id: Vec<String>,
    pub scope: Vec<String>,
    pub branch: String,
}

impl RemoteFilter {
    pub fn matches(&self, context: &OperationContext) -> bool {
        (self.document_id.is_empty() || self.document_id.contains(&context.document_id))
            && (self.scope.is_empty() || self.scope.contains(&context.scope))
            && (self.branch.is_empty() || self.branch == context.branch)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RemoteOptions {
    /// Backfill only operations newer than this
    pub since_timestamp_utc_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelHealthState {
    #[default]
    Idle,
    Running,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelHealth {
    pub state: ChannelHealthState,
    /// Consecutive failures since the last success
    pub failure_count: u32,
    pub last_success_utc_ms: Option<u64>,
    pub last_failure_utc_ms: Option<u64>,
    pub last_error: Option<String>,
}

impl ChannelHealth {
    pub fn record_success(&mut self) {
        self.state = ChannelHealthState::Running;
        self.failure_count = 0;
        self.last_success_utc_ms = Some(now_utc_ms());
    }

    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.state = ChannelHealthState::Error;
        self.failure_count += 1;
        self.last_failure_utc_ms = Some(now_utc_ms());
        self.last_error = Some(error.into());
    }

    pub fn reset(&mut self) {
        self.state = ChannelHealthState::Idle;
        self.failure_count = 0;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteStatus {
    pub push: ChannelHealth,
    pub pull: ChannelHealth,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    pub id: String,
    pub name: String,
    pub collection_id: String,
    pub channel_config: ChannelConfig,
    pub filter: RemoteFilter,
    pub options: RemoteOptions,
    pub status: RemoteStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(document_id: &str, scope: &str, branch: &str) -> OperationContext {
        OperationContext {
            document_id: document_id.into(),
            document_type: "counter".into(),
            scope: scope.into(),
            branch: branch.into(),
            ordinal: 1,
        }
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(RemoteFilter::default().matches(&context("d", "global", "main")));
    }

    #[test]
    fn test_filter_allow_lists() {
        let filter = RemoteFilter {
            document_id: vec!["d1".into()],
            scope: vec!["global".into()],
            branch: "main".into(),
        };
        assert!(filter.matches(&context("d1", "global", "main")));
        assert!(!filter.matches(&context("d2", "global", "main")));
        assert!(!filter.matches(&context("d1", "local", "main")));
        assert!(!filter.matches(&context("d1", "global", "draft")));
    }

    #[test]
    fn test_channel_config_wire_format() {
        let config = ChannelConfig::polling("local://b", &SyncConfig::default());
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["type"], "polling");
        assert_eq!(value["pollInterval"], "2s");
        assert_eq!(value["maxFailures"], 5);

        let back: ChannelConfig = serde_json::from_value(value).unwrap();
        assert_eq!(back, config);
        assert_eq!(
            serde_json::to_value(ChannelConfig::internal("c1")).unwrap(),
            serde_json::json!({ "type": "internal", "peer": "c1" })
        );
    }

    #[test]
    fn test_health_transitions() {
        let mut health = ChannelHealth::default();
        health.record_failure("down");
        health.record_failure("down");
        assert_eq!(health.state, ChannelHealthState::Error);
        assert_eq!(health.failure_count, 2);

        health.record_success();
        assert_eq!(health.state, ChannelHealthState::Running);
        assert_eq!(health.failure_count, 0);
        assert!(health.last_failure_utc_ms.is_some());
    }
}
