//! Health reporting for a reactor and its sync channels

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub timestamp: SystemTime,
    pub components: Vec<ComponentHealth>,
    pub version: String,
    pub uptime_seconds: u64,
}

/// Component health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    pub last_check: SystemTime,
}

impl ComponentHealth {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Healthy, None)
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Unhealthy, Some(message.into()))
    }

    fn with_status(name: impl Into<String>, status: HealthStatus, message: Option<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message,
            last_check: SystemTime::now(),
        }
    }
}

/// Aggregates component health into one report.
///
/// Components are keyed by name; reporting a component again replaces its
/// previous entry.
#[derive(Clone)]
pub struct HealthChecker {
    start_time: SystemTime,
    version: String,
    components: Arc<RwLock<Vec<ComponentHealth>>>,
}

impl HealthChecker {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            start_time: SystemTime::now(),
            version: version.into(),
            components: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Insert or replace a component's health
    pub async fn report(&self, health: ComponentHealth) {
        let mut components = self.components.write().await;

        match components.iter_mut().find(|c| c.name == health.name) {
            Some(existing) => *existing = health,
            None => components.push(health),
        }
    }

    /// Forget a component (e.g. a remote that was removed)
    pub async fn remove(&self, name: &str) {
        self.components.write().await.retain(|c| c.name != name);
    }

    pub async fn check_health(&self) -> HealthCheck {
        let components = self.components.read().await.clone();

        let status = if components.iter().any(|c| c.status == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if components.iter().any(|c| c.status == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        let uptime = self
            .start_time
            .elapsed()
            .unwrap_or(Duration::from_secs(0))
            .as_secs();

        HealthCheck {
            status,
            timestamp: SystemTime::now(),
            components,
            version: self.version.clone(),
            uptime_seconds: uptime,
        }
    }

    /// Ready to accept work: nothing is unhealthy
    pub async fn readiness_check(&self) -> bool {
        self.check_health().await.status != HealthStatus::Unhealthy
    }
}

/// Built-in health checks
pub mod checks {
    use super::ComponentHealth;
    use crate::core_sync::{ChannelHealth, ChannelHealthState};

    /// Map a channel's pull/push health onto a component.
    ///
    /// A channel that stopped polling after `max_failures` is unhealthy; one
    /// that is still retrying is degraded.
    pub fn check_channel(remote_name: &str, health: &ChannelHealth, max_failures: u32) -> ComponentHealth {
        let name = format!("remote:{}", remote_name);

        match health.state {
            ChannelHealthState::Idle | ChannelHealthState::Running => ComponentHealth::healthy(name),
            ChannelHealthState::Error if health.failure_count >= max_failures => ComponentHealth::unhealthy(
                name,
                format!(
                    "stopped after {} consecutive failures: {}",
                    health.failure_count,
                    health.last_error.as_deref().unwrap_or("unknown error")
                ),
            ),
            ChannelHealthState::Error => ComponentHealth::degraded(
                name,
                format!(
                    "{} consecutive failures: {}",
                    health.failure_count,
                    health.last_error.as_deref().unwrap_or("unknown error")
                ),
            ),
        }
    }

    /// Queue health: jobs piling up behind a blocked queue degrade the reactor
    pub fn check_queue(total_jobs: usize, blocked: bool) -> ComponentHealth {
        if blocked && total_jobs > 0 {
            ComponentHealth::degraded("queue", format!("blocked with {} pending jobs", total_jobs))
        } else {
            ComponentHealth::healthy("queue")
        }
    }
}
