//! Component health for the ingestion query.
//!
//! The query reports on four components: the stream source, the micro-batch
//! buffer, the Delta sink and the checkpoint. The HTTP layer turns a
//! [`HealthReport`] into `/health`, `/healthz` and `/readyz` responses.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;

/// Stream source component.
pub const COMPONENT_KAFKA: &str = "kafka";
/// Micro-batch buffer component.
pub const COMPONENT_BUFFER: &str = "buffer";
/// Delta sink component.
pub const COMPONENT_DELTA: &str = "delta";
/// Checkpoint component.
pub const COMPONENT_CHECKPOINT: &str = "checkpoint";

/// Components registered by [`HealthCheck::for_query`].
pub const QUERY_COMPONENTS: [&str; 4] = [
    COMPONENT_KAFKA,
    COMPONENT_BUFFER,
    COMPONENT_DELTA,
    COMPONENT_CHECKPOINT,
];

/// Health status of a component.
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentStatus {
    /// Component is healthy
    Healthy,
    /// Component is degraded but operational
    Degraded(String),
    /// Component is unhealthy
    Unhealthy(String),
    /// No report yet
    Unknown,
}

impl ComponentStatus {
    /// Lowercase label used in reports.
    pub fn label(&self) -> &'static str {
        match self {
            ComponentStatus::Healthy => "healthy",
            ComponentStatus::Degraded(_) => "degraded",
            ComponentStatus::Unhealthy(_) => "unhealthy",
            ComponentStatus::Unknown => "unknown",
        }
    }

    /// Reason attached to a degraded or unhealthy status.
    pub fn message(&self) -> Option<&str> {
        match self {
            ComponentStatus::Degraded(msg) | ComponentStatus::Unhealthy(msg) => Some(msg),
            _ => None,
        }
    }
}

/// Overall system health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All components healthy
    Healthy,
    /// Some components degraded
    Degraded,
    /// System is unhealthy
    Unhealthy,
}

/// One component in a [`HealthReport`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentReport {
    /// `healthy`, `degraded`, `unhealthy` or `unknown`
    pub status: &'static str,
    /// Reason, when not healthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<&ComponentStatus> for ComponentReport {
    fn from(status: &ComponentStatus) -> Self {
        Self {
            status: status.label(),
            message: status.message().map(str::to_string),
        }
    }
}

/// Point-in-time health of the process, as served on `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Worst component status
    pub status: HealthStatus,
    /// True while the query loop runs
    pub query_running: bool,
    /// Seconds since the health check was created
    pub uptime_seconds: u64,
    /// Last batch id committed, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_batch_id: Option<i64>,
    /// When the last batch was committed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_batch_at: Option<DateTime<Utc>>,
    /// Per-component status
    pub components: BTreeMap<String, ComponentReport>,
}

/// Tracks component health for the HTTP endpoints.
pub struct HealthCheck {
    components: RwLock<BTreeMap<String, ComponentStatus>>,
    started_at: Instant,
    job_running: RwLock<bool>,
    last_batch: RwLock<Option<(i64, DateTime<Utc>)>>,
}

impl HealthCheck {
    /// Create a health check with no components.
    pub fn new() -> Self {
        Self {
            components: RwLock::new(BTreeMap::new()),
            started_at: Instant::now(),
            job_running: RwLock::new(false),
            last_batch: RwLock::new(None),
        }
    }

    /// Create a health check with the query components registered.
    pub fn for_query() -> Self {
        let health = Self::new();
        for name in QUERY_COMPONENTS {
            health.register_component(name);
        }
        health
    }

    /// Register a component to track.
    pub fn register_component(&self, name: &str) {
        self.components
            .write()
            .insert(name.to_string(), ComponentStatus::Unknown);
    }

    /// Mark a component as healthy.
    pub fn mark_healthy(&self, name: &str) {
        self.set(name, ComponentStatus::Healthy);
    }

    /// Mark a component as degraded.
    pub fn mark_degraded(&self, name: &str, reason: &str) {
        self.set(name, ComponentStatus::Degraded(reason.to_string()));
    }

    /// Mark a component as unhealthy.
    pub fn mark_unhealthy(&self, name: &str, reason: &str) {
        self.set(name, ComponentStatus::Unhealthy(reason.to_string()));
    }

    fn set(&self, name: &str, status: ComponentStatus) {
        self.components.write().insert(name.to_string(), status);
    }

    /// Get the status of a specific component.
    pub fn get_component_status(&self, name: &str) -> Option<ComponentStatus> {
        self.components.read().get(name).cloned()
    }

    /// Get all component statuses.
    pub fn get_all_statuses(&self) -> BTreeMap<String, ComponentStatus> {
        self.components.read().clone()
    }

    /// Worst status across components. Unknown counts as healthy.
    pub fn overall_status(&self) -> HealthStatus {
        let components = self.components.read();

        let mut has_degraded = false;
        for status in components.values() {
            match status {
                ComponentStatus::Unhealthy(_) => return HealthStatus::Unhealthy,
                ComponentStatus::Degraded(_) => has_degraded = true,
                _ => {}
            }
        }

        if has_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Check if the system is operational (healthy or degraded).
    pub fn is_operational(&self) -> bool {
        self.overall_status() != HealthStatus::Unhealthy
    }

    /// Liveness: the process has not hit an unrecoverable failure.
    pub fn is_alive(&self) -> bool {
        self.is_operational()
    }

    /// Readiness: the query loop is running and no component is unhealthy.
    pub fn is_ready(&self) -> bool {
        self.is_job_running() && self.is_operational()
    }

    /// Mark the ingestion job as started.
    pub fn job_started(&self) {
        *self.job_running.write() = true;
    }

    /// Mark the ingestion job as completed.
    pub fn job_completed(&self) {
        *self.job_running.write() = false;
    }

    /// Check if the ingestion job is running.
    pub fn is_job_running(&self) -> bool {
        *self.job_running.read()
    }

    /// Record a committed batch.
    pub fn batch_committed(&self, batch_id: i64) {
        *self.last_batch.write() = Some((batch_id, Utc::now()));
    }

    /// Snapshot of the current health.
    pub fn report(&self) -> HealthReport {
        let last_batch = *self.last_batch.read();
        HealthReport {
            status: self.overall_status(),
            query_running: self.is_job_running(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            last_batch_id: last_batch.map(|(id, _)| id),
            last_batch_at: last_batch.map(|(_, at)| at),
            components: self
                .components
                .read()
                .iter()
                .map(|(name, status)| (name.clone(), ComponentReport::from(status)))
                .collect(),
        }
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}
