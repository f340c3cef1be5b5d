//! # Task Descriptors and Results
//!
//! The unit of work a requester submits to the marketplace. The payload
//! is a tagged variant (`task_type` + `payload` on the wire): container
//! workloads plus a few native compute types used for benchmarking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// CPU/RAM a task asks the executor to reserve.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub cpu_cores: f64,
    pub ram_gb: f64,
}

/// Payload of a `docker_image` task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DockerPayload {
    pub image_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_data_url: Option<String>,
    #[serde(default)]
    pub environment_vars: BTreeMap<String, String>,
    #[serde(default = "default_max_duration")]
    pub max_duration_seconds: u64,
    /// When present, the scheduler compares it to the executor-reported
    /// checksum and records the outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output_checksum: Option<String>,
}

fn default_max_duration() -> u64 {
    3600
}

/// What to run. Tagged as `{"task_type": ..., "payload": {...}}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task_type", content = "payload", rename_all = "snake_case")]
pub enum TaskPayload {
    DockerImage(DockerPayload),
    /// Count primes below `limit`.
    Prime { limit: u64 },
    /// Multiply two `size`×`size` matrices.
    Matrix { size: usize },
    /// Spin for roughly `seconds` — the legacy default workload.
    BusyWait {
        #[serde(default = "default_busy_wait_secs")]
        seconds: u64,
    },
}

fn default_busy_wait_secs() -> u64 {
    1
}

impl TaskPayload {
    /// The wire tag, used in journal details and log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            TaskPayload::DockerImage(_) => "docker_image",
            TaskPayload::Prime { .. } => "prime",
            TaskPayload::Matrix { .. } => "matrix",
            TaskPayload::BusyWait { .. } => "busy_wait",
        }
    }

    /// Checksum the requester expects, if the payload declares one.
    pub fn expected_output_checksum(&self) -> Option<&str> {
        match self {
            TaskPayload::DockerImage(p) => p.expected_output_checksum.as_deref(),
            _ => None,
        }
    }
}

/// A schedulable task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task_id: Uuid,
    pub requester_id: String,
    #[serde(flatten)]
    pub payload: TaskPayload,
    pub resource_requirements: ResourceRequirements,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_price_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_utc: Option<DateTime<Utc>>,
    /// Where the executor POSTs the result, when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_url: Option<String>,
    pub timestamp_utc: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl TaskDescriptor {
    /// Creates a descriptor with a fresh `task_id` and current timestamp.
    pub fn new(
        requester_id: String,
        payload: TaskPayload,
        resource_requirements: ResourceRequirements,
        max_price_usd: Option<f64>,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            requester_id,
            payload,
            resource_requirements,
            max_price_usd,
            deadline_utc: None,
            submission_url: None,
            timestamp_utc: Utc::now(),
            signature: None,
        }
    }
}

/// What an executor reports back after a run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub exit_code: i64,
    pub stdout_stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// SHA-256 of the combined output, hex. Absent when there was no
    /// output to hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_checksum: Option<String>,
}
