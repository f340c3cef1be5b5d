//! # Task Executor
//!
//! Runs accepted tasks on this node. The HTTP handler acknowledges
//! immediately and detaches the worker; everything here happens in the
//! background.
//!
//! Lifecycle: `Accepted → Admitted → Running → (Completed | Failed |
//! Timeout) → Released`. Every exit path releases the allocation and
//! removes staged input; admission failures exit before anything is
//! allocated.
//!
//! Container workloads shell out to the `docker` CLI (the runtime itself
//! is an external collaborator); native payloads compute in-process on
//! the blocking pool.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::{info, warn};

use edgemesh_common::{DockerPayload, TaskDescriptor, TaskPayload, TaskResult};

use crate::state::{Node, UNIT_REWARD_USD};
use crate::transport::DISPATCH_TIMEOUT;

/// Largest matrix the native workload will multiply.
const MATRIX_SIZE_CAP: usize = 512;

/// Outcome of the inner run, before accounting.
struct RunOutput {
    exit_code: i64,
    logs: String,
    error: Option<String>,
}

/// Entry point for a detached task run. The caller has already logged
/// `TASK_ACCEPTED_BY_NODE_X` and responded to the dispatcher.
pub async fn run_task(node: Arc<Node>, task: TaskDescriptor) {
    let task_id = task.task_id;
    let reqs = task.resource_requirements;

    // Admission against the live snapshot.
    let stats = node.monitor.latest();
    if (stats.cpu_cores_logical as f64) < reqs.cpu_cores
        || stats.memory_available_gb < reqs.ram_gb
    {
        warn!("task {} rejected: insufficient resources", task_id);
        node.journal.append(
            "TASK_FAILED_ON_NODE_X",
            &task_id.to_string(),
            &node.endpoint(),
            json!({"reason": "insufficient resources"}),
        );
        return;
    }

    node.allocations.allocate(task_id, reqs);
    node.journal.append(
        "RESOURCE_ALLOCATED",
        &task_id.to_string(),
        &node.endpoint(),
        json!({"allocated": {"cpu_cores": reqs.cpu_cores, "ram_gb": reqs.ram_gb}}),
    );
    node.journal.append(
        "TASK_STARTED_ON_NODE_X",
        &task_id.to_string(),
        &node.endpoint(),
        json!({"task_type": task.payload.kind()}),
    );

    let output = execute_payload(&node, &task).await;

    let checksum = if output.logs.is_empty() {
        None
    } else {
        Some(hex::encode(Sha256::digest(output.logs.as_bytes())))
    };
    let result = TaskResult {
        task_id,
        exit_code: output.exit_code,
        stdout_stderr: output.logs,
        error: output.error,
        output_checksum: checksum.clone(),
    };

    if let Some(url) = &task.submission_url {
        if let Err(e) = node
            .transport
            .post_json_ack(url, &result, DISPATCH_TIMEOUT)
            .await
        {
            warn!("result submission for {} failed: {}", task_id, e);
        }
    }

    if result.exit_code == 0 {
        info!("task {} completed", task_id);
        node.journal.append(
            "TASK_COMPLETED_ON_NODE_X",
            &task_id.to_string(),
            &node.endpoint(),
            json!({"exit_code": result.exit_code, "output_checksum": checksum}),
        );
        node.credit_earnings(&task_id, UNIT_REWARD_USD);
    } else {
        warn!("task {} failed: exit {}", task_id, result.exit_code);
        node.journal.append(
            "TASK_FAILED_ON_NODE_X",
            &task_id.to_string(),
            &node.endpoint(),
            json!({"exit_code": result.exit_code, "error": result.error}),
        );
    }

    // Released — unconditional once allocated.
    let released = node.allocations.release(&task_id);
    node.journal.append(
        "RESOURCE_DEALLOCATED",
        &task_id.to_string(),
        &node.endpoint(),
        json!({"deallocated": released.map(|r| json!({
            "cpu_cores": r.cpu_cores,
            "ram_gb": r.ram_gb,
        }))}),
    );
}

async fn execute_payload(node: &Arc<Node>, task: &TaskDescriptor) -> RunOutput {
    match &task.payload {
        TaskPayload::DockerImage(payload) => run_container(node, task, payload).await,
        TaskPayload::Prime { limit } => {
            let limit = *limit;
            let count = tokio::task::spawn_blocking(move || count_primes(limit)).await;
            match count {
                Ok(count) => RunOutput {
                    exit_code: 0,
                    logs: format!("primes_below_{}={}\n", limit, count),
                    error: None,
                },
                Err(e) => RunOutput {
                    exit_code: -1,
                    logs: String::new(),
                    error: Some(format!("prime worker panicked: {}", e)),
                },
            }
        }
        TaskPayload::Matrix { size } => {
            let size = (*size).min(MATRIX_SIZE_CAP);
            let trace = tokio::task::spawn_blocking(move || matrix_trace(size)).await;
            match trace {
                Ok(trace) => RunOutput {
                    exit_code: 0,
                    logs: format!("matrix_{}_trace={}\n", size, trace),
                    error: None,
                },
                Err(e) => RunOutput {
                    exit_code: -1,
                    logs: String::new(),
                    error: Some(format!("matrix worker panicked: {}", e)),
                },
            }
        }
        TaskPayload::BusyWait { seconds } => {
            tokio::time::sleep(Duration::from_secs(*seconds)).await;
            RunOutput {
                exit_code: 0,
                logs: format!("busy_wait_complete seconds={}\n", seconds),
                error: None,
            }
        }
    }
}

/// Pulls the image, stages optional input read-only, and runs the
/// container with the task's CPU/RAM limits, bounded by its duration.
async fn run_container(
    node: &Arc<Node>,
    task: &TaskDescriptor,
    payload: &DockerPayload,
) -> RunOutput {
    let reqs = task.resource_requirements;
    let container_name = format!("emesh-{}", task.task_id);

    let pull = Command::new("docker")
        .args(["pull", &payload.image_name])
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await;
    match pull {
        Ok(output) if output.status.success() => {}
        Ok(output) => {
            return RunOutput {
                exit_code: -1,
                logs: String::new(),
                error: Some(format!(
                    "image pull failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )),
            };
        }
        Err(e) => {
            return RunOutput {
                exit_code: -1,
                logs: String::new(),
                error: Some(format!("docker unavailable: {}", e)),
            };
        }
    }

    // Staged input lives in a tempdir removed on drop, every exit path.
    let staged: Option<(tempfile::TempDir, PathBuf)> = match &payload.input_data_url {
        Some(url) => match stage_input(node, url).await {
            Ok(staged) => Some(staged),
            Err(e) => {
                return RunOutput {
                    exit_code: -1,
                    logs: String::new(),
                    error: Some(format!("input staging failed: {}", e)),
                };
            }
        },
        None => None,
    };

    let mut cmd = Command::new("docker");
    cmd.arg("run")
        .arg("--rm")
        .args(["--name", &container_name])
        .args(["--memory", &format!("{}g", reqs.ram_gb)])
        .args(["--cpus", &reqs.cpu_cores.to_string()]);
    for (key, value) in &payload.environment_vars {
        cmd.args(["-e", &format!("{}={}", key, value)]);
    }
    if let Some((_, path)) = &staged {
        cmd.args(["-v", &format!("{}:/input/input.data:ro", path.display())]);
    }
    cmd.arg(&payload.image_name);

    let run = tokio::time::timeout(
        Duration::from_secs(payload.max_duration_seconds),
        cmd.output(),
    )
    .await;

    match run {
        Ok(Ok(output)) => {
            let mut logs = String::from_utf8_lossy(&output.stdout).into_owned();
            logs.push_str(&String::from_utf8_lossy(&output.stderr));
            RunOutput {
                exit_code: output.status.code().unwrap_or(-1) as i64,
                logs,
                error: None,
            }
        }
        Ok(Err(e)) => RunOutput {
            exit_code: -1,
            logs: String::new(),
            error: Some(format!("container launch failed: {}", e)),
        },
        Err(_) => {
            // Duration bound hit: kill the container, report a
            // synthetic failure.
            let _ = Command::new("docker")
                .args(["kill", &container_name])
                .output()
                .await;
            RunOutput {
                exit_code: -1,
                logs: String::new(),
                error: Some(format!(
                    "timed out after {}s",
                    payload.max_duration_seconds
                )),
            }
        }
    }
}

/// Downloads the task input into a throwaway directory.
async fn stage_input(
    node: &Arc<Node>,
    url: &str,
) -> Result<(tempfile::TempDir, PathBuf), String> {
    let response = node
        .transport
        .client()
        .get(url)
        .timeout(DISPATCH_TIMEOUT)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("status {}", response.status()));
    }
    let bytes = response.bytes().await.map_err(|e| e.to_string())?;
    let dir = tempfile::tempdir().map_err(|e| e.to_string())?;
    let path = dir.path().join("input.data");
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|e| e.to_string())?;
    Ok((dir, path))
}

fn count_primes(limit: u64) -> u64 {
    if limit < 3 {
        return 0;
    }
    let limit = limit as usize;
    let mut sieve = vec![true; limit];
    sieve[0] = false;
    sieve[1] = false;
    let mut i = 2;
    while i * i < limit {
        if sieve[i] {
            let mut j = i * i;
            while j < limit {
                sieve[j] = false;
                j += i;
            }
        }
        i += 1;
    }
    sieve.iter().filter(|&&p| p).count() as u64
}

/// Deterministic dense multiply; the trace is the reported figure.
fn matrix_trace(size: usize) -> f64 {
    let a: Vec<f64> = (0..size * size).map(|i| (i % 7) as f64).collect();
    let b: Vec<f64> = (0..size * size).map(|i| (i % 5) as f64).collect();
    let mut trace = 0.0;
    for i in 0..size {
        for k in 0..size {
            // Only diagonal cells contribute to the trace; full rows are
            // still computed so the workload is honest.
            let aik = a[i * size + k];
            for j in 0..size {
                let value = aik * b[k * size + j];
                if i == j {
                    trace += value;
                }
            }
        }
    }
    trace
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_primes_known_values() {
        assert_eq!(count_primes(0), 0);
        assert_eq!(count_primes(2), 0);
        assert_eq!(count_primes(3), 1); // just 2
        assert_eq!(count_primes(10), 4); // 2 3 5 7
        assert_eq!(count_primes(100), 25);
        assert_eq!(count_primes(1000), 168);
    }

    #[test]
    fn test_matrix_trace_deterministic() {
        assert_eq!(matrix_trace(16), matrix_trace(16));
        assert!(matrix_trace(8) > 0.0);
    }
}
