//! # Scheduler / Auction
//!
//! Task intake: discover offers through the DHT, filter by requirements
//! and price, pick the cheapest fits, dispatch to the winning executors,
//! collect their results, verify checksums, and — for redundant runs —
//! take the plurality checksum as consensus.
//!
//! Discovery sweeps the DHT key of every registry peer. A single
//! `find_successor` per offer key would also work; the sweep is kept
//! because it tolerates stale finger tables right after churn, when a
//! targeted lookup can miss offers the broad sweep still finds.
//!
//! Executors acknowledge immediately and run detached, so results flow
//! back through `/task_result`: the scheduler rewrites each dispatched
//! descriptor's `submission_url` to its own collection endpoint, waits a
//! bounded window, and forwards results to the requester's original
//! `submission_url` afterwards.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use edgemesh_common::{ResourceOffer, TaskDescriptor, TaskPayload, TaskResult};

use crate::offers::discover_offers;
use crate::state::Node;
use crate::transport::DISPATCH_TIMEOUT;

/// Offers older than this are discarded at discovery.
pub const OFFER_FRESHNESS_SECS: i64 = 300;

/// Poll interval while waiting for executor results.
const COLLECT_POLL: Duration = Duration::from_millis(250);

/// Grace on top of the task's own duration bound while collecting.
const COLLECT_GRACE_SECS: u64 = 15;

/// One dispatch attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub executor: String,
    pub agreed_price: Option<f64>,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What `/submit_task` returns.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduleOutcome {
    pub task_id: Uuid,
    pub dispatched: Vec<DispatchRecord>,
    pub results: Vec<TaskResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum_valid: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_valid: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// An offer that passed filtering, with its price for this task.
#[derive(Clone, Debug)]
pub struct RankedOffer {
    pub offer: ResourceOffer,
    pub price: Option<f64>,
}

/// Requirement + price filter (§auction step 2).
pub fn filter_offers(offers: Vec<ResourceOffer>, task: &TaskDescriptor) -> Vec<RankedOffer> {
    let reqs = task.resource_requirements;
    offers
        .into_iter()
        .filter_map(|offer| {
            let stats = &offer.system_stats;
            if (stats.cpu_cores_logical as f64) < reqs.cpu_cores
                || stats.memory_available_gb < reqs.ram_gb
            {
                return None;
            }
            match task.max_price_usd {
                Some(max_price) => {
                    let price = offer.estimated_price(reqs.cpu_cores, reqs.ram_gb);
                    if price <= max_price {
                        Some(RankedOffer {
                            offer,
                            price: Some(price),
                        })
                    } else {
                        None
                    }
                }
                None => Some(RankedOffer { offer, price: None }),
            }
        })
        .collect()
}

/// Auction selection (§auction step 3): price-sorted when a budget is
/// set, discovery order otherwise; first `k` win.
pub fn select_offers(mut eligible: Vec<RankedOffer>, k: usize) -> Vec<RankedOffer> {
    if eligible.iter().any(|o| o.price.is_some()) {
        eligible.sort_by(|a, b| {
            a.price
                .unwrap_or(f64::INFINITY)
                .partial_cmp(&b.price.unwrap_or(f64::INFINITY))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }
    eligible.truncate(k.max(1));
    eligible
}

/// Plurality consensus over reported checksums (§auction step 6):
/// accepted when the most common checksum reaches `k/2 + 1` votes.
pub fn tally_consensus(results: &[TaskResult], k: usize) -> Option<(String, usize, bool)> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for result in results {
        if let Some(checksum) = &result.output_checksum {
            *counts.entry(checksum.as_str()).or_insert(0) += 1;
        }
    }
    let (best, count) = counts.into_iter().max_by(|a, b| {
        // Deterministic tie-break so equal counts do not flap.
        a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0))
    })?;
    let valid = count >= k / 2 + 1;
    Some((best.to_string(), count, valid))
}

/// Collection window for a task: its own duration bound plus grace.
fn collect_window(task: &TaskDescriptor) -> Duration {
    let base = match &task.payload {
        TaskPayload::DockerImage(p) => p.max_duration_seconds,
        TaskPayload::BusyWait { seconds } => *seconds,
        _ => 15,
    };
    Duration::from_secs(base + COLLECT_GRACE_SECS)
}

/// Full auction for one task (§auction steps 1–6).
pub async fn schedule_task(
    node: &Arc<Node>,
    task: TaskDescriptor,
    redundant_k: usize,
) -> ScheduleOutcome {
    let task_id = task.task_id;
    let k = redundant_k.max(1);

    // 1. Discovery: sweep the DHT key of every known peer, self included.
    let mut offers = Vec::new();
    let now = Utc::now();
    for peer in node.registry.peer_list() {
        let found = discover_offers(node, &peer.chord_id).await;
        offers.extend(
            found
                .into_iter()
                .filter(|o| o.is_fresh(now, OFFER_FRESHNESS_SECS)),
        );
    }
    info!("task {}: {} fresh offers discovered", task_id, offers.len());

    // 2–3. Filter and select.
    let eligible = filter_offers(offers, &task);
    if eligible.is_empty() {
        return ScheduleOutcome {
            task_id,
            dispatched: Vec::new(),
            results: Vec::new(),
            checksum_valid: None,
            consensus_checksum: None,
            consensus_count: None,
            consensus_valid: if k > 1 { Some(false) } else { None },
            error: Some("No eligible nodes found for task requirements.".into()),
        };
    }
    let selected = select_offers(eligible, k);

    // 4. Dispatch, collecting results through our own endpoint.
    let requester_url = task.submission_url.clone();
    let mut outbound = task.clone();
    outbound.submission_url = Some(format!("{}/task_result", node.addr().base_url()));
    node.collector.expect(task_id);

    let mut dispatched = Vec::new();
    let mut accepted = 0usize;
    for ranked in &selected {
        let offer = &ranked.offer;
        node.journal.append(
            "TASK_SCHEDULED_TO_NODE_X",
            &task_id.to_string(),
            &node.endpoint(),
            json!({"executor": offer.node_address, "agreed_price": ranked.price}),
        );
        if node.registry.is_quarantined(&offer.node_address) {
            dispatched.push(DispatchRecord {
                executor: offer.node_address.clone(),
                agreed_price: ranked.price,
                accepted: false,
                error: Some("executor quarantined".into()),
            });
            continue;
        }
        let url = format!("http://{}/execute_task", offer.node_address);
        match node
            .transport
            .post_json_ack(&url, &outbound, DISPATCH_TIMEOUT)
            .await
        {
            Ok(()) => {
                accepted += 1;
                node.journal.append(
                    "TASK_ACCEPTED_BY_NODE_X",
                    &task_id.to_string(),
                    &node.endpoint(),
                    json!({"executor": offer.node_address, "agreed_price": ranked.price}),
                );
                dispatched.push(DispatchRecord {
                    executor: offer.node_address.clone(),
                    agreed_price: ranked.price,
                    accepted: true,
                    error: None,
                });
            }
            Err(e) => {
                warn!("dispatch to {} failed: {}", offer.node_address, e);
                node.registry.mark_misbehavior(&offer.node_address);
                node.journal.append(
                    "TASK_DISPATCH_FAILED",
                    &task_id.to_string(),
                    &node.endpoint(),
                    json!({"executor": offer.node_address, "error": e.to_string()}),
                );
                dispatched.push(DispatchRecord {
                    executor: offer.node_address.clone(),
                    agreed_price: ranked.price,
                    accepted: false,
                    error: Some(e.to_string()),
                });
            }
        }
    }

    // 5. Collect results from the executors that accepted.
    let results = if accepted > 0 {
        let deadline = tokio::time::Instant::now() + collect_window(&task);
        loop {
            if node.collector.received(&task_id) >= accepted {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(COLLECT_POLL).await;
        }
        node.collector.take(&task_id)
    } else {
        node.collector.take(&task_id);
        Vec::new()
    };

    // Verification against the requester's expected checksum.
    let mut checksum_valid = None;
    if let Some(expected) = task.payload.expected_output_checksum() {
        for result in &results {
            let valid = result.output_checksum.as_deref() == Some(expected);
            checksum_valid = Some(checksum_valid.unwrap_or(false) || valid);
            node.journal.append(
                "TASK_RESULT_CHECKSUM_VERIFIED",
                &task_id.to_string(),
                &node.endpoint(),
                json!({
                    "expected_checksum": expected,
                    "actual_checksum": result.output_checksum,
                    "checksum_valid": valid,
                }),
            );
        }
    }

    // 6. Consensus across redundant executions.
    let (consensus_checksum, consensus_count, consensus_valid) = if k > 1 {
        match tally_consensus(&results, k) {
            Some((checksum, count, valid)) => (Some(checksum), Some(count), Some(valid)),
            None => (None, None, Some(false)),
        }
    } else {
        (None, None, None)
    };

    // Forward results to the requester's own sink, when they asked.
    if let Some(url) = requester_url {
        for result in &results {
            if let Err(e) = node
                .transport
                .post_json_ack(&url, result, DISPATCH_TIMEOUT)
                .await
            {
                warn!("result forward to {} failed: {}", url, e);
            }
        }
    }

    ScheduleOutcome {
        task_id,
        dispatched,
        results,
        checksum_valid,
        consensus_checksum,
        consensus_count,
        consensus_valid,
        error: None,
    }
}
