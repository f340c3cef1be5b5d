//! Cross-module flows exercised directly on shared node state: the
//! registry handshake feeding the DHT's ingress validation, the
//! executor's admission and accounting, and the scheduler's auction over
//! locally held offers. No sockets — the HTTP boundary is covered by its
//! own thin handlers.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tempfile::TempDir;
use uuid::Uuid;

use edgemesh_common::offer::{PricingParameters, SystemStats};
use edgemesh_common::task::{ResourceRequirements, TaskDescriptor, TaskPayload};
use edgemesh_common::{ChordId, DhtUpdate, Journal, JournalEntry, NodeKeypair, ResourceOffer};
use edgemesh_node::scheduler::{schedule_task, OFFER_FRESHNESS_SECS};
use edgemesh_node::state::{Node, NodeConfig};
use edgemesh_node::ResourceMonitor;

fn pricing() -> PricingParameters {
    PricingParameters {
        cpu_per_hour_usd: 0.01,
        ram_gb_per_hour_usd: 0.002,
    }
}

/// A node on a temp journal, alone on its ring.
fn make_node(dir: &TempDir, port: u16) -> Arc<Node> {
    let journal = Journal::open(dir.path().join(format!("accounting-{}.log", port))).unwrap();
    Node::new(
        NodeConfig {
            ip: "127.0.0.1".into(),
            port,
            bootstrap: None,
            debug: false,
            pricing: pricing(),
        },
        NodeKeypair::generate(),
        ResourceMonitor::new(),
        journal,
    )
}

fn journal_entries(node: &Node) -> Vec<JournalEntry> {
    node.journal
        .contents()
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn events_of(node: &Node) -> Vec<String> {
    journal_entries(node)
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

/// Authenticates a synthetic peer against `node` and returns its keypair.
fn authenticate_peer(node: &Node, ip: &str, port: u16) -> NodeKeypair {
    let keypair = NodeKeypair::generate();
    let challenge = node.registry.register(ip, port, keypair.public_key_hex());
    let digest = Sha256::digest(challenge.as_bytes());
    node.registry
        .authenticate(ip, port, &keypair.sign_hex(digest.as_slice()), 500)
        .unwrap();
    keypair
}

fn peer_offer(ip: &str, port: u16, keypair: &NodeKeypair, cores: u32) -> ResourceOffer {
    ResourceOffer::build(
        ChordId::of_endpoint(ip, port),
        format!("{}:{}", ip, port),
        SystemStats {
            cpu_percent: 5.0,
            cpu_cores_physical: cores / 2,
            cpu_cores_logical: cores,
            memory_total_gb: 64.0,
            memory_available_gb: 32.0,
            memory_used_percent: 50.0,
            disk_total_gb: 500.0,
            disk_free_gb: 400.0,
            disk_used_percent: 20.0,
            timestamp_utc: chrono::Utc::now(),
        },
        pricing(),
        keypair,
    )
    .unwrap()
}

#[tokio::test]
async fn test_executor_rejects_insufficient_resources() {
    let dir = TempDir::new().unwrap();
    let node = make_node(&dir, 5100);
    let task = TaskDescriptor::new(
        "requester".into(),
        TaskPayload::Prime { limit: 100 },
        ResourceRequirements {
            cpu_cores: 1_000_000.0,
            ram_gb: 1_000_000.0,
        },
        None,
    );

    edgemesh_node::executor::run_task(node.clone(), task).await;

    let entries = journal_entries(&node);
    let failure = entries
        .iter()
        .find(|e| e.event_type == "TASK_FAILED_ON_NODE_X")
        .expect("admission failure logged");
    assert_eq!(failure.details["reason"], "insufficient resources");
    // Nothing was allocated, started, or paid.
    assert_eq!(node.allocations.active(), 0);
    assert_eq!(node.total_earnings_usd(), 0.0);
    assert!(!events_of(&node).contains(&"TASK_STARTED_ON_NODE_X".to_string()));
}

#[tokio::test]
async fn test_executor_native_task_full_lifecycle() {
    let dir = TempDir::new().unwrap();
    let node = make_node(&dir, 5101);
    let task = TaskDescriptor::new(
        "requester".into(),
        TaskPayload::Prime { limit: 1000 },
        ResourceRequirements {
            cpu_cores: 0.0,
            ram_gb: 0.0,
        },
        None,
    );
    let task_id = task.task_id;

    edgemesh_node::executor::run_task(node.clone(), task).await;

    let events = events_of(&node);
    let expected = [
        "RESOURCE_ALLOCATED",
        "TASK_STARTED_ON_NODE_X",
        "TASK_COMPLETED_ON_NODE_X",
        "PAYMENT_EARNED_BY_NODE_X",
        "RESOURCE_DEALLOCATED",
    ];
    for event in expected {
        assert!(events.contains(&event.to_string()), "missing {}", event);
    }
    // Allocation released, reward credited.
    assert_eq!(node.allocations.active(), 0);
    assert!((node.total_earnings_usd() - 1.0).abs() < 1e-9);

    // The completion entry carries the checksum of the output.
    let entries = journal_entries(&node);
    let done = entries
        .iter()
        .find(|e| e.event_type == "TASK_COMPLETED_ON_NODE_X")
        .unwrap();
    assert_eq!(done.task_id, task_id.to_string());
    assert!(done.details["output_checksum"].is_string());
    // 168 primes below 1000; the checksum is over that exact line.
    let expected_logs = "primes_below_1000=168\n";
    let expected_checksum = hex::encode(Sha256::digest(expected_logs.as_bytes()));
    assert_eq!(
        done.details["output_checksum"].as_str().unwrap(),
        expected_checksum
    );
}

#[tokio::test]
async fn test_handshake_gates_dht_ingress() {
    let dir = TempDir::new().unwrap();
    let node = make_node(&dir, 5102);

    // An unauthenticated publisher is refused outright.
    let stranger = NodeKeypair::generate();
    let offer = peer_offer("127.0.0.1", 5199, &stranger, 8);
    let update = DhtUpdate::build(offer.node_id, offer, &stranger).unwrap();
    assert!(node.dht.store_update(update, &node.registry).is_err());

    // After the handshake the same publisher is accepted.
    let keypair = authenticate_peer(&node, "127.0.0.1", 5199);
    let offer = peer_offer("127.0.0.1", 5199, &keypair, 8);
    let key = offer.node_id;
    let update = DhtUpdate::build(key, offer, &keypair).unwrap();
    node.dht.store_update(update, &node.registry).unwrap();

    let offers = node.dht.lookup(&key, &node.chord_id(), None).unwrap();
    assert_eq!(offers.len(), 1);
    assert!(offers[0].verify(&keypair.public_key_hex()));
    assert!(offers[0].is_fresh(chrono::Utc::now(), OFFER_FRESHNESS_SECS));
}

#[tokio::test]
async fn test_auction_selects_cheapest_and_records_dispatch_failure() {
    let dir = TempDir::new().unwrap();
    let node = make_node(&dir, 5103);

    // Two authenticated peers advertise; this node is alone on its ring,
    // so it holds their offers itself. Port 1 is closed, so dispatch
    // fails fast and the journal records it.
    let cheap_key = authenticate_peer(&node, "127.0.0.1", 1);
    let dear_key = authenticate_peer(&node, "127.0.0.1", 2);

    let mut cheap = peer_offer("127.0.0.1", 1, &cheap_key, 8);
    cheap.pricing_parameters.cpu_per_hour_usd = 0.001;
    let cheap = ResourceOffer::build(
        cheap.node_id,
        cheap.node_address.clone(),
        cheap.system_stats.clone(),
        cheap.pricing_parameters,
        &cheap_key,
    )
    .unwrap();
    let dear = peer_offer("127.0.0.1", 2, &dear_key, 8);

    for (offer, keypair) in [(cheap, &cheap_key), (dear, &dear_key)] {
        let update = DhtUpdate::build(offer.node_id, offer, keypair).unwrap();
        node.dht.store_update(update, &node.registry).unwrap();
    }

    let task = TaskDescriptor::new(
        "requester".into(),
        TaskPayload::BusyWait { seconds: 0 },
        ResourceRequirements {
            cpu_cores: 2.0,
            ram_gb: 4.0,
        },
        Some(0.05),
    );
    let outcome = schedule_task(&node, task, 1).await;

    // The auction picked the cheaper executor.
    assert_eq!(outcome.dispatched.len(), 1);
    assert_eq!(outcome.dispatched[0].executor, "127.0.0.1:1");
    let price = outcome.dispatched[0].agreed_price.unwrap();
    assert!((price - (2.0 * 0.001 + 4.0 * 0.002)).abs() < 1e-12);
    // Nobody is listening there, so dispatch failed and was journaled.
    assert!(!outcome.dispatched[0].accepted);
    assert!(events_of(&node).contains(&"TASK_DISPATCH_FAILED".to_string()));
    assert!(events_of(&node).contains(&"TASK_SCHEDULED_TO_NODE_X".to_string()));
}

#[tokio::test]
async fn test_quarantined_executor_is_never_dispatched_to() {
    let dir = TempDir::new().unwrap();
    let node = make_node(&dir, 5106);

    let keypair = authenticate_peer(&node, "127.0.0.1", 1);
    let offer = peer_offer("127.0.0.1", 1, &keypair, 8);
    let update = DhtUpdate::build(offer.node_id, offer, &keypair).unwrap();
    node.dht.store_update(update, &node.registry).unwrap();

    // Five strikes pushes the peer into quarantine.
    for _ in 0..5 {
        node.registry.mark_misbehavior("127.0.0.1:1");
    }
    assert!(node.registry.is_quarantined("127.0.0.1:1"));

    let task = TaskDescriptor::new(
        "requester".into(),
        TaskPayload::BusyWait { seconds: 0 },
        ResourceRequirements {
            cpu_cores: 1.0,
            ram_gb: 1.0,
        },
        None,
    );
    let outcome = schedule_task(&node, task, 1).await;

    // The offer won the auction but no call went out.
    assert_eq!(outcome.dispatched.len(), 1);
    assert!(!outcome.dispatched[0].accepted);
    assert_eq!(
        outcome.dispatched[0].error.as_deref(),
        Some("executor quarantined")
    );
    assert!(!events_of(&node).contains(&"TASK_DISPATCH_FAILED".to_string()));
}

#[tokio::test]
async fn test_auction_reports_no_eligible_nodes() {
    let dir = TempDir::new().unwrap();
    let node = make_node(&dir, 5104);
    let task = TaskDescriptor::new(
        "requester".into(),
        TaskPayload::BusyWait { seconds: 0 },
        ResourceRequirements {
            cpu_cores: 64.0,
            ram_gb: 512.0,
        },
        None,
    );
    let outcome = schedule_task(&node, task, 1).await;
    assert!(outcome.error.is_some());
    assert!(outcome.dispatched.is_empty());
}

#[tokio::test]
async fn test_result_collector_feeds_consensus() {
    let dir = TempDir::new().unwrap();
    let node = make_node(&dir, 5105);
    let task_id = Uuid::new_v4();
    node.collector.expect(task_id);
    for checksum in ["c1", "c1", "c2"] {
        node.collector.deliver(edgemesh_common::TaskResult {
            task_id,
            exit_code: 0,
            stdout_stderr: String::new(),
            error: None,
            output_checksum: Some(checksum.into()),
        });
    }
    let results = node.collector.take(&task_id);
    let (checksum, count, valid) =
        edgemesh_node::scheduler::tally_consensus(&results, 3).unwrap();
    assert_eq!(checksum, "c1");
    assert_eq!(count, 2);
    assert!(valid);
}
