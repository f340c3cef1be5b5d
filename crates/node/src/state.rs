//! # Node State
//!
//! The single owner of all shared mutable state: peer registry, overlay
//! routing, DHT store, resource snapshot, the executor's allocation
//! table, earnings, and the accounting journal. Created once at startup
//! and handed to handlers and background loops as `Arc<Node>` — nothing
//! here is a process-level global.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use uuid::Uuid;

use edgemesh_common::{
    ChordId, Journal, NodeKeypair, PricingParameters, ResourceOffer, ResourceRequirements,
    TaskResult,
};

use crate::chord::ChordOverlay;
use crate::dht::DhtStore;
use crate::monitor::ResourceMonitor;
use crate::registry::{PeerAddr, PeerRegistry};

/// Reward credited per successfully completed task.
pub const UNIT_REWARD_USD: f64 = 1.0;

/// In-memory table of resources reserved by running tasks.
#[derive(Default)]
pub struct AllocationTable {
    entries: Mutex<HashMap<Uuid, ResourceRequirements>>,
}

impl AllocationTable {
    pub fn allocate(&self, task_id: Uuid, requirements: ResourceRequirements) {
        self.entries.lock().insert(task_id, requirements);
    }

    pub fn release(&self, task_id: &Uuid) -> Option<ResourceRequirements> {
        self.entries.lock().remove(task_id)
    }

    pub fn active(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Results the scheduler is waiting on, keyed by task id.
#[derive(Default)]
pub struct ResultCollector {
    pending: Mutex<HashMap<Uuid, Vec<TaskResult>>>,
}

impl ResultCollector {
    /// Opens a collection slot for a task about to be dispatched.
    pub fn expect(&self, task_id: Uuid) {
        self.pending.lock().entry(task_id).or_default();
    }

    /// Delivers a result. Returns false when nobody is collecting the
    /// task (late or unsolicited result).
    pub fn deliver(&self, result: TaskResult) -> bool {
        let mut pending = self.pending.lock();
        match pending.get_mut(&result.task_id) {
            Some(results) => {
                results.push(result);
                true
            }
            None => false,
        }
    }

    /// Results received so far.
    pub fn received(&self, task_id: &Uuid) -> usize {
        self.pending
            .lock()
            .get(task_id)
            .map(|r| r.len())
            .unwrap_or(0)
    }

    /// Closes the slot and returns everything collected.
    pub fn take(&self, task_id: &Uuid) -> Vec<TaskResult> {
        self.pending.lock().remove(task_id).unwrap_or_default()
    }
}

/// Startup configuration, post-CLI resolution.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub ip: String,
    pub port: u16,
    pub bootstrap: Option<String>,
    pub debug: bool,
    pub pricing: PricingParameters,
}

/// All shared state for one running node.
pub struct Node {
    pub config: NodeConfig,
    pub keypair: NodeKeypair,
    pub registry: PeerRegistry,
    pub overlay: ChordOverlay,
    pub dht: DhtStore,
    pub monitor: ResourceMonitor,
    pub allocations: AllocationTable,
    pub collector: ResultCollector,
    pub journal: Journal,
    pub transport: crate::transport::HttpTransport,
    /// Hardware-derived capacity (the CLI flag is advisory only).
    pub promised_capacity: u64,
    /// Legacy load counter for `/handle_request`.
    pub current_load: AtomicU64,
    /// Accumulated earnings in hundredths of a cent, kept integral so an
    /// atomic suffices.
    earnings_micro_usd: AtomicU64,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        keypair: NodeKeypair,
        monitor: ResourceMonitor,
        journal: Journal,
    ) -> Arc<Self> {
        let addr = PeerAddr::new(config.ip.clone(), config.port);
        let promised_capacity = monitor.derived_capacity();
        let registry = PeerRegistry::new(addr.clone(), promised_capacity);
        registry.set_self_public_key(keypair.public_key_hex());
        let overlay = ChordOverlay::new(addr);

        Arc::new(Self {
            config,
            keypair,
            registry,
            overlay,
            dht: DhtStore::new(),
            monitor,
            allocations: AllocationTable::default(),
            collector: ResultCollector::default(),
            journal,
            transport: crate::transport::HttpTransport::new(),
            promised_capacity,
            current_load: AtomicU64::new(0),
            earnings_micro_usd: AtomicU64::new(0),
        })
    }

    pub fn addr(&self) -> &PeerAddr {
        self.registry.self_addr()
    }

    pub fn chord_id(&self) -> ChordId {
        self.addr().chord_id
    }

    /// `ip:port`, used as the journal node id.
    pub fn endpoint(&self) -> String {
        self.addr().endpoint()
    }

    /// Builds and signs the current self-offer from the latest snapshot.
    pub fn current_offer(&self) -> Result<ResourceOffer, edgemesh_common::CommonError> {
        ResourceOffer::build(
            self.chord_id(),
            self.endpoint(),
            self.monitor.latest(),
            self.config.pricing,
            &self.keypair,
        )
    }

    /// Credits the unit reward and writes the payment journal entry.
    pub fn credit_earnings(&self, task_id: &Uuid, amount_usd: f64) {
        let micro = (amount_usd * 1_000_000.0) as u64;
        let total = self.earnings_micro_usd.fetch_add(micro, Ordering::SeqCst) + micro;
        self.journal.append(
            "PAYMENT_EARNED_BY_NODE_X",
            &task_id.to_string(),
            &self.endpoint(),
            json!({
                "amount": amount_usd,
                "total_earnings": total as f64 / 1_000_000.0,
            }),
        );
    }

    pub fn total_earnings_usd(&self) -> f64 {
        self.earnings_micro_usd.load(Ordering::SeqCst) as f64 / 1_000_000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_table_round_trip() {
        let table = AllocationTable::default();
        let id = Uuid::new_v4();
        table.allocate(
            id,
            ResourceRequirements {
                cpu_cores: 2.0,
                ram_gb: 4.0,
            },
        );
        assert_eq!(table.active(), 1);
        let released = table.release(&id).unwrap();
        assert_eq!(released.cpu_cores, 2.0);
        assert_eq!(table.active(), 0);
        // Releasing twice is harmless.
        assert!(table.release(&id).is_none());
    }

    #[test]
    fn test_collector_only_accepts_expected_tasks() {
        let collector = ResultCollector::default();
        let id = Uuid::new_v4();
        let result = TaskResult {
            task_id: id,
            exit_code: 0,
            stdout_stderr: "ok".into(),
            error: None,
            output_checksum: Some("aa".into()),
        };
        assert!(!collector.deliver(result.clone()));
        collector.expect(id);
        assert!(collector.deliver(result));
        assert_eq!(collector.received(&id), 1);
        assert_eq!(collector.take(&id).len(), 1);
        assert_eq!(collector.received(&id), 0);
    }
}
