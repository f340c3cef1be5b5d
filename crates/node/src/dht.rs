//! # Offer DHT
//!
//! The overlay hosts resource offers as a content-addressed store: an
//! offer lives at the current Chord successor of the publisher's ring
//! id. The store is in-memory only — liveness comes from each node
//! re-advertising a fresh offer every minute, and readers enforce their
//! own freshness window.
//!
//! Ingress is authenticated twice: the update envelope signature binds
//! the offer to the ring key it lands under, and the inner offer
//! signature proves the offer itself. Both verify against the public key
//! the publisher proved during the registry handshake — an update from
//! an address we never authenticated is refused outright.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use edgemesh_common::{is_between, ChordId, DhtUpdate, ResourceOffer};

use crate::registry::PeerRegistry;

/// Why a DHT request was refused.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DhtError {
    /// The publishing address has no authenticated public key here.
    #[error("unknown publisher {0}")]
    UnknownPublisher(String),
    /// The `{key, value}` envelope signature did not verify.
    #[error("invalid update signature")]
    BadEnvelopeSignature,
    /// The inner offer signature did not verify.
    #[error("invalid offer signature")]
    BadOfferSignature,
    /// This node is not the successor of the requested key.
    #[error("key {0} outside this node's range")]
    NotResponsible(String),
}

/// Offers held by this node, keyed by publisher ring id.
#[derive(Default)]
pub struct DhtStore {
    entries: Mutex<HashMap<ChordId, Vec<ResourceOffer>>>,
}

impl DhtStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validated ingress for a signed update.
    ///
    /// The publisher's key comes from the peer registry (by
    /// `node_address`); the envelope and the inner offer must both
    /// verify under it. A valid update replaces any prior offer from the
    /// same address under the same key — newest wins, one offer per
    /// publisher.
    pub fn store_update(
        &self,
        update: DhtUpdate,
        registry: &PeerRegistry,
    ) -> Result<(), DhtError> {
        let address = update.value.node_address.clone();
        let public_key = registry
            .public_key_of(&address)
            .ok_or_else(|| DhtError::UnknownPublisher(address.clone()))?;

        if !update.verify(&public_key) {
            return Err(DhtError::BadEnvelopeSignature);
        }
        if !update.value.verify(&public_key) {
            return Err(DhtError::BadOfferSignature);
        }

        let mut entries = self.entries.lock();
        let list = entries.entry(update.key).or_default();
        list.retain(|offer| offer.node_address != address);
        list.push(update.value);
        debug!(
            "stored offer from {} under key {}",
            address,
            update.key.short()
        );
        Ok(())
    }

    /// Offers stored under `key`, provided the key falls in this node's
    /// authoritative range `(predecessor, self]`. Without a predecessor
    /// the node answers for the whole ring.
    pub fn lookup(
        &self,
        key: &ChordId,
        self_id: &ChordId,
        predecessor_id: Option<&ChordId>,
    ) -> Result<Vec<ResourceOffer>, DhtError> {
        if let Some(pred) = predecessor_id {
            if !is_between(pred, key, self_id) {
                return Err(DhtError::NotResponsible(key.to_hex()));
            }
        }
        Ok(self
            .entries
            .lock()
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    /// Number of keys currently held (observability).
    pub fn key_count(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use edgemesh_common::offer::{PricingParameters, SystemStats};
    use edgemesh_common::NodeKeypair;

    use crate::registry::PeerAddr;

    fn stats() -> SystemStats {
        SystemStats {
            cpu_percent: 10.0,
            cpu_cores_physical: 4,
            cpu_cores_logical: 8,
            memory_total_gb: 64.0,
            memory_available_gb: 32.0,
            memory_used_percent: 50.0,
            disk_total_gb: 500.0,
            disk_free_gb: 400.0,
            disk_used_percent: 20.0,
            timestamp_utc: Utc::now(),
        }
    }

    fn pricing() -> PricingParameters {
        PricingParameters {
            cpu_per_hour_usd: 0.01,
            ram_gb_per_hour_usd: 0.002,
        }
    }

    /// Registry with one authenticated peer; returns its keypair.
    fn registry_with_peer(ip: &str, port: u16) -> (PeerRegistry, NodeKeypair) {
        let registry = PeerRegistry::new(PeerAddr::new("127.0.0.1", 5000), 1000);
        let keypair = NodeKeypair::generate();
        let challenge = registry.register(ip, port, keypair.public_key_hex());
        let digest = sha2::Sha256::digest(challenge.as_bytes());
        let signature = keypair.sign_hex(digest.as_slice());
        registry.authenticate(ip, port, &signature, 500).unwrap();
        (registry, keypair)
    }

    use sha2::Digest;

    fn signed_update(ip: &str, port: u16, keypair: &NodeKeypair) -> DhtUpdate {
        let node_id = ChordId::of_endpoint(ip, port);
        let offer = ResourceOffer::build(
            node_id,
            format!("{}:{}", ip, port),
            stats(),
            pricing(),
            keypair,
        )
        .unwrap();
        DhtUpdate::build(node_id, offer, keypair).unwrap()
    }

    #[test]
    fn test_store_and_lookup_round_trip() {
        let (registry, keypair) = registry_with_peer("10.0.0.2", 6000);
        let store = DhtStore::new();
        let update = signed_update("10.0.0.2", 6000, &keypair);
        let key = update.key;
        store.store_update(update, &registry).unwrap();

        let offers = store
            .lookup(&key, &ChordId::of_endpoint("127.0.0.1", 5000), None)
            .unwrap();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].node_address, "10.0.0.2:6000");
        assert!(offers[0].verify(&keypair.public_key_hex()));
    }

    #[test]
    fn test_unknown_publisher_rejected() {
        let registry = PeerRegistry::new(PeerAddr::new("127.0.0.1", 5000), 1000);
        let store = DhtStore::new();
        let keypair = NodeKeypair::generate();
        let update = signed_update("10.0.0.9", 6009, &keypair);
        assert_eq!(
            store.store_update(update, &registry),
            Err(DhtError::UnknownPublisher("10.0.0.9:6009".into()))
        );
    }

    #[test]
    fn test_bad_envelope_signature_rejected() {
        let (registry, keypair) = registry_with_peer("10.0.0.2", 6000);
        let store = DhtStore::new();
        let mut update = signed_update("10.0.0.2", 6000, &keypair);
        // Re-key the envelope after signing.
        update.key = ChordId::of_endpoint("10.0.0.2", 6001);
        assert_eq!(
            store.store_update(update, &registry),
            Err(DhtError::BadEnvelopeSignature)
        );
    }

    #[test]
    fn test_bad_offer_signature_rejected() {
        let (registry, keypair) = registry_with_peer("10.0.0.2", 6000);
        let store = DhtStore::new();
        let original = signed_update("10.0.0.2", 6000, &keypair);
        // Tamper with the offer, then rebuild only the envelope.
        let mut offer = original.value.clone();
        offer.system_stats.cpu_cores_logical = 1024;
        let update = DhtUpdate::build(original.key, offer, &keypair).unwrap();
        assert_eq!(
            store.store_update(update, &registry),
            Err(DhtError::BadOfferSignature)
        );
    }

    #[test]
    fn test_newest_offer_replaces_prior_from_same_address() {
        let (registry, keypair) = registry_with_peer("10.0.0.2", 6000);
        let store = DhtStore::new();
        let first = signed_update("10.0.0.2", 6000, &keypair);
        let key = first.key;
        let first_id = first.value.offer_id;
        store.store_update(first, &registry).unwrap();

        let second = signed_update("10.0.0.2", 6000, &keypair);
        let second_id = second.value.offer_id;
        store.store_update(second, &registry).unwrap();

        let offers = store
            .lookup(&key, &ChordId::of_endpoint("127.0.0.1", 5000), None)
            .unwrap();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].offer_id, second_id);
        assert_ne!(first_id, second_id);
    }

    #[test]
    fn test_lookup_refused_outside_range() {
        let store = DhtStore::new();
        // Node owns (predecessor, self]; a key beyond self is refused.
        let pred = ChordId::from_hex("10").unwrap();
        let me = ChordId::from_hex("20").unwrap();
        let outside = ChordId::from_hex("30").unwrap();
        let inside = ChordId::from_hex("18").unwrap();
        assert!(matches!(
            store.lookup(&outside, &me, Some(&pred)),
            Err(DhtError::NotResponsible(_))
        ));
        // In-range keys answer (possibly empty).
        assert!(store.lookup(&inside, &me, Some(&pred)).unwrap().is_empty());
    }

    #[test]
    fn test_lookup_without_predecessor_answers_everything() {
        let store = DhtStore::new();
        let me = ChordId::from_hex("20").unwrap();
        let any = ChordId::from_hex("f0").unwrap();
        assert!(store.lookup(&any, &me, None).is_ok());
    }
}
