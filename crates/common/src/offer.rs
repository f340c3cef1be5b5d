//! # Resource Offers
//!
//! A resource offer is a node's signed advertisement of its live capacity
//! and pricing. Offers are placed into the DHT wrapped in a [`DhtUpdate`]
//! envelope whose own signature binds the offer to the ring key it is
//! being stored under; the responsible node checks both signatures before
//! accepting the update.
//!
//! Signing covers the canonical JSON form (sorted keys, `signature`
//! excluded) — see [`crate::canonical`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::canonical::canonical_json;
use crate::error::CommonError;
use crate::identity::{verify_hex, NodeKeypair};
use crate::ring::ChordId;

/// Live host statistics, sampled by the resource monitor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    pub cpu_percent: f64,
    pub cpu_cores_physical: u32,
    pub cpu_cores_logical: u32,
    pub memory_total_gb: f64,
    pub memory_available_gb: f64,
    pub memory_used_percent: f64,
    pub disk_total_gb: f64,
    pub disk_free_gb: f64,
    pub disk_used_percent: f64,
    pub timestamp_utc: DateTime<Utc>,
}

/// Hourly prices a node charges per resource unit.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PricingParameters {
    pub cpu_per_hour_usd: f64,
    pub ram_gb_per_hour_usd: f64,
}

impl PricingParameters {
    /// Estimated hourly price for a task needing `cpu_cores` and `ram_gb`.
    pub fn estimate(&self, cpu_cores: f64, ram_gb: f64) -> f64 {
        cpu_cores * self.cpu_per_hour_usd + ram_gb * self.ram_gb_per_hour_usd
    }
}

/// A signed capacity advertisement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceOffer {
    /// Ring identifier of the publishing node.
    pub node_id: ChordId,
    /// `ip:port` of the publishing node.
    pub node_address: String,
    pub system_stats: SystemStats,
    pub pricing_parameters: PricingParameters,
    pub offer_timestamp_utc: DateTime<Utc>,
    pub offer_id: Uuid,
    /// ECDSA over the canonical form; `None` only mid-construction.
    pub signature: Option<String>,
}

impl ResourceOffer {
    /// Constructs and signs an offer with a fresh `offer_id` and the
    /// current UTC timestamp.
    pub fn build(
        node_id: ChordId,
        node_address: String,
        system_stats: SystemStats,
        pricing_parameters: PricingParameters,
        keypair: &NodeKeypair,
    ) -> Result<Self, CommonError> {
        let mut offer = Self {
            node_id,
            node_address,
            system_stats,
            pricing_parameters,
            offer_timestamp_utc: Utc::now(),
            offer_id: Uuid::new_v4(),
            signature: None,
        };
        let bytes = canonical_json(&offer)?;
        offer.signature = Some(keypair.sign_hex(bytes.as_bytes()));
        Ok(offer)
    }

    /// Checks the offer signature under `public_key_hex`. Missing or
    /// malformed signatures verify as `false`; nothing propagates.
    pub fn verify(&self, public_key_hex: &str) -> bool {
        let Some(signature) = &self.signature else {
            return false;
        };
        let Ok(bytes) = canonical_json(self) else {
            return false;
        };
        verify_hex(public_key_hex, bytes.as_bytes(), signature)
    }

    /// Whether the offer timestamp is within `max_age_secs` of `now`.
    /// Offers from the future are treated as fresh (clock skew).
    pub fn is_fresh(&self, now: DateTime<Utc>, max_age_secs: i64) -> bool {
        now.signed_duration_since(self.offer_timestamp_utc)
            .num_seconds()
            <= max_age_secs
    }

    /// Estimated hourly price of this offer for the given requirements.
    pub fn estimated_price(&self, cpu_cores: f64, ram_gb: f64) -> f64 {
        self.pricing_parameters.estimate(cpu_cores, ram_gb)
    }
}

/// The signed record a publisher places into the DHT.
///
/// The envelope signature covers `{key, value}` under the publisher's
/// key, so the responsible node can check that whoever produced the offer
/// also chose the ring position it lands on.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DhtUpdate {
    /// Ring key the value is stored under (the publisher's chord id).
    pub key: ChordId,
    pub value: ResourceOffer,
    pub signature: Option<String>,
}

impl DhtUpdate {
    /// Wraps `offer` for storage under `key` and signs the envelope.
    pub fn build(
        key: ChordId,
        value: ResourceOffer,
        keypair: &NodeKeypair,
    ) -> Result<Self, CommonError> {
        let mut update = Self {
            key,
            value,
            signature: None,
        };
        let bytes = canonical_json(&update)?;
        update.signature = Some(keypair.sign_hex(bytes.as_bytes()));
        Ok(update)
    }

    /// Checks the envelope signature under `public_key_hex`.
    pub fn verify(&self, public_key_hex: &str) -> bool {
        let Some(signature) = &self.signature else {
            return false;
        };
        let Ok(bytes) = canonical_json(self) else {
            return false;
        };
        verify_hex(public_key_hex, bytes.as_bytes(), signature)
    }
}
