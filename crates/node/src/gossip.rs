//! # Peer Discovery & Health
//!
//! The gossip side of the registry: the bootstrap handshake a node
//! performs against its first contact, the jittered discovery tick that
//! merges a random peer's table into ours, and the health probe that
//! feeds the misbehavior counters.

use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::chord::TransportError;
use crate::registry::PeerRecord;
use crate::state::Node;
use crate::transport::{DHT_TIMEOUT, OVERLAY_TIMEOUT};

/// Discovery runs every 1–5 s (jittered per tick).
pub const DISCOVERY_MIN_SECS: u64 = 1;
pub const DISCOVERY_MAX_SECS: u64 = 5;

#[derive(Debug, Deserialize)]
struct PeerListWire {
    peers: Vec<PeerRecord>,
}

#[derive(Debug, Deserialize)]
struct ChallengeWire {
    challenge: String,
}

/// Runs the register → challenge → authenticate handshake against a
/// bootstrap node, then pulls its peer table.
pub async fn register_with(node: &Arc<Node>, base_url: &str) -> Result<(), TransportError> {
    let addr = node.addr().clone();
    let register_body = serde_json::json!({
        "ip": addr.ip,
        "port": addr.port,
        "public_key": node.keypair.public_key_hex(),
    });
    let challenge: ChallengeWire = node
        .transport
        .post_json(&format!("{}/register", base_url), &register_body, DHT_TIMEOUT)
        .await?;

    let digest = Sha256::digest(challenge.challenge.as_bytes());
    let auth_body = serde_json::json!({
        "ip": addr.ip,
        "port": addr.port,
        "signature": node.keypair.sign_hex(digest.as_slice()),
        "promised_capacity": node.promised_capacity,
    });
    node.transport
        .post_json_ack(&format!("{}/authenticate", base_url), &auth_body, DHT_TIMEOUT)
        .await?;
    info!("authenticated with bootstrap {}", base_url);

    fetch_peer_table(node, base_url).await;
    Ok(())
}

/// Pulls `/peer` from a node and merges unknown entries.
async fn fetch_peer_table(node: &Arc<Node>, base_url: &str) {
    match node
        .transport
        .get_json::<PeerListWire>(&format!("{}/peer", base_url), DHT_TIMEOUT)
        .await
    {
        Ok(list) => node.registry.merge_peers(list.peers),
        Err(e) => debug!("peer table fetch from {} failed: {}", base_url, e),
    }
}

/// One discovery round: merge a random peer's table into ours.
pub async fn discovery_tick(node: &Arc<Node>) {
    let candidates: Vec<_> = node
        .registry
        .other_peers()
        .into_iter()
        .filter(|p| !node.registry.is_quarantined(&p.endpoint()))
        .collect();
    let Some(peer) = candidates.choose(&mut rand::thread_rng()).cloned() else {
        return;
    };
    fetch_peer_table(node, &peer.addr().base_url()).await;
}

/// One health round: probe every non-self peer; unreachable peers
/// collect strikes until the registry quarantines them.
pub async fn health_tick(node: &Arc<Node>) {
    for peer in node.registry.other_peers() {
        let endpoint = peer.endpoint();
        if node.registry.is_quarantined(&endpoint) {
            continue;
        }
        let url = format!("{}/status", peer.addr().base_url());
        match node
            .transport
            .get_json::<serde_json::Value>(&url, OVERLAY_TIMEOUT)
            .await
        {
            Ok(_) => node.registry.mark_seen(&endpoint),
            Err(e) => {
                warn!("peer {} unreachable: {}", endpoint, e);
                node.registry.mark_misbehavior(&endpoint);
            }
        }
    }
}

/// Jittered delay before the next discovery round.
pub fn next_discovery_delay() -> std::time::Duration {
    let secs = rand::thread_rng().gen_range(DISCOVERY_MIN_SECS..=DISCOVERY_MAX_SECS);
    std::time::Duration::from_secs(secs)
}
