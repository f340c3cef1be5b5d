//! # Offer Publication & Discovery
//!
//! Client side of the offer DHT. A node re-advertises a fresh signed
//! offer every minute: resolve the successor of its own ring id, wrap
//! the offer in a signed update envelope, and POST it to the successor's
//! store endpoint (or store locally when the node is its own successor).
//!
//! Discovery is the mirror image: resolve the successor of the queried
//! key and fetch whatever it holds. All failures degrade to an empty
//! answer — discovery is best-effort by design.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use edgemesh_common::{ChordId, DhtUpdate, ResourceOffer};

use crate::state::Node;
use crate::transport::DHT_TIMEOUT;

/// How often a node republishes its offer.
pub const ADVERTISE_INTERVAL_SECS: u64 = 60;

/// Wire shape of `/chord/lookup_metadata` responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct OffersResponse {
    pub offers: Vec<ResourceOffer>,
}

/// Builds, signs, and places this node's current offer at its successor.
pub async fn advertise_once(node: &Arc<Node>) {
    let offer = match node.current_offer() {
        Ok(offer) => offer,
        Err(e) => {
            warn!("could not build self offer: {}", e);
            return;
        }
    };
    let update = match DhtUpdate::build(node.chord_id(), offer, &node.keypair) {
        Ok(update) => update,
        Err(e) => {
            warn!("could not sign DHT update: {}", e);
            return;
        }
    };

    let key = node.chord_id();
    let successor = node
        .overlay
        .find_successor(&key, &node.transport, &node.registry)
        .await;

    if successor.chord_id == node.chord_id() {
        // We are the responsible node; ingest through the same
        // validated path remote publishers use.
        if let Err(e) = node.dht.store_update(update, &node.registry) {
            warn!("local offer store refused: {}", e);
        }
        return;
    }

    if node.registry.is_quarantined(&successor.endpoint()) {
        debug!("successor {} quarantined, skipping advert", successor.endpoint());
        return;
    }

    let url = format!("{}/chord/store_metadata", successor.base_url());
    if let Err(e) = node.transport.post_json_ack(&url, &update, DHT_TIMEOUT).await {
        warn!("offer publish to {} failed: {}", successor.endpoint(), e);
        node.registry.mark_misbehavior(&successor.endpoint());
    } else {
        debug!("offer published to {}", successor.endpoint());
    }
}

/// Fetches the offers stored for `key` from the responsible node.
/// Transport failures come back as an empty list and a strike.
pub async fn discover_offers(node: &Arc<Node>, key: &ChordId) -> Vec<ResourceOffer> {
    let successor = node
        .overlay
        .find_successor(key, &node.transport, &node.registry)
        .await;

    if successor.chord_id == node.chord_id() {
        let predecessor = node.overlay.predecessor();
        return node
            .dht
            .lookup(key, &node.chord_id(), predecessor.as_ref().map(|p| &p.chord_id))
            .unwrap_or_default();
    }

    if node.registry.is_quarantined(&successor.endpoint()) {
        return Vec::new();
    }

    let url = format!(
        "{}/chord/lookup_metadata?key={}",
        successor.base_url(),
        key.to_hex()
    );
    match node
        .transport
        .get_json::<OffersResponse>(&url, DHT_TIMEOUT)
        .await
    {
        Ok(response) => response.offers,
        Err(e) => {
            debug!("offer lookup at {} failed: {}", successor.endpoint(), e);
            node.registry.mark_misbehavior(&successor.endpoint());
            Vec::new()
        }
    }
}
