//! # Chord Overlay
//!
//! 160-bit identifier ring: finger table, successor/predecessor
//! maintenance, lookup routing, and the join protocol.
//!
//! ## Failure semantics
//!
//! Every remote call is bounded by a small timeout and degrades to a
//! local best-effort answer — a lookup never fails, it returns the best
//! approximation this node can offer (usually its successor). Ring
//! correctness is recovered by the next stabilization tick.
//!
//! ## Locking
//!
//! Routing state lives behind a `parking_lot::RwLock`. Decisions are
//! computed under the lock and the lock is released before any network
//! await, so a slow peer can never wedge local routing.
//!
//! Remote access goes through the [`OverlayClient`] trait so tests can
//! drive whole rings in memory; the production implementation lives in
//! `transport.rs`.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use edgemesh_common::{is_between, ChordId, RING_BITS};

use crate::registry::{PeerAddr, PeerRegistry};

/// Fingers bulk-fixed right after join.
pub const JOIN_FIX_COUNT: usize = 20;

/// Delay between the bulk join-time finger fixes.
pub const JOIN_FIX_DELAY: Duration = Duration::from_millis(200);

/// Transport failure talking to a remote peer. Never fatal.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request to {url} failed: {reason}")]
    Failed { url: String, reason: String },
}

/// Remote half of the overlay protocol.
#[async_trait]
pub trait OverlayClient: Send + Sync {
    async fn find_successor(
        &self,
        base_url: &str,
        id: &ChordId,
    ) -> Result<PeerAddr, TransportError>;

    async fn successor(&self, base_url: &str) -> Result<Option<PeerAddr>, TransportError>;

    async fn predecessor(&self, base_url: &str) -> Result<Option<PeerAddr>, TransportError>;

    async fn notify(&self, base_url: &str, from: &PeerAddr) -> Result<(), TransportError>;
}

/// One finger table entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Finger {
    /// `self + 2^i (mod 2^160)`.
    pub start: ChordId,
    /// Best-known successor of `start`. Never the local node while the
    /// ring has at least two participants.
    pub node: Option<PeerAddr>,
}

/// Finger-table health stats for `/chord/analyze`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FingerAnalysis {
    pub self_references: usize,
    pub null_entries: usize,
    pub total_entries: usize,
    pub unique_successors: Vec<String>,
    pub coverage_percent: f64,
}

struct Routing {
    fingers: Vec<Finger>,
    successor: Option<PeerAddr>,
    predecessor: Option<PeerAddr>,
}

/// This node's view of the ring.
pub struct ChordOverlay {
    me: PeerAddr,
    state: RwLock<Routing>,
}

/// Strict open interval `(start, end)` on the ring.
fn in_open_interval(start: &ChordId, id: &ChordId, end: &ChordId) -> bool {
    is_between(start, id, end) && id != end
}

enum Route {
    /// Answer locally.
    Local(PeerAddr),
    /// Forward to a preceding finger; fall back to the successor if the
    /// finger cannot be reached.
    Forward { via: PeerAddr, fallback: PeerAddr },
}

impl ChordOverlay {
    /// Creates the overlay for a fresh node: all fingers empty, the node
    /// its own successor, no predecessor.
    pub fn new(me: PeerAddr) -> Self {
        let fingers = (0..RING_BITS)
            .map(|i| Finger {
                start: me.chord_id.add_pow2(i),
                node: None,
            })
            .collect();
        Self {
            me: me.clone(),
            state: RwLock::new(Routing {
                fingers,
                successor: Some(me),
                predecessor: None,
            }),
        }
    }

    pub fn me(&self) -> &PeerAddr {
        &self.me
    }

    pub fn successor(&self) -> Option<PeerAddr> {
        self.state.read().successor.clone()
    }

    pub fn predecessor(&self) -> Option<PeerAddr> {
        self.state.read().predecessor.clone()
    }

    /// Installs a new successor; finger 0 tracks it.
    pub fn set_successor(&self, peer: PeerAddr) {
        let mut state = self.state.write();
        if peer.chord_id != self.me.chord_id {
            state.fingers[0].node = Some(peer.clone());
        }
        state.successor = Some(peer);
    }

    /// First `n` fingers, for the `/chord/finger_table` sample.
    pub fn finger_sample(&self, n: usize) -> Vec<Finger> {
        self.state.read().fingers.iter().take(n).cloned().collect()
    }

    /// Predecessor proposal from `candidate`: adopted when there is no
    /// predecessor yet, or when the candidate sits in `(predecessor, self)`.
    pub fn notify(&self, candidate: PeerAddr) {
        if candidate.chord_id == self.me.chord_id {
            return;
        }
        let mut state = self.state.write();
        let adopt = match &state.predecessor {
            None => true,
            Some(pred) => in_open_interval(&pred.chord_id, &candidate.chord_id, &self.me.chord_id),
        };
        if adopt {
            debug!(
                "predecessor updated to {} (id {})",
                candidate.endpoint(),
                candidate.chord_id.short()
            );
            state.predecessor = Some(candidate);
        }
    }

    /// Scan fingers from the top down for the first one strictly inside
    /// `(self, id)`; self when none qualifies.
    fn closest_preceding_node(state: &Routing, me: &PeerAddr, id: &ChordId) -> PeerAddr {
        for finger in state.fingers.iter().rev() {
            if let Some(node) = &finger.node {
                if in_open_interval(&me.chord_id, &node.chord_id, id) {
                    return node.clone();
                }
            }
        }
        me.clone()
    }

    /// Routing decision for `id`, computed entirely under the lock.
    fn route(&self, id: &ChordId) -> Route {
        let state = self.state.read();
        let successor = match &state.successor {
            Some(s) if s.chord_id != self.me.chord_id => s.clone(),
            // Alone on the ring: everything maps to self.
            _ => return Route::Local(self.me.clone()),
        };
        if is_between(&self.me.chord_id, id, &successor.chord_id) {
            return Route::Local(successor);
        }
        let via = Self::closest_preceding_node(&state, &self.me, id);
        if via.chord_id == self.me.chord_id {
            return Route::Local(successor);
        }
        Route::Forward {
            via,
            fallback: successor,
        }
    }

    /// Resolves the successor of `id`, forwarding through the overlay
    /// when a finger precedes it. Forwarding failures (including
    /// quarantined targets) degrade to the local best answer.
    pub async fn find_successor(
        &self,
        id: &ChordId,
        client: &dyn OverlayClient,
        registry: &PeerRegistry,
    ) -> PeerAddr {
        match self.route(id) {
            Route::Local(peer) => peer,
            Route::Forward { via, fallback } => {
                if registry.is_quarantined(&via.endpoint()) {
                    return fallback;
                }
                match client.find_successor(&via.base_url(), id).await {
                    Ok(found) => found,
                    Err(e) => {
                        warn!("forward query via {} failed: {}", via.endpoint(), e);
                        registry.mark_misbehavior(&via.endpoint());
                        fallback
                    }
                }
            }
        }
    }

    /// One stabilization round: repair the successor pointer, then tell
    /// the successor about us.
    pub async fn stabilize(&self, client: &dyn OverlayClient, registry: &PeerRegistry) {
        let successor = self.successor();

        let successor = match successor {
            None => {
                if let Some(peer) = self.any_other_peer(registry) {
                    info!("adopted successor {} from peer table", peer.endpoint());
                    self.set_successor(peer);
                }
                return;
            }
            Some(s) if s.chord_id == self.me.chord_id => {
                // Ring of one from our point of view; look for anyone
                // closer in the peer table.
                let mut best: Option<PeerAddr> = None;
                for peer in registry.other_peers() {
                    let addr = peer.addr();
                    let better = match &best {
                        None => true,
                        Some(b) => {
                            in_open_interval(&self.me.chord_id, &addr.chord_id, &b.chord_id)
                        }
                    };
                    if better {
                        best = Some(addr);
                    }
                }
                if let Some(peer) = best {
                    info!("found successor {} from peer table", peer.endpoint());
                    self.set_successor(peer);
                }
                return;
            }
            Some(s) => s,
        };

        if registry.is_quarantined(&successor.endpoint()) {
            self.fall_back_successor(registry);
            return;
        }

        match client.predecessor(&successor.base_url()).await {
            Ok(Some(x)) => {
                if x.chord_id != self.me.chord_id
                    && in_open_interval(&self.me.chord_id, &x.chord_id, &successor.chord_id)
                {
                    info!("successor updated to {}", x.endpoint());
                    self.set_successor(x);
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!("successor {} unreachable: {}", successor.endpoint(), e);
                registry.mark_misbehavior(&successor.endpoint());
                self.fall_back_successor(registry);
                return;
            }
        }

        // Notify whoever our successor is now.
        if let Some(current) = self.successor() {
            if current.chord_id != self.me.chord_id
                && !registry.is_quarantined(&current.endpoint())
            {
                if let Err(e) = client.notify(&current.base_url(), &self.me).await {
                    warn!("notify {} failed: {}", current.endpoint(), e);
                    registry.mark_misbehavior(&current.endpoint());
                }
            }
        }
    }

    /// Successor is gone: adopt the most suitable known peer.
    fn fall_back_successor(&self, registry: &PeerRegistry) {
        let mut backup: Option<PeerAddr> = None;
        for peer in registry.other_peers() {
            if registry.is_quarantined(&peer.endpoint()) {
                continue;
            }
            let addr = peer.addr();
            let better = match &backup {
                None => true,
                Some(b) => in_open_interval(&self.me.chord_id, &addr.chord_id, &b.chord_id),
            };
            if better {
                backup = Some(addr);
            }
        }
        match backup {
            Some(peer) => {
                info!("successor failed, falling back to {}", peer.endpoint());
                self.set_successor(peer);
            }
            None => self.set_successor(self.me.clone()),
        }
    }

    fn any_other_peer(&self, registry: &PeerRegistry) -> Option<PeerAddr> {
        registry
            .other_peers()
            .into_iter()
            .find(|p| !registry.is_quarantined(&p.endpoint()))
            .map(|p| p.addr())
    }

    /// Repairs one finger entry. Returns true when the entry changed.
    pub async fn fix_finger(
        &self,
        i: usize,
        client: &dyn OverlayClient,
        registry: &PeerRegistry,
    ) -> bool {
        let start = {
            let state = self.state.read();
            match state.fingers.get(i) {
                Some(f) => f.start,
                None => return false,
            }
        };
        let found = self.find_successor(&start, client, registry).await;
        // A finger must never point at ourselves.
        if found.chord_id == self.me.chord_id {
            return false;
        }
        let mut state = self.state.write();
        let entry = &mut state.fingers[i];
        let changed = entry.node.as_ref().map(|n| n.chord_id) != Some(found.chord_id);
        if changed {
            debug!(
                "finger {} now points to {} (id {})",
                i,
                found.endpoint(),
                found.chord_id.short()
            );
            entry.node = Some(found);
        }
        changed
    }

    /// Periodic repair: a biased-random index favouring low fingers,
    /// which the routing hot path actually exercises.
    pub async fn fix_fingers_once(&self, client: &dyn OverlayClient, registry: &PeerRegistry) {
        let i = {
            let mut rng = rand::thread_rng();
            let r: f64 = rng.gen::<f64>() * rng.gen::<f64>();
            ((r * RING_BITS as f64) as usize).min(RING_BITS - 1)
        };
        self.fix_finger(i, client, registry).await;
    }

    /// Bulk fix of the first [`JOIN_FIX_COUNT`] fingers, run right after
    /// joining so routing works before the periodic fixer catches up.
    pub async fn fix_first_fingers(&self, client: &dyn OverlayClient, registry: &PeerRegistry) {
        for i in 0..JOIN_FIX_COUNT.min(RING_BITS) {
            self.fix_finger(i, client, registry).await;
            tokio::time::sleep(JOIN_FIX_DELAY).await;
        }
    }

    /// Joins the ring through a bootstrap node. On a self-referential
    /// answer (bootstrap is alone, or our id collides) the bootstrap's
    /// own successor, then any known peer, are tried in order.
    pub async fn join(
        &self,
        bootstrap_url: &str,
        client: &dyn OverlayClient,
        registry: &PeerRegistry,
    ) -> Result<(), TransportError> {
        info!(
            "joining ring via {} (id {})",
            bootstrap_url,
            self.me.chord_id.short()
        );
        let mut successor = client.find_successor(bootstrap_url, &self.me.chord_id).await?;

        if successor.chord_id == self.me.chord_id {
            successor = match client.successor(bootstrap_url).await {
                Ok(Some(s)) if s.chord_id != self.me.chord_id => s,
                _ => match self.any_other_peer(registry) {
                    Some(p) => p,
                    None => return Ok(()), // nothing better than ourselves yet
                },
            };
        }

        info!(
            "joined with successor {} (id {})",
            successor.endpoint(),
            successor.chord_id.short()
        );
        self.set_successor(successor.clone());
        if let Err(e) = client.notify(&successor.base_url(), &self.me).await {
            warn!("join-time notify failed: {}", e);
        }
        Ok(())
    }

    /// Finger-table health stats.
    pub fn analyze(&self) -> FingerAnalysis {
        let state = self.state.read();
        let mut analysis = FingerAnalysis {
            self_references: 0,
            null_entries: 0,
            total_entries: state.fingers.len(),
            unique_successors: Vec::new(),
            coverage_percent: 0.0,
        };
        let mut unique = std::collections::BTreeSet::new();
        for finger in &state.fingers {
            match &finger.node {
                None => analysis.null_entries += 1,
                Some(node) if node.chord_id == self.me.chord_id => {
                    analysis.self_references += 1
                }
                Some(node) => {
                    unique.insert(node.endpoint());
                }
            }
        }
        let populated = analysis.total_entries - analysis.null_entries;
        analysis.coverage_percent =
            (unique.len() as f64 / populated.max(1) as f64) * 100.0;
        analysis.unique_successors = unique.into_iter().collect();
        analysis
    }
}
