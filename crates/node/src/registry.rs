//! # Peer Registry & Authentication
//!
//! Authenticated membership table for the mesh. A peer joins in two
//! steps: `register` hands out a random challenge bound to the claimed
//! `ip:port` identity, and `authenticate` proves possession of the
//! private key by signing it. Only authenticated peers enter the table.
//!
//! The registry also owns misbehavior scoring: repeated transport
//! failures push a peer into a time-bounded quarantine during which no
//! outbound call may target it. Counters are lifetime-only — they are
//! never decremented and reset on restart.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use edgemesh_common::{verify_hex, ChordId};

/// Length of the registration challenge.
const CHALLENGE_LEN: usize = 16;

/// Strikes before a peer is quarantined.
pub const MISBEHAVIOR_THRESHOLD: u32 = 5;

/// How long a quarantine lasts.
pub const QUARANTINE_SECS: i64 = 300;

/// The routing triple: where a peer lives and where it sits on the ring.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddr {
    pub ip: String,
    pub port: u16,
    pub chord_id: ChordId,
}

impl PeerAddr {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        let ip = ip.into();
        let chord_id = ChordId::of_endpoint(&ip, port);
        Self { ip, port, chord_id }
    }

    /// `ip:port`, the registry uniqueness key.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.ip, self.port)
    }
}

/// Everything the node tracks about one peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerRecord {
    pub ip: String,
    pub port: u16,
    pub chord_id: ChordId,
    /// Hex SEC1 public key, when learned through authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    pub promised_capacity: u64,
    pub current_load: u64,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub misbehavior_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarantine_until: Option<DateTime<Utc>>,
}

impl PeerRecord {
    pub fn addr(&self) -> PeerAddr {
        PeerAddr {
            ip: self.ip.clone(),
            port: self.port,
            chord_id: self.chord_id,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Registration awaiting its signed challenge.
struct PendingChallenge {
    public_key: String,
    challenge: String,
}

/// Why an authentication attempt was refused.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    /// No `register` call preceded this `authenticate`.
    #[error("peer not registered")]
    NotRegistered,
    /// The signature over the challenge did not verify.
    #[error("authentication failed")]
    BadSignature,
}

struct RegistryInner {
    peers: HashMap<String, PeerRecord>,
    pending: HashMap<String, PendingChallenge>,
}

/// Authenticated membership table. Self is always a member.
pub struct PeerRegistry {
    self_addr: PeerAddr,
    inner: Mutex<RegistryInner>,
}

impl PeerRegistry {
    pub fn new(self_addr: PeerAddr, promised_capacity: u64) -> Self {
        let self_record = PeerRecord {
            ip: self_addr.ip.clone(),
            port: self_addr.port,
            chord_id: self_addr.chord_id,
            public_key: None,
            promised_capacity,
            current_load: 0,
            last_seen: Utc::now(),
            misbehavior_count: 0,
            quarantine_until: None,
        };
        let mut peers = HashMap::new();
        peers.insert(self_addr.endpoint(), self_record);
        Self {
            self_addr,
            inner: Mutex::new(RegistryInner {
                peers,
                pending: HashMap::new(),
            }),
        }
    }

    pub fn self_addr(&self) -> &PeerAddr {
        &self.self_addr
    }

    /// Sets the public key advertised for self (published via gossip).
    pub fn set_self_public_key(&self, public_key: String) {
        let mut inner = self.inner.lock();
        if let Some(me) = inner.peers.get_mut(&self.self_addr.endpoint()) {
            me.public_key = Some(public_key);
        }
    }

    /// Begins the handshake: records the claimed identity + key and
    /// returns a fresh 16-character challenge.
    pub fn register(&self, ip: &str, port: u16, public_key: String) -> String {
        let challenge: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(CHALLENGE_LEN)
            .map(char::from)
            .collect();
        let endpoint = format!("{}:{}", ip, port);
        info!("registration from {}, challenge issued", endpoint);
        self.inner.lock().pending.insert(
            endpoint,
            PendingChallenge {
                public_key,
                challenge: challenge.clone(),
            },
        );
        challenge
    }

    /// Finishes the handshake: verifies the ECDSA/SHA-256 signature over
    /// the challenge. On success the peer enters the table with
    /// `current_load = 0`; on failure the pending entry stays so the
    /// peer may retry.
    pub fn authenticate(
        &self,
        ip: &str,
        port: u16,
        signature_hex: &str,
        promised_capacity: u64,
    ) -> Result<(), AuthError> {
        let endpoint = format!("{}:{}", ip, port);
        let mut inner = self.inner.lock();
        let pending = inner.pending.get(&endpoint).ok_or(AuthError::NotRegistered)?;

        // The signed bytes are the SHA-256 digest of the challenge text.
        let digest = Sha256::digest(pending.challenge.as_bytes());
        if !verify_hex(&pending.public_key, digest.as_slice(), signature_hex) {
            warn!("signature invalid for {}", endpoint);
            return Err(AuthError::BadSignature);
        }

        let public_key = pending.public_key.clone();
        inner.pending.remove(&endpoint);
        let record = PeerRecord {
            ip: ip.to_string(),
            port,
            chord_id: ChordId::of_endpoint(ip, port),
            public_key: Some(public_key),
            promised_capacity,
            current_load: 0,
            last_seen: Utc::now(),
            misbehavior_count: 0,
            quarantine_until: None,
        };
        info!("peer {} authenticated", endpoint);
        inner.peers.insert(endpoint, record);
        Ok(())
    }

    /// Authoritative self-update gossiped by the peer itself. Counters
    /// and quarantine state are local judgements and are preserved.
    pub fn update_peer(&self, record: PeerRecord) {
        let mut inner = self.inner.lock();
        let endpoint = record.endpoint();
        match inner.peers.get_mut(&endpoint) {
            Some(existing) => {
                existing.public_key = record.public_key.or(existing.public_key.take());
                existing.promised_capacity = record.promised_capacity;
                existing.current_load = record.current_load;
                existing.last_seen = Utc::now();
            }
            None => {
                inner.peers.insert(endpoint, record);
            }
        }
    }

    /// Gossip merge: inserts only peers not already present.
    pub fn merge_peers(&self, records: Vec<PeerRecord>) {
        let mut inner = self.inner.lock();
        for record in records {
            let endpoint = record.endpoint();
            if !inner.peers.contains_key(&endpoint) {
                debug!("learned peer {} via gossip", endpoint);
                inner.peers.insert(endpoint, record);
            }
        }
    }

    /// All known peers, self included.
    pub fn peer_list(&self) -> Vec<PeerRecord> {
        self.inner.lock().peers.values().cloned().collect()
    }

    /// All peers except self.
    pub fn other_peers(&self) -> Vec<PeerRecord> {
        let me = self.self_addr.endpoint();
        self.inner
            .lock()
            .peers
            .values()
            .filter(|p| p.endpoint() != me)
            .cloned()
            .collect()
    }

    pub fn get(&self, endpoint: &str) -> Option<PeerRecord> {
        self.inner.lock().peers.get(endpoint).cloned()
    }

    /// Looks up the public key a peer proved during authentication.
    pub fn public_key_of(&self, endpoint: &str) -> Option<String> {
        self.inner
            .lock()
            .peers
            .get(endpoint)
            .and_then(|p| p.public_key.clone())
    }

    pub fn self_record(&self) -> PeerRecord {
        self.inner
            .lock()
            .peers
            .get(&self.self_addr.endpoint())
            .cloned()
            .unwrap_or_else(|| PeerRecord {
                ip: self.self_addr.ip.clone(),
                port: self.self_addr.port,
                chord_id: self.self_addr.chord_id,
                public_key: None,
                promised_capacity: 0,
                current_load: 0,
                last_seen: Utc::now(),
                misbehavior_count: 0,
                quarantine_until: None,
            })
    }

    /// Updates self load/capacity, for `/status` and gossip.
    pub fn update_self(&self, promised_capacity: u64, current_load: u64) {
        let mut inner = self.inner.lock();
        if let Some(me) = inner.peers.get_mut(&self.self_addr.endpoint()) {
            me.promised_capacity = promised_capacity;
            me.current_load = current_load;
            me.last_seen = Utc::now();
        }
    }

    pub fn mark_seen(&self, endpoint: &str) {
        let mut inner = self.inner.lock();
        if let Some(peer) = inner.peers.get_mut(endpoint) {
            peer.last_seen = Utc::now();
        }
    }

    /// Records a strike against a peer; at the threshold the peer is
    /// quarantined for [`QUARANTINE_SECS`].
    pub fn mark_misbehavior(&self, endpoint: &str) {
        let mut inner = self.inner.lock();
        if let Some(peer) = inner.peers.get_mut(endpoint) {
            peer.misbehavior_count += 1;
            if peer.misbehavior_count >= MISBEHAVIOR_THRESHOLD {
                let until = Utc::now() + Duration::seconds(QUARANTINE_SECS);
                warn!(
                    "peer {} quarantined until {} ({} strikes)",
                    endpoint, until, peer.misbehavior_count
                );
                peer.quarantine_until = Some(until);
            }
        }
    }

    /// Whether outbound calls to this peer are currently suppressed.
    pub fn is_quarantined(&self, endpoint: &str) -> bool {
        let inner = self.inner.lock();
        match inner.peers.get(endpoint).and_then(|p| p.quarantine_until) {
            Some(until) => Utc::now() < until,
            None => false,
        }
    }

    /// Drops a peer entirely (unreachable past recovery, or operator
    /// action).
    pub fn remove(&self, endpoint: &str) -> Option<PeerRecord> {
        self.inner.lock().peers.remove(endpoint)
    }
}
