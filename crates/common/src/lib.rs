//! # edgemesh-common
//!
//! Domain types shared by every Edgemesh component: ring identifiers,
//! canonical signing form, the node keypair, resource offers and DHT
//! update envelopes, task descriptors, and the accounting journal.
//!
//! Everything here is network-free and synchronous; the node crate owns
//! all I/O except the journal's append-only file.

pub mod canonical;
pub mod error;
pub mod identity;
pub mod journal;
pub mod offer;
pub mod ring;
pub mod task;

pub use canonical::canonical_json;
pub use error::CommonError;
pub use identity::{verify_hex, NodeKeypair};
pub use journal::{Journal, JournalEntry};
pub use offer::{DhtUpdate, PricingParameters, ResourceOffer, SystemStats};
pub use ring::{is_between, ChordId, ID_SIZE, RING_BITS};
pub use task::{
    DockerPayload, ResourceRequirements, TaskDescriptor, TaskPayload, TaskResult,
};
