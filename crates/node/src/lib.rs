//! # edgemesh-node
//!
//! The running marketplace node: authenticated peer registry, Chord
//! overlay, offer DHT, resource monitor, auction scheduler, task
//! executor, and the HTTP boundary tying them together.

pub mod chord;
pub mod cli;
pub mod dht;
pub mod executor;
pub mod gossip;
pub mod handlers;
pub mod monitor;
pub mod offers;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod transport;

pub use chord::{ChordOverlay, OverlayClient, TransportError};
pub use dht::{DhtError, DhtStore};
pub use handlers::build_router;
pub use monitor::ResourceMonitor;
pub use registry::{PeerAddr, PeerRecord, PeerRegistry};
pub use state::{Node, NodeConfig};
