//! Swarm messaging client runtime for Linux: the async network service (pool, swarms,
//! onion paths, RPC execution), send pipeline, poller, presence manager, P2P listener
//! and file-backed persistence.

pub mod config;
mod directory;
pub mod executor;
pub mod network;
pub mod p2p;
mod paths;
pub mod poller;
pub mod presence;
pub mod send;
pub mod store;

#[cfg(test)]
mod testing;

pub use network::{Network, NetworkConfig};
pub use poller::{PollStrategy, Poller, PollerConfig, PollerHandle};
pub use presence::{Delivery, PresenceConfig, PresenceManager};
pub use send::{Quorum, SendConfig, SendOutcome, SendPipeline};
pub use store::FileStore;
