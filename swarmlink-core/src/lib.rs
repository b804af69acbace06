//! Swarm messaging client core.
//! Host-driven: no I/O and no async runtime. The host owns sockets, timers and clocks,
//! feeds results in and executes what the core decides.

pub mod codec;
pub mod directory;
pub mod error;
pub mod identity;
pub mod inbox;
pub mod message;
pub mod node;
pub mod onion;
pub mod path;
pub mod pow;
pub mod presence;
pub mod store;

pub use codec::{unwrap, wrap, AddressMessage, CodecError, Envelope, EnvelopeKind};
pub use directory::{DirectoryConfig, Eviction, NodeDirectory};
pub use error::{classify_status, NodeError};
pub use identity::{IdentityProvider, Keypair, PublicKey};
pub use inbox::{Cursor, CursorStore, ReceivedHashes};
pub use message::{OutgoingMessage, RawMessage, RpcMethod, StampedMessage};
pub use node::{KeySet, Node, Path};
pub use onion::{OnionError, OnionResponse};
pub use path::{PathCache, PathConfig, PathError};
pub use pow::{Difficulty, PowError};
pub use presence::{PeerInfo, PeerState, PresenceAction, PresenceTracker};
pub use store::{KeyValueStore, MemoryStore, StoreError};
