//! # Overline
//!
//! A Kademlia-style distributed hash table over a host-provided peer
//! link.
//!
//! The transport is abstracted behind [PeerLink]: anything that delivers
//! whole frames between identified peers and reports their arrival and
//! departure can carry the overlay. On top of it the node maintains a
//! routing table of k-buckets, answers the wire protocol, runs iterative
//! lookups, and keeps a replicated, time-bounded value store with
//! quorum-based publishing, republish and repair.
//!
//! ```no_run
//! use overline::{Config, Dht, PeerLink};
//!
//! fn start(link: Box<dyn PeerLink>) -> overline::Result<()> {
//!     let node = Dht::new(Config::default(), link);
//!
//!     node.store(b"hello", b"world")?;
//!     let value = node.get(b"hello")?;
//!     assert_eq!(value.as_deref(), Some(&b"world"[..]));
//!
//!     Ok(())
//! }
//! ```

mod actor;
mod common;
mod core;
mod error;

#[cfg(feature = "async")]
pub mod async_dht;
pub mod dht;

pub use crate::actor::config::{Config, DEFAULT_PROBE_TIMEOUT, DEFAULT_REQUEST_TIMEOUT, DEFAULT_STORE_TTL};
pub use crate::actor::link::{LinkEvent, NodeHooks, NoopHooks, PeerLink};
pub use crate::actor::Info;
pub use crate::common::{
    key_id, messages, Id, MessageId, Record, RoutingTable, BUCKET_COUNT, ID_LENGTH,
    MAX_BUCKET_SIZE_K,
};
pub use crate::core::{StoreError, ALPHA, MAX_DIALS, WRITE_QUORUM};
pub use dht::Dht;
pub use error::Error;

/// Alias Result to be the crate Result.
pub type Result<T, E = Error> = std::result::Result<T, E>;
