//! # Xorline
//!
//! A Kademlia DHT node core: the XOR-metric routing table organized as
//! k-buckets with deferred insertion, the in-flight request supervisor that
//! enforces liveness timeouts, and the listener and maintenance loops that
//! keep an eventually-consistent view of nearby peers under message loss and
//! churn.
//!
//! ```no_run
//! use xorline::{Config, Node};
//!
//! let node = Node::new(Config::default()).unwrap();
//! let peers = node.lookup(node.id());
//! node.shutdown();
//! ```

mod closest;
mod common;
mod error;
mod lookup;

pub mod config;
pub mod kbucket;
pub mod messages;
pub mod node;
pub mod routing_table;
pub mod socket;
pub mod supervisor;

pub use crate::common::{Id, Peer, ID_BITS, ID_SIZE};
pub use config::Config;
pub use error::Error;
pub use node::Node;
pub use routing_table::RoutingTable;
pub use supervisor::Supervisor;

// Alias Result to be the crate Result.
pub type Result<T, E = error::Error> = core::result::Result<T, E>;
