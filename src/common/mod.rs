//! Pure value types shared across the crate.

mod id;
mod peer;

pub use id::{Id, ID_BITS, ID_SIZE};
pub use peer::Peer;
