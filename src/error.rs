//! Main Crate Error

use crate::common::ID_SIZE;

#[derive(thiserror::Error, Debug)]
/// Xorline crate error enum.
pub enum Error {
    /// Id bytes were not exactly [ID_SIZE] long.
    #[error("Invalid id size {0}, expected {ID_SIZE} bytes")]
    InvalidIdSize(usize),

    /// Id hex string could not be parsed.
    #[error("Invalid id encoding: {0}")]
    InvalidIdEncoding(String),

    /// Compact peer list length is not a multiple of one encoded peer.
    #[error("Invalid compact peers length: {0}")]
    InvalidCompactPeers(usize),

    /// A request was registered with a correlation token that is still live.
    #[error("Correlation token {0} is already registered")]
    DuplicateToken(u64),

    /// Rejected configuration, fatal at startup.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("Failed to parse packet bytes: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),
}
