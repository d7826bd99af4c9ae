//! Wire messages and their encoding.
//!
//! One message per UDP datagram; the datagram boundary is the length framing.
//! The payload is a single bencoded dictionary:
//!
//! - `s`: 20-byte sender id
//! - `t`: 8-byte big-endian correlation token
//! - `y`: message kind tag (`pi` PING, `po` PONG, `fn` FIND_NODE, `no` NODES)
//! - `d`: 20-byte target id (FIND_NODE only)
//! - `n`: concatenated compact peers (NODES only), 26 bytes each:
//!   20-byte id, 4-byte IPv4 address, 2-byte big-endian port.

mod internal;

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::common::{Id, Peer, ID_SIZE};
use crate::{Error, Result};

use self::internal::{WireBody, WireMessage};

/// One compact peer: id + IPv4 address + port.
const COMPACT_PEER_LEN: usize = ID_SIZE + 6;

#[derive(Debug, Clone, PartialEq)]
/// A single peer-to-peer frame.
pub struct Message {
    /// Self-declared id of the sending node.
    pub sender_id: Id,
    /// Correlation token tying a response to the request that elicited it.
    pub token: u64,
    pub kind: MessageKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    /// Liveness probe.
    Ping,
    /// Reply to [MessageKind::Ping], same token.
    Pong,
    /// Ask for the k closest known peers to `target`.
    FindNode { target: Id },
    /// Reply to [MessageKind::FindNode], same token, at most k peers.
    Nodes { peers: Vec<Peer> },
}

impl MessageKind {
    /// Short tag used in log records.
    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::FindNode { .. } => "find_node",
            MessageKind::Nodes { .. } => "nodes",
        }
    }

    /// Responses are dispatched through the supervisor; requests are answered
    /// directly by the listener.
    pub fn is_response(&self) -> bool {
        matches!(self, MessageKind::Pong | MessageKind::Nodes { .. })
    }
}

impl Message {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let body = match &self.kind {
            MessageKind::Ping => WireBody::Ping,
            MessageKind::Pong => WireBody::Pong,
            MessageKind::FindNode { target } => WireBody::FindNode { target: target.0 },
            MessageKind::Nodes { peers } => WireBody::Nodes {
                peers: encode_compact_peers(peers),
            },
        };

        let wire = WireMessage {
            sender_id: self.sender_id.0,
            token: self.token.to_be_bytes(),
            body,
        };

        Ok(serde_bencode::to_bytes(&wire)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Message> {
        let wire: WireMessage = serde_bencode::from_bytes(bytes)?;

        let kind = match wire.body {
            WireBody::Ping => MessageKind::Ping,
            WireBody::Pong => MessageKind::Pong,
            WireBody::FindNode { target } => MessageKind::FindNode {
                target: Id(target),
            },
            WireBody::Nodes { peers } => MessageKind::Nodes {
                peers: decode_compact_peers(&peers)?,
            },
        };

        Ok(Message {
            sender_id: Id(wire.sender_id),
            token: u64::from_be_bytes(wire.token),
            kind,
        })
    }
}

fn encode_compact_peers(peers: &[Peer]) -> serde_bytes::ByteBuf {
    let mut bytes = Vec::with_capacity(peers.len() * COMPACT_PEER_LEN);

    for peer in peers {
        bytes.extend_from_slice(peer.id().as_bytes());
        bytes.extend_from_slice(&peer.address().ip().octets());
        bytes.extend_from_slice(&peer.address().port().to_be_bytes());
    }

    serde_bytes::ByteBuf::from(bytes)
}

fn decode_compact_peers(bytes: &[u8]) -> Result<Vec<Peer>> {
    if bytes.len() % COMPACT_PEER_LEN != 0 {
        return Err(Error::InvalidCompactPeers(bytes.len()));
    }

    let mut peers = Vec::with_capacity(bytes.len() / COMPACT_PEER_LEN);

    for chunk in bytes.chunks_exact(COMPACT_PEER_LEN) {
        let id = Id::from_bytes(&chunk[..ID_SIZE])?;
        let ip = Ipv4Addr::new(chunk[ID_SIZE], chunk[ID_SIZE + 1], chunk[ID_SIZE + 2], chunk[ID_SIZE + 3]);
        let port = u16::from_be_bytes([chunk[ID_SIZE + 4], chunk[ID_SIZE + 5]]);

        peers.push(Peer::new(id, SocketAddrV4::new(ip, port)));
    }

    Ok(peers)
}
