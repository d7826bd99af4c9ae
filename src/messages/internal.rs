use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::common::ID_SIZE;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct WireMessage {
    #[serde(rename = "s", with = "serde_bytes")]
    pub sender_id: [u8; ID_SIZE],

    #[serde(rename = "t", with = "serde_bytes")]
    pub token: [u8; 8],

    #[serde(flatten)]
    pub body: WireBody,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "y")]
pub(crate) enum WireBody {
    #[serde(rename = "pi")]
    Ping,

    #[serde(rename = "po")]
    Pong,

    #[serde(rename = "fn")]
    FindNode {
        #[serde(rename = "d", with = "serde_bytes")]
        target: [u8; ID_SIZE],
    },

    #[serde(rename = "no")]
    Nodes {
        #[serde(rename = "n")]
        peers: ByteBuf,
    },
}
