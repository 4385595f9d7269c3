//! Gossip Wire Protocol
//!
//! Six message kinds share a single envelope: a one-byte type tag followed
//! by a bincode-encoded body. A network payload may carry several messages
//! back to back; [`Message::decode_all`] consumes until the payload is
//! exhausted.
//!
//! An `Init` must be the first message on every connection and must never
//! recur; the engine enforces that, not the codec.

use serde::{Deserialize, Serialize};
use std::io::Read;

use super::types::{NodeAddress, Payload, Uid};

/// Current protocol version, carried in every handshake.
pub const PROTOCOL_VERSION: u32 = 1;

const TAG_INIT: u8 = 0x01;
const TAG_KEYS: u8 = 0x02;
const TAG_QUERY: u8 = 0x03;
const TAG_NODES: u8 = 0x04;
const TAG_FETCH: u8 = 0x05;
const TAG_DATA: u8 = 0x06;

/// Connection handshake: who the sender is and how to reach it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Handshake {
    pub version: u32,
    pub node_id: Uid,
    pub node: NodeAddress,
}

/// One key advertisement: the value's id, the publisher's addresses, and
/// the remaining lifetime. A `ttl_ms` of zero is a retraction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyItem {
    pub key: String,
    pub id: Uid,
    pub addrs: NodeAddress,
    pub ttl_ms: u32,
}

/// One node advertisement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeItem {
    pub id: Uid,
    pub addrs: NodeAddress,
    pub ttl_ms: u32,
}

/// One value request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FetchItem {
    pub key: String,
    pub id: Uid,
}

/// One value reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataItem {
    pub key: String,
    pub id: Uid,
    pub payload: Payload,
}

/// The wire protocol for inter-node gossip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Handshake; first message on every connection.
    Init(Handshake),
    /// Key advertisements.
    Keys(Vec<KeyItem>),
    /// Key requests; answered with a `Keys` message.
    Query(Vec<String>),
    /// Node advertisements.
    Nodes(Vec<NodeItem>),
    /// Value requests; answered with a `Data` message by the publisher.
    Fetch(Vec<FetchItem>),
    /// Value replies.
    Data(Vec<DataItem>),
}

/// Codec failures. Any of these closes the offending connection.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("unknown message tag {0:#04x}")]
    UnknownTag(u8),

    #[error("truncated message")]
    Truncated,

    #[error("malformed message body: {0}")]
    Body(#[from] bincode::Error),
}

impl Message {
    fn tag(&self) -> u8 {
        match self {
            Message::Init(_) => TAG_INIT,
            Message::Keys(_) => TAG_KEYS,
            Message::Query(_) => TAG_QUERY,
            Message::Nodes(_) => TAG_NODES,
            Message::Fetch(_) => TAG_FETCH,
            Message::Data(_) => TAG_DATA,
        }
    }

    /// Append this message (tag byte plus body) to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        buf.push(self.tag());
        match self {
            Message::Init(body) => bincode::serialize_into(&mut *buf, body)?,
            Message::Keys(body) => bincode::serialize_into(&mut *buf, body)?,
            Message::Query(body) => bincode::serialize_into(&mut *buf, body)?,
            Message::Nodes(body) => bincode::serialize_into(&mut *buf, body)?,
            Message::Fetch(body) => bincode::serialize_into(&mut *buf, body)?,
            Message::Data(body) => bincode::serialize_into(&mut *buf, body)?,
        }
        Ok(())
    }

    /// Encode several messages into one network payload, back to back.
    pub fn encode_batch(msgs: &[Message]) -> Result<Vec<u8>, WireError> {
        let mut buf = Vec::new();
        for msg in msgs {
            msg.encode_into(&mut buf)?;
        }
        Ok(buf)
    }

    /// Decode every message in a payload. Trailing bytes that do not form
    /// a complete message are an error, never silently ignored.
    pub fn decode_all(payload: &[u8]) -> Result<Vec<Message>, WireError> {
        let mut cursor = std::io::Cursor::new(payload);
        let mut out = Vec::new();

        while (cursor.position() as usize) < payload.len() {
            let mut tag = [0u8; 1];
            cursor
                .read_exact(&mut tag)
                .map_err(|_| WireError::Truncated)?;

            let msg = match tag[0] {
                TAG_INIT => Message::Init(bincode::deserialize_from(&mut cursor)?),
                TAG_KEYS => Message::Keys(bincode::deserialize_from(&mut cursor)?),
                TAG_QUERY => Message::Query(bincode::deserialize_from(&mut cursor)?),
                TAG_NODES => Message::Nodes(bincode::deserialize_from(&mut cursor)?),
                TAG_FETCH => Message::Fetch(bincode::deserialize_from(&mut cursor)?),
                TAG_DATA => Message::Data(bincode::deserialize_from(&mut cursor)?),
                tag => return Err(WireError::UnknownTag(tag)),
            };
            out.push(msg);
        }

        Ok(out)
    }
}
