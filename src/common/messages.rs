//! Wire codec for the protocol messages.
//!
//! Every message is a single frame: one type byte followed by a fixed
//! binary body. Framing itself belongs to the peer link, which delivers
//! whole frames; the codec only validates and (de)serializes bodies.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::common::{Id, MessageId, Record, ID_LENGTH, MAX_BUCKET_SIZE_K, MESSAGE_ID_LENGTH};

const PING: u8 = 0x01;
const PONG: u8 = 0x02;
const FIND_NODE: u8 = 0x03;
const FIND_NODE_RESPONSE: u8 = 0x04;
const STORE: u8 = 0x05;
const FIND_VALUE: u8 = 0x06;
const FIND_VALUE_RESPONSE: u8 = 0x07;
const STORE_ACK: u8 = 0x08;
const HAS_VALUE: u8 = 0x09;
const HAS_VALUE_RESPONSE: u8 = 0x0A;

const SIGNAL_OFFER: u8 = 0xF0;
const SIGNAL_ICE: u8 = 0xF2;

/// Upper bound on an encoded record payload. Larger STORE bodies are
/// rejected at decode before the JSON parser sees them.
pub const MAX_RECORD_PAYLOAD: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
/// A decoded protocol message.
pub enum Message {
    Ping {
        node_id: Id,
    },
    Pong {
        node_id: Id,
    },
    FindNode {
        msg_id: MessageId,
        target: Id,
    },
    FindNodeResponse {
        msg_id: MessageId,
        nodes: Vec<Id>,
    },
    Store {
        msg_id: MessageId,
        key: Id,
        record: Record,
    },
    FindValue {
        msg_id: MessageId,
        key: Id,
    },
    FindValueResponse {
        msg_id: MessageId,
        result: FindValueResult,
    },
    StoreAck {
        msg_id: MessageId,
    },
    HasValue {
        msg_id: MessageId,
        key: Id,
    },
    HasValueResponse {
        msg_id: MessageId,
        has: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Body of a FIND_VALUE response: either the record, or the responder's
/// closest known nodes to the key.
pub enum FindValueResult {
    Found(Record),
    Nodes(Vec<Id>),
}

#[derive(thiserror::Error, Debug)]
/// Errors decoding (or, for record payloads, encoding) a frame.
pub enum DecodeError {
    #[error("empty frame")]
    Empty,

    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),

    #[error("truncated frame")]
    Truncated,

    #[error("{0} trailing bytes after message body")]
    Trailing(usize),

    #[error("node count {0} exceeds the reply cap")]
    CountTooLarge(u8),

    #[error("record payload of {0} bytes exceeds the maximum")]
    RecordTooLarge(usize),

    #[error("invalid flag byte {0:#04x}")]
    InvalidFlag(u8),

    #[error("invalid record payload: {0}")]
    Record(#[from] serde_json::Error),
}

/// True for the transport-private signalling frames (offer/answer/ice),
/// which are forwarded opaquely and never decoded.
pub fn is_signal(frame: &[u8]) -> bool {
    matches!(frame.first(), Some(&t) if (SIGNAL_OFFER..=SIGNAL_ICE).contains(&t))
}

impl Message {
    /// Encode into a single frame.
    ///
    /// Node lists are capped at [MAX_BUCKET_SIZE_K] so the one-byte count
    /// field can never overflow.
    pub fn to_bytes(&self) -> Result<Bytes, DecodeError> {
        let mut buf = BytesMut::with_capacity(64);

        match self {
            Message::Ping { node_id } => {
                buf.put_u8(PING);
                buf.put_slice(node_id.as_bytes());
            }
            Message::Pong { node_id } => {
                buf.put_u8(PONG);
                buf.put_slice(node_id.as_bytes());
            }
            Message::FindNode { msg_id, target } => {
                buf.put_u8(FIND_NODE);
                buf.put_slice(msg_id.as_bytes());
                buf.put_slice(target.as_bytes());
            }
            Message::FindNodeResponse { msg_id, nodes } => {
                buf.put_u8(FIND_NODE_RESPONSE);
                buf.put_slice(msg_id.as_bytes());
                put_nodes(&mut buf, nodes);
            }
            Message::Store {
                msg_id,
                key,
                record,
            } => {
                buf.put_u8(STORE);
                buf.put_slice(msg_id.as_bytes());
                buf.put_slice(key.as_bytes());
                put_record(&mut buf, record)?;
            }
            Message::FindValue { msg_id, key } => {
                buf.put_u8(FIND_VALUE);
                buf.put_slice(msg_id.as_bytes());
                buf.put_slice(key.as_bytes());
            }
            Message::FindValueResponse { msg_id, result } => {
                buf.put_u8(FIND_VALUE_RESPONSE);
                buf.put_slice(msg_id.as_bytes());
                match result {
                    FindValueResult::Found(record) => {
                        buf.put_u8(1);
                        put_record(&mut buf, record)?;
                    }
                    FindValueResult::Nodes(nodes) => {
                        buf.put_u8(0);
                        put_nodes(&mut buf, nodes);
                    }
                }
            }
            Message::StoreAck { msg_id } => {
                buf.put_u8(STORE_ACK);
                buf.put_slice(msg_id.as_bytes());
            }
            Message::HasValue { msg_id, key } => {
                buf.put_u8(HAS_VALUE);
                buf.put_slice(msg_id.as_bytes());
                buf.put_slice(key.as_bytes());
            }
            Message::HasValueResponse { msg_id, has } => {
                buf.put_u8(HAS_VALUE_RESPONSE);
                buf.put_slice(msg_id.as_bytes());
                buf.put_u8(u8::from(*has));
            }
        }

        Ok(buf.freeze())
    }

    /// Decode a whole frame. Fails on truncation, trailing garbage,
    /// out-of-range counts and oversized or invalid record payloads.
    pub fn from_bytes(frame: &[u8]) -> Result<Message, DecodeError> {
        let mut buf = frame;

        let message_type = if buf.has_remaining() {
            buf.get_u8()
        } else {
            return Err(DecodeError::Empty);
        };

        let message = match message_type {
            PING => Message::Ping {
                node_id: get_id(&mut buf)?,
            },
            PONG => Message::Pong {
                node_id: get_id(&mut buf)?,
            },
            FIND_NODE => Message::FindNode {
                msg_id: get_msg_id(&mut buf)?,
                target: get_id(&mut buf)?,
            },
            FIND_NODE_RESPONSE => Message::FindNodeResponse {
                msg_id: get_msg_id(&mut buf)?,
                nodes: get_nodes(&mut buf)?,
            },
            STORE => Message::Store {
                msg_id: get_msg_id(&mut buf)?,
                key: get_id(&mut buf)?,
                record: get_record(&mut buf)?,
            },
            FIND_VALUE => Message::FindValue {
                msg_id: get_msg_id(&mut buf)?,
                key: get_id(&mut buf)?,
            },
            FIND_VALUE_RESPONSE => {
                let msg_id = get_msg_id(&mut buf)?;
                let found = get_flag(&mut buf)?;

                let result = if found {
                    FindValueResult::Found(get_record(&mut buf)?)
                } else {
                    FindValueResult::Nodes(get_nodes(&mut buf)?)
                };

                Message::FindValueResponse { msg_id, result }
            }
            STORE_ACK => Message::StoreAck {
                msg_id: get_msg_id(&mut buf)?,
            },
            HAS_VALUE => Message::HasValue {
                msg_id: get_msg_id(&mut buf)?,
                key: get_id(&mut buf)?,
            },
            HAS_VALUE_RESPONSE => Message::HasValueResponse {
                msg_id: get_msg_id(&mut buf)?,
                has: get_flag(&mut buf)?,
            },
            other => return Err(DecodeError::UnknownType(other)),
        };

        if buf.has_remaining() {
            return Err(DecodeError::Trailing(buf.remaining()));
        }

        Ok(message)
    }
}

fn put_nodes(buf: &mut BytesMut, nodes: &[Id]) {
    let capped = &nodes[..nodes.len().min(MAX_BUCKET_SIZE_K)];

    buf.put_u8(capped.len() as u8);
    for node in capped {
        buf.put_slice(node.as_bytes());
    }
}

fn put_record(buf: &mut BytesMut, record: &Record) -> Result<(), DecodeError> {
    let payload = serde_json::to_vec(record)?;
    if payload.len() > MAX_RECORD_PAYLOAD {
        return Err(DecodeError::RecordTooLarge(payload.len()));
    }

    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);

    Ok(())
}

fn get_id(buf: &mut &[u8]) -> Result<Id, DecodeError> {
    if buf.remaining() < ID_LENGTH {
        return Err(DecodeError::Truncated);
    }

    let mut bytes = [0u8; ID_LENGTH];
    buf.copy_to_slice(&mut bytes);

    Ok(Id(bytes))
}

fn get_msg_id(buf: &mut &[u8]) -> Result<MessageId, DecodeError> {
    if buf.remaining() < MESSAGE_ID_LENGTH {
        return Err(DecodeError::Truncated);
    }

    let mut bytes = [0u8; MESSAGE_ID_LENGTH];
    buf.copy_to_slice(&mut bytes);

    Ok(MessageId::from_bytes(bytes))
}

fn get_flag(buf: &mut &[u8]) -> Result<bool, DecodeError> {
    if !buf.has_remaining() {
        return Err(DecodeError::Truncated);
    }

    match buf.get_u8() {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(DecodeError::InvalidFlag(other)),
    }
}

fn get_nodes(buf: &mut &[u8]) -> Result<Vec<Id>, DecodeError> {
    if !buf.has_remaining() {
        return Err(DecodeError::Truncated);
    }

    let count = buf.get_u8();
    if count as usize > MAX_BUCKET_SIZE_K {
        return Err(DecodeError::CountTooLarge(count));
    }

    let mut nodes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        nodes.push(get_id(buf)?);
    }

    Ok(nodes)
}

fn get_record(buf: &mut &[u8]) -> Result<Record, DecodeError> {
    if buf.remaining() < 4 {
        return Err(DecodeError::Truncated);
    }

    let len = buf.get_u32() as usize;
    if len > MAX_RECORD_PAYLOAD {
        return Err(DecodeError::RecordTooLarge(len));
    }
    if buf.remaining() < len {
        return Err(DecodeError::Truncated);
    }

    let record = serde_json::from_slice(&buf[..len])?;
    buf.advance(len);

    Ok(record)
}
