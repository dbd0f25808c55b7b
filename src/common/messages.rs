//! Encode and decode wire messages.
//!
//! One datagram is exactly one message; decoding is strict with no
//! resynchronization. The header is `message_id` and `sender_id` (raw Id
//! bytes) followed by a one-byte kind tag. A LOOKUP carries a target Id, a
//! RESPONSE carries either nothing (pong) or a little-endian u16 count of
//! packed node records, each `ip` (4 bytes, network order), `port` (u16,
//! network order) and the node's Id.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::SocketAddrV4;

use crate::common::{Id, Node, ID_SIZE};
use crate::{Error, Result};

const KIND_PING: u8 = 0;
const KIND_LOOKUP: u8 = 1;
const KIND_RESPONSE: u8 = 2;

const HEADER_SIZE: usize = ID_SIZE * 2 + 1;
/// ip (4) + port (2) + id (16)
const NODE_RECORD_SIZE: usize = 4 + 2 + ID_SIZE;

#[derive(Debug, PartialEq, Clone)]
pub struct Message {
    /// Correlation token; responses echo the request's message_id.
    pub message_id: Id,
    pub sender_id: Id,
    pub kind: MessageKind,
}

#[derive(Debug, PartialEq, Clone)]
pub enum MessageKind {
    Ping,

    Lookup(Id),

    /// An empty node list is a pong; a lookup result carries the closest
    /// nodes the responder knows about.
    Response(Vec<Node>),
}

impl Message {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.body_size());

        buf.put_slice(self.message_id.as_bytes());
        buf.put_slice(self.sender_id.as_bytes());

        match &self.kind {
            MessageKind::Ping => {
                buf.put_u8(KIND_PING);
            }
            MessageKind::Lookup(target) => {
                buf.put_u8(KIND_LOOKUP);
                buf.put_slice(target.as_bytes());
            }
            MessageKind::Response(nodes) => {
                buf.put_u8(KIND_RESPONSE);

                if !nodes.is_empty() {
                    buf.put_u16_le(nodes.len() as u16);

                    for node in nodes {
                        buf.put_slice(&node.address.ip().octets());
                        buf.put_u16(node.address.port());
                        buf.put_slice(node.id.as_bytes());
                    }
                }
            }
        }

        buf.freeze()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Message> {
        let mut buf = bytes;

        if buf.remaining() < HEADER_SIZE {
            return Err(Error::TruncatedMessage);
        }

        let message_id = read_id(&mut buf);
        let sender_id = read_id(&mut buf);

        let kind = match buf.get_u8() {
            KIND_PING => MessageKind::Ping,
            KIND_LOOKUP => {
                if buf.remaining() < ID_SIZE {
                    return Err(Error::TruncatedMessage);
                }

                MessageKind::Lookup(read_id(&mut buf))
            }
            KIND_RESPONSE => {
                // Header-only response is a pong.
                if buf.remaining() == 0 {
                    MessageKind::Response(Vec::new())
                } else {
                    if buf.remaining() < 2 {
                        return Err(Error::TruncatedMessage);
                    }

                    let count = buf.get_u16_le() as usize;

                    if buf.remaining() != count * NODE_RECORD_SIZE {
                        return Err(Error::TruncatedMessage);
                    }

                    let mut nodes = Vec::with_capacity(count);

                    for _ in 0..count {
                        let mut octets = [0_u8; 4];
                        buf.copy_to_slice(&mut octets);
                        let port = buf.get_u16();
                        let id = read_id(&mut buf);

                        nodes.push(Node::new(id, SocketAddrV4::new(octets.into(), port)));
                    }

                    MessageKind::Response(nodes)
                }
            }
            kind => return Err(Error::UnknownMessageKind(kind)),
        };

        if buf.has_remaining() {
            return Err(Error::TruncatedMessage);
        }

        Ok(Message {
            message_id,
            sender_id,
            kind,
        })
    }

    fn body_size(&self) -> usize {
        match &self.kind {
            MessageKind::Ping => 0,
            MessageKind::Lookup(_) => ID_SIZE,
            MessageKind::Response(nodes) => {
                if nodes.is_empty() {
                    0
                } else {
                    2 + nodes.len() * NODE_RECORD_SIZE
                }
            }
        }
    }
}

// Callers check `remaining` before reading; ID_SIZE bytes are present.
fn read_id(buf: &mut &[u8]) -> Id {
    let mut bytes = [0_u8; ID_SIZE];
    buf.copy_to_slice(&mut bytes);
    Id(bytes)
}
