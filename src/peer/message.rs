//! The peer-wire message codec: the full BEP-3 + BEP-6 (Fast Extension) +
//! BEP-10 (LTEP) message type table over a length-prefixed frame.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::WireError;

/// Cap on an inbound frame length, guarding against a peer claiming an
/// absurd length prefix (teacher's `MAX` in `messages/mod.rs`, carried
/// forward unchanged).
const MAX_FRAME_LEN: u32 = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield { raw: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port { port: u16 },
    // BEP-6 Fast Extension
    Suggest { piece: u32 },
    HaveAll,
    HaveNone,
    Reject { index: u32, begin: u32, length: u32 },
    AllowedFast { piece: u32 },
    // BEP-10 Extension Protocol
    Extended { id: u8, payload: Vec<u8> },
}

const ID_CHOKE: u8 = 0;
const ID_UNCHOKE: u8 = 1;
const ID_INTERESTED: u8 = 2;
const ID_NOT_INTERESTED: u8 = 3;
const ID_HAVE: u8 = 4;
const ID_BITFIELD: u8 = 5;
const ID_REQUEST: u8 = 6;
const ID_PIECE: u8 = 7;
const ID_CANCEL: u8 = 8;
const ID_PORT: u8 = 9;
const ID_SUGGEST: u8 = 13;
const ID_HAVE_ALL: u8 = 14;
const ID_HAVE_NONE: u8 = 15;
const ID_REJECT: u8 = 16;
const ID_ALLOWED_FAST: u8 = 17;
const ID_EXTENDED: u8 = 20;

impl PeerMessage {
    fn id(&self) -> Option<u8> {
        match self {
            PeerMessage::KeepAlive => None,
            PeerMessage::Choke => Some(ID_CHOKE),
            PeerMessage::Unchoke => Some(ID_UNCHOKE),
            PeerMessage::Interested => Some(ID_INTERESTED),
            PeerMessage::NotInterested => Some(ID_NOT_INTERESTED),
            PeerMessage::Have { .. } => Some(ID_HAVE),
            PeerMessage::Bitfield { .. } => Some(ID_BITFIELD),
            PeerMessage::Request { .. } => Some(ID_REQUEST),
            PeerMessage::Piece { .. } => Some(ID_PIECE),
            PeerMessage::Cancel { .. } => Some(ID_CANCEL),
            PeerMessage::Port { .. } => Some(ID_PORT),
            PeerMessage::Suggest { .. } => Some(ID_SUGGEST),
            PeerMessage::HaveAll => Some(ID_HAVE_ALL),
            PeerMessage::HaveNone => Some(ID_HAVE_NONE),
            PeerMessage::Reject { .. } => Some(ID_REJECT),
            PeerMessage::AllowedFast { .. } => Some(ID_ALLOWED_FAST),
            PeerMessage::Extended { .. } => Some(ID_EXTENDED),
        }
    }
}

pub struct PeerMessageCodec;

impl Encoder<PeerMessage> for PeerMessageCodec {
    type Error = WireError;

    fn encode(&mut self, item: PeerMessage, dst: &mut BytesMut) -> Result<(), WireError> {
        let Some(id) = item.id() else {
            dst.extend_from_slice(&0u32.to_be_bytes());
            return Ok(());
        };

        let mut payload = Vec::new();
        match &item {
            PeerMessage::Choke
            | PeerMessage::Unchoke
            | PeerMessage::Interested
            | PeerMessage::NotInterested
            | PeerMessage::HaveAll
            | PeerMessage::HaveNone => {}
            PeerMessage::Have { piece } | PeerMessage::Suggest { piece } | PeerMessage::AllowedFast { piece } => {
                payload.extend_from_slice(&piece.to_be_bytes());
            }
            PeerMessage::Bitfield { raw } => payload.extend_from_slice(raw),
            PeerMessage::Request { index, begin, length }
            | PeerMessage::Cancel { index, begin, length }
            | PeerMessage::Reject { index, begin, length } => {
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
            }
            PeerMessage::Piece { index, begin, block } => {
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(block);
            }
            PeerMessage::Port { port } => payload.extend_from_slice(&port.to_be_bytes()),
            PeerMessage::Extended { id: ext_id, payload: ext_payload } => {
                payload.push(*ext_id);
                payload.extend_from_slice(ext_payload);
            }
            PeerMessage::KeepAlive => unreachable!("handled above"),
        }

        let length = 1 + payload.len() as u32;
        if length > MAX_FRAME_LEN {
            return Err(WireError::MsgSize {
                got: length,
                expected: None,
            });
        }

        dst.reserve(4 + length as usize);
        dst.extend_from_slice(&length.to_be_bytes());
        dst.put_u8(id);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

/// `Some(n)` if this message type has a fixed payload length, `None` if
/// its length is data-dependent (bitfield, piece, extended).
fn expected_payload_len(id: u8) -> Option<u32> {
    match id {
        ID_CHOKE | ID_UNCHOKE | ID_INTERESTED | ID_NOT_INTERESTED | ID_HAVE_ALL | ID_HAVE_NONE => Some(0),
        ID_HAVE | ID_SUGGEST | ID_ALLOWED_FAST => Some(4),
        ID_REQUEST | ID_CANCEL | ID_REJECT => Some(12),
        ID_PORT => Some(2),
        _ => None,
    }
}

impl Decoder for PeerMessageCodec {
    type Item = PeerMessage;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<PeerMessage>, WireError> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..4]);
        let length = u32::from_be_bytes(length_bytes);

        if length == 0 {
            src.advance(4);
            return Ok(Some(PeerMessage::KeepAlive));
        }

        if length > MAX_FRAME_LEN {
            return Err(WireError::MsgSize {
                got: length,
                expected: None,
            });
        }

        if (src.len() as u32) < 4 + length {
            src.reserve(4 + length as usize - src.len());
            return Ok(None);
        }

        let id = src[4];
        let payload_len = length - 1;

        if let Some(expected) = expected_payload_len(id) {
            if payload_len != expected {
                return Err(WireError::MsgSize {
                    got: payload_len,
                    expected: Some(expected),
                });
            }
        } else if id == ID_PIECE && payload_len < 8 {
            return Err(WireError::MsgSize {
                got: payload_len,
                expected: None,
            });
        } else if id == ID_EXTENDED && payload_len < 1 {
            return Err(WireError::MsgSize {
                got: payload_len,
                expected: None,
            });
        }

        let payload = src[5..4 + length as usize].to_vec();
        src.advance(4 + length as usize);

        let msg = match id {
            ID_CHOKE => PeerMessage::Choke,
            ID_UNCHOKE => PeerMessage::Unchoke,
            ID_INTERESTED => PeerMessage::Interested,
            ID_NOT_INTERESTED => PeerMessage::NotInterested,
            ID_HAVE => PeerMessage::Have { piece: be32(&payload, 0) },
            ID_BITFIELD => PeerMessage::Bitfield { raw: payload },
            ID_REQUEST => PeerMessage::Request {
                index: be32(&payload, 0),
                begin: be32(&payload, 4),
                length: be32(&payload, 8),
            },
            ID_PIECE => PeerMessage::Piece {
                index: be32(&payload, 0),
                begin: be32(&payload, 4),
                block: payload[8..].to_vec(),
            },
            ID_CANCEL => PeerMessage::Cancel {
                index: be32(&payload, 0),
                begin: be32(&payload, 4),
                length: be32(&payload, 8),
            },
            ID_PORT => PeerMessage::Port {
                port: u16::from_be_bytes([payload[0], payload[1]]),
            },
            ID_SUGGEST => PeerMessage::Suggest { piece: be32(&payload, 0) },
            ID_HAVE_ALL => PeerMessage::HaveAll,
            ID_HAVE_NONE => PeerMessage::HaveNone,
            ID_REJECT => PeerMessage::Reject {
                index: be32(&payload, 0),
                begin: be32(&payload, 4),
                length: be32(&payload, 8),
            },
            ID_ALLOWED_FAST => PeerMessage::AllowedFast { piece: be32(&payload, 0) },
            ID_EXTENDED => PeerMessage::Extended {
                id: payload[0],
                payload: payload[1..].to_vec(),
            },
            other => return Err(WireError::BadMsg(format!("unknown message id {other}"))),
        };

        Ok(Some(msg))
    }
}

fn be32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: PeerMessage) -> PeerMessage {
        let mut codec = PeerMessageCodec;
        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn keepalive_roundtrips() {
        assert_eq!(roundtrip(PeerMessage::KeepAlive), PeerMessage::KeepAlive);
    }

    #[test]
    fn request_roundtrips() {
        let req = PeerMessage::Request {
            index: 3,
            begin: 16384,
            length: 16384,
        };
        assert_eq!(roundtrip(req.clone()), req);
    }

    #[test]
    fn piece_with_two_fragments_reassembles_identically() {
        // same (index, begin) pair across two frames
        let frag1 = PeerMessage::Piece {
            index: 7,
            begin: 0,
            block: vec![0xAB; 8192],
        };
        let frag2 = PeerMessage::Piece {
            index: 7,
            begin: 8192,
            block: vec![0xCD; 8192],
        };
        assert_eq!(roundtrip(frag1.clone()), frag1);
        assert_eq!(roundtrip(frag2.clone()), frag2);
    }

    #[test]
    fn wrong_length_for_fixed_type_is_rejected() {
        let mut codec = PeerMessageCodec;
        let mut buf = BytesMut::new();
        // claim a 2-byte payload for a Have message (needs 4)
        buf.extend_from_slice(&3u32.to_be_bytes());
        buf.put_u8(ID_HAVE);
        buf.extend_from_slice(&[0u8, 1u8]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, WireError::MsgSize { .. }));
    }

    #[test]
    fn fast_extension_and_ltep_ids_roundtrip() {
        assert_eq!(roundtrip(PeerMessage::HaveAll), PeerMessage::HaveAll);
        assert_eq!(roundtrip(PeerMessage::HaveNone), PeerMessage::HaveNone);
        let ext = PeerMessage::Extended {
            id: 0,
            payload: b"d1:md11:ut_metadatai3eee".to_vec(),
        };
        assert_eq!(roundtrip(ext.clone()), ext);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = PeerMessageCodec;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());
        assert!(matches!(codec.decode(&mut buf), Err(WireError::MsgSize { .. })));
    }
}
