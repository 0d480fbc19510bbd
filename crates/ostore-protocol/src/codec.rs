use bytes::Bytes;

use crate::chunk::{ChunkHeader, CHUNK_HEADER_LEN};
use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{StoreMessage, MAX_MESSAGE_SIZE};

const TAG_PUT_CHUNK: u8 = 10;
const TAG_CHUNK_DATA: u8 = 23;

/// Codec for encoding/decoding ostore protocol messages.
pub struct StoreCodec;

impl StoreCodec {
    /// Encode a message with framing: `[4 bytes len][1 byte tag][body]`.
    ///
    /// For chunk messages the body is `[chunk header][raw payload]`; for all
    /// others it is the bincode encoding of the message.
    pub fn encode(msg: &StoreMessage) -> ProtocolResult<Bytes> {
        let body = Self::encode_body(msg)?;
        if body.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: body.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        let len = (body.len() + 1) as u32;
        let mut buf = Vec::with_capacity(4 + 1 + body.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.push(msg.type_tag());
        buf.extend_from_slice(&body);
        Ok(Bytes::from(buf))
    }

    /// Decode a framed message. Returns (message, bytes_consumed).
    pub fn decode(data: &[u8]) -> ProtocolResult<(StoreMessage, usize)> {
        if data.len() < 5 {
            return Err(ProtocolError::FramingError("too short".into()));
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if len < 1 {
            return Err(ProtocolError::FramingError("zero-length frame".into()));
        }
        if len - 1 > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: len - 1,
                max: MAX_MESSAGE_SIZE,
            });
        }
        let total = 4 + len;
        if data.len() < total {
            return Err(ProtocolError::FramingError(format!(
                "incomplete: have {}, need {}",
                data.len(),
                total
            )));
        }
        let tag = data[4];
        let msg = Self::decode_body(tag, &data[5..total])?;
        Ok((msg, total))
    }

    /// Decode a buffer that must hold exactly one frame.
    pub fn decode_exact(data: &[u8]) -> ProtocolResult<StoreMessage> {
        let (msg, consumed) = Self::decode(data)?;
        if consumed != data.len() {
            return Err(ProtocolError::FramingError(format!(
                "{} trailing bytes after frame",
                data.len() - consumed
            )));
        }
        Ok(msg)
    }

    fn encode_body(msg: &StoreMessage) -> ProtocolResult<Vec<u8>> {
        match msg {
            StoreMessage::PutChunk { header, payload }
            | StoreMessage::ChunkData { header, payload } => {
                let mut body = Vec::with_capacity(CHUNK_HEADER_LEN + payload.len());
                header.encode_into(&mut body);
                body.extend_from_slice(payload);
                Ok(body)
            }
            other => {
                bincode::serialize(other).map_err(|e| ProtocolError::Serialization(e.to_string()))
            }
        }
    }

    fn decode_body(tag: u8, body: &[u8]) -> ProtocolResult<StoreMessage> {
        match tag {
            TAG_PUT_CHUNK | TAG_CHUNK_DATA => {
                let header = ChunkHeader::decode(body)?;
                let payload = Bytes::copy_from_slice(&body[CHUNK_HEADER_LEN..]);
                Ok(if tag == TAG_PUT_CHUNK {
                    StoreMessage::PutChunk { header, payload }
                } else {
                    StoreMessage::ChunkData { header, payload }
                })
            }
            _ => {
                let msg: StoreMessage = bincode::deserialize(body)
                    .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
                if msg.type_tag() != tag {
                    return Err(ProtocolError::InvalidMessageType(tag));
                }
                Ok(msg)
            }
        }
    }
}
