use ostore_types::{ChunkKey, RevisionId};
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};

/// Encoded size of a [`ChunkHeader`]: 16-byte revision id, 4-byte index, 1 flag byte.
pub const CHUNK_HEADER_LEN: usize = 21;

/// Flag bits carried in a chunk header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkFlags(u8);

impl ChunkFlags {
    /// No more chunks follow this one.
    pub const FINAL: u8 = 0b0000_0001;

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn final_chunk() -> Self {
        Self(Self::FINAL)
    }

    pub fn is_final(&self) -> bool {
        self.0 & Self::FINAL != 0
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Unknown bits are rejected so a newer peer cannot be misread.
    pub fn from_bits(bits: u8) -> Option<Self> {
        if bits & !Self::FINAL != 0 {
            None
        } else {
            Some(Self(bits))
        }
    }
}

/// Header preceding every chunk payload on the wire.
///
/// ```text
/// [16 bytes: revision id][4 bytes: index (big-endian u32)][1 byte: flags]
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkHeader {
    pub revision_id: RevisionId,
    pub index: u32,
    pub flags: ChunkFlags,
}

impl ChunkHeader {
    pub fn new(revision_id: RevisionId, index: u32, is_final: bool) -> Self {
        let flags = if is_final {
            ChunkFlags::final_chunk()
        } else {
            ChunkFlags::empty()
        };
        Self {
            revision_id,
            index,
            flags,
        }
    }

    pub fn key(&self) -> ChunkKey {
        ChunkKey::new(self.revision_id, self.index)
    }

    pub fn is_final(&self) -> bool {
        self.flags.is_final()
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.revision_id.as_bytes());
        buf.extend_from_slice(&self.index.to_be_bytes());
        buf.push(self.flags.bits());
    }

    pub fn to_bytes(&self) -> [u8; CHUNK_HEADER_LEN] {
        let mut out = [0u8; CHUNK_HEADER_LEN];
        out[..16].copy_from_slice(self.revision_id.as_bytes());
        out[16..20].copy_from_slice(&self.index.to_be_bytes());
        out[20] = self.flags.bits();
        out
    }

    pub fn decode(data: &[u8]) -> ProtocolResult<Self> {
        if data.len() < CHUNK_HEADER_LEN {
            return Err(ProtocolError::FramingError(format!(
                "chunk header needs {CHUNK_HEADER_LEN} bytes, have {}",
                data.len()
            )));
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(&data[..16]);
        let mut index = [0u8; 4];
        index.copy_from_slice(&data[16..20]);
        let flags = ChunkFlags::from_bits(data[20]).ok_or_else(|| {
            ProtocolError::FramingError(format!("unknown chunk flags {:#04x}", data[20]))
        })?;
        Ok(Self {
            revision_id: RevisionId::from_bytes(id),
            index: u32::from_be_bytes(index),
            flags,
        })
    }
}
