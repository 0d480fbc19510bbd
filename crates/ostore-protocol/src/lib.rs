//! Wire protocol for ostore.
//!
//! Defines the subjects requests travel on, the framing and message types
//! exchanged between object store clients and the store service, and the
//! fixed binary header carried by every chunk.

pub mod chunk;
pub mod codec;
pub mod error;
pub mod message;
pub mod subject;

pub use chunk::{ChunkFlags, ChunkHeader, CHUNK_HEADER_LEN};
pub use codec::StoreCodec;
pub use error::{ProtocolError, ProtocolResult};
pub use message::{ErrorCode, StoreMessage, MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
pub use subject::{ApiOp, Subject, SUBJECT_PREFIX};
