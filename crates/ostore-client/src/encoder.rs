use bytes::{Bytes, BytesMut};
use chrono::Utc;
use ostore_crypto::{new_hasher, DigestHasher};
use ostore_types::{
    BucketName, DigestAlgorithm, ObjectHeaders, ObjectMetadata, ObjectName, RevisionId,
};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{StoreError, StoreResult};

/// Upper bound on a single read from the input.
const READ_BLOCK: usize = 64 * 1024;

/// One chunk cut from the input stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedChunk {
    pub index: u32,
    pub payload: Bytes,
    /// No bytes follow this chunk.
    pub is_final: bool,
}

/// Splits an async byte stream into chunks of at most `chunk_size` bytes
/// while hashing every byte read.
///
/// The encoder reads one byte past a chunk boundary before emitting the
/// chunk, so it knows whether the chunk is the last one. At most
/// `chunk_size` plus one read block is buffered at any time.
pub struct ChunkedEncoder<R> {
    reader: R,
    chunk_size: usize,
    hasher: Box<dyn DigestHasher>,
    buf: BytesMut,
    eof: bool,
    done: bool,
    next_index: u32,
    bytes_read: u64,
}

impl<R: AsyncRead + Unpin> ChunkedEncoder<R> {
    pub fn new(reader: R, chunk_size: u32, algorithm: DigestAlgorithm) -> StoreResult<Self> {
        if chunk_size == 0 {
            return Err(StoreError::InvalidArgument("chunk size must be positive".into()));
        }
        Ok(Self {
            reader,
            chunk_size: chunk_size as usize,
            hasher: new_hasher(algorithm),
            buf: BytesMut::new(),
            eof: false,
            done: false,
            next_index: 0,
            bytes_read: 0,
        })
    }

    /// The next chunk, or `None` once the input is exhausted.
    pub async fn next_chunk(&mut self) -> StoreResult<Option<EncodedChunk>> {
        if self.done {
            return Ok(None);
        }
        while !self.eof && self.buf.len() <= self.chunk_size {
            let start = self.buf.len();
            self.buf.reserve(READ_BLOCK.min(self.chunk_size + 1 - start));
            let n = self
                .reader
                .read_buf(&mut self.buf)
                .await
                .map_err(StoreError::StreamRead)?;
            if n == 0 {
                self.eof = true;
            } else {
                self.hasher.update(&self.buf[start..]);
                self.bytes_read += n as u64;
            }
        }
        if self.buf.is_empty() {
            self.done = true;
            return Ok(None);
        }
        let take = self.buf.len().min(self.chunk_size);
        let payload = self.buf.split_to(take).freeze();
        let is_final = self.eof && self.buf.is_empty();
        self.done = is_final;
        let index = self.next_index;
        self.next_index += 1;
        Ok(Some(EncodedChunk {
            index,
            payload,
            is_final,
        }))
    }

    /// Descriptor of the encoded object, revision not yet assigned.
    ///
    /// Fails if the input has not been fully consumed.
    pub fn finish(
        self,
        bucket: &BucketName,
        name: &ObjectName,
        headers: ObjectHeaders,
        revision_id: RevisionId,
    ) -> StoreResult<ObjectMetadata> {
        if !self.done {
            return Err(StoreError::InvalidArgument(
                "encoder finished before end of input".into(),
            ));
        }
        let now = Utc::now();
        Ok(ObjectMetadata {
            bucket: bucket.clone(),
            name: name.clone(),
            size: self.bytes_read,
            digest: self.hasher.finalize(),
            chunk_count: self.next_index,
            chunk_size: self.chunk_size as u32,
            revision: 0,
            revision_id,
            created_at: now,
            modified_at: now,
            headers,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use ostore_crypto::digest_of;
    use proptest::prelude::*;
    use tokio::io::ReadBuf;

    use super::*;

    /// Hands out at most `step` bytes per read.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl AsyncRead for Trickle {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let n = self.step.min(self.data.len() - self.pos).min(buf.remaining());
            let start = self.pos;
            buf.put_slice(&self.data[start..start + n]);
            self.pos += n;
            Poll::Ready(Ok(()))
        }
    }

    struct Failing;

    impl AsyncRead for Failing {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")))
        }
    }

    fn names() -> (BucketName, ObjectName) {
        (BucketName::new("test").unwrap(), ObjectName::new("obj").unwrap())
    }

    async fn encode_all<R: AsyncRead + Unpin>(
        reader: R,
        chunk_size: u32,
    ) -> (Vec<EncodedChunk>, ObjectMetadata) {
        let mut enc = ChunkedEncoder::new(reader, chunk_size, DigestAlgorithm::Sha256).unwrap();
        let mut chunks = Vec::new();
        while let Some(c) = enc.next_chunk().await.unwrap() {
            chunks.push(c);
        }
        let (b, n) = names();
        let meta = enc
            .finish(&b, &n, ObjectHeaders::new(), RevisionId::new())
            .unwrap();
        (chunks, meta)
    }

    #[tokio::test]
    async fn empty_input_has_no_chunks() {
        let (chunks, meta) = encode_all(&b""[..], 4).await;
        assert!(chunks.is_empty());
        assert_eq!(meta.size, 0);
        assert_eq!(meta.chunk_count, 0);
        assert_eq!(meta.digest, digest_of(DigestAlgorithm::Sha256, b""));
    }

    #[tokio::test]
    async fn exact_multiple_marks_last_chunk_final() {
        let (chunks, meta) = encode_all(&b"abcdefgh"[..], 4).await;
        assert_eq!(chunks.len(), 2);
        assert!(!chunks[0].is_final);
        assert!(chunks[1].is_final);
        assert_eq!(&chunks[1].payload[..], b"efgh");
        assert!(meta.is_consistent());
    }

    #[tokio::test]
    async fn read_error_aborts() {
        let mut enc = ChunkedEncoder::new(Failing, 4, DigestAlgorithm::Sha256).unwrap();
        let err = enc.next_chunk().await.unwrap_err();
        assert!(matches!(err, StoreError::StreamRead(_)));
    }

    #[tokio::test]
    async fn finish_requires_end_of_input() {
        let mut enc = ChunkedEncoder::new(&b"abcdefgh"[..], 4, DigestAlgorithm::Sha256).unwrap();
        enc.next_chunk().await.unwrap();
        let (b, n) = names();
        let err = enc
            .finish(&b, &n, ObjectHeaders::new(), RevisionId::new())
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[test]
    fn zero_chunk_size_rejected() {
        assert!(ChunkedEncoder::new(&b""[..], 0, DigestAlgorithm::Sha256).is_err());
    }

    proptest! {
        #[test]
        fn chunks_reassemble_input(
            data in proptest::collection::vec(any::<u8>(), 0..2048),
            chunk_size in 1u32..300,
            step in 1usize..500,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let reader = Trickle { data: data.clone(), pos: 0, step };
            let (chunks, meta) = rt.block_on(encode_all(reader, chunk_size));

            let joined: Vec<u8> = chunks.iter().flat_map(|c| c.payload.to_vec()).collect();
            prop_assert_eq!(&joined, &data);
            prop_assert_eq!(meta.size, data.len() as u64);
            prop_assert_eq!(meta.chunk_count as usize, chunks.len());
            prop_assert!(meta.is_consistent());
            prop_assert_eq!(meta.digest, digest_of(DigestAlgorithm::Sha256, &data));
            for (i, c) in chunks.iter().enumerate() {
                prop_assert_eq!(c.index as usize, i);
                prop_assert_eq!(c.is_final, i + 1 == chunks.len());
                if i + 1 < chunks.len() {
                    prop_assert_eq!(c.payload.len(), chunk_size as usize);
                } else {
                    prop_assert!(!c.payload.is_empty());
                    prop_assert!(c.payload.len() <= chunk_size as usize);
                }
            }
        }
    }
}
