use ostore_types::{Digest, DigestAlgorithm};
use sha2::Digest as _;

/// Incremental digest capability.
///
/// Implementations accept bytes in arbitrarily sized pieces; the result
/// depends only on the concatenated input, never on how it was split.
pub trait DigestHasher: Send {
    /// The algorithm this hasher computes.
    fn algorithm(&self) -> DigestAlgorithm;

    /// Feed more input.
    fn update(&mut self, data: &[u8]);

    /// Consume the hasher and produce the digest.
    fn finalize(self: Box<Self>) -> Digest;
}

/// SHA-256 via the `sha2` crate.
#[derive(Default)]
pub struct Sha256Hasher(sha2::Sha256);

impl DigestHasher for Sha256Hasher {
    fn algorithm(&self) -> DigestAlgorithm {
        DigestAlgorithm::Sha256
    }

    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize(self: Box<Self>) -> Digest {
        let Sha256Hasher(inner) = *self;
        let out = inner.finalize();
        digest_from(DigestAlgorithm::Sha256, out.as_slice())
    }
}

/// BLAKE3 via the `blake3` crate.
#[derive(Default)]
pub struct Blake3Hasher(blake3::Hasher);

impl DigestHasher for Blake3Hasher {
    fn algorithm(&self) -> DigestAlgorithm {
        DigestAlgorithm::Blake3
    }

    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize(self: Box<Self>) -> Digest {
        let Blake3Hasher(inner) = *self;
        digest_from(DigestAlgorithm::Blake3, inner.finalize().as_bytes())
    }
}

// Both algorithms emit exactly `output_len()` bytes.
fn digest_from(algorithm: DigestAlgorithm, bytes: &[u8]) -> Digest {
    match Digest::new(algorithm, bytes.to_vec()) {
        Ok(d) => d,
        Err(e) => unreachable!("{algorithm} produced a malformed digest: {e}"),
    }
}

/// Create a fresh hasher for `algorithm`.
pub fn new_hasher(algorithm: DigestAlgorithm) -> Box<dyn DigestHasher> {
    match algorithm {
        DigestAlgorithm::Sha256 => Box::<Sha256Hasher>::default(),
        DigestAlgorithm::Blake3 => Box::<Blake3Hasher>::default(),
    }
}

/// One-shot digest of a byte slice.
pub fn digest_of(algorithm: DigestAlgorithm, data: &[u8]) -> Digest {
    let mut hasher = new_hasher(algorithm);
    hasher.update(data);
    hasher.finalize()
}
