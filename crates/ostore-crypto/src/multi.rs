use ostore_types::{Digest, DigestAlgorithm};

use crate::hasher::{new_hasher, DigestHasher};

/// Feeds one input stream to several digest algorithms at once.
pub struct MultiHasher {
    hashers: Vec<Box<dyn DigestHasher>>,
}

impl MultiHasher {
    /// A hasher for each of the given algorithms. Duplicates are ignored.
    pub fn new(algorithms: &[DigestAlgorithm]) -> Self {
        let mut hashers: Vec<Box<dyn DigestHasher>> = Vec::with_capacity(algorithms.len());
        for &alg in algorithms {
            if !hashers.iter().any(|h| h.algorithm() == alg) {
                hashers.push(new_hasher(alg));
            }
        }
        Self { hashers }
    }

    /// Every supported algorithm.
    pub fn all() -> Self {
        Self::new(&DigestAlgorithm::ALL)
    }

    pub fn update(&mut self, data: &[u8]) {
        for h in &mut self.hashers {
            h.update(data);
        }
    }

    /// Digests in the order the algorithms were requested.
    pub fn finalize(self) -> Vec<Digest> {
        self.hashers.into_iter().map(|h| h.finalize()).collect()
    }

    pub fn len(&self) -> usize {
        self.hashers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashers.is_empty()
    }
}

impl DigestHasher for MultiHasher {
    /// The first requested algorithm is the primary one.
    fn algorithm(&self) -> DigestAlgorithm {
        self.hashers
            .first()
            .map(|h| h.algorithm())
            .unwrap_or_default()
    }

    fn update(&mut self, data: &[u8]) {
        MultiHasher::update(self, data);
    }

    fn finalize(self: Box<Self>) -> Digest {
        let primary = self.algorithm();
        MultiHasher::finalize(*self)
            .into_iter()
            .next()
            .unwrap_or_else(|| crate::hasher::digest_of(primary, b""))
    }
}
