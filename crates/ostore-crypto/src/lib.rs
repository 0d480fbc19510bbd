//! Content digests for ostore.
//!
//! Digest computation sits behind the [`DigestHasher`] capability so the
//! streaming code never names an algorithm. [`MultiHasher`] feeds the same
//! bytes to several algorithms at once, which is how the `hash` command
//! compares implementations over a single pass of the input.
//!
//! All crypto operations wrap established libraries; there is no custom cryptography.

pub mod hasher;
pub mod multi;

pub use hasher::{digest_of, new_hasher, Blake3Hasher, DigestHasher, Sha256Hasher};
pub use multi::MultiHasher;
