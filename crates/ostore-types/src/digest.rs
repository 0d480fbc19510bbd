use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Digest algorithms understood by the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DigestAlgorithm {
    Sha256,
    Blake3,
}

impl DigestAlgorithm {
    /// Every supported algorithm, in a stable order.
    pub const ALL: [DigestAlgorithm; 2] = [Self::Sha256, Self::Blake3];

    /// Tag used in the textual digest form (`SHA-256=...`).
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Sha256 => "SHA-256",
            Self::Blake3 => "BLAKE3",
        }
    }

    /// Output length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            Self::Sha256 | Self::Blake3 => 32,
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.to_ascii_uppercase().as_str() {
            "SHA-256" | "SHA256" => Some(Self::Sha256),
            "BLAKE3" => Some(Self::Blake3),
            _ => None,
        }
    }
}

impl Default for DigestAlgorithm {
    fn default() -> Self {
        Self::Sha256
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_tag(s).ok_or_else(|| TypeError::InvalidDigest(s.into()))
    }
}

/// Algorithm-tagged content digest.
///
/// Textual form is `<TAG>=<padded base64url>`, e.g.
/// `SHA-256=47DEQpj8HBSa-_TImW-5JCeuQeRkm5NMpJWZG3hSuFU=`.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: DigestAlgorithm,
    value: Vec<u8>,
}

impl Digest {
    /// Wrap raw digest bytes, checking the length against the algorithm.
    pub fn new(algorithm: DigestAlgorithm, value: Vec<u8>) -> Result<Self, TypeError> {
        if value.len() != algorithm.output_len() {
            return Err(TypeError::InvalidLength {
                expected: algorithm.output_len(),
                actual: value.len(),
            });
        }
        Ok(Self { algorithm, value })
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.value
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.value)
    }

    /// Standard base64 with padding.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.value)
    }

    /// URL-safe base64 without padding.
    pub fn to_base64url(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.value)
    }

    /// URL-safe base64 with padding (the stored form).
    pub fn to_base64url_padded(&self) -> String {
        URL_SAFE.encode(&self.value)
    }

    /// Parse the tagged textual form. Padded and unpadded base64url are both
    /// accepted.
    pub fn parse(s: &str) -> Result<Self, TypeError> {
        let (tag, encoded) = s
            .split_once('=')
            .ok_or_else(|| TypeError::InvalidDigest(s.into()))?;
        let algorithm =
            DigestAlgorithm::from_tag(tag).ok_or_else(|| TypeError::InvalidDigest(s.into()))?;
        let value = URL_SAFE_NO_PAD
            .decode(encoded.trim_end_matches('='))
            .map_err(|_| TypeError::InvalidDigest(s.into()))?;
        Self::new(algorithm, value)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({}={})", self.algorithm.tag(), &self.to_hex()[..16])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.algorithm.tag(), self.to_base64url_padded())
    }
}

impl FromStr for Digest {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Digest {
        Digest::new(DigestAlgorithm::Sha256, (0u8..32).collect()).unwrap()
    }

    #[test]
    fn display_is_tagged() {
        let d = sample();
        let s = d.to_string();
        assert!(s.starts_with("SHA-256="));
        assert!(s.ends_with('='));
    }

    #[test]
    fn parse_roundtrip() {
        let d = sample();
        assert_eq!(Digest::parse(&d.to_string()).unwrap(), d);
    }

    #[test]
    fn parse_accepts_unpadded() {
        let d = sample();
        let s = format!("SHA-256={}", d.to_base64url());
        assert_eq!(Digest::parse(&s).unwrap(), d);
    }

    #[test]
    fn parse_rejects_unknown_algorithm() {
        assert!(Digest::parse("MD5=AAAA").is_err());
        assert!(Digest::parse("no-separator").is_err());
    }

    #[test]
    fn wrong_length_rejected() {
        let err = Digest::new(DigestAlgorithm::Blake3, vec![0; 31]).unwrap_err();
        assert_eq!(err, TypeError::InvalidLength { expected: 32, actual: 31 });
    }

    #[test]
    fn encodings_differ_only_in_alphabet_and_padding() {
        let d = Digest::new(DigestAlgorithm::Blake3, vec![0xfb; 32]).unwrap();
        assert!(d.to_base64().contains('+') || d.to_base64().contains('/'));
        assert!(!d.to_base64url().contains('+'));
        assert!(!d.to_base64url().ends_with('='));
        assert!(d.to_base64url_padded().ends_with('='));
        assert_eq!(d.to_hex().len(), 64);
    }

    #[test]
    fn algorithm_tags() {
        assert_eq!("sha-256".parse::<DigestAlgorithm>().unwrap(), DigestAlgorithm::Sha256);
        assert_eq!("blake3".parse::<DigestAlgorithm>().unwrap(), DigestAlgorithm::Blake3);
        assert!("crc32".parse::<DigestAlgorithm>().is_err());
    }

    #[test]
    fn serde_uses_text_form() {
        let d = sample();
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"{d}\""));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }
}
