use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Maximum length of a bucket name in bytes.
pub const MAX_BUCKET_NAME_LEN: usize = 64;

/// Token used for bucket-level API subjects; never a bucket name.
pub const RESERVED_BUCKET_NAME: &str = "API";

/// Maximum length of an object name in bytes.
pub const MAX_OBJECT_NAME_LEN: usize = 1024;

/// Name of a bucket: the namespace grouping objects.
///
/// Bucket names become subject tokens on the transport, so they are limited
/// to ASCII alphanumerics, `-` and `_`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BucketName(String);

impl BucketName {
    /// Validate and wrap a bucket name.
    pub fn new(name: impl Into<String>) -> Result<Self, TypeError> {
        let name = name.into();
        let invalid = |reason: &str| TypeError::InvalidName {
            kind: "bucket",
            name: name.clone(),
            reason: reason.into(),
        };
        if name.is_empty() {
            return Err(invalid("empty"));
        }
        if name.len() > MAX_BUCKET_NAME_LEN {
            return Err(invalid("too long"));
        }
        if !name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(invalid("only [A-Za-z0-9_-] allowed"));
        }
        if name == RESERVED_BUCKET_NAME {
            return Err(invalid("reserved"));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for BucketName {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BucketName> for String {
    fn from(name: BucketName) -> Self {
        name.0
    }
}

impl fmt::Debug for BucketName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BucketName({})", self.0)
    }
}

impl fmt::Display for BucketName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of an object within a bucket.
///
/// Any non-empty UTF-8 string without control characters, up to
/// [`MAX_OBJECT_NAME_LEN`] bytes. File paths are valid object names.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectName(String);

impl ObjectName {
    /// Validate and wrap an object name.
    pub fn new(name: impl Into<String>) -> Result<Self, TypeError> {
        let name = name.into();
        let invalid = |reason: &str| TypeError::InvalidName {
            kind: "object",
            name: name.clone(),
            reason: reason.into(),
        };
        if name.is_empty() {
            return Err(invalid("empty"));
        }
        if name.len() > MAX_OBJECT_NAME_LEN {
            return Err(invalid("too long"));
        }
        if name.chars().any(char::is_control) {
            return Err(invalid("control characters not allowed"));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Subject-safe encoding of the name (unpadded base64url).
    pub fn encoded(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0.as_bytes())
    }

    /// Inverse of [`ObjectName::encoded`].
    pub fn from_encoded(encoded: &str) -> Result<Self, TypeError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| TypeError::Serialization(e.to_string()))?;
        let name = String::from_utf8(bytes).map_err(|e| TypeError::Serialization(e.to_string()))?;
        Self::new(name)
    }
}

impl TryFrom<String> for ObjectName {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ObjectName> for String {
    fn from(name: ObjectName) -> Self {
        name.0
    }
}

impl fmt::Debug for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectName({})", self.0)
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
