use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// A byte count parsed from `N[k|kib|m|mib|g|gib]` (suffix case-insensitive).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub fn bytes(self) -> u64 {
        self.0
    }

    /// Parse a size expression. Unknown suffixes are rejected.
    pub fn parse(s: &str) -> Result<Self, TypeError> {
        let s = s.trim();
        let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        let (digits, suffix) = s.split_at(split);
        if digits.is_empty() {
            return Err(TypeError::InvalidSize(s.into()));
        }
        let n: u64 = digits
            .parse()
            .map_err(|_| TypeError::InvalidSize(s.into()))?;
        let unit = match suffix.to_ascii_lowercase().as_str() {
            "" | "b" => 1,
            "k" | "kib" => KIB,
            "m" | "mib" => MIB,
            "g" | "gib" => GIB,
            _ => return Err(TypeError::InvalidSize(s.into())),
        };
        n.checked_mul(unit)
            .map(Self)
            .ok_or_else(|| TypeError::InvalidSize(s.into()))
    }
}

impl FromStr for ByteSize {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.0;
        if n >= GIB && n % GIB == 0 {
            write!(f, "{}GiB", n / GIB)
        } else if n >= MIB && n % MIB == 0 {
            write!(f, "{}MiB", n / MIB)
        } else if n >= KIB && n % KIB == 0 {
            write!(f, "{}KiB", n / KIB)
        } else {
            write!(f, "{n}B")
        }
    }
}
