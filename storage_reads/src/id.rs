//! Organization and bucket identifiers.

use std::fmt::Display;
use std::num::ParseIntError;

/// Identifies an organization. Renders as 16 lowercase hex digits.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Hash)]
pub struct OrgId(u64);

impl OrgId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Parse an id from its 16-digit hex form.
    pub fn from_hex(s: &str) -> Result<Self, ParseIntError> {
        u64::from_str_radix(s, 16).map(Self)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for OrgId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Display for OrgId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Identifies a bucket within an organization.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Hash)]
pub struct BucketId(u64);

impl BucketId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Parse an id from its 16-digit hex form.
    pub fn from_hex(s: &str) -> Result<Self, ParseIntError> {
        u64::from_str_radix(s, 16).map(Self)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for BucketId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Display for BucketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let org = OrgId::from_hex("3131313131313131").unwrap();
        assert_eq!(org.to_string(), "3131313131313131");
        assert_eq!(org, OrgId::new(0x3131313131313131));

        let bucket = BucketId::from_hex("00000000000000ff").unwrap();
        assert_eq!(bucket.as_u64(), 255);
        assert_eq!(bucket.to_string(), "00000000000000ff");
    }

    #[test]
    fn rejects_non_hex() {
        assert!(OrgId::from_hex("not-an-id").is_err());
    }
}
