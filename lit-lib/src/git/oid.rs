use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

/// The length of a raw object ID in bytes.
pub const OID_BYTE_LENGTH: usize = 20;

/// The length of a hex-encoded object ID.
pub const OID_HEX_LENGTH: usize = OID_BYTE_LENGTH * 2;

/// Represents the ID of an object in the object store.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NonZeroOid {
    inner: [u8; OID_BYTE_LENGTH],
}

impl NonZeroOid {
    /// Hash the given bytes, which should be the complete header-prefixed
    /// representation of an object.
    pub fn hash_bytes(data: &[u8]) -> Self {
        let digest = Sha1::digest(data);
        let mut inner = [0; OID_BYTE_LENGTH];
        inner.copy_from_slice(&digest);
        NonZeroOid { inner }
    }

    /// Construct an OID from a raw 20-byte slice.
    pub fn from_bytes(bytes: &[u8]) -> eyre::Result<Self> {
        let oid = MaybeZeroOid::from_bytes(bytes)?;
        match oid {
            MaybeZeroOid::NonZero(oid) => Ok(oid),
            MaybeZeroOid::Zero => eyre::bail!("Expected a non-zero OID"),
        }
    }

    /// Convert this OID into its raw 20-byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }

    /// The abbreviated form of this OID, suitable for display.
    pub fn to_short_string(&self) -> String {
        let mut result = self.to_string();
        result.truncate(7);
        result
    }

    /// The name of the fan-out directory this object is stored under.
    pub fn dir_name(&self) -> String {
        hex::encode(&self.inner[..1])
    }

    /// The filename of this object inside its fan-out directory.
    pub fn file_name(&self) -> String {
        hex::encode(&self.inner[1..])
    }
}

impl std::fmt::Debug for NonZeroOid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NonZeroOid({})", self)
    }
}

impl Display for NonZeroOid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.inner))
    }
}

impl TryFrom<MaybeZeroOid> for NonZeroOid {
    type Error = eyre::Error;

    fn try_from(value: MaybeZeroOid) -> Result<Self, Self::Error> {
        match value {
            MaybeZeroOid::NonZero(non_zero_oid) => Ok(non_zero_oid),
            MaybeZeroOid::Zero => eyre::bail!("Expected a non-zero OID"),
        }
    }
}

impl FromStr for NonZeroOid {
    type Err = eyre::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let oid: MaybeZeroOid = value.parse()?;
        match oid {
            MaybeZeroOid::NonZero(non_zero_oid) => Ok(non_zero_oid),
            MaybeZeroOid::Zero => eyre::bail!("Expected a non-zero OID, but got: {:?}", value),
        }
    }
}

impl Serialize for NonZeroOid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NonZeroOid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// Represents an OID which may be zero or non-zero. The zero OID is used to
/// represent the absence of an object, such as a commit which was skipped
/// during a rebase and therefore has no rewritten counterpart.
///
/// This type is isomorphic to `Option<NonZeroOid>`. It should be used primarily
/// when converting to and from string representations of OID values.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MaybeZeroOid {
    /// The zero OID (i.e. 40 `0`s).
    Zero,

    /// A non-zero OID.
    NonZero(NonZeroOid),
}

impl MaybeZeroOid {
    /// Construct an OID from a raw 20-byte slice.
    pub fn from_bytes(bytes: &[u8]) -> eyre::Result<Self> {
        let inner: [u8; OID_BYTE_LENGTH] = match bytes.try_into() {
            Ok(inner) => inner,
            Err(_) => eyre::bail!(
                "Expected {} bytes for an OID, but got {}",
                OID_BYTE_LENGTH,
                bytes.len()
            ),
        };
        if inner.iter().all(|byte| *byte == 0) {
            Ok(MaybeZeroOid::Zero)
        } else {
            Ok(MaybeZeroOid::NonZero(NonZeroOid { inner }))
        }
    }
}

impl std::fmt::Debug for MaybeZeroOid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl Display for MaybeZeroOid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MaybeZeroOid::NonZero(oid) => write!(f, "{}", oid),
            MaybeZeroOid::Zero => write!(f, "{}", "0".repeat(OID_HEX_LENGTH)),
        }
    }
}

impl FromStr for MaybeZeroOid {
    type Err = eyre::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != OID_HEX_LENGTH {
            eyre::bail!("Could not parse OID from string: {:?}", s);
        }
        match hex::decode(s) {
            Ok(bytes) => MaybeZeroOid::from_bytes(&bytes),
            Err(err) => {
                Err(eyre::Error::new(err).wrap_err(format!("Could not parse OID from string: {:?}", s)))
            }
        }
    }
}

impl From<NonZeroOid> for MaybeZeroOid {
    fn from(oid: NonZeroOid) -> Self {
        Self::NonZero(oid)
    }
}

impl From<Option<NonZeroOid>> for MaybeZeroOid {
    fn from(oid: Option<NonZeroOid>) -> Self {
        match oid {
            Some(oid) => MaybeZeroOid::NonZero(oid),
            None => MaybeZeroOid::Zero,
        }
    }
}

impl From<MaybeZeroOid> for Option<NonZeroOid> {
    fn from(oid: MaybeZeroOid) -> Self {
        match oid {
            MaybeZeroOid::Zero => None,
            MaybeZeroOid::NonZero(oid) => Some(oid),
        }
    }
}

impl Serialize for MaybeZeroOid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MaybeZeroOid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_oid() -> eyre::Result<()> {
        let oid: NonZeroOid = "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391".parse()?;
        assert_eq!(oid.to_string(), "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391");
        assert_eq!(oid.to_short_string(), "e69de29");
        assert_eq!(oid.dir_name(), "e6");
        assert_eq!(oid.file_name(), "9de29bb2d1d6434b8b29ae775ad8c2e48c5391");

        let zero: MaybeZeroOid = "0000000000000000000000000000000000000000".parse()?;
        assert_eq!(zero, MaybeZeroOid::Zero);
        assert!("0000000000000000000000000000000000000000"
            .parse::<NonZeroOid>()
            .is_err());
        assert!("not-an-oid".parse::<NonZeroOid>().is_err());
        assert!("e69de29".parse::<NonZeroOid>().is_err());
        Ok(())
    }

    #[test]
    fn test_hash_empty_blob() {
        let oid = NonZeroOid::hash_bytes(b"blob 0\0");
        assert_eq!(oid.to_string(), "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391");
    }
}
