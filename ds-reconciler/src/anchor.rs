//!
//! Derives trust anchors (DS records) from the DNSKEY records a zone publishes.
//!
//! Follows RFC 4034 §5.1.4: the digest covers the canonical owner name followed
//! by the DNSKEY RDATA. The key tag is computed as described in RFC 4034 Appendix B.
//!

use std::{collections::BTreeSet, fmt};

use hickory_proto::{error::ProtoError, rr::Name};
use serde::{ser::SerializeStruct, Serialize, Serializer};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384};

/// Flags of a key-signing key: zone key bit and secure entry point bit set.
pub const KEY_SIGNING_KEY_FLAGS: u16 = 257;

/// The only protocol value RFC 4034 allows in a DNSKEY.
pub const DNSKEY_PROTOCOL: u8 = 3;

/// RSA/MD5 keys use a different key tag computation.
const ALGORITHM_RSAMD5: u8 = 1;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DeriveError {
    #[error("Digest type {0} is not supported. Supported: 1 (SHA-1), 2 (SHA-256), 4 (SHA-384).")]
    UnsupportedDigest(u8),
    #[error("At least one digest type must be configured.")]
    NoDigestType,
    #[error("'{domain}' is not a valid zone name: {reason}")]
    InvalidOwnerName { domain: String, reason: String },
}

impl DeriveError {
    pub fn is_unsupported_digest(&self) -> bool {
        matches!(self, DeriveError::UnsupportedDigest(_))
    }
}

/// Parses a domain into a fully qualified name.
pub(crate) fn fqdn(domain: &str) -> Result<Name, ProtoError> {
    if domain.ends_with('.') {
        Name::from_ascii(domain)
    } else {
        Name::from_ascii(format!("{domain}."))
    }
}

/// Owner name in canonical wire format (RFC 4034 §6.2): lower case, uncompressed.
fn canonical_owner_wire(owner: &Name) -> Vec<u8> {
    let owner = owner.to_lowercase();
    let mut wire = Vec::new();
    for label in owner.iter() {
        wire.push(label.len() as u8);
        wire.extend_from_slice(label);
    }
    wire.push(0);
    wire
}

/// A DNSKEY record as published by the zone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SigningKey {
    pub flags: u16,
    pub protocol: u8,
    pub algorithm: u8,
    pub public_key: Vec<u8>,
}

impl SigningKey {
    pub fn new(flags: u16, algorithm: u8, public_key: Vec<u8>) -> Self {
        Self {
            flags,
            protocol: DNSKEY_PROTOCOL,
            algorithm,
            public_key,
        }
    }

    /// Reads a key from raw DNSKEY RDATA. Returns `None` if the data is too short
    /// to hold the fixed fields.
    pub fn from_rdata(rdata: &[u8]) -> Option<Self> {
        if rdata.len() < 4 {
            return None;
        }
        Some(Self {
            flags: u16::from_be_bytes([rdata[0], rdata[1]]),
            protocol: rdata[2],
            algorithm: rdata[3],
            public_key: rdata[4..].to_vec(),
        })
    }

    /// DNSKEY RDATA in wire format.
    pub fn to_rdata(&self) -> Vec<u8> {
        let mut rdata = Vec::with_capacity(4 + self.public_key.len());
        rdata.extend_from_slice(&self.flags.to_be_bytes());
        rdata.push(self.protocol);
        rdata.push(self.algorithm);
        rdata.extend_from_slice(&self.public_key);
        rdata
    }

    /// Only keys with exactly the zone key and secure entry point bits set get a
    /// trust anchor. Revoked keys carry an extra bit and are therefore excluded.
    pub fn is_key_signing_key(&self) -> bool {
        self.flags == KEY_SIGNING_KEY_FLAGS
    }

    pub fn key_tag(&self) -> u16 {
        if self.algorithm == ALGORITHM_RSAMD5 {
            // Bits 16..32 of the last three octets of the modulus.
            let len = self.public_key.len();
            if len < 3 {
                return 0;
            }
            return u16::from_be_bytes([self.public_key[len - 3], self.public_key[len - 2]]);
        }

        let mut ac: u32 = 0;
        for (i, byte) in self.to_rdata().iter().enumerate() {
            if i & 1 == 0 {
                ac += u32::from(*byte) << 8;
            } else {
                ac += u32::from(*byte);
            }
        }
        ac += (ac >> 16) & 0xFFFF;
        (ac & 0xFFFF) as u16
    }
}

/// DS digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum DigestType {
    Sha1,
    #[default]
    Sha256,
    Sha384,
}

impl DigestType {
    pub fn code(&self) -> u8 {
        match self {
            DigestType::Sha1 => 1,
            DigestType::Sha256 => 2,
            DigestType::Sha384 => 4,
        }
    }

    fn hash(&self, data: &[u8]) -> Vec<u8> {
        match self {
            DigestType::Sha1 => Sha1::digest(data).to_vec(),
            DigestType::Sha256 => Sha256::digest(data).to_vec(),
            DigestType::Sha384 => Sha384::digest(data).to_vec(),
        }
    }
}

impl TryFrom<u8> for DigestType {
    type Error = DeriveError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(DigestType::Sha1),
            2 => Ok(DigestType::Sha256),
            4 => Ok(DigestType::Sha384),
            other => Err(DeriveError::UnsupportedDigest(other)),
        }
    }
}

impl From<DigestType> for u8 {
    fn from(value: DigestType) -> Self {
        value.code()
    }
}

impl fmt::Display for DigestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DigestType::Sha1 => write!(f, "SHA-1"),
            DigestType::Sha256 => write!(f, "SHA-256"),
            DigestType::Sha384 => write!(f, "SHA-384"),
        }
    }
}

/// A DS record as held by the registrar. Two anchors are equal only if all four
/// fields are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrustAnchor {
    pub key_tag: u16,
    pub algorithm: u8,
    pub digest_type: u8,
    pub digest: Vec<u8>,
}

impl TrustAnchor {
    pub fn new(key_tag: u16, algorithm: u8, digest_type: u8, digest: Vec<u8>) -> Self {
        Self {
            key_tag,
            algorithm,
            digest_type,
            digest,
        }
    }

    /// Derives the DS record of `key` published at `owner`.
    pub fn derive(owner: &Name, key: &SigningKey, digest_type: DigestType) -> Self {
        let mut data = canonical_owner_wire(owner);
        data.extend_from_slice(&key.to_rdata());
        Self {
            key_tag: key.key_tag(),
            algorithm: key.algorithm,
            digest_type: digest_type.code(),
            digest: digest_type.hash(&data),
        }
    }

    /// Digest as upper case hex, the form registrars display and accept.
    pub fn digest_hex(&self) -> String {
        hex::encode_upper(&self.digest)
    }
}

impl fmt::Display for TrustAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.key_tag,
            self.algorithm,
            self.digest_type,
            self.digest_hex()
        )
    }
}

impl Serialize for TrustAnchor {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("TrustAnchor", 4)?;
        state.serialize_field("key_tag", &self.key_tag)?;
        state.serialize_field("algorithm", &self.algorithm)?;
        state.serialize_field("digest_type", &self.digest_type)?;
        state.serialize_field("digest", &self.digest_hex())?;
        state.end()
    }
}

/// Turns the key-signing keys of a zone into the set of trust anchors the
/// registrar should hold, one per key and configured digest type.
#[derive(Debug, Clone)]
pub struct AnchorDeriver {
    digest_types: Vec<DigestType>,
}

impl Default for AnchorDeriver {
    fn default() -> Self {
        Self {
            digest_types: vec![DigestType::default()],
        }
    }
}

impl AnchorDeriver {
    pub fn new(digest_types: impl IntoIterator<Item = DigestType>) -> Result<Self, DeriveError> {
        let mut types: Vec<DigestType> = Vec::new();
        for digest_type in digest_types {
            if !types.contains(&digest_type) {
                types.push(digest_type);
            }
        }
        if types.is_empty() {
            return Err(DeriveError::NoDigestType);
        }
        Ok(Self {
            digest_types: types,
        })
    }

    /// Creates a deriver from numeric digest type identifiers.
    pub fn from_codes(codes: &[u8]) -> Result<Self, DeriveError> {
        let types = codes
            .iter()
            .map(|code| DigestType::try_from(*code))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(types)
    }

    pub fn digest_types(&self) -> &[DigestType] {
        &self.digest_types
    }

    /// Derives the anchors for a single key. Non key-signing keys yield nothing.
    pub fn derive(&self, owner: &Name, key: &SigningKey) -> Vec<TrustAnchor> {
        if !key.is_key_signing_key() {
            return vec![];
        }
        self.digest_types
            .iter()
            .map(|digest_type| TrustAnchor::derive(owner, key, *digest_type))
            .collect()
    }

    /// The desired anchor set of `domain` given the keys it publishes.
    pub fn desired_set(
        &self,
        domain: &str,
        keys: &[SigningKey],
    ) -> Result<BTreeSet<TrustAnchor>, DeriveError> {
        let owner = fqdn(domain).map_err(|e| DeriveError::InvalidOwnerName {
            domain: domain.to_string(),
            reason: e.to_string(),
        })?;
        Ok(keys
            .iter()
            .flat_map(|key| self.derive(&owner, key))
            .collect())
    }
}
