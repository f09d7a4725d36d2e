use core::fmt;

use sha2::{Digest, Sha256};

use crate::error::RnsError;

pub const HASH_SIZE: usize = 32;
pub const ADDRESS_HASH_SIZE: usize = 16;

/// Incremental SHA-256 over several fields, yielding a [`Hash`].
///
/// Every hash domain in the stack concatenates a handful of slices; the
/// builder keeps those call sites free of intermediate buffers.
#[derive(Default)]
pub struct HashBuilder {
    digest: Sha256,
}

impl HashBuilder {
    pub fn new() -> Self {
        Self { digest: Sha256::new() }
    }

    pub fn update(mut self, data: impl AsRef<[u8]>) -> Self {
        self.digest.update(data.as_ref());
        self
    }

    pub fn finalize(self) -> Hash {
        Hash(self.digest.finalize().into())
    }
}

/// Full 32-byte SHA-256 digest.
#[derive(Debug, Default, PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    /// Digest of one contiguous input.
    pub fn of(data: &[u8]) -> Self {
        HashBuilder::new().update(data).finalize()
    }

    /// Decodes a full digest from the front of a wire field.
    pub fn read_from(bytes: &[u8]) -> Result<Self, RnsError> {
        let raw = bytes
            .get(..HASH_SIZE)
            .and_then(|slice| <[u8; HASH_SIZE]>::try_from(slice).ok())
            .ok_or(RnsError::Malformed)?;
        Ok(Self(raw))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// The leading 16 bytes: the address form everything on the wire uses.
    pub fn truncated(&self) -> AddressHash {
        let mut out = [0u8; ADDRESS_HASH_SIZE];
        out.copy_from_slice(&self.0[..ADDRESS_HASH_SIZE]);
        AddressHash(out)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; HASH_SIZE]> for Hash {
    fn from(raw: [u8; HASH_SIZE]) -> Self {
        Self(raw)
    }
}

impl From<Hash> for [u8; HASH_SIZE] {
    fn from(hash: Hash) -> Self {
        hash.0
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Truncated 16-byte hash used for every on-wire address.
#[derive(Debug, Default, PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash)]
pub struct AddressHash([u8; ADDRESS_HASH_SIZE]);

impl AddressHash {
    /// Truncated digest of one contiguous input.
    pub fn of(data: &[u8]) -> Self {
        Hash::of(data).truncated()
    }

    /// Decodes an address from the front of a wire field.
    pub fn read_from(bytes: &[u8]) -> Result<Self, RnsError> {
        let raw = bytes
            .get(..ADDRESS_HASH_SIZE)
            .and_then(|slice| <[u8; ADDRESS_HASH_SIZE]>::try_from(slice).ok())
            .ok_or(RnsError::Malformed)?;
        Ok(Self(raw))
    }

    pub fn from_hex(text: &str) -> Result<Self, RnsError> {
        let bytes = hex::decode(text).map_err(|_| RnsError::InvalidArgument)?;
        if bytes.len() != ADDRESS_HASH_SIZE {
            return Err(RnsError::InvalidArgument);
        }
        Self::read_from(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; ADDRESS_HASH_SIZE]> for AddressHash {
    fn from(raw: [u8; ADDRESS_HASH_SIZE]) -> Self {
        Self(raw)
    }
}

impl From<&Hash> for AddressHash {
    fn from(hash: &Hash) -> Self {
        hash.truncated()
    }
}

impl AsRef<[u8]> for AddressHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for AddressHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}
