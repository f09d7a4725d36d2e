use core::fmt;
use core::ops::Deref;
use std::sync::Arc;

/// Immutable variable-length octet buffer with copy-on-write sharing.
///
/// Cloning is a reference-count bump; mutation only copies when the backing
/// storage is shared. Payload-sized data (resource contents, app data) moves
/// through the stack as `Bytes` so callbacks and tables can retain it without
/// duplicating the allocation.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Bytes {
    inner: Arc<Vec<u8>>,
}

impl Bytes {
    pub fn new() -> Self {
        Self { inner: Arc::new(Vec::new()) }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self { inner: Arc::new(data.to_vec()) }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { inner: Arc::new(data) }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.inner.as_slice()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.inner.as_ref().clone()
    }

    /// Appends `data`, copying the backing storage only when it is shared.
    pub fn append(&mut self, data: &[u8]) {
        Arc::make_mut(&mut self.inner).extend_from_slice(data);
    }

    /// Truncates to `len` bytes, copying only when shared.
    pub fn truncate(&mut self, len: usize) {
        Arc::make_mut(&mut self.inner).truncate(len);
    }

    pub fn slice(&self, start: usize, end: usize) -> Self {
        Self::from_slice(&self.inner[start..end])
    }
}

impl Deref for Bytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<&[u8]> for Bytes {
    fn from(data: &[u8]) -> Self {
        Self::from_slice(data)
    }
}

impl From<Vec<u8>> for Bytes {
    fn from(data: Vec<u8>) -> Self {
        Self::from_vec(data)
    }
}

impl fmt::Debug for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bytes[{}]", self.len())
    }
}

impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[ 0x")?;
        for byte in self.inner.iter() {
            write!(f, "{:0>2x}", byte)?;
        }
        write!(f, " ]")
    }
}
