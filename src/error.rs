use core::fmt;

/// Crate-wide error type. Recovery is always local: no variant crosses more
/// than one layer before being converted into a status or a callback.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum RnsError {
    /// Bad header, truncated packet or msgpack decode failure.
    Malformed,
    /// HMAC mismatch or signature verification failure.
    AuthFailure,
    /// A fixed-capacity pool or table rejected an insertion.
    Capacity,
    /// A deadline elapsed for a receipt, advertisement, request or handshake.
    Timeout,
    /// The remote side closed, or the link went stale past the close window.
    PeerClosed,
    /// PKCS7 padding, BZ2 decode or key exchange failure.
    CryptoError,
    /// Internal consistency violation, e.g. a part index out of bounds.
    InvariantViolation,
    /// An argument outside the accepted domain.
    InvalidArgument,
    /// A destination, link or table entry was not found.
    NotFound,
    /// A buffer was too small for the produced output.
    OutOfMemory,
    /// The persistence backend failed.
    StorageError,
}

impl fmt::Display for RnsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RnsError::Malformed => "malformed input",
            RnsError::AuthFailure => "authentication failure",
            RnsError::Capacity => "table capacity exceeded",
            RnsError::Timeout => "deadline exceeded",
            RnsError::PeerClosed => "peer closed",
            RnsError::CryptoError => "cryptographic operation failed",
            RnsError::InvariantViolation => "internal invariant violated",
            RnsError::InvalidArgument => "invalid argument",
            RnsError::NotFound => "not found",
            RnsError::OutOfMemory => "buffer too small",
            RnsError::StorageError => "storage backend failure",
        };

        write!(f, "{}", text)
    }
}

impl std::error::Error for RnsError {}
