pub mod token;

use std::io::Read;
use std::io::Write;

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;
use hkdf::Hkdf;
use sha2::{Digest, Sha256, Sha512};

use crate::error::RnsError;

pub use token::{Token, TOKEN_OVERHEAD};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::new().chain_update(data).finalize().into()
}

pub fn sha512(data: &[u8]) -> [u8; 64] {
    Sha512::new().chain_update(data).finalize().into()
}

/// RFC 5869 HKDF over SHA-256 with an empty info field.
pub fn hkdf(length: usize, ikm: &[u8], salt: Option<&[u8]>) -> Result<Vec<u8>, RnsError> {
    let mut out = vec![0u8; length];

    Hkdf::<Sha256>::new(salt, ikm)
        .expand(&[], &mut out[..])
        .map_err(|_| RnsError::InvalidArgument)?;

    Ok(out)
}

pub fn bz2_compress(data: &[u8]) -> Result<Vec<u8>, RnsError> {
    let mut encoder = BzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data).map_err(|_| RnsError::CryptoError)?;
    encoder.finish().map_err(|_| RnsError::CryptoError)
}

pub fn bz2_decompress(data: &[u8]) -> Result<Vec<u8>, RnsError> {
    let mut decoder = BzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(|_| RnsError::CryptoError)?;
    Ok(out)
}
