use aes::cipher::block_padding::Pkcs7;
use aes::cipher::BlockDecryptMut;
use cbc::cipher::BlockEncryptMut;
use cbc::cipher::KeyIvInit;
use hmac::{Hmac, Mac};
use rand_core::CryptoRngCore;
use sha2::Sha256;

use crate::error::RnsError;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

type HmacSha256 = Hmac<Sha256>;

pub const TOKEN_IV_SIZE: usize = 16;
pub const TOKEN_HMAC_SIZE: usize = 32;
pub const TOKEN_OVERHEAD: usize = TOKEN_IV_SIZE + TOKEN_HMAC_SIZE;
pub const AES_BLOCK_SIZE: usize = 16;

/// Token key lengths: 32 bytes selects AES-128-CBC, 64 bytes AES-256-CBC.
pub const TOKEN_KEY_SIZE_AES128: usize = 32;
pub const TOKEN_KEY_SIZE_AES256: usize = 64;

enum TokenKeys {
    Aes128 { sign_key: [u8; 16], enc_key: [u8; 16] },
    Aes256 { sign_key: [u8; 32], enc_key: [u8; 32] },
}

/// Encrypt-then-MAC AEAD over AES-CBC-PKCS7 and HMAC-SHA256.
///
/// This follows the Fernet construction with the version and timestamp
/// fields stripped: they carry no meaning on a Reticulum link and leak
/// initiator metadata. A token is `IV(16) ‖ ciphertext ‖ HMAC(32)` and the
/// MAC is always verified before any decryption is attempted.
pub struct Token {
    keys: TokenKeys,
}

impl Token {
    /// Splits `key` into signing and encryption halves.
    pub fn new(key: &[u8]) -> Result<Self, RnsError> {
        match key.len() {
            TOKEN_KEY_SIZE_AES128 => {
                let mut sign_key = [0u8; 16];
                let mut enc_key = [0u8; 16];
                sign_key.copy_from_slice(&key[..16]);
                enc_key.copy_from_slice(&key[16..]);
                Ok(Self { keys: TokenKeys::Aes128 { sign_key, enc_key } })
            }
            TOKEN_KEY_SIZE_AES256 => {
                let mut sign_key = [0u8; 32];
                let mut enc_key = [0u8; 32];
                sign_key.copy_from_slice(&key[..32]);
                enc_key.copy_from_slice(&key[32..]);
                Ok(Self { keys: TokenKeys::Aes256 { sign_key, enc_key } })
            }
            _ => Err(RnsError::InvalidArgument),
        }
    }

    /// Token length produced for a plaintext of `plaintext_len` bytes.
    pub const fn token_len(plaintext_len: usize) -> usize {
        TOKEN_OVERHEAD + (plaintext_len / AES_BLOCK_SIZE + 1) * AES_BLOCK_SIZE
    }

    pub fn encrypt<R: CryptoRngCore>(
        &self,
        mut rng: R,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, RnsError> {
        let mut iv = [0u8; TOKEN_IV_SIZE];
        rng.fill_bytes(&mut iv);

        let padded_len = (plaintext.len() / AES_BLOCK_SIZE + 1) * AES_BLOCK_SIZE;
        let mut out = vec![0u8; TOKEN_IV_SIZE + padded_len + TOKEN_HMAC_SIZE];
        out[..TOKEN_IV_SIZE].copy_from_slice(&iv);

        let cipher_len = match &self.keys {
            TokenKeys::Aes128 { enc_key, .. } => Aes128CbcEnc::new(enc_key.into(), &iv.into())
                .encrypt_padded_b2b_mut::<Pkcs7>(
                    plaintext,
                    &mut out[TOKEN_IV_SIZE..TOKEN_IV_SIZE + padded_len],
                )
                .map_err(|_| RnsError::CryptoError)?
                .len(),
            TokenKeys::Aes256 { enc_key, .. } => Aes256CbcEnc::new(enc_key.into(), &iv.into())
                .encrypt_padded_b2b_mut::<Pkcs7>(
                    plaintext,
                    &mut out[TOKEN_IV_SIZE..TOKEN_IV_SIZE + padded_len],
                )
                .map_err(|_| RnsError::CryptoError)?
                .len(),
        };

        let signed_len = TOKEN_IV_SIZE + cipher_len;
        let mut mac = self.mac()?;
        mac.update(&out[..signed_len]);
        let tag = mac.finalize().into_bytes();

        out[signed_len..signed_len + TOKEN_HMAC_SIZE].copy_from_slice(tag.as_slice());
        out.truncate(signed_len + TOKEN_HMAC_SIZE);

        Ok(out)
    }

    pub fn decrypt(&self, token: &[u8]) -> Result<Vec<u8>, RnsError> {
        if token.len() < TOKEN_OVERHEAD + AES_BLOCK_SIZE {
            return Err(RnsError::Malformed);
        }

        let tag_start = token.len() - TOKEN_HMAC_SIZE;

        let mut mac = self.mac()?;
        mac.update(&token[..tag_start]);
        mac.verify_slice(&token[tag_start..]).map_err(|_| RnsError::AuthFailure)?;

        let iv: [u8; TOKEN_IV_SIZE] =
            token[..TOKEN_IV_SIZE].try_into().map_err(|_| RnsError::Malformed)?;
        let ciphertext = &token[TOKEN_IV_SIZE..tag_start];

        if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_SIZE != 0 {
            return Err(RnsError::Malformed);
        }

        let mut out = vec![0u8; ciphertext.len()];

        let plain_len = match &self.keys {
            TokenKeys::Aes128 { enc_key, .. } => Aes128CbcDec::new(enc_key.into(), &iv.into())
                .decrypt_padded_b2b_mut::<Pkcs7>(ciphertext, &mut out)
                .map_err(|_| RnsError::CryptoError)?
                .len(),
            TokenKeys::Aes256 { enc_key, .. } => Aes256CbcDec::new(enc_key.into(), &iv.into())
                .decrypt_padded_b2b_mut::<Pkcs7>(ciphertext, &mut out)
                .map_err(|_| RnsError::CryptoError)?
                .len(),
        };

        out.truncate(plain_len);

        Ok(out)
    }

    fn mac(&self) -> Result<HmacSha256, RnsError> {
        let sign_key: &[u8] = match &self.keys {
            TokenKeys::Aes128 { sign_key, .. } => sign_key,
            TokenKeys::Aes256 { sign_key, .. } => sign_key,
        };

        <HmacSha256 as Mac>::new_from_slice(sign_key).map_err(|_| RnsError::InvalidArgument)
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;
    use rand_core::RngCore;

    use super::{Token, TOKEN_KEY_SIZE_AES128, TOKEN_KEY_SIZE_AES256, TOKEN_OVERHEAD};
    use crate::error::RnsError;

    fn random_key(len: usize) -> Vec<u8> {
        let mut key = vec![0u8; len];
        OsRng.fill_bytes(&mut key);
        key
    }

    #[test]
    fn aes128_roundtrip() {
        let token = Token::new(&random_key(TOKEN_KEY_SIZE_AES128)).expect("token");
        let plaintext = b"#TOKEN_TEST_MESSAGE#";

        let encrypted = token.encrypt(OsRng, plaintext).expect("encrypt");
        let decrypted = token.decrypt(&encrypted).expect("decrypt");

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn aes256_roundtrip() {
        let token = Token::new(&random_key(TOKEN_KEY_SIZE_AES256)).expect("token");
        let plaintext = vec![0xA5u8; 300];

        let encrypted = token.encrypt(OsRng, &plaintext).expect("encrypt");
        let decrypted = token.decrypt(&encrypted).expect("decrypt");

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn empty_plaintext_roundtrip() {
        let token = Token::new(&random_key(TOKEN_KEY_SIZE_AES128)).expect("token");

        let encrypted = token.encrypt(OsRng, b"").expect("encrypt");
        assert_eq!(encrypted.len(), TOKEN_OVERHEAD + 16);

        let decrypted = token.decrypt(&encrypted).expect("decrypt");
        assert!(decrypted.is_empty());
    }

    #[test]
    fn flipping_any_byte_fails_authentication() {
        let token = Token::new(&random_key(TOKEN_KEY_SIZE_AES128)).expect("token");
        let encrypted = token.encrypt(OsRng, b"tamper target").expect("encrypt");

        for index in 0..encrypted.len() {
            let mut tampered = encrypted.clone();
            tampered[index] ^= 0x01;
            assert_eq!(token.decrypt(&tampered), Err(RnsError::AuthFailure));
        }
    }

    #[test]
    fn short_input_is_rejected() {
        let token = Token::new(&random_key(TOKEN_KEY_SIZE_AES128)).expect("token");

        assert_eq!(token.decrypt(&[0u8; 16]), Err(RnsError::Malformed));
        assert_eq!(token.decrypt(&[]), Err(RnsError::Malformed));
    }

    #[test]
    fn rejects_unsupported_key_lengths() {
        assert!(Token::new(&[0u8; 16]).is_err());
        assert!(Token::new(&[0u8; 48]).is_err());
    }
}
