use ed25519_dalek::{ed25519::signature::Signer, Signature, SigningKey, VerifyingKey};
use rand_core::CryptoRngCore;
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret, StaticSecret};

use crate::bytes::Bytes;
use crate::crypt::{hkdf, Token};
use crate::error::RnsError;
use crate::hash::{AddressHash, Hash, HashBuilder};

pub const PUBLIC_KEY_LENGTH: usize = ed25519_dalek::PUBLIC_KEY_LENGTH;
pub const PRIVATE_KEY_LENGTH: usize = PUBLIC_KEY_LENGTH * 2;
pub const SIGNATURE_LENGTH: usize = ed25519_dalek::SIGNATURE_LENGTH;

/// Links and identity encryption derive 32-byte Token keys (AES-128-CBC).
pub const DERIVED_KEY_LENGTH: usize = 32;

/// Bounded identity cache: destination hash to learned identity and ratchet.
pub const KNOWN_DESTINATIONS_CAPACITY: usize = 192;

/// Public half of an identity: an Ed25519 verifying key for signatures and
/// an X25519 public key for key agreement. The address hash is the first 16
/// bytes of SHA-256 over the two public keys, signing key first.
#[derive(Debug, Copy, Clone)]
pub struct Identity {
    pub public_key: PublicKey,
    pub verifying_key: VerifyingKey,
    pub address_hash: AddressHash,
}

impl Identity {
    pub fn new(verifying_key: VerifyingKey, public_key: PublicKey) -> Self {
        let address_hash = HashBuilder::new()
            .update(verifying_key.as_bytes())
            .update(public_key.as_bytes())
            .finalize()
            .truncated();

        Self { public_key, verifying_key, address_hash }
    }

    pub fn new_from_slices(verifying_key: &[u8], public_key: &[u8]) -> Result<Self, RnsError> {
        if verifying_key.len() < PUBLIC_KEY_LENGTH || public_key.len() < PUBLIC_KEY_LENGTH {
            return Err(RnsError::Malformed);
        }

        let public_key = {
            let mut key_data = [0u8; PUBLIC_KEY_LENGTH];
            key_data.copy_from_slice(&public_key[..PUBLIC_KEY_LENGTH]);
            PublicKey::from(key_data)
        };

        let verifying_key = {
            let mut key_data = [0u8; PUBLIC_KEY_LENGTH];
            key_data.copy_from_slice(&verifying_key[..PUBLIC_KEY_LENGTH]);
            VerifyingKey::from_bytes(&key_data).map_err(|_| RnsError::CryptoError)?
        };

        Ok(Self::new(verifying_key, public_key))
    }

    pub fn public_key_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        self.public_key.as_bytes()
    }

    pub fn verifying_key_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.as_bytes()
    }

    pub fn verify(&self, data: &[u8], signature: &Signature) -> Result<(), RnsError> {
        self.verifying_key.verify_strict(data, signature).map_err(|_| RnsError::AuthFailure)
    }

    pub fn verify_slice(&self, data: &[u8], signature: &[u8]) -> Result<(), RnsError> {
        let signature = Signature::from_slice(signature).map_err(|_| RnsError::AuthFailure)?;
        self.verify(data, &signature)
    }

    /// Encrypts for this identity: an ephemeral X25519 exchange followed by a
    /// Token sealed under `hkdf(32, shared, salt)`. Output is
    /// `ephemeral_pub(32) ‖ token`.
    pub fn encrypt<R: CryptoRngCore>(
        &self,
        mut rng: R,
        plaintext: &[u8],
        salt: &[u8],
    ) -> Result<Vec<u8>, RnsError> {
        let ephemeral_key = EphemeralSecret::random_from_rng(&mut rng);
        let ephemeral_public = PublicKey::from(&ephemeral_key);

        let shared = ephemeral_key.diffie_hellman(&self.public_key);
        let token = derive_token(&shared, salt)?;

        let mut out = Vec::with_capacity(PUBLIC_KEY_LENGTH + Token::token_len(plaintext.len()));
        out.extend_from_slice(ephemeral_public.as_bytes());
        out.extend_from_slice(&token.encrypt(rng, plaintext)?);

        Ok(out)
    }

    pub fn to_hex(&self) -> String {
        format!(
            "{}{}",
            hex::encode(self.verifying_key.as_bytes()),
            hex::encode(self.public_key.as_bytes())
        )
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::new(VerifyingKey::default(), PublicKey::from([0u8; PUBLIC_KEY_LENGTH]))
    }
}

/// Full identity holding both private halves.
#[derive(Clone)]
pub struct PrivateIdentity {
    identity: Identity,
    private_key: StaticSecret,
    sign_key: SigningKey,
}

impl PrivateIdentity {
    pub fn new(private_key: StaticSecret, sign_key: SigningKey) -> Self {
        Self {
            identity: Identity::new(sign_key.verifying_key(), (&private_key).into()),
            private_key,
            sign_key,
        }
    }

    pub fn new_from_rand<R: CryptoRngCore>(mut rng: R) -> Self {
        let sign_key = SigningKey::generate(&mut rng);
        let private_key = StaticSecret::random_from_rng(rng);

        Self::new(private_key, sign_key)
    }

    /// Deterministic identity from a name, for reproducible test fixtures.
    pub fn new_from_name(name: &str) -> Self {
        let enc_seed: [u8; 32] = Hash::of(name.as_bytes()).into();
        let sign_seed: [u8; 32] = Hash::of(&enc_seed).into();

        Self::new(StaticSecret::from(enc_seed), SigningKey::from_bytes(&sign_seed))
    }

    pub fn from_private_key_bytes(bytes: &[u8]) -> Result<Self, RnsError> {
        if bytes.len() != PRIVATE_KEY_LENGTH {
            return Err(RnsError::InvalidArgument);
        }

        let mut private_key_bytes = [0u8; PUBLIC_KEY_LENGTH];
        let mut sign_key_bytes = [0u8; PUBLIC_KEY_LENGTH];
        private_key_bytes.copy_from_slice(&bytes[..PUBLIC_KEY_LENGTH]);
        sign_key_bytes.copy_from_slice(&bytes[PUBLIC_KEY_LENGTH..]);

        Ok(Self::new(StaticSecret::from(private_key_bytes), SigningKey::from_bytes(&sign_key_bytes)))
    }

    pub fn to_private_key_bytes(&self) -> [u8; PRIVATE_KEY_LENGTH] {
        let mut bytes = [0u8; PRIVATE_KEY_LENGTH];
        bytes[..PUBLIC_KEY_LENGTH].copy_from_slice(self.private_key.as_bytes());
        bytes[PUBLIC_KEY_LENGTH..].copy_from_slice(self.sign_key.as_bytes());
        bytes
    }

    pub fn as_identity(&self) -> &Identity {
        &self.identity
    }

    pub fn address_hash(&self) -> &AddressHash {
        &self.identity.address_hash
    }

    pub fn sign_key(&self) -> &SigningKey {
        &self.sign_key
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        self.sign_key.sign(data)
    }

    pub fn verify(&self, data: &[u8], signature: &Signature) -> Result<(), RnsError> {
        self.identity.verify(data, signature)
    }

    /// X25519 exchange with small-order/zero contributory rejection.
    pub fn exchange(&self, public_key: &PublicKey) -> Result<SharedSecret, RnsError> {
        let shared = self.private_key.diffie_hellman(public_key);
        if !shared.was_contributory() {
            return Err(RnsError::CryptoError);
        }
        Ok(shared)
    }

    /// Session key agreement: `hkdf(32, dh(self, peer), salt)` as a Token.
    pub fn derive_token(&self, public_key: &PublicKey, salt: &[u8]) -> Result<Token, RnsError> {
        let shared = self.exchange(public_key)?;
        derive_token(&shared, salt)
    }

    /// Inverse of [`Identity::encrypt`].
    pub fn decrypt(&self, ciphertext: &[u8], salt: &[u8]) -> Result<Vec<u8>, RnsError> {
        if ciphertext.len() <= PUBLIC_KEY_LENGTH {
            return Err(RnsError::Malformed);
        }

        let mut key_data = [0u8; PUBLIC_KEY_LENGTH];
        key_data.copy_from_slice(&ciphertext[..PUBLIC_KEY_LENGTH]);
        let ephemeral_public = PublicKey::from(key_data);

        let token = self.derive_token(&ephemeral_public, salt)?;
        token.decrypt(&ciphertext[PUBLIC_KEY_LENGTH..])
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_private_key_bytes())
    }
}

fn derive_token(shared: &SharedSecret, salt: &[u8]) -> Result<Token, RnsError> {
    if !shared.was_contributory() {
        return Err(RnsError::CryptoError);
    }

    let key = hkdf(DERIVED_KEY_LENGTH, shared.as_bytes(), Some(salt))?;
    Token::new(&key)
}

/// Seals towards a bare X25519 public key, e.g. an announced ratchet.
pub fn encrypt_for_public_key<R: CryptoRngCore>(
    mut rng: R,
    public_key: &PublicKey,
    plaintext: &[u8],
    salt: &[u8],
) -> Result<Vec<u8>, RnsError> {
    let ephemeral_key = EphemeralSecret::random_from_rng(&mut rng);
    let ephemeral_public = PublicKey::from(&ephemeral_key);

    let shared = ephemeral_key.diffie_hellman(public_key);
    let token = derive_token(&shared, salt)?;

    let mut out = Vec::with_capacity(PUBLIC_KEY_LENGTH + Token::token_len(plaintext.len()));
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&token.encrypt(rng, plaintext)?);

    Ok(out)
}

/// One learned remote destination.
#[derive(Clone)]
pub struct KnownDestination {
    pub identity: Identity,
    pub app_data: Bytes,
    pub ratchet: Option<[u8; PUBLIC_KEY_LENGTH]>,
    pub name_hash: [u8; 10],
    last_used: u64,
}

/// Bounded cache of learned destinations, evicting least-recently-used on
/// overflow. Writes happen only while processing validated announces.
pub struct KnownDestinations {
    entries: Vec<(AddressHash, KnownDestination)>,
    capacity: usize,
    clock: u64,
}

impl KnownDestinations {
    pub fn new() -> Self {
        Self::with_capacity(KNOWN_DESTINATIONS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { entries: Vec::new(), capacity, clock: 0 }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn remember(
        &mut self,
        destination: AddressHash,
        identity: Identity,
        app_data: Bytes,
        ratchet: Option<[u8; PUBLIC_KEY_LENGTH]>,
        name_hash: [u8; 10],
    ) {
        self.clock += 1;
        let stamp = self.clock;

        if let Some((_, entry)) = self.entries.iter_mut().find(|(hash, _)| *hash == destination) {
            entry.identity = identity;
            entry.app_data = app_data;
            entry.ratchet = ratchet;
            entry.name_hash = name_hash;
            entry.last_used = stamp;
            return;
        }

        if self.entries.len() >= self.capacity {
            if let Some(oldest) = self
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, (_, entry))| entry.last_used)
                .map(|(index, _)| index)
            {
                self.entries.swap_remove(oldest);
            }
        }

        self.entries.push((
            destination,
            KnownDestination { identity, app_data, ratchet, name_hash, last_used: stamp },
        ));
    }

    pub fn recall(&mut self, destination: &AddressHash) -> Option<&KnownDestination> {
        self.clock += 1;
        let stamp = self.clock;

        let entry = self.entries.iter_mut().find(|(hash, _)| hash == destination)?;
        entry.1.last_used = stamp;
        Some(&entry.1)
    }

    pub fn contains(&self, destination: &AddressHash) -> bool {
        self.entries.iter().any(|(hash, _)| hash == destination)
    }
}

impl Default for KnownDestinations {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::{Identity, KnownDestinations, PrivateIdentity};
    use crate::bytes::Bytes;
    use crate::hash::AddressHash;

    #[test]
    fn private_identity_bytes_roundtrip() {
        let original = PrivateIdentity::new_from_rand(OsRng);

        let restored = PrivateIdentity::from_private_key_bytes(&original.to_private_key_bytes())
            .expect("valid identity");

        assert_eq!(restored.address_hash(), original.address_hash());
    }

    #[test]
    fn encrypt_then_decrypt_returns_original() {
        let recipient = PrivateIdentity::new_from_rand(OsRng);
        let salt = *recipient.address_hash();
        let plaintext = b"identity encrypted payload";

        let ciphertext = recipient
            .as_identity()
            .encrypt(OsRng, plaintext, salt.as_slice())
            .expect("encrypt");
        let decrypted = recipient.decrypt(&ciphertext, salt.as_slice()).expect("decrypt");

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn decrypt_with_wrong_identity_fails() {
        let recipient = PrivateIdentity::new_from_rand(OsRng);
        let wrong = PrivateIdentity::new_from_rand(OsRng);
        let salt = *recipient.address_hash();

        let ciphertext = recipient
            .as_identity()
            .encrypt(OsRng, b"secret", salt.as_slice())
            .expect("encrypt");

        assert!(wrong.decrypt(&ciphertext, salt.as_slice()).is_err());
    }

    #[test]
    fn signature_verifies_and_rejects_tampering() {
        let identity = PrivateIdentity::new_from_rand(OsRng);
        let signature = identity.sign(b"announce body");

        assert!(identity.verify(b"announce body", &signature).is_ok());
        assert!(identity.verify(b"announce bodz", &signature).is_err());
    }

    #[test]
    fn known_destinations_evicts_least_recently_used() {
        let mut cache = KnownDestinations::with_capacity(2);
        let identity = *PrivateIdentity::new_from_rand(OsRng).as_identity();

        let first = AddressHash::from([1u8; 16]);
        let second = AddressHash::from([2u8; 16]);
        let third = AddressHash::from([3u8; 16]);

        cache.remember(first, identity, Bytes::new(), None, [0u8; 10]);
        cache.remember(second, identity, Bytes::new(), None, [0u8; 10]);

        // Touch the older entry so the other one becomes the eviction victim.
        assert!(cache.recall(&first).is_some());

        cache.remember(third, identity, Bytes::new(), None, [0u8; 10]);

        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&first));
        assert!(!cache.contains(&second));
        assert!(cache.contains(&third));
    }

    #[test]
    fn identity_hash_is_over_both_public_keys() {
        let identity = PrivateIdentity::new_from_rand(OsRng);

        let rebuilt = Identity::new_from_slices(
            identity.as_identity().verifying_key_bytes(),
            identity.as_identity().public_key_bytes(),
        )
        .expect("valid identity");

        assert_eq!(rebuilt.address_hash, *identity.address_hash());
    }
}
