pub mod link;

use core::fmt;
use core::marker::PhantomData;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypt::Token;
use crate::error::RnsError;
use crate::hash::{AddressHash, Hash, ADDRESS_HASH_SIZE};
use crate::identity::{
    Identity, PrivateIdentity, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH,
};
use crate::packet::{
    ContextFlag, DestinationType, Header, HeaderType, IfacFlag, Packet, PacketContext,
    PacketDataBuffer, PacketType, PropagationType,
};
use crate::storage::Store;

//***************************************************************************//

mod kind {
    pub trait Sealed {}
}

/// Compile-time marker for the destination kind carried in packet headers.
///
/// Direction needs no marker of its own: it follows from the identity half
/// a destination holds. A `PrivateIdentity` destination can decrypt and
/// announce (inbound); a bare `Identity` only addresses a remote peer
/// (outbound); plain destinations hold no identity at all.
pub trait Kind: kind::Sealed {
    const DESTINATION_TYPE: DestinationType;
}

pub struct Single;
pub struct Plain;
pub struct Group;

impl kind::Sealed for Single {}
impl kind::Sealed for Plain {}
impl kind::Sealed for Group {}

impl Kind for Single {
    const DESTINATION_TYPE: DestinationType = DestinationType::Single;
}

impl Kind for Plain {
    const DESTINATION_TYPE: DestinationType = DestinationType::Plain;
}

impl Kind for Group {
    const DESTINATION_TYPE: DestinationType = DestinationType::Group;
}

//***************************************************************************//

pub const NAME_HASH_LENGTH: usize = 10;
pub const RAND_HASH_LENGTH: usize = 10;
pub const RATCHET_LENGTH: usize = PUBLIC_KEY_LENGTH;
pub const MIN_ANNOUNCE_DATA_LENGTH: usize =
    PUBLIC_KEY_LENGTH * 2 + NAME_HASH_LENGTH + RAND_HASH_LENGTH + SIGNATURE_LENGTH;

const DEFAULT_RATCHET_INTERVAL_SECS: u64 = 30 * 60;
const DEFAULT_RETAINED_RATCHETS: usize = 128;

/// How a destination answers packets that request delivery confirmation.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ProofStrategy {
    ProveNone,
    ProveAll,
    ProveApp,
}

/// Symmetric group payload sealing with a pre-shared 32-byte key.
pub fn group_encrypt<R: CryptoRngCore>(
    key: &[u8; 32],
    rng: R,
    data: &[u8],
) -> Result<Vec<u8>, RnsError> {
    Token::new(key)?.encrypt(rng, data)
}

pub fn group_decrypt(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, RnsError> {
    Token::new(key)?.decrypt(data)
}

/// Full destination name: `app_name.aspect1.aspect2...` The wire carries only
/// the leading 10 bytes of its SHA-256, so names learned from announces keep
/// the hash alone.
#[derive(Clone)]
pub struct DestinationName {
    pub full_name: Option<String>,
    name_hash: [u8; NAME_HASH_LENGTH],
}

impl DestinationName {
    pub fn new(app_name: &str, aspects: &str) -> Self {
        let full_name = format!("{}.{}", app_name, aspects);
        let hash = Hash::of(full_name.as_bytes());

        let mut name_hash = [0u8; NAME_HASH_LENGTH];
        name_hash.copy_from_slice(&hash.as_slice()[..NAME_HASH_LENGTH]);

        Self { full_name: Some(full_name), name_hash }
    }

    pub fn new_from_name_hash(hash_slice: &[u8]) -> Result<Self, RnsError> {
        if hash_slice.len() < NAME_HASH_LENGTH {
            return Err(RnsError::Malformed);
        }

        let mut name_hash = [0u8; NAME_HASH_LENGTH];
        name_hash.copy_from_slice(&hash_slice[..NAME_HASH_LENGTH]);

        Ok(Self { full_name: None, name_hash })
    }

    pub fn name_hash(&self) -> &[u8; NAME_HASH_LENGTH] {
        &self.name_hash
    }
}

/// Everything needed to address, verify and encrypt towards a destination.
#[derive(Clone)]
pub struct DestinationDesc {
    pub identity: Identity,
    pub address_hash: AddressHash,
    pub name: DestinationName,
}

impl DestinationDesc {
    /// Derives the address from the UTF-8 full name and the owning identity.
    pub fn new(identity: Identity, name: DestinationName) -> Self {
        let address_hash = derive_address(&name, Some(&identity));
        Self { identity, address_hash, name }
    }

    /// An identityless plain destination, addressed by name alone.
    pub fn plain(name: DestinationName) -> Self {
        let address_hash = derive_address(&name, None);
        Self { identity: Identity::default(), address_hash, name }
    }

    /// For destinations learned from announces, where the announced address
    /// is authoritative and only the name hash is known.
    pub fn new_from_announce(
        identity: Identity,
        name: DestinationName,
        address_hash: AddressHash,
    ) -> Self {
        Self { identity, address_hash, name }
    }
}

impl fmt::Display for DestinationDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.address_hash)
    }
}

fn derive_address(name: &DestinationName, identity: Option<&Identity>) -> AddressHash {
    let full_name = name.full_name.as_deref().unwrap_or("");

    let mut material = Vec::with_capacity(full_name.len() + ADDRESS_HASH_SIZE);
    material.extend_from_slice(full_name.as_bytes());
    if let Some(identity) = identity {
        material.extend_from_slice(identity.address_hash.as_slice());
    }

    AddressHash::of(&material)
}

fn unix_now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|value| value.as_secs()).unwrap_or(0)
}

//***************************************************************************//

#[derive(Serialize, Deserialize)]
struct PersistedRatchets {
    signature: ByteBuf,
    ratchets: ByteBuf,
}

/// Announce ratchet rotation. Links never rotate keys; ratchets only widen
/// the identity-encryption surface advertised in announces.
struct RatchetState {
    enabled: bool,
    ratchets: Vec<[u8; RATCHET_LENGTH]>,
    store_path: Option<String>,
    interval_secs: u64,
    retained: usize,
    latest_rotation: u64,
}

impl Default for RatchetState {
    fn default() -> Self {
        Self {
            enabled: false,
            ratchets: Vec::new(),
            store_path: None,
            interval_secs: DEFAULT_RATCHET_INTERVAL_SECS,
            retained: DEFAULT_RETAINED_RATCHETS,
            latest_rotation: 0,
        }
    }
}

impl RatchetState {
    fn rotate_if_needed<R: CryptoRngCore>(&mut self, rng: R, now: u64) {
        if !self.enabled {
            return;
        }

        if self.ratchets.is_empty() || now > self.latest_rotation + self.interval_secs {
            let secret = StaticSecret::random_from_rng(rng);
            self.ratchets.insert(0, secret.to_bytes());
            self.latest_rotation = now;
            if self.ratchets.len() > self.retained {
                self.ratchets.truncate(self.retained);
            }
        }
    }

    fn current_public(&self) -> Option<[u8; RATCHET_LENGTH]> {
        let ratchet = self.ratchets.first()?;
        let secret = StaticSecret::from(*ratchet);
        Some(*PublicKey::from(&secret).as_bytes())
    }

    fn persist(&self, identity: &PrivateIdentity, store: &mut dyn Store) -> Result<(), RnsError> {
        let Some(path) = self.store_path.as_ref() else {
            return Ok(());
        };

        let list: Vec<ByteBuf> =
            self.ratchets.iter().map(|ratchet| ByteBuf::from(ratchet.to_vec())).collect();
        let packed = rmp_serde::to_vec(&list).map_err(|_| RnsError::StorageError)?;
        let signature = identity.sign(&packed).to_bytes();
        let persisted = PersistedRatchets {
            signature: ByteBuf::from(signature.to_vec()),
            ratchets: ByteBuf::from(packed),
        };
        let encoded = rmp_serde::to_vec(&persisted).map_err(|_| RnsError::StorageError)?;

        store.store(path, &encoded)
    }

    fn reload(&mut self, identity: &PrivateIdentity, store: &mut dyn Store) -> Result<(), RnsError> {
        let Some(path) = self.store_path.as_ref() else {
            return Ok(());
        };

        let Some(data) = store.load(path)? else {
            self.ratchets.clear();
            return Ok(());
        };

        let persisted: PersistedRatchets =
            rmp_serde::from_slice(&data).map_err(|_| RnsError::Malformed)?;
        identity
            .as_identity()
            .verify_slice(persisted.ratchets.as_ref(), persisted.signature.as_ref())?;

        let decoded: Vec<ByteBuf> =
            rmp_serde::from_slice(persisted.ratchets.as_ref()).map_err(|_| RnsError::Malformed)?;

        self.ratchets = decoded
            .into_iter()
            .filter(|ratchet| ratchet.len() == RATCHET_LENGTH)
            .map(|ratchet| {
                let mut bytes = [0u8; RATCHET_LENGTH];
                bytes.copy_from_slice(ratchet.as_ref());
                bytes
            })
            .collect();

        Ok(())
    }
}

//***************************************************************************//

pub type RequestHandler = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>>>;

/// Hash a request path string into the 16-byte id carried on the wire.
pub fn request_path_hash(path: &str) -> AddressHash {
    AddressHash::of(path.as_bytes())
}

pub struct Destination<I, K: Kind> {
    pub identity: I,
    pub desc: DestinationDesc,
    pub proof_strategy: ProofStrategy,
    pub accept_link_requests: bool,
    ratchet_state: RatchetState,
    request_handlers: HashMap<AddressHash, RequestHandler>,
    kind: PhantomData<K>,
}

impl<I, K: Kind> Destination<I, K> {
    fn assemble(identity: I, desc: DestinationDesc) -> Self {
        Self {
            identity,
            desc,
            proof_strategy: ProofStrategy::ProveNone,
            accept_link_requests: false,
            ratchet_state: RatchetState::default(),
            request_handlers: HashMap::new(),
            kind: PhantomData,
        }
    }

    pub fn destination_type(&self) -> DestinationType {
        K::DESTINATION_TYPE
    }

    pub fn address_hash(&self) -> &AddressHash {
        &self.desc.address_hash
    }
}

pub type SingleInputDestination = Destination<PrivateIdentity, Single>;
pub type SingleOutputDestination = Destination<Identity, Single>;
pub type PlainDestination = Destination<(), Plain>;
pub type PlainInputDestination = PlainDestination;
pub type PlainOutputDestination = PlainDestination;

impl SingleInputDestination {
    pub fn new(identity: PrivateIdentity, name: DestinationName) -> Self {
        let desc = DestinationDesc::new(*identity.as_identity(), name);
        Self::assemble(identity, desc)
    }

    pub fn set_proof_strategy(&mut self, strategy: ProofStrategy) {
        self.proof_strategy = strategy;
    }

    pub fn set_accept_link_requests(&mut self, accept: bool) {
        self.accept_link_requests = accept;
    }

    pub fn enable_ratchets(&mut self, store_path: Option<&str>) {
        self.ratchet_state.enabled = true;
        self.ratchet_state.store_path = store_path.map(str::to_string);
    }

    pub fn reload_ratchets(&mut self, store: &mut dyn Store) -> Result<(), RnsError> {
        let identity = self.identity.clone();
        self.ratchet_state.reload(&identity, store)
    }

    pub fn persist_ratchets(&self, store: &mut dyn Store) -> Result<(), RnsError> {
        self.ratchet_state.persist(&self.identity, store)
    }

    pub fn register_request_handler(&mut self, path: &str, handler: RequestHandler) {
        self.request_handlers.insert(request_path_hash(path), handler);
    }

    pub fn deregister_request_handler(&mut self, path: &str) {
        self.request_handlers.remove(&request_path_hash(path));
    }

    pub(crate) fn call_request_handler(
        &mut self,
        path_hash: &AddressHash,
        data: &[u8],
    ) -> Option<Vec<u8>> {
        let handler = self.request_handlers.get_mut(path_hash)?;
        handler(data)
    }

    /// Decrypts identity-encrypted data addressed to this destination,
    /// trying announced ratchet keys before the long-lived identity key.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, RnsError> {
        let salt = *self.identity.address_hash();

        for ratchet in &self.ratchet_state.ratchets {
            if let Ok(plaintext) = decrypt_with_ratchet(ratchet, salt.as_slice(), ciphertext) {
                return Ok(plaintext);
            }
        }

        self.identity.decrypt(ciphertext, salt.as_slice())
    }

    /// Produces an announce packet: keys, optional ratchet, name and random
    /// hashes, app data and a trailing signature over the destination hash
    /// plus every preceding payload byte.
    pub fn announce<R: CryptoRngCore>(
        &mut self,
        mut rng: R,
        app_data: Option<&[u8]>,
    ) -> Result<Packet, RnsError> {
        // Announce randomness: 5 random bytes followed by the low 5 bytes of
        // a big-endian unix timestamp, keeping announce freshness ordering
        // interoperable.
        let mut rand_hash = [0u8; RAND_HASH_LENGTH];
        rng.fill_bytes(&mut rand_hash[..RAND_HASH_LENGTH / 2]);
        let emitted_be = unix_now_secs().to_be_bytes();
        rand_hash[RAND_HASH_LENGTH / 2..].copy_from_slice(&emitted_be[3..8]);

        let ratchet = if self.ratchet_state.enabled {
            self.ratchet_state.rotate_if_needed(&mut rng, unix_now_secs());
            self.ratchet_state.current_public()
        } else {
            None
        };

        let verifying_key = self.desc.identity.verifying_key_bytes();
        let public_key = self.desc.identity.public_key_bytes();

        let mut signed_data = PacketDataBuffer::new();
        signed_data
            .chain_write(self.desc.address_hash.as_slice())?
            .chain_write(verifying_key)?
            .chain_write(public_key)?;
        if let Some(ratchet) = ratchet.as_ref() {
            signed_data.write(ratchet)?;
        }
        signed_data
            .chain_write(self.desc.name.name_hash())?
            .chain_write(&rand_hash)?;
        if let Some(data) = app_data {
            signed_data.write(data)?;
        }

        let signature = self.identity.sign(signed_data.as_slice());

        let mut packet_data = PacketDataBuffer::new();
        packet_data.chain_write(verifying_key)?.chain_write(public_key)?;
        if let Some(ratchet) = ratchet.as_ref() {
            packet_data.write(ratchet)?;
        }
        packet_data.chain_write(self.desc.name.name_hash())?.chain_write(&rand_hash)?;
        if let Some(data) = app_data {
            packet_data.write(data)?;
        }
        packet_data.write(&signature.to_bytes())?;

        Ok(Packet {
            header: Header {
                ifac_flag: IfacFlag::Open,
                header_type: HeaderType::Type1,
                context_flag: if ratchet.is_some() { ContextFlag::Set } else { ContextFlag::Unset },
                propagation_type: PropagationType::Broadcast,
                destination_type: DestinationType::Single,
                packet_type: PacketType::Announce,
                hops: 0,
            },
            destination: self.desc.address_hash,
            transport: None,
            context: PacketContext::None,
            data: packet_data,
        })
    }

    /// An announce answering a path request.
    pub fn path_response<R: CryptoRngCore>(
        &mut self,
        rng: R,
        app_data: Option<&[u8]>,
    ) -> Result<Packet, RnsError> {
        let mut announce = self.announce(rng, app_data)?;
        announce.context = PacketContext::PathResponse;
        Ok(announce)
    }
}

fn decrypt_with_ratchet(
    ratchet: &[u8; RATCHET_LENGTH],
    salt: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, RnsError> {
    if ciphertext.len() <= PUBLIC_KEY_LENGTH {
        return Err(RnsError::Malformed);
    }

    let mut key_data = [0u8; PUBLIC_KEY_LENGTH];
    key_data.copy_from_slice(&ciphertext[..PUBLIC_KEY_LENGTH]);
    let ephemeral_public = PublicKey::from(key_data);

    let secret = StaticSecret::from(*ratchet);
    let shared = secret.diffie_hellman(&ephemeral_public);
    if !shared.was_contributory() {
        return Err(RnsError::CryptoError);
    }

    let key = crate::crypt::hkdf(crate::identity::DERIVED_KEY_LENGTH, shared.as_bytes(), Some(salt))?;
    Token::new(&key)?.decrypt(&ciphertext[PUBLIC_KEY_LENGTH..])
}

impl SingleOutputDestination {
    pub fn new(identity: Identity, name: DestinationName) -> Self {
        Self::assemble(identity, DestinationDesc::new(identity, name))
    }

    /// Builds an outbound destination from announce contents, where only the
    /// name hash and the announced address are known.
    pub fn new_from_announce(
        identity: Identity,
        name: DestinationName,
        address_hash: AddressHash,
    ) -> Self {
        Self::assemble(identity, DestinationDesc::new_from_announce(identity, name, address_hash))
    }

    /// Encrypts towards this destination with its identity key.
    pub fn encrypt<R: CryptoRngCore>(&self, rng: R, plaintext: &[u8]) -> Result<Vec<u8>, RnsError> {
        self.identity.encrypt(rng, plaintext, self.identity.address_hash.as_slice())
    }
}

impl PlainDestination {
    pub fn new(name: DestinationName) -> Self {
        Self::assemble((), DestinationDesc::plain(name))
    }
}

pub fn new_in(identity: PrivateIdentity, app_name: &str, aspect: &str) -> SingleInputDestination {
    SingleInputDestination::new(identity, DestinationName::new(app_name, aspect))
}

pub fn new_out(identity: Identity, app_name: &str, aspect: &str) -> SingleOutputDestination {
    SingleOutputDestination::new(identity, DestinationName::new(app_name, aspect))
}

//***************************************************************************//

pub type DestinationAnnounce = Packet;

pub struct AnnounceInfo<'a> {
    pub destination: SingleOutputDestination,
    pub app_data: &'a [u8],
    pub ratchet: Option<[u8; RATCHET_LENGTH]>,
}

impl DestinationAnnounce {
    /// Validates an announce packet and extracts the announced destination.
    pub fn validate(packet: &Packet) -> Result<AnnounceInfo<'_>, RnsError> {
        if packet.header.packet_type != PacketType::Announce {
            return Err(RnsError::Malformed);
        }

        let announce_data = packet.data.as_slice();
        let has_ratchet = packet.header.context_flag == ContextFlag::Set;

        let mut expected = MIN_ANNOUNCE_DATA_LENGTH;
        if has_ratchet {
            expected += RATCHET_LENGTH;
        }
        if announce_data.len() < expected {
            return Err(RnsError::Malformed);
        }

        let mut offset = 0usize;

        let verifying_key = &announce_data[offset..offset + PUBLIC_KEY_LENGTH];
        offset += PUBLIC_KEY_LENGTH;
        let public_key = &announce_data[offset..offset + PUBLIC_KEY_LENGTH];
        offset += PUBLIC_KEY_LENGTH;

        let identity = Identity::new_from_slices(verifying_key, public_key)?;

        let ratchet = if has_ratchet {
            let mut bytes = [0u8; RATCHET_LENGTH];
            bytes.copy_from_slice(&announce_data[offset..offset + RATCHET_LENGTH]);
            offset += RATCHET_LENGTH;
            Some(bytes)
        } else {
            None
        };

        let name_hash = &announce_data[offset..offset + NAME_HASH_LENGTH];
        offset += NAME_HASH_LENGTH + RAND_HASH_LENGTH;

        let sig_start = announce_data.len() - SIGNATURE_LENGTH;
        if sig_start < offset {
            return Err(RnsError::Malformed);
        }
        let app_data = &announce_data[offset..sig_start];
        let signature = &announce_data[sig_start..];

        // The signed region is the destination hash followed by the payload.
        let mut signed_data = PacketDataBuffer::new();
        signed_data
            .chain_write(packet.destination.as_slice())?
            .chain_write(&announce_data[..sig_start])?;

        identity.verify_slice(signed_data.as_slice(), signature)?;

        let name = DestinationName::new_from_name_hash(name_hash)?;
        let destination =
            SingleOutputDestination::new_from_announce(identity, name, packet.destination);

        Ok(AnnounceInfo { destination, app_data, ratchet })
    }
}
