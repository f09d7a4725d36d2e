use std::time::{Duration, Instant};

use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::bytes::Bytes;
use crate::crypt::{bz2_compress, bz2_decompress, sha256, Token};
use crate::error::RnsError;
use crate::hash::{Hash, HashBuilder, HASH_SIZE};
use crate::packet::{PacketContext, PacketType, SDU};

pub const MAPHASH_LEN: usize = 4;
pub const RANDOM_HASH_SIZE: usize = 4;
pub const HASHMAP_MAX_LEN: usize = 74;
pub const MAX_EFFICIENT_SIZE: usize = 1024 * 1024;
pub const RESOURCE_MAX_TRIES: u8 = 5;

pub const WINDOW: usize = 4;
pub const WINDOW_MIN: usize = 1;
pub const WINDOW_MAX: usize = 10;
pub const WINDOW_MAX_FAST: usize = 75;
const FAST_RATE_THRESHOLD: f32 = 6250.0;
const FAST_ROUNDS_REQUIRED: u32 = 4;

pub const FLAG_ENCRYPTED: u8 = 0x01;
pub const FLAG_COMPRESSED: u8 = 0x02;
pub const FLAG_SPLIT: u8 = 0x04;
pub const FLAG_REQUEST: u8 = 0x08;
pub const FLAG_RESPONSE: u8 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceStatus {
    None,
    Queued,
    Advertised,
    Transferring,
    Complete,
    Failed,
    Corrupt,
}

/// A packet the resource layer wants on the wire. The owning link adds the
/// addressing and performs Token encryption where `encrypt` is set; parts
/// and proofs travel as-is since the part stream is already ciphertext.
#[derive(Debug, Clone)]
pub struct OutboundPayload {
    pub packet_type: PacketType,
    pub context: PacketContext,
    pub data: Vec<u8>,
    pub encrypt: bool,
}

//***************************************************************************//

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAdvertisement {
    pub transfer_size: u64,
    pub data_size: u64,
    pub parts: u32,
    pub hash: Hash,
    pub random_hash: [u8; RANDOM_HASH_SIZE],
    pub original_hash: Hash,
    pub segment_index: u32,
    pub total_segments: u32,
    pub request_id: Option<ByteBuf>,
    pub flags: u8,
    pub hashmap: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResourceAdvertisementFrame {
    #[serde(rename = "t")]
    transfer_size: u64,
    #[serde(rename = "d")]
    data_size: u64,
    #[serde(rename = "n")]
    parts: u32,
    #[serde(rename = "h", with = "serde_bytes")]
    hash: Vec<u8>,
    #[serde(rename = "r", with = "serde_bytes")]
    random_hash: Vec<u8>,
    #[serde(rename = "o", with = "serde_bytes")]
    original_hash: Vec<u8>,
    #[serde(rename = "i")]
    segment_index: u32,
    #[serde(rename = "l")]
    total_segments: u32,
    #[serde(rename = "q")]
    request_id: Option<ByteBuf>,
    #[serde(rename = "f")]
    flags: u8,
    #[serde(rename = "m", with = "serde_bytes")]
    hashmap: Vec<u8>,
}

impl ResourceAdvertisement {
    pub fn pack(&self) -> Result<Vec<u8>, RnsError> {
        let frame = ResourceAdvertisementFrame {
            transfer_size: self.transfer_size,
            data_size: self.data_size,
            parts: self.parts,
            hash: self.hash.as_slice().to_vec(),
            random_hash: self.random_hash.to_vec(),
            original_hash: self.original_hash.as_slice().to_vec(),
            segment_index: self.segment_index,
            total_segments: self.total_segments,
            request_id: self.request_id.clone(),
            flags: self.flags,
            hashmap: self.hashmap.clone(),
        };
        rmp_serde::to_vec_named(&frame).map_err(|_| RnsError::Malformed)
    }

    pub fn unpack(data: &[u8]) -> Result<Self, RnsError> {
        let frame: ResourceAdvertisementFrame =
            rmp_serde::from_slice(data).map_err(|_| RnsError::Malformed)?;

        Ok(Self {
            transfer_size: frame.transfer_size,
            data_size: frame.data_size,
            parts: frame.parts,
            hash: Hash::read_from(&frame.hash)?,
            random_hash: copy_fixed::<RANDOM_HASH_SIZE>(&frame.random_hash)?,
            original_hash: Hash::read_from(&frame.original_hash)?,
            segment_index: frame.segment_index,
            total_segments: frame.total_segments,
            request_id: frame.request_id,
            flags: frame.flags,
            hashmap: frame.hashmap,
        })
    }

    pub fn compressed(&self) -> bool {
        (self.flags & FLAG_COMPRESSED) == FLAG_COMPRESSED
    }

    pub fn split(&self) -> bool {
        (self.flags & FLAG_SPLIT) == FLAG_SPLIT
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub hashmap_exhausted: bool,
    pub last_map_hash: Option<[u8; MAPHASH_LEN]>,
    pub resource_hash: Hash,
    pub requested_hashes: Vec<[u8; MAPHASH_LEN]>,
}

impl ResourceRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            1 + MAPHASH_LEN + HASH_SIZE + self.requested_hashes.len() * MAPHASH_LEN,
        );
        if self.hashmap_exhausted {
            out.push(0xFF);
            out.extend_from_slice(&self.last_map_hash.unwrap_or([0u8; MAPHASH_LEN]));
        } else {
            out.push(0x00);
        }
        out.extend_from_slice(self.resource_hash.as_slice());
        for hash in &self.requested_hashes {
            out.extend_from_slice(hash);
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, RnsError> {
        if data.len() < 1 + HASH_SIZE {
            return Err(RnsError::Malformed);
        }
        let hashmap_exhausted = data[0] == 0xFF;
        let mut offset = 1;
        let last_map_hash = if hashmap_exhausted {
            if data.len() < 1 + MAPHASH_LEN + HASH_SIZE {
                return Err(RnsError::Malformed);
            }
            let last = copy_fixed::<MAPHASH_LEN>(&data[offset..])?;
            offset += MAPHASH_LEN;
            Some(last)
        } else {
            None
        };
        let resource_hash = Hash::read_from(&data[offset..])?;
        offset += HASH_SIZE;
        let mut requested_hashes = Vec::new();
        while offset + MAPHASH_LEN <= data.len() {
            requested_hashes.push(copy_fixed::<MAPHASH_LEN>(&data[offset..])?);
            offset += MAPHASH_LEN;
        }
        Ok(Self { hashmap_exhausted, last_map_hash, resource_hash, requested_hashes })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHashUpdate {
    pub resource_hash: Hash,
    pub segment: u32,
    pub hashmap: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResourceHashUpdateFrame(u32, #[serde(with = "serde_bytes")] Vec<u8>);

impl ResourceHashUpdate {
    pub fn encode(&self) -> Result<Vec<u8>, RnsError> {
        let mut out = Vec::with_capacity(HASH_SIZE + self.hashmap.len() + 8);
        out.extend_from_slice(self.resource_hash.as_slice());
        let payload =
            rmp_serde::to_vec(&ResourceHashUpdateFrame(self.segment, self.hashmap.clone()))
                .map_err(|_| RnsError::Malformed)?;
        out.extend_from_slice(&payload);
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self, RnsError> {
        if data.len() < HASH_SIZE + 1 {
            return Err(RnsError::Malformed);
        }
        let resource_hash = Hash::read_from(&data[..HASH_SIZE])?;
        let frame: ResourceHashUpdateFrame =
            rmp_serde::from_slice(&data[HASH_SIZE..]).map_err(|_| RnsError::Malformed)?;
        Ok(Self { resource_hash, segment: frame.0, hashmap: frame.1 })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceProof {
    pub resource_hash: Hash,
    pub proof: Hash,
}

impl ResourceProof {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HASH_SIZE * 2);
        out.extend_from_slice(self.resource_hash.as_slice());
        out.extend_from_slice(self.proof.as_slice());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, RnsError> {
        if data.len() < HASH_SIZE * 2 {
            return Err(RnsError::Malformed);
        }
        Ok(Self {
            resource_hash: Hash::read_from(&data[..HASH_SIZE])?,
            proof: Hash::read_from(&data[HASH_SIZE..])?,
        })
    }
}

//***************************************************************************//

fn map_hash(part: &[u8]) -> [u8; MAPHASH_LEN] {
    let digest = sha256(part);
    let mut out = [0u8; MAPHASH_LEN];
    out.copy_from_slice(&digest[..MAPHASH_LEN]);
    out
}

fn slice_hashmap_segment(hashes: &[[u8; MAPHASH_LEN]], segment: usize) -> Vec<u8> {
    let start = (segment * HASHMAP_MAX_LEN).min(hashes.len());
    let end = ((segment + 1) * HASHMAP_MAX_LEN).min(hashes.len());
    let mut out = Vec::with_capacity((end - start) * MAPHASH_LEN);
    for hash in &hashes[start..end] {
        out.extend_from_slice(hash);
    }
    out
}

fn copy_fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N], RnsError> {
    if bytes.len() < N {
        return Err(RnsError::Malformed);
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    Ok(out)
}

fn request_timeout(window: usize, rtt: Duration) -> Duration {
    let base = (rtt.as_secs_f32() * 2.5).max(0.025) * (window as f32 + 1.5);
    Duration::from_secs_f32(base)
}

/// Number of 1 MiB-bounded segments a payload splits into.
pub fn segment_count(len: usize) -> u32 {
    if len == 0 {
        return 1;
    }
    len.div_ceil(MAX_EFFICIENT_SIZE) as u32
}

//***************************************************************************//

/// Outbound side of one resource segment.
pub struct ResourceSender {
    resource_hash: Hash,
    original_hash: Hash,
    random_hash: [u8; RANDOM_HASH_SIZE],
    parts: Vec<Vec<u8>>,
    map_hashes: Vec<[u8; MAPHASH_LEN]>,
    expected_proof: Hash,
    data_size: u64,
    compressed: bool,
    segment_index: u32,
    total_segments: u32,
    /// Full payload, retained only while later segments remain to be built.
    source: Option<Bytes>,
    auto_compress: bool,
    status: ResourceStatus,
    tries: u8,
    last_activity: Instant,
}

impl ResourceSender {
    /// Builds the sender for segment `segment_index` (0-based) of `data`.
    /// `original_hash` is `None` for the first segment and becomes the
    /// segment's own resource hash, which later segments then repeat.
    pub fn new(
        token: &Token,
        data: Bytes,
        segment_index: u32,
        original_hash: Option<Hash>,
        auto_compress: bool,
    ) -> Result<Self, RnsError> {
        let total_segments = segment_count(data.len());
        if segment_index >= total_segments {
            return Err(RnsError::InvalidArgument);
        }

        let start = segment_index as usize * MAX_EFFICIENT_SIZE;
        let end = ((segment_index as usize + 1) * MAX_EFFICIENT_SIZE).min(data.len());
        let segment = &data.as_slice()[start..end];

        let mut random_hash = [0u8; RANDOM_HASH_SIZE];
        OsRng.fill_bytes(&mut random_hash);

        // The compressed form is only used when strictly smaller; random or
        // already-compressed data keeps its plain framing.
        let (payload, compressed) = if auto_compress {
            let candidate = bz2_compress(segment)?;
            if candidate.len() < segment.len() {
                (candidate, true)
            } else {
                (segment.to_vec(), false)
            }
        } else {
            (segment.to_vec(), false)
        };

        let resource_hash =
            HashBuilder::new().update(segment).update(random_hash).finalize();
        let expected_proof =
            HashBuilder::new().update(segment).update(resource_hash).finalize();

        let mut to_encrypt = payload;
        to_encrypt.extend_from_slice(&random_hash);
        let encrypted = token.encrypt(OsRng, &to_encrypt)?;

        let parts: Vec<Vec<u8>> = encrypted.chunks(SDU).map(|chunk| chunk.to_vec()).collect();
        let map_hashes: Vec<[u8; MAPHASH_LEN]> =
            parts.iter().map(|part| map_hash(part)).collect();

        let source =
            if segment_index + 1 < total_segments { Some(data.clone()) } else { None };

        Ok(Self {
            resource_hash,
            original_hash: original_hash.unwrap_or(resource_hash),
            random_hash,
            parts,
            map_hashes,
            expected_proof,
            data_size: segment.len() as u64,
            compressed,
            segment_index,
            total_segments,
            source,
            auto_compress,
            status: ResourceStatus::Advertised,
            tries: 1,
            last_activity: Instant::now(),
        })
    }

    pub fn resource_hash(&self) -> &Hash {
        &self.resource_hash
    }

    pub fn original_hash(&self) -> &Hash {
        &self.original_hash
    }

    pub fn status(&self) -> ResourceStatus {
        self.status
    }

    pub fn parts_len(&self) -> usize {
        self.parts.len()
    }

    pub fn advertisement(&self) -> ResourceAdvertisement {
        let mut flags = FLAG_ENCRYPTED;
        if self.compressed {
            flags |= FLAG_COMPRESSED;
        }
        if self.total_segments > 1 {
            flags |= FLAG_SPLIT;
        }

        ResourceAdvertisement {
            transfer_size: self.parts.iter().map(|part| part.len() as u64).sum(),
            data_size: self.data_size,
            parts: self.parts.len() as u32,
            hash: self.resource_hash,
            random_hash: self.random_hash,
            original_hash: self.original_hash,
            segment_index: self.segment_index + 1,
            total_segments: self.total_segments,
            request_id: None,
            flags,
            hashmap: slice_hashmap_segment(&self.map_hashes, 0),
        }
    }

    pub fn advertisement_payload(&self) -> Result<OutboundPayload, RnsError> {
        Ok(OutboundPayload {
            packet_type: PacketType::Data,
            context: PacketContext::ResourceAdvertisement,
            data: self.advertisement().pack()?,
            encrypt: true,
        })
    }

    /// Answers a part request with the requested parts, plus the next
    /// hashmap segment when the receiver reported exhaustion.
    pub fn handle_request(&mut self, request: &ResourceRequest) -> Vec<OutboundPayload> {
        if request.resource_hash != self.resource_hash {
            return Vec::new();
        }

        self.last_activity = Instant::now();
        self.status = ResourceStatus::Transferring;

        let mut out = Vec::new();
        for hash in &request.requested_hashes {
            if let Some(index) = self.map_hashes.iter().position(|entry| entry == hash) {
                if let Some(part) = self.parts.get(index) {
                    out.push(OutboundPayload {
                        packet_type: PacketType::Data,
                        context: PacketContext::Resource,
                        data: part.clone(),
                        encrypt: false,
                    });
                }
            }
        }

        if request.hashmap_exhausted {
            if let Some(last_hash) = request.last_map_hash {
                if let Some(last_index) =
                    self.map_hashes.iter().position(|entry| *entry == last_hash)
                {
                    let next_segment = (last_index / HASHMAP_MAX_LEN) + 1;
                    if next_segment * HASHMAP_MAX_LEN < self.map_hashes.len() {
                        let update = ResourceHashUpdate {
                            resource_hash: self.resource_hash,
                            segment: next_segment as u32,
                            hashmap: slice_hashmap_segment(&self.map_hashes, next_segment),
                        };
                        if let Ok(payload) = update.encode() {
                            out.push(OutboundPayload {
                                packet_type: PacketType::Data,
                                context: PacketContext::ResourceHashUpdate,
                                data: payload,
                                encrypt: true,
                            });
                        }
                    }
                }
            }
        }

        out
    }

    /// Transitions to complete when the receiver's proof matches.
    pub fn handle_proof(&mut self, proof: &ResourceProof) -> bool {
        if proof.resource_hash != self.resource_hash || proof.proof != self.expected_proof {
            return false;
        }
        self.status = ResourceStatus::Complete;
        true
    }

    /// Everything the next segment needs, if one remains.
    pub fn next_segment(&self) -> Option<(Bytes, u32, Hash, bool)> {
        let source = self.source.as_ref()?;
        Some((source.clone(), self.segment_index + 1, self.original_hash, self.auto_compress))
    }

    /// Re-advertises while no request has arrived; fails after max tries.
    pub fn tick(&mut self, now: Instant, rtt: Duration) -> Option<OutboundPayload> {
        if self.status != ResourceStatus::Advertised {
            return None;
        }

        if now.duration_since(self.last_activity) < request_timeout(WINDOW, rtt) {
            return None;
        }

        if self.tries >= RESOURCE_MAX_TRIES {
            self.status = ResourceStatus::Failed;
            return None;
        }

        self.tries += 1;
        self.last_activity = now;
        self.advertisement_payload().ok()
    }
}

//***************************************************************************//

pub struct ResourceProgress {
    pub received_parts: usize,
    pub total_parts: usize,
    pub received_bytes: u64,
    pub total_bytes: u64,
}

/// Outcome of feeding one inbound part to a receiver.
pub enum PartOutcome {
    /// The part belongs to some other resource.
    NoMatch,
    /// Stored (or duplicate); possibly with a follow-up request to emit.
    Stored { new_part: bool, next_request: Option<OutboundPayload> },
    /// All parts arrived and verification succeeded.
    Complete { proof: OutboundPayload, data: Bytes },
    /// Assembly or verification failed; the resource is dead.
    Failed,
}

pub enum ReceiverTick {
    Idle,
    Resend(OutboundPayload),
    Failed,
}

/// Inbound side of one resource segment with adaptive windowing.
pub struct ResourceReceiver {
    resource_hash: Hash,
    original_hash: Hash,
    random_hash: [u8; RANDOM_HASH_SIZE],
    segment_index: u32,
    total_segments: u32,
    compressed: bool,
    parts: Vec<Option<Vec<u8>>>,
    hashmap: Vec<Option<[u8; MAPHASH_LEN]>>,
    received: usize,
    received_bytes: u64,
    transfer_size: u64,
    outstanding: Vec<[u8; MAPHASH_LEN]>,
    window: usize,
    window_max: usize,
    fast_rounds: u32,
    round_started: Instant,
    round_bytes: u64,
    tries: u8,
    last_activity: Instant,
    status: ResourceStatus,
}

impl ResourceReceiver {
    pub fn new(adv: &ResourceAdvertisement) -> Result<Self, RnsError> {
        if adv.parts == 0 || (adv.flags & FLAG_ENCRYPTED) == 0 {
            return Err(RnsError::Malformed);
        }

        let now = Instant::now();
        let total_parts = adv.parts as usize;

        let mut receiver = Self {
            resource_hash: adv.hash,
            original_hash: adv.original_hash,
            random_hash: adv.random_hash,
            segment_index: adv.segment_index,
            total_segments: adv.total_segments,
            compressed: adv.compressed(),
            parts: vec![None; total_parts],
            hashmap: vec![None; total_parts],
            received: 0,
            received_bytes: 0,
            transfer_size: adv.transfer_size,
            outstanding: Vec::new(),
            window: WINDOW,
            window_max: WINDOW_MAX,
            fast_rounds: 0,
            round_started: now,
            round_bytes: 0,
            tries: 0,
            last_activity: now,
            status: ResourceStatus::Advertised,
        };

        receiver.apply_hashmap_segment(0, &adv.hashmap);

        Ok(receiver)
    }

    pub fn resource_hash(&self) -> &Hash {
        &self.resource_hash
    }

    pub fn original_hash(&self) -> &Hash {
        &self.original_hash
    }

    pub fn segment_index(&self) -> u32 {
        self.segment_index
    }

    pub fn total_segments(&self) -> u32 {
        self.total_segments
    }

    pub fn status(&self) -> ResourceStatus {
        self.status
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn progress(&self) -> ResourceProgress {
        ResourceProgress {
            received_parts: self.received,
            total_parts: self.parts.len(),
            received_bytes: self.received_bytes,
            total_bytes: self.transfer_size,
        }
    }

    fn apply_hashmap_segment(&mut self, segment: usize, bytes: &[u8]) {
        let count = bytes.len() / MAPHASH_LEN;
        for i in 0..count {
            let start = i * MAPHASH_LEN;
            let index = segment * HASHMAP_MAX_LEN + i;
            if index < self.hashmap.len() {
                let mut entry = [0u8; MAPHASH_LEN];
                entry.copy_from_slice(&bytes[start..start + MAPHASH_LEN]);
                self.hashmap[index] = Some(entry);
            }
        }
    }

    fn build_request(&mut self) -> ResourceRequest {
        let mut requested = Vec::new();
        let mut last_known: Option<[u8; MAPHASH_LEN]> = None;
        let mut hashmap_exhausted = false;

        for (index, entry) in self.hashmap.iter().enumerate() {
            match entry {
                Some(hash) => {
                    last_known = Some(*hash);
                    if self.parts[index].is_none() {
                        requested.push(*hash);
                        if requested.len() >= self.window {
                            break;
                        }
                    }
                }
                None => {
                    hashmap_exhausted = true;
                    break;
                }
            }
        }

        self.outstanding = requested.clone();
        self.round_started = Instant::now();
        self.round_bytes = 0;

        ResourceRequest {
            hashmap_exhausted,
            last_map_hash: if hashmap_exhausted { last_known } else { None },
            resource_hash: self.resource_hash,
            requested_hashes: requested,
        }
    }

    fn request_payload(&mut self) -> OutboundPayload {
        let request = self.build_request();
        OutboundPayload {
            packet_type: PacketType::Data,
            context: PacketContext::ResourceRequest,
            data: request.encode(),
            encrypt: true,
        }
    }

    /// The first request, sent right after the advertisement.
    pub fn initial_request(&mut self) -> OutboundPayload {
        self.status = ResourceStatus::Transferring;
        self.last_activity = Instant::now();
        self.request_payload()
    }

    pub fn handle_hash_update(&mut self, update: &ResourceHashUpdate) -> Option<OutboundPayload> {
        if update.resource_hash != self.resource_hash {
            return None;
        }
        self.last_activity = Instant::now();
        self.apply_hashmap_segment(update.segment as usize, &update.hashmap);
        Some(self.request_payload())
    }

    /// Stores a part, completing the round and the transfer as applicable.
    pub fn handle_part(&mut self, part: &[u8], token: &Token) -> PartOutcome {
        let hash = map_hash(part);
        let Some(index) =
            self.hashmap.iter().position(|entry| entry.as_ref() == Some(&hash))
        else {
            return PartOutcome::NoMatch;
        };

        let mut new_part = false;
        if self.parts[index].is_none() {
            self.parts[index] = Some(part.to_vec());
            self.received += 1;
            self.received_bytes += part.len() as u64;
            self.round_bytes += part.len() as u64;
            self.last_activity = Instant::now();
            new_part = true;
        }

        self.outstanding.retain(|entry| entry != &hash);

        if self.received == self.parts.len() {
            return match self.assemble(token) {
                Ok((proof, data)) => {
                    self.status = ResourceStatus::Complete;
                    PartOutcome::Complete { proof, data }
                }
                Err(_) => {
                    self.status = ResourceStatus::Corrupt;
                    PartOutcome::Failed
                }
            };
        }

        let next_request = if self.outstanding.is_empty() {
            self.complete_round();
            Some(self.request_payload())
        } else {
            None
        };

        PartOutcome::Stored { new_part, next_request }
    }

    /// One request/response round finished: scale the window.
    fn complete_round(&mut self) {
        let elapsed = self.round_started.elapsed().as_secs_f32().max(0.001);
        let rate = self.round_bytes as f32 / elapsed;

        if rate >= FAST_RATE_THRESHOLD {
            self.fast_rounds += 1;
            if self.fast_rounds >= FAST_ROUNDS_REQUIRED {
                self.window_max = WINDOW_MAX_FAST;
            }
        } else {
            self.fast_rounds = 0;
        }

        if self.window < self.window_max {
            self.window += 1;
        }

        self.tries = 0;
    }

    fn assemble(&mut self, token: &Token) -> Result<(OutboundPayload, Bytes), RnsError> {
        let mut stream = Vec::with_capacity(self.transfer_size as usize);
        for part in &self.parts {
            match part {
                Some(bytes) => stream.extend_from_slice(bytes),
                None => return Err(RnsError::InvariantViolation),
            }
        }

        let plain = token.decrypt(&stream)?;
        if plain.len() < RANDOM_HASH_SIZE {
            return Err(RnsError::Malformed);
        }

        let (payload, random_hash) = plain.split_at(plain.len() - RANDOM_HASH_SIZE);
        if random_hash != &self.random_hash[..] {
            return Err(RnsError::AuthFailure);
        }

        let data = if self.compressed { bz2_decompress(payload)? } else { payload.to_vec() };

        let computed = HashBuilder::new().update(&data).update(random_hash).finalize();
        if computed != self.resource_hash {
            return Err(RnsError::AuthFailure);
        }

        let proof =
            HashBuilder::new().update(&data).update(self.resource_hash).finalize();

        let payload = OutboundPayload {
            packet_type: PacketType::Proof,
            context: PacketContext::ResourceProof,
            data: ResourceProof { resource_hash: self.resource_hash, proof }.encode(),
            encrypt: false,
        };

        Ok((payload, Bytes::from_vec(data)))
    }

    /// Retries the outstanding request after a silence, shrinking the window.
    pub fn tick(&mut self, now: Instant, rtt: Duration) -> ReceiverTick {
        if self.status != ResourceStatus::Transferring {
            return ReceiverTick::Idle;
        }

        if now.duration_since(self.last_activity) < request_timeout(self.window, rtt) {
            return ReceiverTick::Idle;
        }

        if self.tries >= RESOURCE_MAX_TRIES {
            self.status = ResourceStatus::Failed;
            return ReceiverTick::Failed;
        }

        self.tries += 1;
        self.window = (self.window.saturating_sub(1)).max(WINDOW_MIN);
        self.last_activity = now;

        ReceiverTick::Resend(self.request_payload())
    }
}

//***************************************************************************//

pub const ACCUMULATOR_TRANSFERS: usize = 8;
pub const ACCUMULATOR_SEGMENTS: usize = 32;

struct AccumulatorEntry {
    original_hash: Hash,
    segments: Vec<Option<Bytes>>,
    total: u32,
    received: u32,
    last_activity: Instant,
}

/// Collects completed segments of multi-segment resources, keyed by the
/// original hash, and releases the reassembled payload exactly once.
pub struct SegmentAccumulator {
    entries: Vec<AccumulatorEntry>,
    idle_timeout: Duration,
}

impl SegmentAccumulator {
    pub fn new(idle_timeout: Duration) -> Self {
        Self { entries: Vec::new(), idle_timeout }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Feeds one completed segment; returns the whole payload when all
    /// segments of the transfer have arrived.
    pub fn add_segment(
        &mut self,
        original_hash: Hash,
        segment_index: u32,
        total_segments: u32,
        data: Bytes,
    ) -> Result<Option<Bytes>, RnsError> {
        if segment_index == 0
            || segment_index > total_segments
            || total_segments as usize > ACCUMULATOR_SEGMENTS
        {
            return Err(RnsError::InvalidArgument);
        }

        let index = match self.entries.iter().position(|entry| entry.original_hash == original_hash)
        {
            Some(index) => index,
            None => {
                if self.entries.len() >= ACCUMULATOR_TRANSFERS {
                    return Err(RnsError::Capacity);
                }
                self.entries.push(AccumulatorEntry {
                    original_hash,
                    segments: vec![None; total_segments as usize],
                    total: total_segments,
                    received: 0,
                    last_activity: Instant::now(),
                });
                self.entries.len() - 1
            }
        };

        let entry = &mut self.entries[index];
        if entry.total != total_segments {
            return Err(RnsError::InvariantViolation);
        }

        let slot = (segment_index - 1) as usize;
        if entry.segments[slot].is_none() {
            entry.segments[slot] = Some(data);
            entry.received += 1;
        }
        entry.last_activity = Instant::now();

        if entry.received == entry.total {
            let entry = self.entries.swap_remove(index);
            let mut assembled = Vec::new();
            for segment in entry.segments {
                match segment {
                    Some(bytes) => assembled.extend_from_slice(bytes.as_slice()),
                    None => return Err(RnsError::InvariantViolation),
                }
            }
            return Ok(Some(Bytes::from_vec(assembled)));
        }

        Ok(None)
    }

    /// Purges transfers idle for longer than the configured threshold.
    pub fn sweep(&mut self, now: Instant) {
        let idle_timeout = self.idle_timeout;
        self.entries.retain(|entry| now.duration_since(entry.last_activity) < idle_timeout);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand_core::{OsRng, RngCore};

    use super::{
        segment_count, PartOutcome, ResourceAdvertisement, ResourceHashUpdate, ResourceProof,
        ResourceReceiver, ResourceRequest, ResourceSender, ResourceStatus, SegmentAccumulator,
        FLAG_COMPRESSED, HASHMAP_MAX_LEN, MAPHASH_LEN, MAX_EFFICIENT_SIZE, RANDOM_HASH_SIZE,
        WINDOW, WINDOW_MAX,
    };
    use crate::bytes::Bytes;
    use crate::crypt::Token;
    use crate::hash::Hash;
    use crate::packet::PacketContext;

    fn test_token() -> Token {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Token::new(&key).expect("token")
    }

    fn pump_transfer(sender: &mut ResourceSender, receiver: &mut ResourceReceiver, token: &Token) -> Bytes {
        let mut request = {
            let payload = receiver.initial_request();
            ResourceRequest::decode(&payload.data).expect("request")
        };

        for _ in 0..100_000 {
            let responses = sender.handle_request(&request);
            assert!(!responses.is_empty(), "sender starved before completion");

            let mut next_request = None;
            for response in responses {
                match response.context {
                    PacketContext::Resource => {
                        match receiver.handle_part(&response.data, token) {
                            PartOutcome::Complete { proof, data } => {
                                let decoded =
                                    ResourceProof::decode(&proof.data).expect("proof");
                                assert!(sender.handle_proof(&decoded));
                                return data;
                            }
                            PartOutcome::Stored { next_request: Some(payload), .. } => {
                                next_request = Some(
                                    ResourceRequest::decode(&payload.data).expect("request"),
                                );
                            }
                            PartOutcome::Stored { .. } => {}
                            PartOutcome::NoMatch => panic!("part did not match"),
                            PartOutcome::Failed => panic!("transfer failed"),
                        }
                    }
                    PacketContext::ResourceHashUpdate => {
                        let update =
                            ResourceHashUpdate::decode(&response.data).expect("hash update");
                        if let Some(payload) = receiver.handle_hash_update(&update) {
                            next_request =
                                Some(ResourceRequest::decode(&payload.data).expect("request"));
                        }
                    }
                    other => panic!("unexpected context {:?}", other),
                }
            }

            request = next_request.expect("transfer stalled without a follow-up request");
        }

        panic!("transfer did not converge");
    }

    #[test]
    fn advertisement_roundtrip() {
        let hash = Hash::of(b"resource-hash");
        let adv = ResourceAdvertisement {
            transfer_size: 128,
            data_size: 64,
            parts: 2,
            hash,
            random_hash: [1, 2, 3, 4],
            original_hash: hash,
            segment_index: 1,
            total_segments: 1,
            request_id: None,
            flags: 0x01,
            hashmap: vec![0xAA, 0xBB, 0xCC, 0xDD, 0x01, 0x02, 0x03, 0x04],
        };

        let packed = adv.pack().expect("pack");
        let decoded = ResourceAdvertisement::unpack(&packed).expect("unpack");

        assert_eq!(decoded, adv);
    }

    #[test]
    fn request_roundtrip() {
        let req = ResourceRequest {
            hashmap_exhausted: true,
            last_map_hash: Some([9, 8, 7, 6]),
            resource_hash: Hash::of(b"resource-hash"),
            requested_hashes: vec![[1, 2, 3, 4], [5, 6, 7, 8]],
        };

        let decoded = ResourceRequest::decode(&req.encode()).expect("decode");
        assert_eq!(decoded, req);
    }

    #[test]
    fn small_compressible_transfer() {
        let token = test_token();
        let data: Vec<u8> = b"HELLO_RETICULUM_RESOURCE_TEST_DATA_"
            .iter()
            .copied()
            .cycle()
            .take(1024)
            .collect();

        let mut sender =
            ResourceSender::new(&token, Bytes::from_vec(data.clone()), 0, None, true)
                .expect("sender");
        assert!(sender.advertisement().compressed());
        assert!(sender.parts_len() <= 4);

        let adv = sender.advertisement();
        let mut receiver = ResourceReceiver::new(&adv).expect("receiver");

        let received = pump_transfer(&mut sender, &mut receiver, &token);

        assert_eq!(received.as_slice(), data.as_slice());
        assert_eq!(sender.status(), ResourceStatus::Complete);
        assert_eq!(receiver.status(), ResourceStatus::Complete);
    }

    #[test]
    fn incompressible_transfer_skips_compression() {
        let token = test_token();
        let mut data = vec![0u8; 4096];
        OsRng.fill_bytes(&mut data);

        let mut sender =
            ResourceSender::new(&token, Bytes::from_vec(data.clone()), 0, None, true)
                .expect("sender");
        assert_eq!(sender.advertisement().flags & FLAG_COMPRESSED, 0);

        let adv = sender.advertisement();
        let mut receiver = ResourceReceiver::new(&adv).expect("receiver");

        let received = pump_transfer(&mut sender, &mut receiver, &token);
        assert_eq!(received.as_slice(), data.as_slice());
    }

    #[test]
    fn large_transfer_exercises_hashmap_updates_and_window_growth() {
        let token = test_token();
        // Enough parts to exceed one 74-entry hashmap segment.
        let mut data = vec![0u8; 60 * 1024];
        OsRng.fill_bytes(&mut data);

        let mut sender =
            ResourceSender::new(&token, Bytes::from_vec(data.clone()), 0, None, true)
                .expect("sender");
        assert!(sender.parts_len() > HASHMAP_MAX_LEN);

        let adv = sender.advertisement();
        assert_eq!(adv.hashmap.len(), HASHMAP_MAX_LEN * MAPHASH_LEN);

        let mut receiver = ResourceReceiver::new(&adv).expect("receiver");
        let received = pump_transfer(&mut sender, &mut receiver, &token);

        assert_eq!(received.as_slice(), data.as_slice());
        assert!(receiver.window() > WINDOW);
        assert!(receiver.window() <= super::WINDOW_MAX_FAST.max(WINDOW_MAX));
    }

    #[test]
    fn duplicate_parts_do_not_double_count() {
        let token = test_token();
        let data = vec![7u8; 2048];

        let mut sender = ResourceSender::new(&token, Bytes::from_vec(data), 0, None, false)
            .expect("sender");
        let adv = sender.advertisement();
        let mut receiver = ResourceReceiver::new(&adv).expect("receiver");

        let payload = receiver.initial_request();
        let request = ResourceRequest::decode(&payload.data).expect("request");
        let responses = sender.handle_request(&request);
        let part = responses
            .iter()
            .find(|payload| payload.context == PacketContext::Resource)
            .expect("part")
            .data
            .clone();

        let first = receiver.handle_part(&part, &token);
        let second = receiver.handle_part(&part, &token);

        match (first, second) {
            (
                PartOutcome::Stored { new_part: true, .. },
                PartOutcome::Stored { new_part: false, .. },
            ) => {}
            _ => panic!("duplicate handling broke"),
        }
        assert_eq!(receiver.progress().received_parts, 1);
    }

    #[test]
    fn tampered_part_is_ignored() {
        let token = test_token();
        let data = vec![1u8; 1024];

        let mut sender = ResourceSender::new(&token, Bytes::from_vec(data), 0, None, false)
            .expect("sender");
        let adv = sender.advertisement();
        let mut receiver = ResourceReceiver::new(&adv).expect("receiver");

        let payload = receiver.initial_request();
        let request = ResourceRequest::decode(&payload.data).expect("request");
        let responses = sender.handle_request(&request);
        let mut part = responses
            .iter()
            .find(|payload| payload.context == PacketContext::Resource)
            .expect("part")
            .data
            .clone();
        part[0] ^= 0x01;

        assert!(matches!(receiver.handle_part(&part, &token), PartOutcome::NoMatch));
        assert_eq!(receiver.progress().received_parts, 0);
    }

    #[test]
    fn segment_counting() {
        assert_eq!(segment_count(0), 1);
        assert_eq!(segment_count(MAX_EFFICIENT_SIZE), 1);
        assert_eq!(segment_count(MAX_EFFICIENT_SIZE + 1), 2);
        assert_eq!(segment_count(2 * MAX_EFFICIENT_SIZE), 2);
    }

    #[test]
    fn accumulator_reassembles_in_index_order() {
        let mut accumulator = SegmentAccumulator::new(Duration::from_secs(60));
        let original = Hash::of(b"original");

        let first = accumulator
            .add_segment(original, 2, 2, Bytes::from_slice(b"tail"))
            .expect("add");
        assert!(first.is_none());

        let assembled = accumulator
            .add_segment(original, 1, 2, Bytes::from_slice(b"head-"))
            .expect("add")
            .expect("assembled");

        assert_eq!(assembled.as_slice(), b"head-tail");
        assert!(accumulator.is_empty());
    }

    #[test]
    fn accumulator_enforces_transfer_capacity() {
        let mut accumulator = SegmentAccumulator::new(Duration::from_secs(60));

        for i in 0..super::ACCUMULATOR_TRANSFERS {
            let hash = Hash::of(&[i as u8]);
            accumulator
                .add_segment(hash, 1, 2, Bytes::from_slice(b"x"))
                .expect("within capacity");
        }

        let overflow = Hash::of(b"overflow");
        assert!(accumulator.add_segment(overflow, 1, 2, Bytes::from_slice(b"x")).is_err());
    }

    #[test]
    fn random_hash_trailer_is_authenticated() {
        let token = test_token();
        let data = vec![9u8; 512];

        let mut sender = ResourceSender::new(&token, Bytes::from_vec(data), 0, None, false)
            .expect("sender");
        let mut adv = sender.advertisement();
        // A receiver tricked about the random hash must reject the payload.
        adv.random_hash = [0xFF; RANDOM_HASH_SIZE];
        let mut receiver = ResourceReceiver::new(&adv).expect("receiver");

        let payload = receiver.initial_request();
        let request = ResourceRequest::decode(&payload.data).expect("request");
        let responses = sender.handle_request(&request);

        let mut failed = false;
        for response in responses {
            if response.context == PacketContext::Resource {
                if let PartOutcome::Failed = receiver.handle_part(&response.data, &token) {
                    failed = true;
                }
            }
        }

        assert!(failed);
        assert_eq!(receiver.status(), ResourceStatus::Corrupt);
    }
}
