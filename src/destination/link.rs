use std::collections::VecDeque;
use std::time::{Duration, Instant};

use ed25519_dalek::SigningKey;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::bytes::Bytes;
use crate::channel::{Channel, ENVELOPE_OVERHEAD};
use crate::crypt::{Token, TOKEN_OVERHEAD};
use crate::error::RnsError;
use crate::hash::{AddressHash, Hash, HashBuilder};
use crate::identity::{Identity, PrivateIdentity, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use crate::packet::{
    DestinationType, Header, Packet, PacketContext, PacketDataBuffer, PacketType, PACKET_MDU,
};
use crate::receipt::{build_proof, validate_proof};
use crate::resource::{
    OutboundPayload, PartOutcome, ReceiverTick, ResourceHashUpdate, ResourceProof,
    ResourceReceiver, ResourceRequest, ResourceSender, ResourceStatus,
};

use super::DestinationDesc;

/// Largest plaintext whose padded ciphertext still fits a link packet.
pub const LINK_MDU: usize = ((PACKET_MDU - TOKEN_OVERHEAD) / 16) * 16 - 1;

/// Channel envelopes fit the link MDU minus their own framing.
pub const CHANNEL_MDU: usize = LINK_MDU - ENVELOPE_OVERHEAD;

pub const MAX_PENDING_REQUESTS: usize = 8;
pub const MAX_INCOMING_RESOURCES: usize = 8;
pub const MAX_OUTGOING_RESOURCES: usize = 8;

const KEEPALIVE_PING: u8 = 0xFF;
const KEEPALIVE_PONG: u8 = 0xFE;

/// Link timing: all waits are deadlines checked on tick.
#[derive(Debug, Clone, Copy)]
pub struct LinkTiming {
    pub establishment_timeout: Duration,
    pub stale_time: Duration,
    pub close_time: Duration,
    pub keepalive_interval: Duration,
}

impl Default for LinkTiming {
    fn default() -> Self {
        Self {
            establishment_timeout: Duration::from_secs(6),
            stale_time: Duration::from_secs(60),
            close_time: Duration::from_secs(120),
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum LinkStatus {
    Pending = 0x00,
    Handshake = 0x01,
    Active = 0x02,
    Stale = 0x03,
    Closed = 0x04,
}

impl LinkStatus {
    pub fn not_yet_active(&self) -> bool {
        *self == LinkStatus::Pending || *self == LinkStatus::Handshake
    }

    pub fn usable(&self) -> bool {
        *self == LinkStatus::Active || *self == LinkStatus::Stale
    }
}

pub type LinkId = AddressHash;
pub type RequestId = AddressHash;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum RequestStatus {
    Sent,
    Delivered,
    Ready,
    Failed,
}

struct PendingRequest {
    id: RequestId,
    packet_hash: Hash,
    sent_at: Instant,
    timeout: Duration,
    status: RequestStatus,
}

/// State changes surfaced to the transport event queue. Callbacks are the
/// sole notification channel; send paths only report enqueueing.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Activated,
    DataReceived { data: Bytes },
    RequestReceived { id: RequestId, path_hash: AddressHash, data: Bytes },
    RequestDelivered { id: RequestId },
    RequestReady { id: RequestId, data: Bytes },
    RequestFailed { id: RequestId },
    ResourceProgress { hash: Hash, received_parts: usize, total_parts: usize },
    ResourceComplete {
        hash: Hash,
        original_hash: Hash,
        segment_index: u32,
        total_segments: u32,
        data: Bytes,
    },
    ResourceOutboundComplete { hash: Hash },
    ResourceFailed { hash: Hash },
    ChannelMessageFailed { sequence: u16 },
    Closed,
}

impl From<&Packet> for LinkId {
    /// The link id hashes the link request restricted to the two ephemeral
    /// public keys, so retransmissions with extra trailing data agree.
    fn from(packet: &Packet) -> Self {
        let data = packet.data.as_slice();
        let hashable_len = data.len().min(PUBLIC_KEY_LENGTH * 2);

        HashBuilder::new()
            .update([packet.header.to_meta() & 0b0000_1111])
            .update(packet.destination)
            .update([packet.context as u8])
            .update(&data[..hashable_len])
            .finalize()
            .truncated()
    }
}

#[derive(Serialize, Deserialize)]
struct RequestFrame(#[serde(with = "serde_bytes")] Vec<u8>, Option<ByteBuf>);

#[derive(Serialize, Deserialize)]
struct ResponseFrame(
    #[serde(with = "serde_bytes")] Vec<u8>,
    #[serde(with = "serde_bytes")] Vec<u8>,
);

/// An authenticated encrypted session between two destinations. Exactly one
/// session key is derived per link; all traffic from activation onward runs
/// through the same Token.
pub struct Link {
    id: LinkId,
    destination: DestinationDesc,
    initiator: bool,
    priv_identity: PrivateIdentity,
    peer_identity: Identity,
    token: Option<Token>,
    status: LinkStatus,
    timing: LinkTiming,
    request_time: Instant,
    last_inbound: Instant,
    last_outbound: Instant,
    rtt: Duration,
    rtt_measured: bool,
    outbox: VecDeque<Packet>,
    events: VecDeque<LinkEvent>,
    channel: Option<Channel>,
    incoming_resources: Vec<ResourceReceiver>,
    outgoing_resources: Vec<ResourceSender>,
    pending_requests: Vec<PendingRequest>,
}

impl Link {
    /// Initiator-side link. Call [`Link::request`] to obtain the handshake
    /// packet for the wire.
    pub fn new(destination: DestinationDesc, timing: LinkTiming) -> Self {
        let now = Instant::now();

        Self {
            id: AddressHash::default(),
            destination,
            initiator: true,
            priv_identity: PrivateIdentity::new_from_rand(OsRng),
            peer_identity: Identity::default(),
            token: None,
            status: LinkStatus::Pending,
            timing,
            request_time: now,
            last_inbound: now,
            last_outbound: now,
            rtt: Duration::from_millis(2500),
            rtt_measured: false,
            outbox: VecDeque::new(),
            events: VecDeque::new(),
            channel: None,
            incoming_resources: Vec::new(),
            outgoing_resources: Vec::new(),
            pending_requests: Vec::new(),
        }
    }

    /// Responder-side link built from an inbound LINK_REQUEST. Derives the
    /// session key, proves the link and goes active immediately.
    pub fn new_from_request(
        packet: &Packet,
        signing_key: SigningKey,
        destination: DestinationDesc,
        timing: LinkTiming,
    ) -> Result<Self, RnsError> {
        if packet.data.len() < PUBLIC_KEY_LENGTH * 2 {
            return Err(RnsError::Malformed);
        }

        let data = packet.data.as_slice();
        let peer_identity = Identity::new_from_slices(
            &data[PUBLIC_KEY_LENGTH..PUBLIC_KEY_LENGTH * 2],
            &data[..PUBLIC_KEY_LENGTH],
        )?;

        let id = LinkId::from(packet);
        log::debug!("link({}): created from request", id);

        let now = Instant::now();
        let priv_identity =
            PrivateIdentity::new(x25519_dalek::StaticSecret::random_from_rng(OsRng), signing_key);
        let token = priv_identity.derive_token(&peer_identity.public_key, id.as_slice())?;

        let mut link = Self {
            id,
            destination,
            initiator: false,
            priv_identity,
            peer_identity,
            token: Some(token),
            status: LinkStatus::Handshake,
            timing,
            request_time: now,
            last_inbound: now,
            last_outbound: now,
            rtt: Duration::from_millis(2500),
            rtt_measured: false,
            outbox: VecDeque::new(),
            events: VecDeque::new(),
            channel: None,
            incoming_resources: Vec::new(),
            outgoing_resources: Vec::new(),
            pending_requests: Vec::new(),
        };

        link.prove();

        Ok(link)
    }

    /// Builds the LINK_REQUEST packet carrying both ephemeral public keys.
    pub fn request(&mut self) -> Packet {
        let mut packet_data = PacketDataBuffer::new();
        packet_data
            .chain_safe_write(self.priv_identity.as_identity().public_key_bytes())
            .chain_safe_write(self.priv_identity.as_identity().verifying_key_bytes());

        let packet = Packet {
            header: Header { packet_type: PacketType::LinkRequest, ..Default::default() },
            destination: self.destination.address_hash,
            transport: None,
            context: PacketContext::None,
            data: packet_data,
        };

        self.status = LinkStatus::Pending;
        self.id = LinkId::from(&packet);
        self.request_time = Instant::now();
        self.last_outbound = self.request_time;

        packet
    }

    /// Responder proof: destination identity signature over the link id, the
    /// responder's ephemeral key and the destination verifying key.
    fn prove(&mut self) {
        log::debug!("link({}): prove", self.id);

        let eph_pub = *self.priv_identity.as_identity().public_key_bytes();
        let verifying = *self.destination.identity.verifying_key_bytes();

        let mut signed_data = PacketDataBuffer::new();
        signed_data
            .chain_safe_write(self.id.as_slice())
            .chain_safe_write(&eph_pub)
            .chain_safe_write(&verifying);

        let signature = self.priv_identity.sign(signed_data.as_slice());

        let mut packet_data = PacketDataBuffer::new();
        packet_data.chain_safe_write(&signature.to_bytes()).chain_safe_write(&eph_pub);

        let packet = Packet {
            header: Header {
                packet_type: PacketType::Proof,
                destination_type: DestinationType::Link,
                ..Default::default()
            },
            destination: self.id,
            transport: None,
            context: PacketContext::LinkRequestProof,
            data: packet_data,
        };

        self.outbox.push_back(packet);
        self.last_outbound = Instant::now();

        self.status = LinkStatus::Active;
        self.events.push_back(LinkEvent::Activated);
        log::debug!("link({}): activated", self.id);
    }

    fn validate_link_proof(&self, packet: &Packet) -> Result<Identity, RnsError> {
        const MIN_PROOF_LEN: usize = SIGNATURE_LENGTH + PUBLIC_KEY_LENGTH;

        if packet.data.len() < MIN_PROOF_LEN {
            return Err(RnsError::Malformed);
        }

        let data = packet.data.as_slice();
        let peer_pub = &data[SIGNATURE_LENGTH..SIGNATURE_LENGTH + PUBLIC_KEY_LENGTH];
        let verifying = self.destination.identity.verifying_key_bytes();

        let mut signed_data = PacketDataBuffer::new();
        signed_data
            .chain_safe_write(self.id.as_slice())
            .chain_safe_write(peer_pub)
            .chain_safe_write(verifying);

        self.destination
            .identity
            .verify_slice(signed_data.as_slice(), &data[..SIGNATURE_LENGTH])?;

        Identity::new_from_slices(verifying, peer_pub)
    }

    //***********************************************************************//

    pub fn id(&self) -> &LinkId {
        &self.id
    }

    pub fn status(&self) -> LinkStatus {
        self.status
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn destination(&self) -> &DestinationDesc {
        &self.destination
    }

    pub fn peer_identity(&self) -> &Identity {
        &self.peer_identity
    }

    pub fn rtt(&self) -> Duration {
        self.rtt
    }

    pub fn elapsed_since_inbound(&self) -> Duration {
        self.last_inbound.elapsed()
    }

    pub fn pop_outgoing(&mut self) -> Option<Packet> {
        self.outbox.pop_front()
    }

    pub fn pop_event(&mut self) -> Option<LinkEvent> {
        self.events.pop_front()
    }

    fn token(&self) -> Result<&Token, RnsError> {
        self.token.as_ref().ok_or(RnsError::InvariantViolation)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, RnsError> {
        self.token()?.encrypt(OsRng, plaintext)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, RnsError> {
        self.token()?.decrypt(ciphertext)
    }

    /// Encrypts (when asked) and enqueues a packet on this link, returning
    /// its packet hash.
    fn emit(
        &mut self,
        packet_type: PacketType,
        context: PacketContext,
        data: &[u8],
        encrypt: bool,
    ) -> Result<Hash, RnsError> {
        let mut packet_data = PacketDataBuffer::new();
        if encrypt {
            let ciphertext = self.token()?.encrypt(OsRng, data)?;
            packet_data.write(&ciphertext)?;
        } else {
            packet_data.write(data)?;
        }

        let packet = Packet {
            header: Header {
                destination_type: DestinationType::Link,
                packet_type,
                ..Default::default()
            },
            destination: self.id,
            transport: None,
            context,
            data: packet_data,
        };

        let hash = packet.hash();
        self.outbox.push_back(packet);
        self.last_outbound = Instant::now();

        Ok(hash)
    }

    fn emit_payload(&mut self, payload: OutboundPayload) -> Result<Hash, RnsError> {
        self.emit(payload.packet_type, payload.context, &payload.data, payload.encrypt)
    }

    //***********************************************************************//

    /// Sends application data over the active link.
    pub fn send(&mut self, data: &[u8]) -> Result<Hash, RnsError> {
        if !self.status.usable() {
            return Err(RnsError::PeerClosed);
        }
        if data.len() > LINK_MDU {
            return Err(RnsError::InvalidArgument);
        }

        self.emit(PacketType::Data, PacketContext::None, data, true)
    }

    /// One-shot RPC: at most [`MAX_PENDING_REQUESTS`] in flight.
    pub fn send_request(
        &mut self,
        path: &str,
        data: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<RequestId, RnsError> {
        if !self.status.usable() {
            return Err(RnsError::PeerClosed);
        }
        if self.pending_requests.len() >= MAX_PENDING_REQUESTS {
            return Err(RnsError::Capacity);
        }

        let path_hash = super::request_path_hash(path);
        let frame = RequestFrame(
            path_hash.as_slice().to_vec(),
            data.map(|value| ByteBuf::from(value.to_vec())),
        );
        let encoded = rmp_serde::to_vec(&frame).map_err(|_| RnsError::Malformed)?;

        let packet_hash = self.emit(PacketType::Data, PacketContext::Request, &encoded, true)?;
        let id = packet_hash.truncated();

        self.pending_requests.push(PendingRequest {
            id,
            packet_hash,
            sent_at: Instant::now(),
            timeout,
            status: RequestStatus::Sent,
        });

        Ok(id)
    }

    /// Responder half of the RPC: ships a handler result back.
    pub fn respond(&mut self, request_id: &RequestId, data: &[u8]) -> Result<(), RnsError> {
        if !self.status.usable() {
            return Err(RnsError::PeerClosed);
        }

        let frame = ResponseFrame(request_id.as_slice().to_vec(), data.to_vec());
        let encoded = rmp_serde::to_vec(&frame).map_err(|_| RnsError::Malformed)?;

        self.emit(PacketType::Data, PacketContext::Response, &encoded, true)?;
        Ok(())
    }

    pub fn request_status(&self, id: &RequestId) -> Option<RequestStatus> {
        self.pending_requests.iter().find(|request| request.id == *id).map(|request| request.status)
    }

    //***********************************************************************//

    /// Starts a resource transfer; data beyond 1 MiB is segmented and the
    /// segments stream back-to-back as each previous one is proven.
    pub fn send_resource(&mut self, data: Bytes, auto_compress: bool) -> Result<Hash, RnsError> {
        if !self.status.usable() {
            return Err(RnsError::PeerClosed);
        }
        if self.outgoing_resources.len() >= MAX_OUTGOING_RESOURCES {
            return Err(RnsError::Capacity);
        }

        let sender = ResourceSender::new(self.token()?, data, 0, None, auto_compress)?;
        let hash = *sender.resource_hash();
        let advertisement = sender.advertisement_payload()?;

        self.outgoing_resources.push(sender);
        self.emit_payload(advertisement)?;

        Ok(hash)
    }

    pub fn incoming_resource_count(&self) -> usize {
        self.incoming_resources.len()
    }

    pub fn outgoing_resource_count(&self) -> usize {
        self.outgoing_resources.len()
    }

    //***********************************************************************//

    /// Lazily-created channel for sequenced messaging over this link.
    pub fn channel_mut(&mut self) -> &mut Channel {
        self.channel.get_or_insert_with(|| Channel::new(CHANNEL_MDU))
    }

    pub fn channel_ready(&self) -> bool {
        match &self.channel {
            Some(channel) => channel.is_ready_to_send(self.rtt),
            None => true,
        }
    }

    /// Frames, encrypts and enqueues one channel message.
    pub fn channel_send(&mut self, msgtype: u16, data: Vec<u8>) -> Result<u16, RnsError> {
        if !self.status.usable() {
            return Err(RnsError::PeerClosed);
        }

        let rtt = self.rtt;
        let channel = self.channel_mut();
        if !channel.is_ready_to_send(rtt) {
            return Err(RnsError::Capacity);
        }

        let envelope = channel.next_envelope(msgtype, data)?;
        let raw = envelope.pack();
        let packet_hash = self.emit(PacketType::Data, PacketContext::Channel, &raw, true)?;

        self.channel_mut().record_outgoing(envelope, packet_hash, Instant::now(), rtt)
    }

    //***********************************************************************//

    /// Dispatches one inbound packet addressed to this link.
    pub fn handle_packet(&mut self, packet: &Packet) {
        if packet.destination != self.id {
            return;
        }

        match packet.header.packet_type {
            PacketType::Proof => self.handle_proof_packet(packet),
            PacketType::Data => self.handle_data_packet(packet),
            _ => {}
        }
    }

    fn handle_proof_packet(&mut self, packet: &Packet) {
        match packet.context {
            PacketContext::LinkRequestProof => {
                if self.initiator && self.status == LinkStatus::Pending {
                    match self.validate_link_proof(packet) {
                        Ok(identity) => {
                            let derived = self
                                .priv_identity
                                .derive_token(&identity.public_key, self.id.as_slice());
                            match derived {
                                Ok(token) => {
                                    self.peer_identity = identity;
                                    self.token = Some(token);
                                    self.status = LinkStatus::Active;
                                    self.rtt = self.request_time.elapsed();
                                    self.rtt_measured = true;
                                    self.last_inbound = Instant::now();
                                    self.events.push_back(LinkEvent::Activated);
                                    log::debug!("link({}): activated", self.id);
                                    self.send_rtt();
                                }
                                Err(err) => {
                                    log::warn!("link({}): key derivation failed: {}", self.id, err);
                                }
                            }
                        }
                        Err(_) => {
                            log::warn!("link({}): proof is not valid", self.id);
                        }
                    }
                }
            }
            PacketContext::LinkProof => {
                if let Ok(packet_hash) = validate_proof(packet.data.as_slice(), &self.peer_identity)
                {
                    self.last_inbound = Instant::now();
                    self.handle_delivery_proof(&packet_hash);
                } else {
                    log::warn!("link({}): packet proof failed validation", self.id);
                }
            }
            PacketContext::ResourceProof => self.handle_resource_proof(packet),
            _ => {}
        }
    }

    fn handle_delivery_proof(&mut self, packet_hash: &Hash) {
        if let Some(channel) = self.channel.as_mut() {
            if channel.acknowledge(packet_hash).is_some() {
                return;
            }
        }

        if let Some(index) = self
            .pending_requests
            .iter()
            .position(|request| request.packet_hash == *packet_hash)
        {
            let request = &mut self.pending_requests[index];
            if request.status == RequestStatus::Sent {
                request.status = RequestStatus::Delivered;
                let rtt = request.sent_at.elapsed();
                let id = request.id;
                self.update_rtt(rtt);
                self.events.push_back(LinkEvent::RequestDelivered { id });
            }
        }
    }

    fn handle_data_packet(&mut self, packet: &Packet) {
        match packet.context {
            PacketContext::None => {
                if let Ok(plain) = self.decrypt(packet.data.as_slice()) {
                    self.last_inbound = Instant::now();
                    self.touch_active();
                    self.events
                        .push_back(LinkEvent::DataReceived { data: Bytes::from_vec(plain) });
                    self.prove_packet(packet);
                } else {
                    log::error!("link({}): can't decrypt packet", self.id);
                }
            }
            PacketContext::Request => self.handle_request_packet(packet),
            PacketContext::Response => self.handle_response_packet(packet),
            PacketContext::Channel => self.handle_channel_packet(packet),
            PacketContext::KeepAlive => self.handle_keepalive(packet),
            PacketContext::LinkRtt => self.handle_rtt_packet(packet),
            PacketContext::LinkClose => self.handle_close_packet(packet),
            PacketContext::Resource => self.handle_resource_part(packet),
            PacketContext::ResourceAdvertisement => self.handle_resource_advertisement(packet),
            PacketContext::ResourceRequest => self.handle_resource_request(packet),
            PacketContext::ResourceHashUpdate => self.handle_resource_hash_update(packet),
            _ => {}
        }
    }

    fn handle_request_packet(&mut self, packet: &Packet) {
        let Ok(plain) = self.decrypt(packet.data.as_slice()) else {
            log::error!("link({}): can't decrypt request", self.id);
            return;
        };
        let Ok(frame) = rmp_serde::from_slice::<RequestFrame>(&plain) else {
            log::warn!("link({}): malformed request frame", self.id);
            return;
        };
        let Ok(path_hash) = AddressHash::read_from(&frame.0) else {
            return;
        };

        self.last_inbound = Instant::now();
        self.touch_active();

        let id = packet.hash().truncated();
        let data = frame.1.map(|value| Bytes::from_vec(value.into_vec())).unwrap_or_default();

        self.events.push_back(LinkEvent::RequestReceived { id, path_hash, data });
        self.prove_packet(packet);
    }

    fn handle_response_packet(&mut self, packet: &Packet) {
        let Ok(plain) = self.decrypt(packet.data.as_slice()) else {
            log::error!("link({}): can't decrypt response", self.id);
            return;
        };
        let Ok(frame) = rmp_serde::from_slice::<ResponseFrame>(&plain) else {
            log::warn!("link({}): malformed response frame", self.id);
            return;
        };
        let Ok(id) = AddressHash::read_from(&frame.0) else {
            return;
        };

        self.last_inbound = Instant::now();
        self.touch_active();

        if let Some(index) = self.pending_requests.iter().position(|request| request.id == id) {
            let request = self.pending_requests.swap_remove(index);
            let rtt = request.sent_at.elapsed();
            self.update_rtt(rtt);
            self.events
                .push_back(LinkEvent::RequestReady { id, data: Bytes::from_vec(frame.1) });
        }

        self.prove_packet(packet);
    }

    fn handle_channel_packet(&mut self, packet: &Packet) {
        let Ok(plain) = self.decrypt(packet.data.as_slice()) else {
            log::error!("link({}): can't decrypt channel packet", self.id);
            return;
        };

        self.last_inbound = Instant::now();
        self.touch_active();

        let result = self.channel_mut().receive(&plain);
        if let Err(err) = result {
            log::warn!("link({}): channel receive failed: {}", self.id, err);
        }

        self.prove_packet(packet);
    }

    fn handle_keepalive(&mut self, packet: &Packet) {
        if packet.data.is_empty() {
            return;
        }

        self.last_inbound = Instant::now();
        self.touch_active();

        if packet.data.as_slice()[0] == KEEPALIVE_PING {
            log::trace!("link({}): keep-alive request", self.id);
            let _ = self.emit(
                PacketType::Data,
                PacketContext::KeepAlive,
                &[KEEPALIVE_PONG],
                false,
            );
        }
    }

    fn handle_rtt_packet(&mut self, packet: &Packet) {
        let Ok(plain) = self.decrypt(packet.data.as_slice()) else {
            return;
        };

        self.last_inbound = Instant::now();

        if let Ok(rtt) = rmp_serde::from_slice::<f32>(&plain) {
            if !self.rtt_measured && rtt.is_finite() && rtt >= 0.0 {
                self.rtt = Duration::from_secs_f32(rtt);
                self.rtt_measured = true;
                log::trace!("link({}): peer rtt {:.3}s", self.id, rtt);
            }
        }
    }

    fn handle_close_packet(&mut self, packet: &Packet) {
        if packet.data.as_slice() == self.id.as_slice() {
            log::debug!("link({}): peer closed", self.id);
            self.shutdown();
        }
    }

    fn send_rtt(&mut self) {
        let mut buf = Vec::with_capacity(5);
        if rmp::encode::write_f32(&mut buf, self.rtt.as_secs_f32()).is_ok() {
            let _ = self.emit(PacketType::Data, PacketContext::LinkRtt, &buf, true);
        }
    }

    /// Proves a delivered link packet back to the peer.
    fn prove_packet(&mut self, packet: &Packet) {
        let proof = build_proof(&packet.hash(), &self.priv_identity);
        let _ = self.emit(PacketType::Proof, PacketContext::LinkProof, &proof, false);
    }

    fn touch_active(&mut self) {
        if self.status == LinkStatus::Stale {
            self.status = LinkStatus::Active;
        }
    }

    /// First sample wins outright; later samples are smoothed in.
    fn update_rtt(&mut self, sample: Duration) {
        if !self.rtt_measured {
            self.rtt = sample;
            self.rtt_measured = true;
        } else {
            self.rtt = (self.rtt * 7 + sample) / 8;
        }
    }

    //***********************************************************************//

    fn handle_resource_advertisement(&mut self, packet: &Packet) {
        let Ok(plain) = self.decrypt(packet.data.as_slice()) else {
            log::error!("link({}): can't decrypt resource advertisement", self.id);
            return;
        };
        let Ok(advertisement) = crate::resource::ResourceAdvertisement::unpack(&plain) else {
            log::warn!("link({}): malformed resource advertisement", self.id);
            return;
        };

        self.last_inbound = Instant::now();
        self.touch_active();

        if self.incoming_resources.len() >= MAX_INCOMING_RESOURCES {
            log::warn!("link({}): incoming resource pool full", self.id);
            return;
        }
        if self
            .incoming_resources
            .iter()
            .any(|receiver| receiver.resource_hash() == &advertisement.hash)
        {
            return;
        }

        match ResourceReceiver::new(&advertisement) {
            Ok(mut receiver) => {
                let request = receiver.initial_request();
                self.incoming_resources.push(receiver);
                let _ = self.emit_payload(request);
            }
            Err(_) => {
                log::warn!("link({}): rejected resource advertisement", self.id);
            }
        }
    }

    fn handle_resource_request(&mut self, packet: &Packet) {
        let Ok(plain) = self.decrypt(packet.data.as_slice()) else {
            log::error!("link({}): can't decrypt resource request", self.id);
            return;
        };
        let Ok(request) = ResourceRequest::decode(&plain) else {
            log::warn!("link({}): malformed resource request", self.id);
            return;
        };

        self.last_inbound = Instant::now();
        self.touch_active();

        let mut responses = Vec::new();
        for sender in self.outgoing_resources.iter_mut() {
            if sender.resource_hash() == &request.resource_hash {
                responses = sender.handle_request(&request);
                break;
            }
        }

        for payload in responses {
            let _ = self.emit_payload(payload);
        }
    }

    fn handle_resource_hash_update(&mut self, packet: &Packet) {
        let Ok(plain) = self.decrypt(packet.data.as_slice()) else {
            return;
        };
        let Ok(update) = ResourceHashUpdate::decode(&plain) else {
            return;
        };

        self.last_inbound = Instant::now();

        let mut follow_up = None;
        for receiver in self.incoming_resources.iter_mut() {
            if receiver.resource_hash() == &update.resource_hash {
                follow_up = receiver.handle_hash_update(&update);
                break;
            }
        }

        if let Some(payload) = follow_up {
            let _ = self.emit_payload(payload);
        }
    }

    /// Feeds a resource part to the matching receiver. The pool is walked
    /// over a snapshot of resource hashes: completion removes entries, and
    /// the iteration must survive that.
    fn handle_resource_part(&mut self, packet: &Packet) {
        self.last_inbound = Instant::now();

        let snapshot: Vec<Hash> = self
            .incoming_resources
            .iter()
            .map(|receiver| *receiver.resource_hash())
            .collect();

        for hash in snapshot {
            let Some(index) = self
                .incoming_resources
                .iter()
                .position(|receiver| receiver.resource_hash() == &hash)
            else {
                continue;
            };

            let Some(token) = self.token.as_ref() else {
                return;
            };
            let outcome =
                self.incoming_resources[index].handle_part(packet.data.as_slice(), token);

            match outcome {
                PartOutcome::NoMatch => continue,
                PartOutcome::Stored { new_part, next_request } => {
                    if new_part {
                        let progress = self.incoming_resources[index].progress();
                        self.events.push_back(LinkEvent::ResourceProgress {
                            hash,
                            received_parts: progress.received_parts,
                            total_parts: progress.total_parts,
                        });
                    }
                    if let Some(payload) = next_request {
                        let _ = self.emit_payload(payload);
                    }
                    return;
                }
                PartOutcome::Complete { proof, data } => {
                    let receiver = self.incoming_resources.swap_remove(index);
                    let _ = self.emit_payload(proof);
                    self.events.push_back(LinkEvent::ResourceComplete {
                        hash,
                        original_hash: *receiver.original_hash(),
                        segment_index: receiver.segment_index(),
                        total_segments: receiver.total_segments(),
                        data,
                    });
                    return;
                }
                PartOutcome::Failed => {
                    self.incoming_resources.swap_remove(index);
                    self.events.push_back(LinkEvent::ResourceFailed { hash });
                    return;
                }
            }
        }
    }

    /// Resource proofs arrive as PROOF packets with resource context.
    fn handle_resource_proof(&mut self, packet: &Packet) {
        let Ok(proof) = ResourceProof::decode(packet.data.as_slice()) else {
            return;
        };

        self.last_inbound = Instant::now();

        let Some(index) = self
            .outgoing_resources
            .iter()
            .position(|sender| sender.resource_hash() == &proof.resource_hash)
        else {
            return;
        };

        if !self.outgoing_resources[index].handle_proof(&proof) {
            return;
        }

        let sender = self.outgoing_resources.swap_remove(index);
        self.events
            .push_back(LinkEvent::ResourceOutboundComplete { hash: *sender.resource_hash() });

        // More segments pending: advertise the next one immediately.
        if let Some((data, next_index, original_hash, auto_compress)) = sender.next_segment() {
            let next = self.token().and_then(|token| {
                ResourceSender::new(token, data, next_index, Some(original_hash), auto_compress)
            });
            match next {
                Ok(next) => {
                    if let Ok(advertisement) = next.advertisement_payload() {
                        self.outgoing_resources.push(next);
                        let _ = self.emit_payload(advertisement);
                    }
                }
                Err(err) => {
                    log::error!("link({}): next segment failed: {}", self.id, err);
                }
            }
        }
    }

    //***********************************************************************//

    /// Deadline sweep. Keepalives, staleness, handshake expiry, channel and
    /// resource retries all live here.
    pub fn tick(&mut self, now: Instant) {
        match self.status {
            LinkStatus::Pending | LinkStatus::Handshake => {
                if now.duration_since(self.request_time) > self.timing.establishment_timeout {
                    log::debug!("link({}): establishment timed out", self.id);
                    self.shutdown();
                }
                return;
            }
            LinkStatus::Closed => return,
            LinkStatus::Active | LinkStatus::Stale => {}
        }

        let idle = now.duration_since(self.last_inbound);
        if idle > self.timing.close_time {
            log::debug!("link({}): closed after {}s silence", self.id, idle.as_secs());
            self.shutdown();
            return;
        }
        if idle > self.timing.stale_time {
            self.status = LinkStatus::Stale;
        }

        if self.initiator
            && now.duration_since(self.last_outbound) > self.timing.keepalive_interval
        {
            let _ = self.emit(
                PacketType::Data,
                PacketContext::KeepAlive,
                &[KEEPALIVE_PING],
                false,
            );
        }

        self.tick_channel(now);
        self.tick_resources(now);
        self.tick_requests(now);
    }

    fn tick_channel(&mut self, now: Instant) {
        let rtt = self.rtt;
        let Some(channel) = self.channel.as_mut() else {
            return;
        };

        let due = channel.take_due(now, rtt);
        for sequence in due.failed {
            self.events.push_back(LinkEvent::ChannelMessageFailed { sequence });
        }

        for envelope in due.resend {
            let sequence = envelope.sequence;
            let raw = envelope.pack();
            match self.emit(PacketType::Data, PacketContext::Channel, &raw, true) {
                Ok(packet_hash) => self.channel_mut().update_sent(sequence, packet_hash),
                Err(err) => {
                    log::warn!("link({}): channel resend failed: {}", self.id, err);
                }
            }
        }
    }

    fn tick_resources(&mut self, now: Instant) {
        let rtt = self.rtt;

        let mut payloads = Vec::new();
        let mut failed = Vec::new();

        for receiver in self.incoming_resources.iter_mut() {
            match receiver.tick(now, rtt) {
                ReceiverTick::Idle => {}
                ReceiverTick::Resend(payload) => payloads.push(payload),
                ReceiverTick::Failed => failed.push(*receiver.resource_hash()),
            }
        }
        for sender in self.outgoing_resources.iter_mut() {
            if let Some(payload) = sender.tick(now, rtt) {
                payloads.push(payload);
            }
            if sender.status() == ResourceStatus::Failed {
                failed.push(*sender.resource_hash());
            }
        }

        for hash in failed {
            self.incoming_resources.retain(|receiver| receiver.resource_hash() != &hash);
            self.outgoing_resources.retain(|sender| sender.resource_hash() != &hash);
            self.events.push_back(LinkEvent::ResourceFailed { hash });
        }

        for payload in payloads {
            let _ = self.emit_payload(payload);
        }
    }

    fn tick_requests(&mut self, now: Instant) {
        let mut index = 0;
        while index < self.pending_requests.len() {
            let request = &self.pending_requests[index];
            if now.duration_since(request.sent_at) > request.timeout {
                let request = self.pending_requests.swap_remove(index);
                self.events.push_back(LinkEvent::RequestFailed { id: request.id });
            } else {
                index += 1;
            }
        }
    }

    //***********************************************************************//

    /// Explicit teardown: notifies the peer, then cascades failure into
    /// every in-flight resource and request.
    pub fn close(&mut self) {
        if self.status == LinkStatus::Closed {
            return;
        }

        let id_bytes = self.id.as_slice().to_vec();
        let _ = self.emit(PacketType::Data, PacketContext::LinkClose, &id_bytes, false);
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.status = LinkStatus::Closed;

        for request in std::mem::take(&mut self.pending_requests) {
            self.events.push_back(LinkEvent::RequestFailed { id: request.id });
        }
        for receiver in std::mem::take(&mut self.incoming_resources) {
            self.events
                .push_back(LinkEvent::ResourceFailed { hash: *receiver.resource_hash() });
        }
        for sender in std::mem::take(&mut self.outgoing_resources) {
            self.events.push_back(LinkEvent::ResourceFailed { hash: *sender.resource_hash() });
        }

        self.events.push_back(LinkEvent::Closed);
        log::debug!("link({}): closed", self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand_core::OsRng;

    use super::{Link, LinkEvent, LinkStatus, LinkTiming};
    use crate::bytes::Bytes;
    use crate::destination::{DestinationName, SingleInputDestination};

    fn test_destination() -> SingleInputDestination {
        let identity = crate::identity::PrivateIdentity::new_from_rand(OsRng);
        SingleInputDestination::new(identity, DestinationName::new("test", "link"))
    }

    /// Runs the two links against each other until both outboxes drain.
    fn pump(initiator: &mut Link, responder: &mut Link) {
        for _ in 0..100_000 {
            let mut moved = false;

            while let Some(packet) = initiator.pop_outgoing() {
                responder.handle_packet(&packet);
                moved = true;
            }
            while let Some(packet) = responder.pop_outgoing() {
                initiator.handle_packet(&packet);
                moved = true;
            }

            if !moved {
                return;
            }
        }
        panic!("links did not quiesce");
    }

    fn establish() -> (Link, Link) {
        let destination = test_destination();
        let mut initiator = Link::new(destination.desc.clone(), LinkTiming::default());
        let request = initiator.request();

        let mut responder = Link::new_from_request(
            &request,
            destination.identity.sign_key().clone(),
            destination.desc.clone(),
            LinkTiming::default(),
        )
        .expect("responder link");

        pump(&mut initiator, &mut responder);

        assert_eq!(initiator.status(), LinkStatus::Active);
        assert_eq!(responder.status(), LinkStatus::Active);
        assert_eq!(initiator.id(), responder.id());

        (initiator, responder)
    }

    fn drain_data(link: &mut Link) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(event) = link.pop_event() {
            if let LinkEvent::DataReceived { data } = event {
                out.push(data.to_vec());
            }
        }
        out
    }

    #[test]
    fn handshake_activates_both_sides() {
        let (initiator, responder) = establish();
        assert!(initiator.rtt() < Duration::from_secs(1));
        drop(responder);
    }

    #[test]
    fn encrypted_echo_roundtrips() {
        let (mut initiator, mut responder) = establish();
        while initiator.pop_event().is_some() {}
        while responder.pop_event().is_some() {}

        for i in 1..=100u32 {
            let message = format!("TEST_MESSAGE_{}", i);
            initiator.send(message.as_bytes()).expect("send");
            pump(&mut initiator, &mut responder);

            let received = drain_data(&mut responder);
            assert_eq!(received, vec![message.clone().into_bytes()]);

            responder.send(format!("ECHO {}", message).as_bytes()).expect("send");
            pump(&mut initiator, &mut responder);

            let echoed = drain_data(&mut initiator);
            assert_eq!(echoed, vec![format!("ECHO {}", message).into_bytes()]);
        }

        assert_eq!(initiator.status(), LinkStatus::Active);
        assert_eq!(responder.status(), LinkStatus::Active);
    }

    #[test]
    fn request_response_roundtrip() {
        let (mut initiator, mut responder) = establish();

        let id = initiator
            .send_request("status/echo", Some(b"marco"), Duration::from_secs(5))
            .expect("request");
        pump(&mut initiator, &mut responder);

        let mut request_seen = None;
        while let Some(event) = responder.pop_event() {
            if let LinkEvent::RequestReceived { id, path_hash, data } = event {
                assert_eq!(path_hash, crate::destination::request_path_hash("status/echo"));
                assert_eq!(data.as_slice(), b"marco");
                request_seen = Some(id);
            }
        }
        let request_id = request_seen.expect("request event");
        assert_eq!(request_id, id);

        responder.respond(&request_id, b"polo").expect("respond");
        pump(&mut initiator, &mut responder);

        let mut ready = None;
        while let Some(event) = initiator.pop_event() {
            if let LinkEvent::RequestReady { id, data } = event {
                ready = Some((id, data));
            }
        }
        let (ready_id, data) = ready.expect("response event");
        assert_eq!(ready_id, id);
        assert_eq!(data.as_slice(), b"polo");
    }

    #[test]
    fn resource_transfer_over_links() {
        let (mut initiator, mut responder) = establish();

        let payload: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        initiator.send_resource(Bytes::from_vec(payload.clone()), true).expect("resource");
        pump(&mut initiator, &mut responder);

        let mut complete = None;
        while let Some(event) = responder.pop_event() {
            if let LinkEvent::ResourceComplete { data, .. } = event {
                complete = Some(data);
            }
        }
        assert_eq!(complete.expect("resource complete").as_slice(), payload.as_slice());

        let mut outbound_done = false;
        while let Some(event) = initiator.pop_event() {
            if matches!(event, LinkEvent::ResourceOutboundComplete { .. }) {
                outbound_done = true;
            }
        }
        assert!(outbound_done);
        assert_eq!(initiator.outgoing_resource_count(), 0);
        assert_eq!(responder.incoming_resource_count(), 0);
    }

    #[test]
    fn channel_messages_are_acknowledged() {
        let (mut initiator, mut responder) = establish();

        let sequence = initiator.channel_send(0x0100, b"over channel".to_vec()).expect("send");
        assert_eq!(sequence, 0);
        assert_eq!(initiator.channel_mut().pending_tx(), 1);

        pump(&mut initiator, &mut responder);

        // The proof for the channel packet cleared the TX slot.
        assert_eq!(initiator.channel_mut().pending_tx(), 0);
    }

    #[test]
    fn close_fails_children_and_notifies_peer() {
        let (mut initiator, mut responder) = establish();

        initiator
            .send_request("will/fail", None, Duration::from_secs(30))
            .expect("request");
        // Closing before the exchange resolves fails the pending request.
        initiator.close();

        let mut failed = false;
        let mut closed = false;
        while let Some(event) = initiator.pop_event() {
            match event {
                LinkEvent::RequestFailed { .. } => failed = true,
                LinkEvent::Closed => closed = true,
                _ => {}
            }
        }
        assert!(failed);
        assert!(closed);
        assert_eq!(initiator.status(), LinkStatus::Closed);

        pump(&mut initiator, &mut responder);
        assert_eq!(responder.status(), LinkStatus::Closed);
    }

    #[test]
    fn link_rejects_sends_before_activation() {
        let destination = test_destination();
        let mut link = Link::new(destination.desc.clone(), LinkTiming::default());
        let _ = link.request();

        assert!(link.send(b"too early").is_err());
    }
}
