pub mod announce;
pub mod discovery;
pub mod tables;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rand_core::OsRng;

use crate::bytes::Bytes;
use crate::config::TransportConfig;
use crate::destination::link::{Link, LinkEvent, LinkId, RequestId};
use crate::destination::{
    DestinationAnnounce, DestinationDesc, DestinationName, PlainInputDestination, ProofStrategy,
    SingleInputDestination, NAME_HASH_LENGTH,
};
use crate::error::RnsError;
use crate::hash::{AddressHash, Hash};
use crate::identity::{encrypt_for_public_key, Identity, KnownDestinations, PrivateIdentity};
use crate::iface::{IfaceHandle, Interface, InterfaceRegistry};
use crate::packet::{
    DestinationType, Header, HeaderType, Packet, PacketContext, PacketDataBuffer, PacketType,
};
use crate::receipt::{build_proof, validate_proof, PacketReceipt, ReceiptTable};
use crate::resource::SegmentAccumulator;
use crate::storage::{self, Store};

use announce::{AnnounceRateTable, AnnounceTable, HeldAnnounces};
use discovery::{decode_path_request, encode_path_request, path_request_destination, PathRequestTable};
use tables::{LinkTable, PacketHashList, PathTable, ReverseTable, TunnelTable};

pub use tables::PathEntry;

pub const MAX_LOCAL_DESTINATIONS: usize = 32;
pub const MAX_PENDING_LINKS: usize = 4;
pub const MAX_ACTIVE_LINKS: usize = 4;

/// Everything observable from the outside happens through these events,
/// drained by the application after each tick.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    AnnounceReceived {
        destination: AddressHash,
        identity: Identity,
        app_data: Bytes,
        name_hash: [u8; NAME_HASH_LENGTH],
        hops: u8,
    },
    PacketReceived { destination: AddressHash, data: Bytes, packet_hash: Hash },
    ReceiptDelivered { packet_hash: Hash, rtt: Duration },
    ReceiptFailed { packet_hash: Hash },
    LinkEstablished { link_id: LinkId },
    LinkClosed { link_id: LinkId },
    LinkDataReceived { link_id: LinkId, data: Bytes },
    RequestDelivered { link_id: LinkId, request_id: RequestId },
    RequestResponse { link_id: LinkId, request_id: RequestId, data: Bytes },
    RequestFailed { link_id: LinkId, request_id: RequestId },
    ResourceProgress { link_id: LinkId, hash: Hash, received_parts: usize, total_parts: usize },
    ResourceReceived { link_id: LinkId, hash: Hash, data: Bytes },
    ResourceAssembled { original_hash: Hash, data: Bytes },
    ResourceSent { link_id: LinkId, hash: Hash },
    ResourceFailed { link_id: LinkId, hash: Hash },
    ChannelMessageFailed { link_id: LinkId, sequence: u16 },
    PathDiscovered { destination: AddressHash },
    PathRequestTimedOut { destination: AddressHash },
}

/// Callback registration for announce processing, filtered by name hash.
pub trait AnnounceHandler {
    fn name_hash_filter(&self) -> Option<[u8; NAME_HASH_LENGTH]> {
        None
    }

    fn received_announce(
        &mut self,
        destination: &AddressHash,
        identity: &Identity,
        app_data: &[u8],
    );
}

enum LocalDestination {
    Single(SingleInputDestination),
    Plain(PlainInputDestination),
}

impl LocalDestination {
    fn address_hash(&self) -> &AddressHash {
        match self {
            LocalDestination::Single(destination) => destination.address_hash(),
            LocalDestination::Plain(destination) => destination.address_hash(),
        }
    }
}

struct LocalLink {
    link: Link,
    iface: Option<IfaceHandle>,
}

/// The routing and dispatch hub. Single-threaded: applications call
/// [`Transport::tick`] frequently and drain events afterwards; interface
/// drivers marshal frames in through their own queues.
pub struct Transport {
    config: TransportConfig,
    identity: PrivateIdentity,
    ifaces: InterfaceRegistry,
    destinations: Vec<LocalDestination>,
    links: Vec<LocalLink>,
    known_destinations: KnownDestinations,
    path_table: PathTable,
    reverse_table: ReverseTable,
    link_table: LinkTable,
    tunnels: TunnelTable,
    announce_table: AnnounceTable,
    held_announces: HeldAnnounces,
    announce_rates: AnnounceRateTable,
    path_requests: PathRequestTable,
    receipts: ReceiptTable,
    packet_hashlist: PacketHashList,
    accumulator: SegmentAccumulator,
    announce_handlers: Vec<Box<dyn AnnounceHandler>>,
    events: VecDeque<TransportEvent>,
    path_request_dest: AddressHash,
    dropped_duplicates: u64,
}

impl Transport {
    pub fn new(config: TransportConfig, identity: PrivateIdentity) -> Self {
        let accumulator = SegmentAccumulator::new(config.accumulator_timeout);

        Self {
            config,
            identity,
            ifaces: InterfaceRegistry::new(),
            destinations: Vec::new(),
            links: Vec::new(),
            known_destinations: KnownDestinations::new(),
            path_table: PathTable::new(),
            reverse_table: ReverseTable::new(),
            link_table: LinkTable::new(),
            tunnels: TunnelTable::new(),
            announce_table: AnnounceTable::new(),
            held_announces: HeldAnnounces::new(),
            announce_rates: AnnounceRateTable::new(),
            path_requests: PathRequestTable::new(),
            receipts: ReceiptTable::new(),
            packet_hashlist: PacketHashList::new(),
            accumulator,
            announce_handlers: Vec::new(),
            events: VecDeque::new(),
            path_request_dest: path_request_destination(),
            dropped_duplicates: 0,
        }
    }

    pub fn identity(&self) -> &PrivateIdentity {
        &self.identity
    }

    pub fn dropped_duplicates(&self) -> u64 {
        self.dropped_duplicates
    }

    //***********************************************************************//

    pub fn add_interface(&mut self, iface: Box<dyn Interface>) -> Result<IfaceHandle, RnsError> {
        self.ifaces.add(iface)
    }

    pub fn interface_error_count(&mut self, handle: IfaceHandle) -> u64 {
        self.ifaces.get_mut(handle).map(|entry| entry.error_count).unwrap_or(0)
    }

    pub fn register_destination(
        &mut self,
        destination: SingleInputDestination,
    ) -> Result<AddressHash, RnsError> {
        if self.destinations.len() >= MAX_LOCAL_DESTINATIONS {
            return Err(RnsError::Capacity);
        }
        let hash = *destination.address_hash();
        self.destinations.push(LocalDestination::Single(destination));
        Ok(hash)
    }

    pub fn register_plain_destination(
        &mut self,
        destination: PlainInputDestination,
    ) -> Result<AddressHash, RnsError> {
        if self.destinations.len() >= MAX_LOCAL_DESTINATIONS {
            return Err(RnsError::Capacity);
        }
        let hash = *destination.address_hash();
        self.destinations.push(LocalDestination::Plain(destination));
        Ok(hash)
    }

    pub fn destination_mut(
        &mut self,
        address: &AddressHash,
    ) -> Option<&mut SingleInputDestination> {
        self.destinations.iter_mut().find_map(|destination| match destination {
            LocalDestination::Single(single) if single.address_hash() == address => Some(single),
            _ => None,
        })
    }

    pub fn register_announce_handler(&mut self, handler: Box<dyn AnnounceHandler>) {
        self.announce_handlers.push(handler);
    }

    pub fn has_path(&self, destination: &AddressHash) -> bool {
        self.path_table.get(destination).is_some()
    }

    pub fn hops_to(&self, destination: &AddressHash) -> Option<u8> {
        self.path_table.get(destination).map(|entry| entry.hops)
    }

    pub fn recall_identity(&mut self, destination: &AddressHash) -> Option<Identity> {
        self.known_destinations.recall(destination).map(|known| known.identity)
    }

    //***********************************************************************//

    /// Broadcasts an announce for a registered destination.
    pub fn announce(
        &mut self,
        destination: &AddressHash,
        app_data: Option<&[u8]>,
    ) -> Result<(), RnsError> {
        let packet = self
            .destination_mut(destination)
            .ok_or(RnsError::NotFound)?
            .announce(OsRng, app_data)?;

        self.route_outbound(packet);
        Ok(())
    }

    /// Sends identity-encrypted data to a learned SINGLE destination.
    /// Receipt tracking is optional; the receipt table rejects when full.
    pub fn send_data(
        &mut self,
        destination: &AddressHash,
        data: &[u8],
        with_receipt: bool,
    ) -> Result<Hash, RnsError> {
        let (identity, ratchet) = {
            let known = self.known_destinations.recall(destination).ok_or(RnsError::NotFound)?;
            (known.identity, known.ratchet)
        };

        let salt = identity.address_hash;
        let ciphertext = match ratchet {
            Some(ratchet) => encrypt_for_public_key(
                OsRng,
                &x25519_dalek::PublicKey::from(ratchet),
                data,
                salt.as_slice(),
            )?,
            None => identity.encrypt(OsRng, data, salt.as_slice())?,
        };

        let mut packet_data = PacketDataBuffer::new();
        packet_data.write(&ciphertext)?;

        let packet = Packet {
            header: Header { packet_type: PacketType::Data, ..Default::default() },
            destination: *destination,
            transport: None,
            context: PacketContext::None,
            data: packet_data,
        };
        let packet_hash = packet.hash();

        if with_receipt {
            self.receipts.add(PacketReceipt::new(
                packet_hash,
                *destination,
                self.config.receipt_timeout,
            ))?;
        }

        self.route_outbound(packet);
        Ok(packet_hash)
    }

    /// Sends plaintext data to a PLAIN destination.
    pub fn send_plain(&mut self, destination: &AddressHash, data: &[u8]) -> Result<Hash, RnsError> {
        let mut packet_data = PacketDataBuffer::new();
        packet_data.write(data)?;

        let packet = Packet {
            header: Header {
                packet_type: PacketType::Data,
                destination_type: DestinationType::Plain,
                ..Default::default()
            },
            destination: *destination,
            transport: None,
            context: PacketContext::None,
            data: packet_data,
        };
        let packet_hash = packet.hash();

        self.route_outbound(packet);
        Ok(packet_hash)
    }

    /// Emits a proof for a previously received packet; used by destinations
    /// with the application-decides proof strategy.
    pub fn prove_packet(
        &mut self,
        destination: &AddressHash,
        packet_hash: &Hash,
    ) -> Result<(), RnsError> {
        let proof = {
            let single = self
                .destinations
                .iter()
                .find_map(|local| match local {
                    LocalDestination::Single(single)
                        if single.address_hash() == destination =>
                    {
                        Some(single)
                    }
                    _ => None,
                })
                .ok_or(RnsError::NotFound)?;
            build_proof(packet_hash, &single.identity)
        };

        let mut packet_data = PacketDataBuffer::new();
        packet_data.write(&proof)?;

        let packet = Packet {
            header: Header { packet_type: PacketType::Proof, ..Default::default() },
            destination: packet_hash.truncated(),
            transport: None,
            context: PacketContext::None,
            data: packet_data,
        };

        self.route_outbound(packet);
        Ok(())
    }

    /// Queries the mesh for a path to an unknown destination.
    pub fn request_path(&mut self, destination: &AddressHash) -> Result<(), RnsError> {
        self.path_requests.add(*destination, self.config.path_request_timeout)?;

        let mut packet_data = PacketDataBuffer::new();
        packet_data.write(&encode_path_request(destination))?;

        let packet = Packet {
            header: Header {
                packet_type: PacketType::Data,
                destination_type: DestinationType::Plain,
                ..Default::default()
            },
            destination: self.path_request_dest,
            transport: None,
            context: PacketContext::None,
            data: packet_data,
        };

        self.route_outbound(packet);
        Ok(())
    }

    //***********************************************************************//

    fn pending_link_count(&self) -> usize {
        self.links.iter().filter(|local| local.link.status().not_yet_active()).count()
    }

    fn active_link_count(&self) -> usize {
        self.links.iter().filter(|local| local.link.status().usable()).count()
    }

    /// Opens a link towards a destination learned from an announce.
    pub fn open_link(&mut self, destination: &AddressHash) -> Result<LinkId, RnsError> {
        let (identity, name_hash) = {
            let known = self.known_destinations.recall(destination).ok_or(RnsError::NotFound)?;
            (known.identity, known.name_hash)
        };

        let desc = DestinationDesc::new_from_announce(
            identity,
            DestinationName::new_from_name_hash(&name_hash)?,
            *destination,
        );

        self.open_link_with(desc)
    }

    /// Opens a link with a fully known destination description.
    pub fn open_link_with(&mut self, destination: DestinationDesc) -> Result<LinkId, RnsError> {
        if self.pending_link_count() >= MAX_PENDING_LINKS {
            return Err(RnsError::Capacity);
        }

        let mut link = Link::new(destination, self.config.link_timing);
        let packet = link.request();
        let id = *link.id();

        self.links.push(LocalLink { link, iface: None });
        self.route_outbound(packet);

        log::debug!("tp({}): opened link {}", self.config.name, id);
        Ok(id)
    }

    pub fn link_mut(&mut self, id: &LinkId) -> Option<&mut Link> {
        self.links
            .iter_mut()
            .find(|local| local.link.id() == id)
            .map(|local| &mut local.link)
    }

    pub fn close_link(&mut self, id: &LinkId) {
        if let Some(link) = self.link_mut(id) {
            link.close();
        }
    }

    //***********************************************************************//

    pub fn drain_events(&mut self) -> Vec<TransportEvent> {
        self.events.drain(..).collect()
    }

    pub fn poll_event(&mut self) -> Option<TransportEvent> {
        self.events.pop_front()
    }

    //***********************************************************************//

    /// One scheduler pass: interface polling, inbound dispatch, deadline
    /// sweeps and outbound flushing. Idempotent when nothing is pending.
    pub fn tick(&mut self) {
        let now = Instant::now();

        self.sweep_interface_states(now);

        let mut inbound: Vec<(IfaceHandle, Vec<u8>)> = Vec::new();
        for entry in self.ifaces.iter_mut() {
            let handle = entry.handle;
            entry.iface.poll(&mut |raw| inbound.push((handle, raw.to_vec())));
        }

        for (iface, raw) in inbound {
            self.handle_inbound(iface, &raw, now);
        }

        self.release_held_announces(now);
        self.retransmit_announces(now);
        self.tick_links(now);
        self.sweep_receipts(now);
        self.sweep_path_requests(now);

        self.accumulator.sweep(now);
        self.reverse_table.sweep(now, self.config.reverse_entry_lifetime);
        self.link_table.sweep(now, self.config.link_timing.close_time);
        self.tunnels.sweep(now);
    }

    /// Parks paths for interfaces that dropped offline and restores them
    /// when the interface returns within the tunnel lifetime.
    fn sweep_interface_states(&mut self, now: Instant) {
        let mut went_offline = Vec::new();
        let mut came_online = Vec::new();

        for entry in self.ifaces.iter_mut() {
            let online = entry.iface.online();
            if entry.was_online && !online {
                went_offline.push(entry.handle);
            } else if !entry.was_online && online {
                came_online.push(entry.handle);
            }
            entry.was_online = online;
        }

        for handle in went_offline {
            let paths = self.path_table.remove_for_iface(handle);
            if !paths.is_empty() {
                let expires_at = now + self.config.tunnel_lifetime;
                if self.tunnels.park(handle, paths, expires_at).is_err() {
                    log::warn!("tp({}): tunnel table full, paths lost", self.config.name);
                }
            }
        }

        for handle in came_online {
            if let Some(paths) = self.tunnels.reclaim(handle) {
                for path in paths {
                    let _ = self.path_table.learn(
                        path.destination,
                        path.next_hop,
                        path.iface,
                        path.hops,
                    );
                }
            }
        }
    }

    //***********************************************************************//

    fn handle_inbound(&mut self, iface: IfaceHandle, raw: &[u8], now: Instant) {
        let packet = match Packet::from_bytes(raw) {
            Ok(packet) => packet,
            Err(_) => {
                self.ifaces.record_error(iface);
                return;
            }
        };

        // Dedupe with the protocol exceptions: announces and link requests
        // may legitimately arrive again, keepalives repeat by design, and a
        // link proof may be retransmitted while the link is pending.
        let allow_duplicate = match packet.header.packet_type {
            PacketType::Announce => true,
            PacketType::LinkRequest => true,
            PacketType::Data => packet.context == PacketContext::KeepAlive,
            PacketType::Proof => packet.context == PacketContext::LinkRequestProof,
        };
        let is_new = self.packet_hashlist.insert(&packet.hash());
        if !is_new && !allow_duplicate {
            self.dropped_duplicates += 1;
            return;
        }

        if packet.header.packet_type == PacketType::Announce {
            self.handle_announce(iface, packet, now);
            return;
        }

        if packet.destination == self.path_request_dest
            && packet.header.packet_type == PacketType::Data
        {
            self.handle_path_request(iface, &packet);
            return;
        }

        if let Some(index) =
            self.links.iter().position(|local| local.link.id() == &packet.destination)
        {
            self.links[index].iface = Some(iface);
            self.links[index].link.handle_packet(&packet);
            return;
        }

        if packet.header.packet_type == PacketType::LinkRequest
            && self.handle_link_request(iface, &packet)
        {
            return;
        }

        if packet.header.packet_type == PacketType::Data && self.handle_local_data(iface, &packet) {
            return;
        }

        if packet.header.packet_type == PacketType::Proof && self.handle_receipt_proof(&packet) {
            return;
        }

        self.forward(iface, packet, now);
    }

    fn handle_announce(&mut self, iface: IfaceHandle, packet: Packet, now: Instant) {
        // Our own announce echoed back through the mesh.
        if self.destinations.iter().any(|local| local.address_hash() == &packet.destination) {
            return;
        }

        let allowed = self.announce_rates.allow(
            &packet.destination,
            now,
            self.config.announce_rate_target,
            self.config.announce_rate_grace,
        );
        if !allowed {
            log::info!(
                "tp({}): announce rate exceeded for {}, holding",
                self.config.name,
                packet.destination
            );
            let release_at = now + self.config.announce_rate_target;
            if self.held_announces.hold(packet, iface, release_at).is_err() {
                log::warn!("tp({}): held announce table full", self.config.name);
            }
            return;
        }

        self.accept_announce(iface, packet, now);
    }

    fn accept_announce(&mut self, iface: IfaceHandle, packet: Packet, now: Instant) {
        let (identity, app_data, ratchet, name_hash) = {
            let info = match DestinationAnnounce::validate(&packet) {
                Ok(info) => info,
                Err(err) => {
                    log::warn!(
                        "tp({}): invalid announce for {}: {}",
                        self.config.name,
                        packet.destination,
                        err
                    );
                    return;
                }
            };
            (
                info.destination.desc.identity,
                Bytes::from_slice(info.app_data),
                info.ratchet,
                *info.destination.desc.name.name_hash(),
            )
        };

        self.known_destinations.remember(
            packet.destination,
            identity,
            app_data.clone(),
            ratchet,
            name_hash,
        );

        let _ = self.path_table.learn(
            packet.destination,
            packet.transport,
            iface,
            packet.header.hops,
        );

        if self.path_requests.resolve(&packet.destination) {
            self.events.push_back(TransportEvent::PathDiscovered { destination: packet.destination });
        }

        for handler in self.announce_handlers.iter_mut() {
            let matches = handler
                .name_hash_filter()
                .map(|filter| filter == name_hash)
                .unwrap_or(true);
            if matches {
                handler.received_announce(&packet.destination, &identity, app_data.as_slice());
            }
        }

        self.events.push_back(TransportEvent::AnnounceReceived {
            destination: packet.destination,
            identity,
            app_data,
            name_hash,
            hops: packet.header.hops,
        });

        if self.config.transport_enabled {
            let retransmit_at = now + self.config.announce_retransmit_delay;
            if self.announce_table.add(packet, iface, retransmit_at).is_err() {
                log::trace!("tp({}): announce table full", self.config.name);
            }
        }
    }

    fn handle_path_request(&mut self, iface: IfaceHandle, packet: &Packet) {
        let Ok(queried) = decode_path_request(packet.data.as_slice()) else {
            return;
        };

        let response = self.destinations.iter_mut().find_map(|local| match local {
            LocalDestination::Single(single) if single.desc.address_hash == queried => {
                single.path_response(OsRng, None).ok()
            }
            _ => None,
        });

        if let Some(response) = response {
            log::debug!("tp({}): answering path request for {}", self.config.name, queried);
            self.packet_hashlist.insert(&response.hash());
            if let Ok(raw) = response.to_bytes() {
                self.ifaces.send_via(iface, &raw);
            }
        }
    }

    /// Inbound LINK_REQUEST addressed to one of our destinations.
    fn handle_link_request(&mut self, iface: IfaceHandle, packet: &Packet) -> bool {
        let Some((accepts, sign_key, desc)) =
            self.destinations.iter().find_map(|local| match local {
                LocalDestination::Single(single)
                    if single.desc.address_hash == packet.destination =>
                {
                    Some((
                        single.accept_link_requests,
                        single.identity.sign_key().clone(),
                        single.desc.clone(),
                    ))
                }
                _ => None,
            })
        else {
            return false;
        };

        if !accepts {
            log::trace!(
                "tp({}): destination {} does not accept links",
                self.config.name,
                packet.destination
            );
            return true;
        }

        let link_id = LinkId::from(packet);
        if self.links.iter().any(|local| local.link.id() == &link_id) {
            return true;
        }

        if self.active_link_count() >= MAX_ACTIVE_LINKS {
            log::warn!("tp({}): active link table full", self.config.name);
            return true;
        }

        match Link::new_from_request(packet, sign_key, desc, self.config.link_timing) {
            Ok(link) => {
                self.links.push(LocalLink { link, iface: Some(iface) });
            }
            Err(err) => {
                log::warn!("tp({}): link request rejected: {}", self.config.name, err);
            }
        }

        true
    }

    /// Data addressed to a local destination.
    fn handle_local_data(&mut self, iface: IfaceHandle, packet: &Packet) -> bool {
        enum Dispatch {
            Prove(Vec<u8>),
            Deliver,
            Drop,
        }

        let mut outcome = None;

        for local in self.destinations.iter_mut() {
            match local {
                LocalDestination::Single(single)
                    if single.desc.address_hash == packet.destination =>
                {
                    if packet.context != PacketContext::None {
                        outcome = Some((Dispatch::Drop, Bytes::new()));
                        break;
                    }
                    match single.decrypt(packet.data.as_slice()) {
                        Ok(plain) => {
                            let dispatch = match single.proof_strategy {
                                ProofStrategy::ProveAll => Dispatch::Prove(build_proof(
                                    &packet.hash(),
                                    &single.identity,
                                )),
                                ProofStrategy::ProveApp | ProofStrategy::ProveNone => {
                                    Dispatch::Deliver
                                }
                            };
                            outcome = Some((dispatch, Bytes::from_vec(plain)));
                        }
                        Err(err) => {
                            log::warn!(
                                "tp({}): can't decrypt packet for {}: {}",
                                self.config.name,
                                packet.destination,
                                err
                            );
                            outcome = Some((Dispatch::Drop, Bytes::new()));
                        }
                    }
                    break;
                }
                LocalDestination::Plain(plain)
                    if plain.desc.address_hash == packet.destination =>
                {
                    outcome = Some((
                        Dispatch::Deliver,
                        Bytes::from_slice(packet.data.as_slice()),
                    ));
                    break;
                }
                _ => {}
            }
        }

        let Some((dispatch, data)) = outcome else {
            return false;
        };

        match dispatch {
            Dispatch::Drop => {}
            Dispatch::Deliver => {
                self.events.push_back(TransportEvent::PacketReceived {
                    destination: packet.destination,
                    data,
                    packet_hash: packet.hash(),
                });
            }
            Dispatch::Prove(proof) => {
                self.events.push_back(TransportEvent::PacketReceived {
                    destination: packet.destination,
                    data,
                    packet_hash: packet.hash(),
                });

                let mut packet_data = PacketDataBuffer::new();
                if packet_data.write(&proof).is_ok() {
                    let proof_packet = Packet {
                        header: Header { packet_type: PacketType::Proof, ..Default::default() },
                        destination: packet.truncated_hash(),
                        transport: None,
                        context: PacketContext::None,
                        data: packet_data,
                    };
                    self.packet_hashlist.insert(&proof_packet.hash());
                    if let Ok(raw) = proof_packet.to_bytes() {
                        self.ifaces.send_via(iface, &raw);
                    }
                }
            }
        }

        true
    }

    /// Proofs answering our tracked reliable packets.
    fn handle_receipt_proof(&mut self, packet: &Packet) -> bool {
        let Some((packet_hash, destination)) =
            self.receipts.find_truncated(&packet.destination)
        else {
            return false;
        };

        let Some(identity) = self.recall_identity(&destination) else {
            return false;
        };

        match validate_proof(packet.data.as_slice(), &identity) {
            Ok(proven) if proven == packet_hash => {
                if let Some(receipt) = self.receipts.confirm(&packet_hash) {
                    self.events.push_back(TransportEvent::ReceiptDelivered {
                        packet_hash,
                        rtt: receipt.rtt(Instant::now()),
                    });
                }
            }
            _ => {
                log::warn!("tp({}): proof validation failed", self.config.name);
            }
        }

        true
    }

    /// Transport-node forwarding: path-table routing with hop accounting,
    /// link-table switching for link traffic, reverse-path proofs.
    fn forward(&mut self, iface: IfaceHandle, mut packet: Packet, now: Instant) {
        if !self.config.transport_enabled {
            return;
        }

        if packet.header.header_type == HeaderType::Type2 {
            // Routed packets addressed to this node shed their outer header.
            if packet.transport == Some(*self.identity.address_hash()) {
                packet.header.header_type = HeaderType::Type1;
                packet.transport = None;
            } else {
                return;
            }
        }

        if packet.header.hops >= self.config.max_hops {
            log::trace!("tp({}): dropping packet at max hops", self.config.name);
            return;
        }

        if packet.header.destination_type == DestinationType::Link {
            if let Some(entry) = self.link_table.get(&packet.destination) {
                entry.updated_at = now;
                let out_iface = if entry.prev_hop_iface == iface {
                    entry.next_hop_iface
                } else {
                    entry.prev_hop_iface
                };
                packet.header.hops += 1;
                if let Ok(raw) = packet.to_bytes() {
                    self.ifaces.send_via(out_iface, &raw);
                }
            }
            return;
        }

        if let Some(out_iface) = self.path_table.get(&packet.destination).map(|entry| entry.iface)
        {
            packet.header.hops += 1;

            if packet.header.packet_type == PacketType::LinkRequest {
                let _ = self.link_table.insert(LinkId::from(&packet), iface, out_iface);
            }
            if packet.header.packet_type == PacketType::Data
                && packet.header.destination_type == DestinationType::Single
            {
                let _ = self.reverse_table.insert(packet.truncated_hash(), iface);
            }

            if let Ok(raw) = packet.to_bytes() {
                self.ifaces.send_via(out_iface, &raw);
            }
            return;
        }

        if packet.header.packet_type == PacketType::Proof {
            if let Some(out_iface) = self.reverse_table.lookup(&packet.destination) {
                packet.header.hops += 1;
                if let Ok(raw) = packet.to_bytes() {
                    self.ifaces.send_via(out_iface, &raw);
                }
            }
        }
    }

    //***********************************************************************//

    fn release_held_announces(&mut self, now: Instant) {
        let released = self.held_announces.release_due(now);
        for (packet, iface) in released {
            self.accept_announce(iface, packet, now);
        }
    }

    fn retransmit_announces(&mut self, now: Instant) {
        if !self.config.transport_enabled {
            return;
        }

        let due = self.announce_table.due(now, *self.identity.address_hash());
        for (packet, received_on) in due {
            self.packet_hashlist.insert(&packet.hash());
            if let Ok(raw) = packet.to_bytes() {
                self.ifaces.broadcast(&raw, Some(received_on), true);
            }
        }
    }

    fn sweep_receipts(&mut self, now: Instant) {
        for receipt in self.receipts.sweep(now) {
            self.events
                .push_back(TransportEvent::ReceiptFailed { packet_hash: receipt.packet_hash });
        }
    }

    fn sweep_path_requests(&mut self, now: Instant) {
        for destination in self.path_requests.sweep(now) {
            self.events.push_back(TransportEvent::PathRequestTimedOut { destination });
        }
    }

    fn tick_links(&mut self, now: Instant) {
        // Requests surfaced by links get answered by destination handlers
        // after the link loop releases its borrow.
        let mut handler_calls: Vec<(LinkId, AddressHash, RequestId, AddressHash, Bytes)> =
            Vec::new();

        for local in self.links.iter_mut() {
            local.link.tick(now);
            let link_id = *local.link.id();
            let dest_hash = local.link.destination().address_hash;

            while let Some(event) = local.link.pop_event() {
                match event {
                    LinkEvent::Activated => {
                        self.events.push_back(TransportEvent::LinkEstablished { link_id });
                    }
                    LinkEvent::DataReceived { data } => {
                        self.events
                            .push_back(TransportEvent::LinkDataReceived { link_id, data });
                    }
                    LinkEvent::RequestReceived { id, path_hash, data } => {
                        handler_calls.push((link_id, dest_hash, id, path_hash, data));
                    }
                    LinkEvent::RequestDelivered { id } => {
                        self.events.push_back(TransportEvent::RequestDelivered {
                            link_id,
                            request_id: id,
                        });
                    }
                    LinkEvent::RequestReady { id, data } => {
                        self.events.push_back(TransportEvent::RequestResponse {
                            link_id,
                            request_id: id,
                            data,
                        });
                    }
                    LinkEvent::RequestFailed { id } => {
                        self.events
                            .push_back(TransportEvent::RequestFailed { link_id, request_id: id });
                    }
                    LinkEvent::ResourceProgress { hash, received_parts, total_parts } => {
                        self.events.push_back(TransportEvent::ResourceProgress {
                            link_id,
                            hash,
                            received_parts,
                            total_parts,
                        });
                    }
                    LinkEvent::ResourceComplete {
                        hash,
                        original_hash,
                        segment_index,
                        total_segments,
                        data,
                    } => {
                        if total_segments > 1 {
                            match self.accumulator.add_segment(
                                original_hash,
                                segment_index,
                                total_segments,
                                data,
                            ) {
                                Ok(Some(assembled)) => {
                                    self.events.push_back(TransportEvent::ResourceAssembled {
                                        original_hash,
                                        data: assembled,
                                    });
                                }
                                Ok(None) => {}
                                Err(err) => {
                                    log::warn!(
                                        "tp({}): segment accumulation failed: {}",
                                        self.config.name,
                                        err
                                    );
                                }
                            }
                        } else {
                            self.events.push_back(TransportEvent::ResourceReceived {
                                link_id,
                                hash,
                                data,
                            });
                        }
                    }
                    LinkEvent::ResourceOutboundComplete { hash } => {
                        self.events.push_back(TransportEvent::ResourceSent { link_id, hash });
                    }
                    LinkEvent::ResourceFailed { hash } => {
                        self.events.push_back(TransportEvent::ResourceFailed { link_id, hash });
                    }
                    LinkEvent::ChannelMessageFailed { sequence } => {
                        self.events.push_back(TransportEvent::ChannelMessageFailed {
                            link_id,
                            sequence,
                        });
                    }
                    LinkEvent::Closed => {
                        self.events.push_back(TransportEvent::LinkClosed { link_id });
                    }
                }
            }
        }

        for (link_id, dest_hash, request_id, path_hash, data) in handler_calls {
            let response = self
                .destination_mut(&dest_hash)
                .and_then(|single| single.call_request_handler(&path_hash, data.as_slice()));

            if let Some(response) = response {
                if let Some(link) = self.link_mut(&link_id) {
                    if let Err(err) = link.respond(&request_id, &response) {
                        log::warn!("tp({}): response failed: {}", self.config.name, err);
                    }
                }
            }
        }

        // Flush every link outbox through the routing layer.
        let mut outgoing = Vec::new();
        for local in self.links.iter_mut() {
            while let Some(packet) = local.link.pop_outgoing() {
                outgoing.push(packet);
            }
        }
        for packet in outgoing {
            self.route_outbound(packet);
        }

        self.links.retain(|local| local.link.status() != crate::destination::link::LinkStatus::Closed);
    }

    //***********************************************************************//

    /// Route selection: the link's learned interface, then the path table,
    /// then broadcast fan-out for announces and unknown destinations.
    fn route_outbound(&mut self, packet: Packet) {
        let Ok(raw) = packet.to_bytes() else {
            log::error!("tp({}): unencodable outbound packet", self.config.name);
            return;
        };

        // Our own emissions join the dedupe ring so loops die at the edge.
        self.packet_hashlist.insert(&packet.hash());

        let is_announce = packet.header.packet_type == PacketType::Announce;

        let link_iface = self
            .links
            .iter()
            .find(|local| local.link.id() == &packet.destination)
            .and_then(|local| local.iface);
        if let Some(iface) = link_iface {
            if self.ifaces.send_via(iface, &raw) {
                return;
            }
        }

        let path_iface = self.path_table.get(&packet.destination).map(|entry| entry.iface);
        if let Some(iface) = path_iface {
            if self.ifaces.send_via(iface, &raw) {
                return;
            }
        }

        if self.config.broadcast_unknown || is_announce {
            self.ifaces.broadcast(&raw, None, is_announce);
        } else {
            log::trace!(
                "tp({}): no route for outbound packet dst={}",
                self.config.name,
                packet.destination
            );
        }
    }

    //***********************************************************************//

    /// Persists the node identity, the current path snapshot and records of
    /// the registered destinations.
    pub fn persist(&self, store: &mut dyn Store) -> Result<(), RnsError> {
        storage::save_identity(store, &self.identity)?;
        storage::save_paths(store, &self.path_table.snapshot())?;

        for local in &self.destinations {
            if let LocalDestination::Single(single) = local {
                let record = storage::DestinationRecord {
                    address_hash: single.desc.address_hash.as_slice().to_vec(),
                    full_name: single.desc.name.full_name.clone().unwrap_or_default(),
                    identity_hash: single.identity.address_hash().as_slice().to_vec(),
                };
                storage::save_destination_record(store, &record)?;
            }
        }

        Ok(())
    }

    /// Restores a persisted path snapshot onto `iface`.
    pub fn restore_paths(
        &mut self,
        store: &mut dyn Store,
        iface: IfaceHandle,
    ) -> Result<usize, RnsError> {
        let paths = storage::load_paths(store)?;
        let mut restored = 0;
        for (destination, hops) in paths {
            if self.path_table.learn(destination, None, iface, hops).is_ok() {
                restored += 1;
            }
        }
        Ok(restored)
    }
}
