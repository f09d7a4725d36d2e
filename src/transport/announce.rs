use std::time::{Duration, Instant};

use crate::error::RnsError;
use crate::hash::AddressHash;
use crate::iface::IfaceHandle;
use crate::packet::{HeaderType, Packet, PropagationType};

pub const MAX_ANNOUNCE_TABLE: usize = 8;
pub const MAX_HELD_ANNOUNCES: usize = 8;
pub const MAX_RATE_ENTRIES: usize = 8;

/// Builds the rebroadcast form of a learned announce: one more hop, routed
/// header with this node's hash in the transport field.
pub fn retransmission(packet: &Packet, transport_id: AddressHash) -> Packet {
    let mut out = *packet;
    out.header.hops = packet.header.hops.saturating_add(1);
    out.header.header_type = HeaderType::Type2;
    out.header.propagation_type = PropagationType::Transport;
    out.transport = Some(transport_id);
    out
}

struct AnnounceEntry {
    packet: Packet,
    received_on: IfaceHandle,
    retransmit_at: Instant,
}

/// Announces queued for rebroadcast by a transport node (capacity 8, reject
/// on overflow). Each is retransmitted exactly once after its delay.
pub struct AnnounceTable {
    entries: Vec<AnnounceEntry>,
}

impl AnnounceTable {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn add(
        &mut self,
        packet: Packet,
        received_on: IfaceHandle,
        retransmit_at: Instant,
    ) -> Result<(), RnsError> {
        if self.entries.iter().any(|entry| entry.packet.destination == packet.destination) {
            return Ok(());
        }
        if self.entries.len() >= MAX_ANNOUNCE_TABLE {
            return Err(RnsError::Capacity);
        }
        self.entries.push(AnnounceEntry { packet, received_on, retransmit_at });
        Ok(())
    }

    /// Drains every entry whose delay elapsed, yielding the rebroadcast
    /// packet and the interface to exclude from the fan-out.
    pub fn due(&mut self, now: Instant, transport_id: AddressHash) -> Vec<(Packet, IfaceHandle)> {
        let mut out = Vec::new();
        let mut index = 0;
        while index < self.entries.len() {
            if self.entries[index].retransmit_at <= now {
                let entry = self.entries.swap_remove(index);
                out.push((retransmission(&entry.packet, transport_id), entry.received_on));
            } else {
                index += 1;
            }
        }
        out
    }
}

impl Default for AnnounceTable {
    fn default() -> Self {
        Self::new()
    }
}

struct RateEntry {
    origin: AddressHash,
    last_announce: Instant,
    violations: u32,
}

/// Per-origin announce rate enforcement (capacity 8). Origins beyond the
/// table capacity pass unchecked rather than evicting tracked peers.
pub struct AnnounceRateTable {
    entries: Vec<RateEntry>,
}

impl AnnounceRateTable {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether an announce from `origin` may proceed right now. Exceeding
    /// the target rate past the grace allowance defers the announce.
    pub fn allow(
        &mut self,
        origin: &AddressHash,
        now: Instant,
        target: Duration,
        grace: u32,
    ) -> bool {
        if let Some(index) = self.entries.iter().position(|entry| entry.origin == *origin) {
            let entry = &mut self.entries[index];
            let allowed = if now.duration_since(entry.last_announce) < target {
                entry.violations += 1;
                entry.violations <= grace
            } else {
                entry.violations = 0;
                true
            };
            if allowed {
                entry.last_announce = now;
            }
            return allowed;
        }

        // Untracked origins beyond table capacity pass unchecked rather
        // than evicting tracked peers.
        if self.entries.len() < MAX_RATE_ENTRIES {
            self.entries.push(RateEntry { origin: *origin, last_announce: now, violations: 0 });
        }
        true
    }
}

impl Default for AnnounceRateTable {
    fn default() -> Self {
        Self::new()
    }
}

struct HeldAnnounce {
    packet: Packet,
    received_on: IfaceHandle,
    release_at: Instant,
}

/// Rate-limited announces are parked here and released, not dropped, once
/// their origin's interval elapses (capacity 8, reject on overflow).
pub struct HeldAnnounces {
    entries: Vec<HeldAnnounce>,
}

impl HeldAnnounces {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn hold(
        &mut self,
        packet: Packet,
        received_on: IfaceHandle,
        release_at: Instant,
    ) -> Result<(), RnsError> {
        if self.entries.len() >= MAX_HELD_ANNOUNCES {
            return Err(RnsError::Capacity);
        }
        self.entries.push(HeldAnnounce { packet, received_on, release_at });
        Ok(())
    }

    pub fn release_due(&mut self, now: Instant) -> Vec<(Packet, IfaceHandle)> {
        let mut out = Vec::new();
        let mut index = 0;
        while index < self.entries.len() {
            if self.entries[index].release_at <= now {
                let entry = self.entries.swap_remove(index);
                out.push((entry.packet, entry.received_on));
            } else {
                index += 1;
            }
        }
        out
    }
}

impl Default for HeldAnnounces {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{AnnounceRateTable, AnnounceTable, HeldAnnounces, MAX_ANNOUNCE_TABLE};
    use crate::hash::AddressHash;
    use crate::iface::IfaceHandle;
    use crate::packet::{HeaderType, Packet};

    fn announce_packet(seed: u8) -> Packet {
        Packet { destination: AddressHash::from([seed; 16]), ..Default::default() }
    }

    #[test]
    fn retransmission_gains_a_hop_and_transport_field() {
        let packet = announce_packet(1);
        let transport_id = AddressHash::from([9u8; 16]);

        let rebroadcast = super::retransmission(&packet, transport_id);

        assert_eq!(rebroadcast.header.hops, 1);
        assert_eq!(rebroadcast.header.header_type, HeaderType::Type2);
        assert_eq!(rebroadcast.transport, Some(transport_id));
    }

    #[test]
    fn announce_table_rejects_overflow() {
        let mut table = AnnounceTable::new();
        let now = Instant::now();

        for i in 0..MAX_ANNOUNCE_TABLE {
            table
                .add(announce_packet(i as u8), IfaceHandle(0), now)
                .expect("within capacity");
        }
        assert!(table.add(announce_packet(0xEE), IfaceHandle(0), now).is_err());
    }

    #[test]
    fn announce_table_drains_due_entries() {
        let mut table = AnnounceTable::new();
        let now = Instant::now();

        table.add(announce_packet(1), IfaceHandle(2), now).expect("add");
        table
            .add(announce_packet(2), IfaceHandle(3), now + Duration::from_secs(60))
            .expect("add");

        let due = table.due(now, AddressHash::from([7u8; 16]));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].1, IfaceHandle(2));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn rate_table_defers_after_grace() {
        let mut table = AnnounceRateTable::new();
        let origin = AddressHash::from([1u8; 16]);
        let target = Duration::from_secs(10);
        let now = Instant::now();

        assert!(table.allow(&origin, now, target, 1));
        // First violation falls within grace, the second does not.
        assert!(table.allow(&origin, now + Duration::from_secs(1), target, 1));
        assert!(!table.allow(&origin, now + Duration::from_secs(2), target, 1));
        // After the interval, announces flow again.
        assert!(table.allow(&origin, now + Duration::from_secs(20), target, 1));
    }

    #[test]
    fn held_announces_release_in_time() {
        let mut held = HeldAnnounces::new();
        let now = Instant::now();

        held.hold(announce_packet(1), IfaceHandle(0), now + Duration::from_millis(10))
            .expect("hold");

        assert!(held.release_due(now).is_empty());
        let released = held.release_due(now + Duration::from_millis(20));
        assert_eq!(released.len(), 1);
        assert_eq!(held.len(), 0);
    }
}
