use std::time::{Duration, Instant};

use crate::error::RnsError;
use crate::hash::{AddressHash, Hash};
use crate::iface::IfaceHandle;

pub const MAX_PATHS: usize = 16;
pub const MAX_REVERSE_ENTRIES: usize = 8;
pub const MAX_LINK_ENTRIES: usize = 8;
pub const MAX_TUNNELS: usize = 16;
pub const DEDUPE_RING_SIZE: usize = 64;

/// One learned route: reach `destination` through `iface`, optionally via a
/// next-hop transport node.
#[derive(Debug, Clone)]
pub struct PathEntry {
    pub destination: AddressHash,
    pub next_hop: Option<AddressHash>,
    pub iface: IfaceHandle,
    pub hops: u8,
    pub updated_at: Instant,
}

/// Learned-path table (capacity 16). Existing destinations update in place;
/// a full table rejects new destinations.
pub struct PathTable {
    entries: Vec<PathEntry>,
}

impl PathTable {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn learn(
        &mut self,
        destination: AddressHash,
        next_hop: Option<AddressHash>,
        iface: IfaceHandle,
        hops: u8,
    ) -> Result<(), RnsError> {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.destination == destination)
        {
            entry.next_hop = next_hop;
            entry.iface = iface;
            entry.hops = hops;
            entry.updated_at = Instant::now();
            return Ok(());
        }

        if self.entries.len() >= MAX_PATHS {
            return Err(RnsError::Capacity);
        }

        self.entries.push(PathEntry {
            destination,
            next_hop,
            iface,
            hops,
            updated_at: Instant::now(),
        });
        Ok(())
    }

    pub fn get(&self, destination: &AddressHash) -> Option<&PathEntry> {
        self.entries.iter().find(|entry| entry.destination == *destination)
    }

    pub fn remove(&mut self, destination: &AddressHash) {
        self.entries.retain(|entry| entry.destination != *destination);
    }

    /// Detaches every path learned over `iface`, for tunnel parking.
    pub fn remove_for_iface(&mut self, iface: IfaceHandle) -> Vec<PathEntry> {
        let mut removed = Vec::new();
        let mut index = 0;
        while index < self.entries.len() {
            if self.entries[index].iface == iface {
                removed.push(self.entries.swap_remove(index));
            } else {
                index += 1;
            }
        }
        removed
    }

    pub fn snapshot(&self) -> Vec<(AddressHash, u8)> {
        self.entries.iter().map(|entry| (entry.destination, entry.hops)).collect()
    }
}

impl Default for PathTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Remembers which interface a forwarded packet arrived on so its proof can
/// travel the same way back (capacity 8, entries expire).
pub struct ReverseTable {
    entries: Vec<(AddressHash, IfaceHandle, Instant)>,
}

impl ReverseTable {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn insert(&mut self, truncated_hash: AddressHash, iface: IfaceHandle) -> Result<(), RnsError> {
        if self.entries.iter().any(|(hash, _, _)| *hash == truncated_hash) {
            return Ok(());
        }
        if self.entries.len() >= MAX_REVERSE_ENTRIES {
            return Err(RnsError::Capacity);
        }
        self.entries.push((truncated_hash, iface, Instant::now()));
        Ok(())
    }

    pub fn lookup(&self, truncated_hash: &AddressHash) -> Option<IfaceHandle> {
        self.entries
            .iter()
            .find(|(hash, _, _)| hash == truncated_hash)
            .map(|(_, iface, _)| *iface)
    }

    pub fn sweep(&mut self, now: Instant, lifetime: Duration) {
        self.entries.retain(|(_, _, created)| now.duration_since(*created) < lifetime);
    }
}

impl Default for ReverseTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Links being forwarded through this transport node (capacity 8): traffic
/// for the link id flows between the two recorded interfaces.
pub struct LinkTable {
    entries: Vec<LinkTableEntry>,
}

#[derive(Debug, Clone)]
pub struct LinkTableEntry {
    pub link_id: AddressHash,
    pub prev_hop_iface: IfaceHandle,
    pub next_hop_iface: IfaceHandle,
    pub updated_at: Instant,
}

impl LinkTable {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn insert(
        &mut self,
        link_id: AddressHash,
        prev_hop_iface: IfaceHandle,
        next_hop_iface: IfaceHandle,
    ) -> Result<(), RnsError> {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.link_id == link_id) {
            entry.prev_hop_iface = prev_hop_iface;
            entry.next_hop_iface = next_hop_iface;
            entry.updated_at = Instant::now();
            return Ok(());
        }
        if self.entries.len() >= MAX_LINK_ENTRIES {
            return Err(RnsError::Capacity);
        }
        self.entries.push(LinkTableEntry {
            link_id,
            prev_hop_iface,
            next_hop_iface,
            updated_at: Instant::now(),
        });
        Ok(())
    }

    pub fn get(&mut self, link_id: &AddressHash) -> Option<&mut LinkTableEntry> {
        self.entries.iter_mut().find(|entry| entry.link_id == *link_id)
    }

    pub fn sweep(&mut self, now: Instant, lifetime: Duration) {
        self.entries.retain(|entry| now.duration_since(entry.updated_at) < lifetime);
    }
}

impl Default for LinkTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Paths parked while their interface is offline (capacity 16). A returning
/// interface reclaims its paths; expired tunnels drop them.
pub struct TunnelTable {
    entries: Vec<TunnelEntry>,
}

pub struct TunnelEntry {
    pub iface: IfaceHandle,
    pub paths: Vec<PathEntry>,
    pub expires_at: Instant,
}

impl TunnelTable {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn park(
        &mut self,
        iface: IfaceHandle,
        paths: Vec<PathEntry>,
        expires_at: Instant,
    ) -> Result<(), RnsError> {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.iface == iface) {
            entry.paths = paths;
            entry.expires_at = expires_at;
            return Ok(());
        }
        if self.entries.len() >= MAX_TUNNELS {
            return Err(RnsError::Capacity);
        }
        self.entries.push(TunnelEntry { iface, paths, expires_at });
        Ok(())
    }

    pub fn reclaim(&mut self, iface: IfaceHandle) -> Option<Vec<PathEntry>> {
        let index = self.entries.iter().position(|entry| entry.iface == iface)?;
        Some(self.entries.swap_remove(index).paths)
    }

    pub fn sweep(&mut self, now: Instant) {
        self.entries.retain(|entry| entry.expires_at > now);
    }
}

impl Default for TunnelTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Ring of recently seen packet hashes. Unlike every other table, overflow
/// overwrites the oldest entry.
pub struct PacketHashList {
    ring: Vec<Hash>,
    next: usize,
}

impl PacketHashList {
    pub fn new() -> Self {
        Self { ring: Vec::with_capacity(DEDUPE_RING_SIZE), next: 0 }
    }

    /// True when the hash was not in the ring (and is now recorded).
    pub fn insert(&mut self, hash: &Hash) -> bool {
        if self.contains(hash) {
            return false;
        }

        if self.ring.len() < DEDUPE_RING_SIZE {
            self.ring.push(*hash);
        } else {
            self.ring[self.next] = *hash;
            self.next = (self.next + 1) % DEDUPE_RING_SIZE;
        }
        true
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.ring.iter().any(|entry| entry == hash)
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }
}

impl Default for PacketHashList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{
        LinkTable, PacketHashList, PathTable, ReverseTable, TunnelTable, DEDUPE_RING_SIZE,
        MAX_LINK_ENTRIES, MAX_PATHS, MAX_REVERSE_ENTRIES,
    };
    use crate::hash::{AddressHash, Hash};
    use crate::iface::IfaceHandle;

    fn address(seed: u8) -> AddressHash {
        AddressHash::from([seed; 16])
    }

    #[test]
    fn path_table_rejects_overflow_but_updates_in_place() {
        let mut table = PathTable::new();

        for i in 0..MAX_PATHS {
            table
                .learn(address(i as u8), None, IfaceHandle(0), 1)
                .expect("within capacity");
        }
        assert!(table.learn(address(0xEE), None, IfaceHandle(0), 1).is_err());

        // Updating a known destination is not an insertion.
        table.learn(address(0), None, IfaceHandle(1), 3).expect("update");
        assert_eq!(table.get(&address(0)).expect("entry").hops, 3);
        assert_eq!(table.len(), MAX_PATHS);
    }

    #[test]
    fn reverse_table_capacity_and_expiry() {
        let mut table = ReverseTable::new();

        for i in 0..MAX_REVERSE_ENTRIES {
            table.insert(address(i as u8), IfaceHandle(0)).expect("within capacity");
        }
        assert!(table.insert(address(0xEE), IfaceHandle(0)).is_err());

        table.sweep(Instant::now() + Duration::from_secs(60), Duration::from_secs(30));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn link_table_routes_between_interfaces() {
        let mut table = LinkTable::new();
        table
            .insert(address(1), IfaceHandle(0), IfaceHandle(1))
            .expect("insert");

        let entry = table.get(&address(1)).expect("entry");
        assert_eq!(entry.prev_hop_iface, IfaceHandle(0));
        assert_eq!(entry.next_hop_iface, IfaceHandle(1));

        for i in 2..=MAX_LINK_ENTRIES as u8 {
            table
                .insert(address(i), IfaceHandle(0), IfaceHandle(1))
                .expect("within capacity");
        }
        assert!(table.insert(address(0xEE), IfaceHandle(0), IfaceHandle(1)).is_err());
    }

    #[test]
    fn tunnels_park_and_reclaim_paths() {
        let mut paths = PathTable::new();
        paths.learn(address(1), None, IfaceHandle(2), 1).expect("learn");
        paths.learn(address(2), None, IfaceHandle(3), 1).expect("learn");

        let moved = paths.remove_for_iface(IfaceHandle(2));
        assert_eq!(moved.len(), 1);
        assert_eq!(paths.len(), 1);

        let mut tunnels = TunnelTable::new();
        tunnels
            .park(IfaceHandle(2), moved, Instant::now() + Duration::from_secs(60))
            .expect("park");

        let restored = tunnels.reclaim(IfaceHandle(2)).expect("reclaim");
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].destination, address(1));
        assert_eq!(tunnels.len(), 0);
    }

    #[test]
    fn dedupe_ring_overwrites_oldest() {
        let mut ring = PacketHashList::new();

        let hashes: Vec<Hash> =
            (0..DEDUPE_RING_SIZE + 1).map(|i| Hash::of(&[i as u8, 1])).collect();

        for hash in hashes.iter().take(DEDUPE_RING_SIZE) {
            assert!(ring.insert(hash));
        }
        assert_eq!(ring.len(), DEDUPE_RING_SIZE);

        // Re-inserting is detected while the entry is in the ring.
        assert!(!ring.insert(&hashes[5]));

        // One more unique hash overwrites the oldest slot.
        assert!(ring.insert(&hashes[DEDUPE_RING_SIZE]));
        assert_eq!(ring.len(), DEDUPE_RING_SIZE);
        assert!(!ring.contains(&hashes[0]));
    }
}
