use std::time::{Duration, Instant};

use rand_core::{OsRng, RngCore};

use crate::destination::{DestinationName, PlainInputDestination};
use crate::error::RnsError;
use crate::hash::{AddressHash, ADDRESS_HASH_SIZE};

pub const MAX_PATH_REQUESTS: usize = 8;
const PATH_REQUEST_TAG_LENGTH: usize = 8;

/// The well-known plain destination path requests are sent to.
pub fn path_request_destination() -> AddressHash {
    PlainInputDestination::new(DestinationName::new("rnstransport", "path.request"))
        .desc
        .address_hash
}

/// Path request body: the queried hash plus a random tag so repeated
/// queries survive the dedupe ring.
pub fn encode_path_request(destination: &AddressHash) -> Vec<u8> {
    let mut out = Vec::with_capacity(ADDRESS_HASH_SIZE + PATH_REQUEST_TAG_LENGTH);
    out.extend_from_slice(destination.as_slice());

    let mut tag = [0u8; PATH_REQUEST_TAG_LENGTH];
    OsRng.fill_bytes(&mut tag);
    out.extend_from_slice(&tag);

    out
}

pub fn decode_path_request(data: &[u8]) -> Result<AddressHash, RnsError> {
    AddressHash::read_from(data)
}

struct PathRequest {
    destination: AddressHash,
    requested_at: Instant,
    timeout: Duration,
}

/// Outstanding local path queries (capacity 8, reject on overflow).
pub struct PathRequestTable {
    entries: Vec<PathRequest>,
}

impl PathRequestTable {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn add(&mut self, destination: AddressHash, timeout: Duration) -> Result<(), RnsError> {
        if self.entries.iter().any(|entry| entry.destination == destination) {
            return Ok(());
        }
        if self.entries.len() >= MAX_PATH_REQUESTS {
            return Err(RnsError::Capacity);
        }
        self.entries.push(PathRequest { destination, requested_at: Instant::now(), timeout });
        Ok(())
    }

    /// Clears a query answered by an incoming announce.
    pub fn resolve(&mut self, destination: &AddressHash) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.destination != *destination);
        self.entries.len() != before
    }

    /// Removes and returns every query past its deadline.
    pub fn sweep(&mut self, now: Instant) -> Vec<AddressHash> {
        let mut timed_out = Vec::new();
        let mut index = 0;
        while index < self.entries.len() {
            let entry = &self.entries[index];
            if now.duration_since(entry.requested_at) >= entry.timeout {
                timed_out.push(self.entries.swap_remove(index).destination);
            } else {
                index += 1;
            }
        }
        timed_out
    }
}

impl Default for PathRequestTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{
        decode_path_request, encode_path_request, path_request_destination, PathRequestTable,
        MAX_PATH_REQUESTS,
    };
    use crate::hash::AddressHash;

    #[test]
    fn request_body_roundtrip() {
        let destination = AddressHash::from([5u8; 16]);

        let body = encode_path_request(&destination);
        assert_eq!(decode_path_request(&body).expect("decode"), destination);

        // Tags differ between requests for dedupe purposes.
        assert_ne!(body, encode_path_request(&destination));
    }

    #[test]
    fn destination_hash_is_stable() {
        assert_eq!(path_request_destination(), path_request_destination());
    }

    #[test]
    fn table_capacity_and_timeouts() {
        let mut table = PathRequestTable::new();

        for i in 0..MAX_PATH_REQUESTS {
            table
                .add(AddressHash::from([i as u8; 16]), Duration::from_secs(1))
                .expect("within capacity");
        }
        assert!(table.add(AddressHash::from([0xEE; 16]), Duration::from_secs(1)).is_err());

        let resolved = table.resolve(&AddressHash::from([0u8; 16]));
        assert!(resolved);
        assert_eq!(table.len(), MAX_PATH_REQUESTS - 1);

        let timed_out = table.sweep(Instant::now() + Duration::from_secs(5));
        assert_eq!(timed_out.len(), MAX_PATH_REQUESTS - 1);
        assert_eq!(table.len(), 0);
    }
}
