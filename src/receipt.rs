use std::time::{Duration, Instant};

use crate::error::RnsError;
use crate::hash::{AddressHash, Hash, HashBuilder, HASH_SIZE};
use crate::identity::{Identity, PrivateIdentity, SIGNATURE_LENGTH};

pub const PROOF_LENGTH: usize = HASH_SIZE + SIGNATURE_LENGTH;
pub const RECEIPT_TABLE_CAPACITY: usize = 8;
pub const DEFAULT_RECEIPT_TIMEOUT: Duration = Duration::from_secs(15);

/// Builds the body of a PROOF packet for a delivered packet: the full packet
/// hash followed by a signature over `sha256(packet_hash ‖ signer_pub_sign)`.
pub fn build_proof(packet_hash: &Hash, identity: &PrivateIdentity) -> Vec<u8> {
    let signed = proof_digest(packet_hash, identity.as_identity());
    let signature = identity.sign(signed.as_slice());

    let mut out = Vec::with_capacity(PROOF_LENGTH);
    out.extend_from_slice(packet_hash.as_slice());
    out.extend_from_slice(&signature.to_bytes());
    out
}

/// Validates a PROOF body against the prover's identity, returning the
/// proven packet hash.
pub fn validate_proof(data: &[u8], prover: &Identity) -> Result<Hash, RnsError> {
    if data.len() < PROOF_LENGTH {
        return Err(RnsError::Malformed);
    }

    let packet_hash = Hash::read_from(&data[..HASH_SIZE])?;
    let signed = proof_digest(&packet_hash, prover);

    prover.verify_slice(signed.as_slice(), &data[HASH_SIZE..PROOF_LENGTH])?;

    Ok(packet_hash)
}

fn proof_digest(packet_hash: &Hash, prover: &Identity) -> Hash {
    HashBuilder::new().update(packet_hash).update(prover.verifying_key_bytes()).finalize()
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ReceiptStatus {
    Sent,
    Delivered,
    Failed,
}

/// Tracks one outstanding reliable packet until its proof arrives or the
/// deadline passes.
pub struct PacketReceipt {
    pub packet_hash: Hash,
    pub destination: AddressHash,
    pub status: ReceiptStatus,
    sent_at: Instant,
    timeout: Duration,
}

impl PacketReceipt {
    pub fn new(packet_hash: Hash, destination: AddressHash, timeout: Duration) -> Self {
        Self { packet_hash, destination, status: ReceiptStatus::Sent, sent_at: Instant::now(), timeout }
    }

    pub fn is_timed_out(&self, now: Instant) -> bool {
        now.duration_since(self.sent_at) >= self.timeout
    }

    pub fn rtt(&self, now: Instant) -> Duration {
        now.duration_since(self.sent_at)
    }
}

/// Fixed-capacity receipt table; overflow rejects the new insertion.
pub struct ReceiptTable {
    receipts: Vec<PacketReceipt>,
}

impl ReceiptTable {
    pub fn new() -> Self {
        Self { receipts: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.receipts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receipts.is_empty()
    }

    pub fn add(&mut self, receipt: PacketReceipt) -> Result<(), RnsError> {
        if self.receipts.len() >= RECEIPT_TABLE_CAPACITY {
            return Err(RnsError::Capacity);
        }
        self.receipts.push(receipt);
        Ok(())
    }

    /// Matches an inbound proof's destination (the truncated packet hash)
    /// against outstanding receipts.
    pub fn find_truncated(&self, truncated: &AddressHash) -> Option<(Hash, AddressHash)> {
        self.receipts
            .iter()
            .find(|receipt| receipt.packet_hash.truncated() == *truncated)
            .map(|receipt| (receipt.packet_hash, receipt.destination))
    }

    /// Resolves a proven packet hash, removing and returning the receipt.
    pub fn confirm(&mut self, packet_hash: &Hash) -> Option<PacketReceipt> {
        let index = self.receipts.iter().position(|receipt| receipt.packet_hash == *packet_hash)?;
        let mut receipt = self.receipts.swap_remove(index);
        receipt.status = ReceiptStatus::Delivered;
        Some(receipt)
    }

    /// Removes and returns every receipt past its deadline, marked failed.
    pub fn sweep(&mut self, now: Instant) -> Vec<PacketReceipt> {
        let mut failed = Vec::new();
        let mut index = 0;
        while index < self.receipts.len() {
            if self.receipts[index].is_timed_out(now) {
                let mut receipt = self.receipts.swap_remove(index);
                receipt.status = ReceiptStatus::Failed;
                failed.push(receipt);
            } else {
                index += 1;
            }
        }
        failed
    }
}

impl Default for ReceiptTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use rand_core::OsRng;

    use super::{
        build_proof, validate_proof, PacketReceipt, ReceiptTable, RECEIPT_TABLE_CAPACITY,
    };
    use crate::hash::{AddressHash, Hash};
    use crate::identity::PrivateIdentity;

    #[test]
    fn proof_roundtrip() {
        let identity = PrivateIdentity::new_from_rand(OsRng);
        let packet_hash = Hash::of(b"delivered packet");

        let proof = build_proof(&packet_hash, &identity);
        let proven = validate_proof(&proof, identity.as_identity()).expect("valid proof");

        assert_eq!(proven, packet_hash);
    }

    #[test]
    fn proof_rejects_wrong_prover() {
        let identity = PrivateIdentity::new_from_rand(OsRng);
        let other = PrivateIdentity::new_from_rand(OsRng);
        let packet_hash = Hash::of(b"delivered packet");

        let proof = build_proof(&packet_hash, &identity);

        assert!(validate_proof(&proof, other.as_identity()).is_err());
    }

    #[test]
    fn proof_rejects_tampered_signature() {
        let identity = PrivateIdentity::new_from_rand(OsRng);
        let packet_hash = Hash::of(b"delivered packet");

        let mut proof = build_proof(&packet_hash, &identity);
        let last = proof.len() - 1;
        proof[last] ^= 0x01;

        assert!(validate_proof(&proof, identity.as_identity()).is_err());
    }

    #[test]
    fn receipt_table_enforces_capacity() {
        let mut table = ReceiptTable::new();

        for i in 0..RECEIPT_TABLE_CAPACITY {
            let receipt = PacketReceipt::new(
                Hash::of(&[i as u8]),
                AddressHash::default(),
                Duration::from_secs(5),
            );
            assert!(table.add(receipt).is_ok());
        }

        let overflow = PacketReceipt::new(
            Hash::of(b"overflow"),
            AddressHash::default(),
            Duration::from_secs(5),
        );
        assert!(table.add(overflow).is_err());
        assert_eq!(table.len(), RECEIPT_TABLE_CAPACITY);
    }

    #[test]
    fn sweep_fails_timed_out_receipts() {
        let mut table = ReceiptTable::new();
        let receipt = PacketReceipt::new(
            Hash::of(b"slow packet"),
            AddressHash::default(),
            Duration::from_secs(0),
        );
        table.add(receipt).expect("capacity");

        let failed = table.sweep(Instant::now() + Duration::from_millis(1));

        assert_eq!(failed.len(), 1);
        assert!(table.is_empty());
    }
}
