pub mod pipe;

use core::fmt;

use crate::error::RnsError;
use crate::packet::MTU;

pub const MAX_INTERFACES: usize = 8;

/// Small integer handle identifying a registered interface. Handles stay
/// valid for the lifetime of the transport; interfaces are never removed,
/// only marked offline.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash)]
pub struct IfaceHandle(pub u8);

impl fmt::Display for IfaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "iface{}", self.0)
    }
}

/// Capability the core consumes from a physical interface driver. Drivers
/// run their own I/O (threads, IRQs, sockets) and expose non-blocking
/// queues here; the core never blocks on an interface.
pub trait Interface {
    /// Fire-and-forget enqueue; errors mean queue-full or offline.
    fn send_outgoing(&mut self, raw: &[u8]) -> Result<(), RnsError>;

    /// Drains ALL queued inbound frames into `sink`. Delivering a single
    /// frame per poll starves the core during bursts.
    fn poll(&mut self, sink: &mut dyn FnMut(&[u8]));

    fn mtu(&self) -> usize {
        MTU
    }

    fn online(&self) -> bool {
        true
    }

    fn bitrate(&self) -> u64 {
        1_000_000
    }

    /// Rate-sensitive links may refuse announces for a while.
    fn announce_allowed(&mut self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "iface"
    }
}

pub struct IfaceEntry {
    pub handle: IfaceHandle,
    pub iface: Box<dyn Interface>,
    pub error_count: u64,
    pub was_online: bool,
}

/// Fixed-capacity interface registry; overflow rejects the new interface.
pub struct InterfaceRegistry {
    entries: Vec<IfaceEntry>,
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn add(&mut self, iface: Box<dyn Interface>) -> Result<IfaceHandle, RnsError> {
        if self.entries.len() >= MAX_INTERFACES {
            return Err(RnsError::Capacity);
        }

        let handle = IfaceHandle(self.entries.len() as u8);
        let was_online = iface.online();
        self.entries.push(IfaceEntry { handle, iface, error_count: 0, was_online });

        log::debug!("iface: registered {}", handle);
        Ok(handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut IfaceEntry> {
        self.entries.iter_mut()
    }

    pub fn get_mut(&mut self, handle: IfaceHandle) -> Option<&mut IfaceEntry> {
        self.entries.iter_mut().find(|entry| entry.handle == handle)
    }

    pub fn record_error(&mut self, handle: IfaceHandle) {
        if let Some(entry) = self.get_mut(handle) {
            entry.error_count += 1;
        }
    }

    /// Sends on one interface; send errors are counted, not retried.
    pub fn send_via(&mut self, handle: IfaceHandle, raw: &[u8]) -> bool {
        let Some(entry) = self.get_mut(handle) else {
            return false;
        };
        if !entry.iface.online() {
            return false;
        }
        match entry.iface.send_outgoing(raw) {
            Ok(()) => true,
            Err(err) => {
                entry.error_count += 1;
                log::warn!("iface: send failed on {}: {}", handle, err);
                false
            }
        }
    }

    /// Fans a frame out to every online interface except `exclude`.
    /// Announce frames additionally respect `announce_allowed`.
    pub fn broadcast(
        &mut self,
        raw: &[u8],
        exclude: Option<IfaceHandle>,
        is_announce: bool,
    ) -> usize {
        let mut sent = 0;
        for entry in self.entries.iter_mut() {
            if Some(entry.handle) == exclude || !entry.iface.online() {
                continue;
            }
            if is_announce && !entry.iface.announce_allowed() {
                continue;
            }
            match entry.iface.send_outgoing(raw) {
                Ok(()) => sent += 1,
                Err(_) => entry.error_count += 1,
            }
        }
        sent
    }
}

impl Default for InterfaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
