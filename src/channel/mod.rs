pub mod stream;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::error::RnsError;
use crate::hash::Hash;

use stream::{StreamDataMessage, StreamRx, STREAM_DATA_MSGTYPE};

pub const ENVELOPE_OVERHEAD: usize = 6;
pub const RX_RING_SIZE: usize = 16;
pub const TX_RING_SIZE: usize = 16;
pub const CHANNEL_MAX_TRIES: u8 = 5;

/// Message types at and above this value are reserved for the stack.
pub const SYSTEM_MSGTYPE_MIN: u16 = 0xF000;

const RTT_FAST: f32 = 0.18;
const RTT_SLOW: f32 = 0.75;
const WINDOW_FAST: usize = 48;
const WINDOW_MEDIUM: usize = 12;
const WINDOW_SLOW: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    New,
    Sent,
    Delivered,
    Failed,
}

/// Channel framing unit: three big-endian u16 fields followed by the data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub msgtype: u16,
    pub sequence: u16,
    pub data: Vec<u8>,
}

impl Envelope {
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENVELOPE_OVERHEAD + self.data.len());
        out.extend_from_slice(&self.msgtype.to_be_bytes());
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    pub fn unpack(raw: &[u8]) -> Result<Self, RnsError> {
        if raw.len() < ENVELOPE_OVERHEAD {
            return Err(RnsError::Malformed);
        }
        let msgtype = u16::from_be_bytes([raw[0], raw[1]]);
        let sequence = u16::from_be_bytes([raw[2], raw[3]]);
        let len = u16::from_be_bytes([raw[4], raw[5]]) as usize;
        if raw.len() < ENVELOPE_OVERHEAD + len {
            return Err(RnsError::Malformed);
        }
        Ok(Self { msgtype, sequence, data: raw[ENVELOPE_OVERHEAD..ENVELOPE_OVERHEAD + len].to_vec() })
    }
}

pub type Handler = Box<dyn FnMut(&Envelope) -> bool>;

struct TxSlot {
    envelope: Envelope,
    packet_hash: Hash,
    tries: u8,
    next_retry: Instant,
    state: MessageState,
}

/// Envelopes due for a resend this tick, and sequences that ran out of tries.
pub struct DueRetries {
    pub resend: Vec<Envelope>,
    pub failed: Vec<u16>,
}

/// Per-link multiplexer: sequenced delivery with a bounded out-of-order RX
/// ring and a TX ring of unacknowledged envelopes. The owning link performs
/// encryption and packet emission; the channel only tracks framing, ordering
/// and retry state.
pub struct Channel {
    next_sequence: u16,
    next_rx_sequence: u16,
    rx_ring: Vec<Envelope>,
    tx_ring: Vec<TxSlot>,
    handlers: HashMap<u16, Handler>,
    streams: HashMap<u16, Rc<RefCell<StreamRx>>>,
    max_payload: usize,
}

impl Channel {
    pub fn new(max_payload: usize) -> Self {
        Self {
            next_sequence: 0,
            next_rx_sequence: 0,
            rx_ring: Vec::new(),
            tx_ring: Vec::new(),
            handlers: HashMap::new(),
            streams: HashMap::new(),
            max_payload,
        }
    }

    pub fn max_data_len(&self) -> usize {
        self.max_payload
    }

    pub fn register_handler<F>(&mut self, msgtype: u16, handler: F)
    where
        F: FnMut(&Envelope) -> bool + 'static,
    {
        self.handlers.insert(msgtype, Box::new(handler));
    }

    pub(crate) fn attach_stream(&mut self, stream_id: u16) -> Rc<RefCell<StreamRx>> {
        let state = Rc::new(RefCell::new(StreamRx::new()));
        self.streams.insert(stream_id, state.clone());
        state
    }

    pub(crate) fn detach_stream(&mut self, stream_id: u16) {
        self.streams.remove(&stream_id);
    }

    fn effective_window(&self, rtt: Duration) -> usize {
        let rtt = rtt.as_secs_f32();
        let window = if rtt < RTT_FAST {
            WINDOW_FAST
        } else if rtt < RTT_SLOW {
            WINDOW_MEDIUM
        } else {
            WINDOW_SLOW
        };

        window.min(TX_RING_SIZE)
    }

    /// Whether another envelope may enter the TX ring right now.
    pub fn is_ready_to_send(&self, rtt: Duration) -> bool {
        self.tx_ring.len() < self.effective_window(rtt)
    }

    /// Frames the next outgoing envelope. The caller encrypts and emits the
    /// packet, then records it with [`Channel::record_outgoing`].
    pub fn next_envelope(&mut self, msgtype: u16, data: Vec<u8>) -> Result<Envelope, RnsError> {
        if data.len() > self.max_payload {
            return Err(RnsError::InvalidArgument);
        }

        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        Ok(Envelope { msgtype, sequence, data })
    }

    pub fn record_outgoing(
        &mut self,
        envelope: Envelope,
        packet_hash: Hash,
        now: Instant,
        rtt: Duration,
    ) -> Result<u16, RnsError> {
        if self.tx_ring.len() >= TX_RING_SIZE {
            return Err(RnsError::Capacity);
        }

        let sequence = envelope.sequence;
        let next_retry = now + retry_timeout(1, rtt);
        self.tx_ring.push(TxSlot {
            envelope,
            packet_hash,
            tries: 1,
            next_retry,
            state: MessageState::Sent,
        });

        Ok(sequence)
    }

    /// Resolves a link packet proof against the TX ring.
    pub fn acknowledge(&mut self, packet_hash: &Hash) -> Option<u16> {
        let index = self.tx_ring.iter().position(|slot| slot.packet_hash == *packet_hash)?;
        let slot = self.tx_ring.swap_remove(index);
        Some(slot.envelope.sequence)
    }

    /// Collects envelopes whose retry deadline passed. The caller re-emits
    /// each and reports the fresh packet hash via [`Channel::update_sent`].
    pub fn take_due(&mut self, now: Instant, rtt: Duration) -> DueRetries {
        let mut due = DueRetries { resend: Vec::new(), failed: Vec::new() };

        let mut index = 0;
        while index < self.tx_ring.len() {
            let is_due = {
                let slot = &self.tx_ring[index];
                slot.state == MessageState::Sent && now >= slot.next_retry
            };
            if is_due {
                if self.tx_ring[index].tries >= CHANNEL_MAX_TRIES {
                    let slot = self.tx_ring.swap_remove(index);
                    due.failed.push(slot.envelope.sequence);
                    continue;
                }
                let slot = &mut self.tx_ring[index];
                slot.tries += 1;
                slot.next_retry = now + retry_timeout(slot.tries, rtt);
                due.resend.push(slot.envelope.clone());
            }
            index += 1;
        }

        due
    }

    /// Records the packet hash of a re-encrypted retransmission.
    pub fn update_sent(&mut self, sequence: u16, packet_hash: Hash) {
        if let Some(slot) =
            self.tx_ring.iter_mut().find(|slot| slot.envelope.sequence == sequence)
        {
            slot.packet_hash = packet_hash;
        }
    }

    pub fn pending_tx(&self) -> usize {
        self.tx_ring.len()
    }

    /// Decodes an incoming frame and dispatches every envelope that became
    /// deliverable in sequence order. Returns the count dispatched.
    pub fn receive(&mut self, raw: &[u8]) -> Result<usize, RnsError> {
        let envelope = Envelope::unpack(raw)?;
        let distance = envelope.sequence.wrapping_sub(self.next_rx_sequence);

        if distance == 0 {
            let mut dispatched = 1;
            self.next_rx_sequence = self.next_rx_sequence.wrapping_add(1);
            self.dispatch(envelope);

            // Drain buffered successors that became contiguous.
            loop {
                let Some(index) = self
                    .rx_ring
                    .iter()
                    .position(|held| held.sequence == self.next_rx_sequence)
                else {
                    break;
                };
                let held = self.rx_ring.swap_remove(index);
                self.next_rx_sequence = self.next_rx_sequence.wrapping_add(1);
                self.dispatch(held);
                dispatched += 1;
            }

            return Ok(dispatched);
        }

        if (distance as usize) < RX_RING_SIZE {
            if self.rx_ring.iter().any(|held| held.sequence == envelope.sequence) {
                return Ok(0);
            }
            if self.rx_ring.len() >= RX_RING_SIZE {
                return Err(RnsError::Capacity);
            }
            self.rx_ring.push(envelope);
            return Ok(0);
        }

        // Behind the window: an already-delivered duplicate.
        Ok(0)
    }

    fn dispatch(&mut self, envelope: Envelope) {
        if envelope.msgtype == STREAM_DATA_MSGTYPE {
            match StreamDataMessage::unpack(&envelope.data) {
                Ok(message) => {
                    if let Some(stream) = self.streams.get(&message.stream_id) {
                        // The ready callback runs outside the borrow so it
                        // may use the reader handle freely.
                        let callback = {
                            let mut state = stream.borrow_mut();
                            state.push(&message);
                            state.take_callback()
                        };
                        if let Some(mut callback) = callback {
                            let available = stream.borrow().available();
                            callback(available);
                            stream.borrow_mut().restore_callback(callback);
                        }
                    } else {
                        log::trace!("channel: no reader for stream {}", message.stream_id);
                    }
                }
                Err(_) => {
                    log::warn!("channel: dropping malformed stream message");
                }
            }
            return;
        }

        match self.handlers.get_mut(&envelope.msgtype) {
            Some(handler) => {
                let _ = handler(&envelope);
            }
            None => {
                log::trace!("channel: no handler for msgtype {:#06x}", envelope.msgtype);
            }
        }
    }
}

/// Retry backoff: `1.5^(tries-1) · max(rtt · 2.5, 25 ms) · (ring + 1.5)`.
pub fn retry_timeout(tries: u8, rtt: Duration) -> Duration {
    let base = (rtt.as_secs_f32() * 2.5).max(0.025) * (TX_RING_SIZE as f32 + 1.5);
    let scaled = 1.5f32.powi(tries.saturating_sub(1) as i32) * base;
    Duration::from_secs_f32(scaled)
}
