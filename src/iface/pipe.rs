use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::RnsError;

use super::Interface;

const PIPE_QUEUE_CAPACITY: usize = 1024;

/// In-memory point-to-point interface pair. Each endpoint's outbound queue
/// is the peer's inbound queue; queues are mutex-guarded since real drivers
/// feed them from their own threads.
pub struct PipeInterface {
    name: String,
    inbox: Arc<Mutex<VecDeque<Vec<u8>>>>,
    peer_inbox: Arc<Mutex<VecDeque<Vec<u8>>>>,
    online: Arc<AtomicBool>,
}

impl PipeInterface {
    pub fn pair() -> (PipeInterface, PipeInterface) {
        Self::named_pair("pipe-a", "pipe-b")
    }

    pub fn named_pair(name_a: &str, name_b: &str) -> (PipeInterface, PipeInterface) {
        let queue_a = Arc::new(Mutex::new(VecDeque::new()));
        let queue_b = Arc::new(Mutex::new(VecDeque::new()));
        let online_a = Arc::new(AtomicBool::new(true));
        let online_b = Arc::new(AtomicBool::new(true));

        let a = PipeInterface {
            name: name_a.to_string(),
            inbox: queue_a.clone(),
            peer_inbox: queue_b.clone(),
            online: online_a,
        };
        let b = PipeInterface {
            name: name_b.to_string(),
            inbox: queue_b,
            peer_inbox: queue_a,
            online: online_b,
        };

        (a, b)
    }

    /// Shared flag for simulating carrier loss in tests.
    pub fn online_flag(&self) -> Arc<AtomicBool> {
        self.online.clone()
    }
}

impl Interface for PipeInterface {
    fn send_outgoing(&mut self, raw: &[u8]) -> Result<(), RnsError> {
        if !self.online.load(Ordering::Relaxed) {
            return Err(RnsError::PeerClosed);
        }

        let mut queue = self.peer_inbox.lock().map_err(|_| RnsError::InvariantViolation)?;
        if queue.len() >= PIPE_QUEUE_CAPACITY {
            return Err(RnsError::Capacity);
        }
        queue.push_back(raw.to_vec());
        Ok(())
    }

    fn poll(&mut self, sink: &mut dyn FnMut(&[u8])) {
        // Drain everything queued; locks are never held across the callback
        // by taking the whole batch first.
        let batch: Vec<Vec<u8>> = {
            let Ok(mut queue) = self.inbox.lock() else {
                return;
            };
            queue.drain(..).collect()
        };

        for frame in batch {
            sink(&frame);
        }
    }

    fn online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    fn bitrate(&self) -> u64 {
        10_000_000
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::PipeInterface;
    use crate::iface::Interface;

    #[test]
    fn frames_cross_the_pair() {
        let (mut a, mut b) = PipeInterface::pair();

        a.send_outgoing(b"one").expect("send");
        a.send_outgoing(b"two").expect("send");

        let mut frames = Vec::new();
        b.poll(&mut |raw| frames.push(raw.to_vec()));

        assert_eq!(frames, vec![b"one".to_vec(), b"two".to_vec()]);

        // A second poll finds nothing left.
        let mut rest = Vec::new();
        b.poll(&mut |raw| rest.push(raw.to_vec()));
        assert!(rest.is_empty());
    }

    #[test]
    fn offline_interface_rejects_sends() {
        let (mut a, _b) = PipeInterface::pair();
        a.online_flag().store(false, Ordering::Relaxed);

        assert!(a.send_outgoing(b"frame").is_err());
        assert!(!a.online());
    }
}
