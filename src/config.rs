use std::time::Duration;

use crate::destination::link::LinkTiming;
use crate::packet::MAX_HOPS;

/// Tunables for one transport instance. Every wait in the core is a deadline
/// derived from these values and checked on `tick()`.
#[derive(Clone)]
pub struct TransportConfig {
    /// Instance name used in log lines.
    pub name: String,
    /// Whether this node forwards traffic and rebroadcasts announces.
    pub transport_enabled: bool,
    /// Fall back to broadcasting packets without a known path.
    pub broadcast_unknown: bool,
    pub max_hops: u8,
    /// Minimum interval between announces accepted from one origin.
    pub announce_rate_target: Duration,
    /// Violations tolerated before announces are held back.
    pub announce_rate_grace: u32,
    /// Delay before a transport node rebroadcasts a learned announce.
    pub announce_retransmit_delay: Duration,
    pub receipt_timeout: Duration,
    pub path_request_timeout: Duration,
    pub link_timing: LinkTiming,
    /// Multi-segment transfers idle longer than this are purged.
    pub accumulator_timeout: Duration,
    /// How long paths parked for an offline interface stay restorable.
    pub tunnel_lifetime: Duration,
    /// Reverse-table entries expire after this long.
    pub reverse_entry_lifetime: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            name: "reticulum".to_string(),
            transport_enabled: false,
            broadcast_unknown: true,
            max_hops: MAX_HOPS,
            announce_rate_target: Duration::from_secs(3600),
            announce_rate_grace: 10,
            announce_retransmit_delay: Duration::ZERO,
            receipt_timeout: Duration::from_secs(15),
            path_request_timeout: Duration::from_secs(15),
            link_timing: LinkTiming::default(),
            accumulator_timeout: Duration::from_secs(120),
            tunnel_lifetime: Duration::from_secs(600),
            reverse_entry_lifetime: Duration::from_secs(30),
        }
    }
}

impl TransportConfig {
    pub fn named(name: &str) -> Self {
        Self { name: name.to_string(), ..Default::default() }
    }

    pub fn transport_node(name: &str) -> Self {
        Self { name: name.to_string(), transport_enabled: true, ..Default::default() }
    }
}
