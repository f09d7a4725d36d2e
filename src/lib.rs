//! microreticulum — a Rust implementation of the Reticulum Network Stack
//! core: cryptographically authenticated, source-routed mesh networking for
//! low-bandwidth, lossy links on constrained devices.
//!
//! The [`transport::Transport`] hub owns every table and link; applications
//! register destinations and interfaces, call [`transport::Transport::tick`]
//! frequently, and drain events.

pub mod buffer;
pub mod bytes;
pub mod channel;
pub mod config;
pub mod crypt;
pub mod destination;
pub mod error;
pub mod hash;
pub mod identity;
pub mod iface;
pub mod packet;
pub mod receipt;
pub mod resource;
pub mod storage;
pub mod transport;

pub use crate::bytes::Bytes;
pub use crate::config::TransportConfig;
pub use crate::destination::link::{Link, LinkId, LinkStatus};
pub use crate::destination::{DestinationName, SingleInputDestination, SingleOutputDestination};
pub use crate::error::RnsError;
pub use crate::hash::{AddressHash, Hash};
pub use crate::identity::{Identity, PrivateIdentity};
pub use crate::packet::Packet;
pub use crate::transport::{Transport, TransportEvent};
