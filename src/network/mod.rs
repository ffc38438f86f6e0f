//! Peer-to-peer coordination layer: wire codec, transports, channel,
//! handler registry, reliable delivery, and relay deduplication.

pub mod channel;
pub mod dedup;
pub mod handler;
pub mod memory;
pub mod message;
pub mod reliable;
pub mod session;
pub mod tcp;
pub mod transport;
pub mod wire;
