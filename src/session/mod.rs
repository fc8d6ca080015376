//! # Session State Machines
//!
//! The client and server halves of the protocol dialog. Both sides speak in
//! blocks terminated by end-of-block packets; the client owns the
//! transmission queues and the adaptive error reactions, the server owns
//! acknowledgement and dispatch to application hooks.

pub mod client;
pub mod server;

pub use client::{stop_all_workers, ClientSession, ProtocolHandle};
pub use server::{ServerConfig, ServerHooks, ServerSession, SessionSummary};

/// Snapshot of GPS receiver health, supplied by the GPS collaborator.
#[derive(Debug, Clone, Copy, Default)]
pub struct GpsHealth {
    /// The most recent fix is too old to trust.
    pub fix_stale: bool,
    /// Unix time of the last sample of any kind from the receiver.
    pub last_sample_time: u32,
    /// Unix time of the last valid fix.
    pub last_valid_time: u32,
}

/// GPS collaborator interface; the engine only asks for health.
pub trait GpsSource: Send + Sync {
    fn health(&self) -> GpsHealth;
}
