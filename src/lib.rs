//! # OpenDMTP Protocol Engine
//!
//! A bidirectional protocol between mobile GPS/telemetry devices and a
//! central service. This crate provides the shared protocol core: packet
//! and event codecs, priority-aware transmission queues, the duplex/simplex
//! session state machines for both endpoints, and the server-error taxonomy
//! with its adaptive throttling, plus reference TCP/UDP/file transports
//! and the `dmtp-server` reference binary.

pub mod accounting;
pub mod cli;
pub mod codec;
pub mod errors;
pub mod event;
pub mod logging;
pub mod packet;
pub mod props;
pub mod queue;
pub mod session;
pub mod transport;
pub mod upload;

pub use codec::GpsPoint;
pub use errors::{DmtpError, ServerError};
pub use event::{Event, EventTemplate, FieldDef, FieldId, TemplateRegistry};
pub use packet::{Encoding, Packet, PacketEncoding, PacketPriority, PacketType};
pub use queue::PacketQueue;
pub use transport::{Transport, TransportKind, TransportMedia};

/// The current crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol constants and tunables.
pub mod defaults {
    use std::time::Duration;

    /// Virtual protocol instances a client may run at once (index 0 is the
    /// primary).
    pub const MAX_SIMULTANEOUS_PROTOCOLS: usize = 2;

    // queue capacities
    pub const EVENT_QUEUE_SIZE: usize = 5000;
    pub const SECONDARY_EVENT_QUEUE_SIZE: usize = 10;
    pub const PRIMARY_VOLATILE_QUEUE_SIZE: usize = 15;
    pub const PRIMARY_PENDING_QUEUE_SIZE: usize = 20;
    pub const SECONDARY_VOLATILE_QUEUE_SIZE: usize = 10;
    pub const SECONDARY_PENDING_QUEUE_SIZE: usize = 10;
    pub const SERVER_PENDING_QUEUE_SIZE: usize = 30;

    // identification
    pub const MAX_ID_SIZE: usize = 20;
    pub const MIN_UNIQUE_ID_SIZE: usize = 4;

    // block construction caps
    pub const MAX_SIMPLEX_EVENTS: u32 = 8;
    pub const MAX_DUPLEX_EVENTS: u32 = 16;
    pub const DEFAULT_SIMPLEX_MAX_EVENTS: u32 = 4;
    pub const DEFAULT_DUPLEX_MAX_EVENTS: u32 = 8;

    // severe-error throttling
    pub const MAX_SEVERE_ERRORS: u32 = 10;
    pub const EXCESSIVE_SEVERE_ERRORS: u32 = 15;
    pub const MIN_XMIT_RATE_FLOOR_SEC: u32 = 120;
    pub const MIN_XMIT_DELAY_FLOOR_SEC: u32 = 90;
    pub const XMIT_BACKOFF_CAP_SEC: u32 = 12 * 3600;
    pub const EXCESSIVE_CONNECTIONS_PENALTY_SEC: u32 = 300;
    pub const EXCESSIVE_EVENTS_IN_MOTION_PENALTY_SEC: u32 = 120;
    pub const EXCESSIVE_EVENTS_DORMANT_PENALTY_SEC: u32 = 600;

    // per-session error limits
    pub const CHECKSUM_ERROR_LIMIT: u32 = 3;
    pub const ACCOUNT_ERROR_LIMIT: u32 = 2;

    // connection policy defaults
    pub const MAX_TOTAL_CONNECTIONS: u32 = 30;
    pub const MAX_DUPLEX_CONNECTIONS: u32 = 10;
    pub const CONNECTION_WINDOW_MINUTES: u32 = 60;
    pub const MAX_XMIT_RATE_SEC: u32 = 3600;

    // timing
    pub const DUPLEX_READ_TIMEOUT: Duration = Duration::from_secs(15);
    pub const SERVER_READ_TIMEOUT: Duration = Duration::from_secs(3);
    pub const KEEPALIVE_ACK_DELAY: Duration = Duration::from_secs(3);
    pub const REVOKE_SPEAK_FREELY_INTERVAL: Duration = Duration::from_secs(24 * 3600);
    pub const DUPLEX_ERROR_LOG_INTERVAL: Duration = Duration::from_secs(300);
    pub const SESSION_RETRY_DELAY: Duration = Duration::from_secs(2);

    /// A fix older than this is stale; a receiver silent longer than
    /// [`GPS_FAILURE_INTERVAL_SEC`] is reported as failed outright.
    pub const GPS_EXPIRE_INTERVAL_SEC: u32 = 120;
    pub const GPS_FAILURE_INTERVAL_SEC: u32 = 600;

    // file upload records
    pub const UPLOAD_MAX_FILE_SIZE: usize = 200_000;
    pub const UPLOAD_MAX_FILENAME_SIZE: usize = 64;
    pub const UPLOAD_BLOCK_SIZE: usize = 72;
}
