//! # Error Taxonomy
//!
//! Three layers of errors meet here:
//!
//! - **Server NAK codes** (`ServerError`): 16-bit codes the server sends in
//!   `PKT_SERVER_ERROR` packets; the client's adaptive reactions key off
//!   these.
//! - **Client error/diagnostic codes**: 16-bit codes the client sends in
//!   its error and diagnostic packets.
//! - **Crate errors** (`DmtpError` and friends): ordinary `Result` errors
//!   for the library API.

use thiserror::Error;

// ----------------------------------------------------------------------------
// Server -> client NAK codes

/// NAK codes carried in server error packets.
///
/// The code groups follow the reserved error ranges: identity (0xF0xx),
/// packet level (0xF1xx), protocol (0xF3xx), event level (0xF4xx).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ServerError {
    Ok = 0x0000,

    // identity
    IdInvalid = 0xF011,
    AccountInvalid = 0xF021,
    AccountInactive = 0xF022,
    AccountError = 0xF023,
    DeviceInvalid = 0xF031,
    DeviceInactive = 0xF032,
    DeviceError = 0xF033,
    ExcessiveConnections = 0xF041,

    // packet level
    PacketHeader = 0xF111,
    PacketType = 0xF112,
    PacketLength = 0xF113,
    PacketPayload = 0xF114,
    PacketEncoding = 0xF115,
    PacketChecksum = 0xF116,

    // protocol
    BlockChecksum = 0xF311,
    ProtocolError = 0xF312,

    // event level
    FormatDefinitionInvalid = 0xF411,
    FormatNotSupported = 0xF421,
    FormatNotRecognized = 0xF422,
    ExcessiveEvents = 0xF431,
    DuplicateEvent = 0xF432,
    EventError = 0xF441,
}

impl ServerError {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        use ServerError::*;
        Some(match code {
            0x0000 => Ok,
            0xF011 => IdInvalid,
            0xF021 => AccountInvalid,
            0xF022 => AccountInactive,
            0xF023 => AccountError,
            0xF031 => DeviceInvalid,
            0xF032 => DeviceInactive,
            0xF033 => DeviceError,
            0xF041 => ExcessiveConnections,
            0xF111 => PacketHeader,
            0xF112 => PacketType,
            0xF113 => PacketLength,
            0xF114 => PacketPayload,
            0xF115 => PacketEncoding,
            0xF116 => PacketChecksum,
            0xF311 => BlockChecksum,
            0xF312 => ProtocolError,
            0xF411 => FormatDefinitionInvalid,
            0xF421 => FormatNotSupported,
            0xF422 => FormatNotRecognized,
            0xF431 => ExcessiveEvents,
            0xF432 => DuplicateEvent,
            0xF441 => EventError,
            _ => return None,
        })
    }
}

// ----------------------------------------------------------------------------
// Client -> server error / diagnostic codes

/// Error codes the client reports to the server in error packets.
pub mod client_error {
    pub const PACKET_HEADER: u16 = 0xF111;
    pub const PACKET_TYPE: u16 = 0xF112;
    pub const PACKET_LENGTH: u16 = 0xF113;
    pub const PACKET_ENCODING: u16 = 0xF114;
    pub const PACKET_CHECKSUM: u16 = 0xF115;
    pub const PACKET_ACK: u16 = 0xF116;

    pub const PROPERTY_READ_ONLY: u16 = 0xF511;
    pub const PROPERTY_WRITE_ONLY: u16 = 0xF512;
    pub const PROPERTY_INVALID_ID: u16 = 0xF513;
    pub const PROPERTY_INVALID_VALUE: u16 = 0xF514;
    pub const PROPERTY_UNKNOWN_ERROR: u16 = 0xF515;

    pub const COMMAND_INVALID: u16 = 0xF611;
    pub const COMMAND_ERROR: u16 = 0xF612;

    pub const GPS_EXPIRED: u16 = 0xF911;
    pub const GPS_FAILURE: u16 = 0xF912;
}

/// Diagnostic codes the client reports in diagnostic packets.
pub mod client_diag {
    /// Acknowledge one received upload record; payload carries the record
    /// type byte.
    pub const UPLOAD_ACK: u16 = 0xF001;
}

// ----------------------------------------------------------------------------
// Crate errors

/// Payload codec failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("format directive width is not a digit")]
    FormatWidth,
    #[error("format directive type is not recognized")]
    FormatKind,
    #[error("field of {need} bytes exceeds {have} bytes remaining")]
    Overflow { need: usize, have: usize },
    #[error("'{kind}' field cannot be {width} bytes wide")]
    FieldWidth { kind: char, width: usize },
}

/// Packet parse failures, tagged with the NAK/error each side should report.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketParseError {
    #[error("packet checksum mismatch")]
    Checksum,
    #[error("packet shorter than a header")]
    Length,
    #[error("unrecognized packet header")]
    Header,
    #[error("CSV payloads cannot be parsed")]
    CsvEncoding { packet_type: u16 },
    #[error("unrecognized payload encoding marker")]
    Encoding { packet_type: u16 },
}

/// Queue operation failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is full")]
    Full,
}

/// Field-template registry failures. Registration problems are config-fatal:
/// they are reported, never panicked on.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("a template for packet type 0x{0:04X} is already registered")]
    Collision(u16),
    #[error("custom template registry is full")]
    RegistryFull,
    #[error("no template registered for packet type 0x{0:04X}")]
    Unknown(u16),
    #[error("template definition payload is invalid")]
    InvalidDefinition,
}

/// Transport failures surface as one opaque variant; the medium-specific
/// cause stays in the log.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport failed: {0}")]
    Failed(#[from] std::io::Error),
    #[error("transport is not open")]
    NotOpen,
}

/// Top-level library error.
#[derive(Debug, Error)]
pub enum DmtpError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Parse(#[from] PacketParseError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("property error: {0}")]
    Property(String),
    #[error("session error: {0}")]
    Session(String),
}
