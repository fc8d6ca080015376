//! # Server Session State Machine
//!
//! The service-side half of the dialog: validates and acknowledges client
//! blocks, dispatches events/properties/diagnostics/errors to application
//! hooks, arbitrates speak-freely, and pushes server-initiated packets
//! (property get/set, file uploads) at the start of each session.
//!
//! One `ServerSession` drives one accepted connection; the caller owns the
//! listener loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use crate::defaults;
use crate::errors::{DmtpError, PacketParseError, ServerError, TransportError};
use crate::event::{decode_event, Event, EventTemplate, TemplateRegistry};
use crate::packet::{
    client_packet, server_packet, Encoding, Packet, PacketEncoding, MAX_PAYLOAD_LEN,
};
use crate::transport::{read_frame, FrameEvent};

/// Per-connection server policy.
#[derive(Clone)]
pub struct ServerConfig {
    /// Keep the connection alive after the client runs out of things to say.
    pub keep_alive: bool,
    /// Wait for the client to open the conversation instead of nudging it.
    pub client_speaks_first: bool,
    /// Grant the client speak-freely once the session is up.
    pub speak_freely: bool,
    /// Optional per-block event cap delivered with the speak-freely grant.
    pub speak_freely_max_events: i32,
    pub read_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            keep_alive: true,
            client_speaks_first: false,
            speak_freely: false,
            speak_freely_max_events: -1,
            read_timeout: defaults::SERVER_READ_TIMEOUT,
        }
    }
}

type EventHook = Box<dyn Fn(&Packet, &Event) + Send + Sync>;
type DataHook = Box<dyn Fn(u16, &[u8]) + Send + Sync>;
type InitHook = Box<dyn Fn() + Send + Sync>;
type UniqueIdHook = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Application callbacks. All are optional; absent hooks log and move on.
#[derive(Default)]
pub struct ServerHooks {
    pub on_event: Option<EventHook>,
    pub on_property: Option<DataHook>,
    pub on_diagnostic: Option<DataHook>,
    pub on_error: Option<DataHook>,
    /// Invoked once per session, after the client's first EOB.
    pub on_client_init: Option<InitHook>,
    /// Validate a presented unique id; returning false NAKs it so the
    /// client falls back to account/device identification.
    pub on_unique_id: Option<UniqueIdHook>,
}

/// What a completed session amounted to.
#[derive(Debug, Clone, Default)]
pub struct SessionSummary {
    pub account_id: String,
    pub device_id: String,
    pub events_received: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// One server-side protocol session over an accepted stream.
pub struct ServerSession<S> {
    stream: S,
    config: ServerConfig,
    hooks: ServerHooks,
    registry: Arc<TemplateRegistry>,

    /// Server-initiated packets awaiting the next send window.
    pending: Vec<Packet>,
    /// Files streamed to the client at initialization, as
    /// `(client-side name, contents)`.
    uploads: Vec<(String, Vec<u8>)>,

    reply_encoding: PacketEncoding,

    last_event_sequence: u32,
    last_event_seq_len: u8,
    last_event_timer: Option<Instant>,
    have_events: u32,

    account_id: String,
    device_id: String,

    client_needs_init: bool,
    needs_more_info: bool,
    speak_freely_mode: bool,

    events_received: u64,
    session_read_bytes: u64,
    session_write_bytes: u64,
}

impl<S> ServerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, config: ServerConfig, hooks: ServerHooks) -> Self {
        Self {
            stream,
            config,
            hooks,
            registry: Arc::new(TemplateRegistry::new()),
            pending: Vec::new(),
            uploads: Vec::new(),
            reply_encoding: PacketEncoding::BINARY,
            last_event_sequence: 0,
            last_event_seq_len: 0,
            last_event_timer: None,
            have_events: 0,
            account_id: String::new(),
            device_id: String::new(),
            client_needs_init: true,
            needs_more_info: false,
            speak_freely_mode: false,
            events_received: 0,
            session_read_bytes: 0,
            session_write_bytes: 0,
        }
    }

    pub fn with_registry(mut self, registry: Arc<TemplateRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Queue a server-initiated packet for the next send window. Fails when
    /// the pending queue is full.
    pub fn queue_pending(&mut self, packet: Packet) -> bool {
        if self.pending.len() >= defaults::SERVER_PENDING_QUEUE_SIZE {
            warn!("pending packet queue is full");
            return false;
        }
        self.pending.push(packet);
        true
    }

    /// Queue a property GET for the client.
    pub fn queue_get_property(&mut self, key: u16) -> bool {
        match Packet::build(server_packet::GET_PROPERTY, |w| w.write_hex(key as u32, 2)) {
            Ok(pkt) => self.queue_pending(pkt),
            Err(_) => false,
        }
    }

    /// Schedule a file for upload to the client at initialization time.
    /// Upload records are streamed directly, bypassing the pending queue.
    pub fn queue_upload(&mut self, client_name: impl Into<String>, data: Vec<u8>) {
        self.uploads.push((client_name.into(), data));
    }

    /// Queue a property SET for the client.
    pub fn queue_set_property(&mut self, key: u16, value: &[u8]) -> bool {
        let pkt = Packet::build(server_packet::SET_PROPERTY, |w| {
            w.write_hex(key as u32, 2)?;
            w.write_bytes(value, value.len())
        });
        match pkt {
            Ok(pkt) => self.queue_pending(pkt),
            Err(_) => false,
        }
    }

    /// Identification captured from the client, `(account, device)`.
    pub fn client_identity(&self) -> (&str, &str) {
        (&self.account_id, &self.device_id)
    }

    // ------------------------------------------------------------------
    // writing

    async fn write_packet(&mut self, pkt: &Packet) -> Result<(), TransportError> {
        let frame = pkt.encode(self.reply_encoding).map_err(|e| {
            TransportError::Failed(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                e.to_string(),
            ))
        })?;
        if frame.first() == Some(&crate::codec::checksum::ASCII_ENCODING_CHAR) {
            debug!("[TX] {}", String::from_utf8_lossy(&frame).trim_end());
        } else {
            debug!("[TX] 0x{}", crate::codec::ascii::encode_hex(&frame));
        }
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        self.session_write_bytes += frame.len() as u64;
        Ok(())
    }

    async fn write_error(&mut self, code: ServerError, faulting: u16) -> Result<(), TransportError> {
        let pkt = Packet::build(server_packet::ERROR, |w| {
            w.write_hex(code.code() as u32, 2)?;
            w.write_hex(faulting as u32, 2)
        });
        match pkt {
            Ok(pkt) => self.write_packet(&pkt).await,
            Err(_) => Ok(()),
        }
    }

    async fn write_eob_done(&mut self, nudge: bool) -> Result<(), TransportError> {
        let pkt = if nudge {
            Packet::build(server_packet::EOB_DONE, |w| w.write_uint(0, 1))
                .unwrap_or_else(|_| Packet::empty(server_packet::EOB_DONE))
        } else {
            Packet::empty(server_packet::EOB_DONE)
        };
        self.speak_freely_mode = false;
        self.write_packet(&pkt).await
    }

    async fn write_speak_freely(&mut self) -> Result<(), TransportError> {
        let max_events = self.config.speak_freely_max_events;
        let pkt = if max_events >= 0 {
            Packet::build(server_packet::EOB_SPEAK_FREELY, |w| {
                w.write_uint(max_events as u32, 1)
            })
            .unwrap_or_else(|_| Packet::empty(server_packet::EOB_SPEAK_FREELY))
        } else {
            Packet::empty(server_packet::EOB_SPEAK_FREELY)
        };
        self.speak_freely_mode = true;
        self.write_packet(&pkt).await
    }

    async fn write_ack(&mut self) -> Result<(), TransportError> {
        let pkt = if self.last_event_seq_len > 0 {
            let seq = self.last_event_sequence;
            let len = self.last_event_seq_len as usize;
            Packet::build(server_packet::ACK, |w| w.write_hex(seq, len))
                .unwrap_or_else(|_| Packet::empty(server_packet::ACK))
        } else {
            Packet::empty(server_packet::ACK)
        };
        self.have_events = 0;
        self.last_event_timer = None;
        self.write_packet(&pkt).await
    }

    async fn write_eot(&mut self) -> Result<(), TransportError> {
        info!("end of transmission");
        let pkt = Packet::empty(server_packet::EOT);
        self.write_packet(&pkt).await
    }

    async fn drain_pending(&mut self) -> Result<(), TransportError> {
        let pending = std::mem::take(&mut self.pending);
        for pkt in &pending {
            self.write_packet(pkt).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // main loop

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            account_id: self.account_id.clone(),
            device_id: self.device_id.clone(),
            events_received: self.events_received,
            bytes_read: self.session_read_bytes,
            bytes_written: self.session_write_bytes,
        }
    }

    /// Drive the session until the connection ends. Returns the session
    /// summary when the dialog concluded (EOT sent or peer closed);
    /// transport failures surface as errors.
    pub async fn run(mut self) -> Result<SessionSummary, DmtpError> {
        let mut revoke_timer = Instant::now();

        if !self.config.client_speaks_first {
            // nudge the client to speak now
            self.write_eob_done(true).await?;
        }

        loop {
            let frame = match read_frame(&mut self.stream, self.config.read_timeout).await {
                Err(e) => {
                    debug!("read error (EOF?): {}", e);
                    return Ok(self.summary());
                }
                Ok(FrameEvent::Timeout) => {
                    if !self.config.keep_alive {
                        self.write_eot().await?;
                        return Ok(self.summary());
                    }
                    if self.client_needs_init {
                        // nothing heard yet; nudge again
                        info!("client init nudge");
                        self.write_eob_done(true).await?;
                    } else if self.have_events > 0
                        && self
                            .last_event_timer
                            .map(|t| t.elapsed() >= defaults::KEEPALIVE_ACK_DELAY)
                            .unwrap_or(false)
                    {
                        // the client is holding speak-freely; acknowledge
                        // what arrived so far
                        warn!("read timeout, acknowledging received events");
                        self.write_ack().await?;
                    } else if self.speak_freely_mode
                        && revoke_timer.elapsed() >= defaults::REVOKE_SPEAK_FREELY_INTERVAL
                    {
                        // ping the client back into the ack cycle
                        self.write_eob_done(true).await?;
                        revoke_timer = Instant::now();
                    }
                    continue;
                }
                Ok(FrameEvent::Frame(frame)) => frame,
            };
            self.session_read_bytes += frame.len() as u64;
            revoke_timer = Instant::now();

            // answer in the family the client speaks
            self.reply_encoding = if frame.first() == Some(&crate::packet::PACKET_HEADER_BYTE) {
                PacketEncoding::BINARY
            } else {
                PacketEncoding::new(Encoding::Hex)
            };

            let pkt = match Packet::parse(&frame) {
                Ok(pkt) => pkt,
                Err(e) => {
                    // the rest of the stream is suspect; report and hang up
                    let (code, faulting) = match e {
                        PacketParseError::Checksum => (ServerError::PacketChecksum, 0),
                        PacketParseError::Length => (ServerError::PacketLength, 0),
                        PacketParseError::Header => (ServerError::PacketHeader, 0),
                        PacketParseError::CsvEncoding { packet_type }
                        | PacketParseError::Encoding { packet_type } => {
                            (ServerError::PacketEncoding, packet_type)
                        }
                    };
                    error!("unusable client packet: {}", e);
                    self.write_error(code, faulting).await?;
                    self.write_eot().await?;
                    return Ok(self.summary());
                }
            };

            debug!(
                "[RX] type {} payload {} bytes",
                pkt.packet_type,
                pkt.payload.len()
            );

            if pkt.packet_type.is_event() {
                self.handle_event_packet(&pkt).await?;
                continue;
            }

            match pkt.packet_type {
                client_packet::UNIQUE_ID => {
                    let accepted = self
                        .hooks
                        .on_unique_id
                        .as_ref()
                        .map(|f| f(&pkt.payload))
                        .unwrap_or(true);
                    if !accepted {
                        // identification is still outstanding; ask the
                        // client to speak again rather than hanging up
                        self.needs_more_info = true;
                        self.write_error(ServerError::IdInvalid, pkt.packet_type.0)
                            .await?;
                    }
                }

                client_packet::ACCOUNT_ID => {
                    let mut id = pkt.reader().read_str(MAX_PAYLOAD_LEN);
                    id.truncate(defaults::MAX_ID_SIZE);
                    self.account_id = id.trim_end().to_string();
                }

                client_packet::DEVICE_ID => {
                    let mut id = pkt.reader().read_str(MAX_PAYLOAD_LEN);
                    id.truncate(defaults::MAX_ID_SIZE);
                    self.device_id = id.trim_end().to_string();
                    info!("client account/device: {}/{}", self.account_id, self.device_id);
                }

                client_packet::PROPERTY_VALUE => {
                    if pkt.payload.len() >= 2 {
                        let key = pkt.reader().read_uint(2) as u16;
                        if let Some(hook) = &self.hooks.on_property {
                            hook(key, &pkt.payload[2..]);
                        }
                    }
                }

                client_packet::DIAGNOSTIC => {
                    if pkt.payload.len() >= 2 {
                        let key = pkt.reader().read_uint(2) as u16;
                        if let Some(hook) = &self.hooks.on_diagnostic {
                            hook(key, &pkt.payload[2..]);
                        }
                    }
                }

                client_packet::ERROR => {
                    if pkt.payload.len() >= 2 {
                        let key = pkt.reader().read_uint(2) as u16;
                        warn!("client error 0x{:04X}", key);
                        if let Some(hook) = &self.hooks.on_error {
                            hook(key, &pkt.payload[2..]);
                        }
                    }
                }

                client_packet::FORMAT_DEF => {
                    self.handle_format_definition(&pkt).await?;
                }

                client_packet::EOB_DONE | client_packet::EOB_MORE => {
                    let done = pkt.packet_type == client_packet::EOB_DONE;
                    if self.handle_eob(done).await? {
                        return Ok(self.summary());
                    }
                }

                other => {
                    self.write_error(ServerError::PacketType, other.0).await?;
                }
            }
        }
    }

    async fn handle_event_packet(&mut self, pkt: &Packet) -> Result<(), TransportError> {
        match decode_event(pkt, &self.registry) {
            Ok(ev) => {
                if self.last_event_sequence > 0
                    && ev.seq_len > 0
                    && self.last_event_sequence.wrapping_add(1) != ev.sequence
                {
                    error!(
                        "possible event data loss: expected sequence 0x{:04X}, found 0x{:04X}",
                        self.last_event_sequence.wrapping_add(1),
                        ev.sequence
                    );
                }
                self.last_event_sequence = ev.sequence;
                self.last_event_seq_len = ev.seq_len;
                if let Some(hook) = &self.hooks.on_event {
                    hook(pkt, &ev);
                }
                self.have_events += 1;
                self.events_received += 1;
                self.last_event_timer = Some(Instant::now());
            }
            Err(e) => {
                // ask the client for the missing template
                warn!("event format not recognized: {}", e);
                self.write_error(ServerError::FormatNotRecognized, pkt.packet_type.0)
                    .await?;
            }
        }
        Ok(())
    }

    async fn handle_format_definition(&mut self, pkt: &Packet) -> Result<(), TransportError> {
        match EventTemplate::from_definition_packet(pkt) {
            Ok(template) => {
                let ptype = template.packet_type;
                match self.registry.register(template) {
                    Ok(()) => {
                        info!("registered custom format {}", ptype);
                    }
                    Err(crate::errors::TemplateError::Collision(_)) => {
                        // already known; nothing to do
                    }
                    Err(_) => {
                        self.write_error(ServerError::FormatNotSupported, pkt.packet_type.0)
                            .await?;
                    }
                }
            }
            Err(_) => {
                self.write_error(ServerError::FormatDefinitionInvalid, pkt.packet_type.0)
                    .await?;
            }
        }
        Ok(())
    }

    /// Handle a client end-of-block. Returns true when the session is over.
    ///
    /// Any block checksum bytes ride in the EOB payload and are not verified
    /// here; the per-packet framing already protects the stream.
    async fn handle_eob(&mut self, client_done: bool) -> Result<bool, TransportError> {
        if self.have_events > 0 {
            self.write_ack().await?;
        }

        if self.client_needs_init {
            self.client_needs_init = false;
            if let Some(hook) = &self.hooks.on_client_init {
                hook();
            }
            if !self.pending.is_empty() {
                info!("sending pending packets during client initialization");
                self.drain_pending().await?;
            }
            let uploads = std::mem::take(&mut self.uploads);
            for (name, data) in uploads {
                info!("uploading {} ({} bytes)", name, data.len());
                match crate::upload::upload_packets(&name, &data) {
                    Ok(packets) => {
                        for pkt in &packets {
                            self.write_packet(pkt).await?;
                        }
                    }
                    Err(e) => warn!("upload of {} skipped: {}", name, e),
                }
            }
        }

        if self.needs_more_info {
            self.needs_more_info = false;
            self.write_eob_done(true).await?;
            Ok(false)
        } else if self.config.keep_alive && self.config.speak_freely {
            self.write_speak_freely().await?;
            Ok(false)
        } else if client_done {
            self.write_eot().await?;
            Ok(true)
        } else {
            // the client has more to say
            self.write_eob_done(false).await?;
            Ok(false)
        }
    }
}

// ----------------------------------------------------------------------------
