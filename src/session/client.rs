//! # Client Session State Machine
//!
//! Drives one virtual protocol instance: transport selection, the
//! identification/send/ack cycle, end-of-block handshakes, speak-freely
//! arbitration, the server-NAK reactions, and cross-session severe-error
//! throttling. Protocol index 0 is the primary instance with persistent
//! byte counters; other indices are secondary with no persistent
//! accounting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::accounting::{choose_transport, ConnectionAccounting};
use crate::codec::checksum::{Fletcher16, FLETCHER_CHECKSUM_LEN};
use crate::defaults;
use crate::errors::{client_error, CodecError, PacketParseError, ServerError, TransportError};
use crate::event::TemplateRegistry;
use crate::packet::{
    client_packet, server_packet, Encoding, Packet, PacketEncoding, PacketPriority, PacketType,
    ENCODING_REQUIRED_MASK, SEQUENCE_ALL,
};
use crate::props::{PropError, PropKey, PropertyStore};
use crate::queue::PacketQueue;
use crate::session::GpsSource;
use crate::transport::{FrameEvent, Transport, TransportKind, TransportMedia};

/// Stop signals of every spawned protocol worker, for process shutdown.
static WORKER_STOPS: Mutex<Vec<(Arc<AtomicBool>, Arc<Notify>)>> = Mutex::new(Vec::new());

/// Signal every spawned protocol worker to stop after its current session.
pub fn stop_all_workers() {
    for (running, notify) in WORKER_STOPS.lock().iter() {
        running.store(false, Ordering::Relaxed);
        notify.notify_one();
    }
}

/// Which identification the next block must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendIdent {
    None,
    Unique,
    Account,
}

/// Whether the session loop should keep going after a server packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopAction {
    Continue,
    Close,
}

/// One client protocol instance bound to its transport.
pub struct ClientSession<T: Transport> {
    index: usize,
    is_primary: bool,
    is_serial: bool,
    transport: T,

    props: Arc<PropertyStore>,
    accounting: Arc<ConnectionAccounting>,
    registry: Arc<TemplateRegistry>,
    gps: Option<Arc<dyn GpsSource>>,

    event_queue: Arc<PacketQueue>,
    volatile_queue: Arc<PacketQueue>,
    pending_queue: Arc<PacketQueue>,

    session_encoding: PacketEncoding,
    first_encoding: PacketEncoding,
    encoding_changed: bool,

    speak_freely: bool,
    speak_freely_max_events: i32,
    relinquish_speak_freely: Arc<AtomicBool>,
    threaded: bool,
    speak_brief: bool,

    send_ident: SendIdent,

    severe_errors: u32,
    total_severe_errors: u32,
    checksum_errors: u32,
    account_errors: u32,

    total_read_bytes: u32,
    total_write_bytes: u32,
    session_read_bytes: u32,
    session_write_bytes: u32,

    fletcher: Fletcher16,
    last_duplex_error: Option<Instant>,
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

impl<T: Transport> ClientSession<T> {
    pub fn new(
        index: usize,
        transport: T,
        props: Arc<PropertyStore>,
        accounting: Arc<ConnectionAccounting>,
        registry: Arc<TemplateRegistry>,
    ) -> Self {
        let is_primary = index == 0;
        let is_serial = transport.media() == TransportMedia::Serial;
        let default_encoding = match transport.media() {
            TransportMedia::Socket => PacketEncoding::BINARY,
            TransportMedia::File => PacketEncoding::new(Encoding::Hex),
            TransportMedia::Serial => PacketEncoding::with_checksum(Encoding::Hex),
            TransportMedia::Gprs => PacketEncoding::new(Encoding::Base64),
        };
        let (volatile_size, pending_size, event_size) = if is_primary {
            (
                defaults::PRIMARY_VOLATILE_QUEUE_SIZE,
                defaults::PRIMARY_PENDING_QUEUE_SIZE,
                defaults::EVENT_QUEUE_SIZE,
            )
        } else {
            (
                defaults::SECONDARY_VOLATILE_QUEUE_SIZE,
                defaults::SECONDARY_PENDING_QUEUE_SIZE,
                defaults::SECONDARY_EVENT_QUEUE_SIZE,
            )
        };
        let total_read_bytes = if is_primary {
            props.get_u32(PropKey::CommBytesRead, 0)
        } else {
            0
        };
        let total_write_bytes = if is_primary {
            props.get_u32(PropKey::CommBytesWritten, 0)
        } else {
            0
        };
        let event_queue = Arc::new(PacketQueue::new(event_size));
        event_queue.enable_overwrite(true);
        ClientSession {
            index,
            is_primary,
            is_serial,
            transport,
            props,
            accounting,
            registry,
            gps: None,
            event_queue,
            volatile_queue: Arc::new(PacketQueue::new(volatile_size)),
            pending_queue: Arc::new(PacketQueue::new(pending_size)),
            session_encoding: default_encoding,
            first_encoding: default_encoding,
            encoding_changed: false,
            speak_freely: false,
            speak_freely_max_events: -1,
            relinquish_speak_freely: Arc::new(AtomicBool::new(false)),
            threaded: false,
            speak_brief: false,
            send_ident: SendIdent::None,
            severe_errors: 0,
            total_severe_errors: 0,
            checksum_errors: 0,
            account_errors: 0,
            total_read_bytes,
            total_write_bytes,
            session_read_bytes: 0,
            session_write_bytes: 0,
            fletcher: Fletcher16::new(),
            last_duplex_error: None,
        }
    }

    pub fn with_gps(mut self, gps: Arc<dyn GpsSource>) -> Self {
        self.gps = Some(gps);
        self
    }

    /// Share an event queue (the primary instance uses the application's
    /// global event stream).
    pub fn with_event_queue(mut self, queue: Arc<PacketQueue>) -> Self {
        self.event_queue = queue;
        self
    }

    pub fn event_queue(&self) -> Arc<PacketQueue> {
        Arc::clone(&self.event_queue)
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    pub fn is_speak_freely(&self) -> bool {
        self.transport.is_open() && self.speak_freely
    }

    pub fn session_byte_counts(&self) -> (u32, u32) {
        (self.session_read_bytes, self.session_write_bytes)
    }

    pub fn total_byte_counts(&self) -> (u32, u32) {
        (self.total_read_bytes, self.total_write_bytes)
    }

    // ------------------------------------------------------------------
    // queueing

    /// Queue a packet for transmission. High priority goes to the pending
    /// queue (survives sessions); the rest ride the volatile queue.
    pub fn queue_packet(&self, packet: Packet) -> bool {
        queue_packet_to(&self.pending_queue, &self.volatile_queue, packet)
    }

    /// Queue a diagnostic packet (code plus opaque payload) for the server.
    pub fn queue_diagnostic(&self, code: u16, data: &[u8]) -> bool {
        let pkt = Packet::build(client_packet::DIAGNOSTIC, |w| {
            w.write_hex(code as u32, 2)?;
            w.write_bytes(data, data.len())
        });
        match pkt {
            Ok(pkt) => self.queue_packet(pkt),
            Err(_) => false,
        }
    }

    fn queue_error(&self, code: u16, arg: u32) {
        self.queue_error_payload(code, |w| w.write_hex(arg, 2));
    }

    fn queue_error_payload<F>(&self, code: u16, extra: F)
    where
        F: FnOnce(&mut crate::codec::PayloadWriter) -> Result<(), CodecError>,
    {
        let pkt = Packet::build(client_packet::ERROR, |w| {
            w.write_hex(code as u32, 2)?;
            extra(w)
        });
        match pkt {
            Ok(pkt) => {
                self.queue_packet(pkt);
            }
            Err(e) => warn!("[{}] could not build error packet: {}", self.index, e),
        }
    }

    fn has_data_to_send(&self) -> bool {
        self.send_ident != SendIdent::None
            || self.pending_queue.has_packets()
            || self.volatile_queue.has_packets()
            || self.event_queue.has_packets()
    }

    // ------------------------------------------------------------------
    // encodings

    /// Constrain a requested encoding to what the property bitmap allows.
    fn supported_encoding(&self, want: PacketEncoding) -> PacketEncoding {
        if want.encoding == Encoding::Binary {
            return want;
        }
        let prop_mask = if self.is_primary {
            self.props.get_u32(PropKey::CommEncodings, 0)
        } else {
            0
        };
        let mask = prop_mask | ENCODING_REQUIRED_MASK;
        let mut value = want.encoding as u8;
        while (1u32 << value) & mask == 0 {
            value -= 1;
        }
        let base = match value {
            0 => Encoding::Binary,
            1 => Encoding::Base64,
            2 => Encoding::Hex,
            _ => Encoding::Csv,
        };
        want.rebased(base)
    }

    /// Fix the session encodings. The first outbound packet of a duplex
    /// session is never CSV: the server need not parse it.
    fn set_session_encoding(&mut self, kind: TransportKind, enc: PacketEncoding) {
        self.session_encoding = enc;
        self.encoding_changed = false;
        self.first_encoding = enc;
        if kind == TransportKind::Duplex && enc.encoding == Encoding::Csv {
            self.first_encoding = enc.rebased(Encoding::Base64);
        }
    }

    // ------------------------------------------------------------------
    // open / close

    async fn open(&mut self, kind: TransportKind) -> bool {
        if let Err(e) = self.transport.open(kind).await {
            debug!("[{}] transport open failed: {}", self.index, e);
            return false;
        }
        self.volatile_queue.reset();
        self.event_queue.enable_overwrite(false);
        if self.is_primary {
            self.total_read_bytes = self.props.get_u32(PropKey::CommBytesRead, 0);
            self.total_write_bytes = self.props.get_u32(PropKey::CommBytesWritten, 0);
        } else {
            self.total_read_bytes = 0;
            self.total_write_bytes = 0;
        }
        self.session_read_bytes = 0;
        self.session_write_bytes = 0;
        self.send_ident = if self.is_serial {
            SendIdent::Account
        } else {
            SendIdent::Unique
        };
        self.severe_errors = 0;
        self.checksum_errors = 0;
        self.account_errors = 0;
        true
    }

    async fn close(&mut self, kind: TransportKind, send_pending: bool) -> bool {
        let do_send = kind == TransportKind::Simplex && send_pending;
        let closed = self.transport.close(do_send).await.is_ok();
        if closed && self.is_primary {
            self.props.set_u32(PropKey::CommBytesRead, self.total_read_bytes);
            self.props
                .set_u32(PropKey::CommBytesWritten, self.total_write_bytes);
        }
        self.volatile_queue.reset();
        self.event_queue.enable_overwrite(true);

        if kind == TransportKind::Duplex {
            if self.severe_errors > 0 {
                self.total_severe_errors += self.severe_errors;
                warn!(
                    "[{}] severe errors encountered --> {}",
                    self.index, self.total_severe_errors
                );
                if !self.is_serial && self.is_primary {
                    if self.total_severe_errors >= defaults::MAX_SEVERE_ERRORS {
                        self.backoff_transmit_policy();
                    }
                    if self.total_severe_errors >= defaults::EXCESSIVE_SEVERE_ERRORS {
                        error!(
                            "[{}] excessive severe errors, disabling periodic events",
                            self.index
                        );
                        self.props.set_u32(PropKey::MotionStart, 0);
                        self.props.set_u32(PropKey::MotionInMotion, 0);
                        self.props.set_u32(PropKey::MotionDormantInterval, 0);
                    }
                }
            } else if self.total_severe_errors > 0 {
                // a clean session earns back one unit
                self.total_severe_errors -= 1;
            }
        }
        closed
    }

    /// Double the minimum transmit rate and delay, capped at 12 hours.
    fn backoff_transmit_policy(&self) {
        let rate = self.props.get_u32(PropKey::CommMinXmitRate, 0);
        if rate < defaults::XMIT_BACKOFF_CAP_SEC {
            let rate = rate.max(defaults::MIN_XMIT_RATE_FLOOR_SEC);
            self.props.set_u32(PropKey::CommMinXmitRate, rate.saturating_mul(2));
        }
        let delay = self.props.get_u32(PropKey::CommMinXmitDelay, 0);
        if delay < defaults::XMIT_BACKOFF_CAP_SEC {
            let delay = delay.max(defaults::MIN_XMIT_DELAY_FLOOR_SEC);
            self.props
                .set_u32(PropKey::CommMinXmitDelay, delay.saturating_mul(2));
        }
    }

    // ------------------------------------------------------------------
    // writing

    async fn write_raw(&mut self, buf: &[u8], calc_fletcher: bool) -> Result<usize, TransportError> {
        if let Some(&first) = buf.first() {
            if first == crate::codec::checksum::ASCII_ENCODING_CHAR {
                info!(
                    "Tx{}]{}",
                    self.index,
                    String::from_utf8_lossy(&buf[..buf.len() - 1])
                );
            } else {
                info!("Tx{}]0x{}", self.index, crate::codec::ascii::encode_hex(buf));
            }
        }
        let len = self.transport.write_packet(buf).await?;
        if calc_fletcher {
            self.fletcher.update(buf);
        }
        self.total_write_bytes = self.total_write_bytes.wrapping_add(len as u32);
        self.session_write_bytes = self.session_write_bytes.wrapping_add(len as u32);
        Ok(len)
    }

    async fn write_packet(&mut self, pkt: &Packet) -> Result<usize, TransportError> {
        let frame = pkt.encode(self.first_encoding).map_err(|e| {
            TransportError::Failed(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                e.to_string(),
            ))
        })?;
        let n = self.write_raw(&frame, true).await?;
        self.first_encoding = self.session_encoding;
        Ok(n)
    }

    // ------------------------------------------------------------------
    // identification

    async fn send_identification(&mut self) -> Result<(), TransportError> {
        if self.send_ident == SendIdent::None {
            return Ok(());
        }

        if self.send_ident == SendIdent::Unique {
            let unique = self.props.get_bytes(PropKey::StateUniqueId);
            if unique.len() >= defaults::MIN_UNIQUE_ID_SIZE && unique.iter().any(|&b| b != 0) {
                let len = unique.len();
                let pkt = Packet::build(client_packet::UNIQUE_ID, |w| w.write_bytes(&unique, len))
                    .map_err(codec_to_transport)?;
                self.write_packet(&pkt).await?;
                self.send_ident = SendIdent::None;
                return Ok(());
            }
        }

        let account = self.props.get_string(PropKey::StateAccountId, "");
        if !account.is_empty() {
            let pkt = Packet::build(client_packet::ACCOUNT_ID, |w| {
                w.write_str(&account, defaults::MAX_ID_SIZE)
            })
            .map_err(codec_to_transport)?;
            self.write_packet(&pkt).await?;
        }
        let device = self.props.get_string(PropKey::StateDeviceId, "");
        if !device.is_empty() {
            let pkt = Packet::build(client_packet::DEVICE_ID, |w| {
                w.write_str(&device, defaults::MAX_ID_SIZE)
            })
            .map_err(codec_to_transport)?;
            self.write_packet(&pkt).await?;
        }
        self.send_ident = SendIdent::None;
        Ok(())
    }

    // ------------------------------------------------------------------
    // block construction

    /// Send the contents of one queue, marking entries sent as they go.
    /// Returns whether the queue still holds more sendable packets.
    async fn send_queue(
        &mut self,
        queue: Arc<PacketQueue>,
        max_priority: PacketPriority,
        mut max_events: i32,
    ) -> Result<bool, TransportError> {
        let max_priority = max_priority.max(PacketPriority::Low);
        if max_events == 0 {
            max_events = 1;
        }
        let mut idx = 0;
        loop {
            if max_events == 0 {
                break;
            }
            let pkt = match queue.get(idx) {
                Some(p) if p.priority <= max_priority => p,
                _ => break,
            };
            self.write_packet(&pkt).await?;
            queue.mark_sent(idx);
            idx += 1;
            if max_events > 0 {
                max_events -= 1;
            }
            if pkt.seq_len > 0 && pkt.sequence == SEQUENCE_ALL {
                // sequence anomaly, stop here
                break;
            }
        }
        let more = match queue.get(idx) {
            Some(p) => p.priority <= max_priority,
            None => false,
        };
        Ok(more)
    }

    /// Emit the end-of-block packet. Binary blocks get the Fletcher sum in
    /// place of the two reserved bytes; any speak-freely grant ends here.
    async fn send_eob(&mut self, has_more: bool) -> Result<(), TransportError> {
        if self.speak_freely {
            return Ok(());
        }
        let eob_type = if has_more {
            client_packet::EOB_MORE
        } else {
            client_packet::EOB_DONE
        };

        if self.first_encoding.encoding == Encoding::Binary {
            let pkt = Packet::build(eob_type, |w| w.write_zero(FLETCHER_CHECKSUM_LEN))
                .map_err(codec_to_transport)?;
            let mut frame = pkt.encode(PacketEncoding::BINARY).map_err(codec_to_transport)?;
            self.fletcher.update(&frame);
            let ck = self.fletcher.checksum();
            frame[3..3 + FLETCHER_CHECKSUM_LEN].copy_from_slice(&ck);
            self.write_raw(&frame, false).await?;
        } else {
            let pkt = Packet::empty(eob_type);
            let frame = pkt.encode(self.first_encoding).map_err(codec_to_transport)?;
            self.write_raw(&frame, false).await?;
        }
        self.speak_freely = false;
        self.speak_freely_max_events = -1;
        self.first_encoding = self.session_encoding;
        Ok(())
    }

    /// Send one block: identification, pending, volatile, then events up to
    /// the caps, closed out by EOB on duplex.
    async fn send_all_packets(
        &mut self,
        kind: TransportKind,
        brief: bool,
        dft_max_events: i32,
    ) -> Result<(), TransportError> {
        self.fletcher.reset();

        self.send_identification().await?;

        let mut has_more = false;
        if brief {
            has_more = self.has_data_to_send();
        } else {
            self.send_queue(Arc::clone(&self.pending_queue), PacketPriority::High, -1)
                .await?;
            self.send_queue(Arc::clone(&self.volatile_queue), PacketPriority::High, -1)
                .await?;
            // only clear once the whole backlog went out
            self.volatile_queue.reset();
            self.pending_queue.reset();

            let send_events = dft_max_events != 0;

            if self.speak_freely && send_events && self.event_queue.has_packets() {
                // relinquish so the server can acknowledge this block
                self.speak_freely = false;
                self.speak_freely_max_events = -1;
            }

            if send_events {
                let mut max_events: i32 = match kind {
                    TransportKind::Simplex => {
                        if self.is_primary {
                            self.props
                                .get_u32(
                                    PropKey::CommMaxSimplexEvents,
                                    defaults::DEFAULT_SIMPLEX_MAX_EVENTS,
                                )
                                .min(defaults::MAX_SIMPLEX_EVENTS)
                                as i32
                        } else if self.is_serial {
                            1
                        } else {
                            defaults::MAX_SIMPLEX_EVENTS as i32
                        }
                    }
                    TransportKind::Duplex => {
                        if self.is_primary {
                            self.props
                                .get_u32(
                                    PropKey::CommMaxDuplexEvents,
                                    defaults::DEFAULT_DUPLEX_MAX_EVENTS,
                                )
                                .min(defaults::MAX_DUPLEX_EVENTS)
                                as i32
                        } else if self.is_serial {
                            1
                        } else {
                            defaults::MAX_DUPLEX_EVENTS as i32
                        }
                    }
                    TransportKind::None => 8,
                };
                if dft_max_events > 0 && max_events > dft_max_events {
                    max_events = dft_max_events;
                }

                // a simplex session chosen for low-priority traffic must not
                // drain events that deserve an acknowledged duplex trip
                let max_priority = if self.is_serial
                    || kind == TransportKind::Duplex
                    || !self.accounting.supports_duplex()
                {
                    PacketPriority::High
                } else {
                    PacketPriority::Low
                };

                has_more = self
                    .send_queue(Arc::clone(&self.event_queue), max_priority, max_events)
                    .await?;
            } else {
                has_more = self.has_data_to_send();
            }
        }

        if kind == TransportKind::Duplex && !self.speak_freely {
            self.send_eob(has_more).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // acks

    fn acknowledge_to_sequence(&self, sequence: u32) -> bool {
        let acked = self.event_queue.acknowledge_to_sequence(sequence);
        if !acked {
            debug!("[{}] no packet with sequence 0x{:04X}", self.index, sequence);
        }
        acked
    }

    fn acknowledge_first(&self) -> bool {
        self.event_queue.acknowledge_first()
    }

    // ------------------------------------------------------------------
    // GPS diagnostics

    fn queue_gps_diagnostics(&self) {
        let Some(gps) = &self.gps else { return };
        let health = gps.health();
        if !health.fix_stale {
            return;
        }
        let now = unix_now();
        if now > health.last_sample_time + defaults::GPS_FAILURE_INTERVAL_SEC {
            // nothing heard from the receiver at all
            self.queue_error_payload(client_error::GPS_FAILURE, |w| {
                w.write_uint(health.last_sample_time, 4)
            });
        } else {
            self.queue_error_payload(client_error::GPS_EXPIRED, |w| {
                w.write_uint(health.last_valid_time, 4)
            });
        }
    }

    // ------------------------------------------------------------------
    // server packet handling

    fn parse_server_frame(&mut self, frame: &[u8]) -> Option<Packet> {
        if frame.first() == Some(&crate::codec::checksum::ASCII_ENCODING_CHAR) {
            info!(
                "Rx{}]{}",
                self.index,
                String::from_utf8_lossy(frame).trim_end()
            );
        } else {
            info!("Rx{}]0x{}", self.index, crate::codec::ascii::encode_hex(frame));
        }
        match Packet::parse(frame) {
            Ok(pkt) => Some(pkt),
            Err(PacketParseError::Checksum) => {
                self.queue_error(client_error::PACKET_CHECKSUM, 0);
                None
            }
            Err(PacketParseError::Length) => {
                self.queue_error(client_error::PACKET_LENGTH, 0);
                None
            }
            Err(PacketParseError::Header) => {
                self.queue_error(client_error::PACKET_HEADER, 0);
                None
            }
            Err(PacketParseError::CsvEncoding { packet_type })
            | Err(PacketParseError::Encoding { packet_type }) => {
                self.queue_error(client_error::PACKET_ENCODING, packet_type as u32);
                None
            }
        }
    }

    async fn handle_server_packet(&mut self, pkt: Packet) -> Result<LoopAction, TransportError> {
        if !pkt.packet_type.has_basic_header() {
            self.queue_error(client_error::PACKET_HEADER, pkt.packet_type.0 as u32);
            return Ok(LoopAction::Continue);
        }

        match pkt.packet_type {
            server_packet::EOB_DONE => {
                if self.is_serial {
                    self.transport.read_flush().await;
                }
                self.speak_freely = false;
                self.speak_freely_max_events = -1;
                let max_events = if pkt.payload.is_empty() {
                    -1
                } else {
                    pkt.reader().read_int(1)
                };
                let brief = self.speak_brief;
                self.send_all_packets(TransportKind::Duplex, brief, max_events)
                    .await?;
                self.speak_brief = false;
                Ok(LoopAction::Continue)
            }

            server_packet::EOB_SPEAK_FREELY => {
                self.speak_freely = true;
                self.speak_freely_max_events = if pkt.payload.is_empty() {
                    -1
                } else {
                    // 0 means speak freely but hold events; N caps each block
                    pkt.reader().read_int(1)
                };
                Ok(LoopAction::Continue)
            }

            server_packet::ACK => {
                if pkt.payload.is_empty() {
                    self.acknowledge_to_sequence(SEQUENCE_ALL);
                } else {
                    let sequence = pkt.reader().read_uint(4);
                    if !self.acknowledge_to_sequence(sequence) {
                        let seq_len = pkt.payload.len().min(4);
                        self.queue_error_payload(client_error::PACKET_ACK, |w| {
                            w.write_hex(pkt.packet_type.0 as u32, 2)?;
                            w.write_hex(sequence, seq_len)
                        });
                    }
                }
                Ok(LoopAction::Continue)
            }

            server_packet::GET_PROPERTY => {
                if pkt.payload.len() >= 2 {
                    let key = pkt.reader().read_uint(2) as u16;
                    self.answer_property_get(key);
                } else {
                    self.queue_error(client_error::PACKET_LENGTH, pkt.packet_type.0 as u32);
                }
                Ok(LoopAction::Continue)
            }

            server_packet::SET_PROPERTY => {
                if pkt.payload.len() >= 2 {
                    let mut r = pkt.reader();
                    let key = r.read_uint(2) as u16;
                    let value = r.read_bytes(pkt.payload.len() - 2);
                    self.apply_property_set(key, &value);
                } else {
                    self.queue_error(client_error::PACKET_LENGTH, pkt.packet_type.0 as u32);
                }
                Ok(LoopAction::Continue)
            }

            server_packet::FILE_UPLOAD => {
                // upload handling is a collaborator concern; without one the
                // packet type is unsupported
                self.queue_error(client_error::PACKET_TYPE, pkt.packet_type.0 as u32);
                Ok(LoopAction::Continue)
            }

            server_packet::ERROR => {
                if pkt.payload.len() >= 2 {
                    let mut r = pkt.reader();
                    let code = r.read_uint(2) as u16;
                    let faulting = r.read_uint(2) as u16;
                    let extra = r.read_bytes(pkt.payload.len().saturating_sub(4));
                    if self.handle_error_code(code, PacketType(faulting), &extra) {
                        Ok(LoopAction::Continue)
                    } else {
                        Ok(LoopAction::Close)
                    }
                } else {
                    self.queue_error(client_error::PACKET_LENGTH, pkt.packet_type.0 as u32);
                    Ok(LoopAction::Continue)
                }
            }

            server_packet::EOT => Ok(LoopAction::Close),

            _ => {
                self.queue_error(client_error::PACKET_TYPE, pkt.packet_type.0 as u32);
                Ok(LoopAction::Continue)
            }
        }
    }

    fn answer_property_get(&self, key: u16) {
        match self.props.get_wire(key) {
            Ok(value) => {
                let pkt = Packet::build(client_packet::PROPERTY_VALUE, |w| {
                    w.write_hex(key as u32, 2)?;
                    let len = value.len();
                    w.write_bytes(&value, len)
                });
                match pkt {
                    Ok(pkt) => {
                        self.queue_packet(pkt);
                    }
                    Err(e) => {
                        warn!("[{}] property value build failed: {}", self.index, e);
                        self.queue_error(client_error::PROPERTY_UNKNOWN_ERROR, key as u32);
                    }
                }
            }
            Err(PropError::InvalidKey) => {
                self.queue_error(client_error::PROPERTY_INVALID_ID, key as u32)
            }
            Err(PropError::WriteOnly) => {
                self.queue_error(client_error::PROPERTY_WRITE_ONLY, key as u32)
            }
            Err(PropError::InvalidValue) => {
                self.queue_error(client_error::PROPERTY_INVALID_VALUE, key as u32)
            }
            Err(PropError::ReadOnly) => {
                self.queue_error(client_error::PROPERTY_UNKNOWN_ERROR, key as u32)
            }
        }
    }

    fn apply_property_set(&self, key: u16, value: &[u8]) {
        match self.props.set_wire(key, value) {
            Ok(()) => {}
            Err(PropError::InvalidKey) => {
                self.queue_error(client_error::PROPERTY_INVALID_ID, key as u32)
            }
            Err(PropError::ReadOnly) => {
                self.queue_error(client_error::PROPERTY_READ_ONLY, key as u32)
            }
            Err(PropError::InvalidValue) => {
                self.queue_error(client_error::PROPERTY_INVALID_VALUE, key as u32)
            }
            Err(PropError::WriteOnly) => {
                self.queue_error(client_error::PROPERTY_UNKNOWN_ERROR, key as u32)
            }
        }
    }

    /// React to a server NAK. Returns false when the session must close.
    fn handle_error_code(&mut self, code: u16, faulting_type: PacketType, _extra: &[u8]) -> bool {
        let Some(err) = ServerError::from_code(code) else {
            // unknown NAKs are ignored
            return true;
        };
        match err {
            ServerError::Ok => true,

            ServerError::IdInvalid => {
                // the server does not know our unique id; fall back to
                // account/device identification
                self.send_ident = SendIdent::Account;
                true
            }

            ServerError::AccountError | ServerError::DeviceError => {
                self.severe_errors += 1;
                self.account_errors += 1;
                self.account_errors < defaults::ACCOUNT_ERROR_LIMIT
            }

            ServerError::AccountInvalid | ServerError::DeviceInvalid => {
                self.severe_errors += 1;
                self.account_errors += 1;
                self.account_errors < defaults::ACCOUNT_ERROR_LIMIT
            }

            ServerError::AccountInactive | ServerError::DeviceInactive => {
                self.severe_errors += 1;
                false
            }

            ServerError::ExcessiveConnections => {
                if self.is_primary {
                    self.props.add_u32(
                        PropKey::CommMinXmitRate,
                        defaults::EXCESSIVE_CONNECTIONS_PENALTY_SEC,
                    );
                    self.props.add_u32(
                        PropKey::CommMinXmitDelay,
                        defaults::EXCESSIVE_CONNECTIONS_PENALTY_SEC,
                    );
                }
                false
            }

            ServerError::PacketHeader | ServerError::PacketType => {
                // the server does not support something we sent; keep going
                true
            }

            ServerError::PacketLength | ServerError::PacketPayload | ServerError::ProtocolError => {
                self.severe_errors += 1;
                false
            }

            ServerError::PacketEncoding => self.handle_encoding_nak(faulting_type),

            ServerError::PacketChecksum | ServerError::BlockChecksum => {
                self.checksum_errors += 1;
                if self.checksum_errors >= defaults::CHECKSUM_ERROR_LIMIT {
                    self.severe_errors += 1;
                    false
                } else {
                    true
                }
            }

            ServerError::FormatDefinitionInvalid => {
                if self.is_primary {
                    self.props.set_bool(PropKey::CommCustomFormats, false);
                }
                self.severe_errors += 1;
                false
            }

            ServerError::FormatNotSupported => {
                // events already sent in a custom format are lost
                self.acknowledge_to_sequence(SEQUENCE_ALL);
                if self.is_primary {
                    self.props.set_bool(PropKey::CommCustomFormats, false);
                }
                true
            }

            ServerError::FormatNotRecognized => {
                match self.registry.lookup(faulting_type) {
                    Some(template) => match template.to_definition_packet() {
                        Ok(pkt) => {
                            self.queue_packet(pkt.with_priority(PacketPriority::High));
                            true
                        }
                        Err(_) => {
                            self.severe_errors += 1;
                            false
                        }
                    },
                    None => {
                        self.severe_errors += 1;
                        false
                    }
                }
            }

            ServerError::ExcessiveEvents => {
                // the next sent event will never be accepted
                self.acknowledge_first();
                if self.is_primary {
                    let in_motion = self.props.get_u32(PropKey::MotionInMotion, 0);
                    if in_motion > 0 {
                        self.props.set_u32(
                            PropKey::MotionInMotion,
                            in_motion + defaults::EXCESSIVE_EVENTS_IN_MOTION_PENALTY_SEC,
                        );
                    }
                    let dormant = self.props.get_u32(PropKey::MotionDormantInterval, 0);
                    if dormant > 0 {
                        self.props.set_u32(
                            PropKey::MotionDormantInterval,
                            dormant + defaults::EXCESSIVE_EVENTS_DORMANT_PENALTY_SEC,
                        );
                    }
                }
                true
            }

            ServerError::DuplicateEvent | ServerError::EventError => true,
        }
    }

    fn handle_encoding_nak(&mut self, faulting_type: PacketType) -> bool {
        if self.encoding_changed {
            return true;
        }
        self.encoding_changed = true;
        if self.session_encoding.encoding.mask() & ENCODING_REQUIRED_MASK != 0 {
            // we already use an encoding every server must support; this is
            // a compliance failure, not a negotiation
            self.severe_errors += 1;
            return false;
        }
        if self.is_primary {
            let encodings = self.props.get_u32(PropKey::CommEncodings, 0);
            let mask = (encodings & !self.session_encoding.encoding.mask()) | ENCODING_REQUIRED_MASK;
            self.props.set_u32(PropKey::CommEncodings, mask);
            self.session_encoding = self.supported_encoding(self.session_encoding);
        } else {
            self.session_encoding = self.supported_encoding(PacketEncoding::new(Encoding::Hex));
        }
        // the faulting packet is resent in the downgraded encoding
        self.first_encoding = self.session_encoding;
        if matches!(
            faulting_type,
            client_packet::UNIQUE_ID | client_packet::ACCOUNT_ID | client_packet::DEVICE_ID
        ) {
            self.send_ident = if self.is_serial {
                SendIdent::Account
            } else {
                SendIdent::Unique
            };
        }
        true
    }

    // ------------------------------------------------------------------
    // session loops

    /// Ask for a session. On the primary the transport kind comes from the
    /// priority/quota decision; secondaries always speak duplex. Returns
    /// whether a session was attempted.
    pub async fn transport_request(&mut self, encoding: PacketEncoding) -> bool {
        let kind = if self.is_primary {
            let decision = self.accounting.decision(self.event_queue.highest_priority());
            choose_transport(&decision)
        } else {
            TransportKind::Duplex
        };
        if kind == TransportKind::None {
            return false;
        }
        self.run_session(kind, encoding).await;
        true
    }

    /// Run one session of the given kind.
    pub async fn run_session(&mut self, kind: TransportKind, encoding: PacketEncoding) {
        let enc = self.supported_encoding(encoding);
        self.set_session_encoding(kind, enc);
        self.speak_freely = false;
        self.speak_freely_max_events = -1;
        match kind {
            TransportKind::Simplex => {
                self.run_simplex().await;
            }
            TransportKind::Duplex => {
                self.run_duplex().await;
            }
            TransportKind::None => {}
        }
    }

    async fn run_duplex(&mut self) -> bool {
        if !self.open(TransportKind::Duplex).await {
            let stale = self
                .last_duplex_error
                .map(|t| t.elapsed() >= defaults::DUPLEX_ERROR_LOG_INTERVAL)
                .unwrap_or(true);
            if stale {
                self.last_duplex_error = Some(Instant::now());
                info!("[{}] unable to open duplex transport", self.index);
            }
            return false;
        }
        info!("[{}] duplex start", self.index);

        self.queue_gps_diagnostics();

        self.speak_freely = false;
        self.speak_freely_max_events = -1;

        let speak_first;
        if self.is_primary {
            speak_first = self.props.get_bool(PropKey::CommSpeakFirst, true);
            self.speak_brief = self.props.get_bool(PropKey::CommFirstBrief, false);
        } else if self.is_serial {
            speak_first = false;
            self.speak_brief = true;
        } else {
            speak_first = true;
            self.speak_brief = false;
        }

        let mut ok = true;
        let mut first_pass = true;
        loop {
            if first_pass {
                first_pass = false;
                if speak_first {
                    let brief = self.speak_brief;
                    if self
                        .send_all_packets(TransportKind::Duplex, brief, -1)
                        .await
                        .is_err()
                    {
                        ok = false;
                        break;
                    }
                    self.speak_brief = false;
                }
            } else if self.speak_freely && self.has_data_to_send() {
                let max_events = self.speak_freely_max_events;
                if !self.threaded || self.relinquish_speak_freely.load(Ordering::Relaxed) {
                    // holding speak-freely would starve the outer loop in a
                    // cooperative build
                    self.speak_freely = false;
                    self.speak_freely_max_events = -1;
                }
                if self
                    .send_all_packets(TransportKind::Duplex, false, max_events)
                    .await
                    .is_err()
                {
                    ok = false;
                    break;
                }
            }

            match self.transport.read_packet().await {
                Err(e) => {
                    debug!("[{}] read error: {}", self.index, e);
                    ok = false;
                    break;
                }
                Ok(FrameEvent::Timeout) => {
                    if self.threaded && self.speak_freely {
                        continue;
                    }
                    if self.is_serial {
                        continue;
                    }
                    info!("[{}] duplex server read timeout", self.index);
                    ok = false;
                    break;
                }
                Ok(FrameEvent::Frame(frame)) => {
                    self.total_read_bytes = self.total_read_bytes.wrapping_add(frame.len() as u32);
                    self.session_read_bytes =
                        self.session_read_bytes.wrapping_add(frame.len() as u32);
                    if let Some(pkt) = self.parse_server_frame(&frame) {
                        match self.handle_server_packet(pkt).await {
                            Ok(LoopAction::Continue) => {}
                            Ok(LoopAction::Close) => break,
                            Err(_) => {
                                ok = false;
                                break;
                            }
                        }
                    }
                }
            }
        }

        self.close(TransportKind::Duplex, false).await;
        if self.is_primary {
            self.accounting.record_connection(TransportKind::Duplex);
        }
        info!("[{}] duplex end", self.index);
        ok
    }

    async fn run_simplex(&mut self) -> bool {
        if !self.is_primary {
            return false;
        }
        if !self.open(TransportKind::Simplex).await {
            return false;
        }

        self.queue_gps_diagnostics();

        if self
            .send_all_packets(TransportKind::Simplex, false, -1)
            .await
            .is_err()
        {
            self.close(TransportKind::Simplex, false).await;
            return false;
        }

        // data leaves at close time; only then may sent events be dropped,
        // and no acknowledgement will ever arrive through the NAT
        if self.close(TransportKind::Simplex, true).await {
            self.pending_queue.reset();
            self.acknowledge_to_sequence(SEQUENCE_ALL);
            self.accounting.record_connection(TransportKind::Simplex);
            true
        } else {
            false
        }
    }

    // ------------------------------------------------------------------
    // worker mode

    /// Spawn this session on its own task. External code requests sessions
    /// through the returned handle; only the worker touches the transport.
    pub fn spawn(mut self) -> ProtocolHandle
    where
        T: 'static,
    {
        self.threaded = true;
        let request: Arc<Mutex<Option<PacketEncoding>>> = Arc::new(Mutex::new(None));
        let notify = Arc::new(Notify::new());
        let running = Arc::new(AtomicBool::new(true));

        let handle = ProtocolHandle {
            request: Arc::clone(&request),
            notify: Arc::clone(&notify),
            running: Arc::clone(&running),
            relinquish: Arc::clone(&self.relinquish_speak_freely),
            event_queue: self.event_queue(),
            pending_queue: Arc::clone(&self.pending_queue),
            volatile_queue: Arc::clone(&self.volatile_queue),
            session_encoding: self.session_encoding,
        };

        WORKER_STOPS
            .lock()
            .push((Arc::clone(&running), Arc::clone(&notify)));

        let is_serial = self.is_serial;
        tokio::spawn(async move {
            while running.load(Ordering::Relaxed) {
                let encoding = if is_serial {
                    // serial media hold a standing session request
                    Some(self.session_encoding)
                } else {
                    loop {
                        if let Some(enc) = request.lock().take() {
                            break Some(enc);
                        }
                        notify.notified().await;
                        if !running.load(Ordering::Relaxed) {
                            break None;
                        }
                    }
                };
                let Some(encoding) = encoding else { break };
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                self.transport_request(encoding).await;
                tokio::time::sleep(defaults::SESSION_RETRY_DELAY).await;
            }
            debug!("protocol worker [{}] stopped", self.index);
        });

        handle
    }
}

fn codec_to_transport(e: CodecError) -> TransportError {
    TransportError::Failed(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        e.to_string(),
    ))
}

fn queue_packet_to(pending: &PacketQueue, volatile: &PacketQueue, packet: Packet) -> bool {
    if packet.priority >= PacketPriority::High {
        pending.add(packet).is_ok()
    } else {
        volatile.add(packet).is_ok()
    }
}

// ----------------------------------------------------------------------------

/// Handle to a spawned protocol worker.
pub struct ProtocolHandle {
    request: Arc<Mutex<Option<PacketEncoding>>>,
    notify: Arc<Notify>,
    running: Arc<AtomicBool>,
    relinquish: Arc<AtomicBool>,
    event_queue: Arc<PacketQueue>,
    pending_queue: Arc<PacketQueue>,
    volatile_queue: Arc<PacketQueue>,
    session_encoding: PacketEncoding,
}

impl ProtocolHandle {
    /// Request a session with the given encoding (no-op while a request is
    /// already pending).
    pub fn request_transport(&self, encoding: PacketEncoding) {
        let mut slot = self.request.lock();
        if slot.is_none() {
            *slot = Some(encoding);
            self.notify.notify_one();
        }
    }

    /// Request a session with the worker's default encoding.
    pub fn request_default_transport(&self) {
        self.request_transport(self.session_encoding);
    }

    /// Whether the worker honors speak-freely grants or always relinquishes.
    pub fn set_relinquish_speak_freely(&self, relinquish: bool) {
        self.relinquish.store(relinquish, Ordering::Relaxed);
    }

    pub fn event_queue(&self) -> Arc<PacketQueue> {
        Arc::clone(&self.event_queue)
    }

    /// Queue a packet by priority, as the session itself would.
    pub fn queue_packet(&self, packet: Packet) -> bool {
        queue_packet_to(&self.pending_queue, &self.volatile_queue, packet)
    }

    /// Stop the worker after its current session.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.notify.notify_one();
    }
}

// ----------------------------------------------------------------------------
