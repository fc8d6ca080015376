//! Shared fixtures for the integration tests: an in-memory duplex transport
//! for driving a real client session against a scripted or real server, and
//! small builders for events and sessions.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opendmtp::accounting::ConnectionAccounting;
use opendmtp::codec::GpsPoint;
use opendmtp::errors::TransportError;
use opendmtp::event::{encode_event, EventTemplate, TemplateRegistry};
use opendmtp::packet::Packet;
use opendmtp::props::PropertyStore;
use opendmtp::session::ClientSession;
use opendmtp::transport::{read_frame, FrameEvent, Transport, TransportKind, TransportMedia};
use opendmtp::Event;
use tokio::io::{AsyncWriteExt, DuplexStream};

/// A duplex-stream transport: the "network" is a tokio in-memory pipe whose
/// far end the test script holds.
pub struct StreamTransport {
    pending: Option<DuplexStream>,
    active: Option<DuplexStream>,
    read_timeout: Duration,
}

impl StreamTransport {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            pending: Some(stream),
            active: None,
            read_timeout: Duration::from_secs(2),
        }
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn media(&self) -> TransportMedia {
        TransportMedia::Socket
    }

    fn is_open(&self) -> bool {
        self.active.is_some()
    }

    async fn open(&mut self, _kind: TransportKind) -> Result<(), TransportError> {
        match self.pending.take() {
            Some(stream) => {
                self.active = Some(stream);
                Ok(())
            }
            None => Err(TransportError::NotOpen),
        }
    }

    async fn close(&mut self, _send_pending: bool) -> Result<(), TransportError> {
        self.active = None;
        Ok(())
    }

    async fn read_packet(&mut self) -> Result<FrameEvent, TransportError> {
        let stream = self.active.as_mut().ok_or(TransportError::NotOpen)?;
        read_frame(stream, self.read_timeout).await
    }

    async fn write_packet(&mut self, frame: &[u8]) -> Result<usize, TransportError> {
        let stream = self.active.as_mut().ok_or(TransportError::NotOpen)?;
        stream.write_all(frame).await.map_err(TransportError::Failed)?;
        Ok(frame.len())
    }

    async fn read_flush(&mut self) {}
}

/// A primary client session wired to one end of a duplex pipe, plus its
/// property store.
pub fn primary_client(
    stream: DuplexStream,
) -> (ClientSession<StreamTransport>, Arc<PropertyStore>) {
    let props = Arc::new(PropertyStore::new());
    let accounting = Arc::new(ConnectionAccounting::new(Arc::clone(&props), true, true));
    let registry = Arc::new(TemplateRegistry::new());
    let session = ClientSession::new(
        0,
        StreamTransport::new(stream),
        Arc::clone(&props),
        accounting,
        registry,
    );
    (session, props)
}

/// A standard-resolution event packet with the given sequence.
pub fn event_packet(sequence: u32) -> Packet {
    let mut ev = Event::default();
    ev.status_code = 0xF020;
    ev.timestamp[0] = 1_200_000_000 + sequence;
    ev.gps_point[0] = GpsPoint::new(39.1234, -142.5678);
    ev.speed_kph = 45.0;
    ev.heading = 90.0;
    ev.altitude = 1200.0;
    ev.distance_km = 10.0;
    ev.sequence = sequence;
    encode_event(&ev, &EventTemplate::fixed_standard()).unwrap()
}

/// Read one parsed packet from the scripted side, panicking on timeout.
pub async fn read_packet(stream: &mut DuplexStream) -> Packet {
    match read_frame(stream, Duration::from_secs(2)).await.unwrap() {
        FrameEvent::Frame(frame) => Packet::parse(&frame).unwrap(),
        FrameEvent::Timeout => panic!("expected a packet from the peer"),
    }
}

/// Write a packet to the scripted side in binary encoding.
pub async fn write_packet(stream: &mut DuplexStream, pkt: &Packet) {
    let frame = pkt.encode(opendmtp::PacketEncoding::BINARY).unwrap();
    stream.write_all(&frame).await.unwrap();
}

/// Read one raw frame from the scripted side (CSV frames cannot be parsed,
/// so scripts sometimes need the bytes themselves).
pub async fn read_raw(stream: &mut DuplexStream) -> Vec<u8> {
    match read_frame(stream, Duration::from_secs(2)).await.unwrap() {
        FrameEvent::Frame(frame) => frame,
        FrameEvent::Timeout => panic!("expected a frame from the peer"),
    }
}

/// Packet type tag of a raw frame, for scripts that only route on it.
pub fn frame_type(frame: &[u8]) -> u16 {
    if frame[0] == b'$' {
        u16::from_str_radix(std::str::from_utf8(&frame[1..5]).unwrap(), 16).unwrap()
    } else {
        ((frame[0] as u16) << 8) | frame[1] as u16
    }
}
