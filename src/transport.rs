//! # Transport Layer
//!
//! The protocol engine drives transports through one narrow interface:
//! open, close, framed read, framed write, flush, open-check, plus a media
//! tag. Implementations here cover TCP (duplex), UDP (simplex, buffered
//! until close), and append-to-file. Serial/Bluetooth media live outside
//! this crate; the `Serial` media tag exists so sessions can apply their
//! special handling when such a transport is plugged in.
//!
//! ## Framing
//!
//! A read returns exactly one packet frame: either a binary
//! `0xE0 <type> <len> <payload>` packet or one ASCII `$...\r` line. The
//! header is read first (3 bytes serve both forms), then the remainder by
//! form.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;

use crate::errors::TransportError;
use crate::packet::{ASCII_EOL, MAX_ENCODED_LEN, PACKET_HEADER_BYTE};

/// Session kind being opened over a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    None,
    Simplex,
    Duplex,
}

/// Physical medium tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMedia {
    Serial,
    Socket,
    File,
    Gprs,
}

/// Outcome of a framed read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// One complete packet frame.
    Frame(Vec<u8>),
    /// Nothing arrived within the transport's read timeout.
    Timeout,
}

/// Client-side transport interface, one method per operation.
#[async_trait]
pub trait Transport: Send {
    fn media(&self) -> TransportMedia;
    fn is_open(&self) -> bool;
    async fn open(&mut self, kind: TransportKind) -> Result<(), TransportError>;
    /// `send_pending` flushes buffered simplex data before closing.
    async fn close(&mut self, send_pending: bool) -> Result<(), TransportError>;
    async fn read_packet(&mut self) -> Result<FrameEvent, TransportError>;
    async fn write_packet(&mut self, frame: &[u8]) -> Result<usize, TransportError>;
    async fn read_flush(&mut self);
}

// ----------------------------------------------------------------------------
// framing

/// Read one packet frame from a stream. A timeout before the first header
/// byte is a [`FrameEvent::Timeout`]; a timeout or EOF mid-frame is a
/// transport error, since the remainder of the stream can no longer be
/// trusted.
pub async fn read_frame<S>(
    stream: &mut S,
    read_timeout: Duration,
) -> Result<FrameEvent, TransportError>
where
    S: AsyncRead + Unpin + Send,
{
    let mut header = [0u8; 3];
    match timeout(read_timeout, stream.read_exact(&mut header)).await {
        Err(_) => return Ok(FrameEvent::Timeout),
        Ok(Err(e)) => return Err(TransportError::Failed(e)),
        Ok(Ok(_)) => {}
    }

    let mut frame = header.to_vec();
    if header[0] == crate::codec::checksum::ASCII_ENCODING_CHAR {
        // ASCII line: read up to the terminator
        loop {
            if frame.len() >= MAX_ENCODED_LEN {
                return Err(TransportError::Failed(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "ASCII packet overflow",
                )));
            }
            let mut byte = [0u8; 1];
            match timeout(read_timeout, stream.read_exact(&mut byte)).await {
                Err(_) => {
                    return Err(TransportError::Failed(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "timeout inside ASCII packet",
                    )))
                }
                Ok(Err(e)) => return Err(TransportError::Failed(e)),
                Ok(Ok(_)) => {}
            }
            frame.push(byte[0]);
            if byte[0] == ASCII_EOL {
                break;
            }
        }
    } else if header[0] == PACKET_HEADER_BYTE && header[2] > 0 {
        let payload_len = header[2] as usize;
        frame.resize(3 + payload_len, 0);
        match timeout(read_timeout, stream.read_exact(&mut frame[3..])).await {
            Err(_) => {
                return Err(TransportError::Failed(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "timeout inside binary packet",
                )))
            }
            Ok(Err(e)) => return Err(TransportError::Failed(e)),
            Ok(Ok(_)) => {}
        }
    }
    Ok(FrameEvent::Frame(frame))
}

// ----------------------------------------------------------------------------
// TCP (duplex)

/// TCP client transport; each `open` dials a fresh duplex connection.
pub struct TcpTransport {
    addr: String,
    read_timeout: Duration,
    buffer_size: usize,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            read_timeout: crate::defaults::DUPLEX_READ_TIMEOUT,
            buffer_size: 8192,
            stream: None,
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn media(&self) -> TransportMedia {
        TransportMedia::Socket
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn open(&mut self, kind: TransportKind) -> Result<(), TransportError> {
        if kind != TransportKind::Duplex {
            return Err(TransportError::Failed(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "TCP transport is duplex-only",
            )));
        }
        debug!("opening duplex connection to {}", self.addr);
        let stream = TcpStream::connect(&self.addr).await?;

        // tune for small interactive packets
        let std_stream = stream.into_std()?;
        let socket = socket2::Socket::from(std_stream.try_clone()?);
        socket.set_nodelay(true)?;
        socket.set_recv_buffer_size(self.buffer_size)?;
        socket.set_send_buffer_size(self.buffer_size)?;

        self.stream = Some(TcpStream::from_std(std_stream)?);
        Ok(())
    }

    async fn close(&mut self, _send_pending: bool) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    async fn read_packet(&mut self) -> Result<FrameEvent, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        read_frame(stream, self.read_timeout).await
    }

    async fn write_packet(&mut self, frame: &[u8]) -> Result<usize, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        stream.write_all(frame).await?;
        stream.flush().await?;
        Ok(frame.len())
    }

    async fn read_flush(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            let mut scratch = [0u8; 256];
            while let Ok(Ok(n)) =
                timeout(Duration::from_millis(10), stream.read(&mut scratch)).await
            {
                if n == 0 {
                    break;
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// UDP (simplex)

/// UDP client transport. Packets written during the session are buffered
/// and leave as one datagram when the session closes with `send_pending`;
/// nothing is ever read back (NAT'd devices cannot receive the reply).
pub struct UdpTransport {
    addr: String,
    socket: Option<UdpSocket>,
    pending: Vec<u8>,
}

impl UdpTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            socket: None,
            pending: Vec::new(),
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn media(&self) -> TransportMedia {
        TransportMedia::Socket
    }

    fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    async fn open(&mut self, kind: TransportKind) -> Result<(), TransportError> {
        if kind != TransportKind::Simplex {
            return Err(TransportError::Failed(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "UDP transport is simplex-only",
            )));
        }
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(&self.addr).await?;
        self.socket = Some(socket);
        self.pending.clear();
        Ok(())
    }

    async fn close(&mut self, send_pending: bool) -> Result<(), TransportError> {
        let socket = self.socket.take();
        if send_pending && !self.pending.is_empty() {
            let socket = socket.ok_or(TransportError::NotOpen)?;
            socket.send(&self.pending).await?;
        }
        self.pending.clear();
        Ok(())
    }

    async fn read_packet(&mut self) -> Result<FrameEvent, TransportError> {
        Ok(FrameEvent::Timeout)
    }

    async fn write_packet(&mut self, frame: &[u8]) -> Result<usize, TransportError> {
        if self.socket.is_none() {
            return Err(TransportError::NotOpen);
        }
        self.pending.extend_from_slice(frame);
        Ok(frame.len())
    }

    async fn read_flush(&mut self) {}
}

// ----------------------------------------------------------------------------
// file

/// Append-to-file transport, useful as a secondary protocol target and for
/// offline capture.
pub struct FileTransport {
    path: std::path::PathBuf,
    file: Option<tokio::fs::File>,
}

impl FileTransport {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }
}

#[async_trait]
impl Transport for FileTransport {
    fn media(&self) -> TransportMedia {
        TransportMedia::File
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    async fn open(&mut self, _kind: TransportKind) -> Result<(), TransportError> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        self.file = Some(file);
        Ok(())
    }

    async fn close(&mut self, _send_pending: bool) -> Result<(), TransportError> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        Ok(())
    }

    async fn read_packet(&mut self) -> Result<FrameEvent, TransportError> {
        Ok(FrameEvent::Timeout)
    }

    async fn write_packet(&mut self, frame: &[u8]) -> Result<usize, TransportError> {
        let file = self.file.as_mut().ok_or(TransportError::NotOpen)?;
        file.write_all(frame).await?;
        Ok(frame.len())
    }

    async fn read_flush(&mut self) {}
}

// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_frame_binary() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client.write_all(&[0xE0, 0x30, 0x02, 0xAA, 0xBB]).await.unwrap();
        let frame = read_frame(&mut server, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(frame, FrameEvent::Frame(vec![0xE0, 0x30, 0x02, 0xAA, 0xBB]));
    }

    #[tokio::test]
    async fn test_read_frame_binary_empty_payload() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client.write_all(&[0xE0, 0xB0, 0x00]).await.unwrap();
        let frame = read_frame(&mut server, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(frame, FrameEvent::Frame(vec![0xE0, 0xB0, 0x00]));
    }

    #[tokio::test]
    async fn test_read_frame_ascii() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client.write_all(b"$E0B0\rjunk-after").await.unwrap();
        let frame = read_frame(&mut server, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(frame, FrameEvent::Frame(b"$E0B0\r".to_vec()));
    }

    #[tokio::test]
    async fn test_read_frame_timeout() {
        let (_client, mut server) = tokio::io::duplex(256);
        let frame = read_frame(&mut server, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(frame, FrameEvent::Timeout);
    }

    #[tokio::test]
    async fn test_read_frame_eof_is_error() {
        let (client, mut server) = tokio::io::duplex(256);
        drop(client);
        assert!(read_frame(&mut server, Duration::from_millis(20))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_udp_transport_buffers_until_close() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = receiver.local_addr().unwrap();

        let mut t = UdpTransport::new(addr.to_string());
        t.open(TransportKind::Simplex).await.unwrap();
        t.write_packet(b"one").await.unwrap();
        t.write_packet(b"two").await.unwrap();
        t.close(true).await.unwrap();

        let mut buf = [0u8; 64];
        let n = receiver.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"onetwo");
    }

    #[tokio::test]
    async fn test_file_transport_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.dmtp");
        let mut t = FileTransport::new(&path);
        t.open(TransportKind::Simplex).await.unwrap();
        t.write_packet(b"$E0B0\r").await.unwrap();
        t.close(false).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"$E0B0\r");
    }
}
