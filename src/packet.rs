//! # Packet Codec
//!
//! Assembly, encoding, and parsing of single DMTP packets. A packet is a
//! 2-byte header type, up to 255 payload bytes, and bookkeeping used by the
//! queues and the session layer (priority, sequence, sent flag). Four wire
//! encodings exist: binary, base64, hex, and CSV (encode-only).
//!
//! ## Wire grammar
//!
//! ```text
//! binary:  0xE0 <type> <len> <len bytes>
//! ascii:   '$' <4 hex header> [<enc-char> <payload>] ['*' <2 hex xor>] '\r'
//! ```
//!
//! The encoding marker is `:` for base64, `|` for hex, and `,` for CSV.

use crate::codec::checksum::{ASCII_ENCODING_CHAR, CHECKSUM_SEPARATOR};
use crate::codec::{ascii, parse_format, FieldKind, PayloadReader, PayloadWriter};
use crate::errors::{CodecError, PacketParseError};

/// First byte of the binary packet header.
pub const PACKET_HEADER_BYTE: u8 = 0xE0;
/// ASCII packet line terminator.
pub const ASCII_EOL: u8 = b'\r';
/// Maximum payload length of a single packet.
pub const MAX_PAYLOAD_LEN: usize = 255;
/// A comfortable upper bound for any single encoded packet.
pub const MAX_ENCODED_LEN: usize = 600;

pub const ENCODING_BASE64_CHAR: u8 = b':';
pub const ENCODING_HEX_CHAR: u8 = b'|';
pub const ENCODING_CSV_CHAR: u8 = b',';

/// Sequence sentinel meaning "all sent packets".
pub const SEQUENCE_ALL: u32 = 0xFFFF_FFFF;

/// Mask a sequence number down to its encoded byte length.
pub fn sequence_mask(seq_len: u8) -> u32 {
    if seq_len == 0 || seq_len >= 4 {
        u32::MAX
    } else {
        (1u32 << (seq_len * 8)) - 1
    }
}

// ----------------------------------------------------------------------------
// Packet types

/// A 2-byte packet header type (`0xE0` header byte plus the type byte).
/// Client and server types share the value space; the session direction
/// decides the namespace, as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketType(pub u16);

impl PacketType {
    pub fn from_type_byte(tt: u8) -> Self {
        PacketType(((PACKET_HEADER_BYTE as u16) << 8) | tt as u16)
    }

    pub fn type_byte(self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    pub fn header_byte(self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// True when the header byte is the standard `0xE0`.
    pub fn has_basic_header(self) -> bool {
        self.header_byte() == PACKET_HEADER_BYTE
    }

    /// True for any of the three event packet ranges.
    pub fn is_event(self) -> bool {
        let tt = self.type_byte();
        self.has_basic_header()
            && ((0x30..=0x3F).contains(&tt)
                || (0x50..=0x5F).contains(&tt)
                || (0x70..=0x7F).contains(&tt))
    }

    /// True for the custom event range, the only range templates may be
    /// registered in.
    pub fn is_custom_event(self) -> bool {
        self.has_basic_header() && (0x70..=0x7F).contains(&self.type_byte())
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// Client-originated packet types.
pub mod client_packet {
    use super::PacketType;

    pub const UNIQUE_ID: PacketType = PacketType(0xE001);
    pub const ACCOUNT_ID: PacketType = PacketType(0xE002);
    pub const DEVICE_ID: PacketType = PacketType(0xE003);

    pub const FIXED_FMT_STD: PacketType = PacketType(0xE030);
    pub const FIXED_FMT_HIGH: PacketType = PacketType(0xE031);

    pub const EOB_DONE: PacketType = PacketType(0xE0B0);
    pub const EOB_MORE: PacketType = PacketType(0xE0B1);
    pub const PROPERTY_VALUE: PacketType = PacketType(0xE0B2);
    pub const FORMAT_DEF: PacketType = PacketType(0xE0B3);
    pub const DIAGNOSTIC: PacketType = PacketType(0xE0B4);
    pub const ERROR: PacketType = PacketType(0xE0B5);
}

/// Server-originated packet types.
pub mod server_packet {
    use super::PacketType;

    pub const EOB_DONE: PacketType = PacketType(0xE000);
    pub const EOB_SPEAK_FREELY: PacketType = PacketType(0xE001);
    pub const ACK: PacketType = PacketType(0xE0A0);
    pub const GET_PROPERTY: PacketType = PacketType(0xE0B0);
    pub const SET_PROPERTY: PacketType = PacketType(0xE0B1);
    pub const FILE_UPLOAD: PacketType = PacketType(0xE0C0);
    pub const ERROR: PacketType = PacketType(0xE0E0);
    pub const EOT: PacketType = PacketType(0xE0FF);
}

// ----------------------------------------------------------------------------
// Priority / encoding

/// Packet priority, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum PacketPriority {
    #[default]
    None,
    Low,
    Normal,
    High,
}

/// Base wire encoding. The numeric values are the bit positions of the
/// supported-encodings property bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Encoding {
    Binary = 0,
    Base64 = 1,
    Hex = 2,
    Csv = 3,
}

impl Encoding {
    pub fn mask(self) -> u32 {
        1 << (self as u8)
    }
}

/// Encodings every server is required to support (everything except CSV).
pub const ENCODING_REQUIRED_MASK: u32 = 0b0111;

/// An encoding selection: the base form plus whether ASCII packets carry the
/// trailing XOR checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketEncoding {
    pub encoding: Encoding,
    pub checksum: bool,
}

impl PacketEncoding {
    pub const BINARY: PacketEncoding = PacketEncoding {
        encoding: Encoding::Binary,
        checksum: false,
    };

    pub fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            checksum: false,
        }
    }

    pub fn with_checksum(encoding: Encoding) -> Self {
        Self {
            encoding,
            checksum: true,
        }
    }

    /// Same checksum flag, different base encoding.
    pub fn rebased(self, encoding: Encoding) -> Self {
        Self { encoding, ..self }
    }
}

// ----------------------------------------------------------------------------
// Packet

/// A single protocol packet plus its queue bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    pub packet_type: PacketType,
    pub payload: Vec<u8>,
    /// Format descriptor recorded while the payload was built; empty for
    /// parsed packets. Drives CSV encoding.
    pub format: String,
    pub priority: PacketPriority,
    pub sequence: u32,
    pub seq_len: u8,
    pub sent: bool,
}

impl Default for PacketType {
    fn default() -> Self {
        PacketType(0)
    }
}

impl Packet {
    /// A packet with an empty payload.
    pub fn empty(packet_type: PacketType) -> Self {
        Packet {
            packet_type,
            priority: PacketPriority::Normal,
            ..Default::default()
        }
    }

    /// Build a packet payload through a writer closure. Any field error
    /// discards the whole payload; no partially-built packet escapes.
    pub fn build<F>(packet_type: PacketType, f: F) -> Result<Self, CodecError>
    where
        F: FnOnce(&mut PayloadWriter) -> Result<(), CodecError>,
    {
        let mut writer = PayloadWriter::new(MAX_PAYLOAD_LEN);
        f(&mut writer)?;
        let (payload, format) = writer.finish();
        Ok(Packet {
            packet_type,
            payload,
            format,
            priority: PacketPriority::Normal,
            ..Default::default()
        })
    }

    pub fn with_priority(mut self, priority: PacketPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn reader(&self) -> PayloadReader<'_> {
        PayloadReader::new(&self.payload)
    }

    // ------------------------------------------------------------------
    // encode

    /// Encode for the wire. CSV falls back to hex when no format descriptor
    /// was captured.
    pub fn encode(&self, enc: PacketEncoding) -> Result<Vec<u8>, CodecError> {
        if enc.encoding == Encoding::Binary {
            let mut out = Vec::with_capacity(3 + self.payload.len());
            out.push(PACKET_HEADER_BYTE);
            out.push(self.packet_type.type_byte());
            out.push(self.payload.len() as u8);
            out.extend_from_slice(&self.payload);
            return Ok(out);
        }

        let mut line = String::with_capacity(MAX_ENCODED_LEN);
        line.push(ASCII_ENCODING_CHAR as char);
        line.push_str(&format!("{:04X}", self.packet_type.0));
        match enc.encoding {
            Encoding::Csv if !self.format.is_empty() => self.encode_csv_fields(&mut line)?,
            Encoding::Csv | Encoding::Hex => {
                if !self.payload.is_empty() {
                    line.push(ENCODING_HEX_CHAR as char);
                    line.push_str(&ascii::encode_hex(&self.payload));
                }
            }
            Encoding::Base64 => {
                if !self.payload.is_empty() {
                    line.push(ENCODING_BASE64_CHAR as char);
                    line.push_str(&ascii::encode_base64(&self.payload));
                }
            }
            Encoding::Binary => unreachable!(),
        }
        if enc.checksum {
            let (ck, _) = crate::codec::checksum::calc_xor(line.as_bytes());
            line.push(CHECKSUM_SEPARATOR as char);
            line.push_str(&format!("{:02X}", ck));
        }
        line.push(ASCII_EOL as char);
        Ok(line.into_bytes())
    }

    /// Re-render the payload one field per directive, comma-prefixed.
    fn encode_csv_fields(&self, line: &mut String) -> Result<(), CodecError> {
        let specs = parse_format(&self.format)?;
        let mut reader = self.reader();
        for spec in specs {
            if spec.len > reader.remaining() {
                return Err(CodecError::Overflow {
                    need: spec.len,
                    have: reader.remaining(),
                });
            }
            match spec.kind {
                FieldKind::Int => {
                    line.push(ENCODING_CSV_CHAR as char);
                    line.push_str(&reader.read_int(spec.len).to_string());
                }
                FieldKind::UInt => {
                    line.push(ENCODING_CSV_CHAR as char);
                    line.push_str(&reader.read_uint(spec.len).to_string());
                }
                FieldKind::Hex => {
                    line.push(ENCODING_CSV_CHAR as char);
                    line.push_str(&format!(
                        "0x{:0width$X}",
                        reader.read_uint(spec.len),
                        width = spec.len * 2
                    ));
                }
                FieldKind::Str | FieldKind::PadStr => {
                    let s = reader.read_str(spec.len);
                    line.push(ENCODING_CSV_CHAR as char);
                    line.push_str(s.trim_end());
                }
                FieldKind::Bytes => {
                    let data = reader.read_bytes(spec.len);
                    line.push(ENCODING_CSV_CHAR as char);
                    line.push_str("0x");
                    line.push_str(&ascii::encode_hex(&data));
                }
                FieldKind::Gps => {
                    let point = reader.read_gps(spec.len);
                    let decimals = if spec.len >= 8 { 6 } else { 4 };
                    line.push(ENCODING_CSV_CHAR as char);
                    line.push_str(&format!("{:.*}", decimals, point.latitude));
                    line.push(ENCODING_CSV_CHAR as char);
                    line.push_str(&format!("{:.*}", decimals, point.longitude));
                }
                FieldKind::Zero => reader.skip(spec.len),
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // parse

    /// Parse a single received frame (one binary packet, or one ASCII line
    /// with or without its trailing `\r`). CSV payloads are rejected:
    /// decoding them is deliberately unsupported.
    pub fn parse(frame: &[u8]) -> Result<Packet, PacketParseError> {
        if frame.is_empty() {
            return Err(PacketParseError::Length);
        }
        if frame[0] == ASCII_ENCODING_CHAR {
            Self::parse_ascii(frame)
        } else if frame[0] == PACKET_HEADER_BYTE {
            Self::parse_binary(frame)
        } else {
            Err(PacketParseError::Header)
        }
    }

    fn parse_ascii(frame: &[u8]) -> Result<Packet, PacketParseError> {
        let line = if frame.last() == Some(&ASCII_EOL) {
            &frame[..frame.len() - 1]
        } else {
            frame
        };
        if !crate::codec::checksum::is_valid_xor(line) {
            return Err(PacketParseError::Checksum);
        }
        let (_, body_end) = crate::codec::checksum::calc_xor(line);
        if body_end < 5 {
            return Err(PacketParseError::Length);
        }
        let header = ascii::decode_hex(&line[1..5]);
        if header.len() != 2 {
            return Err(PacketParseError::Header);
        }
        let packet_type = PacketType(((header[0] as u16) << 8) | header[1] as u16);
        let mut payload = Vec::new();
        if body_end > 6 {
            let data = &line[6..body_end];
            match line[5] {
                ENCODING_BASE64_CHAR => payload = ascii::decode_base64(data),
                ENCODING_HEX_CHAR => payload = ascii::decode_hex(data),
                ENCODING_CSV_CHAR => {
                    return Err(PacketParseError::CsvEncoding {
                        packet_type: packet_type.0,
                    })
                }
                _ => {
                    return Err(PacketParseError::Encoding {
                        packet_type: packet_type.0,
                    })
                }
            }
            if payload.len() > MAX_PAYLOAD_LEN {
                payload.truncate(MAX_PAYLOAD_LEN);
            }
        }
        Ok(Packet {
            packet_type,
            payload,
            priority: PacketPriority::Normal,
            ..Default::default()
        })
    }

    fn parse_binary(frame: &[u8]) -> Result<Packet, PacketParseError> {
        if frame.len() < 3 {
            return Err(PacketParseError::Length);
        }
        let packet_type = PacketType(((frame[0] as u16) << 8) | frame[1] as u16);
        let len = frame[2] as usize;
        if frame.len() < 3 + len {
            return Err(PacketParseError::Length);
        }
        Ok(Packet {
            packet_type,
            payload: frame[3..3 + len].to_vec(),
            priority: PacketPriority::Normal,
            ..Default::default()
        })
    }
}

// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::GpsPoint;

    fn sample_packet() -> Packet {
        Packet::build(client_packet::FIXED_FMT_STD, |w| {
            w.write_hex(0xF020, 2)?;
            w.write_uint(1_200_000_000, 4)?;
            w.write_gps(&GpsPoint::new(39.1234, -142.5678), 6)?;
            w.write_uint(45, 1)?;
            w.write_hex(0x12, 1)
        })
        .unwrap()
    }

    #[test]
    fn test_binary_round_trip() {
        let pkt = sample_packet();
        let wire = pkt.encode(PacketEncoding::BINARY).unwrap();
        assert_eq!(wire[0], PACKET_HEADER_BYTE);
        assert_eq!(wire[1], 0x30);
        assert_eq!(wire[2] as usize, pkt.payload.len());
        let parsed = Packet::parse(&wire).unwrap();
        assert_eq!(parsed.packet_type, pkt.packet_type);
        assert_eq!(parsed.payload, pkt.payload);
    }

    #[test]
    fn test_hex_round_trip() {
        let pkt = sample_packet();
        let wire = pkt
            .encode(PacketEncoding::with_checksum(Encoding::Hex))
            .unwrap();
        assert_eq!(wire[0], b'$');
        assert_eq!(&wire[1..5], b"E030");
        assert_eq!(wire[5], ENCODING_HEX_CHAR);
        assert_eq!(*wire.last().unwrap(), ASCII_EOL);
        let parsed = Packet::parse(&wire).unwrap();
        assert_eq!(parsed.packet_type, pkt.packet_type);
        assert_eq!(parsed.payload, pkt.payload);
    }

    #[test]
    fn test_base64_round_trip() {
        let pkt = sample_packet();
        let wire = pkt.encode(PacketEncoding::new(Encoding::Base64)).unwrap();
        assert_eq!(wire[5], ENCODING_BASE64_CHAR);
        let parsed = Packet::parse(&wire).unwrap();
        assert_eq!(parsed.payload, pkt.payload);
    }

    #[test]
    fn test_empty_payload_has_no_marker() {
        let pkt = Packet::empty(client_packet::EOB_DONE);
        let wire = pkt.encode(PacketEncoding::new(Encoding::Hex)).unwrap();
        assert_eq!(wire, b"$E0B0\r");
        let parsed = Packet::parse(&wire).unwrap();
        assert!(parsed.payload.is_empty());
    }

    #[test]
    fn test_csv_encoding_fields() {
        let pkt = Packet::build(client_packet::FIXED_FMT_STD, |w| {
            w.write_hex(0xF020, 2)?;
            w.write_uint(1234, 4)?;
            w.write_gps(&GpsPoint::new(39.0, -120.0), 6)?;
            w.write_str("hi", 8)
        })
        .unwrap();
        let wire = pkt.encode(PacketEncoding::new(Encoding::Csv)).unwrap();
        let text = String::from_utf8(wire).unwrap();
        assert!(text.starts_with("$E030,0xF020,1234,"), "{}", text);
        assert!(text.ends_with(",hi\r"), "{}", text);
    }

    #[test]
    fn test_csv_without_format_falls_back_to_hex() {
        let mut pkt = sample_packet();
        pkt.format.clear();
        let wire = pkt.encode(PacketEncoding::new(Encoding::Csv)).unwrap();
        assert_eq!(wire[5], ENCODING_HEX_CHAR);
    }

    #[test]
    fn test_parse_rejects_csv_payloads() {
        let err = Packet::parse(b"$E030,123,456\r").unwrap_err();
        assert_eq!(
            err,
            PacketParseError::CsvEncoding {
                packet_type: 0xE030
            }
        );
    }

    #[test]
    fn test_parse_rejects_bad_checksum() {
        assert_eq!(
            Packet::parse(b"$E030|ABCD*00\r").unwrap_err(),
            PacketParseError::Checksum
        );
    }

    #[test]
    fn test_parse_rejects_unknown_header() {
        assert_eq!(Packet::parse(b"\x7F\x01\x00").unwrap_err(), PacketParseError::Header);
    }

    #[test]
    fn test_sequence_mask() {
        assert_eq!(sequence_mask(1), 0xFF);
        assert_eq!(sequence_mask(2), 0xFFFF);
        assert_eq!(sequence_mask(4), u32::MAX);
        assert_eq!(sequence_mask(0), u32::MAX);
    }

    #[test]
    fn test_event_ranges() {
        assert!(PacketType(0xE030).is_event());
        assert!(PacketType(0xE03F).is_event());
        assert!(PacketType(0xE055).is_event());
        assert!(PacketType(0xE07F).is_event());
        assert!(!PacketType(0xE001).is_event());
        assert!(!PacketType(0xE0B0).is_event());
        assert!(PacketType(0xE071).is_custom_event());
        assert!(!PacketType(0xE031).is_custom_event());
    }
}
