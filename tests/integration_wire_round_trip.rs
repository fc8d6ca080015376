//! Wire round-trip laws: `decode(encode(P, E)) == P` for binary, hex, and
//! base64, with and without the XOR checksum, and the event codec round
//! trip through an encoded packet.

mod common;

use common::event_packet;
use opendmtp::codec::GpsPoint;
use opendmtp::event::{decode_event, encode_event, EventTemplate, FieldId, TemplateRegistry};
use opendmtp::packet::{client_packet, Encoding, Packet, PacketEncoding};
use opendmtp::Event;

fn representative_packets() -> Vec<Packet> {
    vec![
        Packet::empty(client_packet::EOB_DONE),
        Packet::build(client_packet::UNIQUE_ID, |w| {
            w.write_bytes(&[0x01, 0x02, 0x03, 0x04], 4)
        })
        .unwrap(),
        Packet::build(client_packet::ACCOUNT_ID, |w| w.write_str("opendmtp", 20)).unwrap(),
        Packet::build(client_packet::ERROR, |w| {
            w.write_hex(0xF911, 2)?;
            w.write_uint(1_200_000_000, 4)
        })
        .unwrap(),
        event_packet(0x37),
    ]
}

#[test]
fn test_round_trip_all_encodings() {
    let encodings = [
        PacketEncoding::BINARY,
        PacketEncoding::new(Encoding::Hex),
        PacketEncoding::with_checksum(Encoding::Hex),
        PacketEncoding::new(Encoding::Base64),
        PacketEncoding::with_checksum(Encoding::Base64),
    ];
    for pkt in representative_packets() {
        for enc in encodings {
            let wire = pkt.encode(enc).unwrap();
            let parsed = Packet::parse(&wire).unwrap();
            assert_eq!(parsed.packet_type, pkt.packet_type, "{:?}", enc);
            assert_eq!(parsed.payload, pkt.payload, "{:?}", enc);
        }
    }
}

#[test]
fn test_event_round_trip_through_the_wire() {
    let registry = TemplateRegistry::new();
    let template = EventTemplate::fixed_high();

    let mut src = Event::default();
    src.status_code = 0xF020;
    src.timestamp[0] = 1_234_567_890;
    src.gps_point[0] = GpsPoint::new(37.7749, -122.4194);
    src.speed_kph = 88.5;
    src.heading = 271.07;
    src.altitude = 16.2;
    src.distance_km = 12_345.6;
    src.sequence = 0x42;

    let pkt = encode_event(&src, &template).unwrap();
    let wire = pkt.encode(PacketEncoding::with_checksum(Encoding::Base64)).unwrap();
    let parsed = Packet::parse(&wire).unwrap();
    let out = decode_event(&parsed, &registry).unwrap();

    assert_eq!(out.status_code, src.status_code);
    assert_eq!(out.timestamp[0], src.timestamp[0]);
    assert!((out.gps_point[0].latitude - src.gps_point[0].latitude).abs() < 4.7e-8);
    assert!((out.gps_point[0].longitude - src.gps_point[0].longitude).abs() < 4.7e-8);
    assert_eq!(out.speed_kph, src.speed_kph);
    assert_eq!(out.heading, src.heading);
    assert_eq!(out.altitude, src.altitude);
    assert_eq!(out.distance_km, src.distance_km);
    assert_eq!(out.sequence, src.sequence);
    assert!(out.field_mask.is_set(FieldId::GpsPoint));
    // the template does not carry the odometer; it stays undefined
    assert_eq!(out.odometer_km, opendmtp::event::UNDEFINED_DISTANCE);
}
