//! Client reactions to server NAKs and flow-control packets, driven by
//! scripted servers on the far end of the pipe.

mod common;

use common::{event_packet, frame_type, primary_client, read_raw, write_packet};
use opendmtp::defaults;
use opendmtp::packet::{server_packet, Encoding, Packet, PacketEncoding};
use opendmtp::props::PropKey;
use opendmtp::transport::TransportKind;
use opendmtp::ServerError;

fn is_eob(tag: u16) -> bool {
    tag == 0xE0B0 || tag == 0xE0B1
}

/// Encoding downgrade: a CSV packet draws `NAK_PACKET_ENCODING`, the client
/// drops CSV from its bitmap, reselects hex, and resends the faulting
/// identification.
#[tokio::test]
async fn test_csv_nak_downgrades_to_hex_and_resends_id() {
    let (client_io, mut script) = tokio::io::duplex(8192);
    let (mut client, props) = primary_client(client_io);
    props.set_string(PropKey::StateAccountId, "opendmtp");
    props.set_string(PropKey::StateDeviceId, "mobile");

    let script_task = tokio::spawn(async move {
        // first block: account id (base64: the first duplex packet is never
        // CSV), then the device id in CSV, then the EOB
        let account = read_raw(&mut script).await;
        assert_eq!(frame_type(&account), 0xE002);
        assert_eq!(account[5], b':');

        let device = read_raw(&mut script).await;
        assert_eq!(frame_type(&device), 0xE003);
        assert_eq!(device[5], b',');

        let eob = read_raw(&mut script).await;
        assert!(is_eob(frame_type(&eob)));

        // refuse the CSV device packet, then ask the client to speak again
        let nak = Packet::build(server_packet::ERROR, |w| {
            w.write_hex(ServerError::PacketEncoding.code() as u32, 2)?;
            w.write_hex(0xE003, 2)
        })
        .unwrap();
        write_packet(&mut script, &nak).await;
        write_packet(&mut script, &Packet::empty(server_packet::EOB_DONE)).await;

        // the identification comes back, hex this time
        let account = read_raw(&mut script).await;
        assert_eq!(frame_type(&account), 0xE002);
        assert_eq!(account[5], b'|');
        let device = read_raw(&mut script).await;
        assert_eq!(frame_type(&device), 0xE003);
        assert_eq!(device[5], b'|');
        let eob = read_raw(&mut script).await;
        assert!(is_eob(frame_type(&eob)));

        write_packet(&mut script, &Packet::empty(server_packet::EOT)).await;
    });

    client
        .run_session(TransportKind::Duplex, PacketEncoding::new(Encoding::Csv))
        .await;
    script_task.await.unwrap();

    // CSV left the supported-encodings bitmap for good
    let mask = props.get_u32(PropKey::CommEncodings, 0);
    assert_eq!(mask & Encoding::Csv.mask(), 0);
}

/// Excessive events: after an ACK to 0x20 the client additionally discards
/// the next sent event, and stretches its periodic reporting intervals.
#[tokio::test]
async fn test_excessive_events_reaction() {
    let (client_io, mut script) = tokio::io::duplex(16384);
    let (mut client, props) = primary_client(client_io);
    props.set_u32(PropKey::MotionInMotion, 60);
    props.set_u32(PropKey::MotionDormantInterval, 600);

    for seq in 1..=50u32 {
        client.event_queue().add(event_packet(seq)).unwrap();
    }
    let events = client.event_queue();

    let script_task = tokio::spawn(async move {
        // let five blocks of eight through, nudging after each
        let mut eobs = 0;
        while eobs < 5 {
            let frame = read_raw(&mut script).await;
            if is_eob(frame_type(&frame)) {
                eobs += 1;
                if eobs < 5 {
                    write_packet(&mut script, &Packet::empty(server_packet::EOB_DONE)).await;
                }
            }
        }
        // forty events are out; acknowledge through 0x20 and cry foul
        let ack = Packet::build(server_packet::ACK, |w| w.write_hex(0x20, 1)).unwrap();
        write_packet(&mut script, &ack).await;
        let nak = Packet::build(server_packet::ERROR, |w| {
            w.write_hex(ServerError::ExcessiveEvents.code() as u32, 2)?;
            w.write_hex(0xE030, 2)
        })
        .unwrap();
        write_packet(&mut script, &nak).await;
        write_packet(&mut script, &Packet::empty(server_packet::EOT)).await;
    });

    client
        .run_session(TransportKind::Duplex, PacketEncoding::BINARY)
        .await;
    script_task.await.unwrap();

    // 0x01..=0x20 acknowledged, 0x21 discarded as the offending event
    assert_eq!(events.len(), 50 - 0x20 - 1);
    assert_eq!(events.get(0).unwrap().sequence, 0x22);

    assert_eq!(
        props.get_u32(PropKey::MotionInMotion, 0),
        60 + defaults::EXCESSIVE_EVENTS_IN_MOTION_PENALTY_SEC
    );
    assert_eq!(
        props.get_u32(PropKey::MotionDormantInterval, 0),
        600 + defaults::EXCESSIVE_EVENTS_DORMANT_PENALTY_SEC
    );
}

/// Speak-freely with a max-events override: the client sends at most that
/// many events and then relinquishes with an EOB, whatever remains queued.
#[tokio::test]
async fn test_speak_freely_relinquished_after_max_events() {
    let (client_io, mut script) = tokio::io::duplex(16384);
    let (mut client, _props) = primary_client(client_io);
    for seq in 1..=20u32 {
        client.event_queue().add(event_packet(seq)).unwrap();
    }

    let script_task = tokio::spawn(async move {
        // first block: eight events and an EOB-MORE
        let mut first_block = 0;
        loop {
            let frame = read_raw(&mut script).await;
            let tag = frame_type(&frame);
            if is_eob(tag) {
                break;
            }
            if tag == 0xE030 {
                first_block += 1;
            }
        }
        assert_eq!(first_block, 8);

        // grant speak-freely, four events per block
        let grant =
            Packet::build(server_packet::EOB_SPEAK_FREELY, |w| w.write_uint(4, 1)).unwrap();
        write_packet(&mut script, &grant).await;

        // exactly four events arrive, then the client relinquishes
        let mut second_block = 0;
        loop {
            let frame = read_raw(&mut script).await;
            let tag = frame_type(&frame);
            if is_eob(tag) {
                break;
            }
            assert_eq!(tag, 0xE030);
            second_block += 1;
        }
        assert_eq!(second_block, 4);

        write_packet(&mut script, &Packet::empty(server_packet::EOT)).await;
    });

    client
        .run_session(TransportKind::Duplex, PacketEncoding::BINARY)
        .await;
    script_task.await.unwrap();
}
