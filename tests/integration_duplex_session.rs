//! Full-stack duplex sessions: a real client session talking to a real
//! server session over an in-memory pipe.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{event_packet, primary_client};
use opendmtp::packet::{PacketEncoding, PacketPriority};
use opendmtp::props::PropKey;
use opendmtp::session::{ServerConfig, ServerHooks, ServerSession};

fn quick_server_config() -> ServerConfig {
    ServerConfig {
        keep_alive: false,
        client_speaks_first: true,
        read_timeout: Duration::from_millis(300),
        ..Default::default()
    }
}

/// The "duplex hello": unique-id identification, one event, ack, EOT. The
/// event queue ends empty and the persisted byte counters match exactly
/// what crossed the wire.
#[tokio::test]
async fn test_duplex_hello() {
    let (client_io, server_io) = tokio::io::duplex(8192);
    let (mut client, props) = primary_client(client_io);
    props.set_bytes(PropKey::StateUniqueId, vec![0x01, 0x02, 0x03, 0x04]);

    let event = event_packet(0x0001);
    client.event_queue().add(event.clone()).unwrap();

    let unique_ids: Arc<parking_lot::Mutex<Vec<Vec<u8>>>> = Arc::new(Default::default());
    let seen_ids = Arc::clone(&unique_ids);
    let hooks = ServerHooks {
        on_unique_id: Some(Box::new(move |id| {
            seen_ids.lock().push(id.to_vec());
            true
        })),
        ..Default::default()
    };
    let server = ServerSession::new(server_io, quick_server_config(), hooks);
    let server_task = tokio::spawn(server.run());

    assert!(client.transport_request(PacketEncoding::BINARY).await);

    let summary = server_task.await.unwrap().unwrap();
    assert_eq!(summary.events_received, 1);
    assert_eq!(unique_ids.lock().as_slice(), &[vec![0x01, 0x02, 0x03, 0x04]]);

    // the acknowledged event left the queue
    assert!(client.event_queue().is_empty());

    // byte counters persisted on close, matching the exact encoded lengths
    let unique_frame_len = 3 + 4; // binary header + id payload
    let event_frame_len = event.encode(PacketEncoding::BINARY).unwrap().len();
    let eob_frame_len = 3 + 2; // EOB with the Fletcher check bytes
    let expected_written = (unique_frame_len + event_frame_len + eob_frame_len) as u32;
    assert_eq!(
        props.get_u32(PropKey::CommBytesWritten, 0),
        expected_written
    );
    let ack_frame_len = 3 + 1; // ACK with a one-byte sequence
    let eot_frame_len = 3;
    assert_eq!(
        props.get_u32(PropKey::CommBytesRead, 0),
        (ack_frame_len + eot_frame_len) as u32
    );
    assert_eq!(summary.bytes_read, expected_written as u64);
}

/// A server that rejects the unique id sees the client fall back to
/// account/device identification within the same session.
#[tokio::test]
async fn test_unique_id_fallback_to_account_device() {
    let (client_io, server_io) = tokio::io::duplex(8192);
    let (mut client, props) = primary_client(client_io);
    props.set_bytes(PropKey::StateUniqueId, vec![0x01, 0x02, 0x03, 0x04]);
    props.set_string(PropKey::StateAccountId, "opendmtp");
    props.set_string(PropKey::StateDeviceId, "mobile");

    let hooks = ServerHooks {
        on_unique_id: Some(Box::new(|_| false)),
        ..Default::default()
    };
    let server = ServerSession::new(server_io, quick_server_config(), hooks);
    let server_task = tokio::spawn(server.run());

    assert!(client.transport_request(PacketEncoding::BINARY).await);

    let summary = server_task.await.unwrap().unwrap();
    assert_eq!(summary.account_id, "opendmtp");
    assert_eq!(summary.device_id, "mobile");
}

/// Events queued while the server holds the client in speak-freely get
/// auto-acknowledged after the keep-alive delay even without an EOB.
#[tokio::test]
async fn test_speak_freely_events_are_acked() {
    let (client_io, server_io) = tokio::io::duplex(8192);
    let (mut client, props) = primary_client(client_io);
    props.set_string(PropKey::StateAccountId, "opendmtp");
    props.set_string(PropKey::StateDeviceId, "mobile");

    for seq in 1..=3u32 {
        client.event_queue().add(event_packet(seq)).unwrap();
    }

    let acked = Arc::new(AtomicU32::new(0));
    let acked_in_hook = Arc::clone(&acked);
    let config = ServerConfig {
        keep_alive: true,
        client_speaks_first: true,
        speak_freely: true,
        speak_freely_max_events: -1,
        read_timeout: Duration::from_millis(300),
    };
    let hooks = ServerHooks {
        on_event: Some(Box::new(move |_, ev| {
            acked_in_hook.store(ev.sequence, Ordering::SeqCst);
        })),
        ..Default::default()
    };
    let server = ServerSession::new(server_io, config, hooks);
    let server_task = tokio::spawn(async move {
        // the session outlives the client; let the pipe teardown end it
        let _ = server.run().await;
    });

    assert!(client.transport_request(PacketEncoding::BINARY).await);
    drop(client);
    server_task.await.unwrap();

    assert_eq!(acked.load(Ordering::SeqCst), 3);
}

/// A simplex session flushes its datagram at close and self-acknowledges
/// every sent event.
#[tokio::test]
async fn test_simplex_session_self_acks() {
    use opendmtp::accounting::ConnectionAccounting;
    use opendmtp::event::TemplateRegistry;
    use opendmtp::props::PropertyStore;
    use opendmtp::session::ClientSession;
    use opendmtp::transport::{TransportKind, UdpTransport};

    let receiver = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = receiver.local_addr().unwrap();

    let props = Arc::new(PropertyStore::new());
    props.set_string(PropKey::StateAccountId, "opendmtp");
    props.set_string(PropKey::StateDeviceId, "mobile");
    let accounting = Arc::new(ConnectionAccounting::new(Arc::clone(&props), true, true));
    let registry = Arc::new(TemplateRegistry::new());
    let mut client = ClientSession::new(
        0,
        UdpTransport::new(addr.to_string()),
        Arc::clone(&props),
        accounting,
        registry,
    );
    // low-priority events are exactly what a simplex session carries
    client
        .event_queue()
        .add(event_packet(1).with_priority(PacketPriority::Low))
        .unwrap();
    client
        .event_queue()
        .add(event_packet(2).with_priority(PacketPriority::Low))
        .unwrap();

    client
        .run_session(TransportKind::Simplex, PacketEncoding::BINARY)
        .await;

    // everything sent left the queue without any server acknowledgement
    assert!(client.event_queue().is_empty());

    let mut buf = vec![0u8; 2048];
    let n = receiver.recv(&mut buf).await.unwrap();
    // the datagram holds the identification and both events, no EOB
    assert!(n > 0);
    let mut frames = 0;
    let mut cursor = &buf[..n];
    while !cursor.is_empty() {
        let len = 3 + cursor[2] as usize;
        frames += 1;
        cursor = &cursor[len..];
    }
    assert_eq!(frames, 4); // account, device, two events
}

/// `SEQUENCE_ALL` is what an empty ACK payload means.
#[tokio::test]
async fn test_empty_ack_clears_sent_prefix() {
    use common::{read_packet, write_packet};
    use opendmtp::packet::{client_packet, server_packet, Packet};
    use opendmtp::transport::TransportKind;

    let (client_io, mut script) = tokio::io::duplex(8192);
    let (mut client, _props) = primary_client(client_io);
    for seq in 1..=4u32 {
        client.event_queue().add(event_packet(seq)).unwrap();
    }

    let script_task = tokio::spawn(async move {
        // first block: four events then EOB
        loop {
            let pkt = read_packet(&mut script).await;
            if pkt.packet_type == client_packet::EOB_DONE
                || pkt.packet_type == client_packet::EOB_MORE
            {
                break;
            }
        }
        write_packet(&mut script, &Packet::empty(server_packet::ACK)).await;
        write_packet(&mut script, &Packet::empty(server_packet::EOT)).await;
        script
    });

    client
        .run_session(TransportKind::Duplex, PacketEncoding::BINARY)
        .await;
    assert!(client.event_queue().is_empty());
    script_task.await.unwrap();
}
