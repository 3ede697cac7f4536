//! End-to-end session scenarios over real loopback UDP.
//!
//! Every test binds its server to an OS-assigned port and drives both peers
//! manually, so tests can run in parallel without colliding. Timers are
//! shortened through [`PeerConfig`] to keep the scenarios fast.

use std::{
    net::SocketAddr,
    thread,
    time::Duration,
};

use quicknet::{
    msg::Envelope,
    packet::{Acknowledge, Packet, PacketHeader},
    peer::GAME_ID,
    stream::Stream,
    Message, MessageHeader, Peer, PeerConfig, PeerHandler, PeerState,
};

const TICK: Duration = Duration::from_millis(5);

/// Records every callback for later assertions.
#[derive(Debug, Default)]
struct Recorder {
    connections: Vec<u8>,
    disconnections: Vec<u8>,
    messages: Vec<Message>,
}

impl PeerHandler for Recorder {
    fn on_connection(&mut self, peer_id: u8) {
        self.connections.push(peer_id);
    }

    fn on_disconnection(&mut self, peer_id: u8) {
        self.disconnections.push(peer_id);
    }

    fn on_game_message(&mut self, msg: &Message) {
        self.messages.push(msg.clone());
    }
}

fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
        .try_init();
}

fn fast_config() -> PeerConfig {
    PeerConfig {
        server_port: 0,
        probe_interval: Duration::from_millis(100),
        connection_timeout: Duration::from_secs(5),
        keepalive_interval: Duration::from_millis(30),
        send_rate: 100,
    }
}

fn server_addr(server: &Peer) -> SocketAddr {
    let port = server
        .local_addr()
        .expect("server socket is bound")
        .port();
    ([127, 0, 0, 1], port).into()
}

/// Ticks both peers until `done` reports true, panicking after `max_ticks`.
fn drive_until(
    server: &mut Peer,
    server_rec: &mut Recorder,
    client: &mut Peer,
    client_rec: &mut Recorder,
    max_ticks: u32,
    what: &str,
    mut done: impl FnMut(&Peer, &Recorder, &Peer, &Recorder) -> bool,
) {
    for _ in 0..max_ticks {
        server.update_network(server_rec);
        client.update_network(client_rec);
        if done(server, server_rec, client, client_rec) {
            return;
        }
        thread::sleep(TICK);
    }
    panic!("timed out waiting for: {what}");
}

fn connect(
    server: &mut Peer,
    server_rec: &mut Recorder,
    client: &mut Peer,
    client_rec: &mut Recorder,
) {
    let addr = server_addr(server);
    assert!(client.connect_to(addr));
    drive_until(
        server,
        server_rec,
        client,
        client_rec,
        400,
        "handshake to complete",
        |_, srec, client, crec| {
            client.network_state() == PeerState::Connected
                && !srec.connections.is_empty()
                && !crec.connections.is_empty()
        },
    );
}

#[test]
fn happy_path_connect() {
    init_logs();
    let mut server = Peer::new(true, 4, fast_config()).expect("bind server");
    let mut client = Peer::new(false, 1, fast_config()).expect("bind client");
    let (mut srec, mut crec) = (Recorder::default(), Recorder::default());

    connect(&mut server, &mut srec, &mut client, &mut crec);

    // the first client gets ID 1; both sides hear about the connection
    assert_eq!(vec![1], srec.connections);
    assert_eq!(vec![1], crec.connections);
    assert_eq!(1, client.assigned_id());
    assert_eq!(1, server.peer_count());
    assert!(srec.disconnections.is_empty());
    assert!(crec.disconnections.is_empty());
}

#[test]
fn discovery_probe_is_answered() {
    init_logs();
    let mut server = Peer::new(true, 4, fast_config()).expect("bind server");
    let mut srec = Recorder::default();
    let addr = server_addr(&server);

    // probe from a plain socket, standing in for a searching client without
    // touching the OS broadcast machinery
    let probe_socket = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind probe");
    probe_socket
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("set timeout");

    let mut packet = Packet::new(Acknowledge::default());
    packet.push(Envelope::new(Message::DiscoveryRequest { game_id: GAME_ID }));
    let mut buf = [0; 64];
    let len = packet.serialize(&mut buf).expect("serialize probe");
    probe_socket.send_to(&buf[..len], addr).expect("send probe");

    for _ in 0..50 {
        server.update_network(&mut srec);
        thread::sleep(TICK);
    }

    let mut answer = [0; 64];
    let (len, _) = probe_socket.recv_from(&mut answer).expect("answer arrives");

    // parse the answer off the wire
    let mut header = PacketHeader::default();
    let mut stream = Stream::reader(&mut answer[..len]);
    header.transfer(&mut stream).expect("packet header");
    let mut msg_header = MessageHeader::default();
    msg_header.transfer(&mut stream).expect("message header");
    let mut msg = Message::from_id(msg_header.id).expect("catalog id");
    msg.body(&mut stream).expect("message body");

    assert_eq!(
        Message::DiscoveryAnswer {
            game_id: GAME_ID,
            free_slots: 4,
            total_slots: 4,
        },
        msg
    );
}

#[test]
fn reliable_delivery_through_packet_loss() {
    init_logs();
    let mut config = fast_config();
    config.connection_timeout = Duration::from_secs(30);
    let mut server = Peer::new(true, 4, config.clone()).expect("bind server");
    let mut client = Peer::new(false, 1, config).expect("bind client");
    let (mut srec, mut crec) = (Recorder::default(), Recorder::default());

    connect(&mut server, &mut srec, &mut client, &mut crec);

    // the server goes deaf: every inbound and outbound datagram is dropped
    server.set_fake_packet_loss(1.0);
    assert!(client.send_to(0, Message::PlayerJoined { player_id: 5 }));
    for _ in 0..30 {
        server.update_network(&mut srec);
        client.update_network(&mut crec);
        thread::sleep(TICK);
    }
    assert!(
        srec.messages.is_empty(),
        "no message should get through full loss"
    );

    // loss ends; the client is still retransmitting the reliable
    server.set_fake_packet_loss(0.0);
    drive_until(
        &mut server,
        &mut srec,
        &mut client,
        &mut crec,
        400,
        "reliable to arrive",
        |_, srec, _, _| !srec.messages.is_empty(),
    );

    // keep exchanging so late retransmits reach the duplicate check
    for _ in 0..50 {
        server.update_network(&mut srec);
        client.update_network(&mut crec);
        thread::sleep(TICK);
    }

    let delivered: Vec<_> = srec
        .messages
        .iter()
        .filter(|msg| matches!(msg, Message::PlayerJoined { player_id: 5 }))
        .collect();
    assert_eq!(1, delivered.len(), "retransmits must deduplicate");
}

#[test]
fn silent_peer_times_out() {
    init_logs();
    let mut config = fast_config();
    config.connection_timeout = Duration::from_millis(400);
    let mut server = Peer::new(true, 4, config.clone()).expect("bind server");
    let mut client = Peer::new(false, 1, config).expect("bind client");
    let (mut srec, mut crec) = (Recorder::default(), Recorder::default());

    connect(&mut server, &mut srec, &mut client, &mut crec);

    // the client vanishes without a disconnection notice
    drop(client);
    for _ in 0..400 {
        server.update_network(&mut srec);
        if !srec.disconnections.is_empty() {
            break;
        }
        thread::sleep(TICK);
    }

    assert_eq!(vec![1], srec.disconnections);
    assert_eq!(0, server.peer_count());
}

#[test]
fn full_server_rejects_the_second_client() {
    init_logs();
    let mut server = Peer::new(true, 1, fast_config()).expect("bind server");
    let mut first = Peer::new(false, 1, fast_config()).expect("bind client");
    let (mut srec, mut frec) = (Recorder::default(), Recorder::default());

    connect(&mut server, &mut srec, &mut first, &mut frec);
    assert_eq!(1, server.peer_count());

    let mut second = Peer::new(false, 1, fast_config()).expect("bind client");
    let mut sec_rec = Recorder::default();
    let addr = server_addr(&server);
    assert!(second.connect_to(addr));

    drive_until(
        &mut server,
        &mut srec,
        &mut second,
        &mut sec_rec,
        400,
        "second client to be turned away",
        |_, _, second, _| second.network_state() == PeerState::Disconnected,
    );

    // the full answer carries no session: no new peer, no connection callback
    assert_eq!(1, server.peer_count());
    assert!(sec_rec.connections.is_empty());
    assert_eq!(quicknet::peer::UNASSIGNED_ID, second.assigned_id());
}

#[test]
fn fake_latency_delays_delivery() {
    init_logs();
    let mut server = Peer::new(true, 4, fast_config()).expect("bind server");
    let mut client = Peer::new(false, 1, fast_config()).expect("bind client");
    let (mut srec, mut crec) = (Recorder::default(), Recorder::default());

    connect(&mut server, &mut srec, &mut client, &mut crec);

    client.set_fake_latency(300);
    assert_eq!(300, client.current_fake_latency());
    server.send_to(1, Message::PlayerJoined { player_id: 9 });

    // well under the fake latency: the message is parked, not delivered
    for _ in 0..10 {
        server.update_network(&mut srec);
        client.update_network(&mut crec);
        thread::sleep(TICK);
    }
    assert!(crec.messages.is_empty(), "delivered under the fake latency");

    drive_until(
        &mut server,
        &mut srec,
        &mut client,
        &mut crec,
        400,
        "delayed message to be released",
        |_, _, _, crec| !crec.messages.is_empty(),
    );
    assert!(crec
        .messages
        .iter()
        .any(|msg| matches!(msg, Message::PlayerJoined { player_id: 9 })));
}
