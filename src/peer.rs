//! The local peer: socket ownership, the session state machine, discovery,
//! the connection handshake, keep-alives and the rate-limited send loop.
//!
//! A [`Peer`] acts as either a server (binds the well-known port, accepts
//! connection requests) or a client (discovers servers over broadcast or
//! connects directly). The whole core is single-threaded and nonblocking:
//! the embedder implements [`PeerHandler`] and calls
//! [`Peer::update_network`] at its own cadence; nothing in here blocks or
//! spawns.

use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
};

use ahash::AHashMap;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use tracing::{debug, error, info, trace, warn};
use web_time::{Duration, Instant};

use crate::{
    condition::LatencyFaker,
    msg::{Envelope, Message, MessageHeader},
    packet::{Acknowledge, Packet, PacketHeader, MAX_PACKET_LEN},
    remote::RemotePeer,
    seq::Seq,
    socket::Socket,
    stream::Stream,
};

/// Identifier separating this game's traffic from other traffic on the LAN.
///
/// Discovery and connection requests carrying any other value are ignored.
pub const GAME_ID: u32 = 0xDEAD_CAFE;

/// Seed of the connection challenge; the expected response is the seed XORed
/// with [`GAME_ID`]. This is a handshake sanity check, not authentication.
pub const CHALLENGE_SEED: u32 = 0x0012_3456;

/// Peer ID meaning "no ID assigned"; also the server's "I am full" reply.
pub const UNASSIGNED_ID: u8 = 0xFF;

/// Peer ID under which a client keys its server.
pub const SERVER_PEER_ID: u8 = 0;

/// How many [`Message::DisconnectionRequest`]s a normal disconnect sends,
/// as best-effort redundancy on a lossy link.
const DISCONNECT_REDUNDANCY: u8 = 5;

/// Connection state of the local [`Peer`], or of one [`RemotePeer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PeerState {
    /// Idle; no I/O happens.
    #[default]
    Disconnected,
    /// Client probing the LAN for servers over broadcast.
    Searching,
    /// Handshake in progress.
    Connecting,
    /// Handshake complete; full send/receive loop.
    Connected,
    /// Acting as a server, accepting inbound connection requests.
    ServerMode,
}

/// Tunables of a [`Peer`], supplied at construction.
///
/// The defaults are the protocol's reference values; tests shorten the
/// timers to keep scenarios fast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Port servers bind and discovery probes target.
    pub server_port: u16,
    /// How often a [searching](PeerState::Searching) client broadcasts a
    /// discovery probe.
    pub probe_interval: Duration,
    /// How long a remote may stay silent before it is dropped.
    pub connection_timeout: Duration,
    /// How long to wait for acks before soliciting one with a keep-alive.
    pub keepalive_interval: Duration,
    /// Upper bound on packets sent per second, per peer.
    pub send_rate: u32,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            server_port: 8000,
            probe_interval: Duration::from_millis(1000),
            connection_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_millis(100),
            send_rate: 20,
        }
    }
}

impl PeerConfig {
    fn send_interval_ms(&self) -> u64 {
        1000 / u64::from(self.send_rate.max(1))
    }
}

/// Callbacks through which a [`Peer`] reports session events and delivers
/// application messages to the embedder.
pub trait PeerHandler {
    /// A peer finished the handshake. On a server, `peer_id` is the joining
    /// client's assigned ID; on a client, it is the client's own assigned ID.
    fn on_connection(&mut self, peer_id: u8);

    /// A peer was disconnected, by request or by timeout.
    fn on_disconnection(&mut self, peer_id: u8);

    /// A non-system message arrived and passed sequencing.
    fn on_game_message(&mut self, msg: &Message);
}

/// The local end of a session: a long-lived object owning the UDP endpoint,
/// the remote peer table and the send/receive scratch buffers.
///
/// See the [crate-level documentation](crate) for an overview and an
/// example loop.
#[derive(Debug)]
pub struct Peer {
    state: PeerState,
    socket: Socket,
    assigned_id: u8,
    /// Remote peers keyed by assigned ID.
    peers: AHashMap<u8, RemotePeer>,
    /// Secondary index from network address to assigned ID. Never a second
    /// owner: entries live and die with `peers`.
    addr_to_id: AHashMap<SocketAddr, u8>,
    max_peers: u8,
    /// When the last discovery probe went out (searching clients only).
    last_send: u64,
    recv_buf: Box<[u8]>,
    send_buf: Box<[u8]>,
    epoch: Instant,
    rng: SmallRng,
    fake_loss: f32,
    fake_latency: LatencyFaker,
    config: PeerConfig,
}

impl Peer {
    /// Creates a peer, binding the server port if `server_mode` is set.
    ///
    /// `max_peers` only applies to servers; clients hold a single connection.
    ///
    /// # Errors
    ///
    /// Errors if the UDP endpoint cannot be created or configured; this is
    /// the only fatal condition in the crate.
    pub fn new(server_mode: bool, max_peers: u8, config: PeerConfig) -> io::Result<Self> {
        let socket = if server_mode {
            info!("peer started in server mode, binding to 0.0.0.0:{}", config.server_port);
            Socket::bind((Ipv4Addr::UNSPECIFIED, config.server_port).into())?
        } else {
            Socket::open()?
        };
        // all peers may broadcast, so clients can probe for servers
        socket.allow_broadcast(true)?;

        Ok(Self {
            state: if server_mode {
                PeerState::ServerMode
            } else {
                PeerState::Disconnected
            },
            socket,
            assigned_id: UNASSIGNED_ID,
            peers: AHashMap::new(),
            addr_to_id: AHashMap::new(),
            max_peers,
            last_send: 0,
            recv_buf: vec![0; MAX_PACKET_LEN].into_boxed_slice(),
            send_buf: vec![0; MAX_PACKET_LEN].into_boxed_slice(),
            epoch: Instant::now(),
            rng: SmallRng::from_entropy(),
            fake_loss: 0.0,
            fake_latency: LatencyFaker::new(),
            config,
        })
    }

    /// Starts probing the LAN for servers over broadcast.
    ///
    /// Tears down any existing session first. Returns `false` on a server.
    pub fn find_servers(&mut self, handler: &mut dyn PeerHandler) -> bool {
        if self.is_server() {
            return false;
        }
        info!("finding LAN servers");

        if self.state != PeerState::Disconnected {
            self.disconnect_all(handler);
        }

        self.state = PeerState::Searching;
        // backdate so the first probe goes out on the next update
        self.last_send = self
            .now_ms()
            .wrapping_sub(self.config.probe_interval.as_millis() as u64);
        true
    }

    /// Starts connecting to a server at `address`, local or on the Internet.
    ///
    /// Returns whether the connection request went out; the handshake result
    /// arrives later through [`PeerHandler::on_connection`].
    pub fn connect_to(&mut self, address: SocketAddr) -> bool {
        if self.is_server() {
            warn!("a server cannot connect out");
            return false;
        }
        info!("trying to connect to {address}");

        self.state = PeerState::Connecting;
        // the server gets its peer entry now
        self.add_peer(address);

        self.send_message(address, Message::ConnectionRequest { game_id: GAME_ID })
    }

    /// Disconnects every remote peer; a client also resets its own state.
    pub fn disconnect_all(&mut self, handler: &mut dyn PeerHandler) {
        debug!("disconnecting all peers");

        let ids: Vec<u8> = self.peers.keys().copied().collect();
        for id in ids {
            self.disconnect_peer(id, DISCONNECT_REDUNDANCY, handler);
        }
        self.sweep();

        if !self.is_server() {
            self.state = PeerState::Disconnected;
            self.assigned_id = UNASSIGNED_ID;
        }
    }

    /// Runs one network tick: drains the socket, performs peer maintenance
    /// (timeouts, keep-alives, delayed messages) and flushes pending sends.
    ///
    /// Never blocks; the embedder is responsible for pacing.
    pub fn update_network(&mut self, handler: &mut dyn PeerHandler) {
        match self.state {
            PeerState::Disconnected => {}
            PeerState::Searching => {
                let now = self.now_ms();
                if now.wrapping_sub(self.last_send)
                    >= self.config.probe_interval.as_millis() as u64
                {
                    debug!("sending discovery probe");
                    let broadcast: SocketAddr =
                        (Ipv4Addr::BROADCAST, self.config.server_port).into();
                    if !self.send_message(broadcast, Message::DiscoveryRequest { game_id: GAME_ID })
                    {
                        warn!("sending discovery probe failed");
                    }
                    self.last_send = now;
                }

                self.receive(handler);
                // runs the latency faker even while searching
                self.update_peers(handler);
            }
            PeerState::Connecting | PeerState::Connected | PeerState::ServerMode => {
                self.receive(handler);
                self.update_peers(handler);
                self.send();
            }
        }
    }

    /// Queues `msg` for the peer with the given ID.
    ///
    /// Returns `false` for an unknown peer. The message leaves with the next
    /// packet once the peer's send interval elapses.
    pub fn send_to(&mut self, peer_id: u8, msg: Message) -> bool {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return false;
        };
        trace!("queueing {} for peer {peer_id}", msg.name());
        peer.enqueue(Envelope::new(msg));
        true
    }

    /// Queues `msg` for every remote peer.
    ///
    /// With a single peer the message is moved straight into its queue;
    /// with more, each peer gets its own copy.
    pub fn send_to_all(&mut self, msg: Message) {
        if self.peers.len() == 1 {
            if let Some(peer) = self.peers.values_mut().next() {
                peer.enqueue(Envelope::new(msg));
            }
            return;
        }
        for peer in self.peers.values_mut() {
            peer.enqueue(Envelope::new(msg.clone()));
        }
    }

    /// Switches between server and disconnected-client mode at runtime,
    /// tearing down any existing session and rebinding the socket.
    ///
    /// # Errors
    ///
    /// Errors if the replacement UDP endpoint cannot be created; the peer is
    /// left disconnected in that case.
    pub fn set_server_mode(
        &mut self,
        enable: bool,
        handler: &mut dyn PeerHandler,
    ) -> io::Result<()> {
        info!("setting server mode to {enable}");

        if self.state != PeerState::Disconnected {
            self.disconnect_all(handler);
        }
        self.state = PeerState::Disconnected;

        // a fresh socket, so the old binding can't get in the way
        let socket = if enable {
            info!("server mode started, binding to 0.0.0.0:{}", self.config.server_port);
            Socket::bind((Ipv4Addr::UNSPECIFIED, self.config.server_port).into())?
        } else {
            Socket::open()?
        };
        socket.allow_broadcast(true)?;
        self.socket = socket;
        self.state = if enable {
            PeerState::ServerMode
        } else {
            PeerState::Disconnected
        };
        Ok(())
    }

    /// Sets the fraction of packets to drop artificially, clamped to
    /// `0.0..=1.0`. **Testing only.**
    pub fn set_fake_packet_loss(&mut self, fraction: f32) {
        self.fake_loss = fraction.clamp(0.0, 1.0);
        info!("fake packet loss set to {}", self.fake_loss);
    }

    /// Currently configured artificial packet loss fraction.
    #[must_use]
    pub fn current_fake_packet_loss(&self) -> f32 {
        self.fake_loss
    }

    /// Sets the artificial latency applied to received messages.
    /// **Testing only.**
    pub fn set_fake_latency(&mut self, milliseconds: u32) {
        self.fake_latency.set_latency(milliseconds);
        info!("fake latency set to {milliseconds}ms");
    }

    /// Currently configured artificial latency in milliseconds.
    #[must_use]
    pub fn current_fake_latency(&self) -> u32 {
        self.fake_latency.latency()
    }

    /// Connection state of the local peer.
    #[must_use]
    pub fn network_state(&self) -> PeerState {
        self.state
    }

    /// Whether this peer is acting as a server.
    #[must_use]
    pub fn is_server(&self) -> bool {
        self.state == PeerState::ServerMode
    }

    /// ID the server assigned to this client, or [`UNASSIGNED_ID`].
    #[must_use]
    pub fn assigned_id(&self) -> u8 {
        self.assigned_id
    }

    /// How many remote peers are currently known (including ones still in
    /// the handshake).
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Address the underlying socket is bound to; mainly useful when the
    /// configured port is `0` and the OS picked one.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Smoothed round-trip time in milliseconds: to the server on a client,
    /// averaged over connected peers on a server. `0` before any sample.
    #[must_use]
    pub fn rtt(&self) -> u32 {
        if self.is_server() {
            let connected: Vec<u32> = self
                .peers
                .values()
                .filter(|peer| peer.state() == PeerState::Connected)
                .map(RemotePeer::rtt)
                .collect();
            if connected.is_empty() {
                0
            } else {
                connected.iter().sum::<u32>() / connected.len() as u32
            }
        } else if self.state == PeerState::Connected {
            self.peers.get(&SERVER_PEER_ID).map_or(0, RemotePeer::rtt)
        } else {
            0
        }
    }

    /// Milliseconds elapsed since this peer was created; the timebase for
    /// every timer and timestamp in the session.
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Registers a remote at `address` and returns its assigned ID.
    ///
    /// On a server this picks a free ID in `1..=max_peers`, returning
    /// [`UNASSIGNED_ID`] when full; on a client the single entry is the
    /// server, keyed [`SERVER_PEER_ID`].
    fn add_peer(&mut self, address: SocketAddr) -> u8 {
        let now = self.now_ms();
        if self.is_server() {
            let assigned_id = self.find_free_peer_id();
            if assigned_id != UNASSIGNED_ID {
                let mut peer = RemotePeer::new(address, now);
                peer.set_state(PeerState::Connecting);
                peer.assigned_id = assigned_id;
                self.peers.insert(assigned_id, peer);
                self.addr_to_id.insert(address, assigned_id);
                debug!("added peer {assigned_id} at {address}");
            }
            assigned_id
        } else {
            let mut peer = RemotePeer::new(address, now);
            peer.set_state(PeerState::ServerMode);
            peer.assigned_id = SERVER_PEER_ID;
            self.peers.insert(SERVER_PEER_ID, peer);
            self.addr_to_id.insert(address, SERVER_PEER_ID);
            SERVER_PEER_ID
        }
    }

    fn find_free_peer_id(&self) -> u8 {
        // 0 is the server's own ID
        for id in 1..=self.max_peers {
            if !self.peers.contains_key(&id) {
                return id;
            }
        }
        warn!("no more free peer IDs available");
        UNASSIGNED_ID
    }

    /// Sends `amount` best-effort disconnection notices, marks the peer
    /// disconnected (the sweep removes it) and fires the callback.
    fn disconnect_peer(&mut self, peer_id: u8, amount: u8, handler: &mut dyn PeerHandler) -> bool {
        let Some(peer) = self.peers.get(&peer_id) else {
            return false;
        };
        if peer.state() == PeerState::Disconnected {
            return false;
        }
        let address = peer.address();
        info!("disconnecting peer {peer_id}");

        for _ in 0..amount {
            self.send_message(address, Message::DisconnectionRequest { game_id: GAME_ID });
        }
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            peer.set_state(PeerState::Disconnected);
        }
        handler.on_disconnection(peer_id);
        true
    }

    /// Removes every peer marked disconnected from both the ID map and the
    /// address index.
    fn sweep(&mut self) {
        let dead: Vec<u8> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.state() == PeerState::Disconnected)
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            if let Some(peer) = self.peers.remove(&id) {
                self.addr_to_id.remove(&peer.address());
                debug!("removed peer {id}");
            }
        }
    }

    /// Peer maintenance: releases latency-faked messages, drops timed-out
    /// peers, solicits acks with keep-alives, sweeps the disconnected.
    fn update_peers(&mut self, handler: &mut dyn PeerHandler) {
        let now = self.now_ms();

        while let Some((env, from)) = self.fake_latency.pop_ready(now) {
            trace!(
                "latency faker released a {} with sequence {}",
                env.body.name(),
                env.header.seq
            );
            self.process_message(env, from, handler);
        }

        let timeout_ms = self.config.connection_timeout.as_millis() as u64;
        let keepalive_ms = self.config.keepalive_interval.as_millis() as u64;
        let server_sent = u8::from(self.is_server());

        let ids: Vec<u8> = self.peers.keys().copied().collect();
        for id in ids {
            let Some(peer) = self.peers.get(&id) else {
                continue;
            };

            // silence for too long means the other end is gone
            if peer.ms_since_last_recv(now) > timeout_ms {
                debug!("peer {id} timed out");
                self.disconnect_peer(id, DISCONNECT_REDUNDANCY, handler);
            }

            let Some(peer) = self.peers.get_mut(&id) else {
                continue;
            };
            if peer.state() == PeerState::Disconnected {
                continue;
            }

            if peer.ms_since_last_ack(now) > keepalive_ms {
                trace!("sending keep-alive to peer {id} after ack silence");
                peer.enqueue(Envelope::new(Message::KeepAlive {
                    server_sent,
                    timestamp: now,
                }));
                // another one goes out after the same interval if the link
                // stays silent
                peer.touch_ack(now);
            }
        }

        self.sweep();
    }

    /// Drains the socket, parsing every queued datagram.
    fn receive(&mut self, handler: &mut dyn PeerHandler) {
        loop {
            match self.socket.recv_from(&mut self.recv_buf) {
                Ok(None) => break,
                Err(err) => {
                    warn!("socket receive failed: {err}");
                    break;
                }
                Ok(Some((len, from))) => {
                    if self.fake_loss > 0.0 && self.rng.gen::<f32>() <= self.fake_loss {
                        debug!("receive: fake packet loss kicked in");
                        continue;
                    }
                    self.parse_packet(len, from, handler);
                }
            }
        }
    }

    /// Parses one datagram: checksum, acks, then each (header, body) pair
    /// through sequencing and on to [`Peer::process_message`].
    fn parse_packet(&mut self, len: usize, from: SocketAddr, handler: &mut dyn PeerHandler) {
        if len < PacketHeader::WIRE_LEN {
            warn!("received data is smaller than the packet header, discarding");
            return;
        }

        // local copy, so parsing doesn't hold the receive buffer across
        // message processing
        let mut data = [0u8; MAX_PACKET_LEN];
        data[..len].copy_from_slice(&self.recv_buf[..len]);
        let data = &mut data[..len];

        let now = self.now_ms();
        let mut header = PacketHeader::default();
        if header.transfer(&mut Stream::reader(&mut data[..])).is_err() {
            warn!("packet header failed to deserialize, discarding");
            return;
        }
        // discard the whole packet early if it is corrupt
        if !header.is_checksum_valid(data) {
            warn!("packet checksum is invalid, discarding");
            return;
        }
        let mut stream = Stream::reader(data);
        stream.skip(PacketHeader::WIRE_LEN);

        if let Some(&id) = self.addr_to_id.get(&from) {
            if let Some(peer) = self.peers.get_mut(&id) {
                trace!(
                    "acks from peer {id}: sequence {}, bits {:032b}",
                    header.acks.last_recv,
                    header.acks.bits
                );
                peer.process_acks(header.acks, now);
            }
        }

        while !stream.is_full() {
            let mut mh = MessageHeader::default();
            if mh.transfer(&mut stream).is_err() {
                warn!("truncated message header, discarding the rest of the packet");
                return;
            }
            let body_size = usize::from(mh.size);

            // sequencing applies to established peers and sequenced messages
            if let Some(peer) = self
                .addr_to_id
                .get(&from)
                .and_then(|id| self.peers.get_mut(id))
            {
                if peer.state() != PeerState::Disconnected && !mh.is_unsequenced() {
                    if mh.seq.is_newer_than(peer.seq_in()) {
                        trace!("sequence {} is newer than {}", mh.seq, peer.seq_in());
                        peer.set_seq_in(mh.seq);
                        peer.save_received_seq(mh.seq, true);
                    } else {
                        trace!("sequence {} is older than {}", mh.seq, peer.seq_in());
                        if mh.is_ordered() && !mh.is_reliable() {
                            trace!("skipping ordered message with an old sequence");
                            stream.skip(body_size);
                            continue;
                        }
                        if peer.is_duplicate(mh.seq) {
                            trace!("skipping duplicated sequence {}", mh.seq);
                            stream.skip(body_size);
                            continue;
                        }
                        peer.save_received_seq(mh.seq, false);
                    }
                }
            }

            let Some(mut body) = Message::from_id(mh.id) else {
                warn!("received message ID {} is invalid, skipping", mh.id);
                stream.skip(body_size);
                continue;
            };

            let body_start = stream.position();
            let decoded = body.body(&mut stream);
            // realign to the declared size, whatever the decoder consumed
            let consumed = stream.position() - body_start;
            if consumed != body_size {
                debug!(
                    "{} body consumed {consumed} bytes, header declared {body_size}",
                    body.name()
                );
                stream.rewind(consumed);
                stream.skip(body_size);
            }
            if decoded.is_err() {
                warn!("{} failed to deserialize, skipping", body.name());
                continue;
            }

            let env = Envelope {
                header: mh,
                body,
            };
            if self.fake_latency.is_active() {
                trace!("fake latency active, delaying {}", env.body.name());
                self.fake_latency.push(env, from, now);
            } else {
                self.process_message(env, from, handler);

                // unknown senders get one message per packet; a peer that
                // just disconnected needs no further processing
                let done = match self.addr_to_id.get(&from) {
                    None => true,
                    Some(id) => self
                        .peers
                        .get(id)
                        .map_or(true, |peer| peer.state() == PeerState::Disconnected),
                };
                if done {
                    return;
                }
            }
        }
    }

    /// Handles one received message: system messages drive the session state
    /// machine, everything else goes to the embedder.
    fn process_message(&mut self, env: Envelope, from: SocketAddr, handler: &mut dyn PeerHandler) {
        let now = self.now_ms();
        if let Some(peer) = self
            .addr_to_id
            .get(&from)
            .and_then(|id| self.peers.get_mut(id))
        {
            peer.touch_recv(now);
        }

        if !env.header.is_system() {
            handler.on_game_message(&env.body);
            return;
        }

        match env.body {
            Message::Test { value } => {
                info!("received test message containing value {value}");
            }
            Message::DiscoveryRequest { game_id } => self.on_discovery_request(game_id, from),
            Message::DiscoveryAnswer {
                game_id,
                free_slots,
                ..
            } => self.on_discovery_answer(game_id, free_slots, from),
            Message::ConnectionRequest { game_id } => self.on_connection_request(game_id, from),
            Message::ConnectionAnswer {
                assigned_id,
                challenge,
            } => self.on_connection_answer(assigned_id, challenge, from, handler),
            Message::ConnectionSuccess { .. } => self.on_connection_success(handler),
            Message::KeepAlive {
                server_sent,
                timestamp,
            } => self.on_keep_alive(server_sent, timestamp, from),
            Message::DisconnectionRequest { .. } => self.on_disconnection_request(from, handler),
            _ => {
                warn!(
                    "received an unexpected message ({}) with the system flag",
                    env.body.name()
                );
            }
        }
    }

    fn on_discovery_request(&mut self, game_id: u32, from: SocketAddr) {
        if !self.is_server() {
            warn!("client received a DiscoveryRequest");
            return;
        }
        if game_id != GAME_ID {
            debug!("received a DiscoveryRequest for another game");
            return;
        }
        info!("answering a discovery probe from {from}");

        let answer = Message::DiscoveryAnswer {
            game_id: GAME_ID,
            free_slots: self.max_peers.saturating_sub(self.peers.len() as u8),
            total_slots: self.max_peers,
        };
        self.send_message(from, answer);
    }

    fn on_discovery_answer(&mut self, game_id: u32, free_slots: u8, from: SocketAddr) {
        if self.is_server() {
            warn!("server received a DiscoveryAnswer");
            return;
        }
        if game_id != GAME_ID {
            debug!("received a DiscoveryAnswer for another game");
            return;
        }
        if free_slots > 0 {
            info!("found a server at {from}, connecting");
            self.connect_to(from);
        } else {
            info!("found a server at {from}, but it is full");
        }
    }

    fn on_connection_request(&mut self, game_id: u32, from: SocketAddr) {
        if !self.is_server() {
            warn!("client received a ConnectionRequest");
            return;
        }
        // only unknown peers may request a connection
        if self.addr_to_id.contains_key(&from) {
            warn!("received a ConnectionRequest from an already-known peer");
            return;
        }
        if game_id != GAME_ID {
            debug!("received a ConnectionRequest for another game");
            return;
        }
        info!("received a connection request from {from}");

        let assigned_id = self.add_peer(from);
        if assigned_id != UNASSIGNED_ID {
            self.send_to(
                assigned_id,
                Message::ConnectionAnswer {
                    assigned_id,
                    challenge: CHALLENGE_SEED,
                },
            );
        } else {
            // a quick answer telling the client we are full
            self.send_message(
                from,
                Message::ConnectionAnswer {
                    assigned_id: UNASSIGNED_ID,
                    challenge: 0,
                },
            );
        }
    }

    fn on_connection_answer(
        &mut self,
        assigned_id: u8,
        challenge: u32,
        from: SocketAddr,
        handler: &mut dyn PeerHandler,
    ) {
        if self.is_server() {
            let Some(&id) = self.addr_to_id.get(&from) else {
                warn!("received a ConnectionAnswer from an unknown peer");
                return;
            };
            let Some(peer) = self.peers.get(&id) else {
                return;
            };
            if peer.state() != PeerState::Connecting {
                warn!("received a ConnectionAnswer from a non-connecting client");
                return;
            }

            if assigned_id == peer.assigned_id && challenge == CHALLENGE_SEED ^ GAME_ID {
                info!("received a valid ConnectionAnswer from peer {id}");
                self.send_to(id, Message::ConnectionSuccess { game_id: GAME_ID });
                if let Some(peer) = self.peers.get_mut(&id) {
                    peer.set_state(PeerState::Connected);
                }
                handler.on_connection(id);
            } else {
                // wrong ID or challenge response: drop the client
                warn!("peer {id} failed the connection challenge");
                self.disconnect_peer(id, 1, handler);
            }
        } else {
            if self.state != PeerState::Connecting {
                warn!("received a ConnectionAnswer without connecting");
                return;
            }

            if assigned_id != UNASSIGNED_ID {
                info!("server assigned us ID {assigned_id}");
                self.assigned_id = assigned_id;
                self.send_to(
                    SERVER_PEER_ID,
                    Message::ConnectionAnswer {
                        assigned_id,
                        challenge: challenge ^ GAME_ID,
                    },
                );
            } else {
                info!("received a \"server is full\" ConnectionAnswer");
                self.disconnect_all(handler);
            }
        }
    }

    fn on_connection_success(&mut self, handler: &mut dyn PeerHandler) {
        if self.is_server() {
            warn!("server received a ConnectionSuccess");
            return;
        }
        info!("received a ConnectionSuccess, we are connected");
        self.state = PeerState::Connected;
        handler.on_connection(self.assigned_id);
    }

    fn on_keep_alive(&mut self, server_sent: u8, timestamp: u64, from: SocketAddr) {
        let now = self.now_ms();
        let is_server = self.is_server();
        let ours = if is_server {
            server_sent != 0
        } else {
            server_sent == 0
        };

        let Some(peer) = self
            .addr_to_id
            .get(&from)
            .and_then(|id| self.peers.get_mut(id))
        else {
            return;
        };

        if ours {
            // our own keep-alive coming back: the echoed timestamp dates its
            // departure, so the difference is a round trip
            peer.update_rtt(now.saturating_sub(timestamp) as u32);
        } else {
            // the other end is asking us to echo; the flag flips, the
            // timestamp must go back untouched
            peer.enqueue(Envelope::new(Message::KeepAlive {
                server_sent: u8::from(!is_server),
                timestamp,
            }));
        }
    }

    fn on_disconnection_request(&mut self, from: SocketAddr, handler: &mut dyn PeerHandler) {
        if self.is_server() {
            let Some(&id) = self.addr_to_id.get(&from) else {
                warn!("received a DisconnectionRequest from an unknown peer");
                return;
            };
            info!("peer {id} is quitting");
            // no notices back: the other end already left
            self.disconnect_peer(id, 0, handler);
        } else {
            info!("server disconnected us");
            self.disconnect_all(handler);
        }
    }

    /// Flushes pending traffic: one packet per peer whose send interval
    /// elapsed, the oldest unacked reliable first, then pending messages
    /// while they fit under [`MAX_PACKET_LEN`].
    fn send(&mut self) {
        let now = self.now_ms();
        let send_interval = self.config.send_interval_ms();

        let ids: Vec<u8> = self.peers.keys().copied().collect();
        for id in ids {
            let Some(peer) = self.peers.get_mut(&id) else {
                continue;
            };
            if peer.ms_since_last_send(now) < send_interval {
                continue;
            }
            if !peer.has_pending() && !peer.has_reliable_pending() {
                continue;
            }

            let mut packet = Packet::new(Acknowledge {
                last_recv: peer.seq_in(),
                bits: peer.ack_bits(),
            });

            // the oldest ack-pending reliable rides first; it keeps the
            // sequence it was originally stamped with
            if let Some(env) = peer.dequeue_reliable() {
                packet.push(env);
            }

            while let Some(mut env) = peer.dequeue() {
                if packet.wire_len() + env.wire_len() > MAX_PACKET_LEN {
                    // keeps its place for the next packet
                    peer.requeue_front(env);
                    break;
                }
                if env.header.seq == Seq::ZERO {
                    env.header = MessageHeader::describe(&env.body);
                    env.header.seq = peer.next_seq_out();
                }
                packet.push(env);
            }

            if packet.message_count() == 0 {
                continue;
            }
            trace!(
                "sending packet with {} messages to peer {id}",
                packet.message_count()
            );

            let address = peer.address();
            match packet.serialize(&mut self.send_buf) {
                Ok(len) => {
                    if self.fake_loss > 0.0 && self.rng.gen::<f32>() <= self.fake_loss {
                        debug!("send: fake packet loss kicked in");
                        peer.touch_send(now);
                    } else {
                        match self.socket.send_to(address, &self.send_buf[..len]) {
                            Ok(_) => peer.touch_send(now),
                            Err(err) => warn!("socket send to peer {id} failed: {err}"),
                        }
                    }
                }
                Err(err) => error!("packet serialization failed: {err}"),
            }

            // reliables return to the queue with fresh send timestamps
            for env in packet.into_messages() {
                peer.requeue_reliable(env, now);
            }
        }
    }

    /// Sends one message directly to `address`, outside any peer's queues
    /// and sequencing: discovery probes and answers, connection requests,
    /// "server full" answers and disconnection notices.
    fn send_message(&mut self, address: SocketAddr, msg: Message) -> bool {
        trace!("sending direct {} to {address}", msg.name());

        let mut packet = Packet::new(Acknowledge::default());
        packet.push(Envelope::new(msg));

        match packet.serialize(&mut self.send_buf) {
            Ok(len) => {
                if self.fake_loss > 0.0 && self.rng.gen::<f32>() <= self.fake_loss {
                    debug!("send_message: fake packet loss kicked in");
                    // counts as sent; the loss is the point
                    return true;
                }
                match self.socket.send_to(address, &self.send_buf[..len]) {
                    Ok(_) => true,
                    Err(err) => {
                        warn!("direct send to {address} failed: {err}");
                        false
                    }
                }
            }
            Err(err) => {
                error!("packet serialization failed: {err}");
                false
            }
        }
    }
}
