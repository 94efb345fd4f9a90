//! # Peer & Network Loop
//!
//! [`Peer::start`] binds the UDP socket, derives the peer identity, and
//! spawns the single library thread that owns every piece of transport
//! state. The handle talks to the loop through a command channel; released
//! messages come back through the bounded received-message queue.
//!
//! Loop tick: drain commands, run due heartbeats (handshakes every third
//! beat), flush queued unconnected datagrams, then poll the socket for up to
//! 10 ms and route whatever arrived.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use quanta::Instant;
use sha2::{Digest, Sha256};
use slab::Slab;

use crate::buffer::BitBuffer;
use crate::config::PeerConfig;
use crate::connection::{Connection, ConnectionEvent, ConnectionStatus};
use crate::error::{CourierError, Result};
use crate::message::{IncomingKind, IncomingMessage, OutgoingMessage};
use crate::pool::{MessagePool, RecycleHandle};
use crate::queue::{received_queue, ReceivedQueue, ReceivedQueueProducer};
use crate::stats::PeerStatistics;
use crate::wire::{
    parse_datagram, DeliveryMethod, MessageType, NatIntroductionBody, NatPunchBody, WireMessage,
};

const SOCKET_POLL_TIMEOUT: Duration = Duration::from_millis(10);
const REBIND_MIN_INTERVAL: Duration = Duration::from_secs(1);
const SHUTDOWN_LINGER: Duration = Duration::from_secs(2);
const MAX_DATAGRAMS_PER_TICK: usize = 256;

/// Serializes socket binds between peers in this process; rebind races on a
/// shared port otherwise surface as spurious failures.
static BIND_LOCK: Mutex<()> = Mutex::new(());

/// Peer lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerStatus {
    NotRunning = 0,
    Starting = 1,
    Running = 2,
    ShuttingDown = 3,
}

impl PeerStatus {
    fn from_u8(value: u8) -> PeerStatus {
        match value {
            1 => PeerStatus::Starting,
            2 => PeerStatus::Running,
            3 => PeerStatus::ShuttingDown,
            _ => PeerStatus::NotRunning,
        }
    }
}

enum Command {
    Connect {
        remote: SocketAddr,
        hail: Vec<u8>,
    },
    Approve(SocketAddr),
    Deny(SocketAddr, String),
    Send {
        remote: SocketAddr,
        method: DeliveryMethod,
        channel: u8,
        payload: Bytes,
        bit_length: usize,
        receipt: Option<u64>,
    },
    SendUnconnected {
        remote: SocketAddr,
        payload: Bytes,
        bit_length: usize,
    },
    Discover(SocketAddr),
    DiscoveryResponse {
        remote: SocketAddr,
        payload: Bytes,
        bit_length: usize,
    },
    NatIntroduce {
        first: SocketAddr,
        second: SocketAddr,
        token: String,
    },
    Disconnect {
        remote: SocketAddr,
        reason: String,
    },
    Shutdown(String),
}

/// Application handle to a running peer.
///
/// Cheap operations hand commands to the library thread; dropping the handle
/// shuts the peer down gracefully.
pub struct Peer {
    cmd_tx: Sender<Command>,
    queue: ReceivedQueue,
    recycle: RecycleHandle,
    status: Arc<AtomicU8>,
    flush_flag: Arc<AtomicBool>,
    shared_stats: Arc<Mutex<PeerStatistics>>,
    local_addr: SocketAddr,
    peer_id: u64,
    thread: Option<thread::JoinHandle<()>>,
}

impl Peer {
    /// Validate the configuration, bind the socket, and spawn the library
    /// thread.
    pub fn start(config: PeerConfig) -> Result<Peer> {
        config.validate()?;
        let config = Arc::new(config);

        let socket = bind_socket(&config, config.port)?;
        let local_addr = socket.local_addr()?;
        let peer_id = derive_peer_id(local_addr, config.hardware_address);
        if config.enable_upnp {
            tracing::debug!(port = local_addr.port(), "upnp requested; mapping is external");
        }

        let (cmd_tx, cmd_rx) = bounded(4096);
        let (producer, queue) = received_queue(config.received_queue_capacity);
        let status = Arc::new(AtomicU8::new(PeerStatus::Starting as u8));
        let flush_flag = Arc::new(AtomicBool::new(false));
        let shared_stats = Arc::new(Mutex::new(PeerStatistics::new()));

        let pool = MessagePool::new(64);
        let recycle = pool.handle();

        let mut network = NetworkLoop {
            socket,
            config,
            peer_id,
            cmd_rx,
            queue: producer,
            status: status.clone(),
            flush_flag: flush_flag.clone(),
            shared_stats: shared_stats.clone(),
            connections: Slab::new(),
            lookup: HashMap::new(),
            handshakes: HashMap::new(),
            unconnected_out: VecDeque::new(),
            pool,
            stats: PeerStatistics::new(),
            next_fragment_group: 0,
            last_heartbeat: Instant::now(),
            heartbeat_count: 0,
            last_rebind: None,
            recv_buf: vec![0u8; 65536],
        };

        let thread = thread::Builder::new()
            .name("courier-peer".into())
            .spawn(move || network.run())
            .map_err(io::Error::from)?;

        tracing::debug!(%local_addr, peer_id, "peer started");
        Ok(Peer {
            cmd_tx,
            queue,
            recycle,
            status,
            flush_flag,
            shared_stats,
            local_addr,
            peer_id,
            thread: Some(thread),
        })
    }

    pub fn status(&self) -> PeerStatus {
        PeerStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 64-bit identity derived from the bound endpoint and hardware address.
    pub fn peer_id(&self) -> u64 {
        self.peer_id
    }

    /// Consumer half of the received-message queue; clone freely across
    /// threads.
    pub fn messages(&self) -> ReceivedQueue {
        self.queue.clone()
    }

    /// Blocking receive with a deadline.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<IncomingMessage> {
        self.queue.recv_timeout(timeout)
    }

    /// Hand a spent message's buffer back to the loop's pool.
    pub fn recycle(&self, message: IncomingMessage) {
        self.recycle.recycle(message.into_buffer());
    }

    /// Latest statistics snapshot (published each heartbeat).
    pub fn statistics(&self) -> PeerStatistics {
        self.shared_stats.lock().expect("stats lock").clone()
    }

    fn command(&self, command: Command) -> Result<()> {
        if !matches!(self.status(), PeerStatus::Starting | PeerStatus::Running) {
            return Err(CourierError::InvalidState("peer is not running"));
        }
        match self.cmd_tx.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(CourierError::QueueFull),
            Err(TrySendError::Disconnected(_)) => {
                Err(CourierError::InvalidState("network loop has exited"))
            }
        }
    }

    /// Open a connection to `remote`.
    pub fn connect(&self, remote: SocketAddr) -> Result<()> {
        self.connect_with_hail(remote, OutgoingMessage::new())
    }

    /// Open a connection carrying a hail payload in the `Connect`.
    pub fn connect_with_hail(&self, remote: SocketAddr, hail: OutgoingMessage) -> Result<()> {
        let mut buffer = hail.into_buffer();
        buffer.pad_to_byte();
        self.command(Command::Connect {
            remote,
            hail: buffer.as_bytes().to_vec(),
        })
    }

    /// Approve an inbound connect surfaced as `ConnectionApproval`.
    pub fn approve(&self, remote: SocketAddr) -> Result<()> {
        self.command(Command::Approve(remote))
    }

    /// Refuse an inbound connect with a reason.
    pub fn deny(&self, remote: SocketAddr, reason: &str) -> Result<()> {
        self.command(Command::Deny(remote, reason.to_string()))
    }

    /// Queue a message to a connected endpoint.
    pub fn send(
        &self,
        remote: SocketAddr,
        message: OutgoingMessage,
        method: DeliveryMethod,
        channel: u8,
    ) -> Result<()> {
        let receipt = message.receipt();
        let buffer = message.into_buffer();
        self.command(Command::Send {
            remote,
            method,
            channel,
            payload: buffer.freeze(),
            bit_length: buffer.bit_length(),
            receipt,
        })
    }

    /// Fire a datagram at an endpoint with no connection state.
    pub fn send_unconnected(&self, remote: SocketAddr, message: OutgoingMessage) -> Result<()> {
        let buffer = message.into_buffer();
        self.command(Command::SendUnconnected {
            remote,
            payload: buffer.freeze(),
            bit_length: buffer.bit_length(),
        })
    }

    /// Probe a specific endpoint for a discovery response.
    pub fn discover(&self, remote: SocketAddr) -> Result<()> {
        self.command(Command::Discover(remote))
    }

    /// Broadcast a discovery probe on the local network.
    pub fn discover_local(&self, port: u16) -> Result<()> {
        self.command(Command::Discover(SocketAddr::new(
            IpAddr::from([255, 255, 255, 255]),
            port,
        )))
    }

    /// Answer a `DiscoveryRequest`.
    pub fn send_discovery_response(
        &self,
        remote: SocketAddr,
        message: OutgoingMessage,
    ) -> Result<()> {
        let buffer = message.into_buffer();
        self.command(Command::DiscoveryResponse {
            remote,
            payload: buffer.freeze(),
            bit_length: buffer.bit_length(),
        })
    }

    /// Introduce two endpoints to each other for NAT punch-through.
    pub fn nat_introduce(
        &self,
        first: SocketAddr,
        second: SocketAddr,
        token: &str,
    ) -> Result<()> {
        self.command(Command::NatIntroduce {
            first,
            second,
            token: token.to_string(),
        })
    }

    /// Gracefully close one connection.
    pub fn disconnect(&self, remote: SocketAddr, reason: &str) -> Result<()> {
        self.command(Command::Disconnect {
            remote,
            reason: reason.to_string(),
        })
    }

    /// Ask the loop to flush send channels on its next tick.
    pub fn flush_send_queue(&self) {
        self.flush_flag.store(true, Ordering::Release);
    }

    /// Stop the peer: queued disconnects go out in a final heartbeat, the
    /// socket closes within the linger window, and all waiters wake.
    pub fn shutdown(mut self, reason: &str) {
        self.shutdown_inner(reason);
    }

    fn shutdown_inner(&mut self, reason: &str) {
        if self.thread.is_none() {
            return;
        }
        let _ = self.cmd_tx.send(Command::Shutdown(reason.to_string()));
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.shutdown_inner("Peer shut down");
    }
}

// ─── Socket setup ───────────────────────────────────────────────────────────

fn bind_socket(config: &PeerConfig, port: u16) -> Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let _guard = BIND_LOCK.lock().expect("bind lock");
    let bind_addr = SocketAddr::new(config.local_address, port);
    let domain = if bind_addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if bind_addr.is_ipv6() && config.dual_stack {
        socket.set_only_v6(false)?;
    }
    if config.receive_buffer_size > 0 {
        socket.set_recv_buffer_size(config.receive_buffer_size)?;
    }
    if config.send_buffer_size > 0 {
        socket.set_send_buffer_size(config.send_buffer_size)?;
    }
    socket.bind(&bind_addr.into())?;
    socket.set_broadcast(true)?;
    socket.set_read_timeout(Some(SOCKET_POLL_TIMEOUT))?;
    Ok(socket.into())
}

/// Lower 8 bytes of `SHA-256(endpoint-string ‖ hardware-address)`.
fn derive_peer_id(local_addr: SocketAddr, hardware_address: Option<[u8; 6]>) -> u64 {
    let mac = hardware_address.unwrap_or_else(rand::random);
    let mut hasher = Sha256::new();
    hasher.update(local_addr.to_string().as_bytes());
    hasher.update(mac);
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[24..32]);
    u64::from_le_bytes(bytes)
}

// ─── Network loop ───────────────────────────────────────────────────────────

struct NetworkLoop {
    socket: UdpSocket,
    config: Arc<PeerConfig>,
    peer_id: u64,
    cmd_rx: Receiver<Command>,
    queue: ReceivedQueueProducer,
    status: Arc<AtomicU8>,
    flush_flag: Arc<AtomicBool>,
    shared_stats: Arc<Mutex<PeerStatistics>>,
    connections: Slab<Connection>,
    lookup: HashMap<SocketAddr, usize>,
    handshakes: HashMap<SocketAddr, Connection>,
    unconnected_out: VecDeque<(SocketAddr, Bytes)>,
    pool: MessagePool,
    stats: PeerStatistics,
    next_fragment_group: u32,
    last_heartbeat: Instant,
    heartbeat_count: u64,
    last_rebind: Option<Instant>,
    recv_buf: Vec<u8>,
}

impl NetworkLoop {
    fn run(&mut self) {
        self.status.store(PeerStatus::Running as u8, Ordering::Release);
        loop {
            let now = Instant::now();

            if let Some(reason) = self.drain_commands(now) {
                self.status
                    .store(PeerStatus::ShuttingDown as u8, Ordering::Release);
                self.final_heartbeat(&reason);
                break;
            }

            let connection_count = self.connections.len() + self.handshakes.len();
            let max_cps = 250.max(1250usize.saturating_sub(connection_count)) as f64;
            if now.duration_since(self.last_heartbeat) >= Duration::from_secs_f64(1.0 / max_cps) {
                self.heartbeat(now, false);
            }

            self.flush_unconnected();
            self.poll_socket();
        }
        self.status
            .store(PeerStatus::NotRunning as u8, Ordering::Release);
        tracing::debug!("network loop exited");
    }

    // ─── Commands ───────────────────────────────────────────────────────

    /// Returns the shutdown reason once requested.
    fn drain_commands(&mut self, now: Instant) -> Option<String> {
        loop {
            match self.cmd_rx.try_recv() {
                Ok(Command::Shutdown(reason)) => return Some(reason),
                Ok(command) => self.handle_command(command, now),
                Err(TryRecvError::Empty) => return None,
                // Every handle dropped without shutdown; stop anyway.
                Err(TryRecvError::Disconnected) => return Some("Peer shut down".into()),
            }
        }
    }

    fn handle_command(&mut self, command: Command, now: Instant) {
        match command {
            Command::Connect { remote, hail } => {
                if self.lookup.contains_key(&remote) || self.handshakes.contains_key(&remote) {
                    self.deliver_diagnostic(
                        IncomingKind::WarningMessage,
                        Some(remote),
                        "already connecting to this endpoint",
                    );
                    return;
                }
                if self.at_capacity() {
                    self.deliver_diagnostic(
                        IncomingKind::WarningMessage,
                        Some(remote),
                        "connection limit reached",
                    );
                    return;
                }
                let mut connection =
                    Connection::new(remote, self.config.clone(), self.peer_id, now);
                let mut events = Vec::new();
                connection.initiate(hail, now, &mut events);
                self.handshakes.insert(remote, connection);
                self.process_events(remote, events);
            }
            Command::Approve(remote) => {
                let mut events = Vec::new();
                if let Some(connection) = self.handshakes.get_mut(&remote) {
                    connection.approve(now, &mut events);
                }
                self.process_events(remote, events);
            }
            Command::Deny(remote, reason) => {
                let mut events = Vec::new();
                if let Some(connection) = self.handshakes.get_mut(&remote) {
                    connection.deny(&reason, &mut events);
                }
                self.process_events(remote, events);
            }
            Command::Send {
                remote,
                method,
                channel,
                payload,
                bit_length,
                receipt,
            } => {
                let Some(&index) = self.lookup.get(&remote) else {
                    self.deliver_diagnostic(
                        IncomingKind::WarningMessage,
                        Some(remote),
                        "send to unknown connection dropped",
                    );
                    return;
                };
                let connection = &mut self.connections[index];
                if let Err(err) = connection.enqueue_send(
                    method,
                    channel,
                    payload,
                    bit_length,
                    receipt,
                    &mut self.next_fragment_group,
                ) {
                    tracing::warn!(%remote, %err, "rejected outgoing message");
                }
            }
            Command::SendUnconnected {
                remote,
                payload,
                bit_length,
            } => self.queue_unconnected(remote, MessageType::UnconnectedData, payload, bit_length),
            Command::Discover(remote) => {
                self.queue_unconnected(remote, MessageType::Discovery, Bytes::new(), 0)
            }
            Command::DiscoveryResponse {
                remote,
                payload,
                bit_length,
            } => self.queue_unconnected(remote, MessageType::DiscoveryResponse, payload, bit_length),
            Command::NatIntroduce {
                first,
                second,
                token,
            } => {
                for (target, partner) in [(first, second), (second, first)] {
                    let body = NatIntroductionBody {
                        token: token.clone(),
                        partner,
                    }
                    .encode();
                    self.queue_unconnected(
                        target,
                        MessageType::NatIntroduction,
                        body.freeze(),
                        body.bit_length(),
                    );
                }
            }
            Command::Disconnect { remote, reason } => {
                let mut events = Vec::new();
                if let Some(&index) = self.lookup.get(&remote) {
                    self.connections[index].disconnect(&reason, &mut events);
                } else if let Some(connection) = self.handshakes.get_mut(&remote) {
                    connection.disconnect(&reason, &mut events);
                }
                self.process_events(remote, events);
            }
            Command::Shutdown(_) => unreachable!("handled by drain_commands"),
        }
    }

    fn at_capacity(&self) -> bool {
        self.lookup.len() + self.handshakes.len() >= self.config.maximum_connections
    }

    fn queue_unconnected(
        &mut self,
        remote: SocketAddr,
        message_type: MessageType,
        payload: Bytes,
        bit_length: usize,
    ) {
        let msg = WireMessage {
            message_type,
            is_fragment: false,
            sequence: crate::seq::Seq::new(0),
            bit_length: bit_length as u16,
            payload,
        };
        let mut buf = bytes::BytesMut::with_capacity(msg.frame_size());
        msg.encode_into(&mut buf);
        self.unconnected_out.push_back((remote, buf.freeze()));
    }

    // ─── Heartbeat ──────────────────────────────────────────────────────

    fn heartbeat(&mut self, now: Instant, force_handshakes: bool) {
        self.last_heartbeat = now;
        self.heartbeat_count += 1;
        self.pool.reclaim_mailbox();

        let flush = self.config.auto_flush_send_queue || self.flush_flag.swap(false, Ordering::AcqRel);

        // Handshakes churn on a slower cadence than live connections.
        if force_handshakes || self.heartbeat_count % 3 == 0 {
            let endpoints: Vec<SocketAddr> = self.handshakes.keys().copied().collect();
            for remote in endpoints {
                let Some(connection) = self.handshakes.get_mut(&remote) else {
                    continue;
                };
                let mut datagrams = Vec::new();
                let mut events = Vec::new();
                connection.heartbeat(now, flush, &mut datagrams, &mut events);
                for datagram in datagrams {
                    self.send_datagram(remote, &datagram);
                }
                self.process_events(remote, events);
                self.settle_endpoint(remote);
            }
        }

        let indices: Vec<usize> = self.connections.iter().map(|(index, _)| index).collect();
        for index in indices {
            let Some(connection) = self.connections.get_mut(index) else {
                continue;
            };
            let remote = connection.remote();
            let mut datagrams = Vec::new();
            let mut events = Vec::new();
            connection.heartbeat(now, flush, &mut datagrams, &mut events);
            for datagram in datagrams {
                self.send_datagram(remote, &datagram);
            }
            self.process_events(remote, events);
            self.settle_endpoint(remote);
        }

        self.publish_stats();
    }

    /// Promote a finished handshake or drop a dead connection.
    fn settle_endpoint(&mut self, remote: SocketAddr) {
        if let Some(connection) = self.handshakes.get(&remote) {
            match connection.status() {
                ConnectionStatus::Connected => {
                    let connection = self.handshakes.remove(&remote).expect("checked above");
                    let index = self.connections.insert(connection);
                    self.lookup.insert(remote, index);
                }
                ConnectionStatus::Disconnected => {
                    self.handshakes.remove(&remote);
                }
                _ => {}
            }
            return;
        }
        if let Some(&index) = self.lookup.get(&remote) {
            if self.connections[index].status() == ConnectionStatus::Disconnected {
                self.connections.remove(index);
                self.lookup.remove(&remote);
            }
        }
    }

    fn flush_unconnected(&mut self) {
        while let Some((remote, datagram)) = self.unconnected_out.pop_front() {
            self.send_datagram(remote, &datagram);
        }
    }

    fn send_datagram(&mut self, remote: SocketAddr, datagram: &[u8]) {
        match self.socket.send_to(datagram, remote) {
            Ok(sent) => {
                self.stats.sent_packets += 1;
                self.stats.sent_bytes += sent as u64;
            }
            Err(err) => {
                tracing::warn!(%remote, %err, "send failed");
            }
        }
    }

    fn publish_stats(&self) {
        if let Ok(mut shared) = self.shared_stats.lock() {
            *shared = self.stats.clone();
        }
    }

    // ─── Socket receive & routing ───────────────────────────────────────

    fn poll_socket(&mut self) {
        for _ in 0..MAX_DATAGRAMS_PER_TICK {
            match self.socket.recv_from(&mut self.recv_buf) {
                Ok((len, sender)) => {
                    let datagram = Bytes::copy_from_slice(&self.recv_buf[..len]);
                    self.route(datagram, sender, Instant::now());
                }
                Err(err) => {
                    match err.kind() {
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {}
                        io::ErrorKind::ConnectionReset => {
                            // The sender address cannot be trusted to name
                            // which connection reset; drop and move on.
                            self.stats.connection_resets += 1;
                            tracing::debug!("connection reset on receive");
                            continue;
                        }
                        io::ErrorKind::NotConnected => {
                            self.try_rebind();
                        }
                        _ => {
                            tracing::warn!(%err, "socket receive error");
                        }
                    }
                    return;
                }
            }
        }
    }

    fn try_rebind(&mut self) {
        let now = Instant::now();
        if self
            .last_rebind
            .is_some_and(|t| now.duration_since(t) < REBIND_MIN_INTERVAL)
        {
            return;
        }
        self.last_rebind = Some(now);
        self.stats.rebinds += 1;
        match bind_socket(&self.config, self.socket.local_addr().map(|a| a.port()).unwrap_or(0)) {
            Ok(socket) => {
                tracing::warn!("socket rebound after NotConnected");
                self.socket = socket;
            }
            Err(err) => tracing::warn!(%err, "socket rebind failed"),
        }
    }

    fn route(&mut self, datagram: Bytes, sender: SocketAddr, now: Instant) {
        self.stats.received_packets += 1;
        self.stats.received_bytes += datagram.len() as u64;

        let parsed = match parse_datagram(datagram) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.stats.malformed_packets += 1;
                tracing::warn!(%sender, %err, "rejecting malformed datagram");
                return;
            }
        };
        self.stats.dropped_wire_messages += parsed.skipped as u64;
        self.stats.received_messages += parsed.messages.len() as u64;

        for msg in parsed.messages {
            if matches!(
                msg.message_type,
                MessageType::UnconnectedData
                    | MessageType::Discovery
                    | MessageType::DiscoveryResponse
                    | MessageType::NatIntroduction
                    | MessageType::NatPunchMessage
            ) {
                self.handle_unconnected(&msg, sender);
                continue;
            }

            if let Some(&index) = self.lookup.get(&sender) {
                let mut events = Vec::new();
                {
                    let connection = &mut self.connections[index];
                    connection.note_heard(now);
                    connection.handle_message(&msg, now, &mut events);
                }
                self.process_events(sender, events);
                self.settle_endpoint(sender);
            } else if self.handshakes.contains_key(&sender) {
                let mut events = Vec::new();
                {
                    let connection = self.handshakes.get_mut(&sender).expect("checked above");
                    connection.note_heard(now);
                    connection.handle_message(&msg, now, &mut events);
                }
                self.process_events(sender, events);
                self.settle_endpoint(sender);
            } else {
                self.route_unknown(&msg, sender, now);
            }
        }
    }

    /// A message from an endpoint in neither map.
    fn route_unknown(&mut self, msg: &WireMessage, sender: SocketAddr, now: Instant) {
        match msg.message_type {
            MessageType::Connect => self.inbound_connect(msg, sender, now),
            // NAT port remap: the response comes from a different port than
            // the one we dialed. Rekey the pending handshake first.
            MessageType::ConnectResponse => {
                let remapped = self.handshakes.iter().find_map(|(&addr, connection)| {
                    (addr.ip() == sender.ip()
                        && addr.port() != sender.port()
                        && connection.status() == ConnectionStatus::InitiatedConnect)
                        .then_some(addr)
                });
                let Some(old_addr) = remapped else {
                    tracing::debug!(%sender, "connect response from unknown endpoint");
                    return;
                };
                tracing::debug!(%old_addr, %sender, "handshake endpoint remapped");
                let mut connection = self.handshakes.remove(&old_addr).expect("found above");
                connection.set_remote(sender);
                self.handshakes.insert(sender, connection);

                let mut events = Vec::new();
                {
                    let connection = self.handshakes.get_mut(&sender).expect("inserted above");
                    connection.note_heard(now);
                    connection.handle_message(msg, now, &mut events);
                }
                self.process_events(sender, events);
                self.settle_endpoint(sender);
            }
            _ => {
                tracing::debug!(%sender, ?msg.message_type, "message from unknown endpoint dropped");
            }
        }
    }

    fn inbound_connect(&mut self, msg: &WireMessage, sender: SocketAddr, now: Instant) {
        if !self.config.accept_incoming_connections {
            self.stats.rejected_handshakes += 1;
            self.refuse(sender, "Connections not accepted");
            return;
        }
        if self.at_capacity() {
            self.stats.rejected_handshakes += 1;
            self.refuse(sender, "Server full");
            return;
        }
        let mut connection = Connection::new(sender, self.config.clone(), self.peer_id, now);
        connection.note_heard(now);
        let mut events = Vec::new();
        connection.handle_message(msg, now, &mut events);
        self.handshakes.insert(sender, connection);
        self.process_events(sender, events);
    }

    /// Send a bare `Disconnect` without creating any state.
    fn refuse(&mut self, remote: SocketAddr, reason: &str) {
        let body = crate::wire::DisconnectBody {
            reason: reason.into(),
        }
        .encode();
        let msg = WireMessage::library(MessageType::Disconnect, &body);
        let mut buf = bytes::BytesMut::with_capacity(msg.frame_size());
        msg.encode_into(&mut buf);
        self.unconnected_out.push_back((remote, buf.freeze()));
    }

    // ─── Unconnected handling ───────────────────────────────────────────

    fn handle_unconnected(&mut self, msg: &WireMessage, sender: SocketAddr) {
        match msg.message_type {
            MessageType::UnconnectedData => {
                self.deliver_payload(IncomingKind::UnconnectedData, sender, msg, None, None);
            }
            MessageType::Discovery => {
                self.deliver_payload(IncomingKind::DiscoveryRequest, sender, msg, None, None);
            }
            MessageType::DiscoveryResponse => {
                self.deliver_payload(IncomingKind::DiscoveryResponse, sender, msg, None, None);
            }
            MessageType::NatIntroduction => {
                let Ok(body) = NatIntroductionBody::decode(&mut msg.reader()) else {
                    return;
                };
                tracing::debug!(partner = %body.partner, "sending nat punch");
                let punch = NatPunchBody { token: body.token }.encode();
                let punch_msg = WireMessage::library(MessageType::NatPunchMessage, &punch);
                let mut buf = bytes::BytesMut::with_capacity(punch_msg.frame_size());
                punch_msg.encode_into(&mut buf);
                self.unconnected_out.push_back((body.partner, buf.freeze()));
            }
            MessageType::NatPunchMessage => {
                let Ok(body) = NatPunchBody::decode(&mut msg.reader()) else {
                    return;
                };
                if self
                    .config
                    .enabled_message_types
                    .contains(IncomingKind::NatIntroductionSuccess)
                {
                    let mut data = self.pool.rent(body.token.len() + 5);
                    data.write_string(&body.token);
                    self.offer(IncomingMessage::library(
                        IncomingKind::NatIntroductionSuccess,
                        Some(sender),
                        data,
                    ));
                }
            }
            _ => {}
        }
    }

    // ─── Delivery to the application ────────────────────────────────────

    fn process_events(&mut self, remote: SocketAddr, events: Vec<ConnectionEvent>) {
        for event in events {
            match event {
                ConnectionEvent::StatusChanged { status, reason } => {
                    tracing::debug!(%remote, ?status, reason, "status changed");
                    if self
                        .config
                        .enabled_message_types
                        .contains(IncomingKind::StatusChanged)
                    {
                        let mut data = self.pool.rent(reason.len() + 6);
                        data.write_u8(status.to_byte());
                        data.write_string(&reason);
                        self.offer(IncomingMessage::library(
                            IncomingKind::StatusChanged,
                            Some(remote),
                            data,
                        ));
                    }
                }
                ConnectionEvent::Data {
                    method,
                    channel,
                    sequence,
                    payload,
                    bit_length,
                } => {
                    if !self.config.enabled_message_types.contains(IncomingKind::Data) {
                        self.stats.dropped_incoming += 1;
                        continue;
                    }
                    let data = self.buffer_from_payload(&payload, bit_length);
                    let message = IncomingMessage {
                        kind: IncomingKind::Data,
                        sender: Some(remote),
                        sequence: Some(sequence.value()),
                        delivery: Some((method, channel)),
                        receive_time: Instant::now(),
                        data,
                    };
                    self.offer(message);
                }
                ConnectionEvent::Receipt(tag) => {
                    self.stats.receipts += 1;
                    if self
                        .config
                        .enabled_message_types
                        .contains(IncomingKind::Receipt)
                    {
                        let mut data = self.pool.rent(10);
                        data.write_var_u64(tag);
                        self.offer(IncomingMessage::library(
                            IncomingKind::Receipt,
                            Some(remote),
                            data,
                        ));
                    }
                }
                ConnectionEvent::ApprovalNeeded { hail } => {
                    if self
                        .config
                        .enabled_message_types
                        .contains(IncomingKind::ConnectionApproval)
                    {
                        let mut data = self.pool.rent(hail.len().max(1));
                        data.write_bytes(&hail);
                        self.offer(IncomingMessage::library(
                            IncomingKind::ConnectionApproval,
                            Some(remote),
                            data,
                        ));
                    }
                }
                ConnectionEvent::RemoteLibraryError(text) => {
                    self.deliver_diagnostic(IncomingKind::Error, Some(remote), &text);
                }
            }
        }
    }

    fn deliver_payload(
        &mut self,
        kind: IncomingKind,
        sender: SocketAddr,
        msg: &WireMessage,
        sequence: Option<u16>,
        delivery: Option<(DeliveryMethod, u8)>,
    ) {
        if !self.config.enabled_message_types.contains(kind) {
            self.stats.dropped_incoming += 1;
            return;
        }
        let data = self.buffer_from_payload(&msg.payload, usize::from(msg.bit_length));
        self.offer(IncomingMessage {
            kind,
            sender: Some(sender),
            sequence,
            delivery,
            receive_time: Instant::now(),
            data,
        });
    }

    fn deliver_diagnostic(&mut self, kind: IncomingKind, sender: Option<SocketAddr>, text: &str) {
        if !self.config.enabled_message_types.contains(kind) {
            return;
        }
        let mut data = self.pool.rent(text.len() + 5);
        data.write_string(text);
        self.offer(IncomingMessage::library(kind, sender, data));
    }

    fn buffer_from_payload(&mut self, payload: &[u8], bit_length: usize) -> BitBuffer {
        let mut buf = self.pool.rent(payload.len().max(1));
        let whole = bit_length / 8;
        let rem = (bit_length % 8) as u32;
        buf.write_bytes(&payload[..whole]);
        if rem > 0 {
            buf.write_bits(u64::from(payload[whole]), rem);
        }
        buf
    }

    fn offer(&mut self, message: IncomingMessage) {
        if !self.queue.offer(message) {
            self.stats.dropped_incoming += 1;
        }
    }

    // ─── Shutdown ───────────────────────────────────────────────────────

    fn final_heartbeat(&mut self, reason: &str) {
        tracing::debug!(reason, "shutting down");
        let now = Instant::now();

        let endpoints: Vec<SocketAddr> = self.handshakes.keys().copied().collect();
        for remote in endpoints {
            let mut events = Vec::new();
            if let Some(connection) = self.handshakes.get_mut(&remote) {
                connection.disconnect(reason, &mut events);
            }
            self.process_events(remote, events);
        }
        let indices: Vec<usize> = self.connections.iter().map(|(index, _)| index).collect();
        for index in &indices {
            let mut events = Vec::new();
            self.connections[*index].disconnect(reason, &mut events);
            let remote = self.connections[*index].remote();
            self.process_events(remote, events);
        }

        // One forced-flush heartbeat: queued reliable data, then goodbyes.
        self.flush_flag.store(true, Ordering::Release);
        self.heartbeat(now, true);
        self.flush_unconnected();

        // Hold the socket open briefly for stragglers, then close.
        let deadline = Instant::now() + SHUTDOWN_LINGER;
        while Instant::now() < deadline {
            match self.socket.recv_from(&mut self.recv_buf) {
                Ok(_) => continue,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    break;
                }
                Err(_) => break,
            }
        }
        self.publish_stats();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_is_stable_for_fixed_inputs() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let mac = Some([1, 2, 3, 4, 5, 6]);
        assert_eq!(derive_peer_id(addr, mac), derive_peer_id(addr, mac));
    }

    #[test]
    fn peer_id_differs_by_endpoint_and_mac() {
        let a: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let b: SocketAddr = "10.0.0.1:9001".parse().unwrap();
        let mac = Some([1, 2, 3, 4, 5, 6]);
        assert_ne!(derive_peer_id(a, mac), derive_peer_id(b, mac));
        assert_ne!(
            derive_peer_id(a, mac),
            derive_peer_id(a, Some([6, 5, 4, 3, 2, 1]))
        );
    }

    #[test]
    fn start_and_shutdown() {
        let mut config = PeerConfig::new("peer-test");
        config.local_address = "127.0.0.1".parse().unwrap();
        let peer = Peer::start(config).unwrap();
        assert_ne!(peer.local_addr().port(), 0);

        // Status settles to Running once the loop thread is up.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while peer.status() != PeerStatus::Running && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(peer.status(), PeerStatus::Running);
        peer.shutdown("done");
    }

    #[test]
    fn queue_wakes_after_shutdown() {
        let mut config = PeerConfig::new("peer-test");
        config.local_address = "127.0.0.1".parse().unwrap();
        let peer = Peer::start(config).unwrap();
        let queue = peer.messages();
        peer.shutdown("bye");
        assert!(queue.recv_timeout(Duration::from_millis(50)).is_none());
    }

    #[test]
    fn invalid_config_rejected_at_start() {
        assert!(Peer::start(PeerConfig::default()).is_err());
    }
}
