//! # Connection State Machine
//!
//! Pure logic — no I/O. A connection tracks the handshake, keepalive, RTT,
//! MTU expansion, and the send/receive channel tables for one remote
//! endpoint. The network loop feeds it parsed messages and drives its
//! heartbeat; the connection replies with ready-to-send datagrams and
//! events.
//!
//! ```text
//!  None ──connect()──▶ InitiatedConnect ──ConnectResponse──▶ Connected
//!  None ──Connect──▶ ReceivedInitiation ─┬─▶ RespondedConnect ──ConnectionEstablished──▶ Connected
//!                                        └─▶ RespondedAwaitingApproval ──approve()──▶ RespondedConnect
//!  any ──Disconnect / timeout──▶ Disconnecting ──▶ Disconnected
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use quanta::Instant;

use crate::config::PeerConfig;
use crate::error::Result;
use crate::fragment::{self, FragmentAssembler};
use crate::receiver::{ReceiveChannel, Released};
use crate::sender::{QueuedMessage, SendChannel, SendSignal};
use crate::seq::Seq;
use crate::stats::{ConnectionStatistics, Ewma};
use crate::wire::{
    encode_acks, decode_acks, ConnectBody, ConnectResponseBody, DatagramPacker, DeliveryMethod,
    DisconnectBody, MessageType, MtuProbeBody, PingBody, WireMessage, HEADER_SIZE,
};

const RTT_ALPHA: f64 = 0.25;
const MTU_PROBE_INTERVAL: Duration = Duration::from_millis(500);
const MTU_PROBE_ATTEMPTS: u32 = 3;

/// Lifecycle of a connection, surfaced through `StatusChanged` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionStatus {
    None = 0,
    InitiatedConnect = 1,
    ReceivedInitiation = 2,
    RespondedAwaitingApproval = 3,
    RespondedConnect = 4,
    Connected = 5,
    Disconnecting = 6,
    Disconnected = 7,
}

impl ConnectionStatus {
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(value: u8) -> Option<Self> {
        Some(match value {
            0 => ConnectionStatus::None,
            1 => ConnectionStatus::InitiatedConnect,
            2 => ConnectionStatus::ReceivedInitiation,
            3 => ConnectionStatus::RespondedAwaitingApproval,
            4 => ConnectionStatus::RespondedConnect,
            5 => ConnectionStatus::Connected,
            6 => ConnectionStatus::Disconnecting,
            7 => ConnectionStatus::Disconnected,
            _ => return None,
        })
    }
}

/// Events a connection hands back to the network loop.
#[derive(Debug)]
pub enum ConnectionEvent {
    StatusChanged {
        status: ConnectionStatus,
        reason: String,
    },
    /// Application data released by a receive channel (fragments already
    /// reassembled).
    Data {
        method: DeliveryMethod,
        channel: u8,
        sequence: Seq,
        payload: Bytes,
        bit_length: usize,
    },
    /// A receipt-tagged reliable message was fully acknowledged.
    Receipt(u64),
    /// An inbound connect awaits `approve`/`deny`; payload is the hail.
    ApprovalNeeded { hail: Vec<u8> },
    /// The remote peer reported a library-level failure.
    RemoteLibraryError(String),
}

#[derive(Debug)]
struct MtuProbe {
    try_size: usize,
    attempts: u32,
    next_send: Instant,
    finalized: bool,
}

/// Per-endpoint transport state.
pub struct Connection {
    remote: SocketAddr,
    status: ConnectionStatus,
    config: Arc<PeerConfig>,
    local_peer_id: u64,
    remote_peer_id: u64,

    send_channels: HashMap<(DeliveryMethod, u8), SendChannel>,
    receive_channels: HashMap<(DeliveryMethod, u8), ReceiveChannel>,
    ack_queue: Vec<(u8, Seq)>,
    control_out: Vec<WireMessage>,
    assembler: FragmentAssembler,

    rtt: Ewma,
    current_mtu: usize,
    mtu_probe: Option<MtuProbe>,

    created_at: Instant,
    last_heard: Instant,
    last_ping_sent: Instant,
    last_fragment_sweep: Instant,
    last_handshake_send: Option<Instant>,
    handshake_sends: u32,
    outgoing_hail: Vec<u8>,

    stats: ConnectionStatistics,
}

impl Connection {
    pub fn new(remote: SocketAddr, config: Arc<PeerConfig>, local_peer_id: u64, now: Instant) -> Self {
        let current_mtu = config.default_mtu;
        Connection {
            remote,
            status: ConnectionStatus::None,
            config,
            local_peer_id,
            remote_peer_id: 0,
            send_channels: HashMap::new(),
            receive_channels: HashMap::new(),
            ack_queue: Vec::new(),
            control_out: Vec::new(),
            assembler: FragmentAssembler::new(),
            rtt: Ewma::new(RTT_ALPHA),
            current_mtu,
            mtu_probe: None,
            created_at: now,
            last_heard: now,
            last_ping_sent: now,
            last_fragment_sweep: now,
            last_handshake_send: None,
            handshake_sends: 0,
            outgoing_hail: Vec::new(),
            stats: ConnectionStatistics::default(),
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Rekey after a NAT port remap; the loop updates its maps in step.
    pub fn set_remote(&mut self, remote: SocketAddr) {
        self.remote = remote;
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn remote_peer_id(&self) -> u64 {
        self.remote_peer_id
    }

    /// Smoothed round-trip estimate; zero until the first sample.
    pub fn rtt(&self) -> Duration {
        Duration::from_secs_f64(self.rtt.value().max(0.0))
    }

    pub fn current_mtu(&self) -> usize {
        self.current_mtu
    }

    /// Messages not yet on the wire plus reliable in-flight.
    pub fn pending_sends(&self) -> usize {
        self.control_out.len() + self.send_channels.values().map(SendChannel::pending).sum::<usize>()
    }

    pub fn statistics(&self) -> ConnectionStatistics {
        let mut stats = self.stats.clone();
        for channel in self.receive_channels.values() {
            match channel {
                ReceiveChannel::Ordered(rx) => {
                    stats.duplicates += rx.duplicates;
                    stats.too_early += rx.too_early;
                    stats.withheld += rx.withheld_count() as u64;
                }
                ReceiveChannel::Unordered(rx) => {
                    stats.duplicates += rx.duplicates;
                    stats.too_early += rx.too_early;
                }
                ReceiveChannel::Sequenced(rx) => stats.duplicates += rx.stale,
                ReceiveChannel::Unreliable => {}
            }
        }
        for channel in self.send_channels.values() {
            if let SendChannel::Reliable(tx) = channel {
                stats.resent_messages += tx.resent;
            }
        }
        stats.rtt_seconds = self.rtt.value();
        stats.mtu = self.current_mtu as u32;
        stats
    }

    fn set_status(&mut self, status: ConnectionStatus, reason: &str, events: &mut Vec<ConnectionEvent>) {
        if self.status == status {
            return;
        }
        tracing::debug!(remote = %self.remote, ?status, reason, "connection status");
        self.status = status;
        events.push(ConnectionEvent::StatusChanged {
            status,
            reason: reason.to_string(),
        });
    }

    fn timestamp_us(&self, now: Instant) -> u64 {
        now.duration_since(self.created_at).as_micros() as u64
    }

    fn queue_control(&mut self, message_type: MessageType, body: &crate::buffer::BitBuffer) {
        self.control_out.push(WireMessage::library(message_type, body));
    }

    // ─── Handshake ──────────────────────────────────────────────────────

    /// Start an outbound handshake.
    pub fn initiate(&mut self, hail: Vec<u8>, now: Instant, events: &mut Vec<ConnectionEvent>) {
        self.outgoing_hail = hail;
        self.set_status(ConnectionStatus::InitiatedConnect, "connecting", events);
        self.send_connect(now);
    }

    fn send_connect(&mut self, now: Instant) {
        let body = ConnectBody {
            app_identifier: self.config.app_identifier.clone(),
            peer_id: self.local_peer_id,
            hail: self.outgoing_hail.clone(),
        }
        .encode();
        self.queue_control(MessageType::Connect, &body);
        self.last_handshake_send = Some(now);
        self.handshake_sends += 1;
    }

    fn send_connect_response(&mut self, now: Instant) {
        let body = ConnectResponseBody {
            app_identifier: self.config.app_identifier.clone(),
            peer_id: self.local_peer_id,
        }
        .encode();
        self.queue_control(MessageType::ConnectResponse, &body);
        self.last_handshake_send = Some(now);
        self.handshake_sends += 1;
    }

    /// Approve a pending inbound connect.
    pub fn approve(&mut self, now: Instant, events: &mut Vec<ConnectionEvent>) {
        if self.status == ConnectionStatus::RespondedAwaitingApproval
            || self.status == ConnectionStatus::ReceivedInitiation
        {
            self.handshake_sends = 0;
            self.set_status(ConnectionStatus::RespondedConnect, "approved", events);
            self.send_connect_response(now);
        }
    }

    /// Refuse a pending inbound connect.
    pub fn deny(&mut self, reason: &str, events: &mut Vec<ConnectionEvent>) {
        self.queue_control(MessageType::Disconnect, &DisconnectBody { reason: reason.into() }.encode());
        self.set_status(ConnectionStatus::Disconnecting, reason, events);
    }

    /// Begin a graceful disconnect; the final heartbeat flushes the goodbye.
    pub fn disconnect(&mut self, reason: &str, events: &mut Vec<ConnectionEvent>) {
        if matches!(
            self.status,
            ConnectionStatus::Disconnecting | ConnectionStatus::Disconnected
        ) {
            return;
        }
        self.queue_control(MessageType::Disconnect, &DisconnectBody { reason: reason.into() }.encode());
        self.set_status(ConnectionStatus::Disconnecting, reason, events);
    }

    // ─── Inbound ────────────────────────────────────────────────────────

    /// Note traffic from the remote, deferring timeout.
    pub fn note_heard(&mut self, now: Instant) {
        self.last_heard = now;
    }

    /// Feed one parsed message from this connection's endpoint.
    pub fn handle_message(&mut self, msg: &WireMessage, now: Instant, events: &mut Vec<ConnectionEvent>) {
        match msg.message_type {
            MessageType::Data(method, channel) => self.handle_data(msg, method, channel, now, events),
            MessageType::Connect => self.handle_connect(msg, now, events),
            MessageType::ConnectResponse => self.handle_connect_response(msg, now, events),
            MessageType::ConnectionEstablished => {
                if self.status == ConnectionStatus::RespondedConnect {
                    self.set_status(ConnectionStatus::Connected, "connected", events);
                    self.start_mtu_expansion(now);
                }
            }
            MessageType::Disconnect => {
                let reason = DisconnectBody::decode(&mut msg.reader())
                    .map(|d| d.reason)
                    .unwrap_or_else(|_| "disconnected".to_string());
                self.set_status(ConnectionStatus::Disconnected, &reason, events);
            }
            MessageType::Ping => {
                if let Ok(ping) = PingBody::decode(&mut msg.reader()) {
                    self.queue_control(MessageType::Pong, &ping.encode());
                }
            }
            MessageType::Pong => {
                if let Ok(pong) = PingBody::decode(&mut msg.reader()) {
                    let now_us = self.timestamp_us(now);
                    if now_us >= pong.timestamp_us {
                        let sample = (now_us - pong.timestamp_us) as f64 / 1e6;
                        self.rtt.update(sample);
                    }
                }
            }
            MessageType::Ack => {
                if let Ok(entries) = decode_acks(msg) {
                    self.handle_acks(&entries, events);
                }
            }
            MessageType::ExpandMtuRequest => {
                if let Ok(probe) = MtuProbeBody::decode(&mut msg.reader()) {
                    let size = probe.size as usize;
                    // A datagram this large made it here, so the path fits it.
                    if size > self.current_mtu && size <= self.config.maximum_mtu {
                        self.current_mtu = size;
                    }
                    self.queue_control(MessageType::ExpandMtuSuccess, &probe.encode(0));
                }
            }
            MessageType::ExpandMtuSuccess => {
                if let Ok(probe) = MtuProbeBody::decode(&mut msg.reader()) {
                    self.handle_mtu_success(probe.size as usize, now);
                }
            }
            MessageType::LibraryError => {
                let text = msg
                    .reader()
                    .read_string()
                    .unwrap_or_else(|_| "remote library error".to_string());
                events.push(ConnectionEvent::RemoteLibraryError(text));
            }
            // Unconnected traffic is routed before connections see it.
            MessageType::UnconnectedData
            | MessageType::Discovery
            | MessageType::DiscoveryResponse
            | MessageType::NatIntroduction
            | MessageType::NatPunchMessage => {}
        }
    }

    fn handle_connect(&mut self, msg: &WireMessage, now: Instant, events: &mut Vec<ConnectionEvent>) {
        match self.status {
            ConnectionStatus::None | ConnectionStatus::ReceivedInitiation => {
                let body = match ConnectBody::decode(&mut msg.reader()) {
                    Ok(body) => body,
                    Err(_) => return,
                };
                if body.app_identifier != self.config.app_identifier {
                    self.deny("Wrong application identifier", events);
                    return;
                }
                self.remote_peer_id = body.peer_id;
                self.set_status(ConnectionStatus::ReceivedInitiation, "connect received", events);
                if self.config.enabled_message_types.contains(crate::message::IncomingKind::ConnectionApproval) {
                    self.set_status(
                        ConnectionStatus::RespondedAwaitingApproval,
                        "awaiting approval",
                        events,
                    );
                    events.push(ConnectionEvent::ApprovalNeeded { hail: body.hail });
                } else {
                    self.handshake_sends = 0;
                    self.set_status(ConnectionStatus::RespondedConnect, "responding", events);
                    self.send_connect_response(now);
                }
            }
            // Response was lost; answer the duplicate connect again.
            ConnectionStatus::RespondedConnect | ConnectionStatus::Connected => {
                self.send_connect_response(now);
            }
            _ => {}
        }
    }

    fn handle_connect_response(&mut self, msg: &WireMessage, now: Instant, events: &mut Vec<ConnectionEvent>) {
        match self.status {
            ConnectionStatus::InitiatedConnect => {
                let body = match ConnectResponseBody::decode(&mut msg.reader()) {
                    Ok(body) => body,
                    Err(_) => return,
                };
                if body.app_identifier != self.config.app_identifier {
                    self.disconnect("Wrong application identifier", events);
                    return;
                }
                self.remote_peer_id = body.peer_id;
                self.queue_control(
                    MessageType::ConnectionEstablished,
                    &crate::buffer::BitBuffer::new(),
                );
                self.set_status(ConnectionStatus::Connected, "connected", events);
                self.start_mtu_expansion(now);
            }
            // The established ack was lost; repeat it.
            ConnectionStatus::Connected => {
                self.queue_control(
                    MessageType::ConnectionEstablished,
                    &crate::buffer::BitBuffer::new(),
                );
            }
            _ => {}
        }
    }

    fn handle_acks(&mut self, entries: &[(u8, Seq)], events: &mut Vec<ConnectionEvent>) {
        let mut signals = Vec::new();
        for &(code, sequence) in entries {
            let Ok(MessageType::Data(method, channel)) = MessageType::from_byte(code) else {
                continue;
            };
            if let Some(tx) = self.send_channels.get_mut(&(method, channel)) {
                tx.acknowledge(sequence, &mut signals);
            }
        }
        self.drain_signals(signals, events);
    }

    fn drain_signals(&mut self, signals: Vec<SendSignal>, events: &mut Vec<ConnectionEvent>) {
        for signal in signals {
            match signal {
                SendSignal::Receipt(tag) => events.push(ConnectionEvent::Receipt(tag)),
                SendSignal::Timeout(sequence) => {
                    tracing::warn!(
                        remote = %self.remote,
                        sequence = sequence.value(),
                        "reliable message exhausted retransmits"
                    );
                    self.queue_control(
                        MessageType::Disconnect,
                        &DisconnectBody {
                            reason: "Connection timed out".into(),
                        }
                        .encode(),
                    );
                    self.set_status(ConnectionStatus::Disconnecting, "Connection timed out", events);
                }
            }
        }
    }

    fn handle_data(
        &mut self,
        msg: &WireMessage,
        method: DeliveryMethod,
        channel: u8,
        now: Instant,
        events: &mut Vec<ConnectionEvent>,
    ) {
        if self.status != ConnectionStatus::Connected {
            return;
        }
        self.stats.received_messages += 1;
        if method.is_reliable() {
            self.ack_queue.push((msg.message_type.to_byte(), msg.sequence));
        }

        let window = self.config.window_size;
        let rx = self
            .receive_channels
            .entry((method, channel))
            .or_insert_with(|| ReceiveChannel::new(method, window));

        let mut released = Vec::new();
        rx.receive(
            Released {
                sequence: msg.sequence,
                payload: msg.payload.clone(),
                bit_length: msg.bit_length,
                is_fragment: msg.is_fragment,
            },
            &mut released,
        );

        for item in released {
            if item.is_fragment {
                match self
                    .assembler
                    .receive(&item.payload, usize::from(item.bit_length), now)
                {
                    Ok(Some((payload, bit_length))) => events.push(ConnectionEvent::Data {
                        method,
                        channel,
                        sequence: item.sequence,
                        payload,
                        bit_length,
                    }),
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(remote = %self.remote, %err, "dropping bad fragment");
                    }
                }
            } else {
                events.push(ConnectionEvent::Data {
                    method,
                    channel,
                    sequence: item.sequence,
                    payload: item.payload,
                    bit_length: usize::from(item.bit_length),
                });
            }
        }
    }

    // ─── Outbound ───────────────────────────────────────────────────────

    /// Queue application data, fragmenting when it exceeds the MTU.
    /// `next_group_id` is the peer-wide fragment group counter.
    pub fn enqueue_send(
        &mut self,
        method: DeliveryMethod,
        channel: u8,
        payload: Bytes,
        bit_length: usize,
        receipt: Option<u64>,
        next_group_id: &mut u32,
    ) -> Result<()> {
        MessageType::data(method, channel)?;
        let window = self.config.window_size;
        let resend_base = self.config.resend_base_delay;
        let max_retransmits = self.config.max_retransmits;
        let tx = match self.send_channels.entry((method, channel)) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => e.insert(SendChannel::new(
                method,
                channel,
                window,
                resend_base,
                max_retransmits,
            )?),
        };

        if fragment::needs_split(bit_length.div_ceil(8), self.current_mtu) {
            let group_id = *next_group_id;
            *next_group_id = next_group_id.wrapping_add(1);
            let chunks = fragment::split(&payload, bit_length, self.current_mtu, group_id);
            let last = chunks.len() - 1;
            for (index, chunk) in chunks.iter().enumerate() {
                tx.enqueue(QueuedMessage {
                    payload: chunk.freeze(),
                    bit_length: chunk.bit_length() as u16,
                    is_fragment: true,
                    receipt: if index == last { receipt } else { None },
                });
            }
        } else {
            tx.enqueue(QueuedMessage {
                payload,
                bit_length: bit_length as u16,
                is_fragment: false,
                receipt,
            });
        }
        Ok(())
    }

    // ─── MTU expansion ──────────────────────────────────────────────────

    fn start_mtu_expansion(&mut self, now: Instant) {
        if !self.config.expand_mtu || self.config.maximum_mtu <= self.current_mtu {
            return;
        }
        self.mtu_probe = Some(MtuProbe {
            try_size: Self::next_probe_size(self.current_mtu, self.config.maximum_mtu),
            attempts: 0,
            next_send: now,
            finalized: false,
        });
    }

    fn next_probe_size(current: usize, maximum: usize) -> usize {
        (current + current / 4).min(maximum)
    }

    fn handle_mtu_success(&mut self, size: usize, now: Instant) {
        if size > self.current_mtu && size <= self.config.maximum_mtu {
            tracing::debug!(remote = %self.remote, mtu = size, "expanded mtu");
            self.current_mtu = size;
        }
        if let Some(probe) = self.mtu_probe.as_mut() {
            if probe.finalized {
                return;
            }
            if size >= self.config.maximum_mtu {
                probe.finalized = true;
            } else if size >= probe.try_size {
                probe.try_size = Self::next_probe_size(size, self.config.maximum_mtu);
                probe.attempts = 0;
                probe.next_send = now;
            }
        }
    }

    fn drive_mtu_probe(&mut self, now: Instant) {
        let Some(probe) = self.mtu_probe.as_mut() else {
            return;
        };
        if probe.finalized || now < probe.next_send {
            return;
        }
        if probe.attempts >= MTU_PROBE_ATTEMPTS {
            // Repeated loss at this size; settle for what works.
            tracing::debug!(remote = %self.remote, mtu = self.current_mtu, "mtu expansion finalized");
            probe.finalized = true;
            return;
        }
        probe.attempts += 1;
        probe.next_send = now + MTU_PROBE_INTERVAL;
        let body = MtuProbeBody {
            size: probe.try_size as u32,
        }
        .encode(probe.try_size - HEADER_SIZE);
        self.control_out.push(WireMessage::library(MessageType::ExpandMtuRequest, &body));
    }

    // ─── Heartbeat ──────────────────────────────────────────────────────

    /// One heartbeat: timeouts, keepalive, handshake resends, retransmits,
    /// and packing everything due into datagrams.
    pub fn heartbeat(
        &mut self,
        now: Instant,
        flush_data: bool,
        out: &mut Vec<Bytes>,
        events: &mut Vec<ConnectionEvent>,
    ) {
        match self.status {
            ConnectionStatus::Connected => {
                if now.duration_since(self.last_heard) > self.config.connection_timeout {
                    self.set_status(ConnectionStatus::Disconnected, "Connection timed out", events);
                    return;
                }
                if now.duration_since(self.last_ping_sent) >= self.config.ping_interval {
                    self.last_ping_sent = now;
                    let body = PingBody {
                        timestamp_us: self.timestamp_us(now),
                    }
                    .encode();
                    self.queue_control(MessageType::Ping, &body);
                }
                self.drive_mtu_probe(now);
            }
            ConnectionStatus::InitiatedConnect | ConnectionStatus::RespondedConnect => {
                let resend_due = self
                    .last_handshake_send
                    .map(|t| now.duration_since(t) >= self.config.handshake_resend_interval)
                    .unwrap_or(true);
                if resend_due {
                    if self.handshake_sends >= self.config.handshake_attempts {
                        self.set_status(
                            ConnectionStatus::Disconnected,
                            "Failed to establish connection",
                            events,
                        );
                        return;
                    }
                    if self.status == ConnectionStatus::InitiatedConnect {
                        self.send_connect(now);
                    } else {
                        self.send_connect_response(now);
                    }
                }
            }
            ConnectionStatus::ReceivedInitiation | ConnectionStatus::RespondedAwaitingApproval => {
                if now.duration_since(self.last_heard) > self.config.connection_timeout {
                    self.set_status(ConnectionStatus::Disconnected, "Handshake timed out", events);
                    return;
                }
            }
            ConnectionStatus::None | ConnectionStatus::Disconnecting | ConnectionStatus::Disconnected => {}
        }

        if now.duration_since(self.last_fragment_sweep) >= Duration::from_secs(5) {
            self.last_fragment_sweep = now;
            self.assembler.expire(now, self.config.fragment_group_ttl);
        }

        let mut packer = DatagramPacker::new(self.current_mtu);

        // Acks first so the remote frees its windows promptly.
        if !self.ack_queue.is_empty() {
            let per_message = (self.current_mtu - HEADER_SIZE) / 3;
            let entries = std::mem::take(&mut self.ack_queue);
            for chunk in entries.chunks(per_message.max(1)) {
                let body = encode_acks(chunk);
                let msg = WireMessage::library(MessageType::Ack, &body);
                self.stats.sent_messages += 1;
                packer.push(&msg, out);
            }
        }

        if flush_data && self.status != ConnectionStatus::Disconnected {
            let rtt = self.rtt();
            let mut wire_out = Vec::new();
            let mut signals = Vec::new();
            for tx in self.send_channels.values_mut() {
                tx.heartbeat(now, rtt, &mut wire_out, &mut signals);
            }
            self.stats.sent_messages += wire_out.len() as u64;
            for msg in &wire_out {
                packer.push(msg, out);
            }
            self.drain_signals(signals, events);
        }

        // Control last, so a goodbye in the same heartbeat follows any data
        // the remote should still process.
        for msg in std::mem::take(&mut self.control_out) {
            self.stats.sent_messages += 1;
            packer.push(&msg, out);
        }

        packer.flush(out);

        if self.status == ConnectionStatus::Disconnecting {
            self.set_status(ConnectionStatus::Disconnected, "disconnected", events);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::IncomingKind;
    use crate::wire::parse_datagram;

    fn config() -> Arc<PeerConfig> {
        Arc::new(PeerConfig::new("test-app"))
    }

    fn pair(now: Instant) -> (Connection, Connection) {
        let a = Connection::new("127.0.0.1:5001".parse().unwrap(), config(), 0xA, now);
        let b = Connection::new("127.0.0.1:5002".parse().unwrap(), config(), 0xB, now);
        (a, b)
    }

    /// Drain `from`'s heartbeat datagrams into `to`.
    fn pump(
        from: &mut Connection,
        to: &mut Connection,
        now: Instant,
        events: &mut Vec<ConnectionEvent>,
    ) {
        let mut out = Vec::new();
        let mut from_events = Vec::new();
        from.heartbeat(now, true, &mut out, &mut from_events);
        for datagram in out {
            to.note_heard(now);
            for msg in parse_datagram(datagram).unwrap().messages {
                to.handle_message(&msg, now, events);
            }
        }
    }

    fn connect_pair(a: &mut Connection, b: &mut Connection, now: Instant) {
        let mut events = Vec::new();
        a.initiate(Vec::new(), now, &mut events);
        pump(a, b, now, &mut events); // Connect → b
        pump(b, a, now, &mut events); // ConnectResponse → a
        pump(a, b, now, &mut events); // ConnectionEstablished → b
        assert_eq!(a.status(), ConnectionStatus::Connected);
        assert_eq!(b.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn handshake_happy_path() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now);
        connect_pair(&mut a, &mut b, now);
        assert_eq!(a.remote_peer_id(), 0xB);
        assert_eq!(b.remote_peer_id(), 0xA);
    }

    #[test]
    fn approval_path_holds_until_approved() {
        let now = Instant::now();
        let approving = Arc::new(PeerConfig {
            enabled_message_types: KindMaskWith::approval(),
            ..PeerConfig::new("test-app")
        });
        let mut a = Connection::new("127.0.0.1:1".parse().unwrap(), config(), 0xA, now);
        let mut b = Connection::new("127.0.0.1:2".parse().unwrap(), approving, 0xB, now);

        let mut events = Vec::new();
        a.initiate(b"hail!".to_vec(), now, &mut events);
        pump(&mut a, &mut b, now, &mut events);

        assert_eq!(b.status(), ConnectionStatus::RespondedAwaitingApproval);
        let hail = events.iter().find_map(|e| match e {
            ConnectionEvent::ApprovalNeeded { hail } => Some(hail.clone()),
            _ => None,
        });
        assert_eq!(hail.unwrap(), b"hail!");

        b.approve(now, &mut events);
        pump(&mut b, &mut a, now, &mut events);
        pump(&mut a, &mut b, now, &mut events);
        assert_eq!(a.status(), ConnectionStatus::Connected);
        assert_eq!(b.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn wrong_identifier_denied() {
        let now = Instant::now();
        let mut a = Connection::new(
            "127.0.0.1:1".parse().unwrap(),
            Arc::new(PeerConfig::new("app-one")),
            0xA,
            now,
        );
        let mut b = Connection::new(
            "127.0.0.1:2".parse().unwrap(),
            Arc::new(PeerConfig::new("app-two")),
            0xB,
            now,
        );
        let mut events = Vec::new();
        a.initiate(Vec::new(), now, &mut events);
        pump(&mut a, &mut b, now, &mut events);
        assert_eq!(b.status(), ConnectionStatus::Disconnecting);
        pump(&mut b, &mut a, now, &mut events);
        assert_eq!(a.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn handshake_gives_up_after_attempts() {
        let t0 = Instant::now();
        let (mut a, _b) = pair(t0);
        let mut events = Vec::new();
        a.initiate(Vec::new(), t0, &mut events);

        let mut now = t0;
        for _ in 0..10 {
            now = now + Duration::from_secs(2);
            let mut out = Vec::new();
            a.heartbeat(now, true, &mut out, &mut events);
        }
        assert_eq!(a.status(), ConnectionStatus::Disconnected);
        assert!(events.iter().any(|e| matches!(
            e,
            ConnectionEvent::StatusChanged { status: ConnectionStatus::Disconnected, reason }
                if reason == "Failed to establish connection"
        )));
    }

    #[test]
    fn reliable_ordered_roundtrip_with_acks() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now);
        connect_pair(&mut a, &mut b, now);

        let mut group = 0u32;
        for tag in [b"one".as_slice(), b"two", b"three"] {
            a.enqueue_send(
                DeliveryMethod::ReliableOrdered,
                0,
                Bytes::copy_from_slice(tag),
                tag.len() * 8,
                None,
                &mut group,
            )
            .unwrap();
        }

        let mut events = Vec::new();
        pump(&mut a, &mut b, now, &mut events);
        let delivered: Vec<Bytes> = events
            .iter()
            .filter_map(|e| match e {
                ConnectionEvent::Data { payload, .. } => Some(payload.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(delivered, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two"), Bytes::from_static(b"three")]);

        // b's next heartbeat carries the acks; a frees its window.
        let mut events = Vec::new();
        pump(&mut b, &mut a, now, &mut events);
        assert_eq!(a.pending_sends(), 0);
    }

    #[test]
    fn receipt_surfaces_after_ack() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now);
        connect_pair(&mut a, &mut b, now);

        let mut group = 0u32;
        a.enqueue_send(
            DeliveryMethod::ReliableOrdered,
            0,
            Bytes::from_static(b"tagged"),
            48,
            Some(777),
            &mut group,
        )
        .unwrap();

        let mut events = Vec::new();
        pump(&mut a, &mut b, now, &mut events);
        let mut events = Vec::new();
        pump(&mut b, &mut a, now, &mut events);
        assert!(events.iter().any(|e| matches!(e, ConnectionEvent::Receipt(777))));
    }

    #[test]
    fn fragmented_send_reassembles() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now);
        connect_pair(&mut a, &mut b, now);

        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 257) as u8).collect();
        let mut group = 0u32;
        a.enqueue_send(
            DeliveryMethod::ReliableOrdered,
            0,
            Bytes::from(payload.clone()),
            payload.len() * 8,
            None,
            &mut group,
        )
        .unwrap();

        let mut events = Vec::new();
        pump(&mut a, &mut b, now, &mut events);
        let delivered: Vec<(Bytes, usize)> = events
            .iter()
            .filter_map(|e| match e {
                ConnectionEvent::Data {
                    payload, bit_length, ..
                } => Some((payload.clone(), *bit_length)),
                _ => None,
            })
            .collect();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1, 160_000);
        assert_eq!(&delivered[0].0[..], &payload[..]);
    }

    #[test]
    fn idle_connection_times_out() {
        let t0 = Instant::now();
        let (mut a, mut b) = pair(t0);
        connect_pair(&mut a, &mut b, t0);

        let late = t0 + Duration::from_secs(30);
        let mut out = Vec::new();
        let mut events = Vec::new();
        a.heartbeat(late, true, &mut out, &mut events);
        assert_eq!(a.status(), ConnectionStatus::Disconnected);
        assert!(events.iter().any(|e| matches!(
            e,
            ConnectionEvent::StatusChanged { reason, .. } if reason == "Connection timed out"
        )));
    }

    #[test]
    fn ping_updates_rtt() {
        let t0 = Instant::now();
        let (mut a, mut b) = pair(t0);
        connect_pair(&mut a, &mut b, t0);
        assert_eq!(a.rtt(), Duration::ZERO);

        // a pings at +5s; b answers; pong processed at +5.05s.
        let ping_at = t0 + Duration::from_secs(5);
        let mut events = Vec::new();
        pump(&mut a, &mut b, ping_at, &mut events);

        let pong_at = ping_at + Duration::from_millis(50);
        pump(&mut b, &mut a, pong_at, &mut events);

        let rtt = a.rtt();
        assert!(rtt >= Duration::from_millis(45) && rtt <= Duration::from_millis(60), "rtt {rtt:?}");
    }

    #[test]
    fn mtu_expansion_converges_to_maximum() {
        let t0 = Instant::now();
        let expanding = Arc::new(PeerConfig {
            expand_mtu: true,
            default_mtu: 1400,
            maximum_mtu: 4096,
            ..PeerConfig::new("test-app")
        });
        let mut a = Connection::new("127.0.0.1:1".parse().unwrap(), expanding.clone(), 0xA, t0);
        let mut b = Connection::new("127.0.0.1:2".parse().unwrap(), expanding, 0xB, t0);

        let mut events = Vec::new();
        a.initiate(Vec::new(), t0, &mut events);
        pump(&mut a, &mut b, t0, &mut events);
        pump(&mut b, &mut a, t0, &mut events);
        pump(&mut a, &mut b, t0, &mut events);

        // Let the probe ladder run; each exchange raises the try size 25%.
        let mut now = t0;
        for _ in 0..24 {
            now = now + Duration::from_millis(600);
            let mut events = Vec::new();
            pump(&mut a, &mut b, now, &mut events);
            pump(&mut b, &mut a, now, &mut events);
        }
        assert_eq!(a.current_mtu(), 4096);
    }

    #[test]
    fn disconnect_sends_goodbye_and_settles() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now);
        connect_pair(&mut a, &mut b, now);

        let mut events = Vec::new();
        a.disconnect("bye", &mut events);
        pump(&mut a, &mut b, now, &mut events);
        assert_eq!(a.status(), ConnectionStatus::Disconnected);
        assert_eq!(b.status(), ConnectionStatus::Disconnected);
        assert!(events.iter().any(|e| matches!(
            e,
            ConnectionEvent::StatusChanged { reason, .. } if reason == "bye"
        )));
    }

    #[test]
    fn data_before_connected_is_ignored() {
        let now = Instant::now();
        let (mut a, _) = pair(now);
        let msg = WireMessage {
            message_type: MessageType::Data(DeliveryMethod::ReliableOrdered, 0),
            is_fragment: false,
            sequence: Seq::new(0),
            bit_length: 8,
            payload: Bytes::from_static(&[1]),
        };
        let mut events = Vec::new();
        a.handle_message(&msg, now, &mut events);
        assert!(events.is_empty());
    }

    // Helper constructing a mask with approval enabled.
    struct KindMaskWith;

    impl KindMaskWith {
        fn approval() -> crate::message::KindMask {
            crate::message::KindMask::default().with(IncomingKind::ConnectionApproval)
        }
    }
}
