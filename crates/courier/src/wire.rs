//! # Courier Wire Format
//!
//! A datagram is a concatenation of messages, each with a 5-byte header:
//!
//! ```text
//! byte 0:      message_type (u8)
//! bytes 1..3:  (sequence:15) << 1 | (fragment:1)   -- LE; low bit of byte 1
//!                                                     is the fragment flag
//! bytes 3..5:  payload_bit_length (u16)            -- LE
//! payload:     ceil(bit_length / 8) bytes
//! ```
//!
//! ## Message-type code space
//!
//! Data codes (`0..128`) carry the delivery method and sequence channel;
//! codes at or above [`LIBRARY_ERROR`] are control messages consumed by the
//! transport. Codes `99..=127` are reserved and must never appear on the
//! wire; `67..=98` are unassigned data codes. Both are protocol errors.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};

use crate::buffer::BitBuffer;
use crate::error::{CourierError, Result};
use crate::seq::Seq;

/// Per-message header size in bytes.
pub const HEADER_SIZE: usize = 5;

/// First library control code; everything at or above is consumed by the
/// transport, everything below is application data.
pub const LIBRARY_ERROR: u8 = 128;

/// Sequence channels available per sequenced delivery method.
pub const SEQUENCE_CHANNEL_COUNT: u8 = 32;

// ─── Delivery methods ───────────────────────────────────────────────────────

/// How a message travels on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryMethod {
    /// Fire and forget. May be lost, duplicated, or reordered.
    Unreliable,
    /// Unreliable, but stale arrivals (at or behind the latest delivered)
    /// are dropped.
    Sequenced,
    /// Retransmitted until acknowledged; released in arrival order.
    ReliableUnordered,
    /// Retransmitted until acknowledged; released in send order.
    ReliableOrdered,
}

impl DeliveryMethod {
    /// Whether this method keeps send records and expects acks.
    pub fn is_reliable(self) -> bool {
        matches!(self, DeliveryMethod::ReliableUnordered | DeliveryMethod::ReliableOrdered)
    }

    /// Sequence channels this method supports.
    pub fn channel_count(self) -> u8 {
        match self {
            DeliveryMethod::Sequenced | DeliveryMethod::ReliableOrdered => SEQUENCE_CHANNEL_COUNT,
            DeliveryMethod::Unreliable | DeliveryMethod::ReliableUnordered => 1,
        }
    }
}

// ─── Message types ──────────────────────────────────────────────────────────

/// Decoded message-type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Data outside any connection (code 0).
    UnconnectedData,
    /// Connection data with its delivery method and sequence channel.
    Data(DeliveryMethod, u8),
    /// Remote library failure report.
    LibraryError,
    Ping,
    Pong,
    Connect,
    ConnectResponse,
    ConnectionEstablished,
    Ack,
    Disconnect,
    Discovery,
    DiscoveryResponse,
    NatPunchMessage,
    NatIntroduction,
    ExpandMtuRequest,
    ExpandMtuSuccess,
}

impl MessageType {
    /// The wire code for this type.
    pub fn to_byte(self) -> u8 {
        match self {
            MessageType::UnconnectedData => 0,
            MessageType::Data(DeliveryMethod::Unreliable, _) => 1,
            MessageType::Data(DeliveryMethod::Sequenced, ch) => 2 + ch,
            MessageType::Data(DeliveryMethod::ReliableUnordered, _) => 34,
            MessageType::Data(DeliveryMethod::ReliableOrdered, ch) => 35 + ch,
            MessageType::LibraryError => 128,
            MessageType::Ping => 129,
            MessageType::Pong => 130,
            MessageType::Connect => 131,
            MessageType::ConnectResponse => 132,
            MessageType::ConnectionEstablished => 133,
            MessageType::Ack => 134,
            MessageType::Disconnect => 135,
            MessageType::Discovery => 136,
            MessageType::DiscoveryResponse => 137,
            MessageType::NatPunchMessage => 138,
            MessageType::NatIntroduction => 139,
            MessageType::ExpandMtuRequest => 140,
            MessageType::ExpandMtuSuccess => 141,
        }
    }

    /// Decode a wire code. Reserved, unassigned, and unknown codes fail.
    pub fn from_byte(code: u8) -> Result<Self> {
        Ok(match code {
            0 => MessageType::UnconnectedData,
            1 => MessageType::Data(DeliveryMethod::Unreliable, 0),
            2..=33 => MessageType::Data(DeliveryMethod::Sequenced, code - 2),
            34 => MessageType::Data(DeliveryMethod::ReliableUnordered, 0),
            35..=66 => MessageType::Data(DeliveryMethod::ReliableOrdered, code - 35),
            67..=98 => return Err(CourierError::Malformed("unassigned data code")),
            99..=127 => return Err(CourierError::Malformed("reserved message-type code")),
            128 => MessageType::LibraryError,
            129 => MessageType::Ping,
            130 => MessageType::Pong,
            131 => MessageType::Connect,
            132 => MessageType::ConnectResponse,
            133 => MessageType::ConnectionEstablished,
            134 => MessageType::Ack,
            135 => MessageType::Disconnect,
            136 => MessageType::Discovery,
            137 => MessageType::DiscoveryResponse,
            138 => MessageType::NatPunchMessage,
            139 => MessageType::NatIntroduction,
            140 => MessageType::ExpandMtuRequest,
            141 => MessageType::ExpandMtuSuccess,
            _ => return Err(CourierError::Malformed("unknown message-type code")),
        })
    }

    /// Build the data code for a delivery method and channel, validating the
    /// channel range.
    pub fn data(method: DeliveryMethod, channel: u8) -> Result<Self> {
        if channel >= method.channel_count() {
            return Err(CourierError::ChannelRange(channel));
        }
        Ok(MessageType::Data(method, channel))
    }

    /// Whether this code is consumed by the transport rather than delivered
    /// to the application.
    pub fn is_library(self) -> bool {
        self.to_byte() >= LIBRARY_ERROR
    }
}

// ─── Framed message ─────────────────────────────────────────────────────────

/// One framed message: header fields plus the payload bytes.
#[derive(Debug, Clone)]
pub struct WireMessage {
    pub message_type: MessageType,
    pub is_fragment: bool,
    pub sequence: Seq,
    /// Exact payload length in bits; the payload holds `ceil(/8)` bytes.
    pub bit_length: u16,
    pub payload: Bytes,
}

impl WireMessage {
    /// A library control message (no sequence, no fragment flag).
    pub fn library(message_type: MessageType, body: &BitBuffer) -> Self {
        WireMessage {
            message_type,
            is_fragment: false,
            sequence: Seq::new(0),
            bit_length: body.bit_length() as u16,
            payload: body.freeze(),
        }
    }

    /// Framed size in a datagram: header plus payload bytes.
    pub fn frame_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Append header and payload to a datagram under construction.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.message_type.to_byte());
        buf.put_u16_le((self.sequence.value() << 1) | u16::from(self.is_fragment));
        buf.put_u16_le(self.bit_length);
        buf.put_slice(&self.payload);
    }

    /// Read the payload through a fresh bit cursor.
    pub fn reader(&self) -> BitBuffer {
        BitBuffer::from_slice(&self.payload, usize::from(self.bit_length))
    }
}

// ─── Datagram packing ───────────────────────────────────────────────────────

/// Packs framed messages into MTU-bounded datagrams.
///
/// A message that would overflow the current datagram finishes it and starts
/// a new one. A single message larger than the MTU goes out alone (MTU
/// expansion probes depend on this).
#[derive(Debug)]
pub struct DatagramPacker {
    buf: BytesMut,
    mtu: usize,
}

impl DatagramPacker {
    pub fn new(mtu: usize) -> Self {
        DatagramPacker {
            buf: BytesMut::with_capacity(mtu),
            mtu,
        }
    }

    pub fn set_mtu(&mut self, mtu: usize) {
        self.mtu = mtu;
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Add a message, flushing the current datagram into `out` first when it
    /// would not fit.
    pub fn push(&mut self, msg: &WireMessage, out: &mut Vec<Bytes>) {
        if !self.buf.is_empty() && self.buf.len() + msg.frame_size() > self.mtu {
            out.push(self.buf.split().freeze());
        }
        msg.encode_into(&mut self.buf);
    }

    /// Flush the in-progress datagram, if any.
    pub fn flush(&mut self, out: &mut Vec<Bytes>) {
        if !self.buf.is_empty() {
            out.push(self.buf.split().freeze());
        }
    }
}

/// Result of parsing one inbound datagram.
#[derive(Debug, Default)]
pub struct ParsedDatagram {
    pub messages: Vec<WireMessage>,
    /// Messages skipped for a bad type code (reserved/unassigned/unknown).
    pub skipped: usize,
}

/// Parse a datagram into framed messages.
///
/// A payload length running past the end of the datagram rejects the whole
/// datagram — nothing before the overrun is delivered. A bad type code skips
/// only that message (its length is still trusted for framing).
pub fn parse_datagram(datagram: Bytes) -> Result<ParsedDatagram> {
    let mut parsed = ParsedDatagram::default();
    let mut pos = 0usize;

    while datagram.len() - pos >= HEADER_SIZE {
        let code = datagram[pos];
        let seq_field = u16::from_le_bytes([datagram[pos + 1], datagram[pos + 2]]);
        let bit_length = u16::from_le_bytes([datagram[pos + 3], datagram[pos + 4]]);
        let payload_len = usize::from(bit_length).div_ceil(8);
        pos += HEADER_SIZE;

        if payload_len > datagram.len() - pos {
            return Err(CourierError::Malformed("payload length exceeds datagram"));
        }
        let payload = datagram.slice(pos..pos + payload_len);
        pos += payload_len;

        match MessageType::from_byte(code) {
            Ok(message_type) => parsed.messages.push(WireMessage {
                message_type,
                is_fragment: seq_field & 1 != 0,
                sequence: Seq::new(seq_field >> 1),
                bit_length,
                payload,
            }),
            Err(_) => {
                tracing::warn!(code, "skipping message with bad type code");
                parsed.skipped += 1;
            }
        }
    }
    Ok(parsed)
}

// ─── Ack entries ────────────────────────────────────────────────────────────

/// Encode ack entries `(data code, sequence)` as 3-byte pairs.
pub fn encode_acks(entries: &[(u8, Seq)]) -> BitBuffer {
    let mut body = BitBuffer::with_capacity(entries.len() * 3);
    for &(code, seq) in entries {
        body.write_u8(code);
        body.write_u16(seq.value());
    }
    body
}

/// Decode ack entries from an `Ack` payload.
pub fn decode_acks(msg: &WireMessage) -> Result<Vec<(u8, Seq)>> {
    let mut reader = msg.reader();
    let mut entries = Vec::with_capacity(reader.remaining_bits() / 24);
    while reader.remaining_bits() >= 24 {
        let code = reader.read_u8()?;
        let seq = Seq::new(reader.read_u16()?);
        entries.push((code, seq));
    }
    Ok(entries)
}

// ─── Endpoint codec ─────────────────────────────────────────────────────────

/// Write a socket address (1-bit family tag, address bytes, port).
pub fn write_endpoint(buf: &mut BitBuffer, addr: SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.write_bool(false);
            buf.write_bytes(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.write_bool(true);
            buf.write_bytes(&ip.octets());
        }
    }
    buf.write_u16(addr.port());
}

/// Read a socket address written by [`write_endpoint`].
pub fn read_endpoint(buf: &mut BitBuffer) -> Result<SocketAddr> {
    let ip = if buf.read_bool()? {
        let bytes = buf.read_bytes(16)?;
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&bytes);
        IpAddr::V6(Ipv6Addr::from(octets))
    } else {
        let bytes = buf.read_bytes(4)?;
        IpAddr::V4(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))
    };
    let port = buf.read_u16()?;
    Ok(SocketAddr::new(ip, port))
}

// ─── Library message bodies ─────────────────────────────────────────────────

/// `Connect` body: application identifier, sender's peer id, optional hail
/// bytes trailing to the end of the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectBody {
    pub app_identifier: String,
    pub peer_id: u64,
    pub hail: Vec<u8>,
}

impl ConnectBody {
    pub fn encode(&self) -> BitBuffer {
        let mut buf = BitBuffer::new();
        buf.write_string(&self.app_identifier);
        buf.write_u64(self.peer_id);
        buf.write_bytes(&self.hail);
        buf
    }

    pub fn decode(buf: &mut BitBuffer) -> Result<Self> {
        let app_identifier = buf.read_string()?;
        let peer_id = buf.read_u64()?;
        let hail = buf.read_bytes(buf.remaining_bits() / 8)?;
        Ok(ConnectBody {
            app_identifier,
            peer_id,
            hail,
        })
    }
}

/// `ConnectResponse` body: responder's identifier and peer id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponseBody {
    pub app_identifier: String,
    pub peer_id: u64,
}

impl ConnectResponseBody {
    pub fn encode(&self) -> BitBuffer {
        let mut buf = BitBuffer::new();
        buf.write_string(&self.app_identifier);
        buf.write_u64(self.peer_id);
        buf
    }

    pub fn decode(buf: &mut BitBuffer) -> Result<Self> {
        Ok(ConnectResponseBody {
            app_identifier: buf.read_string()?,
            peer_id: buf.read_u64()?,
        })
    }
}

/// `Disconnect` body: human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectBody {
    pub reason: String,
}

impl DisconnectBody {
    pub fn encode(&self) -> BitBuffer {
        let mut buf = BitBuffer::new();
        buf.write_string(&self.reason);
        buf
    }

    pub fn decode(buf: &mut BitBuffer) -> Result<Self> {
        Ok(DisconnectBody {
            reason: buf.read_string()?,
        })
    }
}

/// `Ping`/`Pong` body: a microsecond timestamp, echoed back verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingBody {
    pub timestamp_us: u64,
}

impl PingBody {
    pub fn encode(&self) -> BitBuffer {
        let mut buf = BitBuffer::new();
        buf.write_var_u64(self.timestamp_us);
        buf
    }

    pub fn decode(buf: &mut BitBuffer) -> Result<Self> {
        Ok(PingBody {
            timestamp_us: buf.read_var_u64()?,
        })
    }
}

/// `NatIntroduction` body: punch token plus the partner to contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatIntroductionBody {
    pub token: String,
    pub partner: SocketAddr,
}

impl NatIntroductionBody {
    pub fn encode(&self) -> BitBuffer {
        let mut buf = BitBuffer::new();
        buf.write_string(&self.token);
        write_endpoint(&mut buf, self.partner);
        buf
    }

    pub fn decode(buf: &mut BitBuffer) -> Result<Self> {
        Ok(NatIntroductionBody {
            token: buf.read_string()?,
            partner: read_endpoint(buf)?,
        })
    }
}

/// `NatPunchMessage` body: the token from the introduction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatPunchBody {
    pub token: String,
}

impl NatPunchBody {
    pub fn encode(&self) -> BitBuffer {
        let mut buf = BitBuffer::new();
        buf.write_string(&self.token);
        buf
    }

    pub fn decode(buf: &mut BitBuffer) -> Result<Self> {
        Ok(NatPunchBody {
            token: buf.read_string()?,
        })
    }
}

/// `ExpandMtuRequest` / `ExpandMtuSuccess` body: the probed datagram size.
/// Requests are zero-padded so the datagram actually reaches `size` bytes;
/// the padding is ignored on decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MtuProbeBody {
    pub size: u32,
}

impl MtuProbeBody {
    pub fn encode(&self, padded_payload_bytes: usize) -> BitBuffer {
        let mut buf = BitBuffer::with_capacity(padded_payload_bytes.max(5));
        buf.write_var_u32(self.size);
        while buf.byte_length() < padded_payload_bytes {
            buf.write_u8(0);
        }
        buf
    }

    pub fn decode(buf: &mut BitBuffer) -> Result<Self> {
        Ok(MtuProbeBody {
            size: buf.read_var_u32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_codes_roundtrip() {
        for code in 0u8..=66 {
            let ty = MessageType::from_byte(code).unwrap();
            assert_eq!(ty.to_byte(), code);
            assert!(!ty.is_library());
        }
    }

    #[test]
    fn library_codes_roundtrip() {
        for code in 128u8..=141 {
            let ty = MessageType::from_byte(code).unwrap();
            assert_eq!(ty.to_byte(), code);
            assert!(ty.is_library());
        }
    }

    #[test]
    fn reserved_and_unknown_codes_rejected() {
        for code in 67u8..=127 {
            assert!(MessageType::from_byte(code).is_err(), "code {code}");
        }
        for code in 142u8..=255 {
            assert!(MessageType::from_byte(code).is_err(), "code {code}");
        }
    }

    #[test]
    fn channel_range_enforced() {
        assert!(MessageType::data(DeliveryMethod::ReliableOrdered, 31).is_ok());
        assert!(matches!(
            MessageType::data(DeliveryMethod::ReliableOrdered, 32),
            Err(CourierError::ChannelRange(32))
        ));
        assert!(matches!(
            MessageType::data(DeliveryMethod::Unreliable, 1),
            Err(CourierError::ChannelRange(1))
        ));
    }

    fn data_msg(seq: u16, frag: bool, payload: &[u8], bit_length: u16) -> WireMessage {
        WireMessage {
            message_type: MessageType::Data(DeliveryMethod::ReliableOrdered, 3),
            is_fragment: frag,
            sequence: Seq::new(seq),
            bit_length,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn header_roundtrip() {
        let msg = data_msg(12345, true, &[0xAA, 0x0B], 12);
        let mut buf = BytesMut::new();
        msg.encode_into(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE + 2);

        let parsed = parse_datagram(buf.freeze()).unwrap();
        assert_eq!(parsed.messages.len(), 1);
        let got = &parsed.messages[0];
        assert_eq!(got.message_type, msg.message_type);
        assert!(got.is_fragment);
        assert_eq!(got.sequence.value(), 12345);
        assert_eq!(got.bit_length, 12);
        assert_eq!(got.payload, msg.payload);
    }

    #[test]
    fn multiple_messages_per_datagram() {
        let msgs = [
            data_msg(1, false, b"alpha", 40),
            data_msg(2, false, b"bravo!", 48),
            data_msg(3, false, b"", 0),
        ];
        let mut buf = BytesMut::new();
        for m in &msgs {
            m.encode_into(&mut buf);
        }
        let parsed = parse_datagram(buf.freeze()).unwrap();
        assert_eq!(parsed.messages.len(), 3);
        assert_eq!(parsed.skipped, 0);
        for (m, got) in msgs.iter().zip(&parsed.messages) {
            assert_eq!(got.sequence, m.sequence);
            assert_eq!(got.payload, m.payload);
        }
    }

    #[test]
    fn overrun_rejects_whole_datagram() {
        let good = data_msg(1, false, b"ok", 16);
        let mut buf = BytesMut::new();
        good.encode_into(&mut buf);
        // Header claiming 100 bytes of payload with only 2 present.
        buf.put_u8(1);
        buf.put_u16_le(0);
        buf.put_u16_le(800);
        buf.put_slice(b"xx");
        assert!(parse_datagram(buf.freeze()).is_err());
    }

    #[test]
    fn bad_code_skips_single_message() {
        let mut buf = BytesMut::new();
        // Reserved code 100 with a 1-byte payload.
        buf.put_u8(100);
        buf.put_u16_le(0);
        buf.put_u16_le(8);
        buf.put_u8(0xFF);
        data_msg(7, false, b"kept", 32).encode_into(&mut buf);

        let parsed = parse_datagram(buf.freeze()).unwrap();
        assert_eq!(parsed.skipped, 1);
        assert_eq!(parsed.messages.len(), 1);
        assert_eq!(parsed.messages[0].sequence.value(), 7);
    }

    #[test]
    fn trailing_garbage_shorter_than_header_ignored() {
        let mut buf = BytesMut::new();
        data_msg(9, false, b"x", 8).encode_into(&mut buf);
        buf.put_slice(&[1, 2, 3]);
        let parsed = parse_datagram(buf.freeze()).unwrap();
        assert_eq!(parsed.messages.len(), 1);
    }

    #[test]
    fn packer_splits_at_mtu() {
        let mut packer = DatagramPacker::new(32);
        let mut out = Vec::new();
        // 5 + 10 = 15 bytes each; two fit in 32, the third starts a new one.
        for seq in 0..3u16 {
            packer.push(&data_msg(seq, false, &[0u8; 10], 80), &mut out);
        }
        packer.flush(&mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(parse_datagram(out[0].clone()).unwrap().messages.len(), 2);
        assert_eq!(parse_datagram(out[1].clone()).unwrap().messages.len(), 1);
    }

    #[test]
    fn packer_allows_oversize_single_message() {
        let mut packer = DatagramPacker::new(16);
        let mut out = Vec::new();
        packer.push(&data_msg(0, false, &[0u8; 64], 512), &mut out);
        packer.flush(&mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), HEADER_SIZE + 64);
    }

    #[test]
    fn acks_roundtrip() {
        let entries = vec![
            (35u8, Seq::new(0)),
            (34, Seq::new(32767)),
            (2, Seq::new(512)),
        ];
        let body = encode_acks(&entries);
        let msg = WireMessage::library(MessageType::Ack, &body);
        assert_eq!(decode_acks(&msg).unwrap(), entries);
    }

    #[test]
    fn endpoint_roundtrip() {
        for addr in [
            "203.0.113.5:7000".parse::<SocketAddr>().unwrap(),
            "[2001:db8::1]:40000".parse().unwrap(),
        ] {
            let mut buf = BitBuffer::new();
            write_endpoint(&mut buf, addr);
            assert_eq!(read_endpoint(&mut buf).unwrap(), addr);
        }
    }

    #[test]
    fn connect_body_roundtrip() {
        let body = ConnectBody {
            app_identifier: "demo-app".into(),
            peer_id: 0xDEAD_BEEF_CAFE_F00D,
            hail: b"hail payload".to_vec(),
        };
        let buf = body.encode();
        let msg = WireMessage::library(MessageType::Connect, &buf);
        let decoded = ConnectBody::decode(&mut msg.reader()).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn connect_body_without_hail() {
        let body = ConnectBody {
            app_identifier: "demo-app".into(),
            peer_id: 7,
            hail: Vec::new(),
        };
        let decoded = ConnectBody::decode(&mut body.encode()).unwrap();
        assert!(decoded.hail.is_empty());
    }

    #[test]
    fn nat_bodies_roundtrip() {
        let intro = NatIntroductionBody {
            token: "tkn-42".into(),
            partner: "198.51.100.9:4242".parse().unwrap(),
        };
        assert_eq!(NatIntroductionBody::decode(&mut intro.encode()).unwrap(), intro);

        let punch = NatPunchBody {
            token: "tkn-42".into(),
        };
        assert_eq!(NatPunchBody::decode(&mut punch.encode()).unwrap(), punch);
    }

    #[test]
    fn mtu_probe_pads_to_size() {
        let body = MtuProbeBody { size: 1400 };
        let buf = body.encode(100);
        assert_eq!(buf.byte_length(), 100);
        assert_eq!(MtuProbeBody::decode(&mut body.encode(100)).unwrap().size, 1400);
    }

    #[test]
    fn disconnect_and_ping_roundtrip() {
        let d = DisconnectBody {
            reason: "Server full".into(),
        };
        assert_eq!(DisconnectBody::decode(&mut d.encode()).unwrap(), d);

        let p = PingBody {
            timestamp_us: 123_456_789,
        };
        assert_eq!(PingBody::decode(&mut p.encode()).unwrap(), p);
    }
}
