//! Application-facing message model.
//!
//! Outgoing messages are built bit-by-bit into a [`BitBuffer`] and handed to
//! the peer, which freezes the payload into ref-counted [`bytes::Bytes`]
//! before the send channels take over. Incoming messages carry a readable
//! buffer plus delivery metadata and a high-level kind tag.

use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};

use quanta::Instant;
use serde::{Deserialize, Serialize};

use crate::buffer::BitBuffer;
use crate::error::Result;
use crate::wire::DeliveryMethod;

// ─── Incoming kinds ─────────────────────────────────────────────────────────

/// High-level classification of a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IncomingKind {
    /// Application data from a connected peer.
    Data,
    /// Application data outside any connection.
    UnconnectedData,
    /// A reliable message with a receipt tag was fully acknowledged.
    Receipt,
    /// A connection changed status; payload is the status byte and reason.
    StatusChanged,
    /// Someone sent a `Discovery` probe.
    DiscoveryRequest,
    /// Answer to our `Discovery` probe.
    DiscoveryResponse,
    /// An inbound connect is waiting for `approve`/`deny`.
    ConnectionApproval,
    /// A NAT punch arrived from an introduced peer.
    NatIntroductionSuccess,
    DebugMessage,
    VerboseDebugMessage,
    WarningMessage,
    ErrorMessage,
    /// Library-level failure report from the remote peer.
    Error,
}

impl IncomingKind {
    fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

/// Set of [`IncomingKind`]s the application wants delivered.
///
/// Disabled kinds are dropped inside the network loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindMask(u32);

impl KindMask {
    pub const fn empty() -> Self {
        KindMask(0)
    }

    pub fn with(self, kind: IncomingKind) -> Self {
        KindMask(self.0 | kind.bit())
    }

    pub fn without(self, kind: IncomingKind) -> Self {
        KindMask(self.0 & !kind.bit())
    }

    pub fn contains(self, kind: IncomingKind) -> bool {
        self.0 & kind.bit() != 0
    }
}

impl Default for KindMask {
    /// Data, status transitions, and the three diagnostic severities.
    fn default() -> Self {
        KindMask::empty()
            .with(IncomingKind::Data)
            .with(IncomingKind::StatusChanged)
            .with(IncomingKind::DebugMessage)
            .with(IncomingKind::WarningMessage)
            .with(IncomingKind::ErrorMessage)
            .with(IncomingKind::Error)
    }
}

// ─── Outgoing ───────────────────────────────────────────────────────────────

/// A message under construction by the application.
///
/// Dereferences to [`BitBuffer`] for the write API. An optional receipt tag
/// makes the peer surface a [`IncomingKind::Receipt`] once every ack for the
/// message has arrived.
#[derive(Debug, Default)]
pub struct OutgoingMessage {
    buffer: BitBuffer,
    receipt: Option<u64>,
}

impl OutgoingMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        OutgoingMessage {
            buffer: BitBuffer::with_capacity(capacity),
            receipt: None,
        }
    }

    /// Request a delivery receipt carrying `tag`.
    pub fn request_receipt(&mut self, tag: u64) {
        self.receipt = Some(tag);
    }

    pub fn receipt(&self) -> Option<u64> {
        self.receipt
    }

    pub fn into_buffer(self) -> BitBuffer {
        self.buffer
    }
}

impl Deref for OutgoingMessage {
    type Target = BitBuffer;

    fn deref(&self) -> &BitBuffer {
        &self.buffer
    }
}

impl DerefMut for OutgoingMessage {
    fn deref_mut(&mut self) -> &mut BitBuffer {
        &mut self.buffer
    }
}

// ─── Incoming ───────────────────────────────────────────────────────────────

/// A message released to the application.
#[derive(Debug)]
pub struct IncomingMessage {
    pub kind: IncomingKind,
    /// Endpoint the datagram came from; absent for peer-local diagnostics.
    pub sender: Option<SocketAddr>,
    /// Wire sequence number, for data messages.
    pub sequence: Option<u16>,
    /// Delivery method and sequence channel, for data messages.
    pub delivery: Option<(DeliveryMethod, u8)>,
    pub receive_time: Instant,
    /// Payload, read cursor at the start.
    pub data: BitBuffer,
}

impl IncomingMessage {
    pub(crate) fn library(kind: IncomingKind, sender: Option<SocketAddr>, data: BitBuffer) -> Self {
        IncomingMessage {
            kind,
            sender,
            sequence: None,
            delivery: None,
            receive_time: Instant::now(),
            data,
        }
    }

    /// Read the payload as a single string (diagnostics, disconnect reasons,
    /// NAT tokens).
    pub fn text(&self) -> Result<String> {
        let mut reader = BitBuffer::from_slice(self.data.as_bytes(), self.data.bit_length());
        reader.read_string()
    }

    /// Reclaim the backing buffer for pooling.
    pub fn into_buffer(self) -> BitBuffer {
        self.data
    }
}
