//! # Send Channels
//!
//! Pure logic — no I/O, no clocks. Each connection owns one send channel per
//! `(delivery method, sequence channel)` in use. Channels accept queued
//! messages, assign sequence numbers, and emit framed [`WireMessage`]s when
//! the heartbeat drives them. Reliable channels keep a sliding window of
//! in-flight records and reschedule retransmissions until acknowledged.
//!
//! The retransmission delay starts at `max(base, 2·rtt)` and doubles per
//! attempt, capped at 8 seconds. A record exhausting its retransmit budget
//! raises a timeout signal; the connection decides what to do with it.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use quanta::Instant;

use crate::error::Result;
use crate::seq::Seq;
use crate::wire::{DeliveryMethod, MessageType, WireMessage};

/// Upper bound on the per-attempt retransmission delay.
pub const MAX_RESEND_DELAY: Duration = Duration::from_secs(8);

/// Delay before retransmit attempt `resend_count + 1`.
pub(crate) fn resend_delay(base: Duration, rtt: Duration, resend_count: u32) -> Duration {
    let initial = base.max(rtt * 2);
    initial
        .saturating_mul(1u32 << resend_count.min(6))
        .min(MAX_RESEND_DELAY)
}

/// A message accepted onto a channel, payload already frozen.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub payload: Bytes,
    pub bit_length: u16,
    pub is_fragment: bool,
    pub receipt: Option<u64>,
}

/// Signals raised while driving a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendSignal {
    /// A reliable message with this receipt tag is fully acknowledged.
    Receipt(u64),
    /// This sequence exhausted its retransmit budget without an ack.
    Timeout(Seq),
}

// ─── Reliable sender ────────────────────────────────────────────────────────

#[derive(Debug)]
struct SendRecord {
    sequence: Seq,
    payload: Bytes,
    bit_length: u16,
    is_fragment: bool,
    receipt: Option<u64>,
    next_resend: Instant,
    resend_count: u32,
    acked: bool,
    timed_out: bool,
}

/// Sliding-window sender shared by the reliable-ordered and
/// reliable-unordered methods; only receivers distinguish the two.
#[derive(Debug)]
pub struct ReliableSender {
    message_type: MessageType,
    window_size: usize,
    send_start: Seq,
    next_seq: Seq,
    queued: VecDeque<QueuedMessage>,
    records: Vec<Option<SendRecord>>,
    resend_base: Duration,
    max_retransmits: u32,
    /// Messages retransmitted over the channel lifetime.
    pub resent: u64,
}

impl ReliableSender {
    pub fn new(
        method: DeliveryMethod,
        channel: u8,
        window_size: usize,
        resend_base: Duration,
        max_retransmits: u32,
    ) -> Result<Self> {
        Ok(ReliableSender {
            message_type: MessageType::data(method, channel)?,
            window_size,
            send_start: Seq::new(0),
            next_seq: Seq::new(0),
            queued: VecDeque::new(),
            records: (0..window_size).map(|_| None).collect(),
            resend_base,
            max_retransmits,
            resent: 0,
        })
    }

    pub fn enqueue(&mut self, msg: QueuedMessage) {
        self.queued.push_back(msg);
    }

    /// Unacked messages inside the window.
    pub fn in_flight(&self) -> usize {
        self.records.iter().filter(|r| r.is_some()).count()
    }

    /// Messages waiting for window space.
    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    fn can_admit(&self) -> bool {
        (self.next_seq.relative_to(self.send_start) as usize) < self.window_size
    }

    fn frame(record: &SendRecord, message_type: MessageType) -> WireMessage {
        WireMessage {
            message_type,
            is_fragment: record.is_fragment,
            sequence: record.sequence,
            bit_length: record.bit_length,
            payload: record.payload.clone(),
        }
    }

    /// Retransmit due records and admit queued messages into the window.
    pub fn heartbeat(
        &mut self,
        now: Instant,
        rtt: Duration,
        out: &mut Vec<WireMessage>,
        signals: &mut Vec<SendSignal>,
    ) {
        for record in self.records.iter_mut().flatten() {
            if record.acked || record.timed_out || now < record.next_resend {
                continue;
            }
            if record.resend_count >= self.max_retransmits {
                record.timed_out = true;
                signals.push(SendSignal::Timeout(record.sequence));
                continue;
            }
            record.resend_count += 1;
            record.next_resend = now + resend_delay(self.resend_base, rtt, record.resend_count);
            self.resent += 1;
            out.push(Self::frame(record, self.message_type));
        }

        while self.can_admit() {
            let Some(msg) = self.queued.pop_front() else {
                break;
            };
            let sequence = self.next_seq;
            self.next_seq = self.next_seq.next();
            let record = SendRecord {
                sequence,
                payload: msg.payload,
                bit_length: msg.bit_length,
                is_fragment: msg.is_fragment,
                receipt: msg.receipt,
                next_resend: now + resend_delay(self.resend_base, rtt, 0),
                resend_count: 0,
                acked: false,
                timed_out: false,
            };
            out.push(Self::frame(&record, self.message_type));
            let slot = sequence.slot(self.window_size);
            debug_assert!(self.records[slot].is_none());
            self.records[slot] = Some(record);
        }
    }

    /// Process an ack for `sequence`: clear its record and advance the
    /// window past the contiguous acked prefix.
    pub fn acknowledge(&mut self, sequence: Seq, signals: &mut Vec<SendSignal>) {
        let relative = sequence.relative_to(self.send_start);
        if relative < 0 || relative as usize >= self.window_size {
            return;
        }
        let slot = sequence.slot(self.window_size);
        if let Some(record) = self.records[slot].as_mut() {
            if record.sequence == sequence && !record.acked {
                record.acked = true;
                if let Some(tag) = record.receipt {
                    signals.push(SendSignal::Receipt(tag));
                }
            }
        }
        loop {
            let slot = self.send_start.slot(self.window_size);
            match &self.records[slot] {
                Some(record) if record.acked && record.sequence == self.send_start => {
                    self.records[slot] = None;
                    self.send_start = self.send_start.next();
                }
                _ => break,
            }
        }
    }
}

// ─── Sequenced sender ───────────────────────────────────────────────────────

/// Assigns sequence numbers but keeps no records; the receiver drops stale
/// arrivals.
#[derive(Debug)]
pub struct SequencedSender {
    message_type: MessageType,
    next_seq: Seq,
    queued: VecDeque<QueuedMessage>,
}

impl SequencedSender {
    pub fn new(channel: u8) -> Result<Self> {
        Ok(SequencedSender {
            message_type: MessageType::data(DeliveryMethod::Sequenced, channel)?,
            next_seq: Seq::new(0),
            queued: VecDeque::new(),
        })
    }

    pub fn enqueue(&mut self, msg: QueuedMessage) {
        self.queued.push_back(msg);
    }

    pub fn heartbeat(&mut self, out: &mut Vec<WireMessage>) {
        while let Some(msg) = self.queued.pop_front() {
            let sequence = self.next_seq;
            self.next_seq = self.next_seq.next();
            out.push(WireMessage {
                message_type: self.message_type,
                is_fragment: msg.is_fragment,
                sequence,
                bit_length: msg.bit_length,
                payload: msg.payload,
            });
        }
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }
}

// ─── Unreliable sender ──────────────────────────────────────────────────────

/// Send and forget; sequence field stays zero.
#[derive(Debug, Default)]
pub struct UnreliableSender {
    queued: VecDeque<QueuedMessage>,
}

impl UnreliableSender {
    pub fn enqueue(&mut self, msg: QueuedMessage) {
        self.queued.push_back(msg);
    }

    pub fn heartbeat(&mut self, out: &mut Vec<WireMessage>) {
        while let Some(msg) = self.queued.pop_front() {
            out.push(WireMessage {
                message_type: MessageType::Data(DeliveryMethod::Unreliable, 0),
                is_fragment: msg.is_fragment,
                sequence: Seq::new(0),
                bit_length: msg.bit_length,
                payload: msg.payload,
            });
        }
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }
}

// ─── Channel dispatch ───────────────────────────────────────────────────────

/// One outbound lane of a connection.
#[derive(Debug)]
pub enum SendChannel {
    Unreliable(UnreliableSender),
    Sequenced(SequencedSender),
    Reliable(ReliableSender),
}

impl SendChannel {
    pub fn new(
        method: DeliveryMethod,
        channel: u8,
        window_size: usize,
        resend_base: Duration,
        max_retransmits: u32,
    ) -> Result<Self> {
        Ok(match method {
            DeliveryMethod::Unreliable => SendChannel::Unreliable(UnreliableSender::default()),
            DeliveryMethod::Sequenced => SendChannel::Sequenced(SequencedSender::new(channel)?),
            DeliveryMethod::ReliableUnordered | DeliveryMethod::ReliableOrdered => {
                SendChannel::Reliable(ReliableSender::new(
                    method,
                    channel,
                    window_size,
                    resend_base,
                    max_retransmits,
                )?)
            }
        })
    }

    pub fn enqueue(&mut self, msg: QueuedMessage) {
        match self {
            SendChannel::Unreliable(s) => s.enqueue(msg),
            SendChannel::Sequenced(s) => s.enqueue(msg),
            SendChannel::Reliable(s) => s.enqueue(msg),
        }
    }

    pub fn heartbeat(
        &mut self,
        now: Instant,
        rtt: Duration,
        out: &mut Vec<WireMessage>,
        signals: &mut Vec<SendSignal>,
    ) {
        match self {
            SendChannel::Unreliable(s) => s.heartbeat(out),
            SendChannel::Sequenced(s) => s.heartbeat(out),
            SendChannel::Reliable(s) => s.heartbeat(now, rtt, out, signals),
        }
    }

    pub fn acknowledge(&mut self, sequence: Seq, signals: &mut Vec<SendSignal>) {
        if let SendChannel::Reliable(s) = self {
            s.acknowledge(sequence, signals);
        }
    }

    /// Work still owed to the wire: queued plus in-flight.
    pub fn pending(&self) -> usize {
        match self {
            SendChannel::Unreliable(s) => s.queued_len(),
            SendChannel::Sequenced(s) => s.queued_len(),
            SendChannel::Reliable(s) => s.queued_len() + s.in_flight(),
        }
    }
}
