//! # Receive Channels
//!
//! Mirror of the send channels: per-`(delivery method, sequence channel)`
//! inbound state. The connection acks every reliable arrival before handing
//! it here, so these channels only decide *release*: drop duplicates, drop
//! stale sequenced arrivals, withhold early reliable-ordered messages, and
//! push everything releasable into the caller's output.

use bytes::Bytes;

use crate::seq::Seq;

/// A message a receive channel has released towards the application.
#[derive(Debug, Clone)]
pub struct Released {
    pub sequence: Seq,
    pub payload: Bytes,
    pub bit_length: u16,
    pub is_fragment: bool,
}

// ─── Reliable ordered ───────────────────────────────────────────────────────

/// Sliding-window receiver with in-order release.
///
/// `window_start` is the next sequence owed to the application. Messages
/// ahead of it (within the window) are withheld; the slot index is always
/// derived as `sequence mod window_size`, never stored aliased.
#[derive(Debug)]
pub struct OrderedReceiver {
    window_size: usize,
    window_start: Seq,
    early_received: Vec<bool>,
    withheld: Vec<Option<Released>>,
    pub duplicates: u64,
    pub too_early: u64,
}

impl OrderedReceiver {
    pub fn new(window_size: usize) -> Self {
        OrderedReceiver {
            window_size,
            window_start: Seq::new(0),
            early_received: vec![false; window_size],
            withheld: (0..window_size).map(|_| None).collect(),
            duplicates: 0,
            too_early: 0,
        }
    }

    fn advance_window(&mut self) {
        let slot = self.window_start.slot(self.window_size);
        self.early_received[slot] = false;
        self.window_start = self.window_start.next();
    }

    pub fn receive(&mut self, msg: Released, out: &mut Vec<Released>) {
        let relative = i32::from(msg.sequence.relative_to(self.window_start));

        if relative == 0 {
            out.push(msg);
            self.advance_window();
            loop {
                let slot = self.window_start.slot(self.window_size);
                if !self.early_received[slot] {
                    break;
                }
                let withheld = self.withheld[slot]
                    .take()
                    .expect("early bit set without a withheld message");
                out.push(withheld);
                self.advance_window();
            }
            return;
        }
        if relative < 0 {
            self.duplicates += 1;
            return;
        }
        if relative > self.window_size as i32 {
            self.too_early += 1;
            tracing::warn!(
                sequence = msg.sequence.value(),
                window_start = self.window_start.value(),
                "dropping message far ahead of receive window"
            );
            return;
        }

        let slot = msg.sequence.slot(self.window_size);
        if self.early_received[slot] {
            self.duplicates += 1;
            return;
        }
        self.early_received[slot] = true;
        self.withheld[slot] = Some(msg);
    }

    /// Messages buffered waiting for their predecessors.
    pub fn withheld_count(&self) -> usize {
        self.withheld.iter().filter(|w| w.is_some()).count()
    }
}

// ─── Reliable unordered ─────────────────────────────────────────────────────

/// Releases on arrival; a seen-bitset over the window drops duplicates.
#[derive(Debug)]
pub struct UnorderedReceiver {
    window_size: usize,
    window_start: Seq,
    seen: Vec<bool>,
    pub duplicates: u64,
    pub too_early: u64,
}

impl UnorderedReceiver {
    pub fn new(window_size: usize) -> Self {
        UnorderedReceiver {
            window_size,
            window_start: Seq::new(0),
            seen: vec![false; window_size],
            duplicates: 0,
            too_early: 0,
        }
    }

    pub fn receive(&mut self, msg: Released, out: &mut Vec<Released>) {
        let relative = i32::from(msg.sequence.relative_to(self.window_start));

        if relative < 0 {
            self.duplicates += 1;
            return;
        }
        if relative > self.window_size as i32 {
            self.too_early += 1;
            tracing::warn!(
                sequence = msg.sequence.value(),
                window_start = self.window_start.value(),
                "dropping message far ahead of receive window"
            );
            return;
        }

        let slot = msg.sequence.slot(self.window_size);
        if self.seen[slot] {
            self.duplicates += 1;
            return;
        }
        self.seen[slot] = true;
        out.push(msg);

        // Slide past the contiguous seen prefix so the window keeps moving.
        loop {
            let slot = self.window_start.slot(self.window_size);
            if !self.seen[slot] {
                break;
            }
            self.seen[slot] = false;
            self.window_start = self.window_start.next();
        }
    }
}

// ─── Sequenced ──────────────────────────────────────────────────────────────

/// Latest-wins: releases only arrivals strictly newer than the last one.
#[derive(Debug, Default)]
pub struct SequencedReceiver {
    last_received: Option<Seq>,
    pub stale: u64,
}

impl SequencedReceiver {
    pub fn receive(&mut self, msg: Released, out: &mut Vec<Released>) {
        if let Some(last) = self.last_received {
            if msg.sequence.relative_to(last) <= 0 {
                self.stale += 1;
                return;
            }
        }
        self.last_received = Some(msg.sequence);
        out.push(msg);
    }
}

// ─── Channel dispatch ───────────────────────────────────────────────────────

/// One inbound lane of a connection.
#[derive(Debug)]
pub enum ReceiveChannel {
    Unreliable,
    Sequenced(SequencedReceiver),
    Unordered(UnorderedReceiver),
    Ordered(OrderedReceiver),
}

impl ReceiveChannel {
    pub fn new(method: crate::wire::DeliveryMethod, window_size: usize) -> Self {
        use crate::wire::DeliveryMethod;
        match method {
            DeliveryMethod::Unreliable => ReceiveChannel::Unreliable,
            DeliveryMethod::Sequenced => ReceiveChannel::Sequenced(SequencedReceiver::default()),
            DeliveryMethod::ReliableUnordered => {
                ReceiveChannel::Unordered(UnorderedReceiver::new(window_size))
            }
            DeliveryMethod::ReliableOrdered => {
                ReceiveChannel::Ordered(OrderedReceiver::new(window_size))
            }
        }
    }

    pub fn receive(&mut self, msg: Released, out: &mut Vec<Released>) {
        match self {
            ReceiveChannel::Unreliable => out.push(msg),
            ReceiveChannel::Sequenced(rx) => rx.receive(msg, out),
            ReceiveChannel::Unordered(rx) => rx.receive(msg, out),
            ReceiveChannel::Ordered(rx) => rx.receive(msg, out),
        }
    }
}
