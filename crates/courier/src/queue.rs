//! Received-message hand-off.
//!
//! The library thread is the producer; any number of application threads
//! consume. The queue is bounded — when the application falls behind, new
//! releases are dropped with a warning and reliable channels recover by
//! retransmission.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};

use crate::message::IncomingMessage;

/// Loop-side producer half.
pub struct ReceivedQueueProducer {
    tx: Sender<IncomingMessage>,
}

impl ReceivedQueueProducer {
    /// Offer a message to the application. Returns `false` when the queue is
    /// full or every consumer is gone, in which case the message is dropped.
    pub fn offer(&self, message: IncomingMessage) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!("received-message queue full, dropping message");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Application-side consumer half; cheap to clone across threads.
#[derive(Clone)]
pub struct ReceivedQueue {
    rx: Receiver<IncomingMessage>,
}

impl ReceivedQueue {
    /// Non-blocking poll.
    pub fn try_recv(&self) -> Option<IncomingMessage> {
        match self.rx.try_recv() {
            Ok(msg) => Some(msg),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Block until a message arrives or the peer shuts down.
    pub fn recv(&self) -> Option<IncomingMessage> {
        self.rx.recv().ok()
    }

    /// Block with a deadline. `None` on timeout or shutdown.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<IncomingMessage> {
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => Some(msg),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Messages currently waiting.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Build a bounded producer/consumer pair.
pub fn received_queue(capacity: usize) -> (ReceivedQueueProducer, ReceivedQueue) {
    let (tx, rx) = bounded(capacity);
    (ReceivedQueueProducer { tx }, ReceivedQueue { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BitBuffer;
    use crate::message::IncomingKind;

    fn message(tag: &str) -> IncomingMessage {
        let mut data = BitBuffer::new();
        data.write_string(tag);
        IncomingMessage::library(IncomingKind::DebugMessage, None, data)
    }

    #[test]
    fn offer_and_receive() {
        let (tx, rx) = received_queue(4);
        assert!(tx.offer(message("a")));
        assert!(tx.offer(message("b")));
        assert_eq!(rx.len(), 2);
        assert_eq!(rx.try_recv().unwrap().text().unwrap(), "a");
        assert_eq!(rx.recv().unwrap().text().unwrap(), "b");
        assert!(rx.is_empty());
    }

    #[test]
    fn full_queue_drops() {
        let (tx, rx) = received_queue(1);
        assert!(tx.offer(message("kept")));
        assert!(!tx.offer(message("dropped")));
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn timeout_returns_none() {
        let (_tx, rx) = received_queue(1);
        assert!(rx.recv_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn disconnect_wakes_blocked_receiver() {
        let (tx, rx) = received_queue(1);
        let waiter = std::thread::spawn(move || rx.recv());
        drop(tx);
        assert!(waiter.join().unwrap().is_none());
    }
}
