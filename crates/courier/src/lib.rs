//! # courier
//!
//! Reliable messaging over UDP for peer-to-peer and client/server
//! applications: connection handshake with approval, four delivery methods
//! over per-connection sliding windows, datagram framing that packs several
//! variable-bit-length messages per packet, fragmentation of oversize
//! messages, and a single library thread that owns the socket.
//!
//! ## Crate structure
//!
//! - [`buffer`] — bit-granular read/write buffers
//! - [`pool`] — size-bucketed buffer pool with a cross-thread mailbox
//! - [`seq`] — 15-bit wrapping sequence numbers
//! - [`wire`] — message-type code space, headers, datagram pack/parse
//! - [`message`] — application-facing message model and kind mask
//! - [`sender`] / [`receiver`] — per-channel sliding-window state machines
//! - [`fragment`] — split and reassembly of oversize messages
//! - [`connection`] — per-endpoint handshake, keepalive, RTT, MTU expansion
//! - [`peer`] — the peer handle and the network loop thread
//! - [`queue`] — bounded hand-off of released messages
//! - [`config`] — peer configuration (TOML-loadable)
//! - [`schema`] — explicit type registry for typed payloads
//! - [`stats`] — peer and connection statistics
//!
//! ## Quick start
//!
//! ```no_run
//! use courier::config::PeerConfig;
//! use courier::message::OutgoingMessage;
//! use courier::peer::Peer;
//! use courier::wire::DeliveryMethod;
//!
//! let mut config = PeerConfig::new("chat-example");
//! config.accept_incoming_connections = true;
//! let peer = Peer::start(config).unwrap();
//!
//! peer.connect("203.0.113.5:7000".parse().unwrap()).unwrap();
//! let mut msg = OutgoingMessage::new();
//! msg.write_string("hello");
//! peer.send(
//!     "203.0.113.5:7000".parse().unwrap(),
//!     msg,
//!     DeliveryMethod::ReliableOrdered,
//!     0,
//! )
//! .unwrap();
//! ```

pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod fragment;
pub mod message;
pub mod peer;
pub mod pool;
pub mod queue;
pub mod receiver;
pub mod schema;
pub mod sender;
pub mod seq;
pub mod stats;
pub mod wire;

pub use config::PeerConfig;
pub use error::CourierError;
pub use message::{IncomingKind, IncomingMessage, KindMask, OutgoingMessage};
pub use peer::{Peer, PeerStatus};
pub use wire::DeliveryMethod;
