//! A connection-oriented transport engine implementing the [Transmission
//! Control Protocol](https://www.rfc-editor.org/rfc/rfc9293.html) state
//! machine.
//!
//! The engine turns an unreliable datagram service into reliable, ordered,
//! bidirectional byte streams. It owns everything above the network layer:
//! segment encoding, sliding-window flow control, the handshake and teardown
//! state machine, and the retransmission, persist, delayed acknowledgment and
//! time-wait timers.
//!
//! # Organization
//!
//! - [`Tcp`] owns the connection table and dispatches inbound segments to
//!   [`Connection`]s.
//! - [`Connection`] is the socket-facing handle: connect, accept, send, read,
//!   close.
//! - [`Router`] is supplied by the embedder. It resolves routes to peers and
//!   transmits outgoing datagrams.
//! - [`Message`] is the byte container segments are built from.
//!
//! # Example
//!
//! ```no_run
//! # use elvis_tcp::{Datagram, Endpoint, Ipv4Address, Message, Route, Router, Tcp, TcpConfig, TransmitError};
//! # use std::sync::Arc;
//! struct Loopback;
//!
//! impl Router for Loopback {
//!     fn resolve_route(&self, _destination: Ipv4Address) -> Option<Route> {
//!         Some(Route::new(Ipv4Address::LOCALHOST, 1500))
//!     }
//!
//!     fn is_local(&self, address: Ipv4Address) -> bool {
//!         address == Ipv4Address::LOCALHOST
//!     }
//!
//!     fn transmit(&self, _route: &Route, _datagram: Datagram) -> Result<(), TransmitError> {
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> Result<(), elvis_tcp::TcpError> {
//! let tcp = Tcp::new(Arc::new(Loopback), TcpConfig::default()).shared();
//! let _ticker = tcp.start();
//! let connection = tcp.open();
//! connection.connect(Endpoint::new(Ipv4Address::LOCALHOST, 80)).await?;
//! connection.send_data(Message::new(b"GET / HTTP/1.0\r\n\r\n")).await?;
//! # Ok(())
//! # }
//! ```

mod logging;
pub use logging::init_events;

pub mod message;
pub use message::Message;

mod address;
pub use address::Ipv4Address;

mod utility;
pub use utility::Endpoint;

pub mod config;
pub use config::TcpConfig;

mod error;
pub use error::TcpError;

pub mod route;
pub use route::{Datagram, Route, Router, TransmitError};

pub mod tcp;
pub use tcp::{
    Connection, ConnectionId, DemuxError, Direction, NotifyType, ReadFlags, SegmentAction,
    SocketEvents, State, Tcp,
};

use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;

/// A concurrent map using the fast, non-cryptographic Fx hash.
pub(crate) type FxDashMap<K, V> = dashmap::DashMap<K, V, BuildHasherDefault<FxHasher>>;
