//! An implementation of the [Transmission Control
//! Protocol](https://www.rfc-editor.org/rfc/rfc9293.html).
//!
//! [`Tcp`] parses inbound segments and routes each one to the connection it
//! belongs to. Exact endpoint pairs win over bound and listening entries,
//! which are keyed with an unspecified peer. A segment that matches nothing is
//! answered with a reset.

use self::{
    connection_table::ConnectionTable, segment::Segment, tcb::send_reset, tcp_parsing::TcpHeader,
};
use crate::{
    logging::{self, Direction as Crossing},
    route::Router,
    Endpoint, FxDashMap, Ipv4Address, Message, TcpConfig,
};
use std::{sync::Arc, time::Duration};
use thiserror::Error as ThisError;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

mod connection;
mod connection_table;
mod modular_cmp;
mod notify;
mod receive_queue;
mod segment;
mod segment_action;
mod send_queue;
mod state;
mod tcb;
pub(crate) mod tcp_parsing;
mod timer;

pub use connection::{Connection, Direction, ReadFlags};
pub use notify::{NotifyType, SocketEvents};
pub use segment_action::SegmentAction;
pub use state::State;
pub use tcp_parsing::ParseError;

/// Uniquely identifies a connection by its two endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ConnectionId {
    /// The local endpoint
    pub local: Endpoint,
    /// The remote endpoint
    pub remote: Endpoint,
}

impl ConnectionId {
    pub const fn new(local: Endpoint, remote: Endpoint) -> Self {
        Self { local, remote }
    }

    /// Swaps the local and remote endpoints. This is the identifier the peer
    /// uses for the same connection.
    pub const fn reverse(self) -> Self {
        Self {
            local: self.remote,
            remote: self.local,
        }
    }
}

/// Why an inbound segment was not delivered to a connection.
#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum DemuxError {
    #[error("Malformed header: {0}")]
    Header(#[from] ParseError),
    #[error("No connection for the segment")]
    MissingSession,
}

/// The transport engine for one host. See the module-level documentation for
/// more details.
pub struct Tcp {
    /// Active, bound, and listening connections
    table: ConnectionTable<Connection>,
    /// Connections in TIME_WAIT, kept until reclaimed
    time_wait: FxDashMap<ConnectionId, Arc<Connection>>,
    router: Arc<dyn Router>,
    config: Arc<TcpConfig>,
    events: Option<Arc<dyn SocketEvents>>,
}

impl Tcp {
    /// Creates a new engine sending through `router`.
    pub fn new(router: Arc<dyn Router>, config: TcpConfig) -> Self {
        Self {
            table: ConnectionTable::new(config.ephemeral_ports.clone()),
            time_wait: Default::default(),
            router,
            config: Arc::new(config),
            events: None,
        }
    }

    /// Reports readiness changes on every connection to `events`.
    pub fn with_events(mut self, events: Arc<dyn SocketEvents>) -> Self {
        self.events = Some(events);
        self
    }

    /// Converts the engine into a shared one, ready to open connections.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn config(&self) -> &TcpConfig {
        &self.config
    }

    /// Creates an unbound connection in the CLOSED state.
    pub fn open(self: &Arc<Self>) -> Arc<Connection> {
        Arc::new(Connection::new(
            Arc::downgrade(self),
            self.config.clone(),
            self.router.clone(),
        ))
    }

    /// Delivers a datagram payload that arrived from `source` at
    /// `destination`.
    pub fn receive(
        &self,
        source: Ipv4Address,
        destination: Ipv4Address,
        mut message: Message,
    ) -> Result<SegmentAction, DemuxError> {
        let header = TcpHeader::from_bytes(message.iter(), message.len(), source, destination)
            .map_err(|error| {
                debug!(%error, %source, "dropping malformed segment");
                error
            })?;
        message.remove_front(header.bytes());
        let id = ConnectionId::new(
            Endpoint::new(destination, header.dst_port),
            Endpoint::new(source, header.src_port),
        );
        let segment = Segment::new(header, message);

        match self.lookup(id) {
            Some(connection) => Ok(connection.segment_arrives(segment, id)),
            None => {
                logging::segment_event(Crossing::Received, id, &segment.header, segment.text.len());
                if !segment.header.ctl.rst() {
                    send_reset(&*self.router, id, &segment.header, segment.seg_len());
                }
                Err(DemuxError::MissingSession)
            }
        }
    }

    /// Runs every connection's timers forward by `elapsed`.
    pub fn advance_time(&self, elapsed: Duration) {
        let connections = self.table.snapshot().into_iter().chain(
            self.time_wait
                .iter()
                .map(|entry| entry.value().clone())
                .collect::<Vec<_>>(),
        );
        for connection in connections {
            connection.advance_time(elapsed);
        }
    }

    /// Spawns a task that advances time every [`TcpConfig::tick`]. The task
    /// ends once the engine is dropped.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let tcp = Arc::downgrade(self);
        let tick = self.config.tick;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(tick).await;
                let Some(tcp) = tcp.upgrade() else {
                    break;
                };
                tcp.advance_time(tick);
            }
            trace!("timer task stopped");
        })
    }

    /// The number of connections in the table, not counting those in
    /// TIME_WAIT.
    pub fn connections(&self) -> usize {
        self.table.len()
    }

    /// The number of connections lingering in TIME_WAIT.
    pub fn time_wait_connections(&self) -> usize {
        self.time_wait.len()
    }

    fn lookup(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let bound = ConnectionId::new(id.local, Endpoint::UNSPECIFIED);
        let wildcard = ConnectionId::new(
            Endpoint::new(Ipv4Address::UNSPECIFIED, id.local.port),
            Endpoint::UNSPECIFIED,
        );
        self.table
            .lookup(&id)
            .or_else(|| {
                self.time_wait
                    .get(&id)
                    .map(|entry| entry.value().clone())
            })
            .or_else(|| self.table.lookup(&bound))
            .or_else(|| self.table.lookup(&wildcard))
    }
}

impl std::fmt::Debug for Tcp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tcp")
            .field("connections", &self.table.len())
            .field("time_wait", &self.time_wait.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
