//! Tunables shared by every connection of a [`Tcp`](crate::Tcp) instance.

use std::{ops::RangeInclusive, time::Duration};

/// Stack-wide settings. Per-connection options such as blocking mode and
/// timeouts live on [`Connection`](crate::Connection).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpConfig {
    /// Capacity of each connection's send queue in bytes.
    pub send_buffer_size: usize,
    /// Capacity of each connection's receive queue in bytes.
    pub receive_buffer_size: usize,
    /// Send segment size used when the peer's SYN carries no MSS option.
    pub default_mss: u32,
    /// Upper bound on how long a blocking connect waits for the handshake.
    pub connection_timeout: Duration,
    /// Retransmission timeout before any backoff.
    pub initial_rto: Duration,
    /// Ceiling for the backed-off retransmission timeout.
    pub max_rto: Duration,
    /// Consecutive retransmission timeouts tolerated before the connection is
    /// dropped with [`TcpError::TimedOut`](crate::TcpError::TimedOut).
    pub max_retransmissions: u32,
    /// How long a lone acknowledgment may be held back.
    pub delayed_ack_timeout: Duration,
    /// Interval between zero-window probes.
    pub persist_interval: Duration,
    /// Maximum segment lifetime. Connections linger in TIME_WAIT for twice
    /// this long.
    pub max_segment_lifetime: Duration,
    /// Offer the window scale option in SYN segments.
    pub window_scaling: bool,
    /// Send partial segments even while earlier data is unacknowledged.
    pub no_delay: bool,
    /// Ports handed out to connections that did not bind one.
    pub ephemeral_ports: RangeInclusive<u16>,
    /// Period of the timer task started by [`Tcp::start`](crate::Tcp::start).
    pub tick: Duration,
}

impl TcpConfig {
    /// How long a connection stays in TIME_WAIT.
    pub fn time_wait(&self) -> Duration {
        self.max_segment_lifetime * 2
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            send_buffer_size: 65535,
            receive_buffer_size: 65535,
            default_mss: 536,
            connection_timeout: Duration::from_secs(75),
            initial_rto: Duration::from_secs(1),
            max_rto: Duration::from_secs(60),
            max_retransmissions: 8,
            delayed_ack_timeout: Duration::from_millis(100),
            persist_interval: Duration::from_secs(1),
            max_segment_lifetime: Duration::from_secs(60),
            window_scaling: true,
            no_delay: false,
            ephemeral_ports: 49152..=65535,
            tick: Duration::from_millis(33),
        }
    }
}
