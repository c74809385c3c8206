use super::ConnectionId;

/// A change on a connection that a socket layer may want to hear about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyType {
    /// This many bytes can be read.
    Readable(usize),
    /// This many bytes can be written.
    Writable(usize),
    /// A listener has a connection waiting to be accepted.
    NewConnection,
    /// The connection closed.
    Closed,
}

/// Receives [`NotifyType`]s for a connection. Called after the connection's
/// lock is released, so implementations may call back into the connection.
pub trait SocketEvents: Send + Sync {
    fn notify(&self, id: ConnectionId, notification: NotifyType);
}
