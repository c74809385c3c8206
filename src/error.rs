use crate::TransmitError;
use thiserror::Error as ThisError;

/// An error returned by the socket-facing operations of a
/// [`Connection`](crate::Connection).
///
/// Connection-level failures (refused, reset, timed out) are also recorded on
/// the connection and reported to every later caller.
#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpError {
    #[error("The connection is already connected or bound")]
    AlreadyConnected,
    #[error("The local and remote endpoint pair is already in use")]
    AddressInUse,
    #[error("The address does not belong to a local interface")]
    AddressNotAvailable,
    #[error("The operation is not valid in the connection's current state")]
    BadValue,
    #[error("The connection is not bound to a local endpoint")]
    NotBound,
    #[error("A local endpoint must be bound first")]
    DestinationRequired,
    #[error("No route to the remote host")]
    NoRoute,
    #[error("The remote host refused the connection")]
    ConnectionRefused,
    #[error("The remote host reset the connection")]
    ConnectionReset,
    #[error("The connection was closed locally")]
    ConnectionAborted,
    #[error("The connection is not connected")]
    NotConnected,
    #[error("The operation is not supported on a listening connection")]
    NotSupported,
    #[error("The connection can no longer send")]
    BrokenPipe,
    #[error("The message is larger than the send buffer")]
    MessageTooLong,
    #[error("The connection attempt is in progress")]
    InProgress,
    #[error("The operation would block")]
    WouldBlock,
    #[error("The operation timed out")]
    TimedOut,
    #[error("Transmission failed: {0}")]
    Transmit(#[from] TransmitError),
}
