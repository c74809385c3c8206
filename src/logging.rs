//! Wrapper functions for structured logging.
//!
//! Each function corresponds to one kind of event so that log consumers can
//! filter on its target.

use crate::tcp::{tcp_parsing::TcpHeader, ConnectionId};
use std::{fs::OpenOptions, io, path::Path, sync::Arc};
use tracing::{event, Level};
use tracing_subscriber::FmtSubscriber;

/// Installs a global subscriber writing JSON lines to
/// `directory/debug-<date>.log`. Call it once, before any connection is opened.
pub fn init_events(directory: impl AsRef<Path>) -> io::Result<()> {
    let file_path = directory.as_ref().join(format!(
        "debug-{}.log",
        chrono::offset::Local::now().format("%y-%m-%d")
    ));
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(file_path)?;
    let subscriber = FmtSubscriber::builder()
        .with_writer(Arc::new(file))
        .with_max_level(Level::TRACE)
        .json()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|error| io::Error::new(io::ErrorKind::Other, error))
}

/// Which way a segment crossed the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Sent,
    Received,
}

/// Segment event handler. Captures the connection, the header fields, and the
/// payload length of every segment sent or received.
pub(crate) fn segment_event(
    direction: Direction,
    id: ConnectionId,
    header: &TcpHeader,
    text_len: usize,
) {
    event!(
        target: "SEGMENT",
        Level::TRACE,
        ?direction,
        local = %id.local,
        remote = %id.remote,
        seq = header.seq,
        ack = header.ack,
        wnd = header.wnd,
        ctl = ?header.ctl,
        len = text_len,
    );
}
