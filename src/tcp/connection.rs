//! The socket-facing side of a connection.

use super::{
    notify::NotifyType,
    segment::Segment,
    segment_action::SegmentAction,
    state::State,
    tcb::{listen_decision, send_reset, Event, ListenResult, Tcb},
    ConnectionId, Tcp,
};
use crate::{route::Router, Endpoint, Message, TcpConfig, TcpError};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};
use tokio::{
    sync::Notify,
    time::{timeout_at, Instant},
};
use tracing::{debug, trace};

/// Which half of a connection to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Discard further input.
    Read,
    /// Send a FIN once the queued data is out.
    Write,
    Both,
}

/// Modifiers for [`Connection::read_data`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadFlags {
    /// Leave the data in the receive queue.
    pub peek: bool,
    /// Return immediately instead of waiting, even on a blocking connection.
    pub dont_wait: bool,
    /// Wait until the full amount is available or the stream ends.
    pub wait_all: bool,
}

#[derive(Debug, Clone, Copy)]
struct SocketOptions {
    blocking: bool,
    send_timeout: Option<Duration>,
    receive_timeout: Option<Duration>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            blocking: true,
            send_timeout: None,
            receive_timeout: None,
        }
    }
}

/// Children of a listener that have not been accepted yet.
#[derive(Default)]
struct AcceptQueue {
    /// Established and waiting for `accept`
    pending: VecDeque<Arc<Connection>>,
    /// Still in the handshake
    spawning: usize,
    backlog: usize,
}

/// One end of a TCP connection.
///
/// All protocol state lives in a [`Tcb`] behind a mutex that is never held
/// across an `.await`. Callers that need to wait for the handshake, for send
/// space, for data, or for a child connection park on one of two gates and
/// check their condition again each time the gate opens.
pub struct Connection {
    tcb: Mutex<Tcb>,
    stack: Weak<Tcp>,
    router: Arc<dyn Router>,
    config: Arc<TcpConfig>,
    /// Opened when the handshake resolves or send space is freed
    connect_gate: Notify,
    /// Opened when data or a child connection becomes available
    read_gate: Notify,
    options: Mutex<SocketOptions>,
    accept: Mutex<AcceptQueue>,
    /// The listener that spawned this connection, until it is handed over
    parent: Mutex<Option<Weak<Connection>>>,
}

impl Connection {
    pub(super) fn new(stack: Weak<Tcp>, config: Arc<TcpConfig>, router: Arc<dyn Router>) -> Self {
        Self {
            tcb: Mutex::new(Tcb::new(
                ConnectionId::default(),
                config.clone(),
                router.clone(),
            )),
            stack,
            router,
            config,
            connect_gate: Notify::new(),
            read_gate: Notify::new(),
            options: Default::default(),
            accept: Default::default(),
            parent: Default::default(),
        }
    }

    pub fn state(&self) -> State {
        self.lock().state()
    }

    pub fn id(&self) -> ConnectionId {
        self.lock().id()
    }

    pub fn local(&self) -> Endpoint {
        self.id().local
    }

    pub fn peer(&self) -> Endpoint {
        self.id().remote
    }

    /// The error that ended the connection, if any.
    pub fn error(&self) -> Option<TcpError> {
        self.lock().error()
    }

    pub fn set_blocking(&self, blocking: bool) {
        lock(&self.options).blocking = blocking;
    }

    /// Bounds how long [`connect`](Self::connect) and
    /// [`send_data`](Self::send_data) wait.
    pub fn set_send_timeout(&self, timeout: Option<Duration>) {
        lock(&self.options).send_timeout = timeout;
    }

    /// Bounds how long [`accept`](Self::accept) and
    /// [`read_data`](Self::read_data) wait.
    pub fn set_receive_timeout(&self, timeout: Option<Duration>) {
        lock(&self.options).receive_timeout = timeout;
    }

    /// Claims a local endpoint. A zero port is replaced with an ephemeral one.
    pub fn bind(self: &Arc<Self>, local: Endpoint) -> Result<(), TcpError> {
        let stack = self.stack()?;
        let mut tcb = self.lock();
        if tcb.state() != State::Closed {
            return Err(TcpError::AlreadyConnected);
        }
        if tcb.id().local.port != 0 {
            return Err(TcpError::BadValue);
        }
        if !local.address.is_unspecified() && !self.router.is_local(local.address) {
            return Err(TcpError::AddressNotAvailable);
        }
        let id = stack
            .table
            .bind(ConnectionId::new(local, Endpoint::UNSPECIFIED), self)?;
        debug!(local = %id.local, "bound");
        tcb.set_id(id);
        Ok(())
    }

    /// Gives up the local endpoint.
    pub fn unbind(self: &Arc<Self>) -> Result<(), TcpError> {
        let stack = self.stack()?;
        let mut tcb = self.lock();
        if !stack.table.unbind(tcb.id(), self) {
            return Err(TcpError::NotBound);
        }
        tcb.set_id(ConnectionId::default());
        Ok(())
    }

    /// Starts accepting connections on the bound endpoint. At most `backlog`
    /// children wait to be accepted at a time.
    pub fn listen(&self, backlog: usize) -> Result<(), TcpError> {
        let mut tcb = self.lock();
        if tcb.state() != State::Closed {
            return Err(TcpError::BadValue);
        }
        if tcb.id().local.port == 0 {
            return Err(TcpError::DestinationRequired);
        }
        lock(&self.accept).backlog = backlog.max(1);
        tcb.listen();
        debug!(local = %tcb.id().local, backlog, "listening");
        Ok(())
    }

    /// Opens a connection to `peer`. A blocking connection waits for the
    /// handshake to finish.
    pub async fn connect(self: &Arc<Self>, peer: Endpoint) -> Result<(), TcpError> {
        let stack = self.stack()?;
        let abandoned = {
            let mut tcb = self.lock();
            let abandoned = match tcb.state() {
                State::Closed => Vec::new(),
                State::Listen => self.take_pending(),
                _ => return Err(TcpError::AlreadyConnected),
            };
            let route = self
                .router
                .resolve_route(peer.address)
                .ok_or(TcpError::NoRoute)?;

            let old = tcb.id();
            let mut local = old.local;
            if local.address.is_unspecified() {
                local.address = route.source;
            }
            let id = stack
                .table
                .set_connection(old, ConnectionId::new(local, peer), self)?;
            if let Err(error) = tcb.connect(id, route, rand::random()) {
                stack.table.remove(id, self);
                if old.local.port != 0 && stack.table.insert(old, self.clone()).is_err() {
                    debug!(local = %old.local, "lost binding after failed connect");
                }
                tcb.set_id(old);
                return Err(error);
            }
            self.release(tcb);
            abandoned
        };
        for child in abandoned {
            child.close();
        }

        let options = *lock(&self.options);
        if !options.blocking {
            return Err(TcpError::InProgress);
        }
        let timeout = options
            .send_timeout
            .map_or(self.config.connection_timeout, |timeout| {
                timeout.min(self.config.connection_timeout)
            });
        self.wait(&self.connect_gate, Some(timeout), None, |tcb| {
            match tcb.state() {
                State::SynchronizeSent | State::SynchronizeReceived => None,
                State::Closed => Some(Err(tcb.error().unwrap_or(TcpError::ConnectionRefused))),
                _ => Some(Ok(())),
            }
        })
        .await
    }

    /// Takes the next established child of a listener.
    pub async fn accept(self: &Arc<Self>) -> Result<Arc<Connection>, TcpError> {
        let options = *lock(&self.options);
        let would_block = (!options.blocking).then_some(TcpError::WouldBlock);
        self.wait(&self.read_gate, options.receive_timeout, would_block, |tcb| {
            if tcb.state() != State::Listen {
                return Some(Err(tcb.error().unwrap_or(TcpError::BadValue)));
            }
            lock(&self.accept).pending.pop_front().map(Ok)
        })
        .await
    }

    /// Shuts down one or both directions of the stream.
    pub fn shutdown(self: &Arc<Self>, direction: Direction) -> Result<(), TcpError> {
        let mut tcb = self.lock();
        if matches!(tcb.state(), State::Closed | State::Listen) {
            return Err(TcpError::NotConnected);
        }
        if matches!(direction, Direction::Read | Direction::Both) {
            tcb.shutdown_ingress();
        }
        if matches!(direction, Direction::Write | Direction::Both) {
            if let Err(error) = tcb.shutdown_egress() {
                debug!(%error, "FIN not sent yet");
            }
        }
        self.release(tcb);
        Ok(())
    }

    /// Queues `message` for the peer, waiting for send space if the queue is
    /// full. Returns once the data is queued.
    pub async fn send_data(self: &Arc<Self>, message: Message) -> Result<(), TcpError> {
        {
            let tcb = self.lock();
            send_side_open(tcb.state())?;
            if message.len() > tcb.send_capacity() {
                return Err(TcpError::MessageTooLong);
            }
        }
        if message.is_empty() {
            return Ok(());
        }

        let options = *lock(&self.options);
        let would_block = (!options.blocking).then_some(TcpError::WouldBlock);
        let len = message.len();
        let mut message = Some(message);
        self.wait(&self.connect_gate, options.send_timeout, would_block, |tcb| {
            if tcb.state() == State::Closed {
                return Some(Err(tcb.error().unwrap_or(TcpError::NotConnected)));
            }
            if let Err(error) = send_side_open(tcb.state()) {
                return Some(Err(error));
            }
            if tcb.send_free() < len {
                return None;
            }
            if let Err(error) = tcb.enqueue(message.take()?) {
                debug!(%error, "data queued but not sent");
            }
            Some(Ok(()))
        })
        .await
    }

    /// Free space in the send queue.
    pub fn send_available(&self) -> Result<usize, TcpError> {
        let tcb = self.lock();
        send_side_open(tcb.state())?;
        Ok(tcb.send_free())
    }

    /// Reads up to `max` bytes. An empty message means the peer has finished
    /// sending.
    pub async fn read_data(
        self: &Arc<Self>,
        max: usize,
        flags: ReadFlags,
    ) -> Result<Message, TcpError> {
        if max == 0 {
            return Ok(Message::default());
        }
        let options = *lock(&self.options);
        let would_block =
            (!options.blocking || flags.dont_wait).then_some(TcpError::WouldBlock);

        // A connection still in its handshake has nothing to read yet
        self.wait(
            &self.connect_gate,
            options.receive_timeout,
            would_block,
            |tcb| (!tcb.state().is_synchronizing()).then_some(Ok(())),
        )
        .await?;

        self.wait(&self.read_gate, options.receive_timeout, would_block, |tcb| {
            let available = tcb.read_available();
            let state = tcb.state();
            if state == State::Listen {
                return Some(Err(TcpError::NotConnected));
            }
            let finished = tcb.end_of_stream() || !tcb.should_receive();
            if available > 0 && (!flags.wait_all || available >= max || finished) {
                return Some(Ok(tcb.read(max, flags.peek)));
            }
            if available == 0 && state == State::Closed {
                return Some(Err(tcb.error().unwrap_or(TcpError::NotConnected)));
            }
            if available == 0 && finished {
                return Some(Ok(Message::default()));
            }
            None
        })
        .await
    }

    /// Bytes ready to read, or for a listener the number of connections ready
    /// to accept.
    pub fn read_available(&self) -> Result<usize, TcpError> {
        let tcb = self.lock();
        match tcb.state() {
            State::Listen => Ok(lock(&self.accept).pending.len()),
            State::SynchronizeSent => Ok(0),
            _ => {
                let available = tcb.read_available();
                if available == 0 && !tcb.should_receive() {
                    Err(TcpError::NotConnected)
                } else {
                    Ok(available)
                }
            }
        }
    }

    /// Begins closing the connection and returns without waiting. Children
    /// a listener has not handed out are closed too.
    pub fn close(self: &Arc<Self>) {
        let mut tcb = self.lock();
        let listening = tcb.state() == State::Listen;
        if let Err(error) = tcb.close() {
            debug!(%error, "closing without sending FIN");
        }
        self.release(tcb);
        if listening {
            for child in self.take_pending() {
                child.close();
            }
        }
    }

    /// Releases the connection. One that never synchronized leaves the table
    /// now; any other is reclaimed after the time-wait period.
    pub fn free(self: &Arc<Self>) {
        let mut tcb = self.lock();
        let id = tcb.id();
        if tcb.free() {
            drop(tcb);
            if let Some(stack) = self.stack.upgrade() {
                stack.table.remove(id, self);
                stack
                    .time_wait
                    .remove_if(&id, |_, held| Arc::ptr_eq(held, self));
            }
        }
    }

    /// Processes a segment that arrived at `wire.local` from `wire.remote`.
    pub(super) fn segment_arrives(
        self: &Arc<Self>,
        segment: Segment,
        wire: ConnectionId,
    ) -> SegmentAction {
        let mut tcb = self.lock();
        match tcb.state() {
            State::Listen => {
                drop(tcb);
                match listen_decision(&segment.header) {
                    ListenResult::Spawn => self.spawn_child(segment, wire),
                    ListenResult::Reset => {
                        send_reset(&*self.router, wire, &segment.header, segment.seg_len());
                        SegmentAction::DROP | SegmentAction::RESET
                    }
                    ListenResult::Drop => SegmentAction::DROP,
                }
            }
            State::Closed => {
                drop(tcb);
                if segment.header.ctl.rst() {
                    SegmentAction::DROP
                } else {
                    send_reset(&*self.router, wire, &segment.header, segment.seg_len());
                    SegmentAction::DROP | SegmentAction::RESET
                }
            }
            _ => {
                let action = tcb.segment_arrives(segment);
                self.release(tcb);
                action
            }
        }
    }

    pub(super) fn advance_time(self: &Arc<Self>, elapsed: Duration) {
        let mut tcb = self.lock();
        tcb.advance_time(elapsed);
        self.release(tcb);
    }

    fn spawn_child(self: &Arc<Self>, segment: Segment, id: ConnectionId) -> SegmentAction {
        let Some(stack) = self.stack.upgrade() else {
            return SegmentAction::DROP;
        };
        {
            let mut accept = lock(&self.accept);
            if accept.pending.len() + accept.spawning >= accept.backlog {
                debug!(local = %id.local, remote = %id.remote, "backlog full");
                return SegmentAction::DROP;
            }
            accept.spawning += 1;
        }

        let child = Arc::new(Connection::new(
            self.stack.clone(),
            self.config.clone(),
            self.router.clone(),
        ));
        *lock(&child.options) = *lock(&self.options);
        *lock(&child.parent) = Some(Arc::downgrade(self));

        let mut tcb = child.lock();
        if let Err(error) = stack.table.insert(id, child.clone()) {
            debug!(%error, "cannot spawn connection");
            lock(&self.accept).spawning -= 1;
            return SegmentAction::DROP;
        }
        let action = tcb.spawn(id, rand::random(), segment);
        child.release(tcb);
        action
    }

    /// Gives an established child to the listener that spawned it.
    fn hand_to_listener(self: &Arc<Self>) {
        let Some(parent) = lock(&self.parent).take().and_then(|parent| parent.upgrade()) else {
            return;
        };
        let parent_tcb = parent.lock();
        let listening = parent_tcb.state() == State::Listen;
        {
            let mut accept = lock(&parent.accept);
            accept.spawning = accept.spawning.saturating_sub(1);
            if listening {
                accept.pending.push_back(self.clone());
            }
        }
        let parent_id = parent_tcb.id();
        drop(parent_tcb);

        if listening {
            parent.read_gate.notify_waiters();
            parent.notify(parent_id, NotifyType::NewConnection);
        } else {
            self.close();
        }
    }

    /// A child that never finished its handshake stops counting against the
    /// listener's backlog.
    fn leave_listener(&self) {
        if let Some(parent) = lock(&self.parent).take().and_then(|parent| parent.upgrade()) {
            let mut accept = lock(&parent.accept);
            accept.spawning = accept.spawning.saturating_sub(1);
        }
    }

    fn take_pending(&self) -> Vec<Arc<Connection>> {
        lock(&self.accept).pending.drain(..).collect()
    }

    /// Unlocks the control block and acts on whatever it recorded.
    fn release(self: &Arc<Self>, mut tcb: MutexGuard<'_, Tcb>) {
        let events = tcb.take_events();
        if events.is_empty() {
            return;
        }
        let id = tcb.id();
        let readable = tcb.read_available();
        let writable = tcb.send_free();
        drop(tcb);

        let stack = self.stack.upgrade();
        for event in events {
            trace!(?event, local = %id.local, remote = %id.remote, "connection event");
            match event {
                Event::Established => {
                    self.connect_gate.notify_waiters();
                    self.read_gate.notify_waiters();
                    self.hand_to_listener();
                    self.notify(id, NotifyType::Writable(writable));
                }
                Event::Readable => {
                    self.read_gate.notify_waiters();
                    self.notify(id, NotifyType::Readable(readable));
                }
                Event::Writable => {
                    self.connect_gate.notify_waiters();
                    self.notify(id, NotifyType::Writable(writable));
                }
                Event::Closed => {
                    self.connect_gate.notify_waiters();
                    self.read_gate.notify_waiters();
                    if let Some(stack) = &stack {
                        stack.table.remove(id, self);
                    }
                    self.leave_listener();
                    self.notify(id, NotifyType::Closed);
                }
                Event::TimeWait => {
                    self.connect_gate.notify_waiters();
                    self.read_gate.notify_waiters();
                    if let Some(stack) = &stack {
                        stack.table.remove(id, self);
                        stack.time_wait.insert(id, self.clone());
                    }
                }
                Event::Reclaim => {
                    if let Some(stack) = &stack {
                        stack.table.remove(id, self);
                        stack
                            .time_wait
                            .remove_if(&id, |_, held| Arc::ptr_eq(held, self));
                    }
                    debug!(local = %id.local, remote = %id.remote, "reclaimed");
                }
            }
        }
    }

    fn notify(&self, id: ConnectionId, notification: NotifyType) {
        if let Some(events) = self.stack.upgrade().and_then(|stack| stack.events.clone()) {
            events.notify(id, notification);
        }
    }

    /// Parks on `gate` until `check` produces an outcome. `check` runs with
    /// the control block locked, first right away and then each time the gate
    /// opens. With `would_block` set, gives up with that error instead of
    /// parking.
    async fn wait<T>(
        self: &Arc<Self>,
        gate: &Notify,
        timeout: Option<Duration>,
        would_block: Option<TcpError>,
        mut check: impl FnMut(&mut Tcb) -> Option<Result<T, TcpError>>,
    ) -> Result<T, TcpError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let notified = gate.notified();
            tokio::pin!(notified);
            // Registered before checking so a wakeup in between is not lost
            notified.as_mut().enable();

            let outcome = {
                let mut tcb = self.lock();
                let outcome = check(&mut *tcb);
                self.release(tcb);
                outcome
            };
            if let Some(outcome) = outcome {
                return outcome;
            }
            if let Some(error) = would_block {
                return Err(error);
            }
            match deadline {
                Some(deadline) => timeout_at(deadline, notified)
                    .await
                    .map_err(|_| TcpError::TimedOut)?,
                None => notified.await,
            }
        }
    }

    fn stack(&self) -> Result<Arc<Tcp>, TcpError> {
        self.stack.upgrade().ok_or(TcpError::NotConnected)
    }

    fn lock(&self) -> MutexGuard<'_, Tcb> {
        lock(&self.tcb)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("tcb", &*self.lock())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn send_side_open(state: State) -> Result<(), TcpError> {
    match state {
        State::Closed => Err(TcpError::NotConnected),
        State::Listen => Err(TcpError::NotSupported),
        state if state.is_finishing() => Err(TcpError::BrokenPipe),
        _ => Ok(()),
    }
}
