//! The transmission control block.
//!
//! A [`Tcb`] holds one connection's sequence spaces, queues, and timers, and
//! makes every protocol decision for it. It never locks and never waits.
//! [`Connection`](super::Connection) keeps it behind a mutex and acts on the
//! [`Event`]s it records once the lock is released.

use self::{receive_sequence_space::ReceiveSequenceSpace, send_sequence_space::SendSequenceSpace};
use super::{
    modular_cmp::{in_window, mod_bounded, mod_ge, mod_geq, mod_le, mod_leq, mod_max, Le, Leq},
    receive_queue::ReceiveQueue,
    segment::Segment,
    segment_action::SegmentAction,
    send_queue::SendQueue,
    state::State,
    tcp_parsing::{Control, TcpHeader, TcpHeaderBuilder},
    timer::Timers,
    ConnectionId,
};
use crate::{
    logging::{self, Direction},
    route::{Datagram, Route, Router},
    Message, TcpConfig, TcpError,
};
use std::{fmt, sync::Arc, time::Duration};
use tracing::{debug, trace, warn};

mod receive_sequence_space;
mod send_sequence_space;


/// Largest value of the 16-bit window field
const MAX_WINDOW: u32 = u16::MAX as u32;
/// Largest window shift RFC 7323 allows
const MAX_WINDOW_SHIFT: u8 = 14;

const ACK: Control = Control::new(false, true, false, false, false, false);
const SYN: Control = Control::new(false, false, false, false, true, false);
const SYN_ACK: Control = Control::new(false, true, false, false, true, false);
const FIN_ACK: Control = Control::new(false, true, false, false, false, true);

/// Something the connection layer acts on after releasing the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// The handshake completed.
    Established,
    /// Data or the end of the stream became available to the reader.
    Readable,
    /// Send queue space was released.
    Writable,
    /// The connection reached CLOSED and leaves the connection table.
    Closed,
    /// The connection entered TIME_WAIT and leaves the connection table.
    TimeWait,
    /// The time-wait timer expired.
    Reclaim,
}

/// How a listening connection answers a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenResult {
    Drop,
    Reset,
    Spawn,
}

/// Decides what a listener does with a segment. Only a bare SYN opens a
/// connection. Anything acknowledging data we never sent is answered with a
/// reset.
pub fn listen_decision(header: &TcpHeader) -> ListenResult {
    let ctl = header.ctl;
    if ctl.rst() {
        ListenResult::Drop
    } else if ctl.ack() {
        ListenResult::Reset
    } else if ctl.syn() && !ctl.fin() {
        ListenResult::Spawn
    } else {
        ListenResult::Drop
    }
}

/// Answers a segment with a reset. `id` is seen from our side: the segment
/// arrived at `id.local` from `id.remote`.
pub fn send_reset(router: &dyn Router, id: ConnectionId, header: &TcpHeader, seg_len: usize) {
    let builder = if header.ctl.ack() {
        TcpHeaderBuilder::new(id.local.port, id.remote.port, header.ack).rst()
    } else {
        TcpHeaderBuilder::new(id.local.port, id.remote.port, 0)
            .rst()
            .ack(header.seq.wrapping_add(seg_len as u32))
    };
    let Some(route) = router.resolve_route(id.remote.address) else {
        debug!(remote = %id.remote, "no route for reset");
        return;
    };
    let reply = match builder.build(id.local.address, id.remote.address, std::iter::empty(), 0) {
        Ok(reply) => reply,
        Err(error) => {
            debug!(%error, "could not build reset");
            return;
        }
    };
    logging::segment_event(Direction::Sent, id, &reply, 0);
    let datagram = Datagram {
        source: id.local.address,
        destination: id.remote.address,
        message: Message::new(reply.serialize()),
    };
    if let Err(error) = router.transmit(&route, datagram) {
        debug!(%error, "failed to send reset");
    }
}

/// One connection's protocol state.
pub struct Tcb {
    id: ConnectionId,
    state: State,
    config: Arc<TcpConfig>,
    router: Arc<dyn Router>,
    route: Option<Route>,
    snd: SendSequenceSpace,
    rcv: ReceiveSequenceSpace,
    send_queue: SendQueue,
    receive_queue: ReceiveQueue,
    /// The first connection-level failure. Reported to every later caller.
    error: Option<TcpError>,
    /// Input has been shut down. Further data is acknowledged and discarded.
    no_receive: bool,
    /// Both sides offered window scaling
    window_scaling: bool,
    timers: Timers,
    rto: Duration,
    retransmissions: u32,
    events: Vec<Event>,
}

impl Tcb {
    pub fn new(id: ConnectionId, config: Arc<TcpConfig>, router: Arc<dyn Router>) -> Self {
        Self {
            id,
            state: State::Closed,
            route: None,
            snd: SendSequenceSpace {
                mss: config.default_mss,
                ..Default::default()
            },
            rcv: ReceiveSequenceSpace {
                wnd: clamp_window(config.receive_buffer_size),
                mss: config.default_mss,
                ..Default::default()
            },
            send_queue: SendQueue::new(config.send_buffer_size),
            receive_queue: ReceiveQueue::new(config.receive_buffer_size),
            error: None,
            no_receive: false,
            window_scaling: config.window_scaling,
            timers: Timers::default(),
            rto: config.initial_rto,
            retransmissions: 0,
            events: Vec::new(),
            config,
            router,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn set_id(&mut self, id: ConnectionId) {
        self.id = id;
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn error(&self) -> Option<TcpError> {
        self.error
    }

    /// The events recorded since the last call.
    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    pub fn listen(&mut self) {
        self.state = State::Listen;
    }

    /// Starts an active open by sending a SYN.
    pub fn connect(&mut self, id: ConnectionId, route: Route, iss: u32) -> Result<(), TcpError> {
        self.id = id;
        self.route = Some(route);
        self.rcv.mss = route.mss();
        self.rcv.shift = if self.window_scaling {
            self.receive_window_shift()
        } else {
            0
        };
        self.snd.iss = iss;
        self.snd.una = iss;
        self.snd.nxt = iss;
        self.snd.max = iss;
        self.send_queue.set_initial_sequence(iss.wrapping_add(1));
        self.state = State::SynchronizeSent;
        debug!(id = ?self.id, iss, "connecting");

        if let Err(error) = self.send_queued(false) {
            self.state = State::Closed;
            return Err(error);
        }
        Ok(())
    }

    /// Initializes a connection spawned by a listener from the peer's SYN and
    /// answers it with a SYN+ACK.
    pub fn spawn(&mut self, id: ConnectionId, iss: u32, mut segment: Segment) -> SegmentAction {
        let header = segment.header;
        logging::segment_event(Direction::Received, id, &header, segment.text.len());
        self.id = id;
        self.state = State::SynchronizeReceived;

        let route = match self.route() {
            Ok(route) => route,
            Err(error) => {
                debug!(%error, remote = %id.remote, "cannot answer connection request");
                self.enter_closed(Some(error));
                return SegmentAction::DROP;
            }
        };
        self.rcv.mss = route.mss();
        self.synchronize_receive_side(header.seq);
        self.snd.iss = iss;
        self.snd.una = iss;
        self.snd.nxt = iss;
        self.snd.max = iss;
        self.send_queue.set_initial_sequence(iss.wrapping_add(1));
        self.apply_synchronize_options(&header);

        if let Err(error) = self.send_queued(false) {
            warn!(%error, "failed to answer connection request");
            self.enter_closed(Some(error));
            return SegmentAction::DROP;
        }

        segment.header.ctl.set_syn(false);
        segment.header.seq = self.rcv.nxt;
        self.receive_remainder(segment)
    }

    /// Processes a segment addressed to this connection.
    pub fn segment_arrives(&mut self, segment: Segment) -> SegmentAction {
        let header = segment.header;
        let seg_len = segment.seg_len();
        logging::segment_event(Direction::Received, self.id, &header, segment.text.len());

        let action = match self.state {
            State::Closed | State::Listen => {
                if header.ctl.rst() {
                    SegmentAction::DROP
                } else {
                    SegmentAction::DROP | SegmentAction::RESET
                }
            }
            State::SynchronizeSent => self.synchronize_sent_receive(segment),
            _ => self.segment_received(segment),
        };

        if action.contains(SegmentAction::RESET) {
            send_reset(&*self.router, self.id, &header, seg_len);
        } else if action.contains(SegmentAction::IMMEDIATE_ACKNOWLEDGE) {
            self.send_acknowledge();
        } else if action.contains(SegmentAction::ACKNOWLEDGE) {
            self.delayed_acknowledge();
        }
        trace!(?action, state = ?self.state, "segment processed");
        action
    }

    fn synchronize_sent_receive(&mut self, mut segment: Segment) -> SegmentAction {
        let header = segment.header;
        if header.ctl.ack() && header.ack != self.snd.nxt {
            return if header.ctl.rst() {
                SegmentAction::DROP
            } else {
                SegmentAction::DROP | SegmentAction::RESET
            };
        }

        if header.ctl.rst() {
            debug!(id = ?self.id, "connection refused");
            self.enter_closed(Some(TcpError::ConnectionRefused));
            return SegmentAction::DROP;
        }

        if !header.ctl.syn() {
            return SegmentAction::DROP;
        }

        self.synchronize_receive_side(header.seq);
        self.apply_synchronize_options(&header);
        segment.header.ctl.set_syn(false);
        segment.header.seq = self.rcv.nxt;

        if header.ctl.ack() {
            self.acknowledge_up_to(header.ack);
            self.mark_established();
        } else {
            // Both sides opened at once. Our SYN goes out again with the ACK.
            self.state = State::SynchronizeReceived;
            self.snd.nxt = self.snd.una;
        }

        self.receive_remainder(segment) | SegmentAction::IMMEDIATE_ACKNOWLEDGE
    }

    fn segment_received(&mut self, segment: Segment) -> SegmentAction {
        let header = segment.header;

        // Header prediction
        if self.state == State::Established
            && header.ctl.is_acknowledge_only()
            && header.seq == self.rcv.nxt
            && self.snd.nxt == self.snd.max
        {
            let advertised = self.scaled_window(&header);
            if advertised > 0 && advertised == self.snd.wnd {
                if segment.text.is_empty() {
                    if mod_bounded(self.snd.una, Le, header.ack, Leq, self.snd.max) {
                        self.acknowledge_up_to(header.ack);
                        self.snd.wl1 = header.seq;
                        self.snd.wl2 = header.ack;
                        self.flush();
                        return SegmentAction::DROP;
                    }
                } else if header.ack == self.snd.una
                    && header.seq == self.receive_queue.contiguous_front()
                    && self.receive_queue.is_contiguous()
                    && segment.text.len() <= self.receive_queue.free()
                    && !self.no_receive
                {
                    self.add_data(header.seq, segment.text);
                    return if header.ctl.psh() {
                        SegmentAction::KEEP | SegmentAction::IMMEDIATE_ACKNOWLEDGE
                    } else {
                        SegmentAction::KEEP | SegmentAction::ACKNOWLEDGE
                    };
                }
            }
        }

        self.slow_path(segment)
    }

    fn slow_path(&mut self, mut segment: Segment) -> SegmentAction {
        // A peer opening at the same time repeats its SYN alongside its ACK
        if self.state == State::SynchronizeReceived
            && segment.header.ctl.syn()
            && !segment.header.ctl.rst()
            && segment.header.seq == self.rcv.irs
        {
            segment.header.ctl.set_syn(false);
            segment.header.seq = segment.header.seq.wrapping_add(1);
        }
        let mut header = segment.header;

        if header.ctl.rst() {
            if in_window(header.seq, self.rcv.last_ack_sent, self.rcv.wnd.max(1)) {
                let error = match self.state {
                    State::SynchronizeReceived => TcpError::ConnectionRefused,
                    State::Closing | State::TimeWait | State::WaitForFinishAcknowledge => {
                        TcpError::NotConnected
                    }
                    _ => TcpError::ConnectionReset,
                };
                debug!(id = ?self.id, %error, "reset by peer");
                self.enter_closed(Some(error));
            } else {
                trace!(seq = header.seq, "ignoring reset outside the window");
            }
            return SegmentAction::DROP;
        }

        if header.ctl.syn()
            || (self.state == State::SynchronizeReceived
                && (mod_le(header.seq, self.rcv.irs)
                    || (header.ctl.ack()
                        && !mod_bounded(self.snd.una, Le, header.ack, Leq, self.snd.max))))
        {
            return SegmentAction::DROP | SegmentAction::RESET;
        }

        // The right edge of the window never moves backwards
        self.rcv.wnd = self
            .rcv
            .wnd
            .max(clamp_window(self.receive_queue.free()));

        if !self.segment_in_sequence(header.seq, segment.text.len() as u32) {
            return SegmentAction::DROP | SegmentAction::IMMEDIATE_ACKNOWLEDGE;
        }

        // Trim to the window
        let mut action = SegmentAction::KEEP;
        let before = self.rcv.nxt.wrapping_sub(header.seq) as i32;
        if before > 0 {
            let mut drop = before as usize;
            if drop > segment.text.len() {
                // The FIN is a repeat as well
                header.ctl.set_fin(false);
                drop = segment.text.len();
            }
            segment.text.remove_front(drop);
            header.seq = header.seq.wrapping_add(drop as u32);
        }
        let beyond = header
            .seq
            .wrapping_add(segment.text.len() as u32)
            .wrapping_sub(self.rcv.right_edge()) as i32;
        if beyond > 0 {
            segment.text.remove_back(beyond as usize);
            header.ctl.set_fin(false);
            header.ctl.set_psh(false);
            if segment.text.is_empty() && self.rcv.wnd == 0 {
                action |= SegmentAction::DROP | SegmentAction::IMMEDIATE_ACKNOWLEDGE;
            }
        }

        if !header.ctl.ack() {
            return SegmentAction::DROP | SegmentAction::IMMEDIATE_ACKNOWLEDGE;
        }

        if self.state == State::SynchronizeReceived {
            self.mark_established();
        }

        if mod_ge(header.ack, self.snd.max) || self.state == State::TimeWait {
            return SegmentAction::DROP | SegmentAction::IMMEDIATE_ACKNOWLEDGE;
        }

        let mut flush = false;
        let mut reopened = false;
        if mod_ge(header.ack, self.snd.una) {
            self.acknowledge_up_to(header.ack);
            flush = true;

            if header.ack == self.send_queue.last_sequence().wrapping_add(1) {
                match self.state {
                    State::FinishSent => {
                        debug!(id = ?self.id, "FIN acknowledged");
                        self.state = State::FinishAcknowledged;
                    }
                    State::Closing => self.enter_time_wait(),
                    State::WaitForFinishAcknowledge => {
                        debug!(id = ?self.id, "connection closed");
                        self.enter_closed(None);
                        return SegmentAction::DROP;
                    }
                    _ => {}
                }
            }
        }

        if mod_le(self.snd.wl1, header.seq)
            || (self.snd.wl1 == header.seq && mod_leq(self.snd.wl2, header.ack))
        {
            let window = self.scaled_window(&header);
            if self.snd.wnd == 0 && window > 0 {
                self.timers.persist.cancel();
                reopened = true;
            }
            self.snd.wnd = window;
            self.snd.max_wnd = self.snd.max_wnd.max(window);
            self.snd.wl1 = header.seq;
            self.snd.wl2 = header.ack;
        }

        let action = action | self.receive_text(Segment::new(header, segment.text));
        if reopened {
            self.send_into_reopened_window();
        } else if flush {
            self.flush();
        }
        action
    }

    /// The peer's window went from zero to open. Anything past `una` was a
    /// probe the peer could not take, so sending restarts there without
    /// waiting on silly window avoidance.
    fn send_into_reopened_window(&mut self) {
        self.snd.nxt = self.snd.una;
        let queued = self.send_queue.bytes_available_from(self.snd.nxt) > 0;
        if let Err(error) = self.send_queued(queued) {
            debug!(%error, "transmission failed");
        }
    }

    /// Queues the payload and handles a FIN. Returns `DROP` unless the
    /// payload was kept.
    fn receive_text(&mut self, segment: Segment) -> SegmentAction {
        let Segment { header, text } = segment;
        let len = text.len() as u32;
        let mut action = SegmentAction::DROP;

        if len > 0 {
            if self.state.accepts_data() {
                let in_order = header.seq == self.rcv.nxt;
                self.add_data(header.seq, text);
                action = if in_order {
                    SegmentAction::KEEP | SegmentAction::ACKNOWLEDGE
                } else {
                    SegmentAction::KEEP | SegmentAction::IMMEDIATE_ACKNOWLEDGE
                };
            } else {
                action |= SegmentAction::ACKNOWLEDGE;
            }
        }

        if header.ctl.fin() && header.seq.wrapping_add(len) == self.rcv.nxt {
            let next = match self.state {
                State::SynchronizeReceived | State::Established => Some(State::FinishReceived),
                State::FinishSent => Some(State::Closing),
                State::FinishAcknowledged => Some(State::TimeWait),
                _ => None,
            };
            if let Some(next) = next {
                debug!(id = ?self.id, ?next, "FIN received");
                self.rcv.nxt = self.rcv.nxt.wrapping_add(1);
                self.events.push(Event::Readable);
                action |= SegmentAction::IMMEDIATE_ACKNOWLEDGE;
                if next == State::TimeWait {
                    self.enter_time_wait();
                } else {
                    self.state = next;
                }
            }
        }
        action
    }

    /// Handles whatever followed the SYN in a handshake segment.
    fn receive_remainder(&mut self, segment: Segment) -> SegmentAction {
        if segment.text.is_empty() && !segment.header.ctl.fin() {
            SegmentAction::DROP
        } else {
            self.receive_text(segment)
        }
    }

    fn add_data(&mut self, seq: u32, text: Message) {
        let right_edge = self.rcv.right_edge();
        self.receive_queue.insert(seq, text);
        if self.no_receive {
            let discard = self.receive_queue.available();
            self.receive_queue.take_contiguous(discard, true);
        }
        let front = self.receive_queue.contiguous_front();
        if mod_ge(front, self.rcv.nxt) {
            self.rcv.nxt = front;
        }
        let offered = if mod_geq(right_edge, self.rcv.nxt) {
            right_edge.wrapping_sub(self.rcv.nxt)
        } else {
            0
        };
        self.rcv.wnd = offered.max(clamp_window(self.receive_queue.free()));
        self.events.push(Event::Readable);
    }

    fn acknowledge_up_to(&mut self, ack: u32) {
        self.snd.una = ack;
        self.send_queue.remove_acknowledged_up_to(ack);
        if mod_le(self.snd.nxt, ack) {
            self.snd.nxt = ack;
        }
        self.retransmissions = 0;
        self.rto = self.config.initial_rto;
        if ack == self.snd.max {
            self.timers.retransmit.cancel();
        } else {
            self.timers.retransmit.arm(self.rto);
        }
        self.events.push(Event::Writable);
    }

    /// RFC 9293 section 3.10.7.4, first check
    fn segment_in_sequence(&self, seq: u32, len: u32) -> bool {
        let nxt = self.rcv.nxt;
        let wnd = self.rcv.wnd;
        match (len, wnd) {
            (0, 0) => seq == nxt,
            (0, _) => in_window(seq, nxt, wnd),
            (_, 0) => false,
            _ => in_window(seq, nxt, wnd) || in_window(seq.wrapping_add(len - 1), nxt, wnd),
        }
    }

    fn synchronize_receive_side(&mut self, irs: u32) {
        self.rcv.irs = irs;
        self.rcv.nxt = irs.wrapping_add(1);
        self.rcv.max_advertised = self.rcv.right_edge();
        self.receive_queue.set_initial_sequence(self.rcv.nxt);
    }

    fn apply_synchronize_options(&mut self, header: &TcpHeader) {
        let offered = header
            .options
            .mss
            .map(u32::from)
            .unwrap_or(self.config.default_mss);
        self.snd.mss = offered.min(self.rcv.mss).max(1);

        match header.options.window_shift {
            Some(shift) if self.window_scaling => {
                self.snd.shift = shift;
                self.rcv.shift = self.receive_window_shift();
            }
            _ => {
                self.window_scaling = false;
                self.snd.shift = 0;
                self.rcv.shift = 0;
            }
        }

        // Windows in SYN segments are never scaled
        self.snd.wnd = u32::from(header.wnd);
        self.snd.max_wnd = self.snd.wnd;
        self.snd.wl1 = header.seq;
        self.snd.wl2 = header.ack;
    }

    fn mark_established(&mut self) {
        debug!(id = ?self.id, "connection established");
        self.state = State::Established;
        self.events.push(Event::Established);
    }

    fn enter_closed(&mut self, error: Option<TcpError>) {
        if let Some(error) = error {
            self.error.get_or_insert(error);
        }
        self.state = State::Closed;
        self.timers.cancel_transfer();
        self.events.push(Event::Closed);
    }

    fn enter_time_wait(&mut self) {
        debug!(id = ?self.id, "entering TIME_WAIT");
        self.state = State::TimeWait;
        self.timers.cancel_transfer();
        self.timers.time_wait.arm(self.config.time_wait());
        self.events.push(Event::TimeWait);
    }

    /// Appends user data to the send queue and sends what the window allows.
    /// The data stays queued even if transmission fails.
    pub fn enqueue(&mut self, message: Message) -> Result<(), TcpError> {
        self.send_queue.add(message);
        if matches!(self.state, State::Established | State::FinishReceived) {
            self.send_queued(false)?;
        }
        Ok(())
    }

    /// Takes up to `max` contiguous bytes for the reader.
    pub fn read(&mut self, max: usize, peek: bool) -> Message {
        let message = self.receive_queue.take_contiguous(max, !peek);
        if !peek && !message.is_empty() {
            // The reader made room, which may be worth announcing
            self.flush();
        }
        message
    }

    pub fn read_available(&self) -> usize {
        self.receive_queue.available()
    }

    pub fn send_free(&self) -> usize {
        self.send_queue.free()
    }

    pub fn send_capacity(&self) -> usize {
        self.send_queue.capacity()
    }

    /// The connection is in a state that accepts payload and input was not
    /// shut down.
    pub fn should_receive(&self) -> bool {
        self.state.accepts_data() && !self.no_receive
    }

    /// The peer's FIN has been received.
    pub fn end_of_stream(&self) -> bool {
        matches!(
            self.state,
            State::FinishReceived
                | State::Closing
                | State::WaitForFinishAcknowledge
                | State::TimeWait
        )
    }

    /// Stops accepting input.
    pub fn shutdown_ingress(&mut self) {
        self.no_receive = true;
        self.events.push(Event::Readable);
    }

    /// Sends a FIN once the queued data is out.
    pub fn shutdown_egress(&mut self) -> Result<(), TcpError> {
        self.state = match self.state {
            State::SynchronizeReceived | State::Established => State::FinishSent,
            State::FinishReceived => State::WaitForFinishAcknowledge,
            _ => return Ok(()),
        };
        debug!(id = ?self.id, state = ?self.state, "closing");
        self.send_queued(false)
    }

    /// Closes the connection. A listener or an unanswered connection attempt
    /// goes straight to CLOSED. Anything else sends a FIN.
    pub fn close(&mut self) -> Result<(), TcpError> {
        match self.state {
            State::Listen | State::SynchronizeSent => {
                self.enter_closed(Some(TcpError::ConnectionAborted));
                Ok(())
            }
            _ => self.shutdown_egress(),
        }
    }

    /// Returns true if the connection can be reclaimed now. Otherwise the
    /// time-wait timer is armed and the connection is reclaimed when it fires.
    pub fn free(&mut self) -> bool {
        if self.state <= State::SynchronizeSent || self.state == State::TimeWait {
            return true;
        }
        self.timers.time_wait.arm(self.config.time_wait());
        false
    }

    /// Lets time pass, firing any timers that expire.
    pub fn advance_time(&mut self, elapsed: Duration) {
        if self.timers.delayed_ack.advance(elapsed) {
            self.send_acknowledge();
        }
        if self.timers.retransmit.advance(elapsed) {
            self.retransmit_timeout();
        }
        if self.timers.persist.advance(elapsed) {
            if let Err(error) = self.send_queued(true) {
                debug!(%error, "window probe failed");
            }
        }
        if self.timers.time_wait.advance(elapsed) {
            self.events.push(Event::Reclaim);
        }
    }

    fn retransmit_timeout(&mut self) {
        if self.snd.una == self.snd.max
            || matches!(self.state, State::Closed | State::Listen | State::TimeWait)
        {
            return;
        }
        // Probing a zero window is not a failure
        if self.snd.wnd > 0 || self.state.is_synchronizing() {
            self.retransmissions += 1;
            if self.retransmissions > self.config.max_retransmissions {
                warn!(
                    id = ?self.id,
                    "giving up after {} retransmissions",
                    self.config.max_retransmissions
                );
                self.enter_closed(Some(TcpError::TimedOut));
                return;
            }
        }
        self.rto = (self.rto * 2).min(self.config.max_rto);
        debug!(id = ?self.id, una = self.snd.una, rto = ?self.rto, "retransmitting");
        self.snd.nxt = self.snd.una;
        self.flush();
    }

    fn send_acknowledge(&mut self) {
        if let Err(error) = self.send_queued(true) {
            debug!(%error, "failed to send acknowledgment");
        }
    }

    fn delayed_acknowledge(&mut self) {
        if self.rcv.last_ack_sent == self.rcv.nxt {
            // Already carried by an outgoing segment
            return;
        }
        if self.timers.delayed_ack.cancel() {
            self.send_acknowledge();
        } else {
            self.timers.delayed_ack.arm(self.config.delayed_ack_timeout);
        }
    }

    fn flush(&mut self) {
        if let Err(error) = self.send_queued(false) {
            debug!(%error, "transmission failed");
        }
    }

    /// Sends as much queued data as the peer's window and the segment size
    /// allow, with the control flags the state calls for. With `force`, one
    /// segment goes out even if there is nothing worth sending, which is how
    /// acknowledgments and window probes are made.
    pub(super) fn send_queued(&mut self, force: bool) -> Result<(), TcpError> {
        if matches!(self.state, State::Closed | State::Listen) {
            return Ok(());
        }
        let route = self.route()?;
        let flags = self.current_flags();
        let queue_end = self.send_queue.last_sequence();
        let in_flight = self.snd.in_flight();
        let unsent = self.send_queue.bytes_available_from(self.snd.nxt);

        let mut send_window = self.snd.wnd;
        if force && send_window == 0 && in_flight == 0 && unsent > 0 {
            // Probe the closed window with a single byte
            send_window = 1;
        }
        let mut length = if self.state.is_synchronizing() {
            0
        } else {
            (send_window.saturating_sub(in_flight) as usize).min(unsent)
        };

        self.rcv.wnd = self
            .rcv
            .wnd
            .max(clamp_window(self.receive_queue.free()));
        let outstanding = self.snd.max != self.snd.una;
        let mss = self.snd.mss.max(1) as usize;
        let mut segment_length = length.min(mss);

        loop {
            let mut ctl = flags;
            if ctl.syn() && self.snd.nxt != self.snd.iss {
                ctl.set_syn(false);
            }
            // The FIN rides on the segment that empties the queue
            if ctl.fin() && self.snd.nxt.wrapping_add(segment_length as u32) != queue_end {
                ctl.set_fin(false);
            }
            let advertised = self.advertised_window(ctl.syn());

            if !force && !self.should_send_segment(ctl, advertised, segment_length, outstanding) {
                if self.send_queue.bytes_available_from(self.snd.nxt) > 0
                    && !self.timers.retransmit.is_active()
                    && !self.timers.persist.is_active()
                {
                    self.timers.persist.arm(self.config.persist_interval);
                }
                return Ok(());
            }

            self.transmit_segment(&route, ctl, advertised, segment_length, queue_end)?;

            length -= segment_length;
            if length == 0 {
                return Ok(());
            }
            segment_length = length.min(mss);
        }
    }

    fn transmit_segment(
        &mut self,
        route: &Route,
        ctl: Control,
        advertised: u16,
        length: usize,
        queue_end: u32,
    ) -> Result<(), TcpError> {
        let text = if length > 0 {
            self.send_queue.copy_window(self.snd.nxt, length)
        } else {
            Message::default()
        };

        let mut builder = TcpHeaderBuilder::new(self.id.local.port, self.id.remote.port, self.snd.nxt)
            .wnd(advertised);
        if ctl.ack() {
            builder = builder.ack(self.rcv.nxt);
        }
        if ctl.syn() {
            builder = builder.syn().mss(self.rcv.mss.min(MAX_WINDOW) as u16);
            if self.window_scaling {
                builder = builder.window_shift(self.rcv.shift);
            }
        }
        if ctl.fin() {
            builder = builder.fin();
        }
        if length > 0 && self.snd.nxt.wrapping_add(length as u32) == queue_end {
            builder = builder.psh();
        }
        let header = builder
            .build(
                self.id.local.address,
                self.id.remote.address,
                text.iter(),
                text.len(),
            )
            .map_err(|_| TcpError::MessageTooLong)?;

        let sequence = self.snd.nxt;
        let previous_max = self.snd.max;
        let consumed = length as u32 + ctl.syn() as u32 + ctl.fin() as u32;
        self.snd.nxt = self.snd.nxt.wrapping_add(consumed);
        self.snd.max = mod_max(self.snd.max, self.snd.nxt);

        logging::segment_event(Direction::Sent, self.id, &header, text.len());
        let mut message = text;
        message.prepend(header.serialize());
        let datagram = Datagram {
            source: self.id.local.address,
            destination: self.id.remote.address,
            message,
        };
        if let Err(error) = self.router.transmit(route, datagram) {
            self.snd.nxt = sequence;
            self.snd.max = previous_max;
            return Err(error.into());
        }

        let shift = if ctl.syn() { 0 } else { self.rcv.shift };
        let offered = self.rcv.nxt.wrapping_add(u32::from(advertised) << shift);
        self.rcv.max_advertised = mod_max(self.rcv.max_advertised, offered);
        if ctl.ack() {
            self.rcv.last_ack_sent = self.rcv.nxt;
            self.timers.delayed_ack.cancel();
        }
        if consumed > 0 {
            self.timers.persist.cancel();
            if !self.timers.retransmit.is_active() {
                self.timers.retransmit.arm(self.rto);
            }
        }
        Ok(())
    }

    /// Sender-side silly window avoidance
    fn should_send_segment(
        &self,
        ctl: Control,
        advertised: u16,
        length: usize,
        outstanding: bool,
    ) -> bool {
        if length > 0 {
            let reaches_end =
                self.snd.nxt.wrapping_add(length as u32) == self.send_queue.last_sequence();
            if length >= self.snd.mss as usize
                || ((!outstanding || self.config.no_delay) && reaches_end)
                || (self.snd.max_wnd > 0 && length >= self.snd.max_wnd as usize / 2)
                || mod_le(self.snd.nxt, self.snd.max)
            {
                return true;
            }
        }

        if advertised > 0 && !self.state.is_synchronizing() {
            let offered = if mod_geq(self.rcv.max_advertised, self.rcv.nxt) {
                self.rcv.max_advertised.wrapping_sub(self.rcv.nxt)
            } else {
                0
            };
            let increase = (u32::from(advertised) << self.rcv.shift).saturating_sub(offered);
            if increase >= 2 * self.rcv.mss
                || increase as usize >= self.receive_queue.capacity() / 2
            {
                return true;
            }
        }

        ctl.syn() || ctl.fin() || ctl.rst()
    }

    fn current_flags(&self) -> Control {
        match self.state {
            State::Closed | State::Listen => Control::default(),
            State::SynchronizeSent => SYN,
            State::SynchronizeReceived => SYN_ACK,
            State::Established
            | State::FinishReceived
            | State::FinishAcknowledged
            | State::TimeWait => ACK,
            State::FinishSent | State::Closing | State::WaitForFinishAcknowledge => FIN_ACK,
        }
    }

    fn advertised_window(&self, synchronize: bool) -> u16 {
        let shift = if synchronize { 0 } else { self.rcv.shift };
        (self.rcv.wnd >> shift).min(MAX_WINDOW) as u16
    }

    fn scaled_window(&self, header: &TcpHeader) -> u32 {
        u32::from(header.wnd) << self.snd.shift
    }

    fn receive_window_shift(&self) -> u8 {
        let capacity = clamp_window(self.receive_queue.capacity());
        let mut shift = 0;
        while shift < MAX_WINDOW_SHIFT && (MAX_WINDOW << shift) < capacity {
            shift += 1;
        }
        shift
    }

    fn route(&mut self) -> Result<Route, TcpError> {
        if let Some(route) = self.route {
            return Ok(route);
        }
        let route = self
            .router
            .resolve_route(self.id.remote.address)
            .ok_or(TcpError::NoRoute)?;
        self.route = Some(route);
        Ok(route)
    }
}

impl fmt::Debug for Tcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tcb")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("snd", &self.snd)
            .field("rcv", &self.rcv)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

fn clamp_window(bytes: usize) -> u32 {
    u32::try_from(bytes).unwrap_or(u32::MAX)
}
