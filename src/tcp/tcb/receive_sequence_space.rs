/// Receive-side sequence variables. The window accepted from the peer is
/// `nxt..nxt + wnd`.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Default)]
pub struct ReceiveSequenceSpace {
    pub irs: u32,
    /// The next sequence number expected from the peer
    pub nxt: u32,
    /// The number of bytes we can buffer from the remote TCP. The right edge
    /// `nxt + wnd` never moves backwards.
    pub wnd: u32,
    /// Shift applied to windows we advertise
    pub shift: u8,
    /// Largest payload we accept in one segment, offered in our SYN
    pub mss: u32,
    /// The right edge of the last window we advertised
    pub max_advertised: u32,
    /// The acknowledgment number we last sent. Resets are only trusted near
    /// it.
    pub last_ack_sent: u32,
}

impl ReceiveSequenceSpace {
    /// The right edge of the window as it stands.
    pub fn right_edge(&self) -> u32 {
        self.nxt.wrapping_add(self.wnd)
    }
}
