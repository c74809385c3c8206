/// Send-side sequence variables. Everything before `una` is acknowledged,
/// `una..nxt` is in flight, and new data may be sent up to `una + wnd`.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Default)]
pub struct SendSequenceSpace {
    pub iss: u32,
    pub una: u32,
    /// Next sequence number to be sent. Rewound to `una` on retransmission.
    pub nxt: u32,
    /// Highest sequence number ever sent, plus one
    pub max: u32,
    /// The peer's window after scaling
    pub wnd: u32,
    /// The largest window the remote TCP has offered
    pub max_wnd: u32,
    /// Sequence and acknowledgment numbers of the segment that last updated
    /// `wnd`
    pub wl1: u32,
    pub wl2: u32,
    /// Shift applied to windows the remote TCP advertises
    pub shift: u8,
    /// Largest payload we put in one segment
    pub mss: u32,
}

impl SendSequenceSpace {
    /// Sequence space sent but not yet acknowledged.
    pub fn in_flight(&self) -> u32 {
        self.nxt.wrapping_sub(self.una)
    }
}
