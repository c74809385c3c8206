/// The state of a connection. The names follow the direction of the FIN
/// exchange rather than RFC 9293's, which are given on each variant. The state
/// machine is described by the diagram below.
///
/// ```text
///                             +---------+ ---------\      active OPEN
///                             |  CLOSED |            \    -----------
///                             +---------+<---------\   \   create TCB
///                               |     ^              \   \  snd SYN
///                  passive OPEN |     |   CLOSE        \   \
///                  ------------ |     | ----------       \   \
///                   create TCB  |     | delete TCB         \   \
///                               V     |                      \   \
///           rcv RST (note 1)  +---------+            CLOSE    |    \
///        -------------------->|  LISTEN |          ---------- |     |
///       /                     +---------+          delete TCB |     |
///      /           rcv SYN      |     |     SEND              |     |
///     /           -----------   |     |    -------            |     V
/// +--------+      snd SYN,ACK  /       \   snd SYN          +--------+
/// |        |<-----------------           ------------------>|        |
/// |  SYN   |                    rcv SYN                     |  SYN   |
/// |  RCVD  |<-----------------------------------------------|  SENT  |
/// |        |                  snd SYN,ACK                   |        |
/// |        |------------------           -------------------|        |
/// +--------+   rcv ACK of SYN  \       /  rcv SYN,ACK       +--------+
///    |         --------------   |     |   -----------
///    |                x         |     |     snd ACK
///    |                          V     V
///    |  CLOSE                 +---------+
///    | -------                |  ESTAB  |
///    | snd FIN                +---------+
///    |                 CLOSE    |     |    rcv FIN
///    V                -------   |     |    -------
/// +---------+         snd FIN  /       \   snd ACK         +---------+
/// |  FIN    |<----------------          ------------------>|  CLOSE  |
/// | WAIT-1  |------------------                            |   WAIT  |
/// +---------+          rcv FIN  \                          +---------+
///   | rcv ACK of FIN   -------   |                          CLOSE  |
///   | --------------   snd ACK   |                         ------- |
///   V        x                   V                         snd FIN V
/// +---------+               +---------+                    +---------+
/// |FINWAIT-2|               | CLOSING |                    | LAST-ACK|
/// +---------+               +---------+                    +---------+
///   |              rcv ACK of FIN |                 rcv ACK of FIN |
///   |  rcv FIN     -------------- |    Timeout=2MSL -------------- |
///   |  -------            x       V    ------------        x       V
///    \ snd ACK              +---------+delete TCB          +---------+
///      -------------------->|TIME-WAIT|------------------->| CLOSED  |
///                           +---------+                    +---------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum State {
    /// No connection. Also the terminal state after a reset or a completed
    /// close.
    Closed,
    /// Waiting for a connection request from any remote TCP.
    Listen,
    /// SYN-SENT: Waiting for a matching connection request after having sent
    /// a connection request.
    SynchronizeSent,
    /// SYN-RECEIVED: Waiting for a confirming connection request
    /// acknowledgment after having both received and sent a connection
    /// request.
    SynchronizeReceived,
    /// An open connection, data received can be delivered to the user. The
    /// normal state for the data transfer phase of the connection.
    Established,
    /// FIN-WAIT-1: Our FIN is sent and not yet acknowledged.
    FinishSent,
    /// CLOSE-WAIT: The peer's FIN arrived. Waiting for the local user to
    /// close.
    FinishReceived,
    /// FIN-WAIT-2: Our FIN is acknowledged. Waiting for the peer's.
    FinishAcknowledged,
    /// Both FINs are sent and ours is not yet acknowledged.
    Closing,
    /// LAST-ACK: The peer's FIN arrived, then ours was sent. Waiting for its
    /// acknowledgment.
    WaitForFinishAcknowledge,
    /// Waiting for enough time to pass to be sure the remote TCP received the
    /// acknowledgment of its connection termination request.
    TimeWait,
}

impl State {
    /// The handshake is underway but not complete.
    pub fn is_synchronizing(self) -> bool {
        matches!(self, Self::SynchronizeSent | Self::SynchronizeReceived)
    }

    /// The local side has closed its sending direction.
    pub fn is_finishing(self) -> bool {
        matches!(
            self,
            Self::FinishSent
                | Self::FinishAcknowledged
                | Self::Closing
                | Self::WaitForFinishAcknowledge
                | Self::TimeWait
        )
    }

    /// Inbound payload may be queued for the reader.
    pub fn accepts_data(self) -> bool {
        matches!(
            self,
            Self::Established | Self::FinishSent | Self::FinishAcknowledged
        )
    }
}
