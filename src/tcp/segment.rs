use super::tcp_parsing::TcpHeader;
use crate::Message;

/// A parsed header and the payload that followed it.
#[derive(Debug, Clone)]
pub struct Segment {
    pub header: TcpHeader,
    pub text: Message,
}

impl Segment {
    pub fn new(header: TcpHeader, text: Message) -> Self {
        Self { header, text }
    }

    /// Sequence space the segment occupies. SYN and FIN count one each.
    pub fn seg_len(&self) -> usize {
        let ctl = self.header.ctl;
        self.text.len() + usize::from(ctl.syn()) + usize::from(ctl.fin())
    }
}
