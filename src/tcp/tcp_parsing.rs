//! The TCP header wire format.
//!
//! Headers are a fixed 20-byte block followed by up to 40 bytes of options.
//! Only MSS and window scale are interpreted; other options are skipped.

use crate::{utility::Checksum, Ipv4Address};
use thiserror::Error as ThisError;

/// Length of the header without options
const FIXED_LEN: usize = 20;
/// The largest shift a window scale option may carry
const MAX_WINDOW_SHIFT: u8 = 14;
const TCP_PROTOCOL: u8 = 6;

mod option_kind {
    pub const END: u8 = 0;
    pub const NOP: u8 = 1;
    pub const MSS: u8 = 2;
    pub const WINDOW_SCALE: u8 = 3;
}

/// A decoded TCP header
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    /// Sequence number of the first octet, or the ISN when SYN is set
    pub seq: u32,
    /// The next sequence number the sender expects. Meaningful only with ACK.
    pub ack: u32,
    /// Header length in 32-bit words, options included
    pub data_offset: u8,
    pub ctl: Control,
    /// Window advertisement before scaling
    pub wnd: u16,
    /// Carried through but never interpreted
    pub urg: u16,
    pub checksum: u16,
    pub options: TcpOptions,
}

/// The header options this implementation understands.
#[derive(Debug, Default, Copy, Clone, Hash, PartialEq, Eq)]
pub struct TcpOptions {
    /// The largest segment the sender is willing to receive
    pub mss: Option<u16>,
    /// The sender's window scale shift count
    pub window_shift: Option<u8>,
}

impl TcpOptions {
    fn parse(mut rest: &[u8]) -> Result<Self, ParseError> {
        let mut options = Self::default();
        while let Some((&kind, after_kind)) = rest.split_first() {
            match kind {
                option_kind::END => break,
                option_kind::NOP => {
                    rest = after_kind;
                    continue;
                }
                _ => {}
            }
            let len = match after_kind.first() {
                Some(&len) if len >= 2 && usize::from(len) <= rest.len() => usize::from(len),
                _ => return Err(ParseError::BadOption),
            };
            let (option, after) = rest.split_at(len);
            match (kind, &option[2..]) {
                (option_kind::MSS, &[high, low]) => {
                    options.mss = Some(u16::from_be_bytes([high, low]));
                }
                (option_kind::WINDOW_SCALE, &[shift]) => {
                    options.window_shift = Some(shift.min(MAX_WINDOW_SHIFT));
                }
                _ => {}
            }
            rest = after;
        }
        Ok(options)
    }

    /// Options padded to a whole number of words
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        if let Some(mss) = self.mss {
            out.extend([option_kind::MSS, 4]);
            out.extend(mss.to_be_bytes());
        }
        if let Some(shift) = self.window_shift {
            out.extend([option_kind::NOP, option_kind::WINDOW_SCALE, 3, shift]);
        }
        out
    }
}

impl TcpHeader {
    /// Parses the header at the front of `packet`, a segment of `packet_len`
    /// bytes sent from `src_address` to `dst_address`. The checksum is verified
    /// only when the `compute_checksum` feature is enabled.
    pub fn from_bytes(
        mut packet: impl Iterator<Item = u8>,
        packet_len: usize,
        src_address: Ipv4Address,
        dst_address: Ipv4Address,
    ) -> Result<Self, ParseError> {
        let mut fixed = [0u8; FIXED_LEN];
        for byte in fixed.iter_mut() {
            *byte = packet.next().ok_or(ParseError::HeaderTooShort)?;
        }
        let word = |at: usize| u16::from_be_bytes([fixed[at], fixed[at + 1]]);
        let long = |at: usize| u32::from(word(at)) << 16 | u32::from(word(at + 2));

        let data_offset = fixed[12] >> 4;
        let header_len = usize::from(data_offset) * 4;
        if header_len < FIXED_LEN || header_len > packet_len {
            return Err(ParseError::BadDataOffset(data_offset));
        }
        let option_bytes: Vec<u8> = packet.by_ref().take(header_len - FIXED_LEN).collect();
        if option_bytes.len() + FIXED_LEN < header_len {
            return Err(ParseError::HeaderTooShort);
        }

        let header = Self {
            src_port: word(0),
            dst_port: word(2),
            seq: long(4),
            ack: long(8),
            data_offset,
            ctl: Control::from(fixed[13]),
            wnd: word(14),
            checksum: word(16),
            urg: word(18),
            options: TcpOptions::parse(&option_bytes)?,
        };

        if cfg!(feature = "compute_checksum") {
            let length = u16::try_from(packet_len).map_err(|_| ParseError::PacketTooLong)?;
            let mut sum = pseudo_header(src_address, dst_address, length);
            sum.push(fixed[..16].iter().copied());
            sum.push(fixed[18..].iter().copied());
            sum.push(option_bytes);
            sum.push(packet);
            let actual = sum.finish();
            if actual != header.checksum {
                return Err(ParseError::Checksum {
                    actual,
                    expected: header.checksum,
                });
            }
        }
        Ok(header)
    }

    /// Header length in bytes, options included
    pub fn bytes(&self) -> usize {
        usize::from(self.data_offset) * 4
    }

    /// The header as it goes on the wire.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = self.fixed_part().to_vec();
        out.extend(self.options.encode());
        out
    }

    fn fixed_part(&self) -> [u8; FIXED_LEN] {
        let mut fixed = [0u8; FIXED_LEN];
        fixed[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        fixed[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        fixed[4..8].copy_from_slice(&self.seq.to_be_bytes());
        fixed[8..12].copy_from_slice(&self.ack.to_be_bytes());
        fixed[12] = self.data_offset << 4;
        fixed[13] = self.ctl.into();
        fixed[14..16].copy_from_slice(&self.wnd.to_be_bytes());
        fixed[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        fixed[18..20].copy_from_slice(&self.urg.to_be_bytes());
        fixed
    }
}

fn pseudo_header(src_address: Ipv4Address, dst_address: Ipv4Address, length: u16) -> Checksum {
    let mut sum = Checksum::default();
    sum.push(src_address.to_bytes());
    sum.push(dst_address.to_bytes());
    sum.push([0, TCP_PROTOCOL]);
    sum.push(length.to_be_bytes());
    sum
}

/// Why an inbound header was rejected
#[derive(Debug, ThisError, PartialEq, Eq, Clone, Copy)]
pub enum ParseError {
    #[error("The segment ends inside its header")]
    HeaderTooShort,
    #[error("The segment is longer than 65535 bytes")]
    PacketTooLong,
    #[error("Checksum {actual:#06x} does not match {expected:#06x} in the header")]
    Checksum { actual: u16, expected: u16 },
    #[error("The data offset {0} does not fit the packet")]
    BadDataOffset(u8),
    #[error("A header option was truncated or malformed")]
    BadOption,
}

/// Assembles an outgoing header. Control bits and options accumulate until
/// [`TcpHeaderBuilder::build`] fills in the length and checksum.
#[derive(Debug)]
pub struct TcpHeaderBuilder {
    header: TcpHeader,
}

impl TcpHeaderBuilder {
    pub fn new(src_port: u16, dst_port: u16, seq: u32) -> Self {
        Self {
            header: TcpHeader {
                src_port,
                dst_port,
                seq,
                ack: 0,
                data_offset: 0,
                ctl: Control::default(),
                wnd: 0,
                urg: 0,
                checksum: 0,
                options: TcpOptions::default(),
            },
        }
    }

    fn with(mut self, edit: impl FnOnce(&mut TcpHeader)) -> Self {
        edit(&mut self.header);
        self
    }

    pub fn wnd(self, wnd: u16) -> Self {
        self.with(|header| header.wnd = wnd)
    }

    /// Sets the acknowledgment number along with the ACK bit.
    pub fn ack(self, ack: u32) -> Self {
        self.with(|header| {
            header.ack = ack;
            header.ctl.set_ack(true);
        })
    }

    pub fn psh(self) -> Self {
        self.with(|header| header.ctl.set_psh(true))
    }

    pub fn rst(self) -> Self {
        self.with(|header| header.ctl.set_rst(true))
    }

    pub fn syn(self) -> Self {
        self.with(|header| header.ctl.set_syn(true))
    }

    pub fn fin(self) -> Self {
        self.with(|header| header.ctl.set_fin(true))
    }

    /// Offers a maximum segment size.
    pub fn mss(self, mss: u16) -> Self {
        self.with(|header| header.options.mss = Some(mss))
    }

    /// Offers a window scale shift, clamped to the largest legal one.
    pub fn window_shift(self, shift: u8) -> Self {
        self.with(|header| header.options.window_shift = Some(shift.min(MAX_WINDOW_SHIFT)))
    }

    /// Finishes the header for a segment carrying `text`.
    pub fn build(
        self,
        src_address: Ipv4Address,
        dst_address: Ipv4Address,
        text: impl Iterator<Item = u8>,
        text_len: usize,
    ) -> Result<TcpHeader, BuildHeaderError> {
        let mut header = self.header;
        let options = header.options.encode();
        header.data_offset = ((FIXED_LEN + options.len()) / 4) as u8;
        let length = u16::try_from(header.bytes() + text_len)
            .map_err(|_| BuildHeaderError::OverlyLongPayload)?;

        if cfg!(feature = "compute_checksum") {
            let mut sum = pseudo_header(src_address, dst_address, length);
            sum.push(header.fixed_part());
            sum.push(options);
            sum.push(text);
            header.checksum = sum.finish();
        }
        Ok(header)
    }
}

/// Why an outbound header could not be built
#[derive(Debug, ThisError, PartialEq, Eq, Clone, Copy)]
pub enum BuildHeaderError {
    #[error("The segment would be longer than 65535 bytes")]
    OverlyLongPayload,
}

/// The six control bits of a TCP header
#[derive(Default, Hash, PartialEq, Eq, Clone, Copy)]
pub struct Control(u8);

impl Control {
    const FIN: u8 = 1 << 0;
    const SYN: u8 = 1 << 1;
    const RST: u8 = 1 << 2;
    const PSH: u8 = 1 << 3;
    const ACK: u8 = 1 << 4;
    const URG: u8 = 1 << 5;
    const MASK: u8 = 0b11_1111;

    const NAMES: [(u8, &'static str); 6] = [
        (Self::URG, "URG"),
        (Self::ACK, "ACK"),
        (Self::PSH, "PSH"),
        (Self::RST, "RST"),
        (Self::SYN, "SYN"),
        (Self::FIN, "FIN"),
    ];

    pub const fn new(urg: bool, ack: bool, psh: bool, rst: bool, syn: bool, fin: bool) -> Self {
        const fn flag(on: bool, bit: u8) -> u8 {
            if on {
                bit
            } else {
                0
            }
        }
        Self(
            flag(urg, Self::URG)
                | flag(ack, Self::ACK)
                | flag(psh, Self::PSH)
                | flag(rst, Self::RST)
                | flag(syn, Self::SYN)
                | flag(fin, Self::FIN),
        )
    }

    const fn has(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    fn put(&mut self, bit: u8, on: bool) {
        if on {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    pub const fn urg(self) -> bool {
        self.has(Self::URG)
    }

    pub const fn ack(self) -> bool {
        self.has(Self::ACK)
    }

    pub fn set_ack(&mut self, on: bool) {
        self.put(Self::ACK, on);
    }

    pub const fn psh(self) -> bool {
        self.has(Self::PSH)
    }

    pub fn set_psh(&mut self, on: bool) {
        self.put(Self::PSH, on);
    }

    pub const fn rst(self) -> bool {
        self.has(Self::RST)
    }

    pub fn set_rst(&mut self, on: bool) {
        self.put(Self::RST, on);
    }

    pub const fn syn(self) -> bool {
        self.has(Self::SYN)
    }

    pub fn set_syn(&mut self, on: bool) {
        self.put(Self::SYN, on);
    }

    pub const fn fin(self) -> bool {
        self.has(Self::FIN)
    }

    pub fn set_fin(&mut self, on: bool) {
        self.put(Self::FIN, on);
    }

    /// ACK with nothing but an optional PSH alongside it. These are the
    /// segments the receive fast path accepts.
    pub const fn is_acknowledge_only(self) -> bool {
        self.0 & !Self::PSH == Self::ACK
    }
}

impl From<u8> for Control {
    fn from(bits: u8) -> Self {
        Self(bits & Self::MASK)
    }
}

impl From<Control> for u8 {
    fn from(control: Control) -> Self {
        control.0
    }
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set: Vec<_> = Self::NAMES
            .iter()
            .filter(|(bit, _)| self.has(*bit))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "Control({})", set.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT: &[u8] = b"segment text";
    const CLIENT: Ipv4Address = Ipv4Address::new([10, 0, 0, 1]);
    const SERVER: Ipv4Address = Ipv4Address::new([10, 0, 0, 2]);

    /// A reference header written by etherparse, along with its bytes
    fn reference(options: &[etherparse::TcpOptionElement]) -> (etherparse::TcpHeader, Vec<u8>) {
        let mut header = etherparse::TcpHeader::new(40000, 80, 0xdead_beef, 4096);
        header.acknowledgment_number = 77;
        header.ack = true;
        header.psh = true;
        header.set_options(options).unwrap();
        if cfg!(feature = "compute_checksum") {
            let ip = etherparse::Ipv4Header::new(
                (header.header_len() as usize + TEXT.len()) as u16,
                64,
                etherparse::IpNumber::Tcp,
                CLIENT.to_bytes(),
                SERVER.to_bytes(),
            );
            header.checksum = header.calc_checksum_ipv4(&ip, TEXT).unwrap();
        }
        let mut bytes = vec![];
        header.write(&mut bytes).unwrap();
        (header, bytes)
    }

    fn parse(bytes: &[u8]) -> Result<TcpHeader, ParseError> {
        TcpHeader::from_bytes(bytes.iter().copied(), bytes.len(), CLIENT, SERVER)
    }

    #[test]
    fn reads_what_etherparse_writes() {
        let (expected, bytes) = reference(&[]);
        let len = bytes.len() + TEXT.len();
        let packet = bytes.into_iter().chain(TEXT.iter().copied());
        let header = TcpHeader::from_bytes(packet, len, CLIENT, SERVER).unwrap();

        assert_eq!((header.src_port, header.dst_port), (40000, 80));
        assert_eq!((header.seq, header.ack), (0xdead_beef, 77));
        assert_eq!(header.wnd, 4096);
        assert_eq!(header.checksum, expected.checksum);
        assert_eq!(header.ctl, Control::new(false, true, true, false, false, false));
        assert!(header.ctl.is_acknowledge_only());
        assert_eq!(header.options, TcpOptions::default());
        assert_eq!(header.bytes(), 20);
    }

    #[test]
    fn writes_what_etherparse_writes() {
        let (_, expected) = reference(&[]);
        let header = TcpHeaderBuilder::new(40000, 80, 0xdead_beef)
            .ack(77)
            .psh()
            .wnd(4096)
            .build(CLIENT, SERVER, TEXT.iter().copied(), TEXT.len())
            .unwrap();
        assert_eq!(header.serialize(), expected);
    }

    #[test]
    fn mss_layout_matches_etherparse() {
        let (_, expected) = reference(&[etherparse::TcpOptionElement::MaximumSegmentSize(1460)]);
        let header = TcpHeaderBuilder::new(40000, 80, 0xdead_beef)
            .ack(77)
            .psh()
            .wnd(4096)
            .mss(1460)
            .build(CLIENT, SERVER, TEXT.iter().copied(), TEXT.len())
            .unwrap();
        assert_eq!(header.data_offset, 6);
        assert_eq!(header.serialize(), expected);
    }

    #[test]
    fn options_survive_serialization() {
        let header = TcpHeaderBuilder::new(1, 2, u32::MAX)
            .syn()
            .ack(7)
            .wnd(u16::MAX)
            .mss(1400)
            .window_shift(20)
            .build(CLIENT, SERVER, std::iter::empty(), 0)
            .unwrap();
        assert_eq!(header.data_offset, 7);
        assert_eq!(header.options.window_shift, Some(MAX_WINDOW_SHIFT));
        assert_eq!(parse(&header.serialize()), Ok(header));
    }

    #[test]
    fn rejects_malformed_headers() {
        let bytes = TcpHeaderBuilder::new(1, 2, 3)
            .mss(1400)
            .build(CLIENT, SERVER, std::iter::empty(), 0)
            .unwrap()
            .serialize();

        assert_eq!(parse(&bytes[..19]), Err(ParseError::HeaderTooShort));

        let mut overlong_option = bytes.clone();
        overlong_option[21] = 9;
        assert_eq!(parse(&overlong_option), Err(ParseError::BadOption));

        let mut tiny_option = bytes.clone();
        tiny_option[21] = 1;
        assert_eq!(parse(&tiny_option), Err(ParseError::BadOption));

        let mut short_offset = bytes.clone();
        short_offset[12] = 4 << 4;
        assert_eq!(parse(&short_offset), Err(ParseError::BadDataOffset(4)));

        let mut long_offset = bytes;
        long_offset[12] = 15 << 4;
        assert_eq!(parse(&long_offset), Err(ParseError::BadDataOffset(15)));
    }

    #[cfg(not(feature = "compute_checksum"))]
    #[test]
    fn unknown_options_are_skipped() {
        let base = TcpHeaderBuilder::new(1, 2, 3)
            .build(CLIENT, SERVER, std::iter::empty(), 0)
            .unwrap()
            .serialize();
        let with_options = |offset: u8, options: &[u8]| {
            let mut bytes = base.clone();
            bytes[12] = offset << 4;
            bytes.extend_from_slice(options);
            parse(&bytes).unwrap().options
        };

        // SACK permitted and a timestamp
        let skipped = with_options(8, &[4, 2, 8, 10, 1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(skipped, TcpOptions::default());

        // Nothing after the end of the list is read
        let ended = with_options(8, &[1, 1, 2, 4, 0x05, 0xb4, 0, 3, 3, 9, 9, 9]);
        assert_eq!(ended.mss, Some(1460));
        assert_eq!(ended.window_shift, None);
    }

    #[cfg(feature = "compute_checksum")]
    #[test]
    fn corrupted_text_fails_the_checksum() {
        let (_, mut bytes) = reference(&[]);
        bytes.extend_from_slice(TEXT);
        assert!(parse(&bytes).is_ok());
        let last = bytes.len() - 1;
        bytes[last] ^= 0x40;
        assert!(matches!(parse(&bytes), Err(ParseError::Checksum { .. })));
    }

    #[test]
    fn control_bits() {
        let control = Control::new(true, false, true, false, true, false);
        assert!(control.urg() && control.psh() && control.syn());
        assert!(!control.ack() && !control.rst() && !control.fin());
        assert!(!control.is_acknowledge_only());
        assert_eq!(u8::from(control), 0b10_1010);

        let mut control = Control::default();
        control.set_ack(true);
        control.set_rst(true);
        control.set_fin(true);
        assert_eq!(format!("{control:?}"), "Control(ACK, RST, FIN)");
        control.set_rst(false);
        control.set_fin(false);
        assert!(control.is_acknowledge_only());
        assert_eq!(Control::from(0xd0), Control::new(false, true, false, false, false, false));
    }
}
