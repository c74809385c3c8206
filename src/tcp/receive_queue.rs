use crate::Message;
use std::collections::BTreeMap;

/// Inbound bytes waiting for the reader, including data that arrived ahead
/// of a gap.
///
/// Pieces are keyed by their offset in the byte stream rather than by sequence
/// number. Offsets only grow, so the map stays ordered across sequence number
/// wraparound. Pieces never overlap: bytes already held are trimmed from new
/// arrivals.
#[derive(Debug, Clone)]
pub struct ReceiveQueue {
    pieces: BTreeMap<u64, Message>,
    /// Sequence number of the next byte the reader will see
    first_sequence: u32,
    /// Stream offset of `first_sequence`
    first_offset: u64,
    /// Bytes held, contiguous or not
    buffered: usize,
    capacity: usize,
}

impl ReceiveQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            pieces: BTreeMap::new(),
            first_sequence: 0,
            first_offset: 0,
            buffered: 0,
            capacity,
        }
    }

    /// Anchors the queue at the peer's first data sequence number.
    pub fn set_initial_sequence(&mut self, seq: u32) {
        self.first_sequence = seq;
    }

    /// Stores `text`, whose first byte has sequence number `seq`. Bytes before
    /// the reader's position, bytes beyond the capacity, and bytes already
    /// held are discarded. Returns the number of bytes newly stored.
    pub fn insert(&mut self, seq: u32, mut text: Message) -> usize {
        let delta = seq.wrapping_sub(self.first_sequence) as i32;
        if delta < 0 {
            text.remove_front(delta.unsigned_abs() as usize);
        }
        let start = self.first_offset + delta.max(0) as u64;
        let limit = self.first_offset + self.capacity as u64;
        let end = (start + text.len() as u64).min(limit);
        if start >= end {
            return 0;
        }
        text.remove_back(text.len() - (end - start) as usize);

        // Walk the held pieces that overlap [start, end) and fill the gaps
        // between them
        let mut gaps = Vec::new();
        let mut cursor = start;
        let first_key = self
            .pieces
            .range(..=start)
            .next_back()
            .map(|(offset, _)| *offset)
            .unwrap_or(start);
        for (&offset, piece) in self.pieces.range(first_key..end) {
            let piece_end = offset + piece.len() as u64;
            if piece_end <= cursor {
                continue;
            }
            if offset > cursor {
                gaps.push((cursor, offset));
            }
            cursor = cursor.max(piece_end);
            if cursor >= end {
                break;
            }
        }
        if cursor < end {
            gaps.push((cursor, end));
        }

        let mut stored = 0;
        for (gap_start, gap_end) in gaps {
            let mut piece = text.clone();
            let from = (gap_start - start) as usize;
            piece.remove_front(from);
            piece.truncate((gap_end - gap_start) as usize);
            stored += piece.len();
            self.pieces.insert(gap_start, piece);
        }
        self.buffered += stored;
        stored
    }

    /// The number of bytes readable without crossing a gap.
    pub fn available(&self) -> usize {
        let mut cursor = self.first_offset;
        for (&offset, piece) in self.pieces.range(self.first_offset..) {
            if offset != cursor {
                break;
            }
            cursor += piece.len() as u64;
        }
        (cursor - self.first_offset) as usize
    }

    /// Sequence number just past the contiguous data, which is the next byte
    /// expected from the peer.
    pub fn contiguous_front(&self) -> u32 {
        self.first_sequence.wrapping_add(self.available() as u32)
    }

    /// Whether nothing is held beyond a gap.
    pub fn is_contiguous(&self) -> bool {
        self.available() == self.buffered
    }

    /// Removes and returns up to `max` contiguous bytes. With `consume`
    /// false, the bytes are copied and left in place.
    pub fn take_contiguous(&mut self, max: usize, consume: bool) -> Message {
        let len = self.available().min(max);
        let mut out = Message::default();
        let mut remaining = len;
        let mut offset = self.first_offset;
        while remaining > 0 {
            let Some(piece) = self.pieces.get(&offset) else {
                break;
            };
            let mut part = piece.clone();
            part.truncate(remaining);
            remaining -= part.len();
            offset += part.len() as u64;
            out.concatenate(part);
        }

        if consume && len > 0 {
            let mut to_remove = len;
            while to_remove > 0 {
                let Some(mut piece) = self.pieces.remove(&self.first_offset) else {
                    break;
                };
                let taken = piece.len().min(to_remove);
                piece.remove_front(taken);
                to_remove -= taken;
                self.first_offset += taken as u64;
                if !piece.is_empty() {
                    self.pieces.insert(self.first_offset, piece);
                }
            }
            self.first_sequence = self.first_sequence.wrapping_add(len as u32);
            self.buffered -= len;
        }
        out
    }

    /// Bytes held, contiguous or not.
    #[cfg(test)]
    pub fn used(&self) -> usize {
        self.buffered
    }

    pub fn free(&self) -> usize {
        self.capacity.saturating_sub(self.buffered)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_data_is_readable() {
        let mut queue = ReceiveQueue::new(64);
        queue.set_initial_sequence(500);
        assert_eq!(queue.insert(500, Message::new(b"hello ")), 6);
        assert_eq!(queue.insert(506, Message::new(b"world")), 5);
        assert_eq!(queue.available(), 11);
        assert_eq!(queue.contiguous_front(), 511);
        assert_eq!(queue.free(), 53);

        assert_eq!(queue.take_contiguous(5, false).to_vec(), b"hello");
        assert_eq!(queue.available(), 11);
        assert_eq!(queue.take_contiguous(8, true).to_vec(), b"hello wo");
        assert_eq!(queue.take_contiguous(100, true).to_vec(), b"rld");
        assert_eq!(queue.used(), 0);
        assert_eq!(queue.contiguous_front(), 511);
    }

    #[test]
    fn gaps_hold_back_later_data() {
        let mut queue = ReceiveQueue::new(64);
        queue.set_initial_sequence(0);
        queue.insert(5, Message::new(b"fgh"));
        assert_eq!(queue.available(), 0);
        assert_eq!(queue.contiguous_front(), 0);
        assert!(!queue.is_contiguous());
        assert_eq!(queue.used(), 3);
        assert!(queue.take_contiguous(10, true).is_empty());

        queue.insert(0, Message::new(b"abcde"));
        assert!(queue.is_contiguous());
        assert_eq!(queue.contiguous_front(), 8);
        assert_eq!(queue.take_contiguous(10, true).to_vec(), b"abcdefgh");
    }

    #[test]
    fn overlaps_and_duplicates_are_trimmed() {
        let mut queue = ReceiveQueue::new(64);
        queue.set_initial_sequence(100);
        queue.insert(102, Message::new(b"cd"));
        queue.insert(106, Message::new(b"gh"));
        assert_eq!(queue.insert(100, Message::new(b"abcdefghij")), 6);
        assert_eq!(queue.insert(103, Message::new(b"de")), 0);
        assert_eq!(queue.used(), 10);
        assert_eq!(queue.take_contiguous(4, true).to_vec(), b"abcd");

        // Partly before the reader's position
        assert_eq!(queue.insert(102, Message::new(b"cdefghijkl")), 2);
        assert_eq!(queue.take_contiguous(100, true).to_vec(), b"efghijkl");
    }

    #[test]
    fn capacity_bounds_storage() {
        let mut queue = ReceiveQueue::new(4);
        queue.set_initial_sequence(0);
        assert_eq!(queue.insert(2, Message::new(b"cdef")), 2);
        assert_eq!(queue.insert(0, Message::new(b"ab")), 2);
        assert_eq!(queue.free(), 0);
        assert_eq!(queue.take_contiguous(10, true).to_vec(), b"abcd");
        assert_eq!(queue.free(), 4);
        assert_eq!(queue.insert(4, Message::new(b"efgh")), 4);
    }

    #[test]
    fn sequence_numbers_wrap() {
        let mut queue = ReceiveQueue::new(64);
        let start = 0xffff_fff0;
        queue.set_initial_sequence(start);
        let data: Vec<u8> = (0..32).collect();
        queue.insert(start.wrapping_add(16), Message::new(&data[16..]));
        queue.insert(start, Message::new(&data[..16]));
        assert_eq!(queue.contiguous_front(), 16);
        assert_eq!(queue.take_contiguous(64, true).to_vec(), data);
    }
}
