use super::modular_cmp::{mod_ge, mod_le};
use crate::Message;

/// Outbound bytes, from the oldest unacknowledged byte to the newest byte the
/// user wrote, addressed by absolute sequence number.
#[derive(Debug, Clone)]
pub struct SendQueue {
    data: Message,
    /// Sequence number of the first byte in `data`
    first_sequence: u32,
    capacity: usize,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Message::default(),
            first_sequence: 0,
            capacity,
        }
    }

    /// Anchors the queue at the first data sequence number, one past the SYN.
    pub fn set_initial_sequence(&mut self, seq: u32) {
        self.first_sequence = seq;
    }

    /// Appends bytes written by the user. Callers check [`free`](Self::free)
    /// first.
    pub fn add(&mut self, message: Message) {
        self.data.concatenate(message);
    }

    /// Sequence number of the first byte still held.
    #[cfg(test)]
    pub fn first_sequence(&self) -> u32 {
        self.first_sequence
    }

    /// One past the sequence number of the last byte held. A FIN takes this
    /// sequence number.
    pub fn last_sequence(&self) -> u32 {
        self.first_sequence.wrapping_add(self.data.len() as u32)
    }

    /// The number of bytes from `seq` to the end of the queue.
    pub fn bytes_available_from(&self, seq: u32) -> usize {
        if mod_ge(seq, self.last_sequence()) {
            0
        } else if mod_le(seq, self.first_sequence) {
            self.data.len()
        } else {
            self.last_sequence().wrapping_sub(seq) as usize
        }
    }

    /// Drops every byte before `seq`.
    pub fn remove_acknowledged_up_to(&mut self, seq: u32) {
        if mod_le(self.first_sequence, seq) {
            let acknowledged = (seq.wrapping_sub(self.first_sequence) as usize).min(self.data.len());
            self.data.remove_front(acknowledged);
            self.first_sequence = self.first_sequence.wrapping_add(acknowledged as u32);
        }
    }

    /// Up to `max` bytes starting at `seq`, sharing storage with the queue.
    pub fn copy_window(&self, seq: u32, max: usize) -> Message {
        let offset = if mod_le(seq, self.first_sequence) {
            0
        } else {
            seq.wrapping_sub(self.first_sequence) as usize
        };
        let mut window = self.data.clone();
        window.remove_front(offset);
        window.truncate(max);
        window
    }

    #[cfg(test)]
    pub fn used(&self) -> usize {
        self.data.len()
    }

    pub fn free(&self) -> usize {
        self.capacity.saturating_sub(self.data.len())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_at(seq: u32) -> SendQueue {
        let mut queue = SendQueue::new(16);
        queue.set_initial_sequence(seq);
        queue.add(Message::new(b"abcdef"));
        queue.add(Message::new(b"ghij"));
        queue
    }

    #[test]
    fn windows_are_addressed_by_sequence() {
        let queue = queue_at(1000);
        assert_eq!(queue.used(), 10);
        assert_eq!(queue.free(), 6);
        assert_eq!(queue.last_sequence(), 1010);
        assert_eq!(queue.bytes_available_from(1000), 10);
        assert_eq!(queue.bytes_available_from(1004), 6);
        assert_eq!(queue.bytes_available_from(1010), 0);
        assert_eq!(queue.bytes_available_from(1011), 0);
        assert_eq!(queue.copy_window(1004, 4).to_vec(), b"efgh");
        assert_eq!(queue.copy_window(1008, 100).to_vec(), b"ij");
        assert_eq!(queue.used(), 10);
    }

    #[test]
    fn acknowledgment_releases_space() {
        let mut queue = queue_at(1000);
        queue.remove_acknowledged_up_to(1007);
        assert_eq!(queue.first_sequence(), 1007);
        assert_eq!(queue.free(), 13);
        assert_eq!(queue.copy_window(1007, 10).to_vec(), b"hij");

        // Old acknowledgments and the sequence number of a FIN are harmless
        queue.remove_acknowledged_up_to(1003);
        assert_eq!(queue.first_sequence(), 1007);
        queue.remove_acknowledged_up_to(1011);
        assert!(queue.is_empty());
        assert_eq!(queue.first_sequence(), 1010);
    }

    #[test]
    fn addressing_wraps() {
        let mut queue = queue_at(u32::MAX - 3);
        assert_eq!(queue.last_sequence(), 6);
        assert_eq!(queue.bytes_available_from(1), 5);
        assert_eq!(queue.copy_window(u32::MAX, 3).to_vec(), b"def");
        queue.remove_acknowledged_up_to(2);
        assert_eq!(queue.first_sequence(), 2);
        assert_eq!(queue.copy_window(2, 100).to_vec(), b"ghij");
    }
}
