//! Byte buffers for building and taking apart segments.

use std::{
    collections::VecDeque,
    fmt::{self, Display},
    ops::Range,
    sync::Arc,
};

/// A byte string made of shared pieces. Prepending a header and trimming
/// either end only moves piece boundaries, and clones share the underlying
/// bytes, so keeping sent data around for retransmission copies nothing.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pieces: VecDeque<Piece>,
    len: usize,
}

/// The visible part of a shared allocation
#[derive(Debug, Clone)]
struct Piece {
    bytes: Arc<[u8]>,
    visible: Range<usize>,
}

impl Piece {
    fn new(bytes: &[u8]) -> Self {
        Self {
            visible: 0..bytes.len(),
            bytes: bytes.into(),
        }
    }

    fn as_slice(&self) -> &[u8] {
        &self.bytes[self.visible.clone()]
    }

    fn len(&self) -> usize {
        self.visible.len()
    }
}

impl Message {
    /// Creates a message holding a copy of `body`.
    ///
    /// ```
    /// # use elvis_tcp::Message;
    /// let message = Message::new(b"Body");
    /// assert_eq!(message.len(), 4);
    /// ```
    pub fn new(body: impl AsRef<[u8]>) -> Self {
        let mut message = Self::default();
        message.push_back(Piece::new(body.as_ref()));
        message
    }

    /// Puts `header` in front of the current contents.
    ///
    /// ```
    /// # use elvis_tcp::Message;
    /// let mut message = Message::new(b"Body");
    /// message.prepend(b"Header");
    /// assert_eq!(message.to_vec(), b"HeaderBody");
    /// ```
    pub fn prepend(&mut self, header: impl AsRef<[u8]>) {
        let piece = Piece::new(header.as_ref());
        if piece.len() > 0 {
            self.len += piece.len();
            self.pieces.push_front(piece);
        }
    }

    /// Appends `other`, sharing its bytes.
    pub fn concatenate(&mut self, other: Message) {
        for piece in other.pieces {
            self.push_back(piece);
        }
    }

    /// Drops up to `len` bytes from the front. This is how headers are
    /// stripped.
    pub fn remove_front(&mut self, len: usize) {
        let mut remaining = len.min(self.len);
        self.len -= remaining;
        while remaining > 0 {
            let Some(front) = self.pieces.front_mut() else {
                break;
            };
            if front.len() > remaining {
                front.visible.start += remaining;
                break;
            }
            remaining -= front.len();
            self.pieces.pop_front();
        }
    }

    /// Drops up to `len` bytes from the back. This is how trailers are
    /// stripped.
    pub fn remove_back(&mut self, len: usize) {
        let mut remaining = len.min(self.len);
        self.len -= remaining;
        while remaining > 0 {
            let Some(back) = self.pieces.back_mut() else {
                break;
            };
            if back.len() > remaining {
                back.visible.end -= remaining;
                break;
            }
            remaining -= back.len();
            self.pieces.pop_back();
        }
    }

    /// Keeps at most the first `len` bytes.
    pub fn truncate(&mut self, len: usize) {
        self.remove_back(self.len.saturating_sub(len));
    }

    /// Splits off and returns up to the first `len` bytes.
    ///
    /// ```
    /// # use elvis_tcp::Message;
    /// let mut message = Message::new(b"HeaderBody");
    /// assert_eq!(message.cut(6).to_vec(), b"Header");
    /// assert_eq!(message.to_vec(), b"Body");
    /// ```
    pub fn cut(&mut self, len: usize) -> Self {
        let mut front = self.clone();
        front.truncate(len);
        self.remove_front(len);
        front
    }

    /// The bytes in order.
    pub fn iter(&self) -> impl Iterator<Item = u8> + Clone + '_ {
        self.pieces
            .iter()
            .flat_map(|piece| piece.as_slice().iter().copied())
    }

    /// Copies the contents into one contiguous vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for piece in &self.pieces {
            out.extend_from_slice(piece.as_slice());
        }
        out
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn push_back(&mut self, piece: Piece) {
        if piece.len() > 0 {
            self.len += piece.len();
            self.pieces.push_back(piece);
        }
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.iter().eq(other.iter())
    }
}

impl Eq for Message {}

/// Lowercase hex, one byte after another.
impl Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.iter().try_for_each(|byte| write!(f, "{byte:02x}"))
    }
}

impl From<Vec<u8>> for Message {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}
