use std::ops::{BitOr, BitOrAssign};

/// What became of an inbound segment, and what the connection owes the peer
/// in response. Values combine with `|`.
#[derive(Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentAction(u8);

impl SegmentAction {
    /// The payload was queued for the reader.
    pub const KEEP: Self = Self(0);
    /// Nothing from the segment was kept.
    pub const DROP: Self = Self(1);
    /// The peer is answered with a reset.
    pub const RESET: Self = Self(1 << 1);
    /// An acknowledgment is owed and may be delayed.
    pub const ACKNOWLEDGE: Self = Self(1 << 2);
    /// An acknowledgment is sent right away.
    pub const IMMEDIATE_ACKNOWLEDGE: Self = Self(1 << 3);

    /// Whether every flag in `other` is set. [`KEEP`](Self::KEEP) is the
    /// absence of [`DROP`](Self::DROP); test it with [`keeps`](Self::keeps).
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether the payload was queued.
    pub const fn keeps(self) -> bool {
        !self.contains(Self::DROP)
    }
}

impl BitOr for SegmentAction {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for SegmentAction {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl std::fmt::Debug for SegmentAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = [
            (Self::RESET, "RESET"),
            (Self::ACKNOWLEDGE, "ACKNOWLEDGE"),
            (Self::IMMEDIATE_ACKNOWLEDGE, "IMMEDIATE_ACKNOWLEDGE"),
        ];
        write!(f, "SegmentAction({}", if self.keeps() { "KEEP" } else { "DROP" })?;
        for (flag, name) in names {
            if self.contains(flag) {
                write!(f, " | {name}")?;
            }
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_combine() {
        let action = SegmentAction::DROP | SegmentAction::RESET;
        assert!(!action.keeps());
        assert!(action.contains(SegmentAction::RESET));
        assert!(!action.contains(SegmentAction::ACKNOWLEDGE));

        let mut action = SegmentAction::KEEP;
        action |= SegmentAction::IMMEDIATE_ACKNOWLEDGE;
        assert!(action.keeps());
        assert_eq!(
            format!("{action:?}"),
            "SegmentAction(KEEP | IMMEDIATE_ACKNOWLEDGE)"
        );
    }
}
