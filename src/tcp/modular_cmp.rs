//! Comparisons in the 32-bit sequence space.
//!
//! Sequence numbers wrap, so `a < b` means `b` lies less than half the ring
//! ahead of `a`.

/// `a` comes strictly before `b`
pub fn mod_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a` comes before or equals `b`
pub fn mod_leq(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

/// `a` comes strictly after `b`
pub fn mod_ge(a: u32, b: u32) -> bool {
    mod_le(b, a)
}

/// `a` comes after or equals `b`
pub fn mod_geq(a: u32, b: u32) -> bool {
    mod_leq(b, a)
}

/// The later of two sequence numbers
pub fn mod_max(a: u32, b: u32) -> u32 {
    if mod_ge(a, b) {
        a
    } else {
        b
    }
}

/// Is `seq` inside the `len` octets starting at `start`?
pub fn in_window(seq: u32, start: u32, len: u32) -> bool {
    seq.wrapping_sub(start) < len
}

/// Chains two comparisons: `a ab_cmp b` and `b bc_cmp c`.
pub fn mod_bounded(a: u32, ab_cmp: ModCmp, b: u32, bc_cmp: ModCmp, c: u32) -> bool {
    ab_cmp.holds(a, b) && bc_cmp.holds(b, c)
}

pub use ModCmp::*;
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModCmp {
    Le,
    Leq,
}

impl ModCmp {
    fn holds(self, a: u32, b: u32) -> bool {
        match self {
            Le => mod_le(a, b),
            Leq => mod_leq(a, b),
        }
    }
}
