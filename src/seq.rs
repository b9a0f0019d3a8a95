use std::fmt::{Display, Formatter};

/// A 32-bit per-channel sequence number with wrap-around comparison semantics.
///
/// Sequence ids are compared in a circular fashion: `a` precedes `b` iff the
///  forward distance from `a` to `b` is at most half the id space. This yields a
///  total order on any window of ids no wider than `2^31`, which is all the
///  protocol ever looks at. Because the ordering is circular, `SequenceId`
///  deliberately does not implement `Ord`.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SequenceId(u32);

impl Display for SequenceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceId {
    pub const ZERO: SequenceId = SequenceId(0);

    pub fn from_raw(value: u32) -> SequenceId {
        SequenceId(value)
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }

    pub fn next(self) -> SequenceId {
        SequenceId(self.0.wrapping_add(1))
    }

    /// Wrap-aware 'less than': true iff `self` comes strictly before `other`.
    pub fn precedes(self, other: SequenceId) -> bool {
        self != other && other.0.wrapping_sub(self.0) <= u32::MAX / 2
    }

    /// Wrap-aware 'less than or equal'.
    pub fn precedes_or_eq(self, other: SequenceId) -> bool {
        !other.precedes(self)
    }
}
