use std::fmt::{Display, Formatter};

/// A 32-bit wrap-around sequence number.
///
/// Sequence numbers wrap after `u32::MAX`, so 0 follows after `0xFFFFFFFF`.
/// Ordering across the wrap uses the signed modular distance `(a - b) mod 2^32`:
/// two sequence numbers compare correctly as long as they are less than half
/// the number space apart, which the window bounds guarantee.
///
/// NB: The derived `Ord` is the raw integer order and only exists so that
/// `SeqNo` can key a `BTreeMap`; protocol logic must go through
/// [`SeqNo::before`] / [`SeqNo::distance`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct SeqNo(u32);

impl Display for SeqNo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNo {
    pub const ZERO: SeqNo = SeqNo(0);

    pub fn from_raw(value: u32) -> SeqNo {
        SeqNo(value)
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }

    pub fn next(self) -> SeqNo {
        SeqNo(self.0.wrapping_add(1))
    }

    /// Signed modular distance `self - other`.
    pub fn distance(self, other: SeqNo) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }

    /// `self` precedes `other` in modular order.
    pub fn before(self, other: SeqNo) -> bool {
        self.distance(other) < 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::plain(5, 3, 2)]
    #[case::equal(7, 7, 0)]
    #[case::wrap_forward(2, u32::MAX - 1, 4)]
    #[case::wrap_backward(u32::MAX, 3, -4)]
    fn test_distance(#[case] a: u32, #[case] b: u32, #[case] expected: i32) {
        assert_eq!(SeqNo::from_raw(a).distance(SeqNo::from_raw(b)), expected);
    }

    #[rstest]
    #[case::less(3, 5, true)]
    #[case::greater(5, 3, false)]
    #[case::equal(4, 4, false)]
    #[case::wrap(u32::MAX - 1, 2, true)]
    fn test_before(#[case] a: u32, #[case] b: u32, #[case] expected: bool) {
        assert_eq!(SeqNo::from_raw(a).before(SeqNo::from_raw(b)), expected);
    }

    #[rstest]
    fn test_next_wraps() {
        assert_eq!(SeqNo::from_raw(u32::MAX).next(), SeqNo::ZERO);
    }
}
