//! See [`Seq`].

use std::{
    cmp::Ordering,
    convert::Infallible,
    fmt,
    ops::{Add, AddAssign, Sub, SubAssign},
};

use octs::{BufTooShortOr, Decode, Encode, FixedEncodeLen, Read, Write};

use crate::protocol::{RELIABLE_WINDOWS, RELIABLE_WINDOW_SIZE};

/// Sequence number uniquely identifying a command sent across a network.
///
/// The number is stored internally as a [`u16`], which means it will wrap
/// around fairly quickly as many commands can be sent per second. Users of a
/// sequence number should take this into account, and use the custom
/// [`Seq::cmp`] implementation which takes wraparound into consideration.
///
/// # Wraparound
///
/// Operations on [`Seq`] must take into account wraparound, as it is
/// inevitable that it will eventually occur in the program - a [`u16`] is
/// relatively very small.
///
/// The sequence number can be visualized as an infinite number line, where
/// [`u16::MAX`] is right before `0`, `0` is before `1`, etc.:
///
/// ```text
///     65534  65535    0      1      2
/// ... --|------|------|------|------|-- ...
/// ```
///
/// [Addition](std::ops::Add) and [subtraction](std::ops::Sub) will always
/// wrap.
///
/// See <https://gafferongames.com/post/packet_fragmentation_and_reassembly/>, *Fragment Packet Structure*.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct Seq(pub u16);

impl Seq {
    /// Sequence number with value [`u16::MAX`].
    pub const MAX: Seq = Seq(u16::MAX);

    /// Returns the current sequence value after incrementing `self`.
    ///
    /// This operation will wrap the underlying integer.
    #[must_use]
    pub fn inc_get(&mut self) -> Self {
        self.0 = self.0.wrapping_add(1);
        *self
    }

    /// Gets a signed number for the value of sequences "elapsed" between
    /// `rhs` and `self`.
    ///
    /// This is effectively `rhs - self`, but taking into account wraparound
    /// and therefore returning a signed value. This will always return the
    /// smallest path around this "circle".
    ///
    /// ```text
    ///     65534  65535    0      1      2
    /// ... --|------|------|------|------|-- ...
    ///       ^             ^      ^      ^
    ///       |             +------+------+ 0.dist_to(2) = 2
    ///       |                    |        2.dist_to(0) = -2
    ///       +--------------------+ 65534.dist_to(1) = 3
    ///                              1.dist_to(65534) = -3
    /// ```
    ///
    /// # Example
    ///
    /// ```
    /// # use cordnet::seq::Seq;
    /// assert_eq!(Seq(0).dist_to(Seq(0)), 0);
    /// assert_eq!(Seq(0).dist_to(Seq(5)), 5);
    /// assert_eq!(Seq(3).dist_to(Seq(5)), 2);
    /// assert_eq!(Seq(1).dist_to(Seq(0)), -1);
    ///
    /// assert_eq!(Seq(0).dist_to(Seq::MAX), -1);
    /// assert_eq!(Seq::MAX.dist_to(Seq(0)), 1);
    /// assert_eq!((Seq::MAX - Seq(3)).dist_to(Seq(3)), 7);
    /// ```
    #[must_use]
    pub const fn dist_to(self, rhs: Self) -> i16 {
        #[allow(clippy::cast_possible_wrap)] // that's exactly what we want
        (rhs.0.wrapping_sub(self.0) as i16)
    }

    /// Gets which reliable window this sequence number falls into.
    ///
    /// The sequence space is divided into [`RELIABLE_WINDOWS`] disjoint
    /// windows of [`RELIABLE_WINDOW_SIZE`] sequence numbers each. Windows act
    /// as the admission-control unit for in-flight reliable commands.
    ///
    /// # Example
    ///
    /// ```
    /// # use cordnet::seq::Seq;
    /// assert_eq!(Seq(0).window(), 0);
    /// assert_eq!(Seq(4095).window(), 0);
    /// assert_eq!(Seq(4096).window(), 1);
    /// assert_eq!(Seq(u16::MAX).window(), 15);
    /// ```
    #[must_use]
    pub const fn window(self) -> u16 {
        self.0 / RELIABLE_WINDOW_SIZE
    }

    /// Gets this sequence number's window, unwrapped relative to the window
    /// of `current` (the channel's last in-order reliable sequence).
    ///
    /// If `self` is numerically below `current`, its window is shifted up by
    /// [`RELIABLE_WINDOWS`] so that callers can test it against
    /// `current.window() + n` without wrapping.
    #[must_use]
    pub const fn window_from(self, current: Self) -> u16 {
        let mut window = self.window();
        if self.0 < current.0 {
            window += RELIABLE_WINDOWS;
        }
        window
    }
}

impl fmt::Debug for Seq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Seq").field(&self.0).finish()
    }
}

impl Ord for Seq {
    /// Logically compares `self` to `other` in a way that respects wrap-around
    /// of sequence numbers, treating e.g. `0 cmp 1` as [`Less`] (as expected),
    /// but `0 cmp 65535` as [`Greater`].
    ///
    /// See <https://gafferongames.com/post/reliability_ordering_and_congestion_avoidance_over_udp/>,
    /// *Handling Sequence Number Wrap-Around*.
    ///
    /// If the two values compared have a real difference equal to or larger
    /// than `u16::MAX / 2`, no guarantees are upheld.
    ///
    /// [`Greater`]: Ordering::Greater
    /// [`Less`]: Ordering::Less
    fn cmp(&self, other: &Self) -> Ordering {
        // The implementation used is a variant of `slotmap`'s generation
        // comparison function:
        // https://github.com/orlp/slotmap/blob/c905b6c/src/util.rs#L10
        // It has been adapted to use u16s and Ordering.

        let s1 = self.0;
        let s2 = other.0;

        #[allow(clippy::cast_possible_wrap)] // that's exactly what we want
        (s1 as i16).wrapping_sub(s2 as i16).cmp(&0)
    }
}

impl PartialOrd for Seq {
    /// See [`Seq::cmp`].
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Add for Seq {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0.wrapping_add(rhs.0))
    }
}

impl AddAssign for Seq {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Seq {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0.wrapping_sub(rhs.0))
    }
}

impl SubAssign for Seq {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl FixedEncodeLen for Seq {
    const ENCODE_LEN: usize = u16::ENCODE_LEN;
}

impl Encode for Seq {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.0)
    }
}

impl Decode for Seq {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self(src.read()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increasing_wraparound() {
        assert!(Seq(0) < Seq(1));
        assert!(Seq(1) < Seq(2));
        assert!(Seq(u16::MAX - 3) < Seq(u16::MAX));
        assert!(Seq(u16::MAX - 2) < Seq(u16::MAX));
        assert!(Seq(u16::MAX - 1) < Seq(u16::MAX));

        assert!(Seq(u16::MAX) < Seq(0));
        assert!(Seq(u16::MAX) < Seq(1));
        assert!(Seq(u16::MAX) < Seq(2));

        assert!(Seq(u16::MAX - 3) < Seq(2));

        // NOTE: we explicitly don't test what happens when the difference
        // is around u16::MAX, because we guarantee no behaviour there
    }

    #[test]
    fn trichotomy() {
        // exactly one of less / equal / greater must hold under modular
        // semantics, for a spread of pairs across the wrap boundary
        for &a in &[0u16, 1, 4095, 4096, 32767, 32768, 65534, 65535] {
            for &b in &[0u16, 1, 4095, 4096, 65534, 65535] {
                let (a, b) = (Seq(a), Seq(b));
                let relations =
                    [a < b, a == b, a > b].iter().filter(|&&r| r).count();
                assert_eq!(1, relations, "{a:?} vs {b:?}");
            }
        }
    }

    #[test]
    fn window_unwrapping() {
        // at the wrap boundary, a small sequence number sits in a window
        // "after" the current one
        assert_eq!(16, Seq(0).window_from(Seq(u16::MAX)));
        assert_eq!(15, Seq(u16::MAX).window_from(Seq(u16::MAX)));
        assert_eq!(1, Seq(4096).window_from(Seq(0)));
    }
}
