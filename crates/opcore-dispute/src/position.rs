//! Generalized-index positions in the game tree.
//!
//! The root is `1`; the children of `p` are `2p` (left) and `2p + 1` (right). A claim at `p`
//! commits to the trace value at the rightmost leaf below it.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Position(u128);

impl Position {
    pub const ROOT: Self = Self(1);

    pub const fn from_gindex(gindex: u128) -> Self {
        Self(gindex)
    }

    pub const fn new(depth: u8, index_at_depth: u128) -> Self {
        Self((1u128 << depth) | index_at_depth)
    }

    pub const fn gindex(self) -> u128 {
        self.0
    }

    pub const fn depth(self) -> u8 {
        (127 - self.0.leading_zeros()) as u8
    }

    pub const fn index_at_depth(self) -> u128 {
        self.0 - (1u128 << self.depth())
    }

    pub const fn is_root(self) -> bool {
        self.0 == 1
    }

    /// Whether no position at this depth lies to the right.
    pub const fn is_rightmost(self) -> bool {
        (self.0 + 1).is_power_of_two()
    }

    pub const fn parent(self) -> Self {
        Self(self.0 >> 1)
    }

    /// Left child: the midpoint between the last agreed value and this claim.
    pub const fn attack(self) -> Self {
        Self(self.0 << 1)
    }

    /// Left child of the right neighbour: the midpoint to the right of this claim.
    pub const fn defend(self) -> Self {
        Self((self.0 + 1) << 1)
    }

    pub const fn make_move(self, is_attack: bool) -> Self {
        if is_attack {
            self.attack()
        } else {
            self.defend()
        }
    }

    /// Rightmost descendant at `max_depth`.
    pub const fn right_index(self, max_depth: u8) -> Self {
        let remaining = max_depth - self.depth();
        Self((self.0 << remaining) | ((1u128 << remaining) - 1))
    }

    /// Index of the trace value this position commits to in a trace of depth `max_depth`.
    pub const fn trace_index(self, max_depth: u8) -> u128 {
        self.right_index(max_depth).index_at_depth()
    }

    /// Ancestor at `depth`.
    pub const fn ancestor_at(self, depth: u8) -> Self {
        Self(self.0 >> (self.depth() - depth))
    }

    /// This position re-rooted at its ancestor at `depth`.
    pub const fn relative_to(self, depth: u8) -> Self {
        let relative_depth = self.depth() - depth;
        let mask = (1u128 << relative_depth) - 1;
        Self((1u128 << relative_depth) | (self.index_at_depth() & mask))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.depth(), self.index_at_depth())
    }
}
