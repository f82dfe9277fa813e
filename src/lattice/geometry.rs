// src/lattice/geometry.rs
//! Directions, parities and boundary tags on a periodic hypercubic lattice.
//!
//! Conventions:
//! - A `Direction` packs `(axis, sign)` as `2 * axis + down`, so `up(a)` is even
//!   and `down(a)` is the next odd index. `opposite()` flips the low bit.
//! - `Parity` of a site is the parity of its global coordinate sum. `All` means
//!   "no restriction" and is used as a bit mask that covers both sublattices.

use std::fmt;

use serde::{Deserialize, Serialize};

// ==============================================================================
// -------------------------------- Direction -----------------------------------
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Direction(usize);

impl Direction {
    /// Unit step towards increasing coordinate along `axis`.
    #[inline]
    pub const fn up(axis: usize) -> Self {
        Self(2 * axis)
    }

    /// Unit step towards decreasing coordinate along `axis`.
    #[inline]
    pub const fn down(axis: usize) -> Self {
        Self(2 * axis + 1)
    }

    #[inline]
    pub const fn from_index(index: usize) -> Self {
        Self(index)
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn axis(self) -> usize {
        self.0 / 2
    }

    #[inline]
    pub const fn is_forward(self) -> bool {
        self.0 % 2 == 0
    }

    #[inline]
    pub const fn opposite(self) -> Self {
        Self(self.0 ^ 1)
    }

    /// +1 for forward directions, -1 for backward ones.
    #[inline]
    pub const fn step(self) -> isize {
        if self.is_forward() { 1 } else { -1 }
    }

    /// Every direction of a `dim`-dimensional lattice, in index order.
    pub fn all(dim: usize) -> impl Iterator<Item = Direction> {
        (0..2 * dim).map(Direction)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.is_forward() { '+' } else { '-' };
        write!(f, "{sign}e{}", self.axis())
    }
}

// ==============================================================================
// --------------------------------- Parity -------------------------------------
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    Even,
    Odd,
    All,
}

impl Parity {
    /// Parity of a site from its global coordinates.
    #[inline]
    pub fn of_coords(coords: &[usize]) -> Self {
        if coords.iter().sum::<usize>() % 2 == 0 { Parity::Even } else { Parity::Odd }
    }

    /// Even <-> Odd; `All` maps to itself.
    #[inline]
    pub const fn opposite(self) -> Self {
        match self {
            Parity::Even => Parity::Odd,
            Parity::Odd => Parity::Even,
            Parity::All => Parity::All,
        }
    }

    #[inline]
    pub const fn mask(self) -> u8 {
        match self {
            Parity::Even => 0b01,
            Parity::Odd => 0b10,
            Parity::All => 0b11,
        }
    }

    /// True when every site of `other` is also a site of `self`.
    #[inline]
    pub const fn contains(self, other: Parity) -> bool {
        self.mask() & other.mask() == other.mask()
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Parity::Even => "even",
            Parity::Odd => "odd",
            Parity::All => "all",
        };
        f.write_str(s)
    }
}

// ==============================================================================
// -------------------------------- Boundary ------------------------------------
// ==============================================================================

/// Per-axis boundary condition of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Boundary {
    #[default]
    Periodic,
    /// Values change sign when a neighbour reference wraps the global edge.
    Antiperiodic,
}

// ==============================================================================
// -------------------------------- Helpers -------------------------------------
// ==============================================================================

/// Reduce a possibly negative coordinate into `[0, l)`.
#[inline]
pub fn wrap_axis_index(idx: isize, l: usize) -> usize {
    idx.rem_euclid(l as isize) as usize
}

/// Row-major flat index of `coords` inside a box of `extents` (axis 0 slowest).
#[inline]
pub fn row_major_index(coords: &[usize], extents: &[usize]) -> usize {
    debug_assert_eq!(coords.len(), extents.len());
    coords.iter().zip(extents).fold(0usize, |flat, (&c, &l)| {
        debug_assert!(c < l, "coordinate {c} outside extent {l}");
        flat * l + c
    })
}

/// Inverse of [`row_major_index`].
#[inline]
pub fn row_major_coords(mut flat: usize, extents: &[usize]) -> Vec<usize> {
    let mut coords = vec![0usize; extents.len()];
    for (slot, &l) in coords.iter_mut().zip(extents).rev() {
        *slot = flat % l;
        flat /= l;
    }
    coords
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_packing() {
        let d = Direction::up(2);
        assert_eq!(d.index(), 4);
        assert_eq!(d.axis(), 2);
        assert!(d.is_forward());
        assert_eq!(d.opposite(), Direction::down(2));
        assert_eq!(d.opposite().opposite(), d);
        assert_eq!(Direction::down(1).step(), -1);
        assert_eq!(Direction::all(3).count(), 6);
        assert_eq!(Direction::down(0).to_string(), "-e0");
    }

    #[test]
    fn parity_masks() {
        assert!(Parity::All.contains(Parity::Even));
        assert!(Parity::All.contains(Parity::Odd));
        assert!(!Parity::Even.contains(Parity::All));
        assert!(!Parity::Odd.contains(Parity::Even));
        assert_eq!(Parity::Even.opposite(), Parity::Odd);
        assert_eq!(Parity::All.opposite(), Parity::All);
        assert_eq!(Parity::of_coords(&[1, 2, 3]), Parity::Even);
        assert_eq!(Parity::of_coords(&[0, 1]), Parity::Odd);
    }

    #[test]
    fn wrap_and_row_major() {
        assert_eq!(wrap_axis_index(-1, 4), 3);
        assert_eq!(wrap_axis_index(9, 4), 1);
        let ext = [2, 3, 4];
        for flat in 0..24 {
            let c = row_major_coords(flat, &ext);
            assert_eq!(row_major_index(&c, &ext), flat);
        }
        assert_eq!(row_major_index(&[1, 0, 2], &ext), 14);
    }

    #[test]
    fn boundary_serde_is_lowercase() {
        let b: Vec<Boundary> = serde_json::from_str(r#"["periodic","antiperiodic"]"#).unwrap();
        assert_eq!(b, vec![Boundary::Periodic, Boundary::Antiperiodic]);
    }
}
