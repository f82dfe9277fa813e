//! Lattice geometry and its block decomposition into partitions.

pub mod geometry;
pub mod partition;

pub use geometry::{wrap_axis_index, Boundary, Direction, Parity};
pub use partition::{Lattice, Partition, Site, SiteSplit, HALO_WIDTH};
