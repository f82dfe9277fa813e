//! Lattice fields: element types, the two storage layouts, the field itself
//! and random fills.

pub mod element;
pub mod lattice_field;
pub mod random;
pub mod storage;

pub use element::{Component, Element};
pub use lattice_field::Field;
pub use random::{fill_random, RandType};
pub use storage::{AosStorage, DefaultStorage, FieldStorage, SoaStorage};
