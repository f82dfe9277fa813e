//! Message passing between partitions and the halo exchange built on it.

pub(crate) mod halo;
pub mod mailbox;

pub use mailbox::{Communicator, Tag};
