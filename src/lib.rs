//! Lattice fields partitioned across execution contexts.
//!
//! The crate covers the storage and communication core of a lattice-field
//! simulation:
//! - [`lattice`]: global extents, their block decomposition, even/odd site
//!   ordering and the halo index lists of each partition.
//! - [`field`]: per-site element storage in array-of-structures or
//!   structure-of-arrays layout (cargo feature `soa`), and the `Field` type.
//! - [`comm`]: the in-process communicator and the ghost exchange protocol.
//! - [`exec`]: the SPMD runner, reductions and stencil plans.
//!
//! ```ignore
//! let sim = Simulation::new(LatticeConfig::new(vec![8, 8]).with_partitions(2))?;
//! let totals = sim.run(|ctx| {
//!     let mut phi: Field<f64> = Field::named(ctx, "phi");
//!     phi.assign(Parity::All, |x| x.coords()[0] as f64);
//!     ctx.reduce_sum(Parity::All, |x| phi.at(x.index))
//! });
//! ```

pub mod comm;
pub mod config;
pub mod error;
pub mod exec;
pub mod field;
pub mod lattice;
pub mod logging;

pub use config::{LatticeConfig, PartitionSpec};
pub use error::{LatticeError, Result};
pub use exec::{Context, Simulation, StencilPlan};
pub use field::{fill_random, Element, Field, RandType};
pub use lattice::{Boundary, Direction, Lattice, Parity, Partition, Site};
pub use logging::init_tracing;
