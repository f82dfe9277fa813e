//! Running client code on every partition and evaluating site loops.

pub mod context;
pub mod stencil;

pub use context::{Context, Simulation, REDUCE_CHUNK};
pub use stencil::{HaloAccess, StencilInputs, StencilPlan};
