// src/exec/stencil.rs
/*!
Stencil plans: site loops that read neighbours across partition edges.

A [`StencilPlan`] names the loop parity and every `(input slot, direction)`
pair the loop body will read through `Field::shifted`. Running a plan overlaps
the halo traffic with local work:

1. start every declared fetch;
2. evaluate the interior sites, whose declared neighbours are all owned by
   this partition;
3. wait for the fetches;
4. evaluate the remaining boundary sites.

The interior/boundary split comes from [`Partition::split_sites`] and is
cached per partition. The body sees the inputs through a shared reference to
whatever was passed in (a `&mut Field` or a tuple of them), so only `&self`
field methods are reachable from inside it.

```ignore
let plan = StencilPlan::new(Parity::Even)
    .shift(0, Direction::up(0))
    .shift(0, Direction::down(0));
plan.apply(&mut lap, &mut phi, |x, phi| {
    phi.shifted(x.index, Direction::up(0)) + phi.shifted(x.index, Direction::down(0)) - 2.0 * phi.at(x.index)
});
```

[`Partition::split_sites`]: crate::lattice::partition::Partition::split_sites
*/

use tracing::trace;

use super::context::{chunked_sum_sites, Context};
use crate::error::{fatal, LatticeError};
use crate::field::element::Element;
use crate::field::lattice_field::Field;
use crate::field::storage::FieldStorage;
use crate::lattice::geometry::{Direction, Parity};
use crate::lattice::partition::Site;

/// Type-erased halo control of one stencil input.
pub trait HaloAccess {
    fn start_get(&mut self, dir: Direction, par: Parity);
    fn wait(&mut self, dir: Direction, par: Parity);
}

impl<T: Element, S: FieldStorage<T>> HaloAccess for Field<T, S> {
    #[inline]
    fn start_get(&mut self, dir: Direction, par: Parity) {
        Field::start_get(self, dir, par);
    }

    #[inline]
    fn wait(&mut self, dir: Direction, par: Parity) {
        Field::wait(self, dir, par);
    }
}

/// The set of fields a stencil body reads.
pub trait StencilInputs: Sync {
    const ARITY: usize;

    fn slot(&mut self, slot: usize) -> &mut dyn HaloAccess;
}

#[cold]
fn missing_slot(slot: usize, arity: usize) -> ! {
    fatal(LatticeError::Protocol(format!(
        "stencil plan reads input {slot} but only {arity} inputs were supplied"
    )))
}

impl<'a, T: Element, S: FieldStorage<T>> StencilInputs for &'a mut Field<T, S> {
    const ARITY: usize = 1;

    fn slot(&mut self, slot: usize) -> &mut dyn HaloAccess {
        match slot {
            0 => &mut **self as &mut dyn HaloAccess,
            _ => missing_slot(slot, Self::ARITY),
        }
    }
}

macro_rules! impl_stencil_inputs {
    ($n:expr; $($idx:tt => $T:ident, $S:ident);+) => {
        impl<'a, $($T: Element, $S: FieldStorage<$T>),+> StencilInputs for ($(&'a mut Field<$T, $S>,)+) {
            const ARITY: usize = $n;

            fn slot(&mut self, slot: usize) -> &mut dyn HaloAccess {
                match slot {
                    $($idx => &mut *self.$idx as &mut dyn HaloAccess,)+
                    _ => missing_slot(slot, Self::ARITY),
                }
            }
        }
    };
}

impl_stencil_inputs!(1; 0 => T0, S0);
impl_stencil_inputs!(2; 0 => T0, S0; 1 => T1, S1);
impl_stencil_inputs!(3; 0 => T0, S0; 1 => T1, S1; 2 => T2, S2);
impl_stencil_inputs!(4; 0 => T0, S0; 1 => T1, S1; 2 => T2, S2; 3 => T3, S3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StencilPlan {
    parity: Parity,
    shifts: Vec<(usize, Direction)>,
}

impl StencilPlan {
    pub fn new(parity: Parity) -> Self {
        Self { parity, shifts: Vec::new() }
    }

    /// Declare that the body reads input `slot` one step along `dir`.
    pub fn shift(mut self, slot: usize, dir: Direction) -> Self {
        if !self.shifts.contains(&(slot, dir)) {
            self.shifts.push((slot, dir));
        }
        self
    }

    /// Every nearest neighbour of input `slot` on a `dim`-dimensional lattice.
    pub fn neighbours(self, slot: usize, dim: usize) -> Self {
        Direction::all(dim).fold(self, |plan, dir| plan.shift(slot, dir))
    }

    #[inline] pub fn parity(&self) -> Parity { self.parity }
    #[inline] pub fn shifts(&self) -> &[(usize, Direction)] { &self.shifts }

    /// Distinct directions over all inputs.
    pub fn directions(&self) -> Vec<Direction> {
        let mut dirs: Vec<Direction> = Vec::with_capacity(self.shifts.len());
        for &(_, dir) in &self.shifts {
            if !dirs.contains(&dir) {
                dirs.push(dir);
            }
        }
        dirs
    }

    fn start<I: StencilInputs>(&self, inputs: &mut I) {
        for &(slot, dir) in &self.shifts {
            inputs.slot(slot).start_get(dir, self.parity);
        }
    }

    fn finish<I: StencilInputs>(&self, inputs: &mut I) {
        for &(slot, dir) in &self.shifts {
            inputs.slot(slot).wait(dir, self.parity);
        }
    }

    /// `out[X] = body(X, inputs)` for every site `X` of the plan's parity.
    pub fn apply<I, T, S, F>(&self, out: &mut Field<T, S>, mut inputs: I, body: F)
    where
        I: StencilInputs,
        T: Element,
        S: FieldStorage<T>,
        F: Fn(Site<'_>, &I) -> T + Sync,
    {
        let split = out.partition().split_sites(self.parity, &self.directions());
        self.start(&mut inputs);
        out.assign_sites(&split.interior, |site| body(site, &inputs));
        trace!(parity = %self.parity, interior = split.interior.len(), "stencil interior done");

        self.finish(&mut inputs);
        out.assign_sites(&split.boundary, |site| body(site, &inputs));
    }

    /// Sum of `body(X, inputs)` over the plan's parity on the whole lattice.
    /// Interior chunks are added before boundary chunks, so the result does
    /// not depend on thread count. Collective.
    pub fn reduce<I, F>(&self, ctx: &Context, mut inputs: I, body: F) -> f64
    where
        I: StencilInputs,
        F: Fn(Site<'_>, &I) -> f64 + Sync,
    {
        let partition = ctx.partition();
        let split = partition.split_sites(self.parity, &self.directions());
        self.start(&mut inputs);
        let interior = chunked_sum_sites(&split.interior, |i| body(partition.site(i), &inputs));
        trace!(parity = %self.parity, interior = split.interior.len(), "stencil interior done");

        self.finish(&mut inputs);
        let boundary = chunked_sum_sites(&split.boundary, |i| body(partition.site(i), &inputs));
        ctx.allreduce_sum(&[interior + boundary])[0]
    }
}
