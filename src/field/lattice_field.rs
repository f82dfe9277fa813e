// src/field/lattice_field.rs
/*!
A field: one element per lattice site, owned partition by partition.

# Highlights
- Storage holds the partition's real sites followed by its ghost slots. Reads of
  a neighbour go through `shifted`, which refuses ghost values that have not
  been fetched for the reading site's parity.
- Writes (`set_site`, `set_element`, `fill`, `assign`, `update`, the canonical
  loaders) first complete any exchange still in flight, then invalidate the
  ghosts.
- `get_element`, `to_canonical` and `shift` are collective: every partition
  calls them with the same arguments.

# Invariants
- Fields must be created in the same order on every partition; the creation
  index is the field id used in message tags.
- Every partition performs the same sequence of exchange calls and writes on
  a given field.
*/

use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::Arc;

use rayon::prelude::*;
use tracing::debug;

use super::element::Element;
use super::storage::{DefaultStorage, FieldStorage};
use crate::comm::halo::HaloExchange;
use crate::error::{fatal, LatticeError, Result};
use crate::exec::context::Context;
use crate::exec::stencil::StencilPlan;
use crate::lattice::geometry::{Boundary, Direction, Parity};
use crate::lattice::partition::{Lattice, Partition, Site};

#[derive(Debug)]
pub struct Field<T: Element, S: FieldStorage<T> = DefaultStorage<T>> {
    id: u64,
    name: String,
    boundary: Vec<Boundary>,
    storage: S,
    halo: HaloExchange,
    lattice: Arc<Lattice>,
    partition: Arc<Partition>,
    _marker: PhantomData<T>,
}

// ==============================================================================
// ------------------------------ Constructors ----------------------------------
// ==============================================================================

impl<T: Element, S: FieldStorage<T>> Field<T, S> {
    /// Anonymous periodic field, zero-initialised.
    pub fn new(ctx: &Context) -> Self {
        let id = ctx.next_field_id();
        let boundary = vec![Boundary::Periodic; ctx.lattice().dim()];
        Self::build(ctx, id, format!("field#{id}"), boundary)
    }

    /// Field whose boundary conditions come from the run configuration.
    pub fn named(ctx: &Context, name: &str) -> Self {
        let id = ctx.next_field_id();
        Self::build(ctx, id, name.to_string(), ctx.boundary_of(name))
    }

    pub fn with_boundary(ctx: &Context, name: &str, boundary: Vec<Boundary>) -> Result<Self> {
        let dim = ctx.lattice().dim();
        if boundary.len() != dim {
            return Err(LatticeError::BoundaryAxes { field: name.to_string(), got: boundary.len(), dim });
        }
        let id = ctx.next_field_id();
        Ok(Self::build(ctx, id, name.to_string(), boundary))
    }

    pub fn filled(ctx: &Context, value: T) -> Self {
        let mut f = Self::new(ctx);
        f.fill(value);
        f
    }

    fn build(ctx: &Context, id: u64, name: String, boundary: Vec<Boundary>) -> Self {
        let partition = Arc::clone(ctx.partition());
        let mut storage = S::default();
        storage.allocate(partition.alloc_size());
        debug!(field = %name, id, alloc = partition.alloc_size(), ?boundary, "field allocated");
        Self {
            id,
            name,
            boundary,
            storage,
            halo: HaloExchange::new(id, Arc::clone(&partition), Arc::clone(ctx.comm())),
            lattice: Arc::clone(ctx.lattice()),
            partition,
            _marker: PhantomData,
        }
    }

    #[inline] pub fn id(&self) -> u64 { self.id }
    #[inline] pub fn name(&self) -> &str { &self.name }
    #[inline] pub fn boundary(&self) -> &[Boundary] { &self.boundary }
    #[inline] pub fn partition(&self) -> &Partition { &self.partition }
    #[inline] pub fn lattice(&self) -> &Lattice { &self.lattice }
}

// ==============================================================================
// ---------------------------------- Reads -------------------------------------
// ==============================================================================

impl<T: Element, S: FieldStorage<T>> Field<T, S> {
    /// Value at real site `site`.
    #[inline]
    pub fn at(&self, site: usize) -> T {
        assert!(site < self.partition.sites(), "at: {site} is not a real site of `{}`", self.name);
        self.storage.get(site)
    }

    /// Value one step along `dir` from real site `site`. Crossing into the
    /// ghost region requires a completed fetch for the site's parity.
    #[inline]
    pub fn shifted(&self, site: usize, dir: Direction) -> T {
        let nb = self.partition.neighbour(dir, site);
        if self.partition.is_ghost(nb) {
            let par = self.partition.parity_of(site);
            if !self.halo.is_fresh(dir, par) {
                fatal(LatticeError::Protocol(format!(
                    "field `{}` read across the partition edge along {dir} for {par} sites before wait",
                    self.name
                )));
            }
        }
        self.storage.get(nb)
    }

    /// Value at a global coordinate (wrapped onto the lattice). Collective.
    pub fn get_element(&self, ctx: &Context, coords: &[isize]) -> T {
        let (owner, site) = self.lattice.owner(coords);
        let payload = (owner == self.partition.rank()).then(|| bytemuck::bytes_of(&self.storage.get(site)).to_vec());
        let bytes = ctx.broadcast_bytes(owner, payload);
        if bytes.len() != size_of::<T>() {
            fatal(LatticeError::LayoutMismatch { expected: size_of::<T>(), actual: bytes.len() });
        }
        bytemuck::pod_read_unaligned(&bytes)
    }

    /// Canonical-order copy of the whole field, on every partition. Collective.
    pub fn to_canonical(&self, ctx: &Context) -> Vec<T> {
        let local: Vec<T> = (0..self.partition.sites()).map(|i| self.storage.get(i)).collect();
        let parts = ctx.allgather_bytes(bytemuck::cast_slice(&local).to_vec());

        let mut out = vec![T::zeroed(); self.lattice.volume()];
        for (rank, bytes) in parts.iter().enumerate() {
            let p = ctx.partition_of(rank);
            let expected = p.sites() * size_of::<T>();
            if bytes.len() != expected {
                fatal(LatticeError::LayoutMismatch { expected, actual: bytes.len() });
            }
            let values: Vec<T> = bytemuck::pod_collect_to_vec(bytes);
            for (i, v) in values.into_iter().enumerate() {
                out[p.canonical(i)] = v;
            }
        }
        out
    }

    pub fn to_canonical_bytes(&self, ctx: &Context) -> Vec<u8> {
        bytemuck::cast_slice(&self.to_canonical(ctx)).to_vec()
    }
}

// ==============================================================================
// --------------------------------- Exchange -----------------------------------
// ==============================================================================

impl<T: Element, S: FieldStorage<T>> Field<T, S> {
    /// Begin refreshing the `dir` ghosts read by sites of `par`. Does nothing
    /// when they are already current or a covering fetch is in flight.
    pub fn start_get(&mut self, dir: Direction, par: Parity) {
        self.halo.start_get(&self.storage, &self.name, dir, par);
    }

    /// Finish the fetch started by `start_get(dir, par)`.
    pub fn wait(&mut self, dir: Direction, par: Parity) {
        self.halo.wait(&mut self.storage, &self.name, &self.boundary, dir, par);
    }

    pub fn fetch(&mut self, dir: Direction, par: Parity) {
        self.start_get(dir, par);
        self.wait(dir, par);
    }

    #[inline]
    pub fn is_fresh(&self, dir: Direction, par: Parity) -> bool {
        self.halo.is_fresh(dir, par)
    }

    /// Complete outstanding fetches and drop every ghost value.
    pub fn mark_changed(&mut self) {
        self.halo.drain(&mut self.storage, &self.name, &self.boundary);
        self.halo.invalidate();
    }
}

// ==============================================================================
// ---------------------------------- Writes ------------------------------------
// ==============================================================================

impl<T: Element, S: FieldStorage<T>> Field<T, S> {
    pub fn set_site(&mut self, site: usize, value: T) {
        assert!(site < self.partition.sites(), "set_site: {site} is not a real site of `{}`", self.name);
        self.mark_changed();
        self.storage.set(site, value);
    }

    /// Store `value` at a global coordinate. Called on every partition; only
    /// the owner writes, but all of them invalidate their ghosts.
    pub fn set_element(&mut self, coords: &[isize], value: T) {
        self.mark_changed();
        let (owner, site) = self.lattice.owner(coords);
        if owner == self.partition.rank() {
            self.storage.set(site, value);
        }
    }

    pub fn fill(&mut self, value: T) {
        self.mark_changed();
        let values = vec![value; self.partition.sites()];
        self.storage.set_range(0, &values);
    }

    /// Site-parallel `self[X] = f(X)` over the sites of `par`.
    pub fn assign<F>(&mut self, par: Parity, f: F)
    where
        F: Fn(Site<'_>) -> T + Sync,
    {
        self.mark_changed();
        let partition = Arc::clone(&self.partition);
        let range = partition.sites_of(par);
        let values: Vec<T> = range.clone().into_par_iter().map(|i| f(partition.site(i))).collect();
        self.storage.set_range(range.start, &values);
    }

    /// Site-parallel `self[X] = f(X)` over an explicit list of real sites.
    pub(crate) fn assign_sites<F>(&mut self, sites: &[usize], f: F)
    where
        F: Fn(Site<'_>) -> T + Sync,
    {
        self.mark_changed();
        let partition = Arc::clone(&self.partition);
        let values: Vec<T> = sites.par_iter().map(|&i| f(partition.site(i))).collect();
        for (&i, v) in sites.iter().zip(values) {
            self.storage.set(i, v);
        }
    }

    /// Site-parallel `self[X] = f(X, self[X])` over the sites of `par`.
    pub fn update<F>(&mut self, par: Parity, f: F)
    where
        F: Fn(Site<'_>, T) -> T + Sync,
    {
        self.mark_changed();
        let partition = Arc::clone(&self.partition);
        let range = partition.sites_of(par);
        let storage = &self.storage;
        let values: Vec<T> = range
            .clone()
            .into_par_iter()
            .map(|i| f(partition.site(i), storage.get(i)))
            .collect();
        self.storage.set_range(range.start, &values);
    }

    /// Load canonical-order data; every partition passes the full slice.
    pub fn from_canonical(&mut self, data: &[T]) {
        if data.len() != self.lattice.volume() {
            fatal(LatticeError::LayoutMismatch {
                expected: self.lattice.volume() * size_of::<T>(),
                actual: data.len() * size_of::<T>(),
            });
        }
        self.mark_changed();
        let values: Vec<T> = (0..self.partition.sites()).map(|i| data[self.partition.canonical(i)]).collect();
        self.storage.set_range(0, &values);
    }

    pub fn from_canonical_bytes(&mut self, bytes: &[u8]) {
        let expected = self.lattice.volume() * size_of::<T>();
        if bytes.len() != expected {
            fatal(LatticeError::LayoutMismatch { expected, actual: bytes.len() });
        }
        let data: Vec<T> = bytemuck::pod_collect_to_vec(bytes);
        self.from_canonical(&data);
    }
}

// ==============================================================================
// ---------------------------------- Copies ------------------------------------
// ==============================================================================

impl<T: Element, S: FieldStorage<T>> Field<T, S> {
    /// Fresh field with the same name, boundary conditions and site values.
    pub fn duplicate(&self, ctx: &Context) -> Self {
        let id = ctx.next_field_id();
        let mut out = Self::build(ctx, id, self.name.clone(), self.boundary.clone());
        let values: Vec<T> = (0..self.partition.sites()).map(|i| self.storage.get(i)).collect();
        out.storage.set_range(0, &values);
        out
    }

    /// New field `g` with `g(x) = self(x + offset)`, boundary signs included.
    /// Built from unit nearest-neighbour steps. Collective.
    pub fn shift(&mut self, ctx: &Context, offset: &[isize]) -> Self {
        assert_eq!(offset.len(), self.lattice.dim(), "shift: offset has {} axes, lattice has {}", offset.len(), self.lattice.dim());
        let steps: Vec<Direction> = offset
            .iter()
            .enumerate()
            .flat_map(|(axis, &k)| {
                let dir = if k >= 0 { Direction::up(axis) } else { Direction::down(axis) };
                std::iter::repeat(dir).take(k.unsigned_abs())
            })
            .collect();

        let Some((&first, rest)) = steps.split_first() else {
            return self.duplicate(ctx);
        };
        let mut current = self.step_copy(ctx, first);
        for &dir in rest {
            current = current.step_copy(ctx, dir);
        }
        current
    }

    fn step_copy(&mut self, ctx: &Context, dir: Direction) -> Self {
        let id = ctx.next_field_id();
        let mut next = Self::build(ctx, id, self.name.clone(), self.boundary.clone());
        StencilPlan::new(Parity::All)
            .shift(0, dir)
            .apply(&mut next, &mut *self, |site, src| src.shifted(site.index, dir));
        next
    }
}

impl<T: Element, S: FieldStorage<T>> Drop for Field<T, S> {
    fn drop(&mut self) {
        if self.halo.has_pending() && !std::thread::panicking() {
            self.halo.drain(&mut self.storage, &self.name, &self.boundary);
        }
        self.storage.free();
    }
}
