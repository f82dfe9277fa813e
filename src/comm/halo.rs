// src/comm/halo.rs
/*!
Ghost-region bookkeeping of one field.

# Highlights
- `start_get(dir, par)` packs the opposite face of the owned block and hands it
  to the partition that needs it, then records a pending receive. When this
  partition is its own neighbour the packed bytes are kept as a local transfer
  and no message is sent.
- `wait(dir, par)` completes the pending transfer, scatters it into the ghost
  slots and applies the antiperiodic sign flip if the ghosts wrap the global
  edge.
- Freshness is a per-direction parity mask. An `All` fetch satisfies later
  `Even` and `Odd` requests. Any write to the field clears it.

# Invariants
- Every partition runs the same sequence of exchange calls on a field, so the
  per-(direction, parity) generation counters agree across partitions and
  pair each send with exactly one receive.
- Ghost slots are written only here.
*/

use std::sync::Arc;

use ahash::AHashMap;
use tracing::trace;

use super::mailbox::{Communicator, Tag};
use crate::error::{fatal, LatticeError};
use crate::field::element::Element;
use crate::field::storage::FieldStorage;
use crate::lattice::geometry::{Boundary, Direction, Parity};
use crate::lattice::partition::Partition;

#[derive(Debug)]
enum Transfer {
    Local(Vec<u8>),
    Remote { from: usize, tag: Tag },
}

#[derive(Debug)]
struct Pending {
    dir: Direction,
    parity: Parity,
    transfer: Transfer,
}

#[derive(Debug)]
pub(crate) struct HaloExchange {
    field: u64,
    partition: Arc<Partition>,
    comm: Arc<Communicator>,
    fresh: Vec<u8>,
    pending: Vec<Pending>,
    generations: AHashMap<(usize, u8), u64>,
}

impl HaloExchange {
    pub(crate) fn new(field: u64, partition: Arc<Partition>, comm: Arc<Communicator>) -> Self {
        let dirs = 2 * partition.dim();
        Self {
            field,
            partition,
            comm,
            fresh: vec![0u8; dirs],
            pending: Vec::new(),
            generations: AHashMap::default(),
        }
    }

    #[inline]
    pub(crate) fn is_fresh(&self, dir: Direction, par: Parity) -> bool {
        let mask = self.fresh[dir.index()];
        mask & par.mask() == par.mask()
    }

    #[inline]
    pub(crate) fn in_flight(&self, dir: Direction, par: Parity) -> bool {
        self.pending.iter().any(|p| p.dir == dir && p.parity.contains(par))
    }

    #[inline]
    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub(crate) fn start_get<T: Element, S: FieldStorage<T>>(
        &mut self,
        storage: &S,
        name: &str,
        dir: Direction,
        par: Parity,
    ) {
        if self.is_fresh(dir, par) || self.in_flight(dir, par) {
            trace!(field = name, %dir, %par, "start_get skipped");
            return;
        }

        let rank = self.partition.rank();
        let bytes = storage.gather(self.partition.send_list(dir, par));
        let to = self.partition.send_to(dir);
        let from = self.partition.recv_from(dir);

        let transfer = if to == rank {
            Transfer::Local(bytes)
        } else {
            let generation = self.generations.entry((dir.index(), par.mask())).or_insert(0);
            let tag = Tag::Halo { field: self.field, dir: dir.index(), parity: par.mask(), generation: *generation };
            *generation += 1;
            self.comm.send(rank, to, tag, bytes);
            Transfer::Remote { from, tag }
        };
        trace!(field = name, %dir, %par, to, from, "start_get");
        self.pending.push(Pending { dir, parity: par, transfer });
    }

    pub(crate) fn wait<T: Element, S: FieldStorage<T>>(
        &mut self,
        storage: &mut S,
        name: &str,
        boundary: &[Boundary],
        dir: Direction,
        par: Parity,
    ) {
        let covering = self
            .pending
            .iter()
            .position(|p| p.dir == dir && p.parity == par)
            .or_else(|| self.pending.iter().position(|p| p.dir == dir && p.parity.contains(par)));

        match covering {
            Some(i) => {
                let p = self.pending.remove(i);
                self.complete(storage, name, boundary, p);
            }
            None => {
                while let Some(i) =
                    self.pending.iter().position(|p| p.dir == dir && p.parity.mask() & par.mask() != 0)
                {
                    let p = self.pending.remove(i);
                    self.complete(storage, name, boundary, p);
                }
            }
        }

        if !self.is_fresh(dir, par) {
            fatal(LatticeError::Protocol(format!(
                "wait({dir}, {par}) on field `{name}` without a matching start_get"
            )));
        }
    }

    /// Complete every outstanding transfer.
    pub(crate) fn drain<T: Element, S: FieldStorage<T>>(&mut self, storage: &mut S, name: &str, boundary: &[Boundary]) {
        while !self.pending.is_empty() {
            let p = self.pending.remove(0);
            self.complete(storage, name, boundary, p);
        }
    }

    /// Forget every fetched ghost value. Callers drain first.
    #[inline]
    pub(crate) fn invalidate(&mut self) {
        debug_assert!(self.pending.is_empty());
        self.fresh.iter_mut().for_each(|m| *m = 0);
    }

    fn complete<T: Element, S: FieldStorage<T>>(
        &mut self,
        storage: &mut S,
        name: &str,
        boundary: &[Boundary],
        pending: Pending,
    ) {
        let Pending { dir, parity, transfer } = pending;
        let bytes = match transfer {
            Transfer::Local(bytes) => bytes,
            Transfer::Remote { from, tag } => self.comm.recv(self.partition.rank(), from, tag),
        };

        let ghosts = self.partition.recv_list(dir, parity);
        let expected = ghosts.len() * std::mem::size_of::<T>();
        if bytes.len() != expected {
            fatal(LatticeError::LayoutMismatch { expected, actual: bytes.len() });
        }
        storage.scatter(&bytes, ghosts);

        if self.partition.wraps(dir) && boundary[dir.axis()] == Boundary::Antiperiodic {
            for &g in ghosts {
                let v = storage.get(g);
                storage.set(g, v.negated());
            }
        }

        self.fresh[dir.index()] |= parity.mask();
        trace!(field = name, %dir, %parity, ghosts = ghosts.len(), "wait complete");
    }
}
