// src/exec/context.rs
/*!
Run lifetime and per-partition execution context.

A [`Simulation`] owns the immutable lattice decomposition. [`Simulation::run`]
starts one thread per partition, hands each a [`Context`] and runs the same
client closure everywhere (SPMD). Inside a partition, site loops use rayon,
either on the global pool or on a dedicated pool per partition.

Collective operations on the context (reductions, broadcasts, barriers, and
the canonical gathers on fields) must be called by every partition in the same
order. Reductions are deterministic: fixed-size chunks are summed in parallel,
the chunk sums are added in order, and partition sums are added in rank order.
*/

use std::any::Any;
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use rayon::prelude::*;
use tracing::{debug, info, info_span};

use crate::comm::mailbox::Communicator;
use crate::config::LatticeConfig;
use crate::error::{fatal, LatticeError, Result, PEER_ABORT_MARKER};
use crate::lattice::geometry::{Boundary, Parity};
use crate::lattice::partition::{Lattice, Partition, Site};

/// Sites per partial sum in reductions.
pub const REDUCE_CHUNK: usize = 256;

// ==============================================================================
// -------------------------------- Simulation ----------------------------------
// ==============================================================================

#[derive(Debug, Clone)]
pub struct Simulation {
    config: Arc<LatticeConfig>,
    lattice: Arc<Lattice>,
    partitions: Arc<[Arc<Partition>]>,
}

impl Simulation {
    pub fn new(config: LatticeConfig) -> Result<Self> {
        config.validate()?;
        let lattice = Lattice::new(&config.extents, &config.partitions)?;
        let partitions: Vec<Arc<Partition>> = lattice.partitions().into_iter().map(Arc::new).collect();
        for p in &partitions {
            debug!(rank = p.rank(), origin = ?p.origin(), sites = p.sites(), alloc = p.alloc_size(), "partition layout");
        }
        Ok(Self { config: Arc::new(config), lattice: Arc::new(lattice), partitions: partitions.into() })
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        Self::new(LatticeConfig::from_json_str(s)?)
    }

    #[inline] pub fn config(&self) -> &LatticeConfig { &self.config }
    #[inline] pub fn lattice(&self) -> &Lattice { &self.lattice }

    /// Run `body` once per partition and collect the results in rank order.
    ///
    /// A panic in any partition poisons the communicator so that peers blocked
    /// on a receive abort too; the first panic that is not such a follow-up is
    /// then re-raised on the calling thread.
    pub fn run<R, F>(&self, body: F) -> Vec<R>
    where
        F: Fn(&Context) -> R + Sync,
        R: Send,
    {
        let n = self.lattice.partition_count();
        let comm = Arc::new(Communicator::new(n, self.config.exchange_timeout()));
        info!(partitions = n, extents = ?self.lattice.extents(), grid = ?self.lattice.partition_grid(), "run started");

        let outcomes: Vec<thread::Result<R>> = thread::scope(|s| {
            let mut handles = Vec::with_capacity(n);
            for rank in 0..n {
                let ctx = Context {
                    rank,
                    config: Arc::clone(&self.config),
                    lattice: Arc::clone(&self.lattice),
                    partitions: Arc::clone(&self.partitions),
                    comm: Arc::clone(&comm),
                    next_field: AtomicU64::new(0),
                    next_collective: AtomicU64::new(0),
                };
                let body = &body;
                let spawned = thread::Builder::new()
                    .name(format!("partition-{rank}"))
                    .spawn_scoped(s, move || {
                        let outcome = panic::catch_unwind(AssertUnwindSafe(|| ctx.execute(body)));
                        if outcome.is_err() {
                            ctx.comm.poison();
                        }
                        outcome
                    });
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(e) => {
                        comm.poison();
                        fatal(LatticeError::Io(e));
                    }
                }
            }
            handles.into_iter().map(|h| h.join().unwrap_or_else(Err)).collect()
        });

        let mut results = Vec::with_capacity(n);
        let mut failures = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(r) => results.push(r),
                Err(payload) => failures.push(payload),
            }
        }
        if !failures.is_empty() {
            let root = failures.iter().position(|p| !is_peer_abort(p.as_ref())).unwrap_or(0);
            panic::resume_unwind(failures.swap_remove(root));
        }
        info!(partitions = n, "run finished");
        results
    }
}

fn is_peer_abort(payload: &(dyn Any + Send)) -> bool {
    let msg = payload
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| payload.downcast_ref::<&str>().copied());
    msg.is_some_and(|m| m.contains(PEER_ABORT_MARKER))
}

// ==============================================================================
// --------------------------------- Context ------------------------------------
// ==============================================================================

/// Everything one partition needs: its layout, the shared communicator, and
/// counters that hand out field ids and collective sequence numbers.
#[derive(Debug)]
pub struct Context {
    rank: usize,
    config: Arc<LatticeConfig>,
    lattice: Arc<Lattice>,
    partitions: Arc<[Arc<Partition>]>,
    comm: Arc<Communicator>,
    next_field: AtomicU64,
    next_collective: AtomicU64,
}

impl Context {
    fn execute<R, F>(&self, body: &F) -> R
    where
        F: Fn(&Context) -> R + Sync,
        R: Send,
    {
        let span = info_span!("partition", rank = self.rank);
        let _entered = span.enter();
        match self.config.threads_per_partition {
            Some(threads) => {
                let rank = self.rank;
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(move |i| format!("partition-{rank}-worker-{i}"))
                    .build()
                    .unwrap_or_else(|e| fatal(LatticeError::Config(format!("cannot build rayon pool: {e}"))));
                pool.install(|| body(self))
            }
            None => body(self),
        }
    }

    #[inline] pub fn rank(&self) -> usize { self.rank }
    #[inline] pub fn partition_count(&self) -> usize { self.partitions.len() }
    #[inline] pub fn config(&self) -> &LatticeConfig { &self.config }
    #[inline] pub fn seed(&self) -> u64 { self.config.seed }
    #[inline] pub fn lattice(&self) -> &Arc<Lattice> { &self.lattice }
    #[inline] pub fn partition(&self) -> &Arc<Partition> { &self.partitions[self.rank] }
    #[inline] pub fn partition_of(&self, rank: usize) -> &Partition { &self.partitions[rank] }
    #[inline] pub(crate) fn comm(&self) -> &Arc<Communicator> { &self.comm }

    pub fn boundary_of(&self, field: &str) -> Vec<Boundary> {
        self.config.boundary_of(field)
    }

    #[inline]
    pub(crate) fn next_field_id(&self) -> u64 {
        self.next_field.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    fn next_seq(&self) -> u64 {
        self.next_collective.fetch_add(1, Ordering::Relaxed)
    }

    // --------------------------- collectives ---------------------------

    pub fn barrier(&self) {
        self.comm.barrier(self.rank, self.next_seq());
    }

    /// `root` passes `Some(payload)`, everybody receives it.
    pub fn broadcast_bytes(&self, root: usize, bytes: Option<Vec<u8>>) -> Vec<u8> {
        self.comm.broadcast(self.rank, root, self.next_seq(), bytes)
    }

    pub(crate) fn allgather_bytes(&self, bytes: Vec<u8>) -> Vec<Vec<u8>> {
        self.comm.allgather(self.rank, self.next_seq(), bytes)
    }

    /// Element-wise sum over partitions, identical on every partition.
    pub fn allreduce_sum(&self, local: &[f64]) -> Vec<f64> {
        self.comm.allreduce_sum(self.rank, self.next_seq(), local)
    }

    /// Sum of `f` over the sites of `par` on the whole lattice.
    pub fn reduce_sum<F>(&self, par: Parity, f: F) -> f64
    where
        F: Fn(Site<'_>) -> f64 + Sync,
    {
        let partition = self.partition();
        let local = chunked_sum(partition.sites_of(par), |i| f(partition.site(i)));
        self.allreduce_sum(&[local])[0]
    }

    /// Histogram-style reduction: each site adds its value to one of `bins`
    /// accumulators; sites returning `None` contribute nothing.
    pub fn reduce_bins<F>(&self, par: Parity, bins: usize, f: F) -> Vec<f64>
    where
        F: Fn(Site<'_>) -> Option<(usize, f64)> + Sync,
    {
        let partition = self.partition();
        let local = chunked_bins(partition.sites_of(par), bins, |i| f(partition.site(i)));
        self.allreduce_sum(&local)
    }
}

pub(crate) fn chunked_sum<F>(range: Range<usize>, f: F) -> f64
where
    F: Fn(usize) -> f64 + Sync,
{
    let end = range.end;
    let starts: Vec<usize> = range.step_by(REDUCE_CHUNK).collect();
    let partials: Vec<f64> = starts
        .par_iter()
        .map(|&s| (s..(s + REDUCE_CHUNK).min(end)).map(&f).sum::<f64>())
        .collect();
    partials.iter().sum()
}

/// Same grouping as [`chunked_sum`], over an explicit site list.
pub(crate) fn chunked_sum_sites<F>(sites: &[usize], f: F) -> f64
where
    F: Fn(usize) -> f64 + Sync,
{
    let partials: Vec<f64> = sites
        .par_chunks(REDUCE_CHUNK)
        .map(|chunk| chunk.iter().map(|&i| f(i)).sum::<f64>())
        .collect();
    partials.iter().sum()
}

pub(crate) fn chunked_bins<F>(range: Range<usize>, bins: usize, f: F) -> Vec<f64>
where
    F: Fn(usize) -> Option<(usize, f64)> + Sync,
{
    let end = range.end;
    let starts: Vec<usize> = range.step_by(REDUCE_CHUNK).collect();
    let partials: Vec<Vec<f64>> = starts
        .par_iter()
        .map(|&s| {
            let mut acc = vec![0.0f64; bins];
            for i in s..(s + REDUCE_CHUNK).min(end) {
                if let Some((bin, v)) = f(i) {
                    assert!(bin < bins, "reduce_bins: bin {bin} out of range ({bins} bins)");
                    acc[bin] += v;
                }
            }
            acc
        })
        .collect();
    let mut total = vec![0.0f64; bins];
    for part in &partials {
        for (t, v) in total.iter_mut().zip(part) {
            *t += v;
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunked_sum_matches_serial() {
        let serial: f64 = (0..1000).map(|i| i as f64 * 0.25).sum();
        assert_eq!(chunked_sum(0..1000, |i| i as f64 * 0.25), serial);
        assert_eq!(chunked_sum(5..5, |_| 1.0), 0.0);
    }

    #[test]
    fn chunked_sum_over_a_site_list() {
        let sites: Vec<usize> = (0..1000).collect();
        assert_eq!(chunked_sum_sites(&sites, |i| i as f64 * 0.25), chunked_sum(0..1000, |i| i as f64 * 0.25));
        assert_eq!(chunked_sum_sites(&[], |_| 1.0), 0.0);
    }

    #[test]
    fn chunked_bins_counts() {
        let bins = chunked_bins(0..600, 3, |i| Some((i % 3, 1.0)));
        assert_eq!(bins, vec![200.0, 200.0, 200.0]);
        let bins = chunked_bins(0..10, 2, |i| (i < 4).then_some((1, 2.0)));
        assert_eq!(bins, vec![0.0, 8.0]);
    }

    #[test]
    fn peer_abort_payloads_are_recognised() {
        let p: Box<dyn Any + Send> = Box::new(String::from("peer partition aborted"));
        assert!(is_peer_abort(p.as_ref()));
        let p: Box<dyn Any + Send> = Box::new("index out of range");
        assert!(!is_peer_abort(p.as_ref()));
    }
}
