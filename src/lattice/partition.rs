// src/lattice/partition.rs
/*!
Block decomposition of a periodic hypercubic lattice.

# Highlights
- The global lattice is cut into an axis-aligned grid of equal blocks. Block
  (partition) ranks and site coordinates are both row-major with axis 0 slowest.
- Inside a partition every real site has a local index in `0..sites()`; even
  sites come first, then odd ones, each group in local row-major order. Because
  every local extent is even, the parity of a site is the same whether taken
  from local or global coordinates, so the ordering is shared by all partitions.
- After the real sites come the ghost slots: one contiguous block per
  direction, one slot per boundary site, ordered by the site's position on the
  face (row-major over the transverse axes).

# Invariants
- `sum(local volumes) == volume` and every global coordinate has exactly one
  owner.
- For a direction `d`, partition `r` receives its ghosts from
  `recv_from(d)` and sends its opposite face to `send_to(d)`. Both lists are in
  face order, so the k-th sent element lands in the k-th ghost slot.
- Parity-filtered lists pair up: the receive list for loop parity `p` holds the
  ghosts read by sites of parity `p`, and the matching send list holds the
  owners of those values, which all have parity `p.opposite()`.
*/

use std::ops::Range;
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use super::geometry::{
    row_major_coords, row_major_index, wrap_axis_index, Direction, Parity,
};
use crate::config::PartitionSpec;
use crate::error::{LatticeError, Result};

/// Nearest-neighbour stencils only ever need one ghost layer.
pub const HALO_WIDTH: usize = 1;

// ==============================================================================
// --------------------------------- Lattice ------------------------------------
// ==============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Lattice {
    extents: Vec<usize>,
    grid: Vec<usize>,
    local: Vec<usize>,
    volume: usize,
    even_count: usize,
    /// local row-major position -> local site index
    site_of_pos: Vec<usize>,
    /// local site index -> local row-major position
    pos_of_site: Vec<usize>,
}

impl Lattice {
    /// Build the decomposition of `extents` described by `spec`.
    pub fn new(extents: &[usize], spec: &PartitionSpec) -> Result<Self> {
        validate_extents(extents)?;
        let grid = match spec {
            PartitionSpec::Count(count) => decompose(extents, *count)?,
            PartitionSpec::Grid(grid) => {
                check_grid(extents, grid)?;
                grid.clone()
            }
        };
        let local: Vec<usize> = extents.iter().zip(&grid).map(|(&l, &g)| l / g).collect();
        let volume = extents.iter().product();

        let local_volume: usize = local.iter().product();
        let mut even = Vec::with_capacity(local_volume / 2);
        let mut odd = Vec::with_capacity(local_volume / 2);
        for pos in 0..local_volume {
            match Parity::of_coords(&row_major_coords(pos, &local)) {
                Parity::Even => even.push(pos),
                _ => odd.push(pos),
            }
        }
        let even_count = even.len();
        let pos_of_site: Vec<usize> = even.into_iter().chain(odd).collect();
        let mut site_of_pos = vec![0usize; local_volume];
        for (site, &pos) in pos_of_site.iter().enumerate() {
            site_of_pos[pos] = site;
        }

        debug!(?extents, ?grid, ?local, "lattice decomposed");
        Ok(Self {
            extents: extents.to_vec(),
            grid,
            local,
            volume,
            even_count,
            site_of_pos,
            pos_of_site,
        })
    }

    /// Shorthand for `new(extents, &PartitionSpec::Count(count))`.
    pub fn with_partitions(extents: &[usize], count: usize) -> Result<Self> {
        Self::new(extents, &PartitionSpec::Count(count))
    }

    #[inline] pub fn dim(&self) -> usize { self.extents.len() }
    #[inline] pub fn extents(&self) -> &[usize] { &self.extents }
    #[inline] pub fn volume(&self) -> usize { self.volume }
    #[inline] pub fn partition_grid(&self) -> &[usize] { &self.grid }
    #[inline] pub fn partition_count(&self) -> usize { self.grid.iter().product() }
    #[inline] pub fn local_extents(&self) -> &[usize] { &self.local }
    #[inline] pub fn local_volume(&self) -> usize { self.pos_of_site.len() }
    #[inline] pub fn halo_width(&self) -> usize { HALO_WIDTH }

    /// Position of partition `rank` in the partition grid.
    #[inline]
    pub fn partition_coords(&self, rank: usize) -> Vec<usize> {
        assert!(rank < self.partition_count(), "rank {rank} out of range");
        row_major_coords(rank, &self.grid)
    }

    #[inline]
    pub fn rank_of(&self, partition_coords: &[usize]) -> usize {
        row_major_index(partition_coords, &self.grid)
    }

    /// Rank one step along `dir` from `rank`, periodic in the partition grid.
    pub fn neighbour_rank(&self, rank: usize, dir: Direction) -> usize {
        let mut pc = self.partition_coords(rank);
        let a = dir.axis();
        pc[a] = wrap_axis_index(pc[a] as isize + dir.step(), self.grid[a]);
        self.rank_of(&pc)
    }

    /// Reduce arbitrary integer coordinates onto the lattice.
    pub fn normalize(&self, coords: &[isize]) -> Vec<usize> {
        assert_eq!(coords.len(), self.dim(), "coordinate has {} axes, lattice has {}", coords.len(), self.dim());
        coords.iter().zip(&self.extents).map(|(&c, &l)| wrap_axis_index(c, l)).collect()
    }

    /// `(rank, local site index)` owning the (wrapped) coordinate.
    pub fn owner(&self, coords: &[isize]) -> (usize, usize) {
        let coords = self.normalize(coords);
        let mut pc = Vec::with_capacity(self.dim());
        let mut lc = Vec::with_capacity(self.dim());
        for (&c, &l) in coords.iter().zip(&self.local) {
            pc.push(c / l);
            lc.push(c % l);
        }
        (self.rank_of(&pc), self.site_of_pos[row_major_index(&lc, &self.local)])
    }

    /// Canonical (global row-major) index of an in-range coordinate.
    #[inline]
    pub fn canonical_index(&self, coords: &[usize]) -> usize {
        row_major_index(coords, &self.extents)
    }

    /// Full site layout of partition `rank`.
    pub fn partition(&self, rank: usize) -> Partition {
        Partition::build(self, rank)
    }

    pub fn partitions(&self) -> Vec<Partition> {
        (0..self.partition_count()).map(|r| self.partition(r)).collect()
    }
}

fn validate_extents(extents: &[usize]) -> Result<()> {
    if extents.is_empty() {
        return Err(LatticeError::InvalidExtents {
            extents: extents.to_vec(),
            reason: "lattice needs at least one axis".into(),
        });
    }
    if extents.iter().any(|&l| l < 2 || l % 2 != 0) {
        return Err(LatticeError::InvalidExtents {
            extents: extents.to_vec(),
            reason: "every extent must be even and at least 2".into(),
        });
    }
    Ok(())
}

fn check_grid(extents: &[usize], grid: &[usize]) -> Result<()> {
    let tiles = grid.len() == extents.len()
        && grid.iter().zip(extents).all(|(&g, &l)| g > 0 && l % g == 0 && (l / g) % 2 == 0);
    if tiles {
        Ok(())
    } else {
        Err(LatticeError::PartitionGrid { extents: extents.to_vec(), grid: grid.to_vec() })
    }
}

/// Split `count` into a partition grid, largest prime factor first. Each factor
/// cuts the axis with the largest remaining local extent that it divides into
/// even pieces (lowest axis on ties).
fn decompose(extents: &[usize], count: usize) -> Result<Vec<usize>> {
    let fail = || LatticeError::Decomposition { extents: extents.to_vec(), count };
    if count == 0 {
        return Err(fail());
    }
    let mut grid = vec![1usize; extents.len()];
    let mut local = extents.to_vec();
    for p in prime_factors(count) {
        let mut best: Option<usize> = None;
        for (a, &l) in local.iter().enumerate() {
            let fits = l % p == 0 && (l / p) % 2 == 0;
            if fits && best.map_or(true, |b| l > local[b]) {
                best = Some(a);
            }
        }
        let a = best.ok_or_else(fail)?;
        grid[a] *= p;
        local[a] /= p;
    }
    Ok(grid)
}

fn prime_factors(mut n: usize) -> Vec<usize> {
    let mut factors = Vec::new();
    let mut p = 2;
    while p * p <= n {
        while n % p == 0 {
            factors.push(p);
            n /= p;
        }
        p += 1;
    }
    if n > 1 {
        factors.push(n);
    }
    factors.sort_unstable_by(|a, b| b.cmp(a));
    factors
}

// ==============================================================================
// -------------------------------- Partition -----------------------------------
// ==============================================================================

#[inline]
fn parity_slot(par: Parity) -> usize {
    match par {
        Parity::Even => 0,
        Parity::Odd => 1,
        Parity::All => 2,
    }
}

#[derive(Debug, Clone)]
struct Face {
    send_to: usize,
    recv_from: usize,
    wraps: bool,
    send: [Vec<usize>; 3],
    recv: [Vec<usize>; 3],
}

/// Sites of one parity, split by whether a set of directions stays inside the
/// partition. Both lists are ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteSplit {
    /// Every listed direction leads to a real site.
    pub interior: Vec<usize>,
    /// At least one listed direction leads into the ghost region.
    pub boundary: Vec<usize>,
}

/// Site layout and halo plumbing of one partition.
#[derive(Debug)]
pub struct Partition {
    rank: usize,
    extents: Vec<usize>,
    local: Vec<usize>,
    origin: Vec<usize>,
    even_count: usize,
    site_of_pos: Vec<usize>,
    pos_of_site: Vec<usize>,
    neighbours: Vec<Vec<usize>>,
    faces: Vec<Face>,
    alloc_size: usize,
    /// (direction bit set, parity mask) -> split, filled on first request
    splits: Mutex<AHashMap<(u64, u8), Arc<SiteSplit>>>,
}

impl Partition {
    fn build(lattice: &Lattice, rank: usize) -> Self {
        let pc = lattice.partition_coords(rank);
        let local = lattice.local.clone();
        let origin: Vec<usize> = pc.iter().zip(&local).map(|(&p, &l)| p * l).collect();
        let sites = lattice.local_volume();
        let even_count = lattice.even_count;
        let site_parity = |site: usize| if site < even_count { Parity::Even } else { Parity::Odd };

        let mut neighbours = Vec::with_capacity(2 * lattice.dim());
        let mut faces = Vec::with_capacity(2 * lattice.dim());
        let mut ghost_base = sites;

        for dir in Direction::all(lattice.dim()) {
            let a = dir.axis();
            let l = local[a];
            let (send_edge, recv_edge) = if dir.is_forward() { (0, l - 1) } else { (l - 1, 0) };

            let mut nb = vec![0usize; sites];
            let mut send_all = Vec::with_capacity(sites / l);
            let mut recv_all = Vec::with_capacity(sites / l);
            let mut recv_sites = Vec::with_capacity(sites / l);

            for pos in 0..sites {
                let site = lattice.site_of_pos[pos];
                let mut c = row_major_coords(pos, &local);
                if c[a] == send_edge {
                    send_all.push(site);
                }
                if c[a] == recv_edge {
                    let ghost = ghost_base + recv_all.len();
                    recv_all.push(ghost);
                    recv_sites.push(site);
                    nb[site] = ghost;
                } else {
                    c[a] = (c[a] as isize + dir.step()) as usize;
                    nb[site] = lattice.site_of_pos[row_major_index(&c, &local)];
                }
            }

            let filter_send = |par: Parity| -> Vec<usize> {
                send_all.iter().copied().filter(|&s| site_parity(s) == par.opposite()).collect()
            };
            let filter_recv = |par: Parity| -> Vec<usize> {
                recv_all
                    .iter()
                    .zip(&recv_sites)
                    .filter(|&(_, &s)| site_parity(s) == par)
                    .map(|(&g, _)| g)
                    .collect()
            };

            let wraps = if dir.is_forward() { pc[a] == lattice.grid[a] - 1 } else { pc[a] == 0 };
            faces.push(Face {
                send_to: lattice.neighbour_rank(rank, dir.opposite()),
                recv_from: lattice.neighbour_rank(rank, dir),
                wraps,
                send: [filter_send(Parity::Even), filter_send(Parity::Odd), send_all.clone()],
                recv: [filter_recv(Parity::Even), filter_recv(Parity::Odd), recv_all.clone()],
            });
            ghost_base += recv_all.len();
            neighbours.push(nb);
        }

        Self {
            rank,
            extents: lattice.extents.clone(),
            local,
            origin,
            even_count,
            site_of_pos: lattice.site_of_pos.clone(),
            pos_of_site: lattice.pos_of_site.clone(),
            neighbours,
            faces,
            alloc_size: ghost_base,
            splits: Mutex::new(AHashMap::default()),
        }
    }

    #[inline] pub fn rank(&self) -> usize { self.rank }
    #[inline] pub fn dim(&self) -> usize { self.local.len() }
    #[inline] pub fn extents(&self) -> &[usize] { &self.extents }
    #[inline] pub fn local_extents(&self) -> &[usize] { &self.local }
    #[inline] pub fn origin(&self) -> &[usize] { &self.origin }
    /// Number of real (owned) sites.
    #[inline] pub fn sites(&self) -> usize { self.pos_of_site.len() }
    #[inline] pub fn even_count(&self) -> usize { self.even_count }
    /// Real sites plus every ghost slot; the length of a field buffer.
    #[inline] pub fn alloc_size(&self) -> usize { self.alloc_size }
    #[inline] pub fn is_ghost(&self, index: usize) -> bool { index >= self.sites() }

    /// Contiguous range of local indices holding the sites of `par`.
    #[inline]
    pub fn sites_of(&self, par: Parity) -> Range<usize> {
        match par {
            Parity::Even => 0..self.even_count,
            Parity::Odd => self.even_count..self.sites(),
            Parity::All => 0..self.sites(),
        }
    }

    #[inline]
    pub fn parity_of(&self, site: usize) -> Parity {
        debug_assert!(site < self.sites());
        if site < self.even_count { Parity::Even } else { Parity::Odd }
    }

    #[inline]
    pub fn site(&self, index: usize) -> Site<'_> {
        Site { index, parity: self.parity_of(index), partition: self }
    }

    pub fn local_coords(&self, site: usize) -> Vec<usize> {
        assert!(site < self.sites(), "site {site} is not a real site (sites = {})", self.sites());
        row_major_coords(self.pos_of_site[site], &self.local)
    }

    /// Global coordinates of a real site.
    pub fn coords(&self, site: usize) -> Vec<usize> {
        let mut c = self.local_coords(site);
        for (x, &o) in c.iter_mut().zip(&self.origin) {
            *x += o;
        }
        c
    }

    #[inline]
    pub fn canonical(&self, site: usize) -> usize {
        row_major_index(&self.coords(site), &self.extents)
    }

    #[inline]
    pub fn local_index(&self, local_coords: &[usize]) -> usize {
        self.site_of_pos[row_major_index(local_coords, &self.local)]
    }

    /// Local index (real or ghost) one step along `dir` from real site `site`.
    #[inline]
    pub fn neighbour(&self, dir: Direction, site: usize) -> usize {
        self.neighbours[dir.index()][site]
    }

    /// Owned sites whose values fill the `dir` ghosts of `send_to(dir)`.
    #[inline]
    pub fn send_list(&self, dir: Direction, par: Parity) -> &[usize] {
        &self.faces[dir.index()].send[parity_slot(par)]
    }

    /// Ghost slots refreshed by a `dir` fetch for loop parity `par`.
    #[inline]
    pub fn recv_list(&self, dir: Direction, par: Parity) -> &[usize] {
        &self.faces[dir.index()].recv[parity_slot(par)]
    }

    #[inline] pub fn send_to(&self, dir: Direction) -> usize { self.faces[dir.index()].send_to }
    #[inline] pub fn recv_from(&self, dir: Direction) -> usize { self.faces[dir.index()].recv_from }

    /// True when the `dir` ghosts of this partition wrap the global edge.
    #[inline] pub fn wraps(&self, dir: Direction) -> bool { self.faces[dir.index()].wraps }

    /// Sites of `par` whose neighbours along every direction in `dirs` are
    /// real, and the rest. Computed once per (direction set, parity).
    pub fn split_sites(&self, par: Parity, dirs: &[Direction]) -> Arc<SiteSplit> {
        debug_assert!(2 * self.dim() <= 64);
        let set = dirs.iter().fold(0u64, |m, d| m | 1 << d.index());
        let key = (set, par.mask());
        if let Some(split) = self.splits.lock().get(&key) {
            return Arc::clone(split);
        }

        let (interior, boundary): (Vec<usize>, Vec<usize>) = self
            .sites_of(par)
            .partition(|&s| dirs.iter().all(|&d| !self.is_ghost(self.neighbour(d, s))));
        let split = Arc::new(SiteSplit { interior, boundary });
        Arc::clone(self.splits.lock().entry(key).or_insert(split))
    }
}

/// A real site seen from inside a site loop.
#[derive(Debug, Clone, Copy)]
pub struct Site<'a> {
    pub index: usize,
    pub parity: Parity,
    partition: &'a Partition,
}

impl<'a> Site<'a> {
    #[inline] pub fn partition(&self) -> &'a Partition { self.partition }
    #[inline] pub fn coords(&self) -> Vec<usize> { self.partition.coords(self.index) }
    #[inline] pub fn canonical(&self) -> usize { self.partition.canonical(self.index) }
    #[inline] pub fn neighbour(&self, dir: Direction) -> usize { self.partition.neighbour(dir, self.index) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_extents() {
        assert!(matches!(
            Lattice::with_partitions(&[], 1),
            Err(LatticeError::InvalidExtents { .. })
        ));
        assert!(matches!(
            Lattice::with_partitions(&[4, 5], 1),
            Err(LatticeError::InvalidExtents { .. })
        ));
    }

    #[test]
    fn decomposes_largest_axis_first() {
        let lat = Lattice::with_partitions(&[4, 8], 2).unwrap();
        assert_eq!(lat.partition_grid(), &[1, 2]);
        let lat = Lattice::with_partitions(&[8, 8], 4).unwrap();
        assert_eq!(lat.partition_grid(), &[2, 2]);
        let lat = Lattice::with_partitions(&[12, 4], 3).unwrap();
        assert_eq!(lat.partition_grid(), &[3, 1]);
        assert_eq!(lat.local_extents(), &[4, 4]);
    }

    #[test]
    fn undecomposable_count_is_an_error() {
        assert!(matches!(
            Lattice::with_partitions(&[4, 4], 3),
            Err(LatticeError::Decomposition { count: 3, .. })
        ));
        assert!(matches!(
            Lattice::with_partitions(&[2, 2], 2),
            Err(LatticeError::Decomposition { .. })
        ));
        assert!(matches!(
            Lattice::new(&[8, 8], &PartitionSpec::Grid(vec![4, 3])),
            Err(LatticeError::PartitionGrid { .. })
        ));
    }

    #[test]
    fn every_site_has_one_owner() {
        let lat = Lattice::new(&[4, 8, 4], &PartitionSpec::Grid(vec![2, 2, 1])).unwrap();
        let parts = lat.partitions();
        assert_eq!(parts.iter().map(|p| p.sites()).sum::<usize>(), lat.volume());

        let mut seen = vec![0u8; lat.volume()];
        for p in &parts {
            for s in p.sites_of(Parity::All) {
                let c = p.coords(s);
                let ci: Vec<isize> = c.iter().map(|&x| x as isize).collect();
                assert_eq!(lat.owner(&ci), (p.rank(), s));
                seen[p.canonical(s)] += 1;
            }
        }
        assert!(seen.iter().all(|&n| n == 1));
    }

    #[test]
    fn even_sites_come_first() {
        let p = Lattice::with_partitions(&[4, 4], 1).unwrap().partition(0);
        assert_eq!(p.even_count(), 8);
        for s in p.sites_of(Parity::Even) {
            assert_eq!(Parity::of_coords(&p.coords(s)), Parity::Even);
        }
        for s in p.sites_of(Parity::Odd) {
            assert_eq!(Parity::of_coords(&p.coords(s)), Parity::Odd);
        }
    }

    #[test]
    fn interior_neighbours_and_ghost_slots() {
        let lat = Lattice::with_partitions(&[4, 4], 1).unwrap();
        let p = lat.partition(0);
        // 16 sites + 4 ghosts in each of 4 directions
        assert_eq!(p.alloc_size(), 16 + 16);

        let s = p.local_index(&[1, 2]);
        let n = p.neighbour(Direction::up(0), s);
        assert_eq!(p.coords(n), vec![2, 2]);
        let n = p.neighbour(Direction::down(1), s);
        assert_eq!(p.coords(n), vec![1, 1]);

        let edge = p.local_index(&[3, 0]);
        assert!(p.is_ghost(p.neighbour(Direction::up(0), edge)));
        assert!(p.is_ghost(p.neighbour(Direction::down(1), edge)));
        assert!(p.wraps(Direction::up(0)));
        assert_eq!(p.send_to(Direction::up(0)), 0);
    }

    #[test]
    fn face_lists_pair_up_by_parity() {
        let lat = Lattice::new(&[8, 4], &PartitionSpec::Grid(vec![2, 1])).unwrap();
        let parts = lat.partitions();
        for r in &parts {
            for dir in Direction::all(2) {
                let sender = &parts[r.recv_from(dir)];
                assert_eq!(sender.send_to(dir), r.rank());
                for par in [Parity::Even, Parity::Odd, Parity::All] {
                    let recv = r.recv_list(dir, par);
                    let send = sender.send_list(dir, par);
                    assert_eq!(recv.len(), send.len());
                    for s in r.sites_of(par) {
                        let nb = r.neighbour(dir, s);
                        if let Some(k) = recv.iter().position(|&g| g == nb) {
                            let mut want = r.coords(s);
                            let a = dir.axis();
                            want[a] = wrap_axis_index(want[a] as isize + dir.step(), lat.extents()[a]);
                            assert_eq!(sender.coords(send[k]), want);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn interior_split_by_direction_set() {
        let p = Lattice::with_partitions(&[4, 4], 1).unwrap().partition(0);
        let up = Direction::up(0);

        let split = p.split_sites(Parity::All, &[up]);
        assert_eq!((split.interior.len(), split.boundary.len()), (12, 4));
        assert!(split.boundary.iter().all(|&s| p.coords(s)[0] == 3));
        assert!(split.interior.windows(2).all(|w| w[0] < w[1]));
        assert!(Arc::ptr_eq(&split, &p.split_sites(Parity::All, &[up, up])));

        let even = p.split_sites(Parity::Even, &[up, Direction::down(1)]);
        assert!(even.interior.iter().chain(&even.boundary).all(|&s| p.parity_of(s) == Parity::Even));
        // even sites on row 3 or column 0: (3,1) (3,3) (0,0) (2,0)
        assert_eq!(even.boundary.len(), 4);

        let none = p.split_sites(Parity::Odd, &[]);
        assert_eq!(none.interior, p.sites_of(Parity::Odd).collect::<Vec<_>>());
        assert!(none.boundary.is_empty());
    }

    #[test]
    fn wraps_only_at_the_global_edge() {
        let lat = Lattice::new(&[8, 4], &PartitionSpec::Grid(vec![2, 1])).unwrap();
        let p0 = lat.partition(0);
        let p1 = lat.partition(1);
        assert!(!p0.wraps(Direction::up(0)));
        assert!(p0.wraps(Direction::down(0)));
        assert!(p1.wraps(Direction::up(0)));
        assert!(!p1.wraps(Direction::down(0)));
        assert!(p0.wraps(Direction::up(1)) && p1.wraps(Direction::down(1)));
    }
}
