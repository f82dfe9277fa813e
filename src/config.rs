// src/config.rs
//! Run configuration: lattice shape, partitioning, seeds and per-field
//! boundary conditions.
//!
//! Deserialized from JSON with `serde_json`. Everything except `extents` has a
//! default, so the smallest valid document is `{"extents": [8, 8]}`.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LatticeError, Result};
use crate::lattice::geometry::Boundary;

/// How to cut the lattice: a bare partition count, or an explicit number of
/// partitions per axis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PartitionSpec {
    Count(usize),
    Grid(Vec<usize>),
}

impl Default for PartitionSpec {
    fn default() -> Self {
        PartitionSpec::Count(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LatticeConfig {
    pub extents: Vec<usize>,
    #[serde(default)]
    pub partitions: PartitionSpec,
    /// Base seed for random fills.
    #[serde(default)]
    pub seed: u64,
    /// Longest a partition may block on one receive before the run aborts.
    /// `None` (the default) waits indefinitely.
    #[serde(default)]
    pub exchange_timeout_ms: Option<u64>,
    /// Size of the rayon pool inside each partition; `None` shares the global pool.
    #[serde(default)]
    pub threads_per_partition: Option<usize>,
    /// Field name -> one boundary condition per axis.
    #[serde(default)]
    pub boundaries: BTreeMap<String, Vec<Boundary>>,
}

impl LatticeConfig {
    pub fn new(extents: Vec<usize>) -> Self {
        Self {
            extents,
            partitions: PartitionSpec::default(),
            seed: 0,
            exchange_timeout_ms: None,
            threads_per_partition: None,
            boundaries: BTreeMap::new(),
        }
    }

    pub fn with_partitions(mut self, count: usize) -> Self {
        self.partitions = PartitionSpec::Count(count);
        self
    }

    pub fn with_partition_grid(mut self, grid: Vec<usize>) -> Self {
        self.partitions = PartitionSpec::Grid(grid);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_threads_per_partition(mut self, threads: usize) -> Self {
        self.threads_per_partition = Some(threads);
        self
    }

    pub fn with_boundary(mut self, field: impl Into<String>, boundary: Vec<Boundary>) -> Self {
        self.boundaries.insert(field.into(), boundary);
        self
    }

    #[inline]
    pub fn exchange_timeout(&self) -> Option<Duration> {
        self.exchange_timeout_ms.map(Duration::from_millis)
    }

    /// Boundary conditions of the named field; periodic on every axis unless configured.
    pub fn boundary_of(&self, field: &str) -> Vec<Boundary> {
        self.boundaries
            .get(field)
            .cloned()
            .unwrap_or_else(|| vec![Boundary::Periodic; self.extents.len()])
    }

    /// Checks that do not need the decomposition; extents and partitioning are
    /// checked again when the lattice is built.
    pub fn validate(&self) -> Result<()> {
        if self.extents.is_empty() || self.extents.iter().any(|&l| l < 2 || l % 2 != 0) {
            return Err(LatticeError::InvalidExtents {
                extents: self.extents.clone(),
                reason: "every extent must be even and at least 2".into(),
            });
        }
        match &self.partitions {
            PartitionSpec::Count(0) => {
                return Err(LatticeError::Config("partition count must be positive".into()));
            }
            PartitionSpec::Grid(grid) if grid.len() != self.extents.len() => {
                return Err(LatticeError::PartitionGrid { extents: self.extents.clone(), grid: grid.clone() });
            }
            _ => {}
        }
        if self.exchange_timeout_ms == Some(0) {
            return Err(LatticeError::Config("exchange_timeout_ms must be positive".into()));
        }
        if self.threads_per_partition == Some(0) {
            return Err(LatticeError::Config("threads_per_partition must be positive".into()));
        }
        for (field, b) in &self.boundaries {
            if b.len() != self.extents.len() {
                return Err(LatticeError::BoundaryAxes { field: field.clone(), got: b.len(), dim: self.extents.len() });
            }
        }
        Ok(())
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
