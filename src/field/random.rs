// src/field/random.rs
/*
    Fill fields with random numbers (site-parallel, partition invariant).

    Design
    ------
    - Every site draws from its own `StdRng`, seeded from the base seed and the
      site's canonical index. The value stored at a global coordinate therefore
      does not depend on how the lattice is partitioned or on thread count.
    - Components of an element are drawn in memory order from the site's RNG.
    - Distribution parameters are checked once, before the site loop; bad
      parameters come back as `LatticeError::Config`.
*/

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Bernoulli, Distribution, Normal, Uniform};

use super::element::{Component, Element};
use super::lattice_field::Field;
use super::storage::FieldStorage;
use crate::error::{LatticeError, Result};
use crate::lattice::geometry::Parity;

/// High-level random specification for [`fill_random`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RandType {
    /// Continuous uniform on **[low, high)**.
    Uniform { low: f64, high: f64 },
    /// Integer uniform on **[low, high]** inclusive.
    UniformInt { low: i64, high: i64 },
    /// Normal (Gaussian) with mean/std.
    Normal { mean: f64, std: f64 },
    /// 1 with probability `p`, else 0.
    Bernoulli { p: f64 },
}

enum Sampler {
    Uniform(Uniform<f64>),
    UniformInt(Uniform<i64>),
    Normal(Normal<f64>),
    Bernoulli(Bernoulli),
}

impl Sampler {
    fn new(spec: RandType) -> Result<Self> {
        let bad = |what: &str| LatticeError::Config(format!("invalid {what} parameters in {spec:?}"));
        Ok(match spec {
            RandType::Uniform { low, high } => Sampler::Uniform(Uniform::new(low, high).map_err(|_| bad("uniform"))?),
            RandType::UniformInt { low, high } => {
                Sampler::UniformInt(Uniform::new_inclusive(low, high).map_err(|_| bad("integer uniform"))?)
            }
            RandType::Normal { mean, std } => {
                // rand_distr only rejects a non-finite std; a negative one would mirror the samples
                if !mean.is_finite() || !(std >= 0.0) {
                    return Err(bad("normal"));
                }
                Sampler::Normal(Normal::new(mean, std).map_err(|_| bad("normal"))?)
            }
            RandType::Bernoulli { p } => Sampler::Bernoulli(Bernoulli::new(p).map_err(|_| bad("bernoulli"))?),
        })
    }

    #[inline]
    fn draw<C: Component>(&self, rng: &mut StdRng) -> C {
        match self {
            Sampler::Uniform(d) => C::from_f64(d.sample(rng)),
            Sampler::UniformInt(d) => C::from_f64(d.sample(rng) as f64),
            Sampler::Normal(d) => C::from_f64(d.sample(rng)),
            Sampler::Bernoulli(d) => C::from_f64(if d.sample(rng) { 1.0 } else { 0.0 }),
        }
    }
}

/// SplitMix64 finalizer; decorrelates neighbouring site seeds.
#[inline]
fn site_seed(seed: u64, canonical: u64) -> u64 {
    let mut z = seed ^ canonical.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Fill the sites of `par` according to `spec`.
pub fn fill_random<T, S>(field: &mut Field<T, S>, par: Parity, spec: RandType, seed: u64) -> Result<()>
where
    T: Element,
    S: FieldStorage<T>,
{
    let sampler = Sampler::new(spec)?;
    field.assign(par, |site| {
        let mut rng = StdRng::seed_from_u64(site_seed(seed, site.canonical() as u64));
        let mut value = T::zeroed();
        for c in value.components_mut() {
            *c = sampler.draw(&mut rng);
        }
        value
    });
    Ok(())
}
