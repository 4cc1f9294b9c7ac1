use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Poisson};

/// Deterministic uniform generator owned by one simulation. Two consumers:
/// uniform doubles in `[0, 1)` for the SSA and hybrid solvers, Poisson draws
/// for tau-leaping.
#[derive(Clone, Debug)]
pub struct Urn {
    rng: SmallRng,
}

impl Urn {
    /// A generator seeded for one simulation run.
    pub fn new(seed: u64) -> Self {
        Urn {
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Uniform draw in `[0, 1)`.
    pub fn next(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    /// `ln(u)` for `u` uniform in `(0, 1]`, so the result is finite and
    /// non-positive. Used for exponential waiting times and reaction clocks.
    pub fn ln_uniform(&mut self) -> f64 {
        (1.0 - self.rng.gen::<f64>()).ln()
    }

    /// Poisson draw with the given mean. Non-positive or non-finite means
    /// yield zero events.
    pub fn poisson(&mut self, lambda: f64) -> u64 {
        if !(lambda > 0.0) || !lambda.is_finite() {
            return 0;
        }
        match Poisson::new(lambda) {
            Ok(dist) => dist.sample(&mut self.rng) as u64,
            Err(_) => 0,
        }
    }
}
