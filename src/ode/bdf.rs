//! Variable-order, variable-step backward differentiation formulas (orders 1
//! through 5) with a Newton corrector whose linear systems are solved
//! matrix-free by [`Spgmr`]. Supports root-finding over the last step via
//! cubic Hermite interpolation and bisection, which is how stochastic
//! reaction clocks and event triggers interrupt a hybrid step.

use std::collections::VecDeque;

use log::debug;
use thiserror::Error;

use super::spgmr::Spgmr;

const MAX_ORDER: usize = 5;
const MAX_NEWTON_ITERS: usize = 6;
const MAX_INTERNAL_STEPS: usize = 50_000;

/// The right-hand side (and optional root functions) of an ODE system.
///
/// Solvers pass the system into every call instead of capturing it, so the
/// caller may mutate it (repartition reactions, rebuild formula sets)
/// between steps. Implementations must be pure with respect to `(t, y)`.
pub trait OdeSystem {
    /// State dimension.
    fn dim(&self) -> usize;
    /// Writes `dy/dt` into `dydt`.
    fn rhs(&mut self, t: f64, y: &[f64], dydt: &mut [f64]);
    /// Number of root functions watched during integration.
    fn num_roots(&self) -> usize {
        0
    }
    /// Writes the root function values into `out`.
    fn roots(&mut self, _t: f64, _y: &[f64], _out: &mut [f64]) {}
}

/// Integrator failures. The hybrid solver treats these as a rejected step
/// and retries with a smaller tau; the ODE driver surfaces them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BdfError {
    /// Step size underflow, usually a sign of an unresolvable stiff spot.
    #[error("step size {h:e} underflowed at t = {t}")]
    StepTooSmall {
        /// Step size at failure.
        h: f64,
        /// Time at failure.
        t: f64,
    },
    /// Too many internal steps between two query points.
    #[error("exceeded {0} internal steps")]
    TooMuchWork(usize),
}

/// What stopped an [`Bdf::integrate`] call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// The requested output time was reached.
    Reached,
    /// A root function changed sign; the integrator stopped at the crossing.
    RootFound(Vec<usize>),
}

/// Integrator tolerances, mirroring the driver configuration.
#[derive(Clone, Copy, Debug)]
pub struct BdfOptions {
    /// Relative tolerance.
    pub rel_tol: f64,
    /// Absolute tolerance.
    pub abs_tol: f64,
    /// Maximum internal step; `0` means unlimited.
    pub max_step: f64,
}

/// Saved integrator state, restored when the hybrid solver rejects a step.
#[derive(Clone, Debug)]
pub struct BdfCheckpoint {
    t: f64,
    y: Vec<f64>,
    f: Vec<f64>,
    g: Vec<f64>,
    hist_t: VecDeque<f64>,
    hist_y: VecDeque<Vec<f64>>,
    h: f64,
    order: usize,
}

/// The integrator context: current solution, solution history, step size and
/// order bookkeeping.
pub struct Bdf {
    opts: BdfOptions,
    krylov: Spgmr,
    t: f64,
    y: Vec<f64>,
    /// `rhs(t, y)`, kept in sync with the current point.
    f: Vec<f64>,
    /// Root function values at the current point.
    g: Vec<f64>,
    /// Accepted points, most recent first; `hist_y[0]` is `y`.
    hist_t: VecDeque<f64>,
    hist_y: VecDeque<Vec<f64>>,
    h: f64,
    order: usize,
    successes: usize,
    failures: usize,
}

impl Bdf {
    /// An empty integrator; call [`reinit`](Bdf::reinit) before integrating.
    pub fn new(opts: BdfOptions) -> Self {
        Bdf {
            opts,
            krylov: Spgmr::new(),
            t: 0.0,
            y: Vec::new(),
            f: Vec::new(),
            g: Vec::new(),
            hist_t: VecDeque::new(),
            hist_y: VecDeque::new(),
            h: 0.0,
            order: 1,
            successes: 0,
            failures: 0,
        }
    }

    /// Discards all history and restarts from `(t, y)` at order 1.
    pub fn reinit<S: OdeSystem>(&mut self, sys: &mut S, t: f64, y: &[f64]) {
        let n = sys.dim();
        self.t = t;
        self.y = y.to_vec();
        self.f = vec![0.0; n];
        sys.rhs(t, y, &mut self.f);
        self.g = vec![0.0; sys.num_roots()];
        sys.roots(t, y, &mut self.g);
        self.hist_t.clear();
        self.hist_y.clear();
        self.hist_t.push_front(t);
        self.hist_y.push_front(self.y.clone());
        self.h = 0.0;
        self.order = 1;
        self.successes = 0;
        self.failures = 0;
    }

    /// Current time.
    pub fn time(&self) -> f64 {
        self.t
    }

    /// Current solution.
    pub fn state(&self) -> &[f64] {
        &self.y
    }

    /// Overwrites one component of the solution without restarting; the
    /// caller must `reinit` before the next `integrate`.
    pub fn state_mut(&mut self) -> &mut [f64] {
        &mut self.y
    }

    /// Snapshot for later [`restore`](Bdf::restore).
    pub fn save(&self) -> BdfCheckpoint {
        BdfCheckpoint {
            t: self.t,
            y: self.y.clone(),
            f: self.f.clone(),
            g: self.g.clone(),
            hist_t: self.hist_t.clone(),
            hist_y: self.hist_y.clone(),
            h: self.h,
            order: self.order,
        }
    }

    /// Rewinds to a snapshot taken by [`save`](Bdf::save).
    pub fn restore(&mut self, saved: &BdfCheckpoint) {
        self.t = saved.t;
        self.y = saved.y.clone();
        self.f = saved.f.clone();
        self.g = saved.g.clone();
        self.hist_t = saved.hist_t.clone();
        self.hist_y = saved.hist_y.clone();
        self.h = saved.h;
        self.order = saved.order;
        self.successes = 0;
        self.failures = 0;
    }

    /// Advances the solution to `t_out`, taking as many internal steps as
    /// needed, or stops early at the first root crossing.
    pub fn integrate<S: OdeSystem>(
        &mut self,
        sys: &mut S,
        t_out: f64,
    ) -> Result<StepOutcome, BdfError> {
        let mut steps = 0;
        loop {
            let remaining = t_out - self.t;
            if remaining <= 1e-13 * t_out.abs().max(1.0) {
                self.t = t_out;
                return Ok(StepOutcome::Reached);
            }
            steps += 1;
            if steps > MAX_INTERNAL_STEPS {
                return Err(BdfError::TooMuchWork(MAX_INTERNAL_STEPS));
            }

            if self.h <= 0.0 {
                self.h = self.initial_step(remaining);
            }
            let mut h = self.h.min(remaining);
            if self.opts.max_step > 0.0 {
                h = h.min(self.opts.max_step);
            }
            let clamped = h < self.h;

            let k = self.order.min(self.hist_t.len());
            match self.attempt_step(sys, h, k) {
                Err(()) => {
                    // Corrector stall: shrink hard and retry.
                    self.failures += 1;
                    self.h = h * 0.25;
                    self.order = 1;
                    if self.h < step_floor(self.t) {
                        return Err(BdfError::StepTooSmall { h: self.h, t: self.t });
                    }
                }
                Ok((est, _, _)) if est > 1.0 => {
                    // Local error too large: reject and rescale.
                    self.failures += 1;
                    let factor = (0.9 * est.max(1e-10).powf(-1.0 / (k as f64 + 1.0)))
                        .clamp(0.1, 0.9);
                    self.h = h * factor;
                    if self.failures >= 3 {
                        self.order = (self.order - 1).max(1);
                    }
                    if self.h < step_floor(self.t) {
                        return Err(BdfError::StepTooSmall { h: self.h, t: self.t });
                    }
                    debug!("rejected BDF step at t = {}, est = {est:.3}", self.t);
                }
                Ok((est, y_new, f_new)) => {
                    let t_new = self.t + h;

                    // Root scan over the step just taken.
                    if let Some((t_root, y_root, roots)) =
                        self.locate_roots(sys, t_new, &y_new, &f_new)
                    {
                        self.t = t_root;
                        self.y = y_root;
                        self.f = vec![0.0; sys.dim()];
                        sys.rhs(t_root, &self.y, &mut self.f);
                        sys.roots(t_root, &self.y, &mut self.g);
                        self.hist_t.clear();
                        self.hist_y.clear();
                        self.hist_t.push_front(t_root);
                        self.hist_y.push_front(self.y.clone());
                        self.order = 1;
                        self.successes = 0;
                        return Ok(StepOutcome::RootFound(roots));
                    }

                    self.t = t_new;
                    self.y = y_new;
                    self.f = f_new;
                    self.hist_t.push_front(t_new);
                    self.hist_y.push_front(self.y.clone());
                    while self.hist_t.len() > MAX_ORDER + 2 {
                        self.hist_t.pop_back();
                        self.hist_y.pop_back();
                    }

                    self.successes += 1;
                    self.failures = 0;
                    if self.order < MAX_ORDER
                        && self.hist_t.len() > self.order + 1
                        && self.successes >= self.order + 2
                    {
                        self.order += 1;
                        self.successes = 0;
                    }
                    // A step clamped to the query point says nothing about
                    // the step size the error control wants; keep it.
                    if !clamped {
                        let factor = (0.9 * est.max(1e-10).powf(-1.0 / (k as f64 + 1.0)))
                            .clamp(0.2, 2.5);
                        self.h = h * factor;
                    }
                }
            }
        }
    }

    /// One BDF step of order `k` from `self.t` with size `h`. Returns the
    /// weighted error estimate, the new solution and its derivative, or
    /// `Err(())` if the Newton corrector stalled.
    fn attempt_step<S: OdeSystem>(
        &mut self,
        sys: &mut S,
        h: f64,
        k: usize,
    ) -> Result<(f64, Vec<f64>, Vec<f64>), ()> {
        let n = sys.dim();
        let t_new = self.t + h;
        let weights = self.error_weights();

        // Derivative coefficients of the interpolating polynomial through
        // (t_new, past k nodes), evaluated at t_new: the BDF relation is
        // sum_j c_j * y_j = f(t_new, y_new).
        let mut nodes = Vec::with_capacity(k + 1);
        nodes.push(t_new);
        nodes.extend(self.hist_t.iter().take(k));
        let coeff = lagrange_derivative_at_first(&nodes);
        let c0 = coeff[0];

        // Known part of the relation.
        let mut rhs_known = vec![0.0; n];
        for (j, c) in coeff.iter().enumerate().skip(1) {
            for (r, y) in rhs_known.iter_mut().zip(&self.hist_y[j - 1]) {
                *r += c * y;
            }
        }

        // Predictor: extrapolate the history polynomial to t_new. With a
        // single history point fall back to an Euler predictor so the
        // predictor-corrector difference still estimates the local error.
        let points = (k + 1).min(self.hist_t.len());
        let y_pred = if points < 2 {
            self.y.iter().zip(&self.f).map(|(&y, &f)| y + h * f).collect()
        } else {
            lagrange_extrapolate(&self.hist_t, &self.hist_y, points, t_new)
        };

        let mut y = y_pred.clone();
        let mut f = vec![0.0; n];
        let mut converged = false;

        for _iter in 0..MAX_NEWTON_ITERS {
            sys.rhs(t_new, &y, &mut f);

            // G(y) = c0 y + rhs_known - f(t_new, y)
            let residual: Vec<f64> = (0..n)
                .map(|i| c0 * y[i] + rhs_known[i] - f[i])
                .collect();

            // Solve (c0 I - J) delta = -G matrix-free; J v by forward
            // differences around the current iterate.
            let y_norm = norm2(&y);
            let mut delta = vec![0.0; n];
            let neg_residual: Vec<f64> = residual.iter().map(|&r| -r).collect();
            let lin_tol = 1e-3 * norm2(&neg_residual);
            {
                let mut scratch = vec![0.0; n];
                let mut y_perturbed = vec![0.0; n];
                self.krylov.solve(
                    |v, out| {
                        let v_norm = norm2(v);
                        let sigma = f64::EPSILON.sqrt() * (1.0 + y_norm) / v_norm.max(1e-300);
                        for i in 0..n {
                            y_perturbed[i] = y[i] + sigma * v[i];
                        }
                        sys.rhs(t_new, &y_perturbed, &mut scratch);
                        for i in 0..n {
                            out[i] = c0 * v[i] - (scratch[i] - f[i]) / sigma;
                        }
                    },
                    &neg_residual,
                    &mut delta,
                    lin_tol,
                );
            }

            for (yi, d) in y.iter_mut().zip(&delta) {
                *yi += d;
            }

            if wrms(&delta, &weights) < 0.33 {
                converged = true;
                break;
            }
        }

        if !converged {
            return Err(());
        }

        sys.rhs(t_new, &y, &mut f);
        let diff: Vec<f64> = y.iter().zip(&y_pred).map(|(a, b)| a - b).collect();
        let est = wrms(&diff, &weights) / (k as f64 + 1.0);
        Ok((est, y, f))
    }

    /// Scans for sign changes of the root functions over the step ending at
    /// `(t_new, y_new)` and bisects the earliest crossing on the cubic
    /// Hermite interpolant.
    fn locate_roots<S: OdeSystem>(
        &mut self,
        sys: &mut S,
        t_new: f64,
        y_new: &[f64],
        f_new: &[f64],
    ) -> Option<(f64, Vec<f64>, Vec<usize>)> {
        let ng = sys.num_roots();
        if ng == 0 {
            return None;
        }
        let mut g_new = vec![0.0; ng];
        sys.roots(t_new, y_new, &mut g_new);

        let crossing: Vec<usize> = (0..ng)
            .filter(|&i| {
                let (a, b) = (self.g[i], g_new[i]);
                a * b < 0.0 || (a != 0.0 && b == 0.0)
            })
            .collect();
        if crossing.is_empty() {
            self.g = g_new;
            return None;
        }

        let mut g_mid = vec![0.0; ng];
        let mut times = Vec::with_capacity(crossing.len());
        for &i in &crossing {
            let mut lo = self.t;
            let mut hi = t_new;
            let mut sign_lo = self.g[i];
            for _ in 0..60 {
                let mid = 0.5 * (lo + hi);
                let y_mid = hermite(self.t, &self.y, &self.f, t_new, y_new, f_new, mid);
                sys.roots(mid, &y_mid, &mut g_mid);
                if sign_lo * g_mid[i] < 0.0 {
                    hi = mid;
                } else {
                    lo = mid;
                    sign_lo = g_mid[i];
                }
                if hi - lo <= 1e-12 * t_new.abs().max(1.0) {
                    break;
                }
            }
            times.push((i, hi));
        }

        let earliest = times
            .iter()
            .map(|&(_, t)| t)
            .fold(f64::INFINITY, f64::min);
        let window = 1e-9 * (t_new - self.t);
        let roots: Vec<usize> = times
            .iter()
            .filter(|&&(_, t)| t <= earliest + window)
            .map(|&(i, _)| i)
            .collect();

        let y_root = hermite(self.t, &self.y, &self.f, t_new, y_new, f_new, earliest);
        Some((earliest, y_root, roots))
    }

    fn error_weights(&self) -> Vec<f64> {
        self.y
            .iter()
            .map(|&yi| 1.0 / (self.opts.rel_tol * yi.abs() + self.opts.abs_tol))
            .collect()
    }

    /// First step guess: small enough that an Euler step stays well inside
    /// the error tolerance.
    fn initial_step(&self, remaining: f64) -> f64 {
        let weights = self.error_weights();
        let d = wrms(&self.f, &weights);
        let mut h0 = if d > 1e-30 { 0.01 / d } else { 1e-6 * remaining.max(1.0) };
        h0 = h0.min(remaining);
        if self.opts.max_step > 0.0 {
            h0 = h0.min(self.opts.max_step);
        }
        h0.max(f64::MIN_POSITIVE)
    }
}

fn step_floor(t: f64) -> f64 {
    1e-13 * t.abs().max(1.0)
}

/// Derivative of the Lagrange basis polynomials at the first node.
/// `nodes[0]` is the evaluation point; returns one coefficient per node.
fn lagrange_derivative_at_first(nodes: &[f64]) -> Vec<f64> {
    let x0 = nodes[0];
    let k = nodes.len();
    let mut coeff = vec![0.0; k];

    // c_0 = sum_m 1/(x0 - x_m)
    coeff[0] = nodes[1..].iter().map(|&xm| 1.0 / (x0 - xm)).sum();

    // c_j = prod_{m != j, m != 0} (x0 - x_m) / prod_{m != j} (x_j - x_m)
    for j in 1..k {
        let xj = nodes[j];
        let mut numer = 1.0;
        let mut denom = xj - x0;
        for (m, &xm) in nodes.iter().enumerate() {
            if m == j || m == 0 {
                continue;
            }
            numer *= x0 - xm;
            denom *= xj - xm;
        }
        coeff[j] = numer / denom;
    }
    coeff
}

/// Evaluates the interpolating polynomial through the first `points` history
/// entries at `t`.
fn lagrange_extrapolate(
    hist_t: &VecDeque<f64>,
    hist_y: &VecDeque<Vec<f64>>,
    points: usize,
    t: f64,
) -> Vec<f64> {
    let n = hist_y[0].len();
    let mut result = vec![0.0; n];
    for j in 0..points {
        let mut weight = 1.0;
        for m in 0..points {
            if m != j {
                weight *= (t - hist_t[m]) / (hist_t[j] - hist_t[m]);
            }
        }
        for (r, y) in result.iter_mut().zip(&hist_y[j]) {
            *r += weight * y;
        }
    }
    result
}

/// Cubic Hermite interpolation between two solution points.
fn hermite(t0: f64, y0: &[f64], f0: &[f64], t1: f64, y1: &[f64], f1: &[f64], t: f64) -> Vec<f64> {
    let h = t1 - t0;
    let s = (t - t0) / h;
    let h00 = (1.0 + 2.0 * s) * (1.0 - s) * (1.0 - s);
    let h10 = s * (1.0 - s) * (1.0 - s);
    let h01 = s * s * (3.0 - 2.0 * s);
    let h11 = s * s * (s - 1.0);
    (0..y0.len())
        .map(|i| h00 * y0[i] + h10 * h * f0[i] + h01 * y1[i] + h11 * h * f1[i])
        .collect()
}

fn norm2(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

/// Weighted root-mean-square norm used for all error control.
fn wrms(v: &[f64], weights: &[f64]) -> f64 {
    let sum: f64 = v
        .iter()
        .zip(weights)
        .map(|(&vi, &wi)| (vi * wi) * (vi * wi))
        .sum();
    (sum / v.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Decay;
    impl OdeSystem for Decay {
        fn dim(&self) -> usize {
            1
        }
        fn rhs(&mut self, _t: f64, y: &[f64], dydt: &mut [f64]) {
            dydt[0] = -0.2 * y[0];
        }
    }

    #[test]
    fn integrates_exponential_decay_accurately() {
        let mut sys = Decay;
        let mut bdf = Bdf::new(BdfOptions {
            rel_tol: 1e-9,
            abs_tol: 1e-12,
            max_step: 0.0,
        });
        bdf.reinit(&mut sys, 0.0, &[100.0]);
        let outcome = bdf.integrate(&mut sys, 20.0).unwrap();
        assert_eq!(outcome, StepOutcome::Reached);
        let exact = 100.0 * (-0.2f64 * 20.0).exp();
        assert!(
            (bdf.state()[0] - exact).abs() < 1e-4,
            "got {}, want {exact}",
            bdf.state()[0]
        );
    }

    struct Stiff;
    impl OdeSystem for Stiff {
        fn dim(&self) -> usize {
            2
        }
        fn rhs(&mut self, _t: f64, y: &[f64], dydt: &mut [f64]) {
            // Classic stiff pair: fast relaxation onto a slow manifold.
            dydt[0] = -1000.0 * (y[0] - y[1]);
            dydt[1] = -y[1];
        }
    }

    #[test]
    fn handles_a_stiff_system() {
        let mut sys = Stiff;
        let mut bdf = Bdf::new(BdfOptions {
            rel_tol: 1e-6,
            abs_tol: 1e-9,
            max_step: 0.0,
        });
        bdf.reinit(&mut sys, 0.0, &[1.0, 1.0]);
        bdf.integrate(&mut sys, 5.0).unwrap();
        let exact = (-5.0f64).exp();
        assert!((bdf.state()[1] - exact).abs() < 1e-4);
        // On the slow manifold the two components agree.
        assert!((bdf.state()[0] - bdf.state()[1]).abs() < 1e-3);
    }

    struct Ramp;
    impl OdeSystem for Ramp {
        fn dim(&self) -> usize {
            1
        }
        fn rhs(&mut self, _t: f64, _y: &[f64], dydt: &mut [f64]) {
            dydt[0] = 1.0;
        }
        fn num_roots(&self) -> usize {
            1
        }
        fn roots(&mut self, _t: f64, y: &[f64], out: &mut [f64]) {
            out[0] = y[0] - 5.0;
        }
    }

    #[test]
    fn stops_at_a_root_crossing() {
        let mut sys = Ramp;
        let mut bdf = Bdf::new(BdfOptions {
            rel_tol: 1e-9,
            abs_tol: 1e-12,
            max_step: 0.0,
        });
        bdf.reinit(&mut sys, 0.0, &[0.0]);
        match bdf.integrate(&mut sys, 100.0).unwrap() {
            StepOutcome::RootFound(roots) => {
                assert_eq!(roots, vec![0]);
                assert!((bdf.time() - 5.0).abs() < 1e-6, "root at {}", bdf.time());
            }
            other => panic!("expected a root, got {other:?}"),
        }
    }

    #[test]
    fn checkpoint_round_trips() {
        let mut sys = Decay;
        let mut bdf = Bdf::new(BdfOptions {
            rel_tol: 1e-9,
            abs_tol: 1e-12,
            max_step: 0.0,
        });
        bdf.reinit(&mut sys, 0.0, &[100.0]);
        bdf.integrate(&mut sys, 1.0).unwrap();
        let saved = bdf.save();
        let y_at_save = bdf.state()[0];
        bdf.integrate(&mut sys, 2.0).unwrap();
        bdf.restore(&saved);
        assert_eq!(bdf.time(), 1.0);
        assert_eq!(bdf.state()[0], y_at_save);
    }
}
