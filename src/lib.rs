//! # kinet
//! A library for simulating chemical reaction networks: exact (SSA),
//! approximate (tau-leaping), deterministic (stiff ODE), and hybrid
//! stochastic-deterministic.
//!
//! A [`Model`] describes species, reactions, parameters, rate rules and
//! events; a [`Simulation`] owns the per-run state (RNG, parameter snapshot,
//! output grid) and drives one of the four solvers, streaming fixed-grid
//! trajectory rows into any [`std::io::Write`] sink.

#![warn(missing_docs)]

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

pub use model::{
    AssignmentTarget, Event, EventAssignment, Mode, Model, ParamRef, Parameters, RateFn, RateLaw,
    Reaction, Species, State, TriggerFn,
};
pub use rng::Urn;

/// The hybrid stochastic-deterministic solver.
pub mod hybrid;
/// The tau-leaping solver.
pub mod leap;
/// Model, reaction and parameter records.
pub mod model;
/// The stiff ODE solver (BDF with a matrix-free Krylov linear solve).
pub mod ode;
/// Fixed-grid trajectory serialization.
pub mod output;
/// Parsing mass-action models from strings.
pub mod parse;
/// Some models to play with.
pub mod presets;
/// Seeded random draws.
pub mod rng;
/// The direct-method SSA solver.
pub mod ssa;
/// Adaptive leap-size selection.
pub mod tau;

/// Unrecoverable simulation failures. Recoverable conditions (step
/// rejection, interrupts, trajectory-level integration giveups) are statuses,
/// not errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Rejected driver configuration; surfaced before any output is written.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A propensity callable returned NaN or a negative value.
    #[error("propensity of {name} evaluated to {value} at t = {time}")]
    Propensity {
        /// Reaction name.
        name: String,
        /// Offending value.
        value: f64,
        /// Simulation time of the evaluation.
        time: f64,
    },
    /// Tau-leaping halved its step too many times without acceptance.
    #[error("tau-leaping rejected {0} consecutive steps")]
    RetryGuard(u32),
    /// The integrator failed outside the hybrid solver's recovery path.
    #[error("integration failed: {0}")]
    Integration(String),
    /// The output sink failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Per-trajectory (and per-run) result code, written as the trailing token of
/// every trajectory's output stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Status {
    /// Trajectory ran to completion.
    Ok,
    /// Interrupted cooperatively; emitted rows remain valid.
    Paused,
    /// Hybrid integration could not produce a valid state within the retry
    /// guard.
    LoopOverIntegrate,
    /// The integrator reported an unrecoverable failure.
    IntegratorFailed,
    /// The single-reaction SSA fallback still left the state invalid.
    InvalidAfterSsa,
    /// No stochastic reaction was available for the SSA fallback.
    NegativeStateNoSsaReaction,
}

impl Status {
    /// Numeric code written to the output stream and suitable as a process
    /// exit code.
    pub fn code(self) -> u8 {
        match self {
            Status::Ok => 0,
            Status::Paused => 33,
            Status::LoopOverIntegrate => 2,
            Status::IntegratorFailed => 3,
            Status::InvalidAfterSsa => 4,
            Status::NegativeStateNoSsaReaction => 5,
        }
    }
}

/// Which solver the driver runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolverKind {
    /// Exact discrete-event simulation (direct method).
    Ssa,
    /// Adaptive-step Poisson approximation.
    TauLeaping,
    /// Deterministic reaction-rate equations.
    Ode,
    /// Dynamic continuous/discrete partitioning.
    TauHybrid,
}

/// Driver configuration, typically populated from a CLI or host program.
#[derive(Clone, Debug)]
pub struct Config {
    /// RNG seed; `-1` samples one from the clock and process id.
    pub seed: i64,
    /// Number of output grid points (including `t = 0`).
    pub number_timesteps: usize,
    /// Trajectories to run in sequence.
    pub number_trajectories: usize,
    /// Simulated time span.
    pub end_time: f64,
    /// Grid spacing; derived from `end_time` when not positive.
    pub increment: f64,
    /// Tau-selection error tolerance.
    pub tau_tol: f64,
    /// Integrator relative tolerance.
    pub rel_tol: f64,
    /// Integrator absolute tolerance.
    pub abs_tol: f64,
    /// Integrator maximum internal step; `0` means unlimited.
    pub max_step: f64,
    /// Hybrid partition tolerance; overrides every species' own when
    /// positive.
    pub switch_tol: f64,
    /// Flush cadence in rows; clamped into `(0, number_timesteps]`.
    pub output_interval: usize,
    /// Enable event/reaction root-finding from the start of every hybrid
    /// step instead of only while events are pending.
    pub use_root_finding: bool,
    /// Host hint; the core logs through `log` regardless.
    pub verbose: bool,
    /// One value per declared variable parameter; empty means no overrides.
    pub variable_overrides: Vec<f64>,
    /// One value per declared species; empty means no overrides.
    pub initial_population_overrides: Vec<f64>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            seed: -1,
            number_timesteps: 0,
            number_trajectories: 1,
            end_time: 0.0,
            increment: 0.0,
            tau_tol: 0.03,
            rel_tol: 1e-9,
            abs_tol: 1e-12,
            max_step: 0.0,
            switch_tol: 0.0,
            output_interval: 1,
            use_root_finding: false,
            verbose: false,
            variable_overrides: Vec::new(),
            initial_population_overrides: Vec::new(),
        }
    }
}

impl Config {
    /// A configuration with the common knobs set and defaults elsewhere.
    pub fn new(end_time: f64, number_timesteps: usize, number_trajectories: usize) -> Self {
        Config {
            end_time,
            number_timesteps,
            number_trajectories,
            ..Config::default()
        }
    }

    /// Same configuration with a fixed seed.
    pub fn with_seed(mut self, seed: i64) -> Self {
        self.seed = seed;
        self
    }
}

/// Everything one run owns: the (override-applied) model, the parameter
/// snapshot, the RNG, the output grid and the cooperative interrupt flag.
/// Solver state machines borrow this mutably and nothing else observes it.
pub struct Simulation {
    /// The model with run-time overrides applied; read-only from here on.
    pub model: Model,
    /// Snapshot of the parameter arrays.
    pub params: Parameters,
    /// The validated configuration.
    pub config: Config,
    /// Output grid, `t_i = i * end_time / (number_timesteps - 1)`.
    pub timeline: Vec<f64>,
    /// The run's random number generator.
    pub urn: Urn,
    /// Tau-leaping/hybrid step rejections seen so far (diagnostic).
    pub steps_rejected: u64,
    interrupt: Arc<AtomicBool>,
    status: Status,
}

impl Simulation {
    /// Validates the configuration, applies overrides, resolves the seed and
    /// builds the output grid.
    pub fn new(mut model: Model, mut config: Config) -> Result<Simulation, Error> {
        if config.number_timesteps < 2 {
            return Err(Error::Config(format!(
                "need at least 2 timesteps, got {}",
                config.number_timesteps
            )));
        }
        if config.number_trajectories == 0 {
            return Err(Error::Config("need at least 1 trajectory".into()));
        }
        if config.end_time <= 0.0 {
            if config.increment > 0.0 {
                config.end_time = config.increment * (config.number_timesteps - 1) as f64;
            } else {
                return Err(Error::Config("end_time must be positive".into()));
            }
        }
        if config.increment <= 0.0 {
            config.increment = config.end_time / (config.number_timesteps - 1) as f64;
        }
        if !(config.rel_tol > 0.0) || !(config.abs_tol > 0.0) {
            return Err(Error::Config(format!(
                "tolerances must be positive: rel_tol = {}, abs_tol = {}",
                config.rel_tol, config.abs_tol
            )));
        }
        if !(config.tau_tol > 0.0) {
            return Err(Error::Config(format!(
                "tau_tol must be positive, got {}",
                config.tau_tol
            )));
        }
        if config.max_step < 0.0 {
            return Err(Error::Config(format!(
                "max_step must be non-negative, got {}",
                config.max_step
            )));
        }

        if !config.variable_overrides.is_empty() {
            if config.variable_overrides.len() != model.variables.len() {
                return Err(Error::Config(format!(
                    "{} variable overrides for {} variables",
                    config.variable_overrides.len(),
                    model.variables.len()
                )));
            }
            for (id, &value) in config.variable_overrides.iter().enumerate() {
                model.override_variable(id, value);
            }
        }
        if !config.initial_population_overrides.is_empty() {
            if config.initial_population_overrides.len() != model.species.len() {
                return Err(Error::Config(format!(
                    "{} population overrides for {} species",
                    config.initial_population_overrides.len(),
                    model.species.len()
                )));
            }
            for (spec, &pop) in model
                .species
                .iter_mut()
                .zip(&config.initial_population_overrides)
            {
                if pop < 0.0 {
                    return Err(Error::Config(format!(
                        "negative initial population {} for {}",
                        pop, spec.name
                    )));
                }
                spec.initial_population = pop;
            }
        }
        if config.switch_tol > 0.0 {
            for spec in &mut model.species {
                spec.switch_tol = config.switch_tol;
            }
        }
        let n = model.species.len();
        for rxn in &model.reactions {
            if rxn.species_change.len() != n
                || rxn.reactants_change.len() != n
                || rxn.products_change.len() != n
            {
                return Err(Error::Config(format!(
                    "reaction {} has change vectors of the wrong length",
                    rxn.name
                )));
            }
        }

        let seed = if config.seed == -1 {
            seed_from_clock()
        } else {
            config.seed as u64
        };

        let steps = config.number_timesteps;
        let timeline: Vec<f64> = (0..steps)
            .map(|i| i as f64 * config.end_time / (steps - 1) as f64)
            .collect();

        let params = model.load_parameters();
        Ok(Simulation {
            model,
            params,
            config,
            timeline,
            urn: Urn::new(seed),
            steps_rejected: 0,
            interrupt: Arc::new(AtomicBool::new(false)),
            status: Status::Ok,
        })
    }

    /// Flag checked at every solver iteration; set it from a signal handler
    /// to stop after the current trajectory flushes.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    pub(crate) fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed)
    }

    pub(crate) fn record_status(&mut self, status: Status) {
        self.status = self.status.max(status);
    }

    /// Worst per-trajectory status seen so far. The run as a whole succeeded
    /// iff this is [`Status::Ok`].
    pub fn status(&self) -> Status {
        self.status
    }

    /// Runs the chosen solver over all configured trajectories, streaming
    /// rows into `sink`, and returns the worst trajectory status.
    pub fn run<W: Write>(&mut self, kind: SolverKind, sink: W) -> Result<Status, Error> {
        let mut out =
            output::OutputBuffer::new(sink, self.timeline.clone(), self.config.output_interval);
        match kind {
            SolverKind::Ssa => ssa::solve(self, &mut out)?,
            SolverKind::TauLeaping => leap::solve(self, &mut out)?,
            SolverKind::Ode => ode::solve(self, &mut out)?,
            SolverKind::TauHybrid => hybrid::solve(self, &mut out)?,
        }
        if self.interrupted() {
            self.record_status(Status::Paused);
        }
        Ok(self.status())
    }
}

/// One-call driver: validate, simulate, stream, report.
pub fn run<W: Write>(
    model: &Model,
    kind: SolverKind,
    config: Config,
    sink: W,
) -> Result<Status, Error> {
    Simulation::new(model.clone(), config)?.run(kind, sink)
}

/// Seed for the `-1` sentinel: wall clock mixed with the process id.
fn seed_from_clock() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    nanos ^ (std::process::id() as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Evaluates a stochastic propensity and rejects NaN or negative results.
pub(crate) fn checked_propensity(
    model: &Model,
    rxn: usize,
    t: f64,
    state: &[f64],
    params: &Parameters,
) -> Result<f64, Error> {
    let value = model.reactions[rxn].propensity(t, state, params);
    if value.is_nan() || value < 0.0 {
        return Err(Error::Propensity {
            name: model.reactions[rxn].name.clone(),
            value,
            time: t,
        });
    }
    Ok(value)
}
