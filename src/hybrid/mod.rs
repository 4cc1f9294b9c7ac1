//! The tau-hybrid solver: species and reactions are partitioned into
//! continuous and discrete regimes each step. Continuous reactions flow
//! through the integrator's concentrations; each discrete reaction carries
//! an accumulated clock `R_r` initialized to `ln(u)` and integrated by
//! `dR_r/dt = a_r(y)`, firing when the clock reaches zero. Event triggers
//! and clocks form the integrator's root surface; a step that would drive a
//! population negative is retried as a single SSA firing.

use std::io::Write;
use std::sync::atomic::Ordering;

use log::{debug, error};

use crate::model::{Mode, Model, Parameters};
use crate::ode::{Bdf, BdfError, BdfOptions, OdeSystem, StepOutcome};
use crate::output::OutputBuffer;
use crate::rng::Urn;
use crate::tau;
use crate::{checked_propensity, Error, Simulation, Status};

pub use diffeq::{assemble, DiffEquation};
pub use events::EventList;
pub use partition::{
    flag_reactions, init_species_state, round_discrete, Partitioner, SpeciesState,
};

/// Differential-equation assembly.
pub mod diffeq;
/// Trigger/delay/priority event machinery.
pub mod events;
/// Continuous/discrete classification.
pub mod partition;

/// Tolerance below which a drifting concentration counts as negative.
const NEGATIVE_TOL: f64 = -1e-9;

/// The coupled concentration/clock system handed to the integrator. The
/// driver mutates modes and formula sets between steps; the integrator only
/// sees `(t, y)`.
struct HybridSystem<'m> {
    model: &'m Model,
    /// Trajectory-local parameter snapshot; event assignments may write the
    /// variable half.
    params: Parameters,
    /// Per-reaction regime, maintained by the partitioner.
    modes: Vec<Mode>,
    /// Per-species formula sets over the continuous reactions.
    diffeq: Vec<DiffEquation>,
    /// Number of event triggers in the root surface (0 when disarmed).
    event_roots: usize,
    /// Discrete reactions whose clocks are in the root surface.
    clock_roots: Vec<usize>,
    /// Scratch rate values, refreshed by every `rhs` call.
    rates: Vec<f64>,
    /// First non-finite rate seen during integration.
    bad_rate: Option<(usize, f64, f64)>,
}

impl<'m> HybridSystem<'m> {
    fn new(model: &'m Model, params: Parameters) -> Self {
        let modes = vec![Mode::Discrete; model.number_reactions()];
        let diffeq = assemble(model, &modes);
        HybridSystem {
            model,
            params,
            modes,
            diffeq,
            event_roots: 0,
            clock_roots: Vec::new(),
            rates: vec![0.0; model.number_reactions()],
            bad_rate: None,
        }
    }

    /// Arms or disarms the root surface: one root per event trigger, one per
    /// discrete reaction clock. The integrator must be reinitialized
    /// afterwards.
    fn configure_roots(&mut self, enable: bool) {
        if enable {
            self.event_roots = self.model.events.len();
            self.clock_roots = self
                .modes
                .iter()
                .enumerate()
                .filter(|&(_, &m)| m == Mode::Discrete)
                .map(|(r, _)| r)
                .collect();
        } else {
            self.event_roots = 0;
            self.clock_roots.clear();
        }
    }

    fn has_event_roots(&self) -> bool {
        self.event_roots > 0
    }
}

impl OdeSystem for HybridSystem<'_> {
    fn dim(&self) -> usize {
        self.model.number_species() + self.model.number_reactions()
    }

    fn rhs(&mut self, t: f64, y: &[f64], dydt: &mut [f64]) {
        let ns = self.model.number_species();
        let conc = &y[..ns];

        for (r, rxn) in self.model.reactions.iter().enumerate() {
            let rate = match self.modes[r] {
                Mode::Continuous => rxn.ode_propensity(t, conc, &self.params),
                _ => rxn.propensity(t, conc, &self.params),
            };
            if !rate.is_finite() && self.bad_rate.is_none() {
                self.bad_rate = Some((r, rate, t));
            }
            self.rates[r] = rate;
        }

        for (s, spec) in self.model.species.iter().enumerate() {
            dydt[s] = if spec.boundary_condition {
                0.0
            } else {
                let mut dy = self.diffeq[s].evaluate(&self.rates);
                if let Some(rule) = self.model.rate_rules[s] {
                    dy += rule(t, conc, &self.params.variables, &self.params.constants);
                }
                dy
            };
        }

        for (r, &mode) in self.modes.iter().enumerate() {
            dydt[ns + r] = if mode == Mode::Discrete {
                self.rates[r]
            } else {
                0.0
            };
        }
    }

    fn num_roots(&self) -> usize {
        self.event_roots + self.clock_roots.len()
    }

    fn roots(&mut self, t: f64, y: &[f64], out: &mut [f64]) {
        let ns = self.model.number_species();
        let conc = &y[..ns];
        for e in 0..self.event_roots {
            out[e] = if self.model.events[e].trigger(t, conc, &self.params) {
                1.0
            } else {
                -1.0
            };
        }
        for (i, &r) in self.clock_roots.iter().enumerate() {
            out[self.event_roots + i] = y[ns + r];
        }
    }
}

/// Runs every configured trajectory with the hybrid solver.
pub fn solve<W: Write>(sim: &mut Simulation, out: &mut OutputBuffer<W>) -> Result<(), Error> {
    let ns = sim.model.number_species();
    let nr = sim.model.number_reactions();
    let end_time = sim.config.end_time;
    let tau_tol = sim.config.tau_tol;
    let last = out.number_timesteps() - 1;
    let interrupt = sim.interrupt_flag();
    let tau_args = tau::initialize(&sim.model);
    let opts = BdfOptions {
        rel_tol: sim.config.rel_tol,
        abs_tol: sim.config.abs_tol,
        max_step: sim.config.max_step,
    };

    let mut propensities = vec![0.0; nr];
    let mut partitioner = Partitioner::new(ns);
    let mut worst = Status::Ok;

    'trajectories: for _trajectory in 0..sim.config.number_trajectories {
        if interrupt.load(Ordering::Relaxed) {
            break;
        }
        out.reset();
        partitioner.reset();

        let mut sys = HybridSystem::new(&sim.model, sim.params.clone());
        let mut species_state = init_species_state(&sim.model);
        let mut event_list = EventList::new(&sim.model);
        let mut bdf = Bdf::new(opts);

        let mut state: Vec<f64> = sim
            .model
            .species
            .iter()
            .map(|s| s.initial_population)
            .collect();
        let mut y = vec![0.0; ns + nr];
        for r in 0..nr {
            y[ns + r] = sim.urn.ln_uniform();
        }

        // Events whose trigger already differs from its initial value fire
        // at t = 0.
        if event_list.evaluate_triggers(&sim.model, &sys.params, &state, 0.0) {
            event_list.evaluate(&sim.model, &mut sys.params, &mut state, 0.0);
        }
        y[..ns].copy_from_slice(&state);
        out.write_current(&state)?;

        let mut t = 0.0;
        let mut status = Status::Ok;
        let mut changes = vec![0i64; ns];

        while t < end_time {
            if interrupt.load(Ordering::Relaxed) {
                break;
            }

            for r in 0..nr {
                propensities[r] = checked_propensity(&sim.model, r, t, &state, &sys.params)?;
            }

            let save_time = sim.timeline[out.next_unwritten().min(last)];
            let tau_step = tau::select(
                &sim.model,
                &tau_args,
                tau_tol,
                t,
                save_time,
                &propensities,
                &state,
            );

            partitioner.partition(&sim.model, &mut species_state, &propensities, &state);
            if flag_reactions(&sim.model, &species_state, &mut sys.modes) {
                sys.diffeq = assemble(&sim.model, &sys.modes);
            }
            round_discrete(&species_state, &mut state);

            y[..ns].copy_from_slice(&state);
            sys.configure_roots(sim.config.use_root_finding || event_list.has_active_events());
            bdf.reinit(&mut sys, t, &y);
            let checkpoint = bdf.save();
            let saved_state = state.clone();
            let saved_clocks: Vec<f64> = y[ns..].to_vec();

            let next_time = t + tau_step;
            let step = take_step(&mut bdf, &mut sys, &mut sim.urn, next_time, &mut changes, None);

            let valid = match step {
                Ok(()) => !negative_state(&species_state, bdf.state(), &changes),
                Err(ref e) => {
                    debug!("hybrid integration step failed at t = {t}: {e}");
                    false
                }
            };

            if !valid {
                // Too aggressive a tau: rewind and advance by a single SSA
                // firing, at the time the saved clocks predict.
                sim.steps_rejected += 1;
                bdf.restore(&checkpoint);
                state.copy_from_slice(&saved_state);

                let mut fallback: Option<(usize, f64)> = None;
                for (r, &mode) in sys.modes.iter().enumerate() {
                    if mode == Mode::Discrete && propensities[r] > 0.0 {
                        let est_tau = -saved_clocks[r] / propensities[r];
                        if est_tau > 0.0 && fallback.map_or(true, |(_, best)| est_tau < best) {
                            fallback = Some((r, est_tau));
                        }
                    }
                }

                match fallback {
                    None => {
                        status = Status::NegativeStateNoSsaReaction;
                    }
                    Some((rxn, est_tau)) => {
                        let retry = take_step(
                            &mut bdf,
                            &mut sys,
                            &mut sim.urn,
                            t + est_tau,
                            &mut changes,
                            Some(rxn),
                        );
                        match retry {
                            Ok(())
                                if !negative_state(&species_state, bdf.state(), &changes) => {}
                            _ => status = Status::LoopOverIntegrate,
                        }
                    }
                }
            }

            if status != Status::Ok {
                error!(
                    "trajectory abandoned at t = {t}: problem space too stiff \
                     (status {:?})",
                    status
                );
                break;
            }
            if let Some((r, rate, bad_t)) = sys.bad_rate {
                return Err(Error::Propensity {
                    name: sim.model.reactions[r].name.clone(),
                    value: rate,
                    time: bad_t,
                });
            }

            // Commit: population changes land on non-boundary species, the
            // integrated concentrations are copied back, and discrete
            // species snap back to whole populations.
            for (s, spec) in species_state.iter().enumerate() {
                if !spec.boundary {
                    state[s] = bdf.state()[s] + changes[s] as f64;
                }
            }
            round_discrete(&species_state, &mut state);
            y.copy_from_slice(bdf.state());
            y[..ns].copy_from_slice(&state);
            t = bdf.time();

            // Trigger edges that slipped through without the root-finder
            // armed: rewind and redo the step with roots on.
            if !event_list.has_active_events()
                && event_list.evaluate_triggers(&sim.model, &sys.params, &state, t)
                && !sys.has_event_roots()
            {
                bdf.restore(&checkpoint);
                state.copy_from_slice(&saved_state);
                y[..ns].copy_from_slice(&saved_state);
                y[ns..].copy_from_slice(&saved_clocks);
                t = bdf.time();
                continue;
            }
            if event_list.has_active_events() {
                event_list.evaluate(&sim.model, &mut sys.params, &mut state, t);
                y[..ns].copy_from_slice(&state);
            }

            // Emit every grid point this step crossed.
            let timeline = out.timeline();
            let mut next = out.next_unwritten();
            while next <= last && timeline[next] <= t {
                next += 1;
            }
            if next > out.next_unwritten() {
                out.write_range(next - 1, &state)?;
            }
        }

        if interrupt.load(Ordering::Relaxed) {
            out.write_final(Status::Ok.code())?;
            worst = worst.max(status);
            break 'trajectories;
        }
        if status == Status::Ok {
            out.write_range(last, &state)?;
        }
        out.write_final(status.code())?;
        worst = worst.max(status);
    }

    sim.record_status(worst);
    Ok(())
}

/// One integration attempt to `next_time`. Clock crossings (from roots or
/// from the post-step scan) are converted into firing counts by resampling
/// `R += ln(u)` until the clock is negative again; the resulting population
/// changes are tallied into `changes` without touching the committed state.
fn take_step(
    bdf: &mut Bdf,
    sys: &mut HybridSystem,
    urn: &mut Urn,
    next_time: f64,
    changes: &mut [i64],
    only_fire: Option<usize>,
) -> Result<(), BdfError> {
    let ns = sys.model.number_species();
    changes.fill(0);

    let outcome = bdf.integrate(sys, next_time)?;

    let mut clock_hits: Vec<usize> = Vec::new();
    if let StepOutcome::RootFound(roots) = outcome {
        for idx in roots {
            if idx >= sys.event_roots {
                clock_hits.push(sys.clock_roots[idx - sys.event_roots]);
            }
        }
    }

    if !clock_hits.is_empty() {
        for r in clock_hits {
            let count = count_firings(bdf, urn, ns, r);
            tally(sys.model, r, count, changes);
        }
    } else {
        for r in 0..sys.modes.len() {
            if sys.modes[r] != Mode::Discrete {
                continue;
            }
            if only_fire == Some(r) {
                bdf.state_mut()[ns + r] = urn.ln_uniform();
                tally(sys.model, r, 1, changes);
            } else if bdf.state()[ns + r] >= 0.0 {
                let count = count_firings(bdf, urn, ns, r);
                tally(sys.model, r, count, changes);
            }
        }
    }

    Ok(())
}

/// A clock at or past zero has fired at least once; each resample that
/// leaves it non-negative is another firing.
fn count_firings(bdf: &mut Bdf, urn: &mut Urn, ns: usize, rxn: usize) -> i64 {
    let clock = &mut bdf.state_mut()[ns + rxn];
    let mut count = 0;
    loop {
        *clock += urn.ln_uniform();
        count += 1;
        if *clock < 0.0 {
            break;
        }
    }
    count
}

fn tally(model: &Model, rxn: usize, count: i64, changes: &mut [i64]) {
    for (c, &delta) in changes.iter_mut().zip(&model.reactions[rxn].species_change) {
        *c += delta * count;
    }
}

/// Boundary species never restrict step acceptance.
fn negative_state(species: &[SpeciesState], y: &[f64], changes: &[i64]) -> bool {
    species
        .iter()
        .enumerate()
        .any(|(s, spec)| !spec.boundary && y[s] + (changes[s] as f64) < NEGATIVE_TOL)
}
