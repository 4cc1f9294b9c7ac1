//! Species and reaction regime classification for the hybrid solver.
//!
//! Dynamic species carry a rolling window of per-step coefficients of
//! variation; a smoothed CV below the switch tolerance (or a mean above
//! `switch_min`, when set) moves the species to the continuous regime. A
//! reaction is continuous only while every species it touches is.

use std::collections::VecDeque;

use crate::model::{Mode, Model};

/// Smoothing window length for the coefficient of variation.
const CV_WINDOW: usize = 12;

/// Runtime regime flags for one species.
#[derive(Clone, Debug)]
pub struct SpeciesState {
    /// Pinned regime, or [`Mode::Dynamic`] to let the partitioner choose.
    pub user_mode: Mode,
    /// Current regime; never [`Mode::Dynamic`].
    pub partition_mode: Mode,
    /// Smoothed-CV threshold for switching to continuous.
    pub switch_tol: f64,
    /// Mean-population threshold; used instead of the CV when positive.
    pub switch_min: f64,
    /// Boundary-condition species are exempt from reaction updates.
    pub boundary: bool,
}

/// Initial regime flags: user-pinned modes are honored, dynamic species
/// start discrete, and species driven by a rate rule or marked as boundary
/// conditions are forced continuous.
pub fn init_species_state(model: &Model) -> Vec<SpeciesState> {
    model
        .species
        .iter()
        .map(|spec| {
            let user_mode = if model.rate_rules[spec.id].is_some() || spec.boundary_condition {
                Mode::Continuous
            } else {
                spec.user_mode
            };
            SpeciesState {
                user_mode,
                partition_mode: match user_mode {
                    Mode::Dynamic => Mode::Discrete,
                    fixed => fixed,
                },
                switch_tol: spec.switch_tol,
                switch_min: spec.switch_min,
                boundary: spec.boundary_condition,
            }
        })
        .collect()
}

/// Rolling CV history per dynamic species.
pub struct Partitioner {
    history: Vec<VecDeque<f64>>,
    sums: Vec<f64>,
}

impl Partitioner {
    /// Empty history for every species.
    pub fn new(number_species: usize) -> Self {
        Partitioner {
            history: vec![VecDeque::with_capacity(CV_WINDOW); number_species],
            sums: vec![0.0; number_species],
        }
    }

    /// Clears the CV history at the start of a trajectory.
    pub fn reset(&mut self) {
        for window in &mut self.history {
            window.clear();
        }
        self.sums.fill(0.0);
    }

    /// Reclassifies every dynamic species from the current propensities.
    ///
    /// Per species, one step's expected change and variance come from the
    /// reactant/product change vectors weighted by the propensities; the CV
    /// is `sqrt(variance) / mean` (1 when the mean is not positive), smoothed
    /// over the window.
    pub fn partition(
        &mut self,
        model: &Model,
        species: &mut [SpeciesState],
        propensities: &[f64],
        state: &[f64],
    ) {
        for (s, spec) in species.iter_mut().enumerate() {
            if spec.user_mode != Mode::Dynamic {
                continue;
            }

            let mut mean = state[s];
            let mut variance = 0.0;
            for (r, rxn) in model.reactions.iter().enumerate() {
                let consumed = rxn.reactants_change[s];
                if consumed > 0 {
                    mean -= propensities[r] * consumed as f64;
                    variance += propensities[r] * (consumed * consumed) as f64;
                }
                let produced = rxn.products_change[s];
                if produced > 0 {
                    mean += propensities[r] * produced as f64;
                    variance += propensities[r] * (produced * produced) as f64;
                }
            }

            let cv = if mean > 0.0 && variance > 0.0 {
                variance.sqrt() / mean
            } else {
                1.0
            };

            let window = &mut self.history[s];
            window.push_back(cv);
            self.sums[s] += cv;
            if window.len() > CV_WINDOW {
                self.sums[s] -= window.pop_front().unwrap_or(0.0);
            }
            let smoothed = self.sums[s] / window.len() as f64;

            spec.partition_mode = if spec.switch_min > 0.0 {
                if mean > spec.switch_min {
                    Mode::Continuous
                } else {
                    Mode::Discrete
                }
            } else if smoothed < spec.switch_tol {
                Mode::Continuous
            } else {
                Mode::Discrete
            };
        }
    }
}

/// Effective regime of a species: the pinned mode, or the partitioner's
/// choice for dynamic species.
fn effective_mode(spec: &SpeciesState) -> Mode {
    match spec.user_mode {
        Mode::Dynamic => spec.partition_mode,
        fixed => fixed,
    }
}

/// Flags each reaction continuous only if every species it touches is
/// continuous; one discrete species demotes the whole reaction. Returns
/// whether any reaction changed mode, which forces a rebuild of the
/// differential-equation sets.
pub fn flag_reactions(model: &Model, species: &[SpeciesState], modes: &mut [Mode]) -> bool {
    let mut changed = false;
    for (r, rxn) in model.reactions.iter().enumerate() {
        let mut mode = Mode::Continuous;
        for (s, spec) in species.iter().enumerate() {
            if rxn.touches(s) && effective_mode(spec) == Mode::Discrete {
                mode = Mode::Discrete;
                break;
            }
        }
        if modes[r] != mode {
            modes[r] = mode;
            changed = true;
        }
    }
    changed
}

/// Rounds discrete-regime species to the nearest non-negative integer on
/// state commit.
pub fn round_discrete(species: &[SpeciesState], state: &mut [f64]) {
    for (spec, x) in species.iter().zip(state.iter_mut()) {
        if effective_mode(spec) == Mode::Discrete {
            *x = x.round().max(0.0);
        }
    }
}
