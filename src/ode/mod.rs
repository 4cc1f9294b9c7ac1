//! Deterministic integration of the reaction-rate equations:
//! `dy_s/dt = sum_r species_change[r][s] * a_r(y)` plus rate-rule
//! contributions, solved by the BDF integrator with a matrix-free Krylov
//! linear solver.

use std::io::Write;

use log::error;

use crate::model::{Model, Parameters};
use crate::output::OutputBuffer;
use crate::{Error, Simulation, Status};

pub use bdf::{Bdf, BdfCheckpoint, BdfError, BdfOptions, OdeSystem, StepOutcome};
pub use spgmr::Spgmr;

/// The BDF integrator.
pub mod bdf;
/// The iterative linear solver.
pub mod spgmr;

/// The reaction-rate equations as an [`OdeSystem`].
pub(crate) struct RateSystem<'m> {
    model: &'m Model,
    params: &'m Parameters,
    /// First reaction whose deterministic rate came back non-finite.
    pub bad_rate: Option<(usize, f64, f64)>,
}

impl<'m> RateSystem<'m> {
    pub fn new(model: &'m Model, params: &'m Parameters) -> Self {
        RateSystem {
            model,
            params,
            bad_rate: None,
        }
    }
}

impl OdeSystem for RateSystem<'_> {
    fn dim(&self) -> usize {
        self.model.number_species()
    }

    fn rhs(&mut self, t: f64, y: &[f64], dydt: &mut [f64]) {
        dydt.fill(0.0);

        for (r, rxn) in self.model.reactions.iter().enumerate() {
            let rate = rxn.ode_propensity(t, y, self.params);
            if !rate.is_finite() && self.bad_rate.is_none() {
                self.bad_rate = Some((r, rate, t));
            }
            for (s, &change) in rxn.species_change.iter().enumerate() {
                if change != 0 {
                    dydt[s] += change as f64 * rate;
                }
            }
        }

        for (s, rule) in self.model.rate_rules.iter().enumerate() {
            if let Some(rule) = rule {
                dydt[s] += rule(t, y, &self.params.variables, &self.params.constants);
            }
        }

        for (s, spec) in self.model.species.iter().enumerate() {
            if spec.boundary_condition {
                dydt[s] = 0.0;
            }
        }
    }
}

/// Runs every configured trajectory through the stiff integrator, querying
/// it at each grid point in normal (interpolating) mode.
pub fn solve<W: Write>(sim: &mut Simulation, out: &mut OutputBuffer<W>) -> Result<(), Error> {
    let opts = BdfOptions {
        rel_tol: sim.config.rel_tol,
        abs_tol: sim.config.abs_tol,
        max_step: sim.config.max_step,
    };

    for _trajectory in 0..sim.config.number_trajectories {
        if sim.interrupted() {
            break;
        }
        out.reset();

        let y0: Vec<f64> = sim.model.species.iter().map(|s| s.initial_population).collect();
        let mut sys = RateSystem::new(&sim.model, &sim.params);
        let mut bdf = Bdf::new(opts);
        bdf.reinit(&mut sys, 0.0, &y0);
        out.write_current(&y0)?;

        let mut status = Status::Ok;
        for idx in 1..sim.timeline.len() {
            if sim.interrupted() {
                break;
            }
            match bdf.integrate(&mut sys, sim.timeline[idx]) {
                Ok(_) => {
                    if let Some((r, rate, t)) = sys.bad_rate {
                        return Err(Error::Propensity {
                            name: sim.model.reactions[r].name.clone(),
                            value: rate,
                            time: t,
                        });
                    }
                    out.write_range(idx, bdf.state())?;
                }
                Err(e) => {
                    error!("ODE integration failed at t = {}: {e}", bdf.time());
                    status = Status::IntegratorFailed;
                    break;
                }
            }
        }

        out.write_final(status.code())?;
        sim.record_status(status);
        if sim.interrupted() {
            break;
        }
    }

    Ok(())
}
