//! Tau-leaping: many reaction firings per adaptive step, drawn from Poisson
//! distributions, with step rejection when a population would go negative.

use std::io::Write;

use log::debug;

use crate::model::State;
use crate::output::OutputBuffer;
use crate::tau::{self, TauArgs};
use crate::{checked_propensity, Error, Simulation, Status};

/// Consecutive halvings allowed before the step is declared unrecoverable.
const MAX_REJECTIONS: u32 = 100;

/// Runs every configured trajectory with tau-leaping.
pub fn solve<W: Write>(sim: &mut Simulation, out: &mut OutputBuffer<W>) -> Result<(), Error> {
    let ns = sim.model.number_species();
    let nr = sim.model.number_reactions();
    let increment = sim.config.increment;
    let tau_tol = sim.config.tau_tol;

    let tau_args = tau::initialize(&sim.model);

    let mut propensities = vec![0.0; nr];
    let mut xf = vec![0.0; ns];
    let mut counts = vec![0u64; nr];

    for _trajectory in 0..sim.config.number_trajectories {
        if sim.interrupted() {
            break;
        }
        out.reset();

        let mut state = State::<i64>::from_initial(&sim.model);
        let mut save_time = 0.0;

        while out.next_unwritten() < out.number_timesteps() {
            if sim.interrupted() {
                break;
            }

            while state.time < save_time {
                if sim.interrupted() {
                    break;
                }

                state.write_into(&mut xf);
                for r in 0..nr {
                    propensities[r] =
                        checked_propensity(&sim.model, r, state.time, &xf, &sim.params)?;
                }

                let mut tau_step = tau::select(
                    &sim.model,
                    &tau_args,
                    tau_tol,
                    state.time,
                    save_time,
                    &propensities,
                    &xf,
                );

                let saved = state.clone();
                let mut rejections = 0u32;

                loop {
                    if rejections > MAX_REJECTIONS {
                        return Err(Error::RetryGuard(rejections));
                    }

                    leap(sim, &propensities, tau_step, save_time, &mut state, &mut counts);

                    if negative_population(&state, &tau_args, &counts) {
                        state = saved.clone();
                        tau_step /= 2.0;
                        rejections += 1;
                        sim.steps_rejected += 1;
                        debug!(
                            "rejected leap at t = {}, retrying with tau = {}",
                            state.time, tau_step
                        );
                    } else {
                        break;
                    }
                }
            }

            state.write_into(&mut xf);
            out.write_current(&xf)?;
            save_time += increment;
        }

        out.write_final(Status::Ok.code())?;
        if sim.interrupted() {
            break;
        }
    }

    Ok(())
}

/// Draws Poisson firing counts for one candidate step and applies them,
/// clamping the step to the save boundary first.
fn leap(
    sim: &mut Simulation,
    propensities: &[f64],
    mut tau_step: f64,
    save_time: f64,
    state: &mut State<i64>,
    counts: &mut [u64],
) {
    if state.time + tau_step > save_time {
        tau_step = save_time - state.time;
    }

    for (r, count) in counts.iter_mut().enumerate() {
        *count = sim.urn.poisson(propensities[r] * tau_step);
    }
    for (r, &count) in counts.iter().enumerate() {
        if count > 0 {
            state.apply(&sim.model.reactions[r], count as i64);
        }
    }

    state.time += tau_step;
}

/// True if any species touched by a fired reaction went negative.
fn negative_population(state: &State<i64>, args: &TauArgs, counts: &[u64]) -> bool {
    counts.iter().enumerate().any(|(r, &count)| {
        count > 0
            && args.reactants[r]
                .iter()
                .chain(&args.products[r])
                .any(|&s| state.species[s] < 0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{presets, Config, SolverKind};

    fn rows(text: &str) -> Vec<Vec<f64>> {
        text.lines()
            .filter(|l| l.contains(','))
            .map(|l| {
                l.split(',')
                    .filter(|f| !f.is_empty())
                    .map(|f| f.parse().unwrap())
                    .collect()
            })
            .collect()
    }

    #[test]
    fn populations_never_go_negative() {
        let model = presets::dimerization();
        for seed in [1, 7, 42, 1234] {
            let mut sink = Vec::new();
            let status = crate::run(
                &model,
                SolverKind::TauLeaping,
                Config::new(10.0, 101, 1).with_seed(seed),
                &mut sink,
            )
            .unwrap();
            assert_eq!(status, Status::Ok);
            for row in rows(&String::from_utf8(sink).unwrap()) {
                for &x in &row[1..] {
                    assert!(x >= 0.0, "negative population with seed {seed}: {row:?}");
                }
            }
        }
    }

    #[test]
    fn rejection_counter_moves_on_a_tight_model() {
        // A constant-rate drain keeps its propensity at 50 even when A is
        // exhausted, so leaps past A = 0 must be rejected and halved.
        fn drain(_t: f64, _state: &[f64], _vars: &[f64], _consts: &[f64]) -> f64 {
            50.0
        }
        let mut model = crate::Model::build(&["A"], &[2.0], &["drain"]);
        model.set_reactant(0, 0, 1);
        model.reactions[0].propensity = crate::RateLaw::Custom(drain);
        model.reactions[0].ode_propensity = crate::RateLaw::Custom(drain);
        model.update_affected_reactions();

        let mut sim = Simulation::new(model, Config::new(1.0, 11, 1).with_seed(1)).unwrap();
        let mut sink = Vec::new();
        sim.run(SolverKind::TauLeaping, &mut sink).unwrap();
        assert!(sim.steps_rejected > 0);
        for row in rows(&String::from_utf8(sink).unwrap()) {
            assert!(row[1] >= 0.0);
        }
    }

    #[test]
    fn row_count_matches_the_grid() {
        let model = presets::decay();
        let mut sink = Vec::new();
        crate::run(
            &model,
            SolverKind::TauLeaping,
            Config::new(20.0, 21, 2).with_seed(8),
            &mut sink,
        )
        .unwrap();
        let text = String::from_utf8(sink).unwrap();
        // 21 rows and a status token per trajectory.
        assert_eq!(text.lines().count(), 44);
    }
}
