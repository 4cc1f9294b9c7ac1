//! Gillespie's direct method: exact discrete-event simulation.

use std::io::Write;

use crate::model::State;
use crate::output::OutputBuffer;
use crate::{checked_propensity, Error, Simulation, Status};

/// Runs every configured trajectory with the direct method.
///
/// Per step: sum the propensities; a zero sum freezes the remaining grid
/// points and ends the trajectory. Otherwise two uniform draws pick the
/// firing reaction (first id whose running cumulative falls to or below
/// zero, which keeps a fixed seed reproducible) and the exponential waiting
/// time. Only the propensities in the fired reaction's `affected_reactions`
/// set are recomputed.
pub fn solve<W: Write>(sim: &mut Simulation, out: &mut OutputBuffer<W>) -> Result<(), Error> {
    let ns = sim.model.number_species();
    let nr = sim.model.number_reactions();
    let end_time = sim.config.end_time;
    let last = out.number_timesteps() - 1;

    let mut propensities = vec![0.0; nr];
    let mut xf = vec![0.0; ns];

    for _trajectory in 0..sim.config.number_trajectories {
        if sim.interrupted() {
            break;
        }
        out.reset();

        let mut state = State::<i64>::from_initial(&sim.model);
        state.write_into(&mut xf);
        out.write_current(&xf)?;

        for r in 0..nr {
            propensities[r] = checked_propensity(&sim.model, r, state.time, &xf, &sim.params)?;
        }

        while state.time < end_time {
            if sim.interrupted() {
                break;
            }

            let propensity_sum: f64 = propensities.iter().sum();
            if propensity_sum <= 0.0 {
                // Terminal state: nothing can fire again.
                break;
            }

            // The reaction is drawn first, then the waiting time.
            let mut cumulative = sim.urn.next() * propensity_sum;
            state.time += -sim.urn.ln_uniform() / propensity_sum;

            let mut fired = None;
            for (r, &a) in propensities.iter().enumerate() {
                cumulative -= a;
                if cumulative <= 0.0 && a > 0.0 {
                    fired = Some(r);
                    break;
                }
            }

            if let Some(r) = fired {
                state.apply(&sim.model.reactions[r], 1);
                state.write_into(&mut xf);
                for &ar in &sim.model.reactions[r].affected_reactions {
                    propensities[ar] =
                        checked_propensity(&sim.model, ar, state.time, &xf, &sim.params)?;
                }
            }

            // Emit every grid point the jump carried us past.
            let timeline = out.timeline();
            let mut next = out.next_unwritten();
            while next <= last && timeline[next] <= state.time {
                next += 1;
            }
            if next > out.next_unwritten() {
                out.write_range(next - 1, &xf)?;
            }
        }

        if sim.interrupted() {
            // Flush what this trajectory has; emitted rows remain valid.
            out.write_final(Status::Ok.code())?;
            break;
        }

        // Freeze the remaining grid points on the final state.
        out.write_range(last, &xf)?;
        out.write_final(Status::Ok.code())?;
    }

    Ok(())
}
