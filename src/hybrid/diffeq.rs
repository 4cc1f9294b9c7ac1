//! Per-species differential-equation assembly for the hybrid solver.
//!
//! Each continuous reaction contributes `species_change * rate` terms to
//! every species it changes; rate rules contribute on top. The sets are
//! rebuilt whenever the partitioner changes any reaction's mode.

use crate::model::{Mode, Model};

/// One species' formula set: `(reaction, coefficient)` pairs over the
/// continuous reactions. Evaluation sums `coefficient * rate[reaction]`,
/// with the per-reaction rates computed once per right-hand-side call.
#[derive(Clone, Debug, Default)]
pub struct DiffEquation {
    /// `(reaction, coefficient)` pairs.
    pub terms: Vec<(usize, f64)>,
}

impl DiffEquation {
    /// Sums this species' reaction terms given the current rate values.
    pub fn evaluate(&self, rates: &[f64]) -> f64 {
        self.terms.iter().map(|&(r, coeff)| coeff * rates[r]).sum()
    }
}

/// Builds the formula set of every species from the continuous reactions.
pub fn assemble(model: &Model, modes: &[Mode]) -> Vec<DiffEquation> {
    let mut equations = vec![DiffEquation::default(); model.number_species()];

    for (r, rxn) in model.reactions.iter().enumerate() {
        if modes[r] == Mode::Discrete {
            continue;
        }
        for (s, &change) in rxn.species_change.iter().enumerate() {
            if change != 0 {
                equations[s].terms.push((r, change as f64));
            }
        }
    }

    equations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ParamRef;

    #[test]
    fn only_continuous_reactions_contribute() {
        // r1: A -> B (continuous), r2: B -> A (discrete)
        let mut model = Model::build(&["A", "B"], &[10.0, 0.0], &["r1", "r2"]);
        model.set_reactant(0, 0, 1);
        model.set_product(0, 1, 1);
        model.set_reactant(1, 1, 1);
        model.set_product(1, 0, 1);
        model.set_mass_action(0, ParamRef::Literal(2.0));
        model.set_mass_action(1, ParamRef::Literal(3.0));

        let equations = assemble(&model, &[Mode::Continuous, Mode::Discrete]);
        assert_eq!(equations[0].terms, vec![(0, -1.0)]);
        assert_eq!(equations[1].terms, vec![(0, 1.0)]);

        // dA/dt = -rate(r1), dB/dt = +rate(r1)
        let rates = [20.0, 0.0];
        assert_eq!(equations[0].evaluate(&rates), -20.0);
        assert_eq!(equations[1].evaluate(&rates), 20.0);
    }
}
