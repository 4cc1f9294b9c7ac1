//! Adaptive step-size selection for tau-leaping and the hybrid solver,
//! following Cao, Gillespie, Petzold, "Efficient step size selection for the
//! tau-leaping simulation method" (eqs. 32a-33).

use crate::model::Model;

/// A reaction is critical when it is within this many firings of exhausting
/// one of its reactants.
pub const CRITICAL_THRESHOLD: f64 = 10.0;

/// Hard floor on the selected step.
pub const TAU_MIN: f64 = 1e-10;

/// Error-control correction for species consumed with stoichiometry 2 or 3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GiCorrection {
    None,
    /// Consumed twice by a second-order reaction.
    PairSecondOrder,
    /// Consumed twice by a third-order reaction.
    PairThirdOrder,
    /// Consumed three times.
    Triple,
}

/// Per-model precomputation for [`select`]: highest-order reaction per
/// species and the reactant/product index lists.
pub struct TauArgs {
    /// Firing headroom below which a reaction is critical.
    pub critical_threshold: f64,
    /// Highest order among reactions consuming each species.
    hor: Vec<u32>,
    correction: Vec<GiCorrection>,
    /// Species consumed by each reaction.
    pub reactants: Vec<Vec<usize>>,
    /// Species produced by each reaction.
    pub products: Vec<Vec<usize>>,
    /// Distinct species consumed by any reaction.
    consumed: Vec<usize>,
}

/// Precomputes the per-species order data the selector needs.
pub fn initialize(model: &Model) -> TauArgs {
    let ns = model.number_species();
    let nr = model.number_reactions();

    let mut hor = vec![0u32; ns];
    let mut correction = vec![GiCorrection::None; ns];
    let mut reactants = vec![Vec::new(); nr];
    let mut products = vec![Vec::new(); nr];
    let mut is_consumed = vec![false; ns];

    for (r, rxn) in model.reactions.iter().enumerate() {
        let order: u32 = rxn.reactants_change.iter().map(|&c| c as u32).sum();

        for s in 0..ns {
            if rxn.products_change[s] > 0 {
                products[r].push(s);
            }
            if rxn.reactants_change[s] > 0 {
                reactants[r].push(s);
                is_consumed[s] = true;

                if order > hor[s] {
                    hor[s] = order;
                    let count = rxn.reactants_change[s];
                    correction[s] = match (count, order) {
                        (2, 2) => GiCorrection::PairSecondOrder,
                        (2, 3) => GiCorrection::PairThirdOrder,
                        (3, _) => GiCorrection::Triple,
                        _ => GiCorrection::None,
                    };
                }
            }
        }
    }

    TauArgs {
        critical_threshold: CRITICAL_THRESHOLD,
        hor,
        correction,
        reactants,
        products,
        consumed: (0..ns).filter(|&s| is_consumed[s]).collect(),
    }
}

/// g_i for the current population; falls back to the plain reaction order
/// when the population is too small for the correction terms.
fn g_value(hor: u32, correction: GiCorrection, x: f64) -> f64 {
    let order = hor.max(1) as f64;
    match correction {
        GiCorrection::PairSecondOrder if x > 1.0 => 2.0 + 1.0 / (x - 1.0),
        GiCorrection::PairThirdOrder if x > 1.0 => 1.5 * (2.0 + 1.0 / (x - 1.0)),
        GiCorrection::Triple if x > 2.0 => 3.0 + 1.0 / (x - 1.0) + 2.0 / (x - 2.0),
        _ => order,
    }
}

/// Picks the next leap interval from the current propensities and state.
///
/// Critical reactions (close to exhausting a reactant) contribute a
/// single-firing estimate `1/a_r`; the rest contribute the Cao-Gillespie-
/// Petzold bound. The result is clamped to the next save boundary and floored
/// at [`TAU_MIN`].
pub fn select(
    model: &Model,
    args: &TauArgs,
    tau_tol: f64,
    current_time: f64,
    save_time: f64,
    propensities: &[f64],
    state: &[f64],
) -> f64 {
    let ns = model.number_species();

    let mut mu = vec![0.0; ns];
    let mut sigma2 = vec![0.0; ns];
    let mut critical = vec![false; model.number_reactions()];
    let mut any_critical = false;

    for (r, rxn) in model.reactions.iter().enumerate() {
        for &s in &args.reactants[r] {
            if rxn.species_change[s] >= 0 {
                continue;
            }
            let v = rxn.species_change[s].unsigned_abs() as f64;

            if propensities[r] > 0.0 && state[s] / v < args.critical_threshold {
                critical[r] = true;
                any_critical = true;
            }

            mu[s] += v * propensities[r];
            sigma2[s] += v * v * propensities[r];
        }
    }

    // Single-firing estimate over the critical reactions.
    let critical_tau = critical
        .iter()
        .zip(propensities)
        .filter(|&(&is_crit, &a)| is_crit && a > 0.0)
        .map(|(_, &a)| 1.0 / a)
        .fold(f64::INFINITY, f64::min);

    // Cao-Gillespie-Petzold 33 over the non-critically consumed species.
    let mut non_critical_tau = f64::INFINITY;
    let mut have_non_critical = false;
    for &s in &args.consumed {
        if mu[s] <= 0.0 {
            continue;
        }
        let g = g_value(args.hor[s], args.correction[s], state[s]);
        let epsilon = tau_tol / g;
        let max_pop_change_mean = (epsilon * state[s]).abs().max(1.0);
        let max_pop_change_sd = max_pop_change_mean * max_pop_change_mean;
        let tau_s = (max_pop_change_mean / mu[s]).min(max_pop_change_sd / sigma2[s]);
        non_critical_tau = non_critical_tau.min(tau_s);
        have_non_critical = true;
    }

    let mut tau = if !any_critical && have_non_critical {
        non_critical_tau
    } else if any_critical && !have_non_critical {
        critical_tau
    } else if any_critical {
        non_critical_tau.min(critical_tau)
    } else {
        0.0
    };

    if tau > 0.0 {
        tau = tau.max(TAU_MIN);
        if save_time - current_time > 0.0 {
            tau = tau.min(save_time - current_time);
        }
    } else {
        // Nothing consumes anything: step straight to the save boundary.
        tau = save_time - current_time;
    }

    tau
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ParamRef;

    fn decay() -> Model {
        let mut model = Model::build(&["A"], &[100.0], &["deg"]);
        model.set_reactant(0, 0, 1);
        model.set_mass_action(0, ParamRef::Literal(0.2));
        model.update_affected_reactions();
        model
    }

    fn dimerization() -> Model {
        let mut model = Model::build(&["P", "D"], &[301.0, 0.0], &["dim", "undim"]);
        model.set_reactant(0, 0, 2);
        model.set_product(0, 1, 1);
        model.set_reactant(1, 1, 1);
        model.set_product(1, 0, 2);
        model.set_mass_action(0, ParamRef::Literal(0.00085));
        model.set_mass_action(1, ParamRef::Literal(0.5));
        model.update_affected_reactions();
        model
    }

    #[test]
    fn tau_respects_floor_and_save_boundary() {
        let model = decay();
        let args = initialize(&model);
        let params = model.load_parameters();
        let state = [100.0];
        let a = [model.reactions[0].propensity(0.0, &state, &params)];

        let tau = select(&model, &args, 0.03, 0.0, 1.0, &a, &state);
        assert!(tau >= TAU_MIN);
        assert!(tau <= 1.0);

        // A save boundary closer than the unconstrained step wins.
        let tau = select(&model, &args, 0.03, 0.0, 1e-4, &a, &state);
        assert!((tau - 1e-4).abs() < 1e-15);
    }

    #[test]
    fn exhausted_reactant_flags_critical() {
        let model = dimerization();
        let args = initialize(&model);
        let params = model.load_parameters();

        // Plenty of P: no critical reaction, CGP bound applies.
        let state = [301.0, 0.0];
        let a = [
            model.reactions[0].propensity(0.0, &state, &params),
            model.reactions[1].propensity(0.0, &state, &params),
        ];
        let roomy = select(&model, &args, 0.03, 0.0, 10.0, &a, &state);

        // P nearly exhausted: the critical single-firing estimate takes over.
        let state = [3.0, 149.0];
        let a = [
            model.reactions[0].propensity(0.0, &state, &params),
            model.reactions[1].propensity(0.0, &state, &params),
        ];
        let tight = select(&model, &args, 0.03, 0.0, 10.0, &a, &state);
        assert!(tight <= 1.0 / a[0] + 1e-12 || tight <= roomy);
        assert!(tight >= TAU_MIN);
    }

    #[test]
    fn second_order_correction_tightens_epsilon() {
        let model = dimerization();
        let args = initialize(&model);
        assert_eq!(args.hor[0], 2);
        assert_eq!(args.correction[0], GiCorrection::PairSecondOrder);
        // g = 2 + 1/(x-1) > 2 shrinks epsilon below tau_tol / 2.
        assert!(g_value(args.hor[0], args.correction[0], 301.0) > 2.0);
        // Tiny populations fall back to the plain order.
        assert_eq!(g_value(args.hor[0], args.correction[0], 1.0), 2.0);
    }
}
