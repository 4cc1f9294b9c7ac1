//! Some models to play with, and the fixtures the test-suite leans on.

use crate::model::{AssignmentTarget, Event, EventAssignment, Model, ParamRef, RateLaw};
use crate::parse::model_from_str;

/// A single species decaying at rate `0.2 * A`.
pub const DECAY: &str = "
    A = 100;
    A -> : 0.2;
    ";

/// Enzymatic substrate conversion: A and B bind reversibly into C, which
/// decays into B and the product D.
pub const MICHAELIS_MENTEN: &str = "
    A = 301;
    B = 120;
    C = 0;
    D = 0;
    A + B -> C : 0.0017;
    C -> A + B : 0.5;
    C -> B + D : 0.1;
    ";

/// Reversible protein dimerization. The forward rate constant carries the
/// mass-action 1/2, so the propensity is `0.0017 * P * (P - 1) / 2`.
pub const DIMERIZATION: &str = "
    M = 0;
    D = 0;
    P = 301;
    P + P -> D : 0.00085;
    D -> P + P : 0.5;
    ";

/// The Vilar genetic oscillator (Vilar et al. 2002): an activator A and a
/// repressor R transcribed from two genes, with A sequestered into a
/// complex C. R(t) oscillates with a period near 25 time units.
pub const VILAR_OSCILLATOR: &str = "
    Da = 1;
    Dap = 0;
    Ma = 0;
    Dr = 1;
    Drp = 0;
    Mr = 0;
    A = 0;
    R = 0;
    C = 0;
    A + Da -> Dap : 1;
    Dap -> A + Da : 50;
    Da -> Da + Ma : 50;
    Dap -> Dap + Ma : 500;
    Ma -> : 10;
    Ma -> A + Ma : 50;
    A + R -> C : 2;
    A + Dr -> Drp : 1;
    Drp -> A + Dr : 100;
    Dr -> Dr + Mr : 0.01;
    Drp -> Drp + Mr : 50;
    Mr -> : 0.5;
    Mr -> Mr + R : 5;
    C -> R : 1;
    A -> : 1;
    R -> : 0.2;
    ";

/// The decay model, built.
pub fn decay() -> Model {
    model_from_str(DECAY).expect("preset model parses")
}

/// The enzymatic conversion model, built.
pub fn michaelis_menten() -> Model {
    model_from_str(MICHAELIS_MENTEN).expect("preset model parses")
}

/// The dimerization model, built.
pub fn dimerization() -> Model {
    model_from_str(DIMERIZATION).expect("preset model parses")
}

/// The Vilar oscillator, built.
pub fn vilar_oscillator() -> Model {
    model_from_str(VILAR_OSCILLATOR).expect("preset model parses")
}

fn rate_one(_t: f64, _state: &[f64], _vars: &[f64], _consts: &[f64]) -> f64 {
    1.0
}

/// One species X with no reactions and the rate rule `dX/dt = 1`.
pub fn linear_ramp() -> Model {
    let mut model = Model::build(&["X"], &[0.0], &[]);
    model.rate_rules[0] = Some(rate_one);
    model
}

fn trigger_at_5(_t: f64, state: &[f64], _vars: &[f64], _consts: &[f64]) -> bool {
    state[0] >= 5.0
}

fn delay_two(_t: f64, _state: &[f64], _vars: &[f64], _consts: &[f64]) -> f64 {
    2.0
}

fn value_zero(_t: f64, _state: &[f64], _vars: &[f64], _consts: &[f64]) -> f64 {
    0.0
}

/// The linear ramp plus a persistent event: when X reaches 5, reset it to
/// zero two time units later.
pub fn delayed_reset() -> Model {
    let mut model = linear_ramp();
    model.event_assignments.push(EventAssignment {
        target: AssignmentTarget::Species(0),
        value: value_zero,
    });
    model.events.push(Event {
        id: 0,
        trigger: trigger_at_5,
        delay: Some(delay_two),
        priority: None,
        use_trigger_state: false,
        is_persistent: true,
        initial_value: false,
        assignments: vec![0],
    });
    model
}

/// The decay model with its rate constant lifted into a variable parameter,
/// for exercising per-run overrides.
pub fn decay_with_variable_rate() -> Model {
    let mut model = decay();
    model.variables = vec![0.2];
    model.reactions[0].propensity = RateLaw::MassAction {
        k: ParamRef::Variable(0),
        orders: vec![1],
    };
    model.reactions[0].ode_propensity = RateLaw::MassAction {
        k: ParamRef::Variable(0),
        orders: vec![1],
    };
    model
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_build() {
        assert_eq!(decay().number_species(), 1);
        assert_eq!(michaelis_menten().number_reactions(), 3);
        assert_eq!(dimerization().number_species(), 3);

        let vilar = vilar_oscillator();
        assert_eq!(vilar.number_species(), 9);
        assert_eq!(vilar.number_reactions(), 16);
        assert_eq!(vilar.species_id("R"), Some(7));
    }

    #[test]
    fn dimerization_forward_propensity_matches_convention() {
        let model = dimerization();
        let params = model.load_parameters();
        let p = model.species_id("P").unwrap();
        let mut state = [0.0; 3];
        state[p] = 301.0;
        let a = model.reactions[0].propensity(0.0, &state, &params);
        assert!((a - 0.0017 * 301.0 * 300.0 / 2.0).abs() < 1e-9);
    }
}
