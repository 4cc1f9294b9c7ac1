use std::fmt;

use bimap::BiHashMap;
use itertools::Itertools;

/// Rate callable signature shared by custom propensities, rate rules, event
/// delays, event priorities and event assignment values:
/// `(t, state, variables, constants) -> value`.
pub type RateFn = fn(f64, &[f64], &[f64], &[f64]) -> f64;

/// Event trigger callable: `(t, state, variables, constants) -> bool`.
pub type TriggerFn = fn(f64, &[f64], &[f64], &[f64]) -> bool;

/// Where a mass-action rate constant comes from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ParamRef {
    /// Inline literal, baked into the model.
    Literal(f64),
    /// Index into the variable parameter array (overridable per run).
    Variable(usize),
    /// Index into the constant parameter array.
    Constant(usize),
}

impl ParamRef {
    /// Resolves the referenced value.
    pub fn value(&self, params: &Parameters) -> f64 {
        match *self {
            ParamRef::Literal(v) => v,
            ParamRef::Variable(i) => params.variables[i],
            ParamRef::Constant(i) => params.constants[i],
        }
    }
}

/// A reaction's rate law. Tagged dispatch: most models are mass action, and
/// anything else comes in as a plain function pointer taking the parameter
/// arrays explicitly, so nothing is captured by closure.
#[derive(Clone, Debug, PartialEq)]
pub enum RateLaw {
    /// Law of mass action. `orders[s]` is the multiplicity of species `s`
    /// among the reactants. The rate constant absorbs combinatorial factors.
    MassAction { k: ParamRef, orders: Vec<u32> },
    /// Host-supplied formula.
    Custom(RateFn),
}

impl RateLaw {
    /// Stochastic propensity: mass action uses falling factorials of the
    /// populations, so e.g. `2A -> ...` evaluates to `k * A * (A - 1)`.
    pub fn propensity(&self, t: f64, state: &[f64], params: &Parameters) -> f64 {
        match self {
            RateLaw::MassAction { k, orders } => {
                let mut acc = k.value(params);
                for (s, &order) in orders.iter().enumerate() {
                    for i in 0..order {
                        acc *= state[s] - i as f64;
                    }
                }
                acc
            }
            RateLaw::Custom(f) => f(t, state, &params.variables, &params.constants),
        }
    }

    /// Deterministic rate: mass action uses plain powers of the
    /// concentrations.
    pub fn ode_rate(&self, t: f64, state: &[f64], params: &Parameters) -> f64 {
        match self {
            RateLaw::MassAction { k, orders } => {
                let mut acc = k.value(params);
                for (s, &order) in orders.iter().enumerate() {
                    acc *= state[s].powi(order as i32);
                }
                acc
            }
            RateLaw::Custom(f) => f(t, state, &params.variables, &params.constants),
        }
    }
}

/// Snapshot of the model's parameter arrays, taken at the start of a run and
/// passed by reference to every callable. Event assignments may write into
/// `variables`; nothing else mutates it during a trajectory.
#[derive(Clone, Debug, Default)]
pub struct Parameters {
    /// Mutable parameter values.
    pub variables: Vec<f64>,
    /// Immutable parameter values.
    pub constants: Vec<f64>,
}

/// Regime flag for species and reactions in the hybrid solver. `Dynamic`
/// means the partitioner chooses each step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Mode {
    /// Concentration-valued, integrated deterministically.
    Continuous,
    /// Population-valued, fired stochastically.
    Discrete,
    /// Reclassified by the partitioner every step.
    #[default]
    Dynamic,
}

/// An immutable species record. The mutable population lives in the active
/// solver's state vector, not here.
#[derive(Clone, Debug, PartialEq)]
pub struct Species {
    /// Dense index into every state vector.
    pub id: usize,
    /// Display name.
    pub name: String,
    /// Non-negative starting population.
    pub initial_population: f64,
    /// Boundary-condition species are not updated by reactions and never
    /// restrict step acceptance; their dy/dt is identically zero.
    pub boundary_condition: bool,
    /// User-pinned regime for the hybrid solver.
    pub user_mode: Mode,
    /// CV threshold below which a dynamic species switches to continuous.
    pub switch_tol: f64,
    /// If positive, switch on mean population instead of CV.
    pub switch_min: f64,
}

/// An immutable reaction record: three per-species change vectors, the
/// conservative propensity-dependency set, and a pair of rate laws.
#[derive(Clone, Debug, PartialEq)]
pub struct Reaction {
    /// Dense index into the model's reaction list.
    pub id: usize,
    /// Display name.
    pub name: String,
    /// Count of each species consumed (non-negative).
    pub reactants_change: Vec<i64>,
    /// Count of each species produced (non-negative).
    pub products_change: Vec<i64>,
    /// `products_change - reactants_change`, applied when the reaction fires.
    pub species_change: Vec<i64>,
    /// Reactions whose propensity may change when this one fires.
    pub affected_reactions: Vec<usize>,
    /// Stochastic rate law.
    pub propensity: RateLaw,
    /// Deterministic rate law, used by the ODE solver and the hybrid
    /// continuous branch.
    pub ode_propensity: RateLaw,
}

impl Reaction {
    /// Stochastic propensity at the given state.
    pub fn propensity(&self, t: f64, state: &[f64], params: &Parameters) -> f64 {
        self.propensity.propensity(t, state, params)
    }

    /// Deterministic rate at the given state.
    pub fn ode_propensity(&self, t: f64, state: &[f64], params: &Parameters) -> f64 {
        self.ode_propensity.ode_rate(t, state, params)
    }

    /// True if the species participates in this reaction as a reactant or a
    /// product.
    pub fn touches(&self, species: usize) -> bool {
        self.reactants_change[species] > 0 || self.products_change[species] > 0
    }
}

/// Target slot of an event assignment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssignmentTarget {
    /// A slot in the species state vector.
    Species(usize),
    /// A slot in the variable parameter array.
    Variable(usize),
}

/// One scalar write, dispatched by id from an event's assignment list.
#[derive(Clone, Debug, PartialEq)]
pub struct EventAssignment {
    /// Where the value lands.
    pub target: AssignmentTarget,
    /// Evaluated against the trigger-time snapshot or the live state.
    pub value: RateFn,
}

/// An SBML-style event: a boolean trigger whose rising edge schedules the
/// assignments, optionally after a delay, ordered by priority.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    /// Dense index into the model's event list.
    pub id: usize,
    /// Boolean condition whose rising edge fires the event.
    pub trigger: TriggerFn,
    /// Delay between the trigger edge and execution; `None` means zero.
    pub delay: Option<RateFn>,
    /// Tie-break among simultaneous executions; higher fires first.
    pub priority: Option<RateFn>,
    /// Evaluate assignments against the state captured at trigger time.
    pub use_trigger_state: bool,
    /// Persistent executions survive their trigger turning false again.
    pub is_persistent: bool,
    /// Assumed value of the trigger before the simulation starts.
    pub initial_value: bool,
    /// Indices into [`Model::event_assignments`].
    pub assignments: Vec<usize>,
}

impl Event {
    /// Evaluates the trigger condition.
    pub fn trigger(&self, t: f64, state: &[f64], params: &Parameters) -> bool {
        (self.trigger)(t, state, &params.variables, &params.constants)
    }

    /// Delay between the trigger edge and execution; zero when undeclared.
    pub fn delay(&self, t: f64, state: &[f64], params: &Parameters) -> f64 {
        match self.delay {
            Some(f) => f(t, state, &params.variables, &params.constants),
            None => 0.0,
        }
    }

    /// Dispatch priority; zero when undeclared.
    pub fn priority(&self, t: f64, state: &[f64], params: &Parameters) -> f64 {
        match self.priority {
            Some(f) => f(t, state, &params.variables, &params.constants),
            None => 0.0,
        }
    }
}

/// A normalized reaction network: ordered species and reactions, parameter
/// arrays, and the optional continuous machinery (rate rules, events).
///
/// Built once per run and read-only afterwards, except for
/// [`override_variable`](Model::override_variable) before simulation start.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Model {
    /// Species, ordered by id.
    pub species: Vec<Species>,
    /// Reactions, ordered by id.
    pub reactions: Vec<Reaction>,
    /// Default values of the mutable parameters.
    pub variables: Vec<f64>,
    /// Values of the immutable parameters.
    pub constants: Vec<f64>,
    /// Per-species continuous rate rule, if any.
    pub rate_rules: Vec<Option<RateFn>>,
    /// SBML-style events.
    pub events: Vec<Event>,
    /// Assignment pool referenced by the events.
    pub event_assignments: Vec<EventAssignment>,
    /// Species id <-> name.
    pub names: BiHashMap<usize, String>,
}

impl Model {
    /// Creates a model with zero-initialized change vectors. Reactions are
    /// given a mass-action law with no reactants (rate 0) until the host
    /// fills them in.
    pub fn build(
        species_names: &[&str],
        initial_populations: &[f64],
        reaction_names: &[&str],
    ) -> Model {
        assert_eq!(species_names.len(), initial_populations.len());
        let n = species_names.len();

        let mut names = BiHashMap::new();
        let species = species_names
            .iter()
            .zip(initial_populations)
            .enumerate()
            .map(|(id, (name, &pop))| {
                names.insert(id, name.to_string());
                Species {
                    id,
                    name: name.to_string(),
                    initial_population: pop,
                    boundary_condition: false,
                    user_mode: Mode::Dynamic,
                    switch_tol: 0.03,
                    switch_min: 0.0,
                }
            })
            .collect();

        let reactions = reaction_names
            .iter()
            .enumerate()
            .map(|(id, name)| Reaction {
                id,
                name: name.to_string(),
                reactants_change: vec![0; n],
                products_change: vec![0; n],
                species_change: vec![0; n],
                affected_reactions: Vec::new(),
                propensity: RateLaw::MassAction {
                    k: ParamRef::Literal(0.0),
                    orders: vec![0; n],
                },
                ode_propensity: RateLaw::MassAction {
                    k: ParamRef::Literal(0.0),
                    orders: vec![0; n],
                },
            })
            .collect();

        Model {
            species,
            reactions,
            rate_rules: vec![None; n],
            names,
            ..Model::default()
        }
    }

    /// Number of species.
    pub fn number_species(&self) -> usize {
        self.species.len()
    }

    /// Number of reactions.
    pub fn number_reactions(&self) -> usize {
        self.reactions.len()
    }

    /// Looks a species up by name.
    pub fn species_id(&self, name: &str) -> Option<usize> {
        self.names.get_by_right(name).copied()
    }

    /// Sets the consumed count of a species and refreshes the net change.
    pub fn set_reactant(&mut self, rxn: usize, species: usize, count: i64) {
        let r = &mut self.reactions[rxn];
        r.reactants_change[species] = count;
        r.species_change[species] = r.products_change[species] - count;
    }

    /// Sets the produced count of a species and refreshes the net change.
    pub fn set_product(&mut self, rxn: usize, species: usize, count: i64) {
        let r = &mut self.reactions[rxn];
        r.products_change[species] = count;
        r.species_change[species] = count - r.reactants_change[species];
    }

    /// Overwrites the net change of a species directly.
    pub fn set_species_change(&mut self, rxn: usize, species: usize, delta: i64) {
        self.reactions[rxn].species_change[species] = delta;
    }

    /// Gives a reaction the mass-action law implied by its reactant counts,
    /// for both the stochastic and the deterministic side. Call after the
    /// change vectors are filled in.
    pub fn set_mass_action(&mut self, rxn: usize, k: ParamRef) {
        let r = &mut self.reactions[rxn];
        let orders: Vec<u32> = r.reactants_change.iter().map(|&c| c as u32).collect();
        r.propensity = RateLaw::MassAction {
            k,
            orders: orders.clone(),
        };
        r.ode_propensity = RateLaw::MassAction { k, orders };
    }

    /// Recomputes each reaction's conservative dependency set: `r2` is
    /// affected by `r1` if some species changed by `r1` is consumed by `r2`.
    /// Ascending id, deduplicated. Propensities outside the set need not be
    /// recomputed after `r1` fires.
    pub fn update_affected_reactions(&mut self) {
        let n = self.number_reactions();
        for r1 in 0..n {
            let mut affected: Vec<usize> = (0..n)
                .filter(|&r2| {
                    (0..self.number_species()).any(|s| {
                        self.reactions[r1].species_change[s] != 0
                            && self.reactions[r2].reactants_change[s] > 0
                    })
                })
                .collect();
            affected.dedup();
            self.reactions[r1].affected_reactions = affected;
        }
    }

    /// Snapshots the parameter arrays for the duration of a run.
    pub fn load_parameters(&self) -> Parameters {
        Parameters {
            variables: self.variables.clone(),
            constants: self.constants.clone(),
        }
    }

    /// Replaces a variable parameter's value. Only valid before a run.
    pub fn override_variable(&mut self, id: usize, value: f64) {
        self.variables[id] = value;
    }
}

impl fmt::Display for Model {
    /// Renders the network in the text format `parse` understands; models
    /// with literal mass-action rates round-trip.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = |changes: &[i64]| {
            changes
                .iter()
                .enumerate()
                .filter(|&(_, &count)| count > 0)
                .map(|(s, &count)| {
                    if count == 1 {
                        self.species[s].name.clone()
                    } else {
                        format!("{count}{}", self.species[s].name)
                    }
                })
                .join(" + ")
        };

        for spec in &self.species {
            writeln!(f, "{} = {};", spec.name, spec.initial_population)?;
        }
        for rxn in &self.reactions {
            let rate = match &rxn.propensity {
                RateLaw::MassAction { k: ParamRef::Literal(v), .. } => v.to_string(),
                RateLaw::MassAction { k: ParamRef::Variable(i), .. } => format!("var{i}"),
                RateLaw::MassAction { k: ParamRef::Constant(i), .. } => format!("const{i}"),
                RateLaw::Custom(_) => "<custom>".to_string(),
            };
            writeln!(
                f,
                "{} -> {} : {};",
                side(&rxn.reactants_change),
                side(&rxn.products_change),
                rate
            )?;
        }
        Ok(())
    }
}

/// A solver-owned state vector plus the current time. Stochastic solvers
/// instantiate `State<i64>`, the continuous ones `State<f64>`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct State<T> {
    /// Amount of each species.
    pub species: Vec<T>,
    /// Current time.
    pub time: f64,
}

impl State<i64> {
    /// Initial populations, rounded to integer counts.
    pub fn from_initial(model: &Model) -> Self {
        State {
            species: model
                .species
                .iter()
                .map(|s| s.initial_population.round() as i64)
                .collect(),
            time: 0.0,
        }
    }

    /// Applies `count` firings of a reaction.
    pub fn apply(&mut self, rxn: &Reaction, count: i64) {
        for (x, d) in self.species.iter_mut().zip(&rxn.species_change) {
            *x += d * count;
        }
    }

    /// Mirrors the populations into a float buffer for propensity callables.
    pub fn write_into(&self, buf: &mut [f64]) {
        for (b, &x) in buf.iter_mut().zip(&self.species) {
            *b = x as f64;
        }
    }
}

impl State<f64> {
    /// Initial populations as concentrations.
    pub fn from_initial(model: &Model) -> Self {
        State {
            species: model.species.iter().map(|s| s.initial_population).collect(),
            time: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_step() -> Model {
        // A -> B -> C
        let mut model = Model::build(&["A", "B", "C"], &[100.0, 0.0, 0.0], &["r1", "r2"]);
        model.set_reactant(0, 0, 1);
        model.set_product(0, 1, 1);
        model.set_reactant(1, 1, 1);
        model.set_product(1, 2, 1);
        model.set_mass_action(0, ParamRef::Literal(0.5));
        model.set_mass_action(1, ParamRef::Literal(0.25));
        model.update_affected_reactions();
        model
    }

    #[test]
    fn change_vectors_are_consistent() {
        let model = two_step();
        for r in &model.reactions {
            for s in 0..model.number_species() {
                assert_eq!(
                    r.species_change[s],
                    r.products_change[s] - r.reactants_change[s]
                );
            }
        }
    }

    #[test]
    fn affected_reactions_is_a_superset() {
        let model = two_step();
        // r1 changes A and B; r2 consumes B, r1 consumes A.
        assert_eq!(model.reactions[0].affected_reactions, vec![0, 1]);
        // r2 changes B and C; only r2 consumes B, nothing consumes C.
        assert_eq!(model.reactions[1].affected_reactions, vec![1]);
    }

    #[test]
    fn mass_action_uses_falling_factorials() {
        let mut model = Model::build(&["P", "D"], &[5.0, 0.0], &["dim"]);
        model.set_reactant(0, 0, 2);
        model.set_product(0, 1, 1);
        model.set_mass_action(0, ParamRef::Literal(0.1));
        let params = model.load_parameters();

        let state = [5.0, 0.0];
        let a = model.reactions[0].propensity(0.0, &state, &params);
        assert!((a - 0.1 * 5.0 * 4.0).abs() < 1e-12);
        let rate = model.reactions[0].ode_propensity(0.0, &state, &params);
        assert!((rate - 0.1 * 25.0).abs() < 1e-12);
    }

    #[test]
    fn display_round_trips_through_parse() {
        let model = crate::parse::model_from_str("A = 100; B = 3; 2A + B -> C : 0.5;").unwrap();
        let reparsed = crate::parse::model_from_str(&model.to_string()).unwrap();
        assert_eq!(reparsed.number_species(), 3);
        assert_eq!(
            reparsed.reactions[0].species_change,
            model.reactions[0].species_change
        );
    }

    #[test]
    fn variable_override_applies_before_snapshot() {
        let mut model = two_step();
        model.variables = vec![1.0];
        model.set_mass_action(0, ParamRef::Variable(0));
        model.override_variable(0, 2.0);
        let params = model.load_parameters();
        let state = [3.0, 0.0, 0.0];
        let a = model.reactions[0].propensity(0.0, &state, &params);
        assert!((a - 6.0).abs() < 1e-12);
    }
}
