//! Event bookkeeping for the hybrid solver: trigger edge detection, delayed
//! executions (persistent and volatile), priority-ordered dispatch, and
//! re-checking until the step produces no further edges.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

use crate::model::{AssignmentTarget, Model, Parameters};

const MAX_EVENT_ROUNDS: usize = 10_000;

/// A scheduled run of one event's assignments. Captures the trigger-time
/// state when the event asks for it.
#[derive(Clone, Debug)]
struct Execution {
    event_id: usize,
    execution_time: f64,
    state_snapshot: Option<Vec<f64>>,
    variables_snapshot: Option<Vec<f64>>,
}

/// Heap adapter ordering executions chronologically.
#[derive(Clone, Debug)]
struct Delayed(Execution);

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.0.execution_time == other.0.execution_time
    }
}
impl Eq for Delayed {}
impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.execution_time.total_cmp(&other.0.execution_time)
    }
}

/// Trigger state tracking and the three execution queues: immediate (drained
/// every call), delayed-persistent (min-heap by execution time), and
/// volatile (delayed non-persistent entries that must stay triggered until
/// they fire).
pub struct EventList {
    trigger_state: Vec<bool>,
    trigger_pool: HashSet<usize>,
    delay_queue: BinaryHeap<Reverse<Delayed>>,
    volatile_queue: Vec<Execution>,
}

impl EventList {
    /// Trigger states start at each event's declared initial value, so an
    /// event whose trigger is already true at `t = 0` fires only if its
    /// initial value says false.
    pub fn new(model: &Model) -> Self {
        EventList {
            trigger_state: model.events.iter().map(|e| e.initial_value).collect(),
            trigger_pool: HashSet::new(),
            delay_queue: BinaryHeap::new(),
            volatile_queue: Vec::new(),
        }
    }

    /// Records every event whose trigger value differs from its tracked
    /// state. Returns whether any event activity is pending.
    pub fn evaluate_triggers(
        &mut self,
        model: &Model,
        params: &Parameters,
        state: &[f64],
        t: f64,
    ) -> bool {
        for event in &model.events {
            if event.trigger(t, state, params) != self.trigger_state[event.id] {
                self.trigger_pool.insert(event.id);
            }
        }
        self.has_active_events()
    }

    /// True while any trigger edge awaits execution (immediately, delayed,
    /// or volatile). The driver keeps the integrator's root-finder armed
    /// while this holds.
    pub fn has_active_events(&self) -> bool {
        !self.trigger_pool.is_empty()
    }

    /// Processes one integration step's worth of event activity at time `t`,
    /// writing assignments into `state` and `params.variables`. Repeats
    /// until no further triggers fire. Returns [`has_active_events`]
    /// (`Self::has_active_events`) afterwards.
    pub fn evaluate(
        &mut self,
        model: &Model,
        params: &mut Parameters,
        state: &mut [f64],
        t: f64,
    ) -> bool {
        if model.events.is_empty() {
            return false;
        }

        for _round in 0..MAX_EVENT_ROUNDS {
            if !self.one_pass(model, params, state, t) {
                break;
            }
        }
        self.has_active_events()
    }

    /// One detection/promotion/dispatch cycle. Returns true if anything ran,
    /// meaning triggers must be re-checked.
    fn one_pass(
        &mut self,
        model: &Model,
        params: &mut Parameters,
        state: &mut [f64],
        t: f64,
    ) -> bool {
        let mut immediate: Vec<Execution> = Vec::new();

        // Fired trigger edges become executions: immediate, delayed, or
        // volatile. A volatile double-fire is a retraction.
        for event in &model.events {
            if event.trigger(t, state, params) == self.trigger_state[event.id] {
                continue;
            }
            self.trigger_pool.insert(event.id);
            let delay = event.delay(t, state, params);
            let execution = Execution {
                event_id: event.id,
                execution_time: t + delay,
                state_snapshot: event.use_trigger_state.then(|| state.to_vec()),
                variables_snapshot: event.use_trigger_state.then(|| params.variables.clone()),
            };
            self.trigger_state[event.id] = !self.trigger_state[event.id];

            if delay <= 0.0 {
                immediate.push(execution);
            } else if event.is_persistent {
                self.delay_queue.push(Reverse(Delayed(execution)));
            } else if let Some(pos) = self
                .volatile_queue
                .iter()
                .position(|e| e.event_id == event.id)
            {
                // The trigger flipped back before the scheduled run: erase
                // both the old entry and the new edge.
                self.volatile_queue.remove(pos);
                self.trigger_pool.remove(&event.id);
            } else {
                self.volatile_queue.push(execution);
            }
        }

        // Volatile entries must remain triggered until they run; promote the
        // ones whose time has come.
        let mut idx = 0;
        while idx < self.volatile_queue.len() {
            let entry = &self.volatile_queue[idx];
            let event = &model.events[entry.event_id];
            if !event.trigger(t, state, params) {
                self.trigger_pool.remove(&entry.event_id);
                self.volatile_queue.remove(idx);
            } else if entry.execution_time <= t {
                immediate.push(self.volatile_queue.remove(idx));
            } else {
                idx += 1;
            }
        }

        // Delayed persistent executions whose time has come.
        while self
            .delay_queue
            .peek()
            .is_some_and(|Reverse(Delayed(next))| next.execution_time <= t)
        {
            if let Some(Reverse(Delayed(execution))) = self.delay_queue.pop() {
                immediate.push(execution);
            }
        }

        if immediate.is_empty() {
            return false;
        }

        // Higher priority first; the stable sort keeps declaration order for
        // ties.
        immediate.sort_by(|a, b| {
            let pa = model.events[a.event_id].priority(t, state, params);
            let pb = model.events[b.event_id].priority(t, state, params);
            pb.total_cmp(&pa)
        });

        for execution in &immediate {
            self.execute(model, params, state, t, execution);
            self.trigger_pool.remove(&execution.event_id);
        }

        // Assignments may have moved the very quantities the triggers watch.
        for event in &model.events {
            self.trigger_state[event.id] = event.trigger(t, state, params);
        }
        true
    }

    /// Runs one execution's assignments, reading from the trigger-time
    /// snapshot when the event captured one.
    fn execute(
        &self,
        model: &Model,
        params: &mut Parameters,
        state: &mut [f64],
        t: f64,
        execution: &Execution,
    ) {
        let event = &model.events[execution.event_id];
        let input_state: &[f64] = execution.state_snapshot.as_deref().unwrap_or(state);
        let input_vars: &[f64] = execution
            .variables_snapshot
            .as_deref()
            .unwrap_or(&params.variables);

        let mut writes = Vec::with_capacity(event.assignments.len());
        for &assignment_id in &event.assignments {
            let assignment = &model.event_assignments[assignment_id];
            let value = (assignment.value)(t, input_state, input_vars, &params.constants);
            writes.push((assignment.target, value));
        }
        for (target, value) in writes {
            match target {
                AssignmentTarget::Species(s) => state[s] = value,
                AssignmentTarget::Variable(v) => params.variables[v] = value,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Event, EventAssignment, Model};

    fn trigger_x_above_5(_t: f64, state: &[f64], _v: &[f64], _c: &[f64]) -> bool {
        state[0] >= 5.0
    }
    fn delay_2(_t: f64, _s: &[f64], _v: &[f64], _c: &[f64]) -> f64 {
        2.0
    }
    fn zero(_t: f64, _s: &[f64], _v: &[f64], _c: &[f64]) -> f64 {
        0.0
    }

    fn reset_model(is_persistent: bool, delay: Option<crate::model::RateFn>) -> Model {
        let mut model = Model::build(&["X"], &[0.0], &[]);
        model.event_assignments.push(EventAssignment {
            target: AssignmentTarget::Species(0),
            value: zero,
        });
        model.events.push(Event {
            id: 0,
            trigger: trigger_x_above_5,
            delay,
            priority: None,
            use_trigger_state: false,
            is_persistent,
            initial_value: false,
            assignments: vec![0],
        });
        model
    }

    #[test]
    fn immediate_event_fires_on_the_edge() {
        let model = reset_model(true, None);
        let mut params = model.load_parameters();
        let mut events = EventList::new(&model);
        let mut state = [6.0];

        assert!(events.evaluate_triggers(&model, &params, &state, 1.0));
        events.evaluate(&model, &mut params, &mut state, 1.0);
        assert_eq!(state[0], 0.0);
        assert!(!events.has_active_events());
    }

    #[test]
    fn persistent_delay_survives_a_false_trigger() {
        let model = reset_model(true, Some(delay_2));
        let mut params = model.load_parameters();
        let mut events = EventList::new(&model);

        let mut state = [6.0];
        events.evaluate(&model, &mut params, &mut state, 1.0);
        assert_eq!(state[0], 6.0, "delayed execution must not fire early");
        assert!(events.has_active_events());

        // Trigger drops back to false; a persistent execution still runs.
        state[0] = 1.0;
        events.evaluate(&model, &mut params, &mut state, 2.0);
        assert_eq!(state[0], 1.0);
        events.evaluate(&model, &mut params, &mut state, 3.5);
        assert_eq!(state[0], 0.0);
    }

    #[test]
    fn volatile_execution_is_retracted_when_trigger_falls() {
        let model = reset_model(false, Some(delay_2));
        let mut params = model.load_parameters();
        let mut events = EventList::new(&model);

        let mut state = [6.0];
        events.evaluate(&model, &mut params, &mut state, 1.0);
        assert!(events.has_active_events());

        // Trigger returns to false before t = 3: the execution is retracted.
        state[0] = 1.0;
        events.evaluate(&model, &mut params, &mut state, 2.0);
        assert!(!events.has_active_events());
        events.evaluate(&model, &mut params, &mut state, 3.5);
        assert_eq!(state[0], 1.0, "retracted execution must never run");
    }

    #[test]
    fn snapshot_assignments_read_trigger_time_state() {
        fn copy_x(_t: f64, state: &[f64], _v: &[f64], _c: &[f64]) -> f64 {
            state[0]
        }
        let mut model = Model::build(&["X", "Y"], &[0.0, 0.0], &[]);
        model.event_assignments.push(EventAssignment {
            target: AssignmentTarget::Species(1),
            value: copy_x,
        });
        model.events.push(Event {
            id: 0,
            trigger: trigger_x_above_5,
            delay: Some(delay_2),
            priority: None,
            use_trigger_state: true,
            is_persistent: true,
            initial_value: false,
            assignments: vec![0],
        });

        let mut params = model.load_parameters();
        let mut events = EventList::new(&model);
        let mut state = [6.0, 0.0];
        events.evaluate(&model, &mut params, &mut state, 0.0);

        // X keeps moving while the execution waits.
        state[0] = 40.0;
        events.evaluate(&model, &mut params, &mut state, 2.5);
        assert_eq!(state[1], 6.0, "must copy the trigger-time value of X");
    }
}
