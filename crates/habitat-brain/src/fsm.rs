//! Finite state machines whose current state lives on the agent.

use crate::{ArchitectureError, Behavior, Guard};
use habitat_core::{AgentRecord, BehaviorError, Outcome, Scope, Value};
use std::collections::HashSet;
use std::fmt;
use tracing::trace;

/// Agent attribute holding the name of the current state.
pub const STATE_ATTRIBUTE: &str = "state";
/// Agent attribute set while the current state's enter behavior has not run yet.
pub const ENTER_PENDING_ATTRIBUTE: &str = "state_entering";

/// Guarded edge to another state, with an optional action run while switching.
#[derive(Clone)]
pub struct Transition {
    target: String,
    guard: Guard,
    action: Option<Behavior>,
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("target", &self.target)
            .field("action", &self.action.is_some())
            .finish()
    }
}

impl Transition {
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }
}

#[derive(Clone)]
pub struct State {
    name: String,
    initial: bool,
    terminal: bool,
    enter: Option<Behavior>,
    body: Option<Behavior>,
    exit: Option<Behavior>,
    transitions: Vec<Transition>,
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("name", &self.name)
            .field("initial", &self.initial)
            .field("final", &self.terminal)
            .field("transitions", &self.transitions)
            .finish()
    }
}

impl State {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            initial: false,
            terminal: false,
            enter: None,
            body: None,
            exit: None,
            transitions: Vec::new(),
        }
    }

    /// Start here instead of in the first declared state.
    #[must_use]
    pub fn initial(mut self) -> Self {
        self.initial = true;
        self
    }

    /// Transitions out of a final state are never evaluated.
    #[must_use]
    pub fn terminal(mut self) -> Self {
        self.terminal = true;
        self
    }

    #[must_use]
    pub fn on_enter(mut self, enter: Behavior) -> Self {
        self.enter = Some(enter);
        self
    }

    #[must_use]
    pub fn body(mut self, body: Behavior) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn on_exit(mut self, exit: Behavior) -> Self {
        self.exit = Some(exit);
        self
    }

    #[must_use]
    pub fn transition(self, target: impl Into<String>, guard: Guard) -> Self {
        self.push_transition(target.into(), guard, None)
    }

    #[must_use]
    pub fn transition_with(
        self,
        target: impl Into<String>,
        guard: Guard,
        action: Behavior,
    ) -> Self {
        self.push_transition(target.into(), guard, Some(action))
    }

    fn push_transition(mut self, target: String, guard: Guard, action: Option<Behavior>) -> Self {
        self.transitions.push(Transition {
            target,
            guard,
            action,
        });
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn is_final(&self) -> bool {
        self.terminal
    }

    #[must_use]
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }
}

/// Validated set of states with a single initial state.
///
/// The machine itself is shared by every agent of a species; each agent carries its current
/// state in [`STATE_ATTRIBUTE`], so an agent is always in exactly one state once initialized.
#[derive(Clone)]
pub struct StateMachine {
    states: Vec<State>,
    initial: usize,
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("states", &self.states)
            .field("initial", &self.states[self.initial].name)
            .finish()
    }
}

impl StateMachine {
    pub fn new(states: Vec<State>) -> Result<Self, ArchitectureError> {
        if states.is_empty() {
            return Err(ArchitectureError::NoStates);
        }
        let mut seen = HashSet::with_capacity(states.len());
        let mut initial: Option<usize> = None;
        for (idx, state) in states.iter().enumerate() {
            if !seen.insert(state.name.as_str()) {
                return Err(ArchitectureError::DuplicateState(state.name.clone()));
            }
            if state.initial {
                if let Some(first) = initial {
                    return Err(ArchitectureError::MultipleInitialStates(
                        states[first].name.clone(),
                        state.name.clone(),
                    ));
                }
                initial = Some(idx);
            }
        }
        for state in &states {
            let unknown = state
                .transitions
                .iter()
                .find(|t| !seen.contains(t.target.as_str()));
            if let Some(unknown) = unknown {
                return Err(ArchitectureError::UnknownState {
                    from: state.name.clone(),
                    to: unknown.target.clone(),
                });
            }
        }
        let initial = initial.unwrap_or(0);
        Ok(Self { states, initial })
    }

    pub fn states(&self) -> impl Iterator<Item = &str> {
        self.states.iter().map(State::name)
    }

    #[must_use]
    pub fn initial_state(&self) -> &str {
        &self.states[self.initial].name
    }

    /// Current state of `agent`, if it was initialized with a state of this machine.
    #[must_use]
    pub fn current_state<'r>(&self, agent: &'r AgentRecord) -> Option<&'r str> {
        agent
            .attribute(STATE_ATTRIBUTE)
            .and_then(Value::as_str)
            .filter(|name| self.index_of(name).is_some())
    }

    /// Force `agent` into `name`; the state's enter behavior runs on the next step.
    ///
    /// Unknown names are ignored and reported as `false`.
    pub fn set_state(&self, agent: &mut AgentRecord, name: &str) -> bool {
        if self.index_of(name).is_none() {
            return false;
        }
        agent.set_attribute(STATE_ATTRIBUTE, name);
        agent.set_attribute(ENTER_PENDING_ATTRIBUTE, true);
        true
    }

    /// Put the agent in the initial state, to be entered on its first step.
    pub fn enter_initial(&self, scope: &mut Scope<'_>) {
        let initial = self.initial_state().to_owned();
        scope.set_attribute(STATE_ATTRIBUTE, initial);
        scope.set_attribute(ENTER_PENDING_ATTRIBUTE, true);
    }

    /// One step: enter if pending, run the body, then fire the first satisfied transition.
    ///
    /// A failing guard, exit or action leaves the agent in its current state.
    pub fn run(&self, scope: &mut Scope<'_>) -> Result<Outcome, BehaviorError> {
        let current = match self.current_index(scope) {
            Some(idx) => idx,
            None => {
                self.enter_initial(scope);
                self.initial
            }
        };
        let state = &self.states[current];

        if Self::enter_pending(scope) {
            scope.set_attribute(ENTER_PENDING_ATTRIBUTE, false);
            if let Some(enter) = &state.enter {
                enter(scope)?;
            }
            if scope.is_dying() {
                return Ok(Outcome::nil());
            }
        }

        let outcome = match &state.body {
            Some(body) => body(scope)?,
            None => Outcome::nil(),
        };
        if scope.is_dying() || state.terminal {
            return Ok(outcome);
        }

        for transition in &state.transitions {
            if !(transition.guard)(scope)? {
                continue;
            }
            if let Some(exit) = &state.exit {
                exit(scope)?;
            }
            if let Some(action) = &transition.action {
                action(scope)?;
            }
            scope.set_attribute(STATE_ATTRIBUTE, transition.target.as_str());
            scope.set_attribute(ENTER_PENDING_ATTRIBUTE, true);
            trace!(
                agent = ?scope.handle(),
                from = %state.name,
                to = %transition.target,
                "state transition"
            );
            break;
        }
        Ok(outcome)
    }

    /// Run the exit behavior of the state the agent is in, if it was entered.
    pub fn exit_current(&self, scope: &mut Scope<'_>) -> Result<(), BehaviorError> {
        if Self::enter_pending(scope) {
            return Ok(());
        }
        let Some(idx) = self.current_index(scope) else {
            return Ok(());
        };
        if let Some(exit) = &self.states[idx].exit {
            exit(scope)?;
        }
        Ok(())
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.states.iter().position(|state| state.name == name)
    }

    fn current_index(&self, scope: &Scope<'_>) -> Option<usize> {
        scope
            .attribute(STATE_ATTRIBUTE)
            .and_then(Value::as_str)
            .and_then(|name| self.index_of(name))
    }

    fn enter_pending(scope: &Scope<'_>) -> bool {
        scope
            .attribute(ENTER_PENDING_ATTRIBUTE)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}
