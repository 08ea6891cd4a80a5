//! Control architectures deciding what each agent runs every cycle.
//!
//! A [`ControlArchitecture`] is a per-species template shared by every agent of the species.
//! It holds no per-agent state: the current state of a state machine, user-gate flags and
//! everything behaviors remember live in the agent's attributes.

pub mod fsm;
pub mod reflex;
pub mod tasks;
pub mod user;

pub use fsm::{ENTER_PENDING_ATTRIBUTE, STATE_ATTRIBUTE, State, StateMachine, Transition};
pub use reflex::{Reflex, ReflexSet};
pub use tasks::{Task, TaskMode, TaskSet};
pub use user::{USER_CONTROLLED_ATTRIBUTE, USER_INITIALIZED_ATTRIBUTE, UserGate, UserPlacement};

use habitat_core::{BehaviorError, ControlPolicy, Outcome, Scope};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Body of a reflex, state, transition action or task.
pub type Behavior = Arc<dyn Fn(&mut Scope<'_>) -> Result<Outcome, BehaviorError> + Send + Sync>;
/// Condition deciding whether a reflex runs or a transition fires.
pub type Guard = Arc<dyn Fn(&mut Scope<'_>) -> Result<bool, BehaviorError> + Send + Sync>;
/// Priority of a task, re-evaluated every cycle.
pub type Weight = Arc<dyn Fn(&mut Scope<'_>) -> Result<f64, BehaviorError> + Send + Sync>;

pub fn behavior<F>(body: F) -> Behavior
where
    F: Fn(&mut Scope<'_>) -> Result<Outcome, BehaviorError> + Send + Sync + 'static,
{
    Arc::new(body)
}

pub fn guard<F>(condition: F) -> Guard
where
    F: Fn(&mut Scope<'_>) -> Result<bool, BehaviorError> + Send + Sync + 'static,
{
    Arc::new(condition)
}

pub fn weight<F>(priority: F) -> Weight
where
    F: Fn(&mut Scope<'_>) -> Result<f64, BehaviorError> + Send + Sync + 'static,
{
    Arc::new(priority)
}

/// Constant weight.
#[must_use]
pub fn fixed_weight(value: f64) -> Weight {
    Arc::new(move |_: &mut Scope<'_>| Ok(value))
}

/// Errors raised while assembling an architecture.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArchitectureError {
    #[error("a state machine needs at least one state")]
    NoStates,
    #[error("state {0:?} is declared twice")]
    DuplicateState(String),
    #[error("states {0:?} and {1:?} are both marked initial")]
    MultipleInitialStates(String, String),
    #[error("state {from:?} has a transition to unknown state {to:?}")]
    UnknownState { from: String, to: String },
}

/// Per-species control architecture.
///
/// Reflexes always run first; the variant decides what runs after them.
pub enum ControlArchitecture {
    /// Guarded reflexes only.
    Reflex(ReflexSet),
    /// Reflexes, then the agent's current state.
    StateMachine {
        reflexes: ReflexSet,
        machine: StateMachine,
    },
    /// Reflexes, then weighted, sorted or probabilistic task selection.
    Tasks { reflexes: ReflexSet, tasks: TaskSet },
    /// A state machine gated by a boolean agent attribute with a user-interaction phase.
    UserControlled {
        reflexes: ReflexSet,
        machine: StateMachine,
        gate: UserGate,
    },
}

impl fmt::Debug for ControlArchitecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reflex(reflexes) => f.debug_tuple("Reflex").field(reflexes).finish(),
            Self::StateMachine { reflexes, machine } => f
                .debug_struct("StateMachine")
                .field("reflexes", reflexes)
                .field("machine", machine)
                .finish(),
            Self::Tasks { reflexes, tasks } => f
                .debug_struct("Tasks")
                .field("reflexes", reflexes)
                .field("tasks", tasks)
                .finish(),
            Self::UserControlled {
                reflexes,
                machine,
                gate,
            } => f
                .debug_struct("UserControlled")
                .field("reflexes", reflexes)
                .field("machine", machine)
                .field("gate", gate)
                .finish(),
        }
    }
}

impl ControlArchitecture {
    #[must_use]
    pub fn reflex(reflexes: ReflexSet) -> Self {
        Self::Reflex(reflexes)
    }

    #[must_use]
    pub fn state_machine(reflexes: ReflexSet, machine: StateMachine) -> Self {
        Self::StateMachine { reflexes, machine }
    }

    #[must_use]
    pub fn tasks(reflexes: ReflexSet, tasks: TaskSet) -> Self {
        Self::Tasks { reflexes, tasks }
    }

    #[must_use]
    pub fn user_controlled(reflexes: ReflexSet, machine: StateMachine, gate: UserGate) -> Self {
        Self::UserControlled {
            reflexes,
            machine,
            gate,
        }
    }

    /// Wrap the template for registration in a species registry.
    #[must_use]
    pub fn into_policy(self) -> Arc<dyn ControlPolicy> {
        Arc::new(self)
    }

    /// State machine of the architecture, if it has one.
    #[must_use]
    pub fn machine(&self) -> Option<&StateMachine> {
        match self {
            Self::StateMachine { machine, .. } | Self::UserControlled { machine, .. } => {
                Some(machine)
            }
            Self::Reflex(_) | Self::Tasks { .. } => None,
        }
    }

    #[must_use]
    pub fn reflexes(&self) -> &ReflexSet {
        match self {
            Self::Reflex(reflexes)
            | Self::StateMachine { reflexes, .. }
            | Self::Tasks { reflexes, .. }
            | Self::UserControlled { reflexes, .. } => reflexes,
        }
    }

    /// Reflexes followed by the state machine: the automatic phase of every variant with states.
    fn automatic(
        reflexes: &ReflexSet,
        machine: &StateMachine,
        scope: &mut Scope<'_>,
    ) -> Result<Outcome, BehaviorError> {
        let outcome = reflexes.run(scope)?;
        if scope.is_dying() {
            return Ok(outcome);
        }
        machine.run(scope)
    }
}

impl ControlPolicy for ControlArchitecture {
    fn kind(&self) -> &'static str {
        match self {
            Self::Reflex(_) => "reflex",
            Self::StateMachine { .. } => "fsm",
            Self::Tasks { tasks, .. } => tasks.mode().name(),
            Self::UserControlled { gate, .. } => gate.placement().name(),
        }
    }

    fn init_on(&self, scope: &mut Scope<'_>) -> Result<Outcome, BehaviorError> {
        let outcome = self.reflexes().run_init(scope)?;
        if let Some(machine) = self.machine() {
            machine.enter_initial(scope);
        }
        Ok(outcome)
    }

    fn execute_on(&self, scope: &mut Scope<'_>) -> Result<Outcome, BehaviorError> {
        match self {
            Self::Reflex(reflexes) => reflexes.run(scope),
            Self::StateMachine { reflexes, machine } => Self::automatic(reflexes, machine, scope),
            Self::Tasks { reflexes, tasks } => {
                let outcome = reflexes.run(scope)?;
                if scope.is_dying() {
                    return Ok(outcome);
                }
                tasks.run(scope)
            }
            Self::UserControlled {
                reflexes,
                machine,
                gate,
            } => gate.run(scope, |scope| Self::automatic(reflexes, machine, scope)),
        }
    }

    fn abort(&self, scope: &mut Scope<'_>) -> Result<(), BehaviorError> {
        match self.machine() {
            Some(machine) => machine.exit_current(scope),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use habitat_core::{
        AgentHandle, AgentKey, AgentRecord, AmorphousTopology, Cycle, Envelope, Point,
        PopulationId, Scope, Topology, Value,
    };
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicBool;

    pub fn agent() -> AgentRecord {
        AgentRecord::new(0, Envelope::from_point(Point::new(0.0, 0.0)), BTreeMap::new())
    }

    /// Run `f` against a scope over `record` with the given seed.
    pub fn with_scope<R>(
        record: &mut AgentRecord,
        seed: u64,
        f: impl FnOnce(&mut Scope<'_>) -> R,
    ) -> R {
        let topology = Topology::Amorphous(AmorphousTopology::new());
        let interrupt = AtomicBool::new(false);
        let handle = AgentHandle::new(PopulationId(0), AgentKey::default());
        let mut scope = Scope::new(handle, record, &topology, Cycle(1), seed, &interrupt);
        f(&mut scope)
    }

    /// Append `entry` to the agent's `log` attribute.
    pub fn log(scope: &mut Scope<'_>, entry: &str) {
        let mut trail = scope
            .attribute("log")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        trail.push_str(entry);
        trail.push(';');
        scope.set_attribute("log", trail);
    }

    pub fn trail(record: &AgentRecord) -> String {
        record
            .attribute("log")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned()
    }
}
