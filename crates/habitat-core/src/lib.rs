//! Core runtime types shared across the habitat workspace.
//!
//! A [`Simulation`] owns a set of [`Population`]s. Each population binds one species to a
//! [`ControlPolicy`] and a [`Topology`], and the [`Scheduler`] steps every live agent of
//! every population once per [`Cycle`], in parallel where the population allows it.

pub mod population;
pub mod scheduler;
pub mod scope;
pub mod simulation;
pub mod topology;

pub use habitat_index::{
    AgentHandle, AgentKey, Envelope, IndexConfig, IndexError, Point, PopulationId, SpatialIndex,
};
pub use population::{Population, PopulationSpec, TopologySpec};
pub use scheduler::{
    AgentFault, CycleContext, CycleReport, CycleStatus, PopulationReport, Scheduler,
    SchedulerError,
};
pub use scope::{Scope, ScopeReport, SpawnRequest, StagedMove, derive_seed};
pub use simulation::{Simulation, SimulationError};
pub use topology::{
    AmorphousTopology, CompositeTopology, ContinuousTopology, RootTopology, Topology,
    TopologyError, TopologyKind,
};

use rand::{SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use thiserror::Error;

/// Simulation clock (cycles stepped since creation).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Cycle(pub u64);

impl Cycle {
    /// Returns the next sequential cycle.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Dynamically typed attribute value carried by agents and returned by behaviors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Point(Point),
}

impl Value {
    #[must_use]
    pub const fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Numeric view of the value; integers widen to floats.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(value) => Some(*value as f64),
            Self::Float(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_point(&self) -> Option<Point> {
        match self {
            Self::Point(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Point> for Value {
    fn from(value: Point) -> Self {
        Self::Point(value)
    }
}

/// Result of running a behavior, rule or architecture on one agent.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The behavior ran and produced a value.
    Passed(Value),
    /// The behavior ran but reports that it did not succeed; sequencing stops here.
    NotPassed(Value),
}

impl Outcome {
    /// `Passed(Nil)`, the result of a behavior with nothing to report.
    #[must_use]
    pub const fn nil() -> Self {
        Self::Passed(Value::Nil)
    }

    #[must_use]
    pub const fn passed(&self) -> bool {
        matches!(self, Self::Passed(_))
    }

    #[must_use]
    pub const fn value(&self) -> &Value {
        match self {
            Self::Passed(value) | Self::NotPassed(value) => value,
        }
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        match self {
            Self::Passed(value) | Self::NotPassed(value) => value,
        }
    }
}

/// Failure raised while executing a behavior on one agent.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BehaviorError {
    /// The behavior reported an error; the agent is isolated and removed.
    #[error("behavior failed: {0}")]
    Failed(String),
    /// The behavior panicked; caught at the task boundary and treated like a failure.
    #[error("behavior panicked: {0}")]
    Panicked(String),
    /// A topology operation failed.
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

impl BehaviorError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Structural failures abort the whole cycle instead of isolating one agent.
    #[must_use]
    pub const fn is_structural(&self) -> bool {
        match self {
            Self::Topology(error) => error.is_structural(),
            Self::Failed(_) | Self::Panicked(_) => false,
        }
    }
}

/// One agent: a stable serial, a shape, and named attributes.
///
/// The shape is only changed through a [`Scope`] so the spatial index never drifts from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    serial: u64,
    envelope: Envelope,
    attributes: BTreeMap<String, Value>,
    dead: bool,
}

impl AgentRecord {
    #[must_use]
    pub fn new(serial: u64, envelope: Envelope, attributes: BTreeMap<String, Value>) -> Self {
        Self {
            serial,
            envelope,
            attributes,
            dead: false,
        }
    }

    /// Creation index of the agent inside its population; stable across runs.
    #[must_use]
    pub const fn serial(&self) -> u64 {
        self.serial
    }

    #[must_use]
    pub const fn envelope(&self) -> Envelope {
        self.envelope
    }

    #[must_use]
    pub fn location(&self) -> Point {
        self.envelope.center()
    }

    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Set an attribute, returning the previous value.
    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.attributes.insert(name.into(), value.into())
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<Value> {
        self.attributes.remove(name)
    }

    #[must_use]
    pub const fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }

    #[must_use]
    pub const fn is_dead(&self) -> bool {
        self.dead
    }

    pub(crate) fn set_envelope(&mut self, envelope: Envelope) {
        self.envelope = envelope;
    }

    pub(crate) fn mark_dead(&mut self) {
        self.dead = true;
    }
}

/// Decision logic bound to a species; evaluated once per agent per cycle.
///
/// Implementations must be shareable across worker threads: all per-agent state lives on the
/// [`AgentRecord`] reached through the [`Scope`].
pub trait ControlPolicy: Send + Sync {
    /// Static identifier of the architecture.
    fn kind(&self) -> &'static str;

    /// Runs once when an agent is created.
    fn init_on(&self, _scope: &mut Scope<'_>) -> Result<Outcome, BehaviorError> {
        Ok(Outcome::nil())
    }

    /// Runs the policy for one agent for one cycle.
    fn execute_on(&self, scope: &mut Scope<'_>) -> Result<Outcome, BehaviorError>;

    /// Runs when an agent is removed, either by dying or after a fault.
    fn abort(&self, _scope: &mut Scope<'_>) -> Result<(), BehaviorError> {
        Ok(())
    }
}

/// Policy that does nothing; used for passive populations.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdlePolicy;

impl ControlPolicy for IdlePolicy {
    fn kind(&self) -> &'static str {
        "idle"
    }

    fn execute_on(&self, _scope: &mut Scope<'_>) -> Result<Outcome, BehaviorError> {
        Ok(Outcome::nil())
    }
}

/// Species names mapped to their control policies.
#[derive(Default, Clone)]
pub struct SpeciesRegistry {
    species: BTreeMap<String, Arc<dyn ControlPolicy>>,
}

impl fmt::Debug for SpeciesRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.species.iter().map(|(name, policy)| (name, policy.kind())))
            .finish()
    }
}

impl SpeciesRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a species, returning the policy it replaced.
    pub fn register(
        &mut self,
        species: impl Into<String>,
        policy: Arc<dyn ControlPolicy>,
    ) -> Option<Arc<dyn ControlPolicy>> {
        self.species.insert(species.into(), policy)
    }

    #[must_use]
    pub fn get(&self, species: &str) -> Option<Arc<dyn ControlPolicy>> {
        self.species.get(species).cloned()
    }

    #[must_use]
    pub fn contains(&self, species: &str) -> bool {
        self.species.contains_key(species)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.species.keys().map(String::as_str)
    }

    /// Adds every species of `other` not already registered here.
    pub fn absorb(&mut self, other: SpeciesRegistry) {
        for (name, policy) in other.species {
            self.species.entry(name).or_insert(policy);
        }
    }
}

/// Errors raised while loading or validating an [`EngineConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Static configuration for a simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    /// Worker threads for agent steps; `None` uses the available parallelism.
    pub worker_threads: Option<usize>,
    /// Populations with at most this many live agents are stepped sequentially.
    pub parallel_threshold: usize,
    /// Bounds of the root topology.
    pub environment: Envelope,
    /// Whether the root topology wraps around its edges.
    pub torus: bool,
    /// Grid and shard layout of the root spatial index.
    pub index: IndexConfig,
    /// Number of cycle reports retained in history.
    pub history_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rng_seed: None,
            worker_threads: None,
            parallel_threshold: 20,
            environment: Envelope::new(0.0, 0.0, 100.0, 100.0),
            torus: false,
            index: IndexConfig::default(),
            history_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.environment.is_valid()
            || self.environment.width() <= 0.0
            || self.environment.height() <= 0.0
        {
            return Err(ConfigError::InvalidConfig(
                "environment must be finite with positive width and height",
            ));
        }
        if self.worker_threads == Some(0) {
            return Err(ConfigError::InvalidConfig("worker_threads must be positive"));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::InvalidConfig("history_capacity must be positive"));
        }
        self.index.validate().map_err(|err| match err {
            IndexError::InvalidConfig(reason) => ConfigError::InvalidConfig(reason),
            IndexError::InvalidGeometry(_) => ConfigError::InvalidConfig("invalid index geometry"),
        })
    }

    /// Worker count after resolving the `None` default.
    #[must_use]
    pub fn resolved_threads(&self) -> usize {
        self.worker_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1)
        })
    }

    /// Returns the configured seed, generating one from entropy if absent.
    fn resolved_seed(&self) -> u64 {
        self.rng_seed.unwrap_or_else(rand::random)
    }

    /// RNG for simulation-level decisions outside agent scopes.
    fn seeded_rng(seed: u64) -> SmallRng {
        SmallRng::seed_from_u64(seed)
    }
}
