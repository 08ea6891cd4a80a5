//! Per-execution context handed to control policies.

use crate::topology::{Topology, TopologyError};
use crate::{AgentRecord, BehaviorError, Cycle, Value};
use habitat_index::{AgentHandle, Envelope, Point};
use rand::{SeedableRng, rngs::SmallRng};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

fn splitmix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Seed for one agent's execution in one cycle.
///
/// Depends only on the run seed, the cycle, and the agent's stable position in its
/// population, so results do not change with the worker count.
#[must_use]
pub fn derive_seed(parent: u64, cycle: u64, population: u32, serial: u64) -> u64 {
    let mut h = splitmix(parent);
    h = splitmix(h ^ cycle.wrapping_mul(0x9E37_79B9_7F4A_7C15));
    h = splitmix(h ^ u64::from(population).wrapping_mul(0xBF58_476D_1CE4_E5B9));
    splitmix(h ^ serial.wrapping_mul(0x94D0_49BB_1331_11EB))
}

/// Agent creation requested from inside a scope; committed after the population barrier.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnRequest {
    pub shape: Envelope,
    pub attributes: BTreeMap<String, Value>,
}

impl SpawnRequest {
    /// Point-shaped agent at `location`.
    #[must_use]
    pub fn at(location: Point) -> Self {
        Self {
            shape: Envelope::from_point(location),
            attributes: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_extent(mut self, half_width: f64, half_height: f64) -> Self {
        self.shape = Envelope::centered(self.shape.center(), half_width, half_height);
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

/// Shape change made inside a scope.
///
/// The agent sees its new shape at once; the topology only learns about it after the
/// population barrier, so every scope of a cycle queries the same cycle-start index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StagedMove {
    /// Shape the topology still holds for the agent.
    pub from: Envelope,
    pub to: Envelope,
}

impl StagedMove {
    /// Publish the move to `topology`. A move that ends where it started is a no-op.
    pub fn apply(&self, topology: &Topology, handle: AgentHandle) -> Result<(), TopologyError> {
        if self.from == self.to {
            return Ok(());
        }
        topology.update_agent(handle, Some(&self.from), self.to)
    }
}

/// What a finished scope hands back to the scheduler.
#[derive(Debug, Default)]
pub struct ScopeReport {
    pub dying: bool,
    pub error: Option<BehaviorError>,
    pub reported: Vec<TopologyError>,
    pub spawns: Vec<SpawnRequest>,
    pub moved: Option<StagedMove>,
}

/// Execution context of one agent for one cycle.
///
/// Owns the agent's random stream for the cycle and borrows the agent exclusively; scopes
/// for different agents never share mutable state.
pub struct Scope<'a> {
    handle: AgentHandle,
    agent: &'a mut AgentRecord,
    topology: &'a Topology,
    cycle: Cycle,
    seed: u64,
    rng: SmallRng,
    interrupt: &'a AtomicBool,
    report: ScopeReport,
}

impl std::fmt::Debug for Scope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("handle", &self.handle)
            .field("cycle", &self.cycle)
            .field("seed", &self.seed)
            .field("dying", &self.report.dying)
            .finish_non_exhaustive()
    }
}

impl<'a> Scope<'a> {
    pub fn new(
        handle: AgentHandle,
        agent: &'a mut AgentRecord,
        topology: &'a Topology,
        cycle: Cycle,
        seed: u64,
        interrupt: &'a AtomicBool,
    ) -> Self {
        Self {
            handle,
            agent,
            topology,
            cycle,
            seed,
            rng: SmallRng::seed_from_u64(seed),
            interrupt,
            report: ScopeReport::default(),
        }
    }

    #[must_use]
    pub const fn handle(&self) -> AgentHandle {
        self.handle
    }

    #[must_use]
    pub fn agent(&self) -> &AgentRecord {
        &*self.agent
    }

    pub fn agent_mut(&mut self) -> &mut AgentRecord {
        &mut *self.agent
    }

    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.agent.attribute(name)
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.agent.set_attribute(name, value)
    }

    #[must_use]
    pub const fn topology(&self) -> &'a Topology {
        self.topology
    }

    #[must_use]
    pub const fn cycle(&self) -> Cycle {
        self.cycle
    }

    /// Seed this scope's random stream was created from.
    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    /// True once the run was interrupted. Long behaviors may poll this to stop early.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Acquire)
    }

    /// Mark the agent for removal at the end of the cycle.
    pub fn die(&mut self) {
        self.report.dying = true;
    }

    #[must_use]
    pub const fn is_dying(&self) -> bool {
        self.report.dying
    }

    #[must_use]
    pub fn location(&self) -> Point {
        self.agent.location()
    }

    /// Move the agent's shape so it is centered on `target`.
    ///
    /// Invalid geometry is reported on the scope and leaves the agent where it was; only
    /// structural topology failures are returned. Other agents see the move from the next
    /// population barrier on.
    pub fn move_to(&mut self, target: Point) -> Result<(), BehaviorError> {
        let previous = self.agent.envelope();
        let shape = self
            .topology
            .normalize_location(target)
            .map(|location| previous.moved_to(location));
        self.reshape(shape)
    }

    /// Travel `distance` along `heading` degrees. Returns false when blocked by the edge or
    /// when the topology refuses the new shape.
    pub fn move_by(&mut self, heading: f64, distance: f64) -> Result<bool, BehaviorError> {
        let destination = match self
            .topology
            .destination(&self.location(), heading, distance, true)
        {
            Ok(destination) => destination,
            Err(error) => {
                self.absorb(error)?;
                return Ok(false);
            }
        };
        match destination {
            Some(target) => {
                let reported = self.report.reported.len();
                self.move_to(target)?;
                Ok(self.report.reported.len() == reported)
            }
            None => Ok(false),
        }
    }

    /// Resize the agent's shape around its current location.
    pub fn set_extent(&mut self, half_width: f64, half_height: f64) -> Result<(), BehaviorError> {
        let center = self.agent.envelope().center();
        self.reshape(Ok(Envelope::centered(center, half_width, half_height)))
    }

    /// Move staged so far, if any.
    #[must_use]
    pub const fn staged_move(&self) -> Option<&StagedMove> {
        self.report.moved.as_ref()
    }

    fn reshape(&mut self, shape: Result<Envelope, TopologyError>) -> Result<(), BehaviorError> {
        match shape.and_then(|shape| self.topology.admit(&shape)) {
            Ok(shape) => {
                let from = self
                    .report
                    .moved
                    .map_or_else(|| self.agent.envelope(), |staged| staged.from);
                self.report.moved = Some(StagedMove { from, to: shape });
                self.agent.set_envelope(shape);
                Ok(())
            }
            Err(error) => self.absorb(error),
        }
    }

    /// Other agents of the topology within `distance` of this agent.
    ///
    /// Searches from the agent's current shape but sees other agents where they stood at
    /// the start of the population's step.
    pub fn neighbors(&self, distance: f64) -> Result<Vec<AgentHandle>, BehaviorError> {
        let me = self.handle;
        Ok(self
            .topology
            .neighbors_of(&self.agent.envelope(), distance, |handle, _| handle != me)?)
    }

    /// Queue a new agent of this population for creation after the barrier.
    pub fn spawn(&mut self, request: SpawnRequest) {
        self.report.spawns.push(request);
    }

    /// Record a non-fatal topology error without stopping the behavior.
    pub fn report(&mut self, error: TopologyError) {
        warn!(agent = ?self.handle, cycle = self.cycle.0, %error, "topology error reported");
        self.report.reported.push(error);
    }

    #[must_use]
    pub fn reported(&self) -> &[TopologyError] {
        &self.report.reported
    }

    /// Store the error that ended this agent's execution.
    pub fn set_error(&mut self, error: BehaviorError) {
        self.report.error = Some(error);
    }

    #[must_use]
    pub const fn error(&self) -> Option<&BehaviorError> {
        self.report.error.as_ref()
    }

    #[must_use]
    pub fn finish(self) -> ScopeReport {
        self.report
    }

    fn absorb(&mut self, error: TopologyError) -> Result<(), BehaviorError> {
        if error.is_structural() {
            return Err(error.into());
        }
        self.report(error);
        Ok(())
    }
}
