//! Populations: one species, its control policy, its topology and its agents.

use crate::scheduler::{CycleContext, guarded};
use crate::scope::{Scope, derive_seed};
use crate::topology::{
    AmorphousTopology, CompositeTopology, ContinuousTopology, RootTopology, Topology,
    TopologyError,
};
use crate::{AgentRecord, BehaviorError, ControlPolicy, Outcome, Value};
use habitat_index::{AgentHandle, AgentKey, Envelope, PopulationId};
use serde::{Deserialize, Serialize};
use slotmap::SlotMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Random stream used for `init_on`, kept apart from the per-cycle stream.
const INIT_STREAM: u64 = 0x1A17_0000_0000_0001;
/// Random stream used for `abort`.
const ABORT_STREAM: u64 = 0xAB07_0000_0000_0002;

/// Topology a population is created with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TopologySpec {
    /// Share the simulation's root topology directly.
    Root,
    /// Bounded plane over the root index.
    Continuous { environment: Envelope, torus: bool },
    /// Unbounded plane over the root index.
    Unbounded,
    Amorphous,
    /// Disjoint places over the root index.
    Composite { places: Vec<Envelope> },
}

impl TopologySpec {
    pub(crate) fn build(&self, root: &Arc<RootTopology>) -> Result<Topology, TopologyError> {
        Ok(match self {
            Self::Root => Topology::Root(Arc::clone(root)),
            Self::Continuous { environment, torus } => Topology::Continuous(
                ContinuousTopology::bounded(*environment, *torus, Arc::clone(root))?,
            ),
            Self::Unbounded => {
                Topology::Continuous(ContinuousTopology::unbounded(Arc::clone(root))?)
            }
            Self::Amorphous => Topology::Amorphous(AmorphousTopology::new()),
            Self::Composite { places } => Topology::Composite(CompositeTopology::new(
                places.clone(),
                Arc::clone(root),
            )?),
        })
    }
}

/// Declaration of a population to add to a simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopulationSpec {
    /// Registered species whose policy drives the agents.
    pub species: String,
    pub topology: TopologySpec,
    /// Whether agents may be stepped on several workers at once.
    pub parallel: bool,
}

impl PopulationSpec {
    #[must_use]
    pub fn new(species: impl Into<String>) -> Self {
        Self {
            species: species.into(),
            topology: TopologySpec::Root,
            parallel: true,
        }
    }

    #[must_use]
    pub fn with_topology(mut self, topology: TopologySpec) -> Self {
        self.topology = topology;
        self
    }

    /// Always step this population on the calling thread.
    #[must_use]
    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }
}

/// Live agents of one species.
pub struct Population {
    id: PopulationId,
    species: String,
    policy: Arc<dyn ControlPolicy>,
    topology: Topology,
    agents: SlotMap<AgentKey, AgentRecord>,
    next_serial: u64,
    parallel: bool,
}

impl std::fmt::Debug for Population {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Population")
            .field("id", &self.id)
            .field("species", &self.species)
            .field("policy", &self.policy.kind())
            .field("topology", &self.topology.kind())
            .field("agents", &self.agents.len())
            .finish()
    }
}

impl Population {
    pub(crate) fn new(
        id: PopulationId,
        spec: &PopulationSpec,
        policy: Arc<dyn ControlPolicy>,
        topology: Topology,
    ) -> Self {
        Self {
            id,
            species: spec.species.clone(),
            policy,
            topology,
            agents: SlotMap::with_key(),
            next_serial: 0,
            parallel: spec.parallel,
        }
    }

    #[must_use]
    pub const fn id(&self) -> PopulationId {
        self.id
    }

    #[must_use]
    pub fn species(&self) -> &str {
        &self.species
    }

    #[must_use]
    pub fn policy(&self) -> &Arc<dyn ControlPolicy> {
        &self.policy
    }

    #[must_use]
    pub const fn topology(&self) -> &Topology {
        &self.topology
    }

    #[must_use]
    pub const fn is_parallel(&self) -> bool {
        self.parallel
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    #[must_use]
    pub const fn handle(&self, key: AgentKey) -> AgentHandle {
        AgentHandle::new(self.id, key)
    }

    #[must_use]
    pub fn contains(&self, key: AgentKey) -> bool {
        self.agents.contains_key(key)
    }

    #[must_use]
    pub fn agent(&self, key: AgentKey) -> Option<&AgentRecord> {
        self.agents.get(key)
    }

    /// Mutable access for attribute edits between cycles.
    pub fn agent_mut(&mut self, key: AgentKey) -> Option<&mut AgentRecord> {
        self.agents.get_mut(key)
    }

    /// Agents in creation order.
    pub fn iter(&self) -> impl Iterator<Item = (AgentHandle, &AgentRecord)> {
        let mut agents: Vec<(AgentKey, &AgentRecord)> = self.agents.iter().collect();
        agents.sort_by_key(|(_, record)| record.serial());
        agents
            .into_iter()
            .map(move |(key, record)| (AgentHandle::new(self.id, key), record))
    }

    #[must_use]
    pub fn handles(&self) -> Vec<AgentHandle> {
        self.iter().map(|(handle, _)| handle).collect()
    }

    /// Create an agent, place it in the topology and run the policy's `init_on`.
    ///
    /// A failed placement or initialisation leaves no trace of the agent.
    pub(crate) fn create_agent(
        &mut self,
        shape: Envelope,
        attributes: BTreeMap<String, Value>,
        ctx: CycleContext<'_>,
    ) -> Result<AgentHandle, BehaviorError> {
        let serial = self.next_serial;
        let key = self
            .agents
            .insert(AgentRecord::new(serial, shape, attributes));
        let handle = self.handle(key);
        if let Err(error) = self.topology.place_agent(handle, shape) {
            self.agents.remove(key);
            return Err(error.into());
        }
        self.next_serial += 1;

        let Some(record) = self.agents.get_mut(key) else {
            return Ok(handle);
        };
        let seed = derive_seed(ctx.seed ^ INIT_STREAM, ctx.cycle.0, self.id.0, serial);
        let mut scope = Scope::new(handle, record, &self.topology, ctx.cycle, seed, ctx.interrupt);
        let policy = &self.policy;
        let result = guarded(|| policy.init_on(&mut scope));
        let report = scope.finish();
        if !report.spawns.is_empty() {
            warn!(agent = ?handle, dropped = report.spawns.len(), "spawns requested during init are ignored");
        }
        if let Some(staged) = report.moved {
            if let Err(error) = staged.apply(&self.topology, handle) {
                self.discard(key)?;
                return Err(error.into());
            }
        }
        match result {
            Ok(_) if !report.dying => {
                debug!(agent = ?handle, serial, "agent created");
                Ok(handle)
            }
            Ok(_) => {
                self.discard(key)?;
                Ok(handle)
            }
            Err(error) => {
                self.discard(key)?;
                Err(error)
            }
        }
    }

    /// Run `abort` on the agent and remove it from the topology and the population.
    ///
    /// Returns false when the agent is not (or no longer) part of the population.
    pub(crate) fn kill_agent(
        &mut self,
        key: AgentKey,
        ctx: CycleContext<'_>,
    ) -> Result<bool, TopologyError> {
        let handle = self.handle(key);
        let Some(record) = self.agents.get_mut(key) else {
            return Ok(false);
        };
        record.mark_dead();
        let seed = derive_seed(ctx.seed ^ ABORT_STREAM, ctx.cycle.0, self.id.0, record.serial());
        let mut scope = Scope::new(handle, record, &self.topology, ctx.cycle, seed, ctx.interrupt);
        let policy = &self.policy;
        if let Err(error) = guarded(|| policy.abort(&mut scope).map(|()| Outcome::nil())) {
            warn!(agent = ?handle, %error, "abort failed");
        }
        drop(scope);
        self.discard(key)?;
        debug!(agent = ?handle, "agent removed");
        Ok(true)
    }

    fn discard(&mut self, key: AgentKey) -> Result<(), TopologyError> {
        let handle = self.handle(key);
        if let Some(record) = self.agents.remove(key) {
            self.topology.remove_agent(handle, Some(&record.envelope()))?;
        }
        Ok(())
    }

    /// Live agents in creation order, with the topology and policy they run against.
    pub(crate) fn step_view(
        &mut self,
    ) -> (&Topology, &dyn ControlPolicy, Vec<(AgentKey, &mut AgentRecord)>) {
        let mut work: Vec<(AgentKey, &mut AgentRecord)> = self
            .agents
            .iter_mut()
            .filter(|(_, record)| !record.is_dead())
            .collect();
        work.sort_by_key(|(_, record)| record.serial());
        (&self.topology, self.policy.as_ref(), work)
    }

    /// Move the population under a new id and root after a merge.
    pub(crate) fn rekey(&mut self, id: PopulationId, root: Arc<RootTopology>) {
        self.id = id;
        self.topology.set_root(root);
    }

    /// Remove every agent from the topology and drop them without running `abort`.
    pub(crate) fn clear(&mut self) -> Result<usize, TopologyError> {
        let removed = self.agents.len();
        for (key, record) in self.agents.drain() {
            self.topology
                .remove_agent(AgentHandle::new(self.id, key), Some(&record.envelope()))?;
        }
        Ok(removed)
    }

    pub(crate) fn dispose(&self) {
        self.topology.dispose();
    }
}
