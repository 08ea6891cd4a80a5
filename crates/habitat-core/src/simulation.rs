//! Simulation driver owning the populations, the root topology and the scheduler.

use crate::population::{Population, PopulationSpec};
use crate::scheduler::{CycleContext, CycleReport, Scheduler, SchedulerError};
use crate::topology::{RootTopology, TopologyError};
use crate::{
    AgentRecord, BehaviorError, ConfigError, Cycle, EngineConfig, SpeciesRegistry, Value,
};
use habitat_index::{AgentHandle, Envelope, PopulationId};
use rand::rngs::SmallRng;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Behavior(#[from] BehaviorError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("species {0:?} is not registered")]
    UnknownSpecies(String),
    #[error("population {0:?} does not exist")]
    UnknownPopulation(PopulationId),
    #[error("too many populations")]
    PopulationLimit,
}

/// A running simulation.
pub struct Simulation {
    config: EngineConfig,
    seed: u64,
    cycle: Cycle,
    rng: SmallRng,
    root: Arc<RootTopology>,
    registry: SpeciesRegistry,
    populations: Vec<Population>,
    scheduler: Scheduler,
    interrupt: Arc<AtomicBool>,
    history: VecDeque<CycleReport>,
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("seed", &self.seed)
            .field("cycle", &self.cycle)
            .field("populations", &self.populations)
            .field("threads", &self.scheduler.threads())
            .finish_non_exhaustive()
    }
}

impl Simulation {
    /// Instantiate a simulation using the supplied configuration and species.
    pub fn new(config: EngineConfig, registry: SpeciesRegistry) -> Result<Self, SimulationError> {
        config.validate()?;
        let seed = config.resolved_seed();
        let root = RootTopology::new(config.environment, config.torus, config.index)?;
        let scheduler = Scheduler::new(config.resolved_threads(), config.parallel_threshold)?;
        info!(
            seed,
            threads = scheduler.threads(),
            torus = config.torus,
            "simulation created"
        );
        let history_capacity = config.history_capacity;
        Ok(Self {
            rng: EngineConfig::seeded_rng(seed),
            config,
            seed,
            cycle: Cycle::zero(),
            root: Arc::new(root),
            registry,
            populations: Vec::new(),
            scheduler,
            interrupt: Arc::new(AtomicBool::new(false)),
            history: VecDeque::with_capacity(history_capacity),
        })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Seed every agent stream of this run derives from.
    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// Last completed cycle.
    #[must_use]
    pub const fn cycle(&self) -> Cycle {
        self.cycle
    }

    #[must_use]
    pub fn root(&self) -> &Arc<RootTopology> {
        &self.root
    }

    #[must_use]
    pub fn registry(&self) -> &SpeciesRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut SpeciesRegistry {
        &mut self.registry
    }

    /// Add a population of a registered species.
    pub fn add_population(&mut self, spec: PopulationSpec) -> Result<PopulationId, SimulationError> {
        let policy = self
            .registry
            .get(&spec.species)
            .ok_or_else(|| SimulationError::UnknownSpecies(spec.species.clone()))?;
        let id = PopulationId(
            u32::try_from(self.populations.len()).map_err(|_| SimulationError::PopulationLimit)?,
        );
        let topology = spec.topology.build(&self.root)?;
        info!(population = ?id, species = %spec.species, topology = topology.kind().name(), "population added");
        self.populations.push(Population::new(id, &spec, policy, topology));
        Ok(id)
    }

    #[must_use]
    pub fn populations(&self) -> &[Population] {
        &self.populations
    }

    #[must_use]
    pub fn population(&self, id: PopulationId) -> Option<&Population> {
        self.populations.get(id.0 as usize)
    }

    pub fn population_mut(&mut self, id: PopulationId) -> Option<&mut Population> {
        self.populations.get_mut(id.0 as usize)
    }

    #[must_use]
    pub fn population_by_species(&self, species: &str) -> Option<&Population> {
        self.populations.iter().find(|p| p.species() == species)
    }

    #[must_use]
    pub fn agent(&self, handle: AgentHandle) -> Option<&AgentRecord> {
        self.population(handle.population)?.agent(handle.key)
    }

    /// Live agents across every population.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.populations.iter().map(Population::len).sum()
    }

    /// Create an agent with the given shape; runs the policy's `init_on`.
    pub fn create_agent(
        &mut self,
        population: PopulationId,
        shape: Envelope,
        attributes: BTreeMap<String, Value>,
    ) -> Result<AgentHandle, SimulationError> {
        let ctx = CycleContext {
            cycle: self.cycle,
            seed: self.seed,
            interrupt: &self.interrupt,
        };
        let target = self
            .populations
            .get_mut(population.0 as usize)
            .ok_or(SimulationError::UnknownPopulation(population))?;
        Ok(target.create_agent(shape, attributes, ctx)?)
    }

    /// Create `count` agents at random valid locations of the population's topology.
    pub fn spawn_random(
        &mut self,
        population: PopulationId,
        count: usize,
        half_extent: f64,
    ) -> Result<Vec<AgentHandle>, SimulationError> {
        let mut created = Vec::with_capacity(count);
        for _ in 0..count {
            let shape = self
                .populations
                .get(population.0 as usize)
                .ok_or(SimulationError::UnknownPopulation(population))?
                .topology()
                .random_shape(&mut self.rng, half_extent)?;
            created.push(self.create_agent(population, shape, BTreeMap::new())?);
        }
        Ok(created)
    }

    /// Remove an agent, running the policy's `abort`. Unknown handles return false.
    pub fn kill_agent(&mut self, handle: AgentHandle) -> Result<bool, SimulationError> {
        let ctx = CycleContext {
            cycle: self.cycle,
            seed: self.seed,
            interrupt: &self.interrupt,
        };
        let Some(population) = self.populations.get_mut(handle.population.0 as usize) else {
            return Ok(false);
        };
        Ok(population.kill_agent(handle.key, ctx)?)
    }

    /// Drop every agent of a population without running `abort`.
    pub fn clear_population(&mut self, id: PopulationId) -> Result<usize, SimulationError> {
        let population = self
            .populations
            .get_mut(id.0 as usize)
            .ok_or(SimulationError::UnknownPopulation(id))?;
        Ok(population.clear()?)
    }

    /// Execute one cycle over every population.
    ///
    /// An interrupted cycle still counts: whatever was committed before the interrupt
    /// stays committed.
    pub fn step(&mut self) -> Result<CycleReport, SimulationError> {
        if self.root.is_disposed() {
            return Err(TopologyError::Disposed.into());
        }
        let next = self.cycle.next();
        let ctx = CycleContext {
            cycle: next,
            seed: self.seed,
            interrupt: &self.interrupt,
        };
        let report = self.scheduler.step_cycle(&mut self.populations, ctx)?;
        self.cycle = next;
        debug!(
            cycle = next.0,
            stepped = report.stepped(),
            faults = report.faults.len(),
            "cycle complete"
        );
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(report.clone());
        Ok(report)
    }

    /// Step up to `cycles` cycles, stopping after an interrupted one.
    pub fn run(&mut self, cycles: u64) -> Result<Vec<CycleReport>, SimulationError> {
        let mut reports = Vec::new();
        for _ in 0..cycles {
            let report = self.step()?;
            let interrupted = report.is_interrupted();
            reports.push(report);
            if interrupted {
                break;
            }
        }
        Ok(reports)
    }

    /// Flag another thread can set to interrupt the running cycle.
    #[must_use]
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::Release);
    }

    /// Clear the interrupt flag so later cycles run again.
    pub fn resume(&self) {
        self.interrupt.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Acquire)
    }

    /// Iterate over retained cycle reports.
    pub fn history(&self) -> impl Iterator<Item = &CycleReport> {
        self.history.iter()
    }

    /// Resize the root environment; the index is rebuilt over the new bounds.
    pub fn update_environment(&mut self, bounds: Envelope) -> Result<(), SimulationError> {
        self.root.update_environment(bounds)?;
        self.config.environment = bounds;
        Ok(())
    }

    /// Every indexed `(handle, shape)` pair, ordered by handle.
    pub fn snapshot_entries(&self) -> Result<Vec<(AgentHandle, Envelope)>, SimulationError> {
        Ok(self.root.index()?.entries())
    }

    /// Re-insert indexed shapes, e.g. after [`Simulation::snapshot_entries`].
    pub fn restore_entries(
        &self,
        entries: Vec<(AgentHandle, Envelope)>,
    ) -> Result<usize, SimulationError> {
        let index = self.root.index()?;
        Ok(index.reinsert(entries).map_err(TopologyError::from)?)
    }

    /// Take over every population of `other`, re-keying them after this simulation's own.
    ///
    /// `other`'s root topology is disposed. Returns the number of index entries moved.
    pub fn absorb(&mut self, mut other: Simulation) -> Result<usize, SimulationError> {
        let offset = u32::try_from(self.populations.len())
            .map_err(|_| SimulationError::PopulationLimit)?;
        let incoming = u32::try_from(other.populations.len())
            .map_err(|_| SimulationError::PopulationLimit)?;
        if offset.checked_add(incoming).is_none() {
            return Err(SimulationError::PopulationLimit);
        }
        let moved = self.root.merge_with(&other.root, |handle| {
            AgentHandle::new(PopulationId(handle.population.0 + offset), handle.key)
        })?;
        for mut population in other.populations.drain(..) {
            let id = PopulationId(population.id().0 + offset);
            population.rekey(id, Arc::clone(&self.root));
            self.populations.push(population);
        }
        self.registry.absorb(std::mem::take(&mut other.registry));
        info!(moved, populations = self.populations.len(), "simulation absorbed");
        Ok(moved)
    }

    /// Dispose every topology. Later cycles fail with [`TopologyError::Disposed`].
    pub fn dispose(&mut self) {
        for population in &self.populations {
            population.dispose();
        }
        self.root.dispose();
        info!(cycle = self.cycle.0, "simulation disposed");
    }
}
