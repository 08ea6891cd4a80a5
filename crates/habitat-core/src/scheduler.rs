//! Cycle scheduler: steps every live agent once per cycle on a bounded worker pool.
//!
//! Populations are stepped one after another. Inside a population, agent tasks run
//! concurrently against the index as it stood when the population's step began, and all of
//! them finish before anything they requested (moves, deaths, births) is committed in the
//! population's creation order. Faults stay with the agent that raised them; only
//! structural topology failures abort the cycle.

use crate::population::Population;
use crate::scope::{Scope, ScopeReport, derive_seed};
use crate::topology::Topology;
use crate::{AgentRecord, BehaviorError, ControlPolicy, Cycle, Outcome};
use habitat_index::{AgentHandle, AgentKey, PopulationId};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

/// Run-wide inputs shared by every task of a cycle.
#[derive(Debug, Clone, Copy)]
pub struct CycleContext<'a> {
    pub cycle: Cycle,
    pub seed: u64,
    pub interrupt: &'a AtomicBool,
}

impl CycleContext<'_> {
    #[must_use]
    pub fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Acquire)
    }
}

/// Whether a cycle ran to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStatus {
    Completed,
    /// The interrupt flag was observed; remaining tasks were discarded.
    Interrupted,
}

/// A behavior failure isolated to one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentFault {
    pub agent: AgentHandle,
    pub cycle: Cycle,
    pub error: BehaviorError,
}

/// Per-population counters for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PopulationReport {
    pub population: PopulationId,
    pub species: String,
    /// Live agents in the cycle-start snapshot.
    pub live: usize,
    pub stepped: usize,
    /// Tasks discarded because of an interrupt.
    pub skipped: usize,
    pub births: usize,
    pub rejected_births: usize,
    pub deaths: usize,
    pub faults: usize,
    /// Non-fatal topology errors reported from scopes.
    pub reported: usize,
}

/// Summary of one stepped cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub cycle: Cycle,
    pub status: CycleStatus,
    pub populations: Vec<PopulationReport>,
    pub faults: Vec<AgentFault>,
}

impl CycleReport {
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.status == CycleStatus::Interrupted
    }

    /// Agents stepped across all populations.
    #[must_use]
    pub fn stepped(&self) -> usize {
        self.populations.iter().map(|p| p.stepped).sum()
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to build worker pool: {0}")]
    Pool(String),
    #[error("structural failure in population {population:?} during cycle {cycle}: {error}")]
    Structural {
        population: PopulationId,
        cycle: u64,
        error: BehaviorError,
    },
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Run a behavior, turning a panic into [`BehaviorError::Panicked`].
pub(crate) fn guarded<F>(behavior: F) -> Result<Outcome, BehaviorError>
where
    F: FnOnce() -> Result<Outcome, BehaviorError>,
{
    panic::catch_unwind(AssertUnwindSafe(behavior))
        .unwrap_or_else(|payload| Err(BehaviorError::Panicked(panic_message(payload.as_ref()))))
}

struct TaskResult {
    key: AgentKey,
    executed: bool,
    report: ScopeReport,
}

fn run_task(
    population: PopulationId,
    key: AgentKey,
    record: &mut AgentRecord,
    topology: &Topology,
    policy: &dyn ControlPolicy,
    ctx: CycleContext<'_>,
) -> TaskResult {
    if ctx.interrupted() {
        return TaskResult {
            key,
            executed: false,
            report: ScopeReport::default(),
        };
    }
    let handle = AgentHandle::new(population, key);
    let seed = derive_seed(ctx.seed, ctx.cycle.0, population.0, record.serial());
    let mut scope = Scope::new(handle, record, topology, ctx.cycle, seed, ctx.interrupt);
    if let Err(error) = guarded(|| policy.execute_on(&mut scope)) {
        scope.set_error(error);
    }
    TaskResult {
        key,
        executed: true,
        report: scope.finish(),
    }
}

/// Steps populations on an optional rayon pool.
///
/// With one worker no pool is built and every task runs on the calling thread.
#[derive(Debug)]
pub struct Scheduler {
    pool: Option<ThreadPool>,
    threads: usize,
    parallel_threshold: usize,
}

impl Scheduler {
    pub fn new(threads: usize, parallel_threshold: usize) -> Result<Self, SchedulerError> {
        let threads = threads.max(1);
        let pool = if threads > 1 {
            let pool = ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|i| format!("habitat-worker-{i}"))
                .build()
                .map_err(|err| SchedulerError::Pool(err.to_string()))?;
            Some(pool)
        } else {
            None
        };
        Ok(Self {
            pool,
            threads,
            parallel_threshold,
        })
    }

    #[must_use]
    pub const fn threads(&self) -> usize {
        self.threads
    }

    #[must_use]
    pub const fn parallel_threshold(&self) -> usize {
        self.parallel_threshold
    }

    /// Step every population once.
    ///
    /// The interrupt flag is checked before each population and before each agent task.
    pub fn step_cycle(
        &self,
        populations: &mut [Population],
        ctx: CycleContext<'_>,
    ) -> Result<CycleReport, SchedulerError> {
        let mut report = CycleReport {
            cycle: ctx.cycle,
            status: CycleStatus::Completed,
            populations: Vec::with_capacity(populations.len()),
            faults: Vec::new(),
        };
        for population in populations.iter_mut() {
            if ctx.interrupted() {
                report.status = CycleStatus::Interrupted;
                break;
            }
            let (summary, faults) = self.step_population(population, ctx)?;
            let skipped = summary.skipped > 0;
            report.populations.push(summary);
            report.faults.extend(faults);
            if skipped {
                report.status = CycleStatus::Interrupted;
                break;
            }
        }
        if report.is_interrupted() {
            warn!(cycle = ctx.cycle.0, "cycle interrupted");
        }
        Ok(report)
    }

    fn step_population(
        &self,
        population: &mut Population,
        ctx: CycleContext<'_>,
    ) -> Result<(PopulationReport, Vec<AgentFault>), SchedulerError> {
        let id = population.id();
        let parallel_allowed = population.is_parallel();
        let mut summary = PopulationReport {
            population: id,
            species: population.species().to_owned(),
            ..PopulationReport::default()
        };

        let results: Vec<TaskResult> = {
            let (topology, policy, mut work) = population.step_view();
            summary.live = work.len();
            let run = |(key, record): &mut (AgentKey, &mut AgentRecord)| {
                run_task(id, *key, record, topology, policy, ctx)
            };
            match &self.pool {
                Some(pool) if parallel_allowed && work.len() > self.parallel_threshold => {
                    trace!(population = ?id, live = work.len(), "stepping in parallel");
                    pool.install(|| work.par_iter_mut().map(run).collect())
                }
                _ => work.iter_mut().map(run).collect(),
            }
        };

        // Barrier passed: commit in creation order.
        let mut faults = Vec::new();
        let mut structural: Option<BehaviorError> = None;
        let mut doomed = Vec::new();
        let mut births = Vec::new();
        for task in results {
            if !task.executed {
                summary.skipped += 1;
                continue;
            }
            summary.stepped += 1;
            let handle = AgentHandle::new(id, task.key);
            let ScopeReport {
                dying,
                mut error,
                reported,
                spawns,
                moved,
            } = task.report;
            summary.reported += reported.len();
            if let Some(staged) = moved {
                if let Err(failed) = staged.apply(population.topology(), handle) {
                    error.get_or_insert(failed.into());
                }
            }
            if let Some(error) = error {
                if error.is_structural() {
                    error!(agent = ?handle, cycle = ctx.cycle.0, %error, "structural failure");
                    structural.get_or_insert(error);
                } else {
                    warn!(agent = ?handle, cycle = ctx.cycle.0, %error, "agent fault isolated");
                    faults.push(AgentFault {
                        agent: handle,
                        cycle: ctx.cycle,
                        error,
                    });
                    doomed.push(task.key);
                    continue;
                }
            }
            if dying {
                doomed.push(task.key);
            }
            births.extend(spawns);
        }
        summary.faults = faults.len();

        for key in doomed {
            match population.kill_agent(key, ctx) {
                Ok(true) => summary.deaths += 1,
                Ok(false) => {}
                Err(error) => {
                    structural.get_or_insert(error.into());
                }
            }
        }
        for request in births {
            match population.create_agent(request.shape, request.attributes, ctx) {
                Ok(_) => summary.births += 1,
                Err(error) if error.is_structural() => {
                    structural.get_or_insert(error);
                }
                Err(error) => {
                    summary.rejected_births += 1;
                    warn!(population = ?id, %error, "spawn rejected");
                }
            }
        }

        if let Some(error) = structural {
            return Err(SchedulerError::Structural {
                population: id,
                cycle: ctx.cycle.0,
                error,
            });
        }
        debug!(
            population = ?id,
            stepped = summary.stepped,
            births = summary.births,
            deaths = summary.deaths,
            faults = summary.faults,
            "population stepped"
        );
        Ok((summary, faults))
    }
}
