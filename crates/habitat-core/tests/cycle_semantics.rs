use habitat_core::{
    AgentHandle, AgentRecord, BehaviorError, ControlPolicy, CycleStatus, EngineConfig, Envelope,
    IdlePolicy, Outcome, Point, PopulationSpec, RootTopology, SchedulerError, Scope,
    Simulation, SimulationError, SpawnRequest, SpeciesRegistry, TopologyError, TopologySpec,
    Value,
};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Random walk with occasional births and deaths.
struct Wanderer;

impl ControlPolicy for Wanderer {
    fn kind(&self) -> &'static str {
        "wanderer"
    }

    fn execute_on(&self, scope: &mut Scope<'_>) -> Result<Outcome, BehaviorError> {
        let heading = scope.rng().random_range(0.0..360.0);
        let roll: f64 = scope.rng().random();
        scope.move_by(heading, 1.5)?;
        scope.set_attribute("roll", roll);
        if roll < 0.02 {
            scope.spawn(SpawnRequest::at(scope.location()).with_extent(0.5, 0.5));
        }
        if roll > 0.99 {
            scope.die();
        }
        Ok(Outcome::Passed(Value::Float(heading)))
    }
}

/// Walks, then counts who is close; turns "crowded" among three or more and calms down
/// once at most one other agent is near. Crowded agents shuffle instead of walking.
struct Crowd;

impl ControlPolicy for Crowd {
    fn kind(&self) -> &'static str {
        "crowd"
    }

    fn execute_on(&self, scope: &mut Scope<'_>) -> Result<Outcome, BehaviorError> {
        let crowded = scope.attribute("crowded").and_then(Value::as_bool).unwrap_or(false);
        let heading = scope.rng().random_range(0.0..360.0);
        scope.move_by(heading, if crowded { 1.0 } else { 3.0 })?;
        let seen = scope.neighbors(4.0)?.len() as i64;
        scope.set_attribute("seen", seen);
        if !crowded && seen >= 3 {
            scope.set_attribute("crowded", true);
        } else if crowded && seen <= 1 {
            scope.set_attribute("crowded", false);
        }
        Ok(Outcome::Passed(Value::Int(seen)))
    }
}

/// Walks east for four steps, then west for eight, counting neighbors on the way.
struct Walker;

impl ControlPolicy for Walker {
    fn kind(&self) -> &'static str {
        "walker"
    }

    fn execute_on(&self, scope: &mut Scope<'_>) -> Result<Outcome, BehaviorError> {
        let steps = scope.attribute("steps").and_then(Value::as_int).unwrap_or(0) + 1;
        scope.set_attribute("steps", steps);
        let heading = if steps <= 4 { 0.0 } else { 180.0 };
        assert!(scope.move_by(heading, 5.0)?);
        let seen = scope.neighbors(1_000.0)?.len() as i64;
        scope.set_attribute("seen", seen);
        Ok(Outcome::nil())
    }
}

/// Fails for one serial on one cycle; panics instead when `panic` is set.
struct Faulty {
    serial: u64,
    cycle: u64,
    panic: bool,
}

impl ControlPolicy for Faulty {
    fn kind(&self) -> &'static str {
        "faulty"
    }

    fn execute_on(&self, scope: &mut Scope<'_>) -> Result<Outcome, BehaviorError> {
        let steps = scope.attribute("steps").and_then(Value::as_int).unwrap_or(0) + 1;
        scope.set_attribute("steps", steps);
        if scope.agent().serial() == self.serial && scope.cycle().0 == self.cycle {
            if self.panic {
                panic!("agent {} exploded", self.serial);
            }
            return Err(BehaviorError::failed("refused to step"));
        }
        Ok(Outcome::nil())
    }
}

/// Raises the run's interrupt flag when a given serial executes.
struct Tripwire {
    flag: Arc<AtomicBool>,
    serial: u64,
}

impl ControlPolicy for Tripwire {
    fn kind(&self) -> &'static str {
        "tripwire"
    }

    fn execute_on(&self, scope: &mut Scope<'_>) -> Result<Outcome, BehaviorError> {
        if scope.agent().serial() == self.serial {
            self.flag.store(true, Ordering::Release);
        }
        Ok(Outcome::nil())
    }
}

/// Disposes the root topology, then tries to move.
struct Saboteur {
    root: Arc<RootTopology>,
}

impl ControlPolicy for Saboteur {
    fn kind(&self) -> &'static str {
        "saboteur"
    }

    fn execute_on(&self, scope: &mut Scope<'_>) -> Result<Outcome, BehaviorError> {
        self.root.dispose();
        scope.move_to(Point::new(1.0, 1.0))?;
        Ok(Outcome::nil())
    }
}

fn config(threads: usize) -> EngineConfig {
    EngineConfig {
        rng_seed: Some(0x5EED),
        worker_threads: Some(threads),
        parallel_threshold: 0,
        torus: true,
        ..EngineConfig::default()
    }
}

fn simulation(threads: usize, species: &str, policy: Arc<dyn ControlPolicy>) -> Simulation {
    let mut registry = SpeciesRegistry::new();
    registry.register(species, policy);
    Simulation::new(config(threads), registry).expect("simulation")
}

fn state(sim: &Simulation) -> Vec<(AgentHandle, AgentRecord)> {
    sim.populations()
        .iter()
        .flat_map(|p| p.iter().map(|(h, r)| (h, r.clone())))
        .collect()
}

fn run_wanderers(threads: usize) -> (Vec<(AgentHandle, AgentRecord)>, Vec<(AgentHandle, Envelope)>) {
    let mut sim = simulation(threads, "wanderer", Arc::new(Wanderer));
    let id = sim
        .add_population(PopulationSpec::new("wanderer"))
        .expect("population");
    sim.spawn_random(id, 80, 0.5).expect("spawn");
    let reports = sim.run(40).expect("run");
    assert_eq!(reports.len(), 40);
    assert!(reports.iter().all(|r| r.status == CycleStatus::Completed));
    (state(&sim), sim.snapshot_entries().expect("entries"))
}

type CrowdTrace = Vec<(Vec<(AgentHandle, AgentRecord)>, Vec<(AgentHandle, Envelope)>)>;

fn run_crowd(threads: usize) -> CrowdTrace {
    let mut registry = SpeciesRegistry::new();
    registry.register("crowd", Arc::new(Crowd));
    let settings = EngineConfig {
        rng_seed: Some(7),
        environment: Envelope::new(0.0, 0.0, 40.0, 40.0),
        ..config(threads)
    };
    let mut sim = Simulation::new(settings, registry).expect("simulation");
    let id = sim.add_population(PopulationSpec::new("crowd")).expect("population");
    sim.spawn_random(id, 400, 0.5).expect("spawn");
    (0..30)
        .map(|_| {
            let report = sim.step().expect("cycle");
            assert_eq!(report.stepped(), 400);
            (state(&sim), sim.snapshot_entries().expect("entries"))
        })
        .collect()
}

#[test]
fn neighbor_reads_while_moving_do_not_depend_on_worker_count() {
    let single = run_crowd(1);
    let pooled = run_crowd(8);
    let crowded_somewhere = single.iter().any(|(agents, _)| {
        agents
            .iter()
            .any(|(_, record)| record.attribute("crowded") == Some(&Value::Bool(true)))
    });
    assert!(crowded_somewhere);
    for (cycle, (expected, actual)) in single.iter().zip(&pooled).enumerate() {
        assert_eq!(expected, actual, "diverged at cycle {}", cycle + 1);
    }
    assert_eq!(run_crowd(8), pooled);
}

#[test]
fn worker_count_does_not_change_results() {
    let (single, single_index) = run_wanderers(1);
    let (pooled, pooled_index) = run_wanderers(4);
    assert!(!single.is_empty());
    assert_eq!(single, pooled);
    assert_eq!(single_index, pooled_index);
    for (handle, record) in &single {
        let indexed = single_index
            .iter()
            .find(|(h, _)| h == handle)
            .map(|(_, e)| *e);
        assert_eq!(indexed, Some(record.envelope()));
    }
}

fn run_faulty(panic: bool, threads: usize) {
    let policy = Faulty {
        serial: 1,
        cycle: 5,
        panic,
    };
    let mut sim = simulation(threads, "faulty", Arc::new(policy));
    let id = sim
        .add_population(PopulationSpec::new("faulty"))
        .expect("population");
    let agents: Vec<AgentHandle> = (0..3)
        .map(|i| {
            sim.create_agent(
                id,
                Envelope::around(Point::new(10.0 + 10.0 * f64::from(i), 10.0), 1.0),
                BTreeMap::new(),
            )
            .expect("agent")
        })
        .collect();

    let reports = sim.run(8).expect("faults never abort the run");
    let fault_cycles: Vec<u64> = reports
        .iter()
        .flat_map(|r| r.faults.iter().map(|f| f.cycle.0))
        .collect();
    assert_eq!(fault_cycles, vec![5]);
    let fault = &reports[4].faults[0];
    assert_eq!(fault.agent, agents[1]);
    if panic {
        assert!(matches!(fault.error, BehaviorError::Panicked(ref m) if m.contains("exploded")));
    } else {
        assert_eq!(fault.error, BehaviorError::failed("refused to step"));
    }
    assert_eq!(reports[4].populations[0].deaths, 1);

    let index = sim.root().index().expect("index");
    assert!(sim.agent(agents[1]).is_none());
    assert!(!index.contains(agents[1]));
    for sibling in [agents[0], agents[2]] {
        let record = sim.agent(sibling).expect("sibling survives");
        assert_eq!(record.attribute("steps"), Some(&Value::Int(8)));
        assert!(index.contains(sibling));
    }
}

#[test]
fn failing_agent_is_isolated() {
    run_faulty(false, 1);
    run_faulty(false, 3);
}

#[test]
fn panicking_agent_is_isolated() {
    run_faulty(true, 1);
    run_faulty(true, 3);
}

#[test]
fn interrupt_discards_unstarted_tasks() {
    let mut registry = SpeciesRegistry::new();
    registry.register("rock", Arc::new(IdlePolicy));
    let mut sim = Simulation::new(config(1), registry).expect("simulation");
    let handle = sim.interrupt_handle();
    sim.registry_mut().register(
        "tripwire",
        Arc::new(Tripwire {
            flag: Arc::clone(&handle),
            serial: 10,
        }),
    );
    let wired = sim
        .add_population(PopulationSpec::new("tripwire"))
        .expect("population");
    let rocks = sim.add_population(PopulationSpec::new("rock")).expect("population");
    sim.spawn_random(wired, 20, 0.5).expect("spawn");
    sim.spawn_random(rocks, 5, 0.5).expect("spawn");

    let report = sim.step().expect("cycle");
    assert_eq!(report.status, CycleStatus::Interrupted);
    assert_eq!(report.populations.len(), 1);
    assert_eq!(report.populations[0].stepped, 11);
    assert_eq!(report.populations[0].skipped, 9);
    assert!(sim.is_interrupted());

    sim.resume();
    let report = sim.step().expect("cycle");
    // The tripwire fires again on serial 10.
    assert!(report.is_interrupted());
    assert_eq!(report.populations[0].stepped, 11);
}

#[test]
fn disposed_topology_aborts_the_cycle() {
    let mut sim = simulation(1, "rock", Arc::new(IdlePolicy));
    let root = Arc::clone(sim.root());
    sim.registry_mut()
        .register("saboteur", Arc::new(Saboteur { root }));
    let id = sim
        .add_population(PopulationSpec::new("saboteur"))
        .expect("population");
    sim.spawn_random(id, 2, 0.5).expect("spawn");
    let error = sim.step().expect_err("structural failure");
    assert!(matches!(
        error,
        SimulationError::Scheduler(SchedulerError::Structural { .. })
    ));
    assert!(sim.step().is_err());
}

#[test]
fn amorphous_population_has_no_neighbors() {
    let mut sim = simulation(1, "rock", Arc::new(IdlePolicy));
    let id = sim
        .add_population(PopulationSpec::new("rock").with_topology(TopologySpec::Amorphous))
        .expect("population");
    sim.create_agent(id, Envelope::around(Point::new(3.0, 3.0), 1.0), BTreeMap::new())
        .expect("agent");
    let topology = sim.population(id).expect("population").topology();
    assert_eq!(
        topology.environment().expect("environment"),
        Envelope::new(0.0, 0.0, 4.0, 4.0)
    );
    assert!(
        topology
            .neighbors_of(&Envelope::around(Point::new(3.0, 3.0), 1.0), 50.0, |_, _| true)
            .expect("neighbors")
            .is_empty()
    );
    assert!(sim.snapshot_entries().expect("entries").is_empty());
}

#[test]
fn amorphous_environment_never_shrinks_as_agents_walk_back() {
    let mut sim = simulation(1, "walker", Arc::new(Walker));
    let id = sim
        .add_population(PopulationSpec::new("walker").with_topology(TopologySpec::Amorphous))
        .expect("population");
    let walkers: Vec<AgentHandle> = [Point::new(3.0, 3.0), Point::new(4.0, 2.0)]
        .into_iter()
        .map(|at| {
            sim.create_agent(id, Envelope::around(at, 1.0), BTreeMap::new())
                .expect("agent")
        })
        .collect();
    let environment = |sim: &Simulation| {
        sim.population(id)
            .expect("population")
            .topology()
            .environment()
            .expect("environment")
    };
    let mut previous = environment(&sim);
    assert_eq!(previous, Envelope::new(0.0, 0.0, 5.0, 4.0));

    for _ in 0..12 {
        sim.step().expect("cycle");
        let current = environment(&sim);
        assert!(current.covers(&previous), "{current:?} shrank from {previous:?}");
        for walker in &walkers {
            let record = sim.agent(*walker).expect("walker");
            assert!(current.covers(&record.envelope()));
            assert_eq!(record.attribute("seen"), Some(&Value::Int(0)));
        }
        previous = current;
    }

    let home = sim.agent(walkers[0]).expect("walker").location();
    assert!((home.x - -17.0).abs() < 1e-9);
    assert!(previous.min_x <= -18.0);
    assert!(previous.max_x >= 25.0);
    assert!(sim.snapshot_entries().expect("entries").is_empty());
}

#[test]
fn composite_population_rejects_spawns_between_places() {
    let mut sim = simulation(1, "rock", Arc::new(IdlePolicy));
    let id = sim
        .add_population(PopulationSpec::new("rock").with_topology(TopologySpec::Composite {
            places: vec![
                Envelope::new(0.0, 0.0, 10.0, 10.0),
                Envelope::new(50.0, 50.0, 60.0, 60.0),
            ],
        }))
        .expect("population");
    let created = sim.spawn_random(id, 10, 0.1).expect("random spawns land in places");
    assert_eq!(created.len(), 10);
    let outside = sim.create_agent(id, Envelope::around(Point::new(30.0, 30.0), 0.1), BTreeMap::new());
    assert!(matches!(outside, Err(SimulationError::Behavior(_))));
    assert_eq!(sim.population(id).expect("population").len(), 10);
}

#[test]
fn composite_population_rejects_shapes_straddling_places() {
    let mut sim = simulation(1, "rock", Arc::new(IdlePolicy));
    let id = sim
        .add_population(PopulationSpec::new("rock").with_topology(TopologySpec::Composite {
            places: vec![
                Envelope::new(0.0, 0.0, 10.0, 10.0),
                Envelope::new(10.0, 0.0, 20.0, 10.0),
            ],
        }))
        .expect("population");
    let straddling = sim.create_agent(id, Envelope::around(Point::new(9.0, 5.0), 3.0), BTreeMap::new());
    assert!(matches!(
        straddling,
        Err(SimulationError::Behavior(BehaviorError::Topology(
            TopologyError::InvalidPlacement(_)
        )))
    ));
    assert!(sim.population(id).expect("population").is_empty());
    assert!(sim.snapshot_entries().expect("entries").is_empty());

    sim.create_agent(id, Envelope::around(Point::new(5.0, 5.0), 3.0), BTreeMap::new())
        .expect("fits the left place");
    sim.create_agent(id, Envelope::around(Point::new(15.0, 5.0), 3.0), BTreeMap::new())
        .expect("fits the right place");
    assert_eq!(sim.snapshot_entries().expect("entries").len(), 2);
}
