use habitat_brain::{
    ControlArchitecture, ReflexSet, State, StateMachine, Task, TaskMode, TaskSet, behavior,
    fixed_weight, guard,
};
use habitat_core::{
    AgentHandle, BehaviorError, EngineConfig, Envelope, Outcome, Point, PopulationSpec,
    Simulation, SpeciesRegistry, Value,
};
use rand::Rng;
use std::collections::BTreeMap;

fn chance(p: f64) -> habitat_brain::Guard {
    guard(move |scope| Ok(scope.rng().random::<f64>() < p))
}

/// Restless grazers wander between three states on coin flips.
fn grazer() -> ControlArchitecture {
    let machine = StateMachine::new(vec![
        State::new("rest").transition("walk", chance(0.4)),
        State::new("walk")
            .body(behavior(|scope| {
                let heading = scope.rng().random_range(0.0..360.0);
                scope.move_by(heading, 1.0)?;
                Ok(Outcome::nil())
            }))
            .transition("flee", chance(0.05))
            .transition("rest", chance(0.3)),
        State::new("flee").transition("rest", chance(0.5)),
    ])
    .expect("grazer states");
    ControlArchitecture::state_machine(ReflexSet::new(), machine)
}

fn choosing(name: &'static str) -> habitat_brain::Behavior {
    behavior(move |scope| {
        scope.set_attribute("choice", name);
        Ok(Outcome::nil())
    })
}

/// Picks one of three errands at random each cycle.
fn forager() -> ControlArchitecture {
    let tasks = TaskSet::new(TaskMode::Probabilistic)
        .with_task(Task::new("seek", fixed_weight(2.0), choosing("seek")))
        .with_task(Task::new("hide", fixed_weight(0.0), choosing("hide")))
        .with_task(Task::new("drink", fixed_weight(1.0), choosing("drink")))
        .with_task(Task::new("nap", fixed_weight(0.5), choosing("nap")));
    ControlArchitecture::tasks(ReflexSet::new(), tasks)
}

fn simulation(threads: usize) -> Simulation {
    let mut registry = SpeciesRegistry::new();
    registry.register("grazer", grazer().into_policy());
    registry.register("forager", forager().into_policy());
    let config = EngineConfig {
        rng_seed: Some(0xC0FFEE),
        worker_threads: Some(threads),
        parallel_threshold: 0,
        ..EngineConfig::default()
    };
    Simulation::new(config, registry).expect("simulation")
}

/// Per cycle, every agent's (serial, state or choice) in population order.
fn trace(threads: usize) -> Vec<Vec<(u64, String)>> {
    let mut sim = simulation(threads);
    let grazers = sim.add_population(PopulationSpec::new("grazer")).expect("population");
    let foragers = sim.add_population(PopulationSpec::new("forager")).expect("population");
    sim.spawn_random(grazers, 40, 0.5).expect("spawn");
    sim.spawn_random(foragers, 40, 0.5).expect("spawn");

    let mut trace = Vec::with_capacity(100);
    for _ in 0..100 {
        sim.step().expect("cycle");
        let cycle = sim
            .populations()
            .iter()
            .flat_map(|population| {
                population.iter().map(|(_, record)| {
                    let label = record
                        .attribute("state")
                        .or_else(|| record.attribute("choice"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_owned();
                    (record.serial(), label)
                })
            })
            .collect();
        trace.push(cycle);
    }
    trace
}

#[test]
fn state_sequences_and_draws_ignore_thread_count() {
    let single = trace(1);
    let pooled = trace(4);
    assert_eq!(single.len(), 100);
    assert_eq!(single, pooled);

    let labels: std::collections::BTreeSet<&str> = single
        .iter()
        .flatten()
        .map(|(_, label)| label.as_str())
        .collect();
    for expected in ["rest", "walk", "flee", "seek", "drink", "nap"] {
        assert!(labels.contains(expected), "{expected} never observed");
    }
    assert!(!labels.contains("hide"));
}

#[test]
fn faulty_agent_is_removed_while_siblings_keep_stepping() {
    let machine = StateMachine::new(vec![State::new("work").body(behavior(|scope| {
        let steps = scope.attribute("steps").and_then(Value::as_int).unwrap_or(0) + 1;
        scope.set_attribute("steps", steps);
        if scope.agent().serial() == 1 && scope.cycle().0 == 5 {
            return Err(BehaviorError::failed("agent two gave up"));
        }
        Ok(Outcome::nil())
    }))])
    .expect("machine");
    let mut registry = SpeciesRegistry::new();
    registry.register(
        "worker",
        ControlArchitecture::state_machine(ReflexSet::new(), machine).into_policy(),
    );
    let config = EngineConfig {
        rng_seed: Some(5),
        worker_threads: Some(2),
        parallel_threshold: 0,
        ..EngineConfig::default()
    };
    let mut sim = Simulation::new(config, registry).expect("simulation");
    let id = sim.add_population(PopulationSpec::new("worker")).expect("population");
    let agents: Vec<AgentHandle> = [10.0, 20.0, 30.0]
        .into_iter()
        .map(|x| {
            sim.create_agent(id, Envelope::around(Point::new(x, 10.0), 1.0), BTreeMap::new())
                .expect("agent")
        })
        .collect();

    let reports = sim.run(8).expect("run");
    assert_eq!(reports[4].faults.len(), 1);
    assert_eq!(reports[4].faults[0].agent, agents[1]);
    assert_eq!(reports[4].populations[0].stepped, 3);
    for report in &reports[5..] {
        assert!(report.faults.is_empty());
        assert_eq!(report.populations[0].stepped, 2);
    }

    let index = sim.root().index().expect("index");
    assert!(sim.agent(agents[1]).is_none());
    assert!(!index.contains(agents[1]));
    for sibling in [agents[0], agents[2]] {
        let record = sim.agent(sibling).expect("sibling");
        assert_eq!(record.attribute("steps"), Some(&Value::Int(8)));
        assert_eq!(record.attribute("state"), Some(&Value::from("work")));
        assert!(index.contains(sibling));
    }
}
