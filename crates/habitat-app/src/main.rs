use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use habitat_brain::{
    ControlArchitecture, Reflex, ReflexSet, State, StateMachine, Task, TaskMode, TaskSet,
    UserGate, UserPlacement, behavior, fixed_weight, guard, weight,
};
use habitat_core::{
    EngineConfig, Envelope, Outcome, PopulationSpec, Simulation, SpawnRequest, SpeciesRegistry,
    Value,
};
use rand::Rng;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "habitat-headless",
    version,
    about = "Run a habitat demo model without a front end"
)]
struct Cli {
    /// JSON engine configuration; defaults apply when omitted.
    #[arg(long, env = "HABITAT_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long, default_value_t = 200)]
    cycles: u64,
    /// Overrides `rng_seed` from the configuration.
    #[arg(long)]
    seed: Option<u64>,
    /// Overrides `worker_threads` from the configuration.
    #[arg(long)]
    threads: Option<usize>,
    #[arg(long, default_value_t = 300)]
    grazers: usize,
    #[arg(long, default_value_t = 100)]
    foragers: usize,
    #[arg(long, default_value_t = 12)]
    rangers: usize,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let mut sim = Simulation::new(config, demo_species()?).context("building simulation")?;
    info!(seed = sim.seed(), "simulation ready");

    populate(&mut sim, &cli)?;

    let started = Instant::now();
    for _ in 0..cli.cycles {
        let report = sim.step()?;
        let births: usize = report.populations.iter().map(|p| p.births).sum();
        let deaths: usize = report.populations.iter().map(|p| p.deaths).sum();
        debug!(
            cycle = report.cycle.0,
            agents = sim.agent_count(),
            stepped = report.stepped(),
            births,
            deaths,
            "cycle complete"
        );
        for fault in &report.faults {
            warn!(
                agent = ?fault.agent,
                cycle = fault.cycle.0,
                error = %fault.error,
                "agent removed"
            );
        }
        if report.is_interrupted() {
            warn!(cycle = report.cycle.0, "run interrupted");
            break;
        }
    }

    for population in sim.populations() {
        info!(species = population.species(), live = population.len(), "final population");
    }
    info!(
        cycles = sim.cycle().0,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "run finished"
    );
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            EngineConfig::from_json_str(&raw)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => EngineConfig::default(),
    };
    if cli.seed.is_some() {
        config.rng_seed = cli.seed;
    }
    if cli.threads.is_some() {
        config.worker_threads = cli.threads;
    }
    config.validate()?;
    Ok(config)
}

fn populate(sim: &mut Simulation, cli: &Cli) -> Result<()> {
    let grazers = sim.add_population(PopulationSpec::new("grazer"))?;
    let foragers = sim.add_population(PopulationSpec::new("forager"))?;
    let rangers = sim.add_population(PopulationSpec::new("ranger").sequential())?;
    sim.spawn_random(grazers, cli.grazers, 0.5)?;
    sim.spawn_random(foragers, cli.foragers, 0.5)?;

    let environment = sim.root().environment()?;
    for i in 0..cli.rangers {
        let x = environment.min_x + environment.width() * (i as f64 + 0.5) / cli.rangers as f64;
        let shape = Envelope::around(habitat_core::Point::new(x, environment.center().y), 0.5);
        let mut attributes = BTreeMap::new();
        attributes.insert("user_controlled".to_owned(), Value::Bool(i % 2 == 0));
        sim.create_agent(rangers, shape, attributes)?;
    }
    Ok(())
}

fn energy(scope: &habitat_core::Scope<'_>) -> f64 {
    scope.attribute("energy").and_then(Value::as_f64).unwrap_or(0.0)
}

fn demo_species() -> Result<SpeciesRegistry> {
    let mut registry = SpeciesRegistry::new();
    registry.register("grazer", grazer()?.into_policy());
    registry.register("forager", forager().into_policy());
    registry.register("ranger", ranger()?.into_policy());
    Ok(registry)
}

/// Eats until full, roams and breeds, starves when it runs out of energy.
fn grazer() -> Result<ControlArchitecture> {
    let reflexes = ReflexSet::new()
        .with_init(behavior(|scope| {
            scope.set_attribute("energy", 8.0);
            Ok(Outcome::nil())
        }))
        .with_reflex(Reflex::new(
            "metabolism",
            behavior(|scope| {
                let left = energy(scope) - 0.5;
                scope.set_attribute("energy", left);
                Ok(Outcome::Passed(Value::Float(left)))
            }),
        ))
        .with_reflex(
            Reflex::new(
                "starve",
                behavior(|scope| {
                    scope.die();
                    Ok(Outcome::nil())
                }),
            )
            .when(guard(|scope| Ok(energy(scope) <= 0.0))),
        );
    let machine = StateMachine::new(vec![
        State::new("graze")
            .body(behavior(|scope| {
                let meal = scope.rng().random_range(0.0..1.5);
                let fed = energy(scope) + meal;
                scope.set_attribute("energy", fed);
                Ok(Outcome::nil())
            }))
            .transition("roam", guard(|scope| Ok(energy(scope) > 12.0))),
        State::new("roam")
            .body(behavior(|scope| {
                let heading = scope.rng().random_range(0.0..360.0);
                scope.move_by(heading, 2.0)?;
                if energy(scope) > 14.0 && scope.rng().random::<f64>() < 0.1 {
                    let left = energy(scope) - 8.0;
                    scope.set_attribute("energy", left);
                    let at = scope.location();
                    scope.spawn(SpawnRequest::at(at).with_extent(0.5, 0.5));
                }
                Ok(Outcome::nil())
            }))
            .transition("graze", guard(|scope| Ok(energy(scope) < 6.0))),
    ])?;
    Ok(ControlArchitecture::state_machine(reflexes, machine))
}

/// Picks an errand at random; resting gets likelier as the forager tires.
fn forager() -> ControlArchitecture {
    let walk = |distance: f64| {
        behavior(move |scope| {
            let heading = scope.rng().random_range(0.0..360.0);
            let moved = scope.move_by(heading, distance)?;
            let fatigue = scope.attribute("fatigue").and_then(Value::as_f64).unwrap_or(0.0);
            scope.set_attribute("fatigue", fatigue + distance);
            Ok(if moved {
                Outcome::nil()
            } else {
                Outcome::NotPassed(Value::Nil)
            })
        })
    };
    let tasks = TaskSet::new(TaskMode::Probabilistic)
        .with_task(Task::new("stroll", fixed_weight(3.0), walk(1.0)))
        .with_task(Task::new("dash", fixed_weight(0.5), walk(4.0)))
        .with_task(Task::new(
            "rest",
            weight(|scope| {
                let fatigue = scope.attribute("fatigue").and_then(Value::as_f64);
                Ok(fatigue.unwrap_or(0.0) / 10.0)
            }),
            behavior(|scope| {
                scope.set_attribute("fatigue", 0.0);
                Ok(Outcome::nil())
            }),
        ));
    ControlArchitecture::tasks(ReflexSet::new(), tasks)
}

/// Patrols on its own unless piloted; piloted rangers steer back toward the middle.
fn ranger() -> Result<ControlArchitecture> {
    let machine = StateMachine::new(vec![State::new("patrol").body(behavior(|scope| {
        let heading = scope.rng().random_range(0.0..360.0);
        scope.move_by(heading, 1.0)?;
        Ok(Outcome::nil())
    }))])?;
    let gate = UserGate::new(
        UserPlacement::Last,
        behavior(|scope| {
            let home = scope.topology().environment()?.center();
            let heading = scope.topology().direction_to(&scope.location(), &home)?;
            scope.move_by(heading, 0.5)?;
            Ok(Outcome::nil())
        }),
    )
    .with_init(behavior(|scope| {
        let since = scope.cycle().0 as i64;
        scope.set_attribute("piloted_since", since);
        Ok(Outcome::nil())
    }));
    Ok(ControlArchitecture::user_controlled(
        ReflexSet::new(),
        machine,
        gate,
    ))
}
