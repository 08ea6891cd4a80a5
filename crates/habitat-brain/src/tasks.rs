//! Task selection by weight: highest only, all in descending order, or one random draw.

use crate::{Behavior, Weight};
use habitat_core::{BehaviorError, Outcome, Scope};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    /// Run the single task with the strictly highest weight.
    #[default]
    Weighted,
    /// Run every task, highest weight first.
    Sorted,
    /// Run one task drawn with probability proportional to its weight.
    Probabilistic,
}

impl TaskMode {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Weighted => "weighted_tasks",
            Self::Sorted => "sorted_tasks",
            Self::Probabilistic => "probabilistic_tasks",
        }
    }
}

#[derive(Clone)]
pub struct Task {
    name: String,
    weight: Weight,
    body: Behavior,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("name", &self.name).finish()
    }
}

impl Task {
    pub fn new(name: impl Into<String>, weight: Weight, body: Behavior) -> Self {
        Self {
            name: name.into(),
            weight,
            body,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskSet {
    mode: TaskMode,
    tasks: Vec<Task>,
}

impl TaskSet {
    #[must_use]
    pub fn new(mode: TaskMode) -> Self {
        Self {
            mode,
            tasks: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    #[must_use]
    pub const fn mode(&self) -> TaskMode {
        self.mode
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(Task::name)
    }

    /// Evaluate every weight once, in declaration order.
    pub fn weights(&self, scope: &mut Scope<'_>) -> Result<Vec<f64>, BehaviorError> {
        self.tasks.iter().map(|task| (task.weight)(scope)).collect()
    }

    /// Index of the task the current weights select; `None` when nothing is selectable.
    pub fn select(&self, scope: &mut Scope<'_>) -> Result<Option<usize>, BehaviorError> {
        let weights = self.weights(scope)?;
        Ok(match self.mode {
            TaskMode::Weighted => strongest(&weights),
            TaskMode::Probabilistic => {
                let total = selectable_total(&weights);
                if total > 0.0 {
                    let draw = scope.rng().random::<f64>() * total;
                    pick(&weights, draw)
                } else {
                    None
                }
            }
            TaskMode::Sorted => descending(&weights).first().copied(),
        })
    }

    pub fn run(&self, scope: &mut Scope<'_>) -> Result<Outcome, BehaviorError> {
        match self.mode {
            TaskMode::Sorted => self.run_sorted(scope),
            TaskMode::Weighted | TaskMode::Probabilistic => match self.select(scope)? {
                Some(idx) => (self.tasks[idx].body)(scope),
                None => Ok(Outcome::nil()),
            },
        }
    }

    /// Weights are read once up front; tasks then run highest first until one does not pass.
    fn run_sorted(&self, scope: &mut Scope<'_>) -> Result<Outcome, BehaviorError> {
        let weights = self.weights(scope)?;
        let mut last = Outcome::nil();
        for idx in descending(&weights) {
            if scope.is_dying() {
                break;
            }
            let outcome = (self.tasks[idx].body)(scope)?;
            if !outcome.passed() {
                return Ok(outcome);
            }
            last = outcome;
        }
        Ok(last)
    }
}

/// First declared task among those with the strictly highest weight. NaN weights never win.
#[must_use]
pub fn strongest(weights: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (idx, &weight) in weights.iter().enumerate() {
        if weight.is_nan() {
            continue;
        }
        match best {
            Some((_, top)) if weight <= top => {}
            _ => best = Some((idx, weight)),
        }
    }
    best.map(|(idx, _)| idx)
}

/// Task indices by descending weight, declaration order among equals. NaN weights are dropped.
#[must_use]
pub fn descending(weights: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..weights.len()).filter(|&i| !weights[i].is_nan()).collect();
    order.sort_by(|&a, &b| weights[b].total_cmp(&weights[a]));
    order
}

fn selectable(weight: f64) -> bool {
    weight.is_finite() && weight > 0.0
}

fn selectable_total(weights: &[f64]) -> f64 {
    weights.iter().copied().filter(|&w| selectable(w)).sum()
}

/// Walk the cumulative distribution of the selectable weights until it passes `draw`.
fn pick(weights: &[f64], draw: f64) -> Option<usize> {
    let mut cumulative = 0.0;
    let mut last = None;
    for (idx, &weight) in weights.iter().enumerate() {
        if !selectable(weight) {
            continue;
        }
        cumulative += weight;
        last = Some(idx);
        if draw < cumulative {
            return last;
        }
    }
    last
}
