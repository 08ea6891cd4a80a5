//! Guarded reflexes, the stateless base every architecture runs first.

use crate::{Behavior, Guard};
use habitat_core::{BehaviorError, Outcome, Scope};
use std::fmt;

/// A named behavior that runs every cycle its guard allows.
#[derive(Clone)]
pub struct Reflex {
    name: String,
    guard: Option<Guard>,
    body: Behavior,
}

impl fmt::Debug for Reflex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reflex")
            .field("name", &self.name)
            .field("guarded", &self.guard.is_some())
            .finish()
    }
}

impl Reflex {
    pub fn new(name: impl Into<String>, body: Behavior) -> Self {
        Self {
            name: name.into(),
            guard: None,
            body,
        }
    }

    /// Only run when `guard` holds.
    #[must_use]
    pub fn when(mut self, guard: Guard) -> Self {
        self.guard = Some(guard);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn eligible(&self, scope: &mut Scope<'_>) -> Result<bool, BehaviorError> {
        match &self.guard {
            Some(guard) => guard(scope),
            None => Ok(true),
        }
    }
}

/// Init behaviors plus reflexes, both kept in declaration order.
#[derive(Clone, Default)]
pub struct ReflexSet {
    inits: Vec<Behavior>,
    reflexes: Vec<Reflex>,
}

impl fmt::Debug for ReflexSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReflexSet")
            .field("inits", &self.inits.len())
            .field("reflexes", &self.reflexes)
            .finish()
    }
}

impl ReflexSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_init(mut self, init: Behavior) -> Self {
        self.inits.push(init);
        self
    }

    #[must_use]
    pub fn with_reflex(mut self, reflex: Reflex) -> Self {
        self.reflexes.push(reflex);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.reflexes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reflexes.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.reflexes.iter().map(Reflex::name)
    }

    /// Run the init behaviors once, at agent creation.
    pub fn run_init(&self, scope: &mut Scope<'_>) -> Result<Outcome, BehaviorError> {
        let mut last = Outcome::nil();
        for init in &self.inits {
            if scope.is_dying() {
                break;
            }
            last = init(scope)?;
        }
        Ok(last)
    }

    /// Run every eligible reflex in declaration order and return the last result.
    ///
    /// Guards are evaluated just before their reflex, so an earlier reflex can enable or
    /// disable a later one within the same cycle.
    pub fn run(&self, scope: &mut Scope<'_>) -> Result<Outcome, BehaviorError> {
        let mut last = Outcome::nil();
        for reflex in &self.reflexes {
            if scope.is_dying() {
                break;
            }
            if !reflex.eligible(scope)? {
                continue;
            }
            last = (reflex.body)(scope)?;
        }
        Ok(last)
    }
}
