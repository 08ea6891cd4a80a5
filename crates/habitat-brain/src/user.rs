//! User-interaction phase layered on top of a state machine.

use crate::Behavior;
use habitat_core::{BehaviorError, Outcome, Scope, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Default attribute switching the user phase on and off. A missing attribute counts as on.
pub const USER_CONTROLLED_ATTRIBUTE: &str = "user_controlled";
/// Set once the one-shot user init has run for an agent.
pub const USER_INITIALIZED_ATTRIBUTE: &str = "user_initialized";

/// Where the user phase goes relative to the automatic phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserPlacement {
    First,
    Last,
    /// The user phase replaces the automatic phase while the gate is on.
    Only,
}

impl UserPlacement {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::First => "user_first",
            Self::Last => "user_last",
            Self::Only => "user_only",
        }
    }
}

#[derive(Clone)]
pub struct UserGate {
    placement: UserPlacement,
    attribute: String,
    init: Option<Behavior>,
    panel: Behavior,
}

impl fmt::Debug for UserGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserGate")
            .field("placement", &self.placement)
            .field("attribute", &self.attribute)
            .field("init", &self.init.is_some())
            .finish()
    }
}

impl UserGate {
    /// `panel` is the user-interaction phase, typically draining commands queued by a front end.
    #[must_use]
    pub fn new(placement: UserPlacement, panel: Behavior) -> Self {
        Self {
            placement,
            attribute: USER_CONTROLLED_ATTRIBUTE.to_owned(),
            init: None,
            panel,
        }
    }

    /// Runs once per agent, before anything else, the first time the gate is on.
    #[must_use]
    pub fn with_init(mut self, init: Behavior) -> Self {
        self.init = Some(init);
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = attribute.into();
        self
    }

    #[must_use]
    pub const fn placement(&self) -> UserPlacement {
        self.placement
    }

    #[must_use]
    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    /// Whether the user phase is active for the agent behind `scope`.
    #[must_use]
    pub fn is_active(&self, scope: &Scope<'_>) -> bool {
        scope
            .attribute(&self.attribute)
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }

    /// Run one step, interleaving the user phase with `automatic` according to the placement.
    pub fn run<F>(&self, scope: &mut Scope<'_>, automatic: F) -> Result<Outcome, BehaviorError>
    where
        F: FnOnce(&mut Scope<'_>) -> Result<Outcome, BehaviorError>,
    {
        if !self.is_active(scope) {
            return automatic(scope);
        }
        if let Some(init) = &self.init {
            let done = scope
                .attribute(USER_INITIALIZED_ATTRIBUTE)
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if !done {
                scope.set_attribute(USER_INITIALIZED_ATTRIBUTE, true);
                debug!(agent = ?scope.handle(), "user control initialized");
                init(scope)?;
                if scope.is_dying() {
                    return Ok(Outcome::nil());
                }
            }
        }
        match self.placement {
            UserPlacement::Only => (self.panel)(scope),
            UserPlacement::First => {
                let outcome = (self.panel)(scope)?;
                if scope.is_dying() {
                    return Ok(outcome);
                }
                automatic(scope)
            }
            UserPlacement::Last => {
                let outcome = automatic(scope)?;
                if scope.is_dying() {
                    return Ok(outcome);
                }
                (self.panel)(scope)
            }
        }
    }
}
