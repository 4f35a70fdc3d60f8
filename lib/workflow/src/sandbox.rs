//! Isolation boundary between workflow code and nondeterministic capabilities.
//!
//! Workflow code only ever sees a [`WorkflowContext`](crate::context::WorkflowContext),
//! which has no clock, randomness, network or filesystem handle. This module
//! covers the remaining hole: a capability reached some other way (a captured
//! client, a global) while the replay engine is running workflow code.
//!
//! The replay engine runs workflow code synchronously inside a
//! [`DeterministicScope`]. Every guarded capability calls [`ensure_allowed`]
//! first; inside a scope the call fails and the violation is recorded on the
//! scope, so the engine fails the task even if the workflow swallows the error.

use crate::error::DeterminismViolation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use ulid::Ulid;

/// A nondeterministic capability workflow code must not touch directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Reading the real time.
    WallClock,
    /// Unseeded randomness.
    Randomness,
    /// Any network call, including the internal API socket.
    Network,
    /// Filesystem access.
    Filesystem,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::WallClock => "wall clock",
            Self::Randomness => "randomness",
            Self::Network => "network",
            Self::Filesystem => "filesystem",
        };
        f.write_str(name)
    }
}

struct ScopeState {
    workflow: String,
    violations: Vec<DeterminismViolation>,
}

thread_local! {
    static SCOPE: RefCell<Option<ScopeState>> = const { RefCell::new(None) };
}

/// Fails if called from inside a deterministic scope.
///
/// # Errors
///
/// Returns [`DeterminismViolation::RestrictedCapability`] when workflow code
/// is currently executing on this thread.
pub fn ensure_allowed(capability: Capability) -> Result<(), DeterminismViolation> {
    SCOPE.with(|scope| {
        let mut scope = scope.borrow_mut();
        match scope.as_mut() {
            None => Ok(()),
            Some(state) => {
                let violation = DeterminismViolation::RestrictedCapability {
                    workflow: state.workflow.clone(),
                    capability,
                };
                state.violations.push(violation.clone());
                Err(violation)
            }
        }
    })
}

/// Returns true while workflow code is executing on this thread.
#[must_use]
pub fn is_restricted() -> bool {
    SCOPE.with(|scope| scope.borrow().is_some())
}

/// Reads the real time, recording a violation inside a deterministic scope.
#[must_use]
pub fn wall_clock_now() -> DateTime<Utc> {
    let _ = ensure_allowed(Capability::WallClock);
    Utc::now()
}

/// Draws unseeded randomness, recording a violation inside a deterministic scope.
#[must_use]
pub fn random_u64() -> u64 {
    let _ = ensure_allowed(Capability::Randomness);
    Ulid::new().random() as u64
}

/// Marks the current thread as running deterministic workflow code.
///
/// Dropping the scope restores whatever scope was active before.
pub struct DeterministicScope {
    previous: Option<ScopeState>,
    finished: bool,
}

impl DeterministicScope {
    /// Enters a scope for the named workflow.
    #[must_use]
    pub fn enter(workflow: impl Into<String>) -> Self {
        let state = ScopeState {
            workflow: workflow.into(),
            violations: Vec::new(),
        };
        let previous = SCOPE.with(|scope| scope.borrow_mut().replace(state));
        Self {
            previous,
            finished: false,
        }
    }

    /// Leaves the scope, returning every violation recorded inside it.
    #[must_use]
    pub fn finish(mut self) -> Vec<DeterminismViolation> {
        self.finished = true;
        let previous = self.previous.take();
        SCOPE.with(|scope| {
            let current = std::mem::replace(&mut *scope.borrow_mut(), previous);
            current.map(|state| state.violations).unwrap_or_default()
        })
    }
}

impl Drop for DeterministicScope {
    fn drop(&mut self) {
        if !self.finished {
            let previous = self.previous.take();
            SCOPE.with(|scope| *scope.borrow_mut() = previous);
        }
    }
}
