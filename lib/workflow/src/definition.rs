//! Workflow definitions and the registry that resolves them.
//!
//! A workflow type is identified by `(name, version)`. Once a version is
//! registered its code must not change in ways that alter the steps it
//! requests, since running instances replay against it; ship a new version
//! instead.

use crate::activity::Activity;
use crate::context::{Interrupt, WorkflowContext};
use crate::error::RegistryError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Name and version of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowType {
    pub name: String,
    pub version: u32,
}

impl WorkflowType {
    #[must_use]
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.name, self.version)
    }
}

/// Outcome of one replay pass over workflow code.
///
/// `Ok` completes the workflow with a result. `Err` either suspends the pass
/// or ends the workflow, see [`Interrupt`].
pub type WorkflowResult = Result<JsonValue, Interrupt>;

/// Deterministic orchestration code.
///
/// `run` is called from the start on every replay pass. It must derive every
/// decision from `input` and what the context reports, and reach all side
/// effects through the context.
pub trait WorkflowDefinition: Send + Sync {
    fn run(&self, ctx: &mut WorkflowContext<'_>, input: &JsonValue) -> WorkflowResult;
}

impl<F> WorkflowDefinition for F
where
    F: Fn(&mut WorkflowContext<'_>, &JsonValue) -> WorkflowResult + Send + Sync,
{
    fn run(&self, ctx: &mut WorkflowContext<'_>, input: &JsonValue) -> WorkflowResult {
        self(ctx, input)
    }
}

/// Registered workflows and activities.
///
/// Built once at startup and shared read-only by the dispatcher, the replay
/// engine and the activity executor.
#[derive(Default)]
pub struct Registry {
    workflows: HashMap<WorkflowType, Arc<dyn WorkflowDefinition>>,
    activities: HashMap<String, Arc<dyn Activity>>,
}

impl Registry {
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Looks up the definition for a workflow type.
    #[must_use]
    pub fn workflow(&self, workflow_type: &WorkflowType) -> Option<Arc<dyn WorkflowDefinition>> {
        self.workflows.get(workflow_type).cloned()
    }

    /// Looks up an activity by name.
    #[must_use]
    pub fn activity(&self, activity_type: &str) -> Option<Arc<dyn Activity>> {
        self.activities.get(activity_type).cloned()
    }

    #[must_use]
    pub fn has_workflow(&self, workflow_type: &WorkflowType) -> bool {
        self.workflows.contains_key(workflow_type)
    }

    /// Returns registered workflow types, sorted.
    #[must_use]
    pub fn workflow_types(&self) -> Vec<WorkflowType> {
        let mut types: Vec<_> = self.workflows.keys().cloned().collect();
        types.sort();
        types
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut activities: Vec<_> = self.activities.keys().collect();
        activities.sort();
        f.debug_struct("Registry")
            .field("workflows", &self.workflow_types())
            .field("activities", &activities)
            .finish()
    }
}

/// Builder for a [`Registry`].
#[derive(Default)]
pub struct RegistryBuilder {
    registry: Registry,
}

impl RegistryBuilder {
    /// Registers a workflow definition.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateWorkflow`] if this name and version is taken.
    pub fn workflow(
        mut self,
        name: impl Into<String>,
        version: u32,
        definition: impl WorkflowDefinition + 'static,
    ) -> Result<Self, RegistryError> {
        let workflow_type = WorkflowType::new(name, version);
        if self.registry.workflows.contains_key(&workflow_type) {
            return Err(RegistryError::DuplicateWorkflow { workflow_type });
        }
        self.registry
            .workflows
            .insert(workflow_type, Arc::new(definition));
        Ok(self)
    }

    /// Registers an activity.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateActivity`] if the name is taken.
    pub fn activity(
        mut self,
        name: impl Into<String>,
        activity: impl Activity + 'static,
    ) -> Result<Self, RegistryError> {
        let activity_type = name.into();
        if self.registry.activities.contains_key(&activity_type) {
            return Err(RegistryError::DuplicateActivity { activity_type });
        }
        self.registry
            .activities
            .insert(activity_type, Arc::new(activity));
        Ok(self)
    }

    #[must_use]
    pub fn build(self) -> Registry {
        self.registry
    }
}
