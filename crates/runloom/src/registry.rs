//! In-memory workflow registry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::json;

use crate::cron::CronSchedule;
use crate::definition::WorkflowDefinition;
use crate::error::{Error, Result};

/// Registry mapping workflow ids to their definitions.
///
/// Definitions are registered from user code and shared immutably across
/// dispatcher workers; the registry is expected to be quiescent once the
/// engine starts. Reads take a shared lock, registration a write lock.
#[derive(Default)]
pub struct WorkflowRegistry {
    entries: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition.
    ///
    /// Fails on duplicate workflow ids, duplicate step ids within the step
    /// list, invalid cron expressions, and cron definitions whose input
    /// schema rejects `{}` (cron runs always carry empty input).
    pub fn register(&self, definition: WorkflowDefinition) -> Result<Arc<WorkflowDefinition>> {
        let mut seen = std::collections::HashSet::new();
        for step in &definition.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(Error::Validation(format!(
                    "workflow {:?} declares step {:?} more than once",
                    definition.id, step.id
                )));
            }
        }

        if let Some(cron) = &definition.cron {
            CronSchedule::parse(&cron.expression, &cron.timezone)?;
            if let Some(schema) = &definition.input_schema {
                if let Err(reason) = schema.validate(&json!({})) {
                    return Err(Error::Validation(format!(
                        "workflow {:?} has a cron but its input schema rejects empty input: {reason}",
                        definition.id
                    )));
                }
            }
        }

        let mut entries = self.entries.write().expect("registry lock poisoned");
        if entries.contains_key(&definition.id) {
            return Err(Error::DuplicateWorkflow(definition.id));
        }

        let definition = Arc::new(definition);
        entries.insert(definition.id.clone(), Arc::clone(&definition));
        Ok(definition)
    }

    /// Drop a definition. Persisted runs are untouched.
    ///
    /// Returns the removed definition if it existed.
    pub fn unregister(&self, workflow_id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.entries
            .write()
            .expect("registry lock poisoned")
            .remove(workflow_id)
    }

    /// Drop all definitions.
    pub fn unregister_all(&self) -> Vec<Arc<WorkflowDefinition>> {
        self.entries
            .write()
            .expect("registry lock poisoned")
            .drain()
            .map(|(_, definition)| definition)
            .collect()
    }

    /// Look up a definition by workflow id.
    pub fn get(&self, workflow_id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .get(workflow_id)
            .cloned()
    }

    /// All registered definitions.
    pub fn all(&self) -> Vec<Arc<WorkflowDefinition>> {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Definitions that route through a dedicated per-workflow queue
    /// (cron-triggered or concurrency-limited).
    pub(crate) fn dedicated_queue_definitions(&self) -> Vec<Arc<WorkflowDefinition>> {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .values()
            .filter(|definition| definition.has_dedicated_queue())
            .cloned()
            .collect()
    }

    /// Number of registered definitions.
    pub fn len(&self) -> usize {
        self.entries.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
