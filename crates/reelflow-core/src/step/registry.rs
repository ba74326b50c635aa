//! Step registry for runtime step lookup.
//!
//! A name-indexed catalogue of boxed steps, filled once at start-up from an
//! explicit list of `(name, implementation)` pairs. Nothing is discovered
//! implicitly.

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;

use super::box_step::BoxStep;

/// Registry misconfiguration. Fatal before any job runs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("step '{0}' is already registered")]
    DuplicateStep(String),

    #[error("unknown step '{0}'")]
    UnknownStep(String),
}

/// Listing entry for a registered step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepInfo {
    pub name: String,
    pub idempotent: bool,
}

/// Registry of available steps, indexed by name.
#[derive(Debug, Default)]
pub struct StepRegistry {
    steps: HashMap<String, BoxStep>,
}

impl StepRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            steps: HashMap::new(),
        }
    }

    /// Build a registry from `(name, implementation)` pairs, in order.
    pub fn from_entries(
        entries: impl IntoIterator<Item = (String, BoxStep)>,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for (name, step) in entries {
            registry.register(name, step)?;
        }
        Ok(registry)
    }

    /// Register a step under the given name.
    ///
    /// Fails if the name is already bound; registrations are never replaced.
    pub fn register(&mut self, name: impl Into<String>, step: BoxStep) -> Result<(), RegistryError> {
        let name = name.into();
        if self.steps.contains_key(&name) {
            return Err(RegistryError::DuplicateStep(name));
        }
        tracing::debug!(step = %name, idempotent = step.idempotent(), "registered step");
        self.steps.insert(name, step);
        Ok(())
    }

    /// Look up a step by name.
    pub fn get(&self, name: &str) -> Result<&BoxStep, RegistryError> {
        self.steps
            .get(name)
            .ok_or_else(|| RegistryError::UnknownStep(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    /// All registered steps, sorted by name.
    pub fn list(&self) -> Vec<StepInfo> {
        let mut out: Vec<StepInfo> = self
            .steps
            .iter()
            .map(|(name, step)| StepInfo {
                name: name.clone(),
                idempotent: step.idempotent(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::builtin::EchoStep;

    #[test]
    fn register_and_get() {
        let mut registry = StepRegistry::new();
        registry.register("echo", BoxStep::new(EchoStep)).unwrap();
        assert!(registry.get("echo").is_ok());
        assert!(registry.contains("echo"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = StepRegistry::new();
        registry.register("echo", BoxStep::new(EchoStep)).unwrap();
        let err = registry.register("echo", BoxStep::new(EchoStep)).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateStep("echo".into()));
    }

    #[test]
    fn unknown_step_fails() {
        let registry = StepRegistry::new();
        let err = registry.get("render").unwrap_err();
        assert_eq!(err, RegistryError::UnknownStep("render".into()));
        assert!(err.to_string().contains("render"));
    }

    #[test]
    fn from_entries_rejects_duplicates() {
        let entries = vec![
            ("echo".to_string(), BoxStep::new(EchoStep)),
            ("echo".to_string(), BoxStep::new(EchoStep)),
        ];
        assert!(StepRegistry::from_entries(entries).is_err());
    }

    #[test]
    fn list_is_sorted() {
        let registry = StepRegistry::from_entries(vec![
            ("transcribe".to_string(), BoxStep::new(EchoStep)),
            ("download".to_string(), BoxStep::new(EchoStep)),
        ])
        .unwrap();
        let names: Vec<_> = registry.list().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["download", "transcribe"]);
    }
}
