//! Runner registry -- the process-wide lookup of runners by type.
//!
//! The orchestrator resolves a request's [`RunnerType`] here before calling
//! [`Runner::execute`]. Registration is rare and lookups are frequent, so
//! the map sits behind a [`RwLock`] that is never held across an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info};

use crate::config::RunnerSettings;
use crate::runner::{ClaudeCodeRunner, CodexRunner, OpenCodeRunner, Runner};
use crate::types::{Availability, RunnerType};

/// Upper bound for one runner's availability probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("a runner for '{0}' is already registered")]
    Duplicate(RunnerType),

    #[error("no runner registered for '{0}'")]
    NotFound(RunnerType),
}

/// A collection of registered [`Runner`]s, at most one per type.
///
/// # Example
///
/// ```ignore
/// let registry = RunnerRegistry::new();
/// registry.register(Arc::new(CodexRunner::default()))?;
/// let runner = registry.get(RunnerType::Codex)?;
/// ```
#[derive(Default)]
pub struct RunnerRegistry {
    runners: RwLock<HashMap<RunnerType, Arc<dyn Runner>>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the Claude Code, Codex and OpenCode runners built
    /// from `settings`.
    pub fn with_defaults(settings: &RunnerSettings) -> Self {
        let mut runners: HashMap<RunnerType, Arc<dyn Runner>> = HashMap::new();
        runners.insert(
            RunnerType::ClaudeCode,
            Arc::new(ClaudeCodeRunner::new(settings.claude.clone())),
        );
        runners.insert(
            RunnerType::Codex,
            Arc::new(CodexRunner::new(settings.codex.clone())),
        );
        runners.insert(
            RunnerType::OpenCode,
            Arc::new(OpenCodeRunner::new(settings.opencode.clone())),
        );
        Self {
            runners: RwLock::new(runners),
        }
    }

    /// Register a runner under [`Runner::runner_type`].
    ///
    /// Fails if that type is already taken; the existing runner stays.
    pub fn register(&self, runner: Arc<dyn Runner>) -> Result<(), RegistryError> {
        let runner_type = runner.runner_type();
        let mut runners = self.runners.write().unwrap_or_else(PoisonError::into_inner);
        if runners.contains_key(&runner_type) {
            return Err(RegistryError::Duplicate(runner_type));
        }
        runners.insert(runner_type, runner);
        info!(runner = %runner_type, "registered runner");
        Ok(())
    }

    pub fn get(&self, runner_type: RunnerType) -> Result<Arc<dyn Runner>, RegistryError> {
        self.runners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&runner_type)
            .cloned()
            .ok_or(RegistryError::NotFound(runner_type))
    }

    /// All registered runners, in no particular order.
    pub fn list(&self) -> Vec<Arc<dyn Runner>> {
        self.runners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Registered types in [`RunnerType::ALL`] order.
    pub fn types(&self) -> Vec<RunnerType> {
        let runners = self.runners.read().unwrap_or_else(PoisonError::into_inner);
        RunnerType::ALL
            .into_iter()
            .filter(|t| runners.contains_key(t))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.runners.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Probe every runner concurrently and return each answer.
    ///
    /// A probe that exceeds [`PROBE_TIMEOUT`] counts as unavailable.
    pub async fn probe_all(&self) -> Vec<(Arc<dyn Runner>, Availability)> {
        let runners = self.list();
        let probes = runners.iter().map(|runner| async move {
            match tokio::time::timeout(PROBE_TIMEOUT, runner.is_available()).await {
                Ok(availability) => availability,
                Err(_) => {
                    debug!(runner = %runner.runner_type(), "availability probe timed out");
                    Availability::unavailable(format!(
                        "availability probe timed out after {PROBE_TIMEOUT:?}"
                    ))
                }
            }
        });
        let answers = join_all(probes).await;
        runners.into_iter().zip(answers).collect()
    }

    /// Runners whose probe answered available.
    pub async fn available(&self) -> Vec<Arc<dyn Runner>> {
        self.probe_all()
            .await
            .into_iter()
            .filter(|(_, availability)| availability.available)
            .map(|(runner, _)| runner)
            .collect()
    }
}

impl std::fmt::Debug for RunnerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerRegistry")
            .field("runners", &self.types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{MockRunner, StubRunner};

    #[test]
    fn registry_starts_empty() {
        let registry = RunnerRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.list().is_empty());
        assert!(registry.types().is_empty());
    }

    #[test]
    fn register_then_get_returns_same_instance() {
        let registry = RunnerRegistry::new();
        let runner: Arc<dyn Runner> = Arc::new(MockRunner::new(Vec::new()));
        registry.register(runner.clone()).unwrap();
        let got = registry.get(RunnerType::Mock).unwrap();
        assert!(Arc::ptr_eq(&runner, &got));
    }

    #[test]
    fn duplicate_registration_is_refused() {
        let registry = RunnerRegistry::new();
        let first: Arc<dyn Runner> = Arc::new(StubRunner::new(RunnerType::Codex, "a"));
        registry.register(first.clone()).unwrap();
        let err = registry
            .register(Arc::new(StubRunner::new(RunnerType::Codex, "b")))
            .unwrap_err();
        assert_eq!(err, RegistryError::Duplicate(RunnerType::Codex));
        assert!(Arc::ptr_eq(&first, &registry.get(RunnerType::Codex).unwrap()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn get_missing_is_not_found() {
        let Err(err) = RunnerRegistry::new().get(RunnerType::OpenCode) else {
            panic!("expected NotFound for an empty registry");
        };
        assert_eq!(err, RegistryError::NotFound(RunnerType::OpenCode));
        assert!(err.to_string().contains("opencode"));
    }

    #[test]
    fn defaults_cover_the_cli_runners() {
        let registry = RunnerRegistry::with_defaults(&RunnerSettings::default());
        assert_eq!(
            registry.types(),
            vec![RunnerType::ClaudeCode, RunnerType::Codex, RunnerType::OpenCode]
        );
        let debug = format!("{registry:?}");
        assert!(debug.contains("Codex"));
    }

    #[tokio::test]
    async fn available_filters_unavailable_runners() {
        let registry = RunnerRegistry::new();
        registry.register(Arc::new(MockRunner::new(Vec::new()))).unwrap();
        registry
            .register(Arc::new(StubRunner::new(RunnerType::OpenCode, "missing")))
            .unwrap();

        let answers = registry.probe_all().await;
        assert_eq!(answers.len(), 2);

        let available = registry.available().await;
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].runner_type(), RunnerType::Mock);
    }
}
