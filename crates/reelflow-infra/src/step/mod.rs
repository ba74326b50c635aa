//! Step implementations backed by infrastructure, and registry assembly.

pub mod command;

use std::path::Path;

use reelflow_core::step::box_step::BoxStep;
use reelflow_core::step::builtin::builtin_steps;
use reelflow_core::step::registry::{RegistryError, StepRegistry};
use reelflow_types::config::GlobalConfig;

use self::command::CommandStep;

/// Build the registry from the built-in steps plus every configured command
/// step, in declaration order.
///
/// Relative program paths resolve against `data_dir`. A command step named
/// like a built-in is a `DuplicateStep` error.
pub fn build_registry(config: &GlobalConfig, data_dir: &Path) -> Result<StepRegistry, RegistryError> {
    let configured = config.steps.iter().map(|step| {
        (
            step.name.clone(),
            BoxStep::new(CommandStep::new(step.clone()).relative_to(data_dir)),
        )
    });
    let registry = StepRegistry::from_entries(builtin_steps().into_iter().chain(configured))?;
    tracing::debug!(steps = registry.len(), "step registry ready");
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reelflow_types::config::CommandStepConfig;

    fn command(name: &str, idempotent: bool) -> CommandStepConfig {
        CommandStepConfig {
            name: name.into(),
            program: "true".into(),
            args: vec![],
            idempotent,
            env: Default::default(),
        }
    }

    #[test]
    fn registry_contains_builtins_and_commands() {
        let config = GlobalConfig {
            steps: vec![command("transcribe", true), command("upload", false)],
            ..GlobalConfig::default()
        };
        let registry = build_registry(&config, Path::new("/srv/reelflow")).unwrap();
        let listed: Vec<(String, bool)> = registry
            .list()
            .into_iter()
            .map(|s| (s.name, s.idempotent))
            .collect();
        assert_eq!(
            listed,
            vec![
                ("echo".to_string(), true),
                ("transcribe".to_string(), true),
                ("upload".to_string(), false),
            ]
        );
    }

    #[test]
    fn command_cannot_shadow_builtin() {
        let config = GlobalConfig {
            steps: vec![command("echo", true)],
            ..GlobalConfig::default()
        };
        assert_eq!(
            build_registry(&config, Path::new("/srv/reelflow")).unwrap_err(),
            RegistryError::DuplicateStep("echo".into())
        );
    }
}
