//! Resolution of the options a run starts from

mod profiles;

use std::path::Path;

use crabswarm_core::{ConfigError, RunConfig, RunOptions};
use serde_json::Value;

pub use profiles::Profile;

use crate::scripts::Script;

/// Builds the run configuration for `script`.
///
/// The options document is the script's built-in options, or the file at
/// `config` when given. The profile then fills the run-level options the
/// document leaves unset.
pub fn resolve(
    script: Script,
    config: Option<&Path>,
    profile: Profile,
) -> Result<RunConfig, ConfigError> {
    let mut options = match config {
        Some(path) => read_options(path)?,
        None => script.default_options(),
    };
    profile.apply(&mut options);
    RunConfig::from_options(RunOptions::from_value(options)?)
}

fn read_options(path: &Path) -> Result<Value, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::ValueEnum;
    use std::time::Duration;

    #[test]
    fn every_builtin_script_resolves() {
        for script in Script::value_variants() {
            let config = resolve(*script, None, Profile::Default)
                .unwrap_or_else(|e| panic!("{:?} options are invalid: {}", script, e));
            assert!(!config.scenarios.is_empty());
            assert!(!config.thresholds.is_empty());
        }
    }

    #[test]
    fn missing_options_file_is_a_config_error() {
        let err = resolve(
            Script::Homepage,
            Some(Path::new("/nonexistent/options.json")),
            Profile::Default,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn options_file_replaces_builtin_options() {
        let path = std::env::temp_dir().join(format!("crabswarm-options-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "vus": 2, "duration": "5s" }"#).unwrap();

        let config = resolve(Script::Shop, Some(&path), Profile::Default).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.scenarios.len(), 1);
        assert_eq!(config.scenarios[0].name, "default");
        assert_eq!(config.max_duration(), Duration::from_secs(35));
        assert!(config.thresholds.is_empty());
    }
}
