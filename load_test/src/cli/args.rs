use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::Profile;
use crate::scripts::Script;

/// crabswarm load testing tool
#[derive(Parser, Debug)]
#[command(name = "load-test")]
#[command(about = "Runs virtual-user load test scripts and checks their thresholds")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Mode {
    /// Run a script until its scenarios finish (or Ctrl+C)
    Run(RunArgs),

    /// Resolve and validate a script's options without running it
    Validate(ValidateArgs),
}

/// Options shared by every mode that builds a run configuration
#[derive(Args, Debug, Clone)]
pub struct ScriptArgs {
    /// Built-in script to run
    #[arg(value_enum)]
    pub script: Script,

    /// JSON options document replacing the script's built-in options
    #[arg(long, env = "CRABSWARM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Run profile: smoke, default, soak
    #[arg(long, default_value = "default", env = "CRABSWARM_PROFILE")]
    pub profile: Profile,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub script: ScriptArgs,

    /// Base URL the script requests are made against
    #[arg(long, default_value = "https://test.k6.io", env = "CRABSWARM_BASE_URL")]
    pub base_url: String,

    /// Per-request timeout in seconds
    #[arg(long, default_value = "60")]
    pub request_timeout: u64,

    /// Live progress reporting interval in seconds (0 disables it)
    #[arg(long, default_value = "5")]
    pub report_interval: u64,

    /// Write the final result as JSON to this file
    #[arg(long, env = "CRABSWARM_SUMMARY_JSON")]
    pub summary_json: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ValidateArgs {
    #[command(flatten)]
    pub script: ScriptArgs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_defaults() {
        let cli = Cli::try_parse_from(["load-test", "run", "navigation"]).unwrap();
        match cli.mode {
            Mode::Run(args) => {
                assert_eq!(args.script.script, Script::Navigation);
                assert_eq!(args.script.profile, Profile::Default);
                assert_eq!(args.report_interval, 5);
                assert!(args.summary_json.is_none());
            }
            other => panic!("expected run mode, got {:?}", other),
        }
    }

    #[test]
    fn parses_validate_with_profile_and_config() {
        let cli = Cli::try_parse_from([
            "load-test",
            "validate",
            "search",
            "--profile",
            "soak",
            "--config",
            "options.json",
        ])
        .unwrap();
        match cli.mode {
            Mode::Validate(args) => {
                assert_eq!(args.script.script, Script::Search);
                assert_eq!(args.script.profile, Profile::Soak);
                assert_eq!(args.script.config, Some(PathBuf::from("options.json")));
            }
            other => panic!("expected validate mode, got {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_script() {
        assert!(Cli::try_parse_from(["load-test", "run", "checkout"]).is_err());
    }
}
