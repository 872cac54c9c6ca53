use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use crabswarm_core::engine::EXIT_INVALID_CONFIG;
use crabswarm_core::{ConfigError, Engine, EngineError, IterationRegistry, RunConfig};

mod cli;
mod config;
mod http;
mod metrics;
mod scripts;

use cli::{Cli, Mode, RunArgs, ScriptArgs, ValidateArgs};
use http::ReqwestClient;
use metrics::{reporter, summary};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    let code = match cli.mode {
        Mode::Run(args) => {
            init_tracing(args.script.verbose)?;
            run(args).await?
        }
        Mode::Validate(args) => {
            init_tracing(args.script.verbose)?;
            validate(args)
        }
    };

    process::exit(code);
}

fn init_tracing(verbose: bool) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(if verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn load_config(args: &ScriptArgs) -> Result<RunConfig, ConfigError> {
    config::resolve(args.script, args.config.as_deref(), args.profile)
}

async fn run(args: RunArgs) -> Result<i32> {
    let script = args.script.script;
    let config = match load_config(&args.script) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid options for '{}': {}", script.name(), e);
            return Ok(EXIT_INVALID_CONFIG);
        }
    };

    tracing::info!("crabswarm load test starting...");
    tracing::info!("Script: {}", script.name());
    tracing::info!("Profile: {:?}", args.script.profile);
    tracing::info!("Base URL: {}", args.base_url);
    for scenario in &config.scenarios {
        tracing::info!(
            "  Scenario {}: {} (peak {} VUs, ends by {:?})",
            scenario.name,
            scenario.executor.kind(),
            scenario.peak_vus(),
            scenario.end()
        );
    }

    let mut iterations = IterationRegistry::new();
    script.register(&mut iterations, &args.base_url);
    let http = Arc::new(ReqwestClient::new(Duration::from_secs(args.request_timeout))?);

    let engine = match Engine::new(config, iterations, http) {
        Ok(engine) => engine,
        Err(EngineError::Config(e)) => {
            tracing::error!("Invalid options for '{}': {}", script.name(), e);
            return Ok(EXIT_INVALID_CONFIG);
        }
        Err(e) => return Err(e.into()),
    };

    let live = (args.report_interval > 0).then(|| {
        tokio::spawn(reporter::start_periodic_reporter(
            engine.progress(),
            engine.registry(),
            Duration::from_secs(args.report_interval),
        ))
    });

    let result = engine
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Ctrl+C received, stopping scenarios...");
        })
        .await?;

    if let Some(live) = live {
        live.abort();
    }
    reporter::print_final_report(&result);

    if let Some(path) = &args.summary_json {
        summary::write_summary(path, script.name(), &result)?;
    }

    tracing::info!("Load test complete");
    Ok(result.exit_code())
}

fn validate(args: ValidateArgs) -> i32 {
    let script = args.script.script;
    match load_config(&args.script) {
        Ok(config) => {
            tracing::info!("Options for '{}' are valid", script.name());
            for scenario in &config.scenarios {
                tracing::info!(
                    "  Scenario {}: {} starting at {:?}, peak {} VUs, ends by {:?}",
                    scenario.name,
                    scenario.executor.kind(),
                    scenario.start_time,
                    scenario.peak_vus(),
                    scenario.end()
                );
            }
            for rule in &config.thresholds {
                tracing::info!("  Threshold {}", rule.key());
            }
            tracing::info!("Maximum run time: {:?}", config.max_duration());
            0
        }
        Err(e) => {
            tracing::error!("Invalid options for '{}': {}", script.name(), e);
            EXIT_INVALID_CONFIG
        }
    }
}
