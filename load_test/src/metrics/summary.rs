//! Machine-readable end-of-run summary

use std::path::Path;

use anyhow::{Context, Result};
use crabswarm_core::RunResult;
use serde::Serialize;

#[derive(Serialize)]
pub struct Summary<'a> {
    pub script: &'a str,
    pub exit_code: i32,
    #[serde(flatten)]
    pub result: &'a RunResult,
}

pub fn write_summary(path: &Path, script: &str, result: &RunResult) -> Result<()> {
    let summary = Summary {
        script,
        exit_code: result.exit_code(),
        result,
    };
    let json = serde_json::to_string_pretty(&summary)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write summary to {}", path.display()))?;
    tracing::info!("Summary written to {}", path.display());
    Ok(())
}
