//! Mapping parsed arguments onto host settings

use crate::commands::Cli;
use crate::error::{CliError, CliResult};
use probar_testhost::Settings;
use std::path::PathBuf;

/// Logging options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Filter directive
    pub level: String,
    /// JSON output
    pub json: bool,
    /// Diagnostics file
    pub diag: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            diag: None,
        }
    }
}

impl From<&Cli> for LogConfig {
    fn from(cli: &Cli) -> Self {
        Self {
            level: cli.log_level.clone(),
            json: cli.log_json,
            diag: cli.diag.clone(),
        }
    }
}

/// Build validated host settings from the command line
pub fn build_settings(cli: &Cli) -> CliResult<Settings> {
    let mut settings = Settings::new(cli.port)
        .with_endpoint(cli.endpoint)
        .with_data_collection_port(cli.data_collection_port)
        .with_test_framework(cli.framework)
        .with_coverage(cli.coverage)
        .with_coverage_dir(&cli.coverage_dir)
        .with_coverage_dump_dir(&cli.coverage_dump_dir)
        .with_node(&cli.node);
    if let Some(script) = &cli.runner {
        settings = settings.with_runner_script(script);
    }
    settings
        .validate()
        .map_err(|e| CliError::config(e.to_string()))?;
    Ok(settings)
}
