use deid_config::load_config;
use deid_config::shared::RunnerConfig;

use crate::error::{RunnerError, RunnerResult};

/// Loads the runner configuration from `./configuration` and validates it.
pub fn load_runner_config() -> RunnerResult<RunnerConfig> {
    let config = load_config::<RunnerConfig>().map_err(RunnerError::config)?;
    config.validate().map_err(RunnerError::config)?;

    Ok(config)
}
