//! Identity phase runner.
//!
//! Takes the identity lease, resolves every raw shard under the input directory against the
//! latest snapshot generation, publishes the next generation and writes scrubbed shards. Prints
//! a JSON summary of the run on success.

use std::process::ExitCode;

use deid_config::shared::RunnerConfig;
use deid_telemetry::tracing::init_tracing;
use tracing::error;

use crate::config::load_runner_config;
use crate::core::start_runner_with_config;
use crate::error::{RunnerError, RunnerResult};

mod config;
mod core;
mod error;
mod shard;
mod summary;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprint!("{}", err.render_report());
            ExitCode::from(err.exit_code())
        }
    }
}

fn run() -> RunnerResult<()> {
    let runner_config = load_runner_config()?;

    let _log_flusher = init_tracing(env!("CARGO_BIN_NAME")).map_err(RunnerError::config)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(runner_config))
}

async fn async_main(runner_config: RunnerConfig) -> RunnerResult<()> {
    let summary = match start_runner_with_config(runner_config).await {
        Ok(summary) => summary,
        Err(err) => {
            error!(category = err.category(), "{err}");
            return Err(err);
        }
    };

    let rendered = serde_json::to_string(&summary).map_err(std::io::Error::from)?;
    println!("{rendered}");

    Ok(())
}
