use std::backtrace::Backtrace;
use std::error::Error;
use std::fmt;

use deid::error::{DeidError, ErrorKind};

/// Exit code for failures without a more specific code.
pub const EXIT_FAILURE: u8 = 1;
/// Exit code for invalid configuration, identifier catalogs or snapshots.
pub const EXIT_CONFIG: u8 = 2;
/// Exit code when the identity lease stayed held by another runner.
pub const EXIT_LEASE_EXHAUSTED: u8 = 3;
/// Exit code when the identity lease was lost while the run was in progress.
pub const EXIT_LEASE_LOST: u8 = 4;

fn should_render_backtrace() -> bool {
    matches!(
        std::env::var("RUST_BACKTRACE").as_deref(),
        Ok("1") | Ok("full")
    )
}

pub type RunnerResult<T> = Result<T, RunnerError>;

/// Backtrace captured when a non-library error is wrapped.
pub struct CapturedBacktrace(Backtrace);

impl CapturedBacktrace {
    fn capture() -> Self {
        Self(Backtrace::capture())
    }
}

impl fmt::Debug for CapturedBacktrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error type of the runner binary.
///
/// Wraps [`DeidError`] for failures of the identity phase itself and adds variants for the
/// surrounding infrastructure.
#[derive(Debug)]
pub enum RunnerError {
    Deid(DeidError),
    Config(Box<dyn Error + Send + Sync>, CapturedBacktrace),
    Migration(sqlx::Error, CapturedBacktrace),
    Io(std::io::Error, CapturedBacktrace),
}

impl RunnerError {
    pub fn category(&self) -> &'static str {
        match self {
            RunnerError::Deid(err) => match err.kind() {
                ErrorKind::LeaseAcquireExhausted => "lease unavailable",
                ErrorKind::LeaseLost => "lease lost",
                kind if kind.is_config() => "configuration error",
                _ => "identity phase error",
            },
            RunnerError::Config(_, _) => "configuration error",
            RunnerError::Migration(_, _) => "migration error",
            RunnerError::Io(_, _) => "i/o error",
        }
    }

    /// Process exit code reported for this error.
    ///
    /// An aggregate takes the code of its first lease error, so losing the lease is never
    /// hidden behind the shard failures it caused.
    pub fn exit_code(&self) -> u8 {
        match self {
            RunnerError::Deid(err) => {
                let kinds = err.kinds();
                if kinds.contains(&ErrorKind::LeaseLost) {
                    EXIT_LEASE_LOST
                } else if kinds.contains(&ErrorKind::LeaseAcquireExhausted) {
                    EXIT_LEASE_EXHAUSTED
                } else if kinds.iter().all(ErrorKind::is_config) {
                    EXIT_CONFIG
                } else {
                    EXIT_FAILURE
                }
            }
            RunnerError::Config(_, _) => EXIT_CONFIG,
            RunnerError::Migration(_, _) | RunnerError::Io(_, _) => EXIT_FAILURE,
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self {
            RunnerError::Deid(err) => err.backtrace(),
            RunnerError::Config(_, cb) => Some(&cb.0),
            RunnerError::Migration(_, cb) => Some(&cb.0),
            RunnerError::Io(_, cb) => Some(&cb.0),
        }
    }

    pub fn config<E: Error + Send + Sync + 'static>(err: E) -> Self {
        RunnerError::Config(Box::new(err), CapturedBacktrace::capture())
    }

    /// Renders the error with its causes for terminal output.
    pub fn render_report(&self) -> String {
        let mut out = String::new();
        out.push_str("identity phase run failed\n");
        out.push_str(&format!("category: {}\n", self.category()));
        out.push_str(&format!("error: {self}\n"));

        if !matches!(self, RunnerError::Deid(err) if err.errors().is_some()) {
            let mut source = Error::source(self);
            let mut idx = 1usize;
            while let Some(err) = source {
                out.push_str(&format!("cause {idx}: {err}\n"));
                source = err.source();
                idx += 1;
            }
        }

        if should_render_backtrace()
            && let Some(backtrace) = self.backtrace()
        {
            out.push_str("backtrace:\n");
            out.push_str(&backtrace.to_string());
            if !out.ends_with('\n') {
                out.push('\n');
            }
        }

        out
    }
}

impl fmt::Display for RunnerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerError::Deid(err) => write!(f, "{err}"),
            RunnerError::Config(source, _) => write!(f, "configuration error: {source}"),
            RunnerError::Migration(source, _) => write!(f, "migration error: {source}"),
            RunnerError::Io(source, _) => write!(f, "i/o error: {source}"),
        }
    }
}

impl Error for RunnerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RunnerError::Deid(err) => err.source(),
            RunnerError::Config(source, _) => Some(source.as_ref()),
            RunnerError::Migration(source, _) => Some(source),
            RunnerError::Io(source, _) => Some(source),
        }
    }
}

impl From<sqlx::Error> for RunnerError {
    fn from(err: sqlx::Error) -> Self {
        RunnerError::Migration(err, CapturedBacktrace::capture())
    }
}

impl From<std::io::Error> for RunnerError {
    fn from(err: std::io::Error) -> Self {
        RunnerError::Io(err, CapturedBacktrace::capture())
    }
}

impl From<DeidError> for RunnerError {
    fn from(err: DeidError) -> Self {
        RunnerError::Deid(err)
    }
}

#[cfg(test)]
mod tests {
    use deid::deid_error;

    use super::*;

    #[test]
    fn lease_failures_have_distinct_exit_codes() {
        let exhausted = RunnerError::from(deid_error!(
            ErrorKind::LeaseAcquireExhausted,
            "Lease could not be acquired"
        ));
        let lost = RunnerError::from(deid_error!(ErrorKind::LeaseLost, "Lease is no longer held"));

        assert_eq!(exhausted.exit_code(), EXIT_LEASE_EXHAUSTED);
        assert_eq!(lost.exit_code(), EXIT_LEASE_LOST);
        assert_eq!(lost.category(), "lease lost");
    }

    #[test]
    fn lease_loss_wins_inside_aggregates() {
        let err = DeidError::from(vec![
            deid_error!(ErrorKind::UnresolvedIdentity, "Identity is not in the snapshot"),
            deid_error!(ErrorKind::LeaseLost, "Lease is no longer held"),
        ]);

        assert_eq!(RunnerError::from(err).exit_code(), EXIT_LEASE_LOST);
    }

    #[test]
    fn configuration_failures_exit_with_the_config_code() {
        let err = RunnerError::from(deid_error!(
            ErrorKind::UnknownIdentifier,
            "Unknown identifier type"
        ));
        assert_eq!(err.exit_code(), EXIT_CONFIG);

        let err = RunnerError::from(deid_error!(
            ErrorKind::UnresolvedIdentity,
            "Identity is not in the snapshot"
        ));
        assert_eq!(err.exit_code(), EXIT_FAILURE);
    }

    #[test]
    fn report_lists_the_category() {
        let err = RunnerError::from(std::io::Error::other("disk full"));
        let report = err.render_report();

        assert!(report.contains("category: i/o error"));
        assert!(report.contains("disk full"));
    }
}
