//! Error type shared by every de-identification component.
//!
//! [`DeidError`] carries a classification ([`ErrorKind`]), a static description, optional
//! dynamic detail, an optional source error and the callsite that created it. Several errors can
//! be aggregated into one, for example the failures of independent shards.
//!
//! Detail strings name tables, columns, files and identifier types. They never carry identifier
//! values.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

/// Result type used across the crate.
pub type DeidResult<T> = Result<T, DeidError>;

#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Error returned by de-identification operations.
#[derive(Debug, Clone)]
pub struct DeidError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(ErrorPayload),
    Many {
        errors: Vec<DeidError>,
        location: &'static Location<'static>,
    },
}

/// Classification of a [`DeidError`].
///
/// Lease contention is not an error and has no kind: it is reported through typed outcomes.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Configuration errors, fatal for the whole run.
    ConfigError,
    UnknownIdentifier,
    InvalidIdentifier,
    CorruptSnapshot,

    // Lease errors.
    LeaseStoreFailed,
    LeaseAcquireExhausted,
    LeaseLost,

    // Scrubbing errors, fatal for the shard.
    UnresolvedIdentity,

    // Data errors.
    InvalidData,
    ConversionError,

    // I/O errors.
    IoError,

    // State errors.
    InvalidState,
    RenewalWorkerPanic,

    Unknown,
}

impl ErrorKind {
    /// Returns `true` for failures expected to clear up when the operation is retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::LeaseStoreFailed | ErrorKind::IoError)
    }

    /// Returns `true` for failures caused by the deployment's configuration or inputs, which no
    /// retry can fix.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            ErrorKind::ConfigError
                | ErrorKind::UnknownIdentifier
                | ErrorKind::InvalidIdentifier
                | ErrorKind::CorruptSnapshot
        )
    }
}

impl DeidError {
    /// Returns the kind of this error, or of the first aggregated error.
    pub fn kind(&self) -> ErrorKind {
        match &self.repr {
            ErrorRepr::Single(payload) => payload.kind,
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(DeidError::kind)
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns the kinds of all errors, flattening aggregates.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match &self.repr {
            ErrorRepr::Single(payload) => vec![payload.kind],
            ErrorRepr::Many { errors, .. } => errors.iter().flat_map(DeidError::kinds).collect(),
        }
    }

    /// Returns the dynamic detail, or the first one found in an aggregate.
    pub fn detail(&self) -> Option<&str> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload.detail.as_deref(),
            ErrorRepr::Many { errors, .. } => errors.iter().find_map(DeidError::detail),
        }
    }

    /// Returns the aggregated errors, if this is an aggregate.
    pub fn errors(&self) -> Option<&[DeidError]> {
        match &self.repr {
            ErrorRepr::Single(_) => None,
            ErrorRepr::Many { errors, .. } => Some(errors),
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match &self.repr {
            ErrorRepr::Single(payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Returns `true` when every contained error is transient.
    pub fn is_transient(&self) -> bool {
        self.kinds().iter().all(ErrorKind::is_transient)
    }

    /// Attaches the error that caused this one. Ignored on aggregates.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }
        self
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        DeidError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }
}

impl PartialEq for DeidError {
    fn eq(&self, other: &DeidError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (ErrorRepr::Many { errors: a, .. }, ErrorRepr::Many { errors: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for DeidError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line()
                )?;

                if let Some(detail) = payload.detail.as_deref() {
                    write!(f, "\n  Detail:")?;
                    for line in detail.lines() {
                        write!(f, "\n    {line}")?;
                    }
                }

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                write!(
                    f,
                    "[Many] {} errors aggregated @ {}:{}",
                    errors.len(),
                    location.file(),
                    location.line()
                )?;

                for (index, error) in errors.iter().enumerate() {
                    let rendered = error.to_string();
                    let mut lines = rendered.lines();
                    write!(f, "\n  {}. {}", index + 1, lines.next().unwrap_or_default())?;
                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }

                Ok(())
            }
        }
    }
}

impl error::Error for DeidError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source.as_ref() as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

impl From<(ErrorKind, &'static str)> for DeidError {
    #[track_caller]
    fn from((kind, description): (ErrorKind, &'static str)) -> DeidError {
        DeidError::from_components(kind, Cow::Borrowed(description), None, None)
    }
}

impl<D> From<(ErrorKind, &'static str, D)> for DeidError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, description, detail): (ErrorKind, &'static str, D)) -> DeidError {
        DeidError::from_components(kind, Cow::Borrowed(description), Some(detail.into()), None)
    }
}

/// Aggregates errors. A single error is returned unwrapped.
impl<E> From<Vec<E>> for DeidError
where
    E: Into<DeidError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> DeidError {
        let location = Location::caller();
        let mut errors: Vec<DeidError> = errors.into_iter().map(Into::into).collect();

        if errors.len() == 1
            && let Some(error) = errors.pop()
        {
            return error;
        }

        DeidError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

impl From<std::io::Error> for DeidError {
    #[track_caller]
    fn from(err: std::io::Error) -> DeidError {
        let detail = err.to_string();
        DeidError::from_components(
            ErrorKind::IoError,
            Cow::Borrowed("I/O operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Maps every database failure to [`ErrorKind::LeaseStoreFailed`], the lease store being the
/// only database this crate talks to.
impl From<sqlx::Error> for DeidError {
    #[track_caller]
    fn from(err: sqlx::Error) -> DeidError {
        let description = match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                "Lease store connection failed"
            }
            _ => "Lease store query failed",
        };

        let detail = err.to_string();
        DeidError::from_components(
            ErrorKind::LeaseStoreFailed,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<tokio::task::JoinError> for DeidError {
    #[track_caller]
    fn from(err: tokio::task::JoinError) -> DeidError {
        let kind = if err.is_panic() {
            ErrorKind::RenewalWorkerPanic
        } else {
            ErrorKind::InvalidState
        };

        let detail = err.to_string();
        DeidError::from_components(
            kind,
            Cow::Borrowed("Background task failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}
