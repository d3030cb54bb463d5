//! Error types and result definitions for shard DDL coordination.
//!
//! [`ShardDdlError`] carries a classification ([`ErrorKind`]), a static description, optional
//! dynamic detail and source, plus the callsite and a backtrace. Several errors can be
//! aggregated into one, which is how a rebuild reports every change report that failed to
//! replay.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::sync::Arc;

/// Result type for coordination operations.
pub type ShardDdlResult<T> = Result<T, ShardDdlError>;

#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type of the coordination core.
///
/// Cloning is cheap: the source error and the backtrace are reference counted.
#[derive(Debug, Clone)]
pub struct ShardDdlError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(ErrorPayload),
    Many {
        errors: Vec<ShardDdlError>,
        location: &'static Location<'static>,
    },
}

/// Categories of errors raised by the coordination core.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Coordination Errors
    SchemaConflict,
    UnadoptedDrop,
    UnknownParticipant,

    // Store Errors
    StoreUnavailable,
    StoreTransactionFailed,
    StoreContention,
    InvalidKey,

    // Data Errors
    SerializationError,
    DeserializationError,
    InvalidData,

    // Configuration & State Errors
    ConfigError,
    InvalidState,
    IoError,

    // Unknown / Uncategorized
    Unknown,
}

impl ErrorKind {
    /// Returns `true` for kinds that only an operator or a corrected report can resolve.
    ///
    /// Retrying the same input reproduces these errors.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ErrorKind::SchemaConflict | ErrorKind::UnadoptedDrop | ErrorKind::UnknownParticipant
        )
    }
}

impl ShardDdlError {
    /// Returns the [`ErrorKind`] of this error.
    ///
    /// For aggregated errors, returns the kind of the first error or [`ErrorKind::Unknown`]
    /// if there is none.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns every [`ErrorKind`] contained in this error.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => {
                errors.iter().flat_map(|err| err.kinds()).collect()
            }
        }
    }

    /// Returns the static description of the error.
    pub fn description(&self) -> &str {
        match self.repr {
            ErrorRepr::Single(ref payload) => &payload.description,
            ErrorRepr::Many { .. } => "multiple errors",
        }
    }

    /// Returns the dynamic detail, or the first detail found in an aggregate.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    /// Returns the captured backtrace of a single error.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    /// Returns the location where the error was created.
    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Attaches an originating error, exposed via [`error::Error::source`].
    ///
    /// Has no effect on aggregated errors.
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
        ShardDdlError {
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

impl PartialEq for ShardDdlError {
    fn eq(&self, other: &ShardDdlError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (ErrorRepr::Many { errors: a, .. }, ErrorRepr::Many { errors: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl Hash for ShardDdlError {
    /// Hashes only the kind and the static description so repeated occurrences group together.
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(&self.repr).hash(state);
        match &self.repr {
            ErrorRepr::Single(payload) => {
                payload.kind.hash(state);
                payload.description.hash(state);
            }
            ErrorRepr::Many { errors, .. } => {
                errors.len().hash(state);
                for error in errors {
                    error.hash(state);
                }
            }
        }
    }
}

impl fmt::Display for ShardDdlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                if let Some(detail) = payload.detail.as_deref() {
                    write_indented(f, "Detail", detail)?;
                }

                let backtrace = payload.backtrace.to_string();
                if !backtrace.trim().is_empty() {
                    write_indented(f, "Backtrace", &backtrace)?;
                }

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                let count = errors.len();
                write!(
                    f,
                    "[Many] {} error{} aggregated @ {}:{}:{}",
                    count,
                    if count == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                    location.column()
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

fn write_indented(f: &mut fmt::Formatter<'_>, label: &str, body: &str) -> fmt::Result {
    write!(f, "\n  {label}:")?;
    for line in body.lines() {
        if line.trim().is_empty() {
            write!(f, "\n    ")?;
        } else {
            write!(f, "\n    {line}")?;
        }
    }

    Ok(())
}

impl error::Error for ShardDdlError {
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

impl From<(ErrorKind, &'static str)> for ShardDdlError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> ShardDdlError {
        ShardDdlError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

impl<D> From<(ErrorKind, &'static str, D)> for ShardDdlError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> ShardDdlError {
        ShardDdlError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Aggregates errors; a single error is returned unwrapped.
impl<E> From<Vec<E>> for ShardDdlError
where
    E: Into<ShardDdlError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> ShardDdlError {
        let location = Location::caller();
        let mut errors: Vec<ShardDdlError> = errors.into_iter().map(Into::into).collect();

        if errors.len() == 1 {
            if let Some(error) = errors.pop() {
                return error;
            }
        }

        ShardDdlError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

/// Wraps an external error with its rendered message as detail.
#[track_caller]
fn wrap<E>(kind: ErrorKind, description: &'static str, err: E) -> ShardDdlError
where
    E: error::Error + Send + Sync + 'static,
{
    let detail = err.to_string();
    ShardDdlError::from_components(
        kind,
        Cow::Borrowed(description),
        Some(Cow::Owned(detail)),
        Some(Arc::new(err)),
    )
}

impl From<std::io::Error> for ShardDdlError {
    #[track_caller]
    fn from(err: std::io::Error) -> ShardDdlError {
        wrap(ErrorKind::IoError, "I/O operation failed", err)
    }
}

impl From<serde_json::Error> for ShardDdlError {
    #[track_caller]
    fn from(err: serde_json::Error) -> ShardDdlError {
        match err.classify() {
            serde_json::error::Category::Io => {
                wrap(ErrorKind::IoError, "JSON I/O operation failed", err)
            }
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => wrap(
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
                err,
            ),
        }
    }
}

impl From<base64::DecodeError> for ShardDdlError {
    #[track_caller]
    fn from(err: base64::DecodeError) -> ShardDdlError {
        wrap(ErrorKind::InvalidKey, "Store key component is not valid base64", err)
    }
}

impl From<std::string::FromUtf8Error> for ShardDdlError {
    #[track_caller]
    fn from(err: std::string::FromUtf8Error) -> ShardDdlError {
        wrap(ErrorKind::InvalidKey, "Store key component is not valid UTF-8", err)
    }
}

/// Maps connection level failures to [`ErrorKind::StoreUnavailable`] so callers can retry them,
/// everything else to [`ErrorKind::StoreTransactionFailed`].
impl From<sqlx::Error> for ShardDdlError {
    #[track_caller]
    fn from(err: sqlx::Error) -> ShardDdlError {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::WorkerCrashed => wrap(
                ErrorKind::StoreUnavailable,
                "Coordination store is unavailable",
                err,
            ),
            _ => wrap(
                ErrorKind::StoreTransactionFailed,
                "Coordination store transaction failed",
                err,
            ),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for ShardDdlError {
    #[track_caller]
    fn from(err: sqlx::migrate::MigrateError) -> ShardDdlError {
        wrap(
            ErrorKind::StoreTransactionFailed,
            "Coordination store migration failed",
            err,
        )
    }
}
