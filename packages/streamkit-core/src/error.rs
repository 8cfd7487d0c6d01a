//! Centralized error taxonomy for the streaming pipeline.
//!
//! Every fallible core operation returns [`StreamResult<T>`]. The error kinds
//! are a closed set (spec §7): `Config`, `Unsupported`, `Closed`, `Io`,
//! `Protocol`, `Cancelled`, `Fatal`. Propagation policy (which kinds abort a
//! `start_stream`, which only knock an output out of the streaming set) lives
//! with the callers (`pipeline`, `endpoint`) that interpret [`ErrorKind`].

use std::fmt;

use thiserror::Error;

/// The closed set of error kinds from spec §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid or incompatible configuration.
    Config,
    /// Runtime platform lacks a capability (missing codec, unsupported sink tag, ...).
    Unsupported,
    /// Remote disconnected or local resource closed.
    Closed,
    /// File/socket I/O failure.
    Io,
    /// Container or wire-format violation.
    Protocol,
    /// Operation aborted (e.g. by `release`).
    Cancelled,
    /// Invariant broken; not recoverable. Forces `release`.
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Config => "config",
            Self::Unsupported => "unsupported",
            Self::Closed => "closed",
            Self::Io => "io",
            Self::Protocol => "protocol",
            Self::Cancelled => "cancelled",
            Self::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// The pipeline's application-wide error type.
#[derive(Debug, Error, Clone)]
#[error("{kind}: {message}")]
pub struct StreamError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StreamError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, message)
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Closed, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    /// Whether this error, raised at start-of-stream, should abort the start
    /// and leave the pipeline in its previous state (spec §7).
    pub fn aborts_start(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Config | ErrorKind::Unsupported | ErrorKind::Protocol
        )
    }

    /// Whether this error forces a full `release` (spec §7).
    pub fn is_fatal(&self) -> bool {
        self.kind == ErrorKind::Fatal
    }

    /// Whether this looks like a transient condition worth retrying — a
    /// dropped connection or I/O hiccup, not a configuration mistake or a
    /// permanent rejection. Used by [`crate::retry::with_retry`] to decide
    /// whether a sink reconnect attempt is worth another try.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, ErrorKind::Io | ErrorKind::Closed)
    }
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// Convenience alias for pipeline-wide `Result`s.
pub type StreamResult<T> = Result<T, StreamError>;

/// Outcome of a fan-out operation across several sub-operations (spec §9
/// design notes: "Multi-error aggregation"). `start_stream` across outputs
/// succeeds only if every sub-operation succeeds; sink fan-out `write`
/// succeeds if at least one sub-operation succeeded.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    Ok(T),
    SingleError(StreamError),
    Multi(Vec<StreamError>),
}

impl<T> Outcome<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }

    /// Reduces a batch of sub-operation results into an `Outcome`.
    ///
    /// `require_all = true` models `start_stream` fan-out (every
    /// sub-operation must succeed). `require_all = false` models sink
    /// fan-out `write` (succeeds if at least one sub-operation succeeded).
    pub fn from_results(results: Vec<StreamResult<T>>, require_all: bool) -> Outcome<Vec<T>> {
        let mut oks = Vec::new();
        let mut errs = Vec::new();
        for r in results {
            match r {
                Ok(v) => oks.push(v),
                Err(e) => errs.push(e),
            }
        }

        let succeeded = if require_all {
            errs.is_empty()
        } else {
            !oks.is_empty() || errs.is_empty()
        };

        if succeeded {
            Outcome::Ok(oks)
        } else if errs.len() == 1 {
            Outcome::SingleError(errs.into_iter().next().unwrap())
        } else {
            Outcome::Multi(errs)
        }
    }
}

/// Folds a batch of sub-operation errors into one [`StreamError`] for
/// callers (e.g. [`crate::endpoint::CompositeEndpoint`]) whose public API
/// returns a single `StreamResult` rather than an [`Outcome`].
///
/// A `Fatal` error in the batch wins (spec §7: `Fatal` bubbles up and forces
/// `release`); otherwise the first error's kind is kept and every message is
/// joined, so the caller can still see how many sub-operations failed.
pub fn combine_errors(mut errs: Vec<StreamError>) -> StreamError {
    assert!(!errs.is_empty(), "combine_errors requires at least one error");
    if errs.len() == 1 {
        return errs.pop().unwrap();
    }
    let kind = errs
        .iter()
        .map(|e| e.kind)
        .find(|k| *k == ErrorKind::Fatal)
        .unwrap_or(errs[0].kind);
    let message = errs
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ");
    StreamError::new(kind, format!("{} errors: {message}", errs.len()))
}

impl<T: fmt::Debug> fmt::Display for Outcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Ok(_) => write!(f, "ok"),
            Outcome::SingleError(e) => write!(f, "error: {e}"),
            Outcome::Multi(errs) => write!(f, "{} errors", errs.len()),
        }
    }
}
