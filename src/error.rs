//! Error taxonomy shared by every component. Errors never unwind across a
//! fence; they are carried inside [`crate::poison::Poison`] instead.

use std::fmt;

/// Tags an error with which part of the system produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, thiserror::Error)]
pub enum CascadaErrorKind {
    /// Thrown/returned by user-supplied callables during evaluation.
    #[error("user error")]
    User,
    /// Produced by the runtime itself: unknown handler, unknown method,
    /// invalid concurrency limit, object-loop arity mismatch, illegal
    /// callable.
    #[error("dataflow error")]
    Dataflow,
    /// Produced while flattening the output buffer (e.g. a command against
    /// a missing handler).
    #[error("structural error")]
    Structural,
    /// A scope exited while sequence-lock waiters were still pending.
    #[error("cancelled")]
    Cancelled,
}

/// A single error carried by [`Poison`](crate::poison::Poison).
///
/// `path`/`lineno`/`colno`/`error_context` are filled in additively: an
/// error is contextualized at the nearest fence that knows the missing
/// piece, never overwritten once set.
#[derive(Clone, Debug)]
pub struct CascadaError {
    pub message: String,
    pub path: Option<String>,
    pub lineno: Option<u32>,
    pub colno: Option<u32>,
    pub error_context: Option<String>,
    pub stack: Option<String>,
    pub kind: CascadaErrorKind,
}

/// The `(path, lineno, colno, error_context, message)` tuple used as the
/// deduplication key when merging error lists.
pub type DedupKey = (
    Option<String>,
    Option<u32>,
    Option<u32>,
    Option<String>,
    String,
);

impl CascadaError {
    pub fn new(message: impl Into<String>, kind: CascadaErrorKind) -> Self {
        Self {
            message: message.into(),
            path: None,
            lineno: None,
            colno: None,
            error_context: None,
            stack: None,
            kind,
        }
    }

    pub fn user(message: impl Into<String>) -> Self {
        Self::new(message, CascadaErrorKind::User)
    }

    pub fn dataflow(message: impl Into<String>) -> Self {
        Self::new(message, CascadaErrorKind::Dataflow)
    }

    pub fn structural(message: impl Into<String>) -> Self {
        Self::new(message, CascadaErrorKind::Structural)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(message, CascadaErrorKind::Cancelled)
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        if self.path.is_none() {
            self.path = Some(path.into());
        }
        self
    }

    pub fn with_position(mut self, lineno: u32, colno: u32) -> Self {
        if self.lineno.is_none() {
            self.lineno = Some(lineno);
        }
        if self.colno.is_none() {
            self.colno = Some(colno);
        }
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        if self.error_context.is_none() {
            self.error_context = Some(context.into());
        }
        self
    }

    pub fn dedup_key(&self) -> DedupKey {
        (
            self.path.clone(),
            self.lineno,
            self.colno,
            self.error_context.clone(),
            self.message.clone(),
        )
    }
}

impl fmt::Display for CascadaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ctx) = &self.error_context {
            write!(f, "{ctx}: ")?;
        }
        write!(f, "{}", self.message)?;
        if let (Some(line), Some(col)) = (self.lineno, self.colno) {
            write!(f, " (at {line}:{col})")?;
        }
        Ok(())
    }
}

impl std::error::Error for CascadaError {}

impl From<&str> for CascadaError {
    fn from(message: &str) -> Self {
        CascadaError::user(message)
    }
}

impl From<String> for CascadaError {
    fn from(message: String) -> Self {
        CascadaError::user(message)
    }
}
