//! Poison: the value that stands in for one or more failed computations.
//!
//! Replaces try/catch with value-carried failure. A `Poison` is
//! idempotent under aggregation (merging poison into poison merges error
//! lists, no double-wrap) and deduplicates its errors by
//! `(path, lineno, colno, error_context, message)`.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::error::CascadaError;
use crate::value::Value;

/// A value standing in for one or more failures; contaminates any
/// consuming operation it flows through.
#[derive(Clone, Debug)]
pub struct Poison {
    errors: Arc<Vec<CascadaError>>,
}

impl Poison {
    /// Builds a `Poison` from errors that are already deduplicated and in
    /// the desired order. Only used internally by the aggregation
    /// constructors below — prefer [`from_error`]/[`from_errors`].
    fn from_deduped(errors: Vec<CascadaError>) -> Self {
        Self {
            errors: Arc::new(errors),
        }
    }

    pub fn from_error(err: CascadaError) -> Self {
        Self::from_deduped(vec![err])
    }

    /// Deduplicates and wraps a batch of errors. Construction-time
    /// deduplication means every `Poison` in the system already carries
    /// an error list with no duplicate tuples, without callers having to
    /// remember to dedup at the call site.
    pub fn from_errors(errors: Vec<CascadaError>) -> Self {
        Self::from_deduped(dedup_errors(errors))
    }

    /// An empty error list is reachable through some aggregation paths
    /// and is treated as a degenerate but legal value. Only the
    /// aggregation constructors in this module reach for it; a real
    /// failure never produces an empty `Poison`.
    pub(crate) fn empty_unchecked() -> Self {
        Self::from_deduped(Vec::new())
    }

    /// Merges `other`'s errors into `self`, deduplicating the result.
    /// This is the "aggregating poison into poison merges, no double-wrap"
    /// rule.
    pub fn merge(&self, other: &Poison) -> Poison {
        let mut errors = (*self.errors).clone();
        errors.extend(other.errors.iter().cloned());
        Poison::from_errors(errors)
    }

    pub fn errors(&self) -> &[CascadaError] {
        &self.errors
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_error(self) -> PoisonError {
        PoisonError {
            errors: (*self.errors).clone(),
        }
    }
}

impl PartialEq for Poison {
    fn eq(&self, other: &Self) -> bool {
        self.errors.len() == other.errors.len()
            && self
                .errors
                .iter()
                .zip(other.errors.iter())
                .all(|(a, b)| a.dedup_key() == b.dedup_key())
    }
}

fn dedup_errors(errors: Vec<CascadaError>) -> Vec<CascadaError> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(errors.len());
    for err in errors {
        if seen.insert(err.dedup_key()) {
            out.push(err);
        }
    }
    out
}

/// Anything that can be turned into a batch of errors for
/// [`create_poison`]: a single error, a sequence of errors, or an
/// existing `Poison` to merge through unchanged.
pub enum PoisonSource {
    Single(CascadaError),
    Many(Vec<CascadaError>),
    FromPoison(Poison),
}

impl From<CascadaError> for PoisonSource {
    fn from(err: CascadaError) -> Self {
        PoisonSource::Single(err)
    }
}

impl From<Vec<CascadaError>> for PoisonSource {
    fn from(errs: Vec<CascadaError>) -> Self {
        PoisonSource::Many(errs)
    }
}

impl From<Poison> for PoisonSource {
    fn from(p: Poison) -> Self {
        PoisonSource::FromPoison(p)
    }
}

/// `createPoison(source)`: flattens-and-dedups, idempotent over an
/// existing `Poison` (no double-wrap).
pub fn create_poison(source: impl Into<PoisonSource>) -> Poison {
    match source.into() {
        PoisonSource::Single(err) => Poison::from_error(err),
        PoisonSource::Many(errs) => Poison::from_errors(errs),
        PoisonSource::FromPoison(p) => p,
    }
}

/// `isPoison(v)`: synchronous, total, never awaits. Returns `false` for
/// every non-poison value, including `Value::Suspended`.
pub fn is_poison(value: &Value) -> bool {
    matches!(value, Value::Poison(_))
}

/// Awaits every entry (even after the first failure, so late errors are
/// never dropped), extracting errors from `Value::Poison` results.
/// Non-poison resolutions contribute nothing. Error order follows the
/// resolution order of the inputs.
///
/// Lives here rather than in `resolve` because `Poison` itself needs it
/// to implement aggregation; `resolve::resolve_all` is built on top of
/// this instead of the other way around, so the value/poison layer never
/// depends on the resolution layer.
pub async fn collect_errors(values: Vec<Value>) -> Vec<CascadaError> {
    let resolved = futures::future::join_all(values.into_iter().map(Value::resolve_self)).await;
    let mut errors = Vec::new();
    for value in resolved {
        if let Value::Poison(p) = value {
            errors.extend(p.errors().iter().cloned());
        }
    }
    dedup_errors(errors)
}

/// The error type the caller-facing API settles with: no other exception
/// type escapes the runtime.
#[derive(Clone, Debug)]
pub struct PoisonError {
    pub errors: Vec<CascadaError>,
}

impl PoisonError {
    pub fn single(err: CascadaError) -> Self {
        Self { errors: vec![err] }
    }
}

impl fmt::Display for PoisonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.as_slice() {
            [] => write!(f, "an unspecified error occurred"),
            [only] => write!(f, "{only}"),
            many => {
                write!(f, "Multiple errors occurred ({}): ", many.len())?;
                for (i, err) in many.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{err}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for PoisonError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// `isPoisonError` re-export helper for downstream consumers.
pub fn is_poison_error(err: &(dyn std::error::Error + 'static)) -> bool {
    err.downcast_ref::<PoisonError>().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(msg: &str) -> CascadaError {
        CascadaError::user(msg)
    }

    #[test]
    fn is_poison_is_total_and_synchronous() {
        assert!(is_poison(&Value::Poison(create_poison(err("boom")))));
        assert!(!is_poison(&Value::Null));
        assert!(!is_poison(&Value::Bool(true)));
    }

    #[test]
    fn create_poison_is_idempotent() {
        let p1 = create_poison(err("boom"));
        let p2 = create_poison(p1.clone());
        assert_eq!(p1, p2);
        assert_eq!(p1.errors().len(), p2.errors().len());
    }

    #[test]
    fn merging_poison_dedups_errors() {
        let a = create_poison(err("boom"));
        let b = create_poison(err("boom"));
        let merged = a.merge(&b);
        assert_eq!(merged.errors().len(), 1);
    }

    #[test]
    fn merging_poison_preserves_distinct_errors_in_order() {
        let a = create_poison(err("first"));
        let b = create_poison(err("second"));
        let merged = a.merge(&b);
        assert_eq!(merged.errors().len(), 2);
        assert_eq!(merged.errors()[0].message, "first");
        assert_eq!(merged.errors()[1].message, "second");
    }

    #[test]
    fn empty_poison_is_legal_but_never_produced_from_real_failures() {
        let p = Poison::empty_unchecked();
        assert!(p.is_empty());
    }

    #[test]
    fn poison_error_message_singular_vs_plural() {
        let single = Poison::from_errors(vec![err("boom")]).into_error();
        assert_eq!(single.to_string(), "boom");

        let multi = Poison::from_errors(vec![err("a"), err("b")]).into_error();
        assert!(multi.to_string().starts_with("Multiple errors occurred (2)"));
    }
}
