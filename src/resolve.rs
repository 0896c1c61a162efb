//! Resolution layer: await/flatten scalar, array, object, and
//! heterogeneous argument sets, collecting every error and propagating
//! poison without re-wrapping it.
//!
//! Nothing here throws synchronously for a dataflow failure — every
//! resolver returns `Value::Poison` instead, so callers keep composing
//! without a `?`-shortcut that would lose sibling errors.

use std::sync::Arc;

use futures::future::FutureExt;
use indexmap::IndexMap;

use crate::error::CascadaError;
use crate::poison::Poison;
use crate::value::{BoxFuture, ListValue, MapValue, Value};

/// `resolveSingle(v)`: if `v` is concrete, returns it; if `Suspended`,
/// awaits it.
pub async fn resolve_single(v: Value) -> Value {
    v.resolve_self().await
}

/// `resolveDuo(a, b)`: fast path when both are already concrete and
/// non-poison; otherwise awaits both so neither side's error is dropped.
pub async fn resolve_duo(a: Value, b: Value) -> (Value, Value) {
    if !a.is_suspended() && !b.is_suspended() {
        return (a, b);
    }
    futures::join!(a.resolve_self(), b.resolve_self())
}

/// Extracts a combined `Poison` from a resolved pair, if either side
/// settled to poison. Convenience for binary-operator evaluation built on
/// top of [`resolve_duo`].
pub fn poison_of_pair(a: &Value, b: &Value) -> Option<Poison> {
    match (a, b) {
        (Value::Poison(pa), Value::Poison(pb)) => Some(pa.merge(pb)),
        (Value::Poison(p), _) | (_, Value::Poison(p)) => Some(p.clone()),
        _ => None,
    }
}

fn aggregate(resolved: Vec<Value>) -> Result<Vec<Value>, Poison> {
    let errors: Vec<CascadaError> = resolved
        .iter()
        .filter_map(|v| match v {
            Value::Poison(p) => Some(p.errors().to_vec()),
            _ => None,
        })
        .flatten()
        .collect();
    if errors.is_empty() {
        Ok(resolved)
    } else {
        Err(Poison::from_errors(errors))
    }
}

/// `resolveAll(values)`: awaits every entry (left-to-right, so error
/// order follows resolution order) and aggregates errors into one Poison
/// if any failed.
pub async fn resolve_all(values: Vec<Value>) -> Value {
    let resolved = futures::future::join_all(values.into_iter().map(Value::resolve_self)).await;
    match aggregate(resolved) {
        Ok(values) => Value::list(values),
        Err(poison) => Value::Poison(poison),
    }
}

/// `resolveObjectProperties(obj)`: awaits each top-level property (no
/// deep/nested resolution — see [`create_object`] for the lazy deep
/// variant) and aggregates errors.
pub async fn resolve_object_properties(obj: IndexMap<String, Value>) -> Value {
    let keys: Vec<String> = obj.keys().cloned().collect();
    let values: Vec<Value> = obj.into_values().collect();
    let resolved = futures::future::join_all(values.into_iter().map(Value::resolve_self)).await;
    match aggregate(resolved) {
        Ok(values) => {
            let entries: IndexMap<String, Value> = keys.into_iter().zip(values).collect();
            Value::map(entries)
        }
        Err(poison) => Value::Poison(poison),
    }
}

/// Resolves one value one fence deeper than [`resolve_single`]: if the
/// settled value is a container that itself carries a lazy deep-resolve
/// marker (i.e. was built via [`create_array`]/[`create_object`]), that
/// marker is awaited too. Containers without a marker are left as-is —
/// deep resolution is opt-in at construction, never implicit.
fn deep_resolve_value(value: Value) -> BoxFuture {
    async move {
        match value.resolve_self().await {
            Value::List(list) => match list.resolve_marker.clone() {
                Some(marker) => marker.await,
                None => Value::List(list),
            },
            Value::Map(map) => match map.resolve_marker.clone() {
                Some(marker) => marker.await,
                None => Value::Map(map),
            },
            other => other,
        }
    }
    .boxed()
}

/// `createArray(arr)`: attaches a hidden resolve-marker that, when
/// awaited, resolves all direct children and any already-marked nested
/// children in one traversal — a lazy deep resolve, opt-in at
/// construction. The marker is a `Shared` future: awaiting the returned
/// value's marker twice reuses the same settlement and work.
pub fn create_array(items: Vec<Value>) -> Value {
    let capture = items.clone();
    let marker = async move {
        let resolved = futures::future::join_all(capture.into_iter().map(deep_resolve_value)).await;
        match aggregate(resolved) {
            Ok(values) => Value::list(values),
            Err(poison) => Value::Poison(poison),
        }
    }
    .boxed()
    .shared();

    Value::List(Arc::new(ListValue {
        items,
        resolve_marker: Some(marker),
    }))
}

/// `createObject(obj)`: the [`create_array`] contract, for maps.
pub fn create_object(entries: IndexMap<String, Value>) -> Value {
    let keys: Vec<String> = entries.keys().cloned().collect();
    let values: Vec<Value> = entries.values().cloned().collect();
    let marker = async move {
        let resolved = futures::future::join_all(values.into_iter().map(deep_resolve_value)).await;
        match aggregate(resolved) {
            Ok(values) => {
                let entries: IndexMap<String, Value> = keys.into_iter().zip(values).collect();
                Value::map(entries)
            }
            Err(poison) => Value::Poison(poison),
        }
    }
    .boxed()
    .shared();

    Value::Map(Arc::new(MapValue {
        entries,
        resolve_marker: Some(marker),
    }))
}

/// Awaits the deep-resolve marker on a container value directly (used by
/// fences — output emission, final flatten — that need a fully resolved
/// tree rather than one level at a time). Non-container or unmarked
/// values resolve exactly as [`resolve_single`] would.
pub async fn resolve_deep(value: Value) -> Value {
    deep_resolve_value(value).await
}
