//! Bounded-concurrency loop driver: parallel, bounded, and sequential
//! iteration over arrays, mappings, and async iterators, with loop
//! metadata, aggregated errors, and `else`-branch semantics.
//!
//! Mirrors [`crate::frame::run_async_branches`]'s shape: the driver owns
//! frame/buffer plumbing (one child frame + one child buffer node per
//! iteration, created and linked in source order before any iteration
//! actually runs) and the caller supplies a body closure that reads the
//! loop variable(s) and `loop` metadata back out of the frame it's handed.
//! That keeps buffer ordering a structural property of *when nodes are
//! linked*, not of *when bodies finish*.

use std::future::Future;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use indexmap::IndexMap;

use crate::buffer::{BufferArena, BufferId};
use crate::error::CascadaError;
use crate::frame::FrameArena;
use crate::poison::{create_poison, Poison};
use crate::value::{FrameId, Value};

/// How many loop variables a `for` clause declared. Object iteration
/// requires [`KeyValue`](LoopVarNames::KeyValue); using
/// [`Single`](LoopVarNames::Single) over a mapping is a dataflow error.
pub enum LoopVarNames {
    Single(String),
    KeyValue(String, String),
}

/// Normalizes pull-based async streams and single-shot coroutines behind
/// one `next()` fence (Design Note 5). `Value::Undefined` means
/// exhausted; any other settled `Value` (including `Value::Poison`) is a
/// yielded item. This is why the contract isn't `Option<Value>`: a
/// yielded `undefined` and an exhausted stream must stay distinguishable
/// from each other and from a yielded `Poison`.
#[async_trait::async_trait]
pub trait AsyncValueIterator: Send {
    async fn next(&mut self) -> Value;

    /// `Some(n)` only if the source can report its remaining length
    /// up front (e.g. it wraps an already-materialized buffer); `None`
    /// for genuine streams, which is the common case.
    fn known_length(&self) -> Option<usize> {
        None
    }
}

/// The three shapes a `for` loop can drive.
pub enum Iterable {
    Array(Vec<Value>),
    Map(IndexMap<String, Value>),
    AsyncIter(Box<dyn AsyncValueIterator>),
}

/// The resolved `of <expr>` clause. `Unbounded` covers "no clause",
/// `null`, `undefined`, and the literal `0` — all of those mean
/// unbounded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConcurrencyLimit {
    Unbounded,
    Bounded(usize),
}

impl ConcurrencyLimit {
    fn forces_sequential(self) -> bool {
        matches!(self, ConcurrencyLimit::Bounded(1))
    }
}

/// Validates an `of` clause value *before* any iteration or `else`
/// branch runs. Positive finite integers, `0`, `null`, and `undefined`
/// are legal; everything else — negative, NaN, infinite, non-numeric, or
/// already-poisoned — short-circuits.
pub fn validate_concurrency(v: &Value) -> Result<ConcurrencyLimit, Poison> {
    match v {
        Value::Null | Value::Undefined => Ok(ConcurrencyLimit::Unbounded),
        Value::Int(n) if *n == 0 => Ok(ConcurrencyLimit::Unbounded),
        Value::Int(n) if *n > 0 => Ok(ConcurrencyLimit::Bounded(*n as usize)),
        Value::Int(n) => Err(create_poison(CascadaError::dataflow(format!(
            "loop concurrency limit must not be negative, got {n}"
        )))),
        Value::Float(n) if n.is_nan() || n.is_infinite() => Err(create_poison(
            CascadaError::dataflow("loop concurrency limit must be finite"),
        )),
        Value::Float(n) if *n == 0.0 => Ok(ConcurrencyLimit::Unbounded),
        Value::Float(n) if *n > 0.0 && n.fract() == 0.0 => {
            Ok(ConcurrencyLimit::Bounded(*n as usize))
        }
        Value::Float(_) => Err(create_poison(CascadaError::dataflow(
            "loop concurrency limit must be an integer",
        ))),
        Value::Poison(p) => Err(p.clone()),
        other => Err(create_poison(CascadaError::dataflow(format!(
            "loop concurrency limit must be numeric, got {other:?}"
        )))),
    }
}

/// `loop.index`/`loop.first`/etc. Fields that depend on a known total
/// (`length`, `last`, `revindex*`) are `None` when that total genuinely
/// isn't knowable yet — never a sentinel value.
#[derive(Clone, Debug, Default)]
pub struct LoopMeta {
    pub index: usize,
    pub index0: usize,
    pub first: bool,
    pub last: Option<bool>,
    pub length: Option<usize>,
    pub revindex: Option<usize>,
    pub revindex0: Option<usize>,
}

impl LoopMeta {
    fn known(index0: usize, length: usize) -> Self {
        Self {
            index: index0 + 1,
            index0,
            first: index0 == 0,
            last: Some(index0 + 1 == length),
            length: Some(length),
            revindex: Some(length - index0),
            revindex0: Some(length - index0 - 1),
        }
    }

    /// For async-iterator loops where only "is there a next item"
    /// lookahead is available, not a total count.
    fn lookahead(index0: usize, last: Option<bool>) -> Self {
        Self {
            index: index0 + 1,
            index0,
            first: index0 == 0,
            last,
            length: None,
            revindex: None,
            revindex0: None,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut m = IndexMap::new();
        m.insert("index".into(), Value::Int(self.index as i64));
        m.insert("index0".into(), Value::Int(self.index0 as i64));
        m.insert("first".into(), Value::Bool(self.first));
        m.insert(
            "last".into(),
            self.last.map(Value::Bool).unwrap_or(Value::Undefined),
        );
        m.insert(
            "length".into(),
            self.length
                .map(|n| Value::Int(n as i64))
                .unwrap_or(Value::Undefined),
        );
        m.insert(
            "revindex".into(),
            self.revindex
                .map(|n| Value::Int(n as i64))
                .unwrap_or(Value::Undefined),
        );
        m.insert(
            "revindex0".into(),
            self.revindex0
                .map(|n| Value::Int(n as i64))
                .unwrap_or(Value::Undefined),
        );
        Value::map(m)
    }
}

/// A yielded value that is itself `Value::Poison` is converted before it
/// ever reaches loop variable binding — the body always sees poison
/// through the normal variable lookup path, never a special case.
fn bind_iteration_vars(item: Value, var_names: &LoopVarNames) -> Vec<(String, Value)> {
    match var_names {
        LoopVarNames::Single(name) => vec![(name.clone(), item)],
        LoopVarNames::KeyValue(k, v) => match item {
            Value::List(pair) if pair.items.len() == 2 => {
                vec![
                    (k.clone(), pair.items[0].clone()),
                    (v.clone(), pair.items[1].clone()),
                ]
            }
            other => vec![(k.clone(), Value::Undefined), (v.clone(), other)],
        },
    }
}

async fn prepare_iteration(
    frame_arena: &FrameArena,
    parent_frame: FrameId,
    buffer_arena: &BufferArena,
    parent_buf: BufferId,
    var_names: &LoopVarNames,
    item: Value,
    meta: LoopMeta,
) -> (FrameId, BufferId) {
    let child_frame = frame_arena.enter_child(parent_frame).await;
    let child_buf = buffer_arena.child().await;
    buffer_arena.link(parent_buf, child_buf).await;

    for (name, value) in bind_iteration_vars(item, var_names) {
        frame_arena.set(child_frame, &name, value, true).await;
    }
    frame_arena
        .set(child_frame, "loop", meta.to_value(), true)
        .await;

    (child_frame, child_buf)
}

/// Whether `object_loop` var arity matches the iterable kind. One-variable
/// object iteration is a dataflow error.
fn validate_arity(is_map: bool, var_names: &LoopVarNames) -> Result<(), Poison> {
    match (is_map, var_names) {
        (true, LoopVarNames::Single(_)) => Err(create_poison(CascadaError::dataflow(
            "iterating an object requires two loop variables (key, value)",
        ))),
        _ => Ok(()),
    }
}

/// Outcome of running the `for`/`else` pair: did any iteration run, and
/// the accumulated errors from every iteration's settlement. A yielded
/// item that is itself `Value::Poison` is bound to the loop variable(s)
/// like any other value — it only shows up here if the body goes on to
/// propagate it, same as any other per-iteration failure.
struct IterationOutcome {
    did_iterate: bool,
    body_errors: Vec<CascadaError>,
}

/// Drives one `for`/`else` loop to completion.
///
/// `body` is invoked once per iteration with that iteration's freshly
/// bound child frame and buffer node; it returns that iteration's
/// settlement (poison on failure). `else_body` runs at most once, in its
/// own child frame/buffer node, only when no iteration ran and the
/// iterable source itself didn't fail.
#[allow(clippy::too_many_arguments)]
pub async fn run_loop<B, Fut, E, FutE>(
    frame_arena: &FrameArena,
    parent_frame: FrameId,
    buffer_arena: &BufferArena,
    parent_buf: BufferId,
    iterable: Iterable,
    concurrency: &Value,
    force_sequential: bool,
    var_names: LoopVarNames,
    body: B,
    else_body: Option<E>,
) -> Value
where
    B: Fn(FrameId, BufferId) -> Fut,
    Fut: Future<Output = Value>,
    E: FnOnce(FrameId, BufferId) -> FutE,
    FutE: Future<Output = Value>,
{
    run_loop_with_default_cap(
        frame_arena,
        parent_frame,
        buffer_arena,
        parent_buf,
        iterable,
        concurrency,
        force_sequential,
        None,
        var_names,
        body,
        else_body,
    )
    .await
}

/// As [`run_loop`], but takes `default_async_iter_cap` —
/// [`crate::config::RuntimeConfig::default_async_iterator_concurrency`] —
/// applied only when the iterable is an async iterator *and* the `of`
/// clause was absent/unbounded. This is a resource guard, not a dataflow
/// semantic: array/mapping loops ignore it (their length is already
/// known up front), and it never forces sequential mode the way an
/// explicit `of 1` does.
#[allow(clippy::too_many_arguments)]
pub async fn run_loop_with_default_cap<B, Fut, E, FutE>(
    frame_arena: &FrameArena,
    parent_frame: FrameId,
    buffer_arena: &BufferArena,
    parent_buf: BufferId,
    iterable: Iterable,
    concurrency: &Value,
    force_sequential: bool,
    default_async_iter_cap: Option<usize>,
    var_names: LoopVarNames,
    body: B,
    else_body: Option<E>,
) -> Value
where
    B: Fn(FrameId, BufferId) -> Fut,
    Fut: Future<Output = Value>,
    E: FnOnce(FrameId, BufferId) -> FutE,
    FutE: Future<Output = Value>,
{
    if let Err(p) = validate_arity(matches!(iterable, Iterable::Map(_)), &var_names) {
        return Value::Poison(p);
    }
    let limit = match validate_concurrency(concurrency) {
        Ok(limit) => limit,
        Err(p) => return Value::Poison(p),
    };
    let sequential = force_sequential || limit.forces_sequential();
    let async_iter_limit = match (limit, default_async_iter_cap) {
        (ConcurrencyLimit::Unbounded, Some(cap)) => ConcurrencyLimit::Bounded(cap),
        (limit, _) => limit,
    };

    let outcome = match iterable {
        Iterable::Array(items) => {
            run_known_length(
                frame_arena,
                parent_frame,
                buffer_arena,
                parent_buf,
                items,
                limit,
                sequential,
                &var_names,
                &body,
            )
            .await
        }
        Iterable::Map(entries) => {
            let items: Vec<Value> = entries
                .into_iter()
                .map(|(k, v)| Value::list(vec![Value::str(k), v]))
                .collect();
            run_known_length(
                frame_arena,
                parent_frame,
                buffer_arena,
                parent_buf,
                items,
                limit,
                sequential,
                &var_names,
                &body,
            )
            .await
        }
        Iterable::AsyncIter(iter) => {
            run_async_iter(
                frame_arena,
                parent_frame,
                buffer_arena,
                parent_buf,
                iter,
                async_iter_limit,
                sequential,
                &var_names,
                &body,
            )
            .await
        }
    };

    if !outcome.body_errors.is_empty() {
        return Value::Poison(Poison::from_errors(outcome.body_errors));
    }

    if !outcome.did_iterate {
        if let Some(else_body) = else_body {
            let child_frame = frame_arena.enter_child(parent_frame).await;
            let child_buf = buffer_arena.child().await;
            buffer_arena.link(parent_buf, child_buf).await;
            let result = else_body(child_frame, child_buf).await;
            frame_arena.exit(child_frame).await;
            return result;
        }
    }

    Value::Bool(true)
}

#[allow(clippy::too_many_arguments)]
async fn run_known_length<B, Fut>(
    frame_arena: &FrameArena,
    parent_frame: FrameId,
    buffer_arena: &BufferArena,
    parent_buf: BufferId,
    items: Vec<Value>,
    limit: ConcurrencyLimit,
    sequential: bool,
    var_names: &LoopVarNames,
    body: &B,
) -> IterationOutcome
where
    B: Fn(FrameId, BufferId) -> Fut,
    Fut: Future<Output = Value>,
{
    let length = items.len();
    if length == 0 {
        return IterationOutcome {
            did_iterate: false,
            body_errors: Vec::new(),
        };
    }

    // Every child frame/buffer node is created and linked up front, in
    // source order, before a single body future is polled — this is what
    // makes parallel completion order irrelevant to output order.
    let mut prepared = Vec::with_capacity(length);
    for (index0, item) in items.into_iter().enumerate() {
        let meta = LoopMeta::known(index0, length);
        prepared.push(
            prepare_iteration(
                frame_arena,
                parent_frame,
                buffer_arena,
                parent_buf,
                var_names,
                item,
                meta,
            )
            .await,
        );
    }

    let mut body_errors = Vec::new();
    if sequential {
        for (child_frame, child_buf) in &prepared {
            let result = body(*child_frame, *child_buf).await;
            if let Value::Poison(p) = result {
                body_errors.extend(p.errors().iter().cloned());
            }
        }
    } else {
        let cap = match limit {
            ConcurrencyLimit::Unbounded => length,
            ConcurrencyLimit::Bounded(n) => n.max(1),
        };
        let mut pending: FuturesUnordered<Fut> = FuturesUnordered::new();
        let mut queue = prepared.iter();
        for (child_frame, child_buf) in queue.by_ref().take(cap) {
            pending.push(body(*child_frame, *child_buf));
        }
        while let Some(result) = pending.next().await {
            if let Value::Poison(p) = result {
                body_errors.extend(p.errors().iter().cloned());
            }
            if let Some((child_frame, child_buf)) = queue.next() {
                pending.push(body(*child_frame, *child_buf));
            }
        }
    }

    for (child_frame, _) in &prepared {
        frame_arena.exit(*child_frame).await;
    }

    IterationOutcome {
        did_iterate: true,
        body_errors,
    }
}

/// Pulls from an [`AsyncValueIterator`] with at most `cap` outstanding
/// `next()` reads, running bodies concurrently as items arrive. Buffer
/// nodes are linked to `parent_buf` in pull order, which for a single
/// forward-only stream *is* source order, so output ordering falls out
/// the same way it does for the known-length path.
#[allow(clippy::too_many_arguments)]
async fn run_async_iter<B, Fut>(
    frame_arena: &FrameArena,
    parent_frame: FrameId,
    buffer_arena: &BufferArena,
    parent_buf: BufferId,
    mut iter: Box<dyn AsyncValueIterator>,
    limit: ConcurrencyLimit,
    sequential: bool,
    var_names: &LoopVarNames,
    body: &B,
) -> IterationOutcome
where
    B: Fn(FrameId, BufferId) -> Fut,
    Fut: Future<Output = Value>,
{
    let known_length = iter.known_length();
    // `of 1` over an async iterator behaves like a plain `while` loop: no
    // lookahead, so `last`/`length`/`revindex*` never become available.
    let no_lookahead = sequential && matches!(limit, ConcurrencyLimit::Bounded(1));

    let mut did_iterate = false;
    let mut body_errors = Vec::new();
    let mut index0 = 0usize;

    if sequential {
        let mut pending_next = iter.next().await;
        loop {
            let current = pending_next;
            if current.is_undefined() {
                break;
            }
            let lookahead_last = if no_lookahead {
                None
            } else {
                pending_next = iter.next().await;
                Some(pending_next.is_undefined())
            };

            did_iterate = true;
            let meta = known_length
                .map(|len| LoopMeta::known(index0, len))
                .unwrap_or_else(|| LoopMeta::lookahead(index0, lookahead_last));
            let (child_frame, child_buf) = prepare_iteration(
                frame_arena,
                parent_frame,
                buffer_arena,
                parent_buf,
                var_names,
                current,
                meta,
            )
            .await;
            let result = body(child_frame, child_buf).await;
            if let Value::Poison(p) = result {
                body_errors.extend(p.errors().iter().cloned());
            }
            frame_arena.exit(child_frame).await;

            index0 += 1;
            if no_lookahead {
                pending_next = iter.next().await;
                if pending_next.is_undefined() {
                    break;
                }
            }
        }
    } else {
        let cap = match limit {
            ConcurrencyLimit::Unbounded => usize::MAX,
            ConcurrencyLimit::Bounded(n) => n.max(1),
        };
        let mut pending: FuturesUnordered<Fut> = FuturesUnordered::new();
        let mut exhausted = false;

        // Admission pool: keep at most `cap` reads+bodies outstanding.
        // `next()` is only ever called while no other read is racing it
        // (this function owns `iter` exclusively), so "outstanding next()
        // reads" and "outstanding bodies" share the same admission count.
        while !exhausted || !pending.is_empty() {
            while !exhausted && pending.len() < cap {
                let item = iter.next().await;
                if item.is_undefined() {
                    exhausted = true;
                    break;
                }
                did_iterate = true;
                let meta = known_length
                    .map(|len| LoopMeta::known(index0, len))
                    .unwrap_or_else(|| LoopMeta::lookahead(index0, None));
                let (child_frame, child_buf) = prepare_iteration(
                    frame_arena,
                    parent_frame,
                    buffer_arena,
                    parent_buf,
                    var_names,
                    item,
                    meta,
                )
                .await;
                index0 += 1;
                pending.push(body(child_frame, child_buf));
            }
            if let Some(result) = pending.next().await {
                if let Value::Poison(p) = result {
                    body_errors.extend(p.errors().iter().cloned());
                }
            }
        }
    }

    IterationOutcome {
        did_iterate,
        body_errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{flatten, HandlerRegistry};
    use crate::error::CascadaErrorKind;
    use futures::future::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    async fn read_var(frame_arena: &FrameArena, frame: FrameId, name: &str) -> Value {
        frame_arena.lookup(frame, name).await.unwrap()
    }

    #[tokio::test]
    async fn sequential_mode_runs_one_at_a_time_in_source_order() {
        let frame_arena = FrameArena::new();
        let buffer_arena = BufferArena::new();
        let root_frame = frame_arena.create_root().await;
        let root_buf = buffer_arena.child().await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let order_clone = order.clone();
        let frame_arena_ref = &frame_arena;

        let result = run_loop(
            &frame_arena,
            root_frame,
            &buffer_arena,
            root_buf,
            Iterable::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
            &Value::Null,
            true,
            LoopVarNames::Single("x".into()),
            move |fid, _buf| {
                let order = order_clone.clone();
                async move {
                    let x = read_var(frame_arena_ref, fid, "x").await;
                    if let Value::Int(n) = x {
                        order.lock().unwrap().push(n);
                    }
                    Value::Bool(true)
                }
            },
            None::<fn(FrameId, BufferId) -> futures::future::Ready<Value>>,
        )
        .await;

        assert!(matches!(result, Value::Bool(true)));
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn parallel_mode_preserves_buffer_order_regardless_of_completion_order() {
        let frame_arena = FrameArena::new();
        let buffer_arena = BufferArena::new();
        let root_frame = frame_arena.create_root().await;
        let root_buf = buffer_arena.child().await;

        let frame_arena_ref = &frame_arena;
        let buffer_arena_ref = &buffer_arena;

        let result = run_loop(
            &frame_arena,
            root_frame,
            &buffer_arena,
            root_buf,
            Iterable::Array(vec![Value::Int(0), Value::Int(1), Value::Int(2)]),
            &Value::Null,
            false,
            LoopVarNames::Single("x".into()),
            move |fid, buf| async move {
                let x = read_var(frame_arena_ref, fid, "x").await;
                let n = match x {
                    Value::Int(n) => n,
                    _ => 0,
                };
                // Reverse-sleep so index 0 finishes last in real time.
                tokio::time::sleep(std::time::Duration::from_millis((2 - n) as u64 * 5)).await;
                buffer_arena_ref.link(buf, buffer_arena_ref.text(n.to_string()).await).await;
                Value::Bool(true)
            },
            None::<fn(FrameId, BufferId) -> futures::future::Ready<Value>>,
        )
        .await;
        assert!(matches!(result, Value::Bool(true)));

        let registry = HandlerRegistry::new();
        let flattened = flatten(&buffer_arena, root_buf, &registry).await.unwrap();
        assert_eq!(flattened.text, "012");
    }

    #[tokio::test]
    async fn bounded_mode_caps_max_in_flight() {
        let frame_arena = FrameArena::new();
        let buffer_arena = BufferArena::new();
        let root_frame = frame_arena.create_root().await;
        let root_buf = buffer_arena.child().await;

        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let processed = Arc::new(AtomicUsize::new(0));

        let items: Vec<Value> = (0..64).map(Value::Int).collect();

        let in_flight_c = in_flight.clone();
        let max_in_flight_c = max_in_flight.clone();
        let processed_c = processed.clone();

        let result = run_loop(
            &frame_arena,
            root_frame,
            &buffer_arena,
            root_buf,
            Iterable::Array(items),
            &Value::Int(5),
            false,
            LoopVarNames::Single("x".into()),
            move |_fid, _buf| {
                let in_flight = in_flight_c.clone();
                let max_in_flight = max_in_flight_c.clone();
                let processed = processed_c.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_micros(200)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    processed.fetch_add(1, Ordering::SeqCst);
                    Value::Bool(true)
                }
            },
            None::<fn(FrameId, BufferId) -> futures::future::Ready<Value>>,
        )
        .await;

        assert!(matches!(result, Value::Bool(true)));
        assert!(max_in_flight.load(Ordering::SeqCst) <= 5);
        assert_eq!(processed.load(Ordering::SeqCst), 64);
    }

    #[tokio::test]
    async fn object_iteration_with_one_variable_is_a_dataflow_error() {
        let frame_arena = FrameArena::new();
        let buffer_arena = BufferArena::new();
        let root_frame = frame_arena.create_root().await;
        let root_buf = buffer_arena.child().await;

        let mut entries = IndexMap::new();
        entries.insert("a".to_string(), Value::Int(1));

        let result = run_loop(
            &frame_arena,
            root_frame,
            &buffer_arena,
            root_buf,
            Iterable::Map(entries),
            &Value::Null,
            false,
            LoopVarNames::Single("v".into()),
            |_fid, _buf| async { Value::Bool(true) },
            None::<fn(FrameId, BufferId) -> futures::future::Ready<Value>>,
        )
        .await;

        match result {
            Value::Poison(p) => assert_eq!(p.errors()[0].kind, CascadaErrorKind::Dataflow),
            other => panic!("expected poison, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn negative_concurrency_short_circuits_before_any_iteration() {
        let frame_arena = FrameArena::new();
        let buffer_arena = BufferArena::new();
        let root_frame = frame_arena.create_root().await;
        let root_buf = buffer_arena.child().await;

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_c = ran.clone();

        let result = run_loop(
            &frame_arena,
            root_frame,
            &buffer_arena,
            root_buf,
            Iterable::Array(vec![Value::Int(1)]),
            &Value::Int(-1),
            false,
            LoopVarNames::Single("x".into()),
            move |_fid, _buf| {
                let ran = ran_c.clone();
                async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Value::Bool(true)
                }
            },
            None::<fn(FrameId, BufferId) -> futures::future::Ready<Value>>,
        )
        .await;

        assert!(result.is_poison());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn else_branch_runs_only_when_no_iteration_happened() {
        let frame_arena = FrameArena::new();
        let buffer_arena = BufferArena::new();
        let root_frame = frame_arena.create_root().await;
        let root_buf = buffer_arena.child().await;

        let result = run_loop(
            &frame_arena,
            root_frame,
            &buffer_arena,
            root_buf,
            Iterable::Array(Vec::new()),
            &Value::Null,
            false,
            LoopVarNames::Single("x".into()),
            |_fid, _buf| async { Value::Bool(true) },
            Some(|_fid, _buf| async { Value::Int(99) }),
        )
        .await;

        assert!(matches!(result, Value::Int(99)));
    }

    #[tokio::test]
    async fn array_loop_metadata_is_always_fully_known() {
        let frame_arena = FrameArena::new();
        let buffer_arena = BufferArena::new();
        let root_frame = frame_arena.create_root().await;
        let root_buf = buffer_arena.child().await;
        let frame_arena_ref = &frame_arena;

        let seen_last = Arc::new(Mutex::new(Vec::new()));
        let seen_last_c = seen_last.clone();

        run_loop(
            &frame_arena,
            root_frame,
            &buffer_arena,
            root_buf,
            Iterable::Array(vec![Value::Int(1), Value::Int(2)]),
            &Value::Int(1),
            false,
            LoopVarNames::Single("x".into()),
            move |fid, _buf| {
                let seen_last = seen_last_c.clone();
                async move {
                    if let Value::Map(m) = read_var(frame_arena_ref, fid, "loop").await {
                        seen_last.lock().unwrap().push(m.entries.get("last").cloned());
                    }
                    Value::Bool(true)
                }
            },
            None::<fn(FrameId, BufferId) -> futures::future::Ready<Value>>,
        )
        .await;

        let seen = seen_last.lock().unwrap();
        assert!(matches!(seen[0], Some(Value::Bool(false))));
        assert!(matches!(seen[1], Some(Value::Bool(true))));
    }

    struct VecAsyncIter {
        items: std::collections::VecDeque<Value>,
    }

    #[async_trait::async_trait]
    impl AsyncValueIterator for VecAsyncIter {
        async fn next(&mut self) -> Value {
            self.items.pop_front().unwrap_or(Value::Undefined)
        }
    }

    #[tokio::test]
    async fn bounded_one_over_async_iterator_has_no_length_metadata() {
        let frame_arena = FrameArena::new();
        let buffer_arena = BufferArena::new();
        let root_frame = frame_arena.create_root().await;
        let root_buf = buffer_arena.child().await;
        let frame_arena_ref = &frame_arena;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_c = seen.clone();

        let iter = VecAsyncIter {
            items: vec![Value::Int(1), Value::Int(2)].into(),
        };

        run_loop(
            &frame_arena,
            root_frame,
            &buffer_arena,
            root_buf,
            Iterable::AsyncIter(Box::new(iter)),
            &Value::Int(1),
            false,
            LoopVarNames::Single("x".into()),
            move |fid, _buf| {
                let seen = seen_c.clone();
                async move {
                    if let Value::Map(m) = read_var(frame_arena_ref, fid, "loop").await {
                        seen.lock()
                            .unwrap()
                            .push((m.entries.get("last").cloned(), m.entries.get("length").cloned()));
                    }
                    Value::Bool(true)
                }
            },
            None::<fn(FrameId, BufferId) -> futures::future::Ready<Value>>,
        )
        .await;

        for (last, length) in seen.lock().unwrap().iter() {
            assert!(matches!(last, Some(Value::Undefined)));
            assert!(matches!(length, Some(Value::Undefined)));
        }
    }

    #[tokio::test]
    async fn yielded_poison_item_binds_to_the_loop_variable_like_any_other_value() {
        // A yielded Poison enters the body through the ordinary
        // loop-variable fence rather than short-circuiting the loop.
        // Whether it ends up in the final result depends on what the
        // body does with it, same as any other per-iteration value.
        let frame_arena = FrameArena::new();
        let buffer_arena = BufferArena::new();
        let root_frame = frame_arena.create_root().await;
        let root_buf = buffer_arena.child().await;
        let frame_arena_ref = &frame_arena;

        let iter = VecAsyncIter {
            items: vec![
                Value::Poison(create_poison(CascadaError::user("stream boom"))),
                Value::Int(2),
            ]
            .into(),
        };

        let result = run_loop(
            &frame_arena,
            root_frame,
            &buffer_arena,
            root_buf,
            Iterable::AsyncIter(Box::new(iter)),
            &Value::Null,
            true,
            LoopVarNames::Single("x".into()),
            move |fid, _buf| async move { read_var(frame_arena_ref, fid, "x").await },
            None::<fn(FrameId, BufferId) -> futures::future::Ready<Value>>,
        )
        .await;

        assert!(result.is_poison());
    }

    #[tokio::test]
    async fn default_async_iter_cap_bounds_an_unbounded_for_clause() {
        // RuntimeConfig::default_async_iterator_concurrency, applied here via
        // run_loop_with_default_cap: no explicit `of` clause (Value::Null,
        // i.e. Unbounded) over an async iterator of unknown length still
        // gets an admission-pool cap from the environment default.
        let frame_arena = FrameArena::new();
        let buffer_arena = BufferArena::new();
        let root_frame = frame_arena.create_root().await;
        let root_buf = buffer_arena.child().await;

        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));

        let iter = VecAsyncIter {
            items: (0..20).map(Value::Int).collect(),
        };

        let in_flight_c = in_flight.clone();
        let max_in_flight_c = max_in_flight.clone();

        let result = run_loop_with_default_cap(
            &frame_arena,
            root_frame,
            &buffer_arena,
            root_buf,
            Iterable::AsyncIter(Box::new(iter)),
            &Value::Null,
            false,
            Some(3),
            LoopVarNames::Single("x".into()),
            move |_fid, _buf| {
                let in_flight = in_flight_c.clone();
                let max_in_flight = max_in_flight_c.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_micros(200)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Value::Bool(true)
                }
            },
            None::<fn(FrameId, BufferId) -> futures::future::Ready<Value>>,
        )
        .await;

        assert!(matches!(result, Value::Bool(true)));
        assert!(max_in_flight.load(Ordering::SeqCst) <= 3);
    }
}
