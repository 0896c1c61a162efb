//! Call/lookup/loop plumbing: thin wrappers that route calls, member
//! lookups, and `for` loops through the value, resolution, frame, lock,
//! and loop-driver layers uniformly. This is the surface a compiled call
//! site talks to — `call_wrap_async`, `member_lookup_async`, their
//! sequence-lock variants, `context_or_frame_lookup`, and `run_loop_async`
//! — kept here as free functions with no knowledge of lexing/parsing/AST;
//! this crate doesn't own a compiler front end.

use std::future::Future;

use crate::buffer::{BufferArena, BufferId};
use crate::environment::Environment;
use crate::error::CascadaError;
use crate::frame::FrameArena;
use crate::lock::{with_sequence_locks, LockMode};
use crate::loop_driver::{self, Iterable, LoopVarNames};
use crate::poison::create_poison;
use crate::resolve::resolve_single;
use crate::value::{CallArgs, CallContext, FrameId, Value};

/// `callWrapAsync(callable, name, context, args, errorContext)`: resolves
/// `callable`, short-circuits on poison, and invokes it with resolved
/// arguments. Macros/globals (`is_macro_or_global`) receive the caller's
/// frame through [`CallContext`]; ordinary functions don't.
pub async fn call_wrap_async(
    callable: Value,
    args: CallArgs,
    frame: Option<FrameId>,
    error_context: &str,
) -> Value {
    let callable = match callable.resolve_self().await {
        Value::Poison(p) => return Value::Poison(p),
        other => other,
    };
    let Value::Callable(callable) = callable else {
        return Value::Poison(create_poison(
            CascadaError::dataflow(format!("'{error_context}' is not callable")).with_context(error_context),
        ));
    };
    let ctx = CallContext {
        frame: callable.is_macro_or_global.then_some(frame).flatten(),
    };
    let result = callable.call(args, ctx).await;
    resolve_single(result).await
}

/// `memberLookupAsync(target, key, errorContext)`: resolves `target`,
/// short-circuits on poison, then dispatches to the right
/// [`LookupTarget`] implementation (Design Note 2 — replaces duck-typed
/// member access with dispatch over a small closed set of shapes).
pub async fn member_lookup_async(target: Value, key: &str, error_context: &str) -> Value {
    match target.resolve_self().await {
        Value::Poison(p) => Value::Poison(p),
        Value::Map(m) => m
            .entries
            .get(key)
            .cloned()
            .unwrap_or(Value::Undefined),
        Value::List(l) => match key.parse::<usize>() {
            Ok(idx) => l.items.get(idx).cloned().unwrap_or(Value::Undefined),
            Err(_) => Value::Poison(create_poison(
                CascadaError::dataflow(format!("cannot look up non-numeric key '{key}' on a list"))
                    .with_context(error_context),
            )),
        },
        Value::Undefined | Value::Null => Value::Undefined,
        other => Value::Poison(create_poison(
            CascadaError::dataflow(format!(
                "cannot look up member '{key}' on {other:?}"
            ))
            .with_context(error_context),
        )),
    }
}

/// `contextOrFrameLookup(context, frame, name)`: the render context
/// (top-level template/script variables, supplied once per render) is
/// the fallback when a name isn't bound anywhere in the live frame chain
/// — mirrors how the source falls back from lexical scope to the
/// render-time context object.
pub async fn context_or_frame_lookup(
    context: &Value,
    frame_arena: &FrameArena,
    frame: FrameId,
    name: &str,
) -> Value {
    if let Some(v) = frame_arena.lookup(frame, name).await {
        return v;
    }
    match context {
        Value::Map(m) => m.entries.get(name).cloned().unwrap_or(Value::Undefined),
        _ => Value::Undefined,
    }
}

/// The sequence-lock variant of [`call_wrap_async`]: `x!.foo()` compiles
/// to this, with `lock_name` naming the path being coordinated and
/// `mode`/`repair` selecting which side of [`crate::frame::LockSlot`] it
/// acquires.
#[allow(clippy::too_many_arguments)]
pub async fn sequence_call_async<F, Fut>(
    frame_arena: &FrameArena,
    frame: FrameId,
    lock_name: &str,
    mode: LockMode,
    error_context: &str,
    repair: bool,
    op: F,
) -> Value
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Value> + Send + 'static,
{
    with_sequence_locks(frame_arena, frame, lock_name, error_context, repair, mode, op).await
}

/// What a compiled `for` loop actually calls: [`loop_driver::run_loop`]
/// knows nothing about `Environment`, so this is where
/// [`crate::config::RuntimeConfig::default_async_iterator_concurrency`]
/// gets forwarded into the driver's `default_async_iter_cap` parameter.
/// Array/mapping loops and loops with an explicit `of` clause ignore the
/// cap (see [`loop_driver::run_loop_with_default_cap`]); only an
/// unbounded async-iterator loop is affected.
#[allow(clippy::too_many_arguments)]
pub async fn run_loop_async<B, Fut, E, FutE>(
    env: &Environment,
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
    loop_driver::run_loop_with_default_cap(
        frame_arena,
        parent_frame,
        buffer_arena,
        parent_buf,
        iterable,
        concurrency,
        force_sequential,
        env.config().default_async_iterator_concurrency,
        var_names,
        body,
        else_body,
    )
    .await
}
