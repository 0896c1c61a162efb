//! The runtime value model: every value that flows through the dataflow
//! graph, plus the suspension/poison handles that make that flow async
//! and failure-tolerant.
//!
//! A `Value` is one of: scalar, container (list/map), callable, suspended
//! (a handle to a future concrete value or poison), or poison itself.
//! `Suspended` and `Poison` both implement [`Awaitable`] so the rest of the
//! runtime can treat "the thing I'm holding might not be ready yet" and
//! "the thing I'm holding already failed" uniformly (Design Note 1:
//! thenable polymorphism realized via trait dispatch instead of duck
//! typing). `then`/`catch`/`finally` live as `then_async`/`catch_async`/
//! `finally_async` on [`Value`], built on top of `Awaitable::resolve`;
//! [`SuspendedHandle`] and [`Poison`] additionally implement
//! `std::future::IntoFuture`, so plain `.await` on either one yields a
//! `Result<Value, PoisonError>` directly for callers that want that
//! ergonomic instead.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::entrylist::Entry;
use crate::poison::{Poison, PoisonError};

/// Opaque handle to a [`crate::frame::Frame`]; defined here (rather than
/// in `frame.rs`) so value-layer types like [`CallContext`] can reference
/// "which frame is this call happening in" without this module depending
/// on the frame module.
pub type FrameId = Entry;

/// A future that resolves to a concrete `Value` or `Value::Poison` —
/// never to a Rust `Err`. Dataflow failures are data, not exceptions.
pub type BoxFuture = futures::future::BoxFuture<'static, Value>;

/// `Shared` so a handle observed twice settles once and yields the same
/// result both times: awaiting it is idempotent, polling is cheap, and a
/// lock chain can be wrapped once and awaited from many call sites
/// without re-running its underlying work.
pub type SharedFuture = futures::future::Shared<BoxFuture>;

/// The suspended-value protocol — `then`/`catch`/`finally` — realized
/// here as a single `resolve` fence that both `Poison` and a real
/// suspended handle implement.
#[async_trait::async_trait]
pub trait Awaitable: Send + Sync {
    async fn resolve(&self) -> Value;
}

/// A handle representing a future result. Cloning a handle and awaiting
/// both clones settles them to the same value exactly once, because they
/// share the same underlying `Shared` future.
#[derive(Clone)]
pub struct SuspendedHandle(SharedFuture);

impl SuspendedHandle {
    pub fn new(fut: BoxFuture) -> Self {
        Self(fut.shared())
    }

    pub fn from_shared(shared: SharedFuture) -> Self {
        Self(shared)
    }

    pub fn shared(&self) -> SharedFuture {
        self.0.clone()
    }
}

impl fmt::Debug for SuspendedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SuspendedHandle(..)")
    }
}

#[async_trait::async_trait]
impl Awaitable for SuspendedHandle {
    async fn resolve(&self) -> Value {
        self.0.clone().await
    }
}

#[async_trait::async_trait]
impl Awaitable for Poison {
    /// Poison is polymorphic over the Suspended protocol: resolving it is
    /// idempotent and simply hands back itself.
    async fn resolve(&self) -> Value {
        Value::Poison(self.clone())
    }
}

use futures::future::FutureExt;

/// Native `.await` ergonomics on top of [`Awaitable::resolve`]: a caller
/// that wants a `Result` rather than a `Value` that might itself be
/// `Value::Poison` gets it for free from `.await`'s own `IntoFuture`
/// desugaring, instead of having to call `resolve()` and match on the
/// outcome by hand.
impl std::future::IntoFuture for SuspendedHandle {
    type Output = Result<Value, PoisonError>;
    type IntoFuture = futures::future::BoxFuture<'static, Result<Value, PoisonError>>;

    fn into_future(self) -> Self::IntoFuture {
        async move {
            match self.resolve().await {
                Value::Poison(p) => Err(p.into_error()),
                settled => Ok(settled),
            }
        }
        .boxed()
    }
}

/// As [`SuspendedHandle`]'s impl: `Poison` is already-settled, so awaiting
/// it yields `Err` immediately without ever polling anything.
impl std::future::IntoFuture for Poison {
    type Output = Result<Value, PoisonError>;
    type IntoFuture = futures::future::BoxFuture<'static, Result<Value, PoisonError>>;

    fn into_future(self) -> Self::IntoFuture {
        async move { Err(self.into_error()) }.boxed()
    }
}

/// Ordered sequence of values, with an optional lazy deep-resolve marker
/// attached by [`crate::resolve::create_array`].
pub struct ListValue {
    pub items: Vec<Value>,
    pub(crate) resolve_marker: Option<SharedFuture>,
}

impl ListValue {
    pub fn new(items: Vec<Value>) -> Self {
        Self {
            items,
            resolve_marker: None,
        }
    }
}

/// Insertion-ordered string-keyed mapping, with the same lazy deep-resolve
/// marker as [`ListValue`].
pub struct MapValue {
    pub entries: IndexMap<String, Value>,
    pub(crate) resolve_marker: Option<SharedFuture>,
}

impl MapValue {
    pub fn new(entries: IndexMap<String, Value>) -> Self {
        Self {
            entries,
            resolve_marker: None,
        }
    }
}

/// A single named parameter of a [`Callable`], with an optional default.
#[derive(Clone, Debug)]
pub struct ParamSpec {
    pub name: String,
    pub default: Option<Value>,
}

/// Positional and named arguments passed to a call.
#[derive(Clone, Debug, Default)]
pub struct CallArgs {
    pub positional: Vec<Value>,
    pub named: IndexMap<String, Value>,
}

impl CallArgs {
    pub fn positional(values: Vec<Value>) -> Self {
        Self {
            positional: values,
            named: IndexMap::new(),
        }
    }
}

/// Context handed to a [`Callable`] at invocation time. Macros/globals
/// receive the caller's frame (so they can read/write lexically-scoped
/// names and lock slots); plain functions do not.
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    pub frame: Option<FrameId>,
}

pub type CallableFn =
    Arc<dyn Fn(CallArgs, CallContext) -> BoxFuture + Send + Sync>;

/// A function-like value. `is_macro_or_global` controls what context it
/// receives at call time: macros/globals see the caller frame, ordinary
/// functions only see their arguments.
#[derive(Clone)]
pub struct Callable {
    pub name: String,
    pub params: Vec<ParamSpec>,
    pub is_macro_or_global: bool,
    func: CallableFn,
}

impl Callable {
    pub fn new(
        name: impl Into<String>,
        params: Vec<ParamSpec>,
        is_macro_or_global: bool,
        func: CallableFn,
    ) -> Self {
        Self {
            name: name.into(),
            params,
            is_macro_or_global,
            func,
        }
    }

    pub fn call(&self, args: CallArgs, ctx: CallContext) -> BoxFuture {
        (self.func)(args, ctx)
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable")
            .field("name", &self.name)
            .field("is_macro_or_global", &self.is_macro_or_global)
            .finish_non_exhaustive()
    }
}

/// The runtime value: every shape data can take as it flows through the
/// dataflow graph.
#[derive(Clone)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Null,
    Undefined,
    List(Arc<ListValue>),
    Map(Arc<MapValue>),
    Callable(Arc<Callable>),
    Suspended(SuspendedHandle),
    Poison(Poison),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(n) => write!(f, "Int({n})"),
            Value::Float(n) => write!(f, "Float({n})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::Null => write!(f, "Null"),
            Value::Undefined => write!(f, "Undefined"),
            Value::List(l) => write!(f, "List({:?})", l.items),
            Value::Map(m) => write!(f, "Map({:?})", m.entries),
            Value::Callable(c) => write!(f, "Callable({})", c.name),
            Value::Suspended(_) => write!(f, "Suspended(..)"),
            Value::Poison(p) => write!(f, "Poison({:?})", p.errors()),
        }
    }
}

impl Value {
    pub fn str(s: impl Into<Arc<str>>) -> Value {
        Value::Str(s.into())
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Arc::new(ListValue::new(items)))
    }

    pub fn map(entries: IndexMap<String, Value>) -> Value {
        Value::Map(Arc::new(MapValue::new(entries)))
    }

    pub fn suspended(fut: BoxFuture) -> Value {
        Value::Suspended(SuspendedHandle::new(fut))
    }

    pub fn is_poison(&self) -> bool {
        matches!(self, Value::Poison(_))
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, Value::Suspended(_))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Renders a settled, non-poison, non-suspended value as output text.
    /// HTML/output-escaping policy is a templating-layer concern this
    /// crate deliberately leaves out — this is the bare stringification
    /// [`crate::buffer::flatten`] applies before a higher layer escapes
    /// it.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Bool(b) => b.to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(n) => n.to_string(),
            Value::Str(s) => s.to_string(),
            Value::Null | Value::Undefined => String::new(),
            Value::List(_) | Value::Map(_) | Value::Callable(_) => format!("{self:?}"),
            Value::Suspended(_) | Value::Poison(_) => String::new(),
        }
    }

    /// Resolves one suspension fence: if `self` is `Suspended`, awaits it;
    /// any other variant (including `Poison`) is already settled and is
    /// returned unchanged. This is the minimal fence primitive the rest
    /// of the value and resolution layers build on; it never produces a
    /// Rust `Err`.
    pub async fn resolve_self(self) -> Value {
        match self {
            Value::Suspended(handle) => handle.resolve().await,
            other => other,
        }
    }

    /// `then(onFulfilled, onRejected?)` without a rejection handler:
    /// poison passes through unchanged, everything else resolves and is
    /// handed to `on_fulfilled`.
    pub async fn then_async<F, Fut>(self, on_fulfilled: F) -> Value
    where
        F: FnOnce(Value) -> Fut + Send,
        Fut: std::future::Future<Output = Value> + Send,
    {
        match self.resolve_self().await {
            Value::Poison(p) => Value::Poison(p),
            settled => on_fulfilled(settled).await,
        }
    }

    /// `catch(onRejected)`: calls the handler with a `PoisonError` when
    /// settlement is poison; otherwise passes the resolved value through.
    pub async fn catch_async<F, Fut>(self, on_rejected: F) -> Value
    where
        F: FnOnce(PoisonError) -> Fut + Send,
        Fut: std::future::Future<Output = Value> + Send,
    {
        match self.resolve_self().await {
            Value::Poison(p) => on_rejected(p.into_error()).await,
            settled => settled,
        }
    }

    /// `finally(onFinally)`: always runs, regardless of settlement;
    /// panics/failures inside `on_finally` are swallowed and the original
    /// settlement (poison or not) survives. Isolated via `tokio::spawn` so
    /// a panicking `on_finally` cannot unwind into the caller.
    pub async fn finally_async<F, Fut>(self, on_finally: F) -> Value
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let settled = self.resolve_self().await;
        let _ = tokio::spawn(on_finally()).await;
        settled
    }
}
