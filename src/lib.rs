//! `cascada_core`: the asynchronous, parallel-by-default dataflow
//! evaluation runtime underlying the Cascada templating/scripting engine.
//!
//! See `DESIGN.md` for the grounding ledger. Module layout mirrors the
//! dependency order of the runtime's components, leaves first: `value`
//! (the value/poison model) → `resolve` (the resolution layer) →
//! `frame` (lexical scopes) → `lock` (the sequence-lock coordinator) →
//! {`buffer` (the output buffer and command handlers), `loop_driver`
//! (the loop driver)} → `glue`, with `environment` as the public
//! surface on top and `entrylist`/`error`/`config` as shared
//! infrastructure underneath.

pub mod buffer;
pub mod config;
pub mod entrylist;
pub mod environment;
pub mod error;
pub mod frame;
pub mod glue;
pub mod lock;
pub mod loop_driver;
pub mod poison;
pub mod resolve;
pub mod value;

pub use config::RuntimeConfig;
pub use environment::{Environment, FilterFn, ProgramCtx, ProgramFn, ProgramFuture, RenderOpts};
pub use error::{CascadaError, CascadaErrorKind};
pub use poison::{collect_errors, create_poison, is_poison, is_poison_error, Poison, PoisonError};
pub use value::{
    Awaitable, BoxFuture, CallArgs, CallContext, Callable, CallableFn, FrameId, ListValue,
    MapValue, ParamSpec, SharedFuture, SuspendedHandle, Value,
};
