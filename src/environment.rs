//! The public runtime surface: `Environment`, the render entrypoints, and
//! re-exports for consumers.
//!
//! Lexing, parsing, and the AST-to-runtime-calls compiler are
//! deliberately out of scope — there is no lexer or parser in this
//! crate. `render_template`/`render_script` keep the source-level entry
//! points a host embedding this runtime expects, but `path`/`src` are
//! treated as an opaque key into a small in-memory [`ProgramFn`] registry
//! that a compiler (or, here, a test) populates directly via
//! [`Environment::add_program`]. This seam is documented in `DESIGN.md`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::buffer::{flatten, BufferArena, BufferId, HandlerFactory, HandlerRegistry};
use crate::config::RuntimeConfig;
use crate::error::CascadaError;
use crate::frame::FrameArena;
use crate::poison::{Poison, PoisonError};
use crate::value::{BoxFuture, FrameId, Value};

/// A pure function consuming already-resolved values. This crate
/// deliberately doesn't ship a standard library of built-in filters —
/// any reasonable implementation registers its own through this seam.
pub type FilterFn = Arc<dyn Fn(Vec<Value>) -> BoxFuture + Send + Sync>;

/// Everything a compiled program needs to evaluate one render: the
/// frame/buffer arenas for this render, the frame/node it should start
/// emitting into, the render context, and a handle back to the
/// environment (globals/filters/handlers).
pub struct ProgramCtx<'a> {
    pub frame_arena: &'a FrameArena,
    pub buffer_arena: &'a BufferArena,
    pub frame: FrameId,
    pub buf: BufferId,
    pub context: &'a Value,
    pub env: &'a Environment,
}

pub type ProgramFuture<'a> = Pin<Box<dyn Future<Output = Value> + 'a>>;

/// A compiled program: given a render's [`ProgramCtx`], evaluates the
/// template/script body, emitting into `buf` as it goes, and returns its
/// own top-level settlement (a completion marker, or `Value::Poison` if
/// evaluation failed before ever reaching a fence that could record it
/// in the buffer).
pub type ProgramFn = Arc<dyn for<'a> Fn(ProgramCtx<'a>) -> ProgramFuture<'a> + Send + Sync>;

/// `opts.output`: which handler's `getReturnValue()` replaces
/// concatenated text as the render result. `None` means the default
/// text output.
#[derive(Clone, Debug, Default)]
pub struct RenderOpts {
    pub output: Option<String>,
}

/// Registered globals, filters, command handler classes, and compiled
/// programs for one set of renders. Cheap to construct; expensive
/// per-render state (frames, buffer) lives in [`Environment::run_program`]
/// instead, one instance per render.
pub struct Environment {
    globals: HashMap<String, Value>,
    filters: HashMap<String, FilterFn>,
    handlers: HandlerRegistry,
    programs: HashMap<String, ProgramFn>,
    config: RuntimeConfig,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            globals: HashMap::new(),
            filters: HashMap::new(),
            handlers: HandlerRegistry::new(),
            programs: HashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn add_global(&mut self, name: impl Into<String>, value: Value) {
        self.globals.insert(name.into(), value);
    }

    pub fn get_global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    pub fn add_filter(&mut self, name: impl Into<String>, f: FilterFn) {
        self.filters.insert(name.into(), f);
    }

    pub fn get_filter(&self, name: &str) -> Option<&FilterFn> {
        self.filters.get(name)
    }

    pub fn add_command_handler_class(&mut self, name: impl Into<String>, factory: HandlerFactory) {
        self.handlers.register(name, factory);
    }

    /// Populates the `path`/`src` → program registry a real compiler
    /// would populate; exposed for the test harness (see module docs for
    /// why this seam exists).
    pub fn add_program(&mut self, key: impl Into<String>, program: ProgramFn) {
        self.programs.insert(key.into(), program);
    }

    pub async fn render_template(&self, path: &str, ctx: Value) -> Result<String, PoisonError> {
        self.run_program(path, ctx).await.map(|f| f.text)
    }

    pub async fn render_template_string(&self, src: &str, ctx: Value) -> Result<String, PoisonError> {
        self.run_program(src, ctx).await.map(|f| f.text)
    }

    pub async fn render_script(
        &self,
        path: &str,
        ctx: Value,
        opts: RenderOpts,
    ) -> Result<Value, PoisonError> {
        self.render_focused(path, ctx, opts).await
    }

    pub async fn render_script_string(
        &self,
        src: &str,
        ctx: Value,
        opts: RenderOpts,
    ) -> Result<Value, PoisonError> {
        self.render_focused(src, ctx, opts).await
    }

    async fn render_focused(
        &self,
        key: &str,
        ctx: Value,
        opts: RenderOpts,
    ) -> Result<Value, PoisonError> {
        let flattened = self.run_program(key, ctx).await?;
        match opts.output.as_deref() {
            None | Some("text") => Ok(Value::str(flattened.text)),
            Some(name) => flattened.handler_results.get(name).cloned().ok_or_else(|| {
                PoisonError::single(CascadaError::structural(format!(
                    "output handler '{name}' was never used during this render"
                )))
            }),
        }
    }

    /// Runs one render end to end: resolves the program, evaluates it
    /// against a fresh frame/buffer arena pair, and flattens the result.
    /// Both the program's own top-level settlement and every error
    /// accumulated while flattening the buffer are aggregated into one
    /// `PoisonError` — no error source is allowed to shadow the other.
    async fn run_program(
        &self,
        key: &str,
        ctx: Value,
    ) -> Result<crate::buffer::Flattened, PoisonError> {
        let program = self.programs.get(key).cloned().ok_or_else(|| {
            PoisonError::single(CascadaError::structural(format!(
                "no program registered for '{key}'"
            )))
        })?;

        let frame_arena = FrameArena::with_tracing(self.config.trace_frame_and_lock_events);
        let buffer_arena = BufferArena::new();
        let root_frame = frame_arena.create_root().await;
        let root_buf = buffer_arena.child().await;

        let body_result = program(ProgramCtx {
            frame_arena: &frame_arena,
            buffer_arena: &buffer_arena,
            frame: root_frame,
            buf: root_buf,
            context: &ctx,
            env: self,
        })
        .await;

        let body_errors = match body_result {
            Value::Poison(p) => p.errors().to_vec(),
            _ => Vec::new(),
        };

        let flatten_result = flatten(&buffer_arena, root_buf, &self.handlers).await;
        frame_arena.exit(root_frame).await;

        match flatten_result {
            Ok(flattened) if body_errors.is_empty() => Ok(flattened),
            Ok(_) => Err(self.finish_with_poison(Poison::from_errors(body_errors))),
            Err(flatten_poison) => {
                let mut errors = body_errors;
                errors.extend(flatten_poison.errors().iter().cloned());
                Err(self.finish_with_poison(Poison::from_errors(errors)))
            }
        }
    }

    fn finish_with_poison(&self, poison: Poison) -> PoisonError {
        let err = poison.into_error();
        if self.config.log_poison_on_render_failure {
            tracing::warn!(error_count = err.errors.len(), "render settled with poison");
        }
        err
    }
}
