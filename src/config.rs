//! Runtime configuration. A plain `Default`-constructed struct, matching
//! the plain-struct-with-`Default` convention used elsewhere in this
//! crate's ecosystem rather than reaching for an external config-file
//! format — this crate is a library embedded by a host, not a
//! deployable service with its own config file.

/// Tunables for one [`crate::environment::Environment`]. None of these
/// change dataflow semantics (ordering, poison propagation, lock
/// behavior are load-bearing and never configurable) — they only tune
/// resource usage and diagnostics.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Applied when a `for` loop has no explicit `of <n>` clause and the
    /// iterable is an async iterator of unknown length, so a runaway
    /// stream can't launch unbounded concurrent bodies. Array/mapping
    /// loops ignore this — their length is known up front, so an
    /// explicit `of` clause is the only thing that bounds them. Forwarded
    /// into the loop driver by [`crate::glue::run_loop_async`], the call
    /// site a compiled `for` loop actually uses (see
    /// [`crate::loop_driver::run_loop_with_default_cap`]'s
    /// `default_async_iter_cap` parameter).
    pub default_async_iterator_concurrency: Option<usize>,

    /// Emit a `tracing::warn!` event whenever a render settles with
    /// `PoisonError`, including the full deduplicated error list. Off by
    /// default so embedding a single poisoned render inside a larger
    /// expected-failure test doesn't spam logs.
    pub log_poison_on_render_failure: bool,

    /// Emit a `tracing::debug!` event at every frame push/pop and lock
    /// state transition. Useful when debugging a hung render; adds
    /// meaningful overhead under load, so it defaults to off.
    pub trace_frame_and_lock_events: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_async_iterator_concurrency: None,
            log_poison_on_render_failure: true,
            trace_frame_and_lock_events: false,
        }
    }
}
