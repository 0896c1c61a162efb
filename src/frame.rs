//! Frame & Scope: nested lexical scopes with write-snapshotting for
//! concurrent branches, carrying sequence-lock state.
//!
//! Frames live in a generational arena ([`crate::entrylist::EntryList`])
//! rather than a pointer graph: a child scope references its parent by
//! [`FrameId`], and a branch that's done executing just has its slot
//! vacated — no GC, no `Rc<RefCell<_>>` cycles.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Notify;

use crate::entrylist::EntryList;
use crate::value::{SharedFuture, Value};

pub use crate::value::FrameId;

/// One side (read or write) of a [`LockSlot`].
#[derive(Clone)]
pub enum LockState {
    /// No in-flight or poisoned operation on this path.
    Free,
    /// An in-flight operation; resolves to a completion marker
    /// (`Value::Bool(true)`) on success or `Value::Poison` on failure.
    Busy(SharedFuture),
    /// The path is poisoned; new operations short-circuit unless repairing.
    Poisoned(crate::poison::Poison),
}

impl Default for LockState {
    fn default() -> Self {
        LockState::Free
    }
}

/// Per-lock-name read/write chain pair.
#[derive(Clone, Default)]
pub struct LockSlot {
    pub write: LockState,
    pub read: LockState,
}

/// A lexical scope: name -> value bindings, sequence-lock slots, and a
/// link to the enclosing scope.
struct Frame {
    vars: HashMap<String, Value>,
    written: HashSet<String>,
    locks: HashMap<String, LockSlot>,
    parent: Option<FrameId>,
    /// Fired when this frame exits, so any sequence-lock chain whose
    /// completion is still pending elsewhere settles to poison instead of
    /// hanging forever — there is no external cancel; lock chains end
    /// when the enclosing frame exits.
    cancel: Arc<Notify>,
}

impl Frame {
    fn new(parent: Option<FrameId>) -> Self {
        Self {
            vars: HashMap::new(),
            written: HashSet::new(),
            locks: HashMap::new(),
            parent,
            cancel: Arc::new(Notify::new()),
        }
    }
}

/// Owns every live [`Frame`] for one render and provides the scope
/// operations the glue layer (and the lock coordinator) are built on.
///
/// Uses an async `RwLock` (rather than a plain `Mutex`) because scope
/// operations are interleaved with awaiting suspended values — holding a
/// std mutex across an await point is both a correctness hazard and a
/// deadlock risk under a multi-threaded executor.
pub struct FrameArena {
    frames: tokio::sync::RwLock<EntryList<Frame>>,
    trace: bool,
}

impl Default for FrameArena {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameArena {
    pub fn new() -> Self {
        Self {
            frames: tokio::sync::RwLock::new(EntryList::new()),
            trace: false,
        }
    }

    /// Like [`new`](Self::new), but emits `tracing::debug!` at every frame
    /// push/pop and lock state transition (`RuntimeConfig::
    /// trace_frame_and_lock_events`). Off by default: load-bearing enough
    /// to walk through while debugging a hung render, noisy enough that
    /// most renders shouldn't pay for it.
    pub fn with_tracing(trace: bool) -> Self {
        Self {
            frames: tokio::sync::RwLock::new(EntryList::new()),
            trace,
        }
    }

    pub(crate) fn trace_enabled(&self) -> bool {
        self.trace
    }

    /// Creates the top-level frame for a render.
    pub async fn create_root(&self) -> FrameId {
        let id = self.frames.write().await.insert(Frame::new(None));
        if self.trace {
            tracing::debug!(?id, "frame: create_root");
        }
        id
    }

    /// Enters a child scope (template/block/macro-call/loop-iteration/
    /// if-branch entry).
    pub async fn enter_child(&self, parent: FrameId) -> FrameId {
        let id = self.frames.write().await.insert(Frame::new(Some(parent)));
        if self.trace {
            tracing::debug!(?id, ?parent, "frame: enter_child");
        }
        id
    }

    /// Exits a scope: wakes any sequence-lock waiter still racing this
    /// frame's cancellation signal (see [`crate::lock::with_sequence_locks`])
    /// and frees the slot.
    pub async fn exit(&self, id: FrameId) {
        let mut guard = self.frames.write().await;
        if let Some(frame) = guard.get_mut(&id) {
            frame.cancel.notify_waiters();
            for slot in frame.locks.values_mut() {
                cancel_if_busy(&mut slot.write);
                cancel_if_busy(&mut slot.read);
            }
        }
        guard.vacate(&id);
        if self.trace {
            tracing::debug!(?id, "frame: exit");
        }
    }

    /// `lookup(name)`: walks parents for reads.
    pub async fn lookup(&self, id: FrameId, name: &str) -> Option<Value> {
        let guard = self.frames.read().await;
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let frame = guard.get(&current)?;
            if let Some(v) = frame.vars.get(name) {
                return Some(v.clone());
            }
            cursor = frame.parent;
        }
        None
    }

    /// `set(name, value, local?)`. Writes always land in `id`'s own
    /// frame and are recorded as "written here" for write-snapshot
    /// reconciliation (see [`run_async_branches`]); `local` only affects
    /// whether a fresh declaration shadows an outer binding of the same
    /// name versus being treated as an ordinary write — both paths store
    /// at `id`, matching how a branch's writes stay invisible to siblings
    /// until the branch concludes.
    pub async fn set(&self, id: FrameId, name: &str, value: Value, _local: bool) {
        let mut guard = self.frames.write().await;
        if let Some(frame) = guard.get_mut(&id) {
            frame.vars.insert(name.to_string(), value);
            frame.written.insert(name.to_string());
        }
    }

    /// The value `id`'s own frame wrote for `name`, if it wrote one.
    /// Used by [`run_async_branches`] to find which sibling(s) touched a
    /// watched variable.
    async fn own_write(&self, id: FrameId, name: &str) -> Option<Value> {
        let guard = self.frames.read().await;
        let frame = guard.get(&id)?;
        if frame.written.contains(name) {
            frame.vars.get(name).cloned()
        } else {
            None
        }
    }

    /// Finds the lock slot for `name` visible from `id` (walking
    /// parents), creating a `Free` one at `id` if none exists anywhere in
    /// the chain ("created on first write under a lock name").
    pub(crate) async fn lock_slot_owner(&self, id: FrameId, name: &str) -> (FrameId, LockSlot) {
        {
            let guard = self.frames.read().await;
            let mut cursor = Some(id);
            while let Some(current) = cursor {
                let Some(frame) = guard.get(&current) else {
                    break;
                };
                if let Some(slot) = frame.locks.get(name) {
                    return (current, slot.clone());
                }
                cursor = frame.parent;
            }
        }
        let mut guard = self.frames.write().await;
        if let Some(frame) = guard.get_mut(&id) {
            frame.locks.insert(name.to_string(), LockSlot::default());
        }
        (id, LockSlot::default())
    }

    pub(crate) async fn update_lock_slot(&self, owner: FrameId, name: &str, slot: LockSlot) {
        let mut guard = self.frames.write().await;
        if let Some(frame) = guard.get_mut(&owner) {
            frame.locks.insert(name.to_string(), slot);
        }
    }

    /// The cancellation signal an owner frame fires on exit; lock
    /// acquisitions race this alongside the operation itself.
    pub(crate) async fn cancel_signal(&self, id: FrameId) -> Option<Arc<Notify>> {
        let guard = self.frames.read().await;
        guard.get(&id).map(|frame| frame.cancel.clone())
    }
}

fn cancel_if_busy(state: &mut LockState) {
    if matches!(state, LockState::Busy(_)) {
        let err = crate::error::CascadaError::cancelled(
            "enclosing frame exited while a sequence-lock chain was still pending",
        );
        *state = LockState::Poisoned(crate::poison::create_poison(err));
    }
}

/// Runs `branches` as concurrent siblings, each against its own child
/// frame of `parent`, and reconciles writes to `watch` back onto `parent`
/// using the write-snapshot rule: sibling branches observe
/// the pre-entry snapshot, never each other's in-flight writes, and the
/// *last branch in source order* that wrote a watched name wins — not
/// whichever branch happened to finish first in real time. If no branch
/// wrote a name, `parent`'s pre-entry value is left untouched (the "idle
/// else restores the snapshot" case falls out for free).
pub async fn run_async_branches<F, Fut>(
    arena: &FrameArena,
    parent: FrameId,
    watch: &[String],
    branches: Vec<F>,
) -> Vec<Value>
where
    F: FnOnce(FrameId) -> Fut,
    Fut: Future<Output = Value>,
{
    let mut child_ids = Vec::with_capacity(branches.len());
    for _ in 0..branches.len() {
        child_ids.push(arena.enter_child(parent).await);
    }

    let futs = branches
        .into_iter()
        .zip(child_ids.iter().copied())
        .map(|(branch, cid)| branch(cid));
    let results = futures::future::join_all(futs).await;

    for name in watch {
        let mut winner = None;
        for &cid in &child_ids {
            if let Some(v) = arena.own_write(cid, name).await {
                winner = Some(v);
            }
        }
        if let Some(value) = winner {
            arena.set(parent, name, value, false).await;
        }
    }

    for cid in child_ids {
        arena.exit(cid).await;
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracing_is_off_unless_explicitly_requested() {
        let quiet = FrameArena::new();
        assert!(!quiet.trace_enabled());
        let root = quiet.create_root().await;
        quiet.exit(root).await;
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    #[serial_test::serial]
    async fn tracing_emits_frame_events_when_requested() {
        let loud = FrameArena::with_tracing(true);
        assert!(loud.trace_enabled());
        let root = loud.create_root().await;
        let child = loud.enter_child(root).await;
        loud.exit(child).await;
        loud.exit(root).await;

        assert!(tracing_test::logs_contain("frame: create_root"));
        assert!(tracing_test::logs_contain("frame: enter_child"));
        assert!(tracing_test::logs_contain("frame: exit"));
    }

    #[tokio::test]
    async fn lookup_walks_up_to_the_declaring_ancestor() {
        let arena = FrameArena::new();
        let root = arena.create_root().await;
        arena.set(root, "x", Value::Int(1), true).await;

        let child = arena.enter_child(root).await;
        assert!(matches!(arena.lookup(child, "x").await, Some(Value::Int(1))));
    }

    #[tokio::test]
    async fn sibling_branches_do_not_see_each_others_in_flight_writes() {
        let arena = FrameArena::new();
        let root = arena.create_root().await;
        arena.set(root, "x", Value::Int(0), true).await;
        let watch = vec!["x".to_string()];

        let results = run_async_branches(
            &arena,
            root,
            &watch,
            vec![
                {
                    let arena = &arena;
                    move |fid: FrameId| async move {
                        arena.set(fid, "x", Value::Int(1), false).await;
                        Value::Int(1)
                    }
                },
                {
                    let arena = &arena;
                    move |fid: FrameId| async move {
                        // Later in source order: should win reconciliation
                        // regardless of real-time completion order.
                        arena.set(fid, "x", Value::Int(2), false).await;
                        Value::Int(2)
                    }
                },
            ],
        )
        .await;

        assert_eq!(results.len(), 2);
        assert!(matches!(arena.lookup(root, "x").await, Some(Value::Int(2))));
    }

    #[tokio::test]
    async fn branch_that_never_writes_leaves_parent_snapshot_untouched() {
        let arena = FrameArena::new();
        let root = arena.create_root().await;
        arena.set(root, "x", Value::Int(7), true).await;
        let watch = vec!["x".to_string()];

        run_async_branches(
            &arena,
            root,
            &watch,
            vec![{
                let arena = &arena;
                move |fid: FrameId| async move {
                    let _ = arena.lookup(fid, "x").await;
                    Value::Null
                }
            }],
        )
        .await;

        assert!(matches!(arena.lookup(root, "x").await, Some(Value::Int(7))));
    }

    #[tokio::test]
    async fn cancel_signal_fires_when_frame_exits() {
        let arena = FrameArena::new();
        let root = arena.create_root().await;
        let cancel = arena.cancel_signal(root).await.unwrap();

        let waiter = tokio::spawn(async move {
            cancel.notified().await;
        });
        // Give the spawned task a chance to register as a waiter before
        // we fire the notification.
        tokio::task::yield_now().await;
        arena.exit(root).await;

        tokio::time::timeout(std::time::Duration::from_millis(200), waiter)
            .await
            .expect("cancellation should have woken the waiter")
            .unwrap();
    }
}
