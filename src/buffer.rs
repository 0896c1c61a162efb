//! Output Buffer & Handlers: a tree-shaped buffer that async branches
//! emit into lock-free (each branch only ever touches its own node), with
//! deterministic depth-first flattening at render end.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;

use crate::entrylist::{Entry, EntryList};
use crate::error::CascadaError;
use crate::poison::Poison;
use crate::value::Value;

pub type BufferId = Entry;

/// `@handler.sub.path.cmd(args...)`. Produced while evaluating, executed
/// against its handler in traversal order at flatten time.
#[derive(Clone, Debug, Default)]
pub struct CommandEntry {
    pub handler: String,
    pub command: Option<String>,
    pub subpath: Vec<String>,
    pub arguments: Vec<Value>,
    pub lineno: Option<u32>,
    pub colno: Option<u32>,
    pub path: Option<String>,
}

impl CommandEntry {
    fn contextualize(&self, err: CascadaError) -> CascadaError {
        let err = match &self.path {
            Some(p) => err.with_path(p.clone()),
            None => err,
        };
        match (self.lineno, self.colno) {
            (Some(l), Some(c)) => err.with_position(l, c),
            _ => err,
        }
    }
}

/// A function node: receives the flattened text of its own children and
/// produces the replacement string for that block.
pub type PostProcessFn =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = String> + Send>> + Send + Sync>;

enum BufferNodeKind {
    Text(String),
    Child(Vec<BufferId>),
    Suspended(Value),
    Command(CommandEntry),
    PostProcess {
        children: Vec<BufferId>,
        transform: PostProcessFn,
    },
}

struct BufferNode {
    kind: BufferNodeKind,
}

/// Owns every buffer node for one render. Nodes are appended to by
/// exactly one scope — no node is ever appended to from two tasks; the
/// `RwLock` exists only because construction and (later) flattening both
/// cross await points, not because of real contention.
pub struct BufferArena {
    nodes: tokio::sync::RwLock<EntryList<BufferNode>>,
}

impl Default for BufferArena {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferArena {
    pub fn new() -> Self {
        Self {
            nodes: tokio::sync::RwLock::new(EntryList::new()),
        }
    }

    async fn push(&self, kind: BufferNodeKind) -> BufferId {
        self.nodes.write().await.insert(BufferNode { kind })
    }

    pub async fn text(&self, s: impl Into<String>) -> BufferId {
        self.push(BufferNodeKind::Text(s.into())).await
    }

    /// A nested block (new async scope); children are linked in
    /// afterwards with [`link`](Self::link) as evaluation proceeds.
    pub async fn child(&self) -> BufferId {
        self.push(BufferNodeKind::Child(Vec::new())).await
    }

    pub async fn suspended(&self, value: Value) -> BufferId {
        self.push(BufferNodeKind::Suspended(value)).await
    }

    pub async fn command(&self, entry: CommandEntry) -> BufferId {
        self.push(BufferNodeKind::Command(entry)).await
    }

    pub async fn post_process(&self, transform: PostProcessFn) -> BufferId {
        self.push(BufferNodeKind::PostProcess {
            children: Vec::new(),
            transform,
        })
        .await
    }

    /// Appends `child` to a `Child`/`PostProcess` node's child list, in
    /// source order.
    pub async fn link(&self, parent: BufferId, child: BufferId) {
        let mut guard = self.nodes.write().await;
        if let Some(node) = guard.get_mut(&parent) {
            match &mut node.kind {
                BufferNodeKind::Child(children) => children.push(child),
                BufferNodeKind::PostProcess { children, .. } => children.push(child),
                _ => {}
            }
        }
    }

    async fn take(&self, id: BufferId) -> Option<BufferNodeKind> {
        self.nodes.write().await.take(&id).map(|n| n.kind)
    }
}

/// `call`/`get_return_value` contract for a registered command handler.
/// One instance per handler name per render, created lazily on first use
/// and invoked strictly in flatten (= traversal) order, so no interior
/// synchronization is needed here.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn call(
        &mut self,
        command: Option<&str>,
        subpath: &[String],
        args: &[Value],
    ) -> Result<(), CascadaError>;

    /// Called once after flattening completes; the handler's contribution
    /// to a focused render output (e.g. the `@data` handler's assembled
    /// object). Handlers with no meaningful return value can leave this
    /// as `Value::Undefined`.
    fn get_return_value(&mut self) -> Value {
        Value::Undefined
    }
}

pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn CommandHandler> + Send + Sync>;

/// `(name -> class)` registration table, per environment.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    factories: HashMap<String, HandlerFactory>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, factory: HandlerFactory) {
        self.factories.insert(name.into(), factory);
    }
}

/// The result of flattening: concatenated text plus every handler's
/// `getReturnValue()`, keyed by handler name in first-use order.
pub struct Flattened {
    pub text: String,
    pub handler_results: IndexMap<String, Value>,
}

/// Walks the tree depth-first, consuming it as it goes (a buffer is
/// flattened exactly once, at render end). Command entries are executed
/// in traversal order; an entry whose arguments carry Poison contributes
/// its errors without invoking the handler, and traversal continues with
/// its siblings regardless.
pub async fn flatten(
    arena: &BufferArena,
    root: BufferId,
    registry: &HandlerRegistry,
) -> Result<Flattened, Poison> {
    let mut handlers: HashMap<String, Box<dyn CommandHandler>> = HashMap::new();
    let mut instantiation_order: Vec<String> = Vec::new();
    let mut errors: Vec<CascadaError> = Vec::new();

    let text = walk(
        arena,
        root,
        registry,
        &mut handlers,
        &mut instantiation_order,
        &mut errors,
    )
    .await;

    let mut handler_results = IndexMap::new();
    for name in instantiation_order {
        if let Some(handler) = handlers.get_mut(&name) {
            handler_results.insert(name, handler.get_return_value());
        }
    }

    if errors.is_empty() {
        Ok(Flattened {
            text,
            handler_results,
        })
    } else {
        Err(Poison::from_errors(errors))
    }
}

fn walk<'a>(
    arena: &'a BufferArena,
    id: BufferId,
    registry: &'a HandlerRegistry,
    handlers: &'a mut HashMap<String, Box<dyn CommandHandler>>,
    order: &'a mut Vec<String>,
    errors: &'a mut Vec<CascadaError>,
) -> Pin<Box<dyn Future<Output = String> + 'a>> {
    Box::pin(async move {
        let Some(kind) = arena.take(id).await else {
            return String::new();
        };
        match kind {
            BufferNodeKind::Text(s) => s,
            BufferNodeKind::Child(children) => {
                let mut out = String::new();
                for child in children {
                    out.push_str(&walk(arena, child, registry, handlers, order, errors).await);
                }
                out
            }
            BufferNodeKind::Suspended(value) => match value.resolve_self().await {
                Value::Poison(p) => {
                    errors.extend(p.errors().iter().cloned());
                    String::new()
                }
                settled => settled.to_display_string(),
            },
            BufferNodeKind::Command(entry) => {
                run_command(entry, registry, handlers, order, errors).await;
                String::new()
            }
            BufferNodeKind::PostProcess { children, transform } => {
                let mut inner = String::new();
                for child in children {
                    inner.push_str(&walk(arena, child, registry, handlers, order, errors).await);
                }
                transform(inner).await
            }
        }
    })
}

async fn run_command(
    entry: CommandEntry,
    registry: &HandlerRegistry,
    handlers: &mut HashMap<String, Box<dyn CommandHandler>>,
    order: &mut Vec<String>,
    errors: &mut Vec<CascadaError>,
) {
    let mut resolved_args = Vec::with_capacity(entry.arguments.len());
    let mut arg_errors = Vec::new();
    for arg in entry.arguments.clone() {
        match arg.resolve_self().await {
            Value::Poison(p) => arg_errors.extend(p.errors().iter().cloned()),
            other => resolved_args.push(other),
        }
    }
    if !arg_errors.is_empty() {
        errors.extend(arg_errors);
        return;
    }

    if !handlers.contains_key(&entry.handler) {
        match registry.factories.get(&entry.handler) {
            Some(factory) => {
                handlers.insert(entry.handler.clone(), factory());
                order.push(entry.handler.clone());
            }
            None => {
                errors.push(entry.contextualize(CascadaError::structural(format!(
                    "unknown command handler \"{}\"",
                    entry.handler
                ))));
                return;
            }
        }
    }

    if let Some(handler) = handlers.get_mut(&entry.handler) {
        if let Err(e) = handler
            .call(entry.command.as_deref(), &entry.subpath, &resolved_args)
            .await
        {
            errors.push(entry.contextualize(e));
        }
    }
}

/// The built-in `@data` handler: nested path assembly via `subpath`, with
/// deterministic per-operation rules. `subpath` addresses into the
/// assembled object, creating intermediate maps as needed.
#[derive(Default)]
pub struct DataHandler {
    root: IndexMap<String, Value>,
}

impl DataHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn navigate<'a>(
        root: &'a mut IndexMap<String, Value>,
        subpath: &[String],
    ) -> Result<(&'a mut IndexMap<String, Value>, &'a str), CascadaError> {
        let (last, parents) = subpath
            .split_last()
            .ok_or_else(|| CascadaError::dataflow("@data command with empty subpath"))?;
        let mut current = root;
        for segment in parents {
            let entry = current
                .entry(segment.clone())
                .or_insert_with(|| Value::map(IndexMap::new()));
            match entry {
                Value::Map(m) => {
                    // `Arc<MapValue>` stores entries immutably; rebuild the
                    // slot as an owned, mutable map on first descent so
                    // nested assignments can mutate in place.
                    let owned = Arc::try_unwrap(std::mem::replace(m, Arc::new(crate::value::MapValue::new(IndexMap::new()))))
                        .map(|mv| mv.entries)
                        .unwrap_or_else(|shared| shared.entries.clone());
                    *entry = Value::map(owned);
                    match entry {
                        Value::Map(m2) => {
                            current = &mut Arc::get_mut(m2)
                                .expect("just constructed, uniquely owned")
                                .entries;
                        }
                        _ => unreachable!(),
                    }
                }
                _ => {
                    *entry = Value::map(IndexMap::new());
                    match entry {
                        Value::Map(m2) => {
                            current = &mut Arc::get_mut(m2)
                                .expect("just constructed, uniquely owned")
                                .entries;
                        }
                        _ => unreachable!(),
                    }
                }
            }
        }
        Ok((current, last))
    }
}

#[async_trait]
impl CommandHandler for DataHandler {
    async fn call(
        &mut self,
        command: Option<&str>,
        subpath: &[String],
        args: &[Value],
    ) -> Result<(), CascadaError> {
        let (parent, key) = Self::navigate(&mut self.root, subpath)?;
        let arg = args.first().cloned().unwrap_or(Value::Undefined);
        match command {
            None | Some("=") => {
                parent.insert(key.to_string(), arg);
            }
            Some("push") => {
                let mut items = match parent.get(key) {
                    Some(Value::List(l)) => l.items.clone(),
                    _ => Vec::new(),
                };
                items.push(arg);
                parent.insert(key.to_string(), Value::list(items));
            }
            Some("merge") => {
                let mut entries = match parent.get(key) {
                    Some(Value::Map(m)) => m.entries.clone(),
                    _ => IndexMap::new(),
                };
                if let Value::Map(other) = &arg {
                    for (k, v) in other.entries.iter() {
                        entries.insert(k.clone(), v.clone());
                    }
                } else {
                    return Err(CascadaError::dataflow(
                        "@data .merge() requires a map argument",
                    ));
                }
                parent.insert(key.to_string(), Value::map(entries));
            }
            Some("append") => {
                let existing = match parent.get(key) {
                    Some(Value::Str(s)) => s.to_string(),
                    _ => String::new(),
                };
                let Value::Str(addition) = &arg else {
                    return Err(CascadaError::dataflow(
                        "@data .append() requires a string argument",
                    ));
                };
                parent.insert(key.to_string(), Value::str(existing + addition));
            }
            Some("+=") => {
                let current = match parent.get(key) {
                    Some(Value::Int(n)) => *n as f64,
                    Some(Value::Float(n)) => *n,
                    None => 0.0,
                    Some(_) => {
                        return Err(CascadaError::dataflow(
                            "@data += requires the existing value to be numeric",
                        ))
                    }
                };
                let delta = match &arg {
                    Value::Int(n) => *n as f64,
                    Value::Float(n) => *n,
                    _ => {
                        return Err(CascadaError::dataflow(
                            "@data += requires a numeric argument",
                        ))
                    }
                };
                parent.insert(key.to_string(), Value::Float(current + delta));
            }
            Some("++") => {
                let current = match parent.get(key) {
                    Some(Value::Int(n)) => *n,
                    Some(Value::Float(n)) => *n as i64,
                    None => 0,
                    Some(_) => {
                        return Err(CascadaError::dataflow(
                            "@data ++ requires the existing value to be numeric",
                        ))
                    }
                };
                parent.insert(key.to_string(), Value::Int(current + 1));
            }
            Some(other) => {
                return Err(CascadaError::dataflow(format!(
                    "@data has no command \"{other}\""
                )));
            }
        }
        Ok(())
    }

    fn get_return_value(&mut self) -> Value {
        Value::map(self.root.clone())
    }
}
