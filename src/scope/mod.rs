//! Nested, task-local naming frames binding names to channels.
//!
//! A scope is a frame with a parent. [`get_or_create`] looks a name up in
//! the current frame and walks parents on a miss — unless a frame on the
//! walk is isolated, which stops the lookup there. On an overall miss a new
//! channel is constructed and bound in the current frame.
//!
//! The current frame comes from task-local state: entering a scope pushes a
//! frame, dropping (or [`ScopeGuard::leave`]) pops it, tolerating
//! out-of-order disposal by skipping disposed frames. The root frame is
//! static and never disposable. Every frame's bindings live behind one
//! process-wide registry lock.
//!
//! Isolated scopes may still import selected names from a parent with
//! [`inject_from_parent`], sharing specific channels while isolating the
//! rest.
//!
//! # Example
//!
//! ```
//! use altsync::scope::{enter_scope, get_or_create};
//! use altsync::channel::ChannelBuilder;
//!
//! let outer = enter_scope(false);
//! let ch = get_or_create::<u32>("events", &ChannelBuilder::new()).expect("fresh binding");
//! {
//!     let _inner = enter_scope(false);
//!     // The inner frame sees the parent's binding.
//!     let same = get_or_create::<u32>("events", &ChannelBuilder::new()).expect("inherited");
//!     same.try_write(1).expect_err("rendezvous probe");
//! }
//! drop(ch);
//! outer.leave();
//! ```

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::channel::{Channel, ChannelBuilder};
use crate::error::{Error, Result, ResultExt};

/// A naming frame. Frames form a tree; the task-local stack tracks which
/// frame is current for the executing task.
#[derive(Debug)]
pub struct ScopeFrame {
    id: u64,
    parent: Option<Arc<ScopeFrame>>,
    isolated: bool,
    disposed: AtomicBool,
}

impl ScopeFrame {
    fn new(parent: Option<Arc<ScopeFrame>>, isolated: bool) -> Arc<Self> {
        static NEXT_FRAME: AtomicU64 = AtomicU64::new(1);
        Arc::new(Self {
            id: NEXT_FRAME.fetch_add(1, Ordering::Relaxed),
            parent,
            isolated,
            disposed: AtomicBool::new(false),
        })
    }

    /// Returns true if this frame hides its ancestors from name lookup.
    #[must_use]
    pub fn is_isolated(&self) -> bool {
        self.isolated
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

type Binding = Arc<dyn Any + Send + Sync>;

/// All frames' bindings, behind one process-wide lock.
fn registry() -> &'static Mutex<HashMap<(u64, String), Binding>> {
    static REGISTRY: OnceLock<Mutex<HashMap<(u64, String), Binding>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// The static root frame; never disposable.
fn root() -> Arc<ScopeFrame> {
    static ROOT: OnceLock<Arc<ScopeFrame>> = OnceLock::new();
    Arc::clone(ROOT.get_or_init(|| ScopeFrame::new(None, false)))
}

thread_local! {
    static STACK: RefCell<Vec<Arc<ScopeFrame>>> = const { RefCell::new(Vec::new()) };
}

/// Returns the current frame: the topmost non-disposed stack entry, or the
/// root.
#[must_use]
pub fn current() -> Arc<ScopeFrame> {
    STACK.with(|stack| {
        stack
            .borrow()
            .iter()
            .rev()
            .find(|frame| !frame.is_disposed())
            .map_or_else(root, Arc::clone)
    })
}

/// Enters a new scope as a child of the current frame.
///
/// The returned guard pops the frame when dropped (or via
/// [`ScopeGuard::leave`]). Guards may be dropped out of order; disposed
/// frames are skipped when the stack unwinds.
#[must_use]
pub fn enter_scope(isolated: bool) -> ScopeGuard {
    let frame = ScopeFrame::new(Some(current()), isolated);
    STACK.with(|stack| stack.borrow_mut().push(Arc::clone(&frame)));
    tracing::trace!(frame = frame.id, isolated, "scope entered");
    ScopeGuard { frame }
}

/// RAII handle for a scope frame.
#[derive(Debug)]
pub struct ScopeGuard {
    frame: Arc<ScopeFrame>,
}

impl ScopeGuard {
    /// The frame this guard controls.
    #[must_use]
    pub fn frame(&self) -> &Arc<ScopeFrame> {
        &self.frame
    }

    /// Leaves the scope, restoring the parent as current.
    pub fn leave(self) {
        drop(self);
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.frame.disposed.store(true, Ordering::Release);
        let frame_id = self.frame.id;
        {
            let mut bindings = registry().lock();
            bindings.retain(|(id, _), _| *id != frame_id);
        }
        STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            while stack.last().is_some_and(|frame| frame.is_disposed()) {
                stack.pop();
            }
        });
        tracing::trace!(frame = frame_id, "scope left");
    }
}

/// Walks `start` and its ancestors looking for `name` in the (already
/// locked) registry. The walk stops at (and includes) the first isolated
/// frame.
fn lookup(
    bindings: &HashMap<(u64, String), Binding>,
    start: &Arc<ScopeFrame>,
    name: &str,
) -> Option<Binding> {
    let mut frame = Arc::clone(start);
    loop {
        if let Some(binding) = bindings.get(&(frame.id, name.to_owned())) {
            return Some(Arc::clone(binding));
        }
        if frame.isolated {
            return None;
        }
        let parent = frame.parent.as_ref().map(Arc::clone)?;
        frame = parent;
    }
}

fn downcast<T: Send + 'static>(binding: &Binding) -> Result<Channel<T>> {
    binding
        .downcast_ref::<Channel<T>>()
        .cloned()
        .ok_or_else(Error::invalid_argument)
}

/// Looks up `name` through the current frame's lookup chain, creating and
/// binding a new channel in the current frame on a miss.
///
/// # Errors
///
/// `InvalidArgument` when the name is bound to a channel of a different
/// value type, or when `options` are invalid.
pub fn get_or_create<T: Send + 'static>(name: &str, options: &ChannelBuilder) -> Result<Channel<T>> {
    let frame = current();
    // Held across lookup and bind so concurrent callers agree on one
    // instance per name.
    let mut bindings = registry().lock();
    if let Some(binding) = lookup(&bindings, &frame, name) {
        return downcast(&binding)
            .with_context(|| format!("channel '{name}' is bound with a different type"));
    }
    let channel = options
        .clone()
        .with_name(name)
        .build::<T>()
        .with_context(|| format!("cannot bind '{name}' in the current frame"))?;
    bindings.insert((frame.id, name.to_owned()), Arc::new(channel.clone()) as Binding);
    tracing::debug!(frame = frame.id, name, "channel bound");
    Ok(channel)
}

/// Binds an existing channel under `name` in the current frame, replacing
/// any binding the frame already holds for that name.
pub fn inject<T: Send + 'static>(name: &str, channel: &Channel<T>) {
    let frame = current();
    registry()
        .lock()
        .insert((frame.id, name.to_owned()), Arc::new(channel.clone()) as Binding);
    tracing::debug!(frame = frame.id, name, "channel injected");
}

/// Imports `name` from the parent chain into the current frame, crossing
/// the current frame's own isolation boundary for that one name.
///
/// # Errors
///
/// `InvalidArgument` when no ancestor binds the name, or it is bound with a
/// different value type.
pub fn inject_from_parent<T: Send + 'static>(name: &str) -> Result<Channel<T>> {
    let frame = current();
    let parent = frame
        .parent
        .as_ref()
        .ok_or_else(|| Error::invalid_argument().with_context("root scope has no parent"))?;
    let mut bindings = registry().lock();
    let binding = lookup(&bindings, parent, name).ok_or_else(|| {
        Error::invalid_argument().with_context(format!("no parent binding for '{name}'"))
    })?;
    let channel = downcast::<T>(&binding)
        .with_context(|| format!("parent binding '{name}' has a different type"))?;
    bindings.insert((frame.id, name.to_owned()), binding);
    tracing::debug!(frame = frame.id, name, "channel imported from parent");
    Ok(channel)
}
