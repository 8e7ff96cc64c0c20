#![doc = r"Core runtime for the Trellis render-tree engine."]
#![allow(clippy::missing_const_for_thread_local)]

pub extern crate self as trellis_core;

pub mod collections;
pub mod context;
pub mod deferred;
mod engine;
pub mod hash;
mod render_cache;
pub mod runtime;

pub use context::{context_key, key_name, Context, ContextKey, ContextPatch, KeySet};
pub use deferred::Deferred;
pub use engine::{InterruptProbe, PendingMode, RenderOptions, RenderPass};
pub use render_cache::UNBOUNDED;
pub use runtime::{Runtime, RuntimeHandle, TaskId, TickId, TickScheduler};

use crate::collections::map::HashMap;
use crate::context::PatchSlot;
use crate::render_cache::RenderCache;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::marker::PhantomData;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared, dynamically typed value. Results, arguments, state entries and
/// context values all travel as `Value`; equality is pointer identity.
pub type Value = Rc<dyn Any>;

/// A render argument. Same representation as any other [`Value`].
pub type Arg = Value;

/// Shared error value carried by failed renders and rejected deferreds.
pub type DynError = Rc<dyn std::error::Error>;

pub type ComponentId = u64;

static NEXT_COMPONENT_ID: AtomicU64 = AtomicU64::new(1);

fn next_component_id() -> ComponentId {
    NEXT_COMPONENT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Wraps an arbitrary value for storage in state, context or results.
pub fn value<T: Any>(inner: T) -> Value {
    Rc::new(inner)
}

/// Marker type behind the distinguished pending placeholder.
pub struct PendingMarker;

thread_local! {
    static PENDING_VALUE: Value = Rc::new(PendingMarker);
    static UNIT_VALUE: Value = Rc::new(());
}

/// The distinguished placeholder committed when a render is outstanding.
/// Repeated calls return the same allocation, so identity checks hold.
pub fn pending_value() -> Value {
    PENDING_VALUE.with(Rc::clone)
}

pub fn is_pending_value(value: &Value) -> bool {
    value.is::<PendingMarker>()
}

/// Shared unit value; the default prepare result and root render argument.
pub fn unit_value() -> Value {
    UNIT_VALUE.with(Rc::clone)
}

/// Why a render call produced no committed result for the caller.
#[derive(Clone, Debug)]
pub enum RenderError {
    /// The component is waiting on an outstanding prepare (its own or a
    /// required child's) and committed a placeholder instead.
    Pending,
    /// The render failed and no recovery hook handled it.
    Failed(DynError),
}

impl RenderError {
    pub fn failed(error: impl std::error::Error + 'static) -> Self {
        RenderError::Failed(Rc::new(error))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, RenderError::Pending)
    }
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderError::Pending => write!(f, "render pending"),
            RenderError::Failed(error) => write!(f, "render failed: {error}"),
        }
    }
}

impl std::error::Error for RenderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RenderError::Pending => None,
            RenderError::Failed(error) => Some(error.as_ref()),
        }
    }
}

/// Plain message error for components without a richer failure type.
#[derive(Debug)]
pub struct RenderFault {
    message: String,
}

impl RenderFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Shorthand for raising a message as a failed render.
    pub fn raise(message: impl Into<String>) -> RenderError {
        RenderError::Failed(Rc::new(Self::new(message)))
    }
}

impl fmt::Display for RenderFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RenderFault {}

/// Lifecycle phase of a component.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Constructed, never mounted.
    Creating,
    /// Attached to a parent, hooks running.
    Mounting,
    /// Inside the prepare step.
    Preparing,
    /// Inside the render step.
    Rendering,
    /// Holds a committed result (possibly the pending placeholder).
    Rendered,
    /// Detached; doubles as "unmounted" until a remount.
    Unmounting,
    /// Re-attached to a parent out of a cached subtree.
    Restoring,
}

/// Hooks and policy for a component. Implementations describe behavior;
/// per-instance data lives in the component's named state.
pub trait ComponentKind: Any {
    /// Runs once, before the first `on_mount` ever.
    fn on_appear(&self, _component: &Component) {}

    fn on_mount(&self, _component: &Component) {}

    fn on_unmount(&self, _component: &Component) {}

    /// Runs one scheduling tick after an unmount, unless the component was
    /// remounted in between.
    fn on_disappear(&self, _component: &Component) {}

    /// Runs when the component receives a context different from the one it
    /// had before.
    fn on_receive_context(&self, _component: &Component, _context: &Context) {}

    /// Produces the prepare result. Components rendered synchronously inside
    /// count as prepare children. The returned handle may settle later;
    /// until it does, renders commit the pending placeholder.
    fn prepare(&self, _component: &Component, _pass: &RenderPass) -> Deferred<Value> {
        Deferred::resolved(unit_value())
    }

    fn render(
        &self,
        component: &Component,
        pass: &RenderPass,
        arg: &Arg,
    ) -> Result<Value, RenderError>;

    /// Placeholder committed while the real render is outstanding.
    fn render_pending(&self, _component: &Component, _pass: &RenderPass, _arg: &Arg) -> Value {
        pending_value()
    }

    /// Recovery hook for a failed render or prepare. The default re-raises.
    fn render_error(
        &self,
        _component: &Component,
        _pass: &RenderPass,
        _arg: &Arg,
        error: &DynError,
    ) -> Result<Value, RenderError> {
        Err(RenderError::Failed(Rc::clone(error)))
    }

    /// Observes a render served from cache; the fresh-render hooks are
    /// skipped in that case.
    fn on_cached_render(&self, _component: &Component, _arg: &Arg, _result: &Value) {}

    /// Context modifications visible to children rendered during prepare.
    fn prepare_context_patch(&self, _component: &Component, _context: &Context) -> ContextPatch {
        ContextPatch::new()
    }

    /// Context modifications computed from the prepare result, layered on
    /// top of the prepare-phase ones for children rendered afterward.
    fn context_patch(
        &self,
        _component: &Component,
        _context: &Context,
        _prepared: &Value,
    ) -> ContextPatch {
        ContextPatch::new()
    }

    /// Whether prepare must run again. The default reruns it when named
    /// state changed since the last prepare.
    fn should_prepare(&self, component: &Component) -> bool {
        component.state_changed_since_prepare()
    }

    /// Extra freshness check consulted before reusing a cached render;
    /// returning true forces a fresh render.
    fn should_render(&self, _component: &Component, _arg: &Arg) -> bool {
        false
    }

    /// When true, a pending child rendered normally during this component's
    /// render step turns the whole render into a pending commit.
    fn should_wait_for_children(&self, _component: &Component) -> bool {
        false
    }

    /// Cooperative interruption probe, consulted before each component
    /// render of a pass.
    fn should_interrupt(&self, _probe: &InterruptProbe) -> bool {
        false
    }

    /// Render cache capacity. One keeps a single slot, small values keep a
    /// scanned LRU list, large ones a hash-keyed map when [`arg_hash`] is
    /// provided. Zero disables caching; [`UNBOUNDED`] never evicts.
    ///
    /// [`arg_hash`]: ComponentKind::arg_hash
    fn cache_capacity(&self) -> usize {
        1
    }

    /// Argument equality for cache lookups. Defaults to pointer identity.
    fn arg_eq(&self, a: &Arg, b: &Arg) -> bool {
        Rc::ptr_eq(a, b)
    }

    /// Argument hash for hash-keyed caches. `None` opts out.
    fn arg_hash(&self, _arg: &Arg) -> Option<u64> {
        None
    }
}

/// What a parent remembers about one child from its last completed step.
#[derive(Clone)]
pub(crate) struct ChildRecord {
    pub(crate) component: Component,
    pub(crate) result: Value,
    /// The child's own rendered-children snapshot at commit time.
    pub(crate) children: Rc<ChildSet>,
    /// Context the child received.
    pub(crate) context: Context,
    /// Context keys read by the child's subtree.
    pub(crate) reads: KeySet,
    pub(crate) descendants: usize,
    /// The recorded result is the pending placeholder.
    pub(crate) pending: bool,
}

/// Insertion-ordered collection of child records keyed by component id.
/// Re-inserting an id replaces the record in place, so a child rendered
/// twice in one step keeps a single entry.
#[derive(Default)]
pub(crate) struct ChildSet {
    entries: Vec<ChildRecord>,
}

impl ChildSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, record: ChildRecord) {
        let id = record.component.id();
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|known| known.component.id() == id)
        {
            *existing = record;
        } else {
            self.entries.push(record);
        }
    }

    pub(crate) fn contains(&self, id: ComponentId) -> bool {
        self.entries.iter().any(|record| record.component.id() == id)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &ChildRecord> {
        self.entries.iter()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

pub(crate) enum PrepareState {
    /// Never run, or cleared by invalidation.
    NotPrepared,
    /// Deferred outstanding; renders commit placeholders meanwhile.
    InFlight(Deferred<Value>),
    Ready(Value),
    /// A rejected prepare; persists until the next invalidation.
    Failed(DynError),
}

#[derive(Default)]
pub(crate) struct Flags {
    /// First-ever mount already fired `on_appear`.
    pub(crate) appeared: Cell<bool>,
    /// Registered as a render root.
    pub(crate) root: Cell<bool>,
    /// The last commit was the pending placeholder.
    pub(crate) pending: Cell<bool>,
    /// A disappearance tick is scheduled and not yet canceled.
    pub(crate) disappear_pending: Cell<bool>,
}

pub(crate) struct ComponentInner {
    pub(crate) id: ComponentId,
    pub(crate) kind: Box<dyn ComponentKind>,
    pub(crate) phase: Cell<Phase>,
    pub(crate) flags: Flags,
    pub(crate) state: RefCell<HashMap<String, Value>>,
    pub(crate) state_version: Cell<u64>,
    /// `state_version` at the time prepare last ran.
    pub(crate) prepared_version: Cell<u64>,
    /// Bumped whenever the prepare record is cleared or replaced, so late
    /// async settlements of stale prepares are ignored.
    pub(crate) prepare_epoch: Cell<u64>,
    pub(crate) parent: RefCell<Option<WeakComponent>>,
    pub(crate) context: RefCell<Option<Context>>,
    /// Keys this component itself read since the last fresh capture.
    pub(crate) context_reads: RefCell<KeySet>,
    /// Keys read during the current render step, children included.
    pub(crate) step_reads: RefCell<KeySet>,
    pub(crate) children_prepare: RefCell<Rc<ChildSet>>,
    pub(crate) children_rendered: RefCell<Rc<ChildSet>>,
    pub(crate) prepare: RefCell<PrepareState>,
    pub(crate) result: RefCell<Option<Value>>,
    pub(crate) render_cache: RefCell<RenderCache>,
    pub(crate) prepare_patch: RefCell<PatchSlot>,
    pub(crate) render_patch: RefCell<PatchSlot>,
    pub(crate) ready_slot: RefCell<Option<Deferred<Value>>>,
    pub(crate) rendered_slot: RefCell<Option<Deferred<Value>>>,
    pub(crate) runtime: RefCell<Option<RuntimeHandle>>,
    pub(crate) _not_send: PhantomData<*const ()>,
}

/// A stateful node in the render tree. `Component` is a cheap handle;
/// cloning shares the same instance and equality is instance identity.
pub struct Component {
    pub(crate) inner: Rc<ComponentInner>,
}

#[derive(Clone)]
pub struct WeakComponent {
    inner: Weak<ComponentInner>,
}

impl WeakComponent {
    pub fn upgrade(&self) -> Option<Component> {
        self.inner.upgrade().map(|inner| Component { inner })
    }
}

impl Clone for Component {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl PartialEq for Component {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Component {}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("id", &self.inner.id)
            .field("phase", &self.inner.phase.get())
            .finish()
    }
}

impl Component {
    pub fn new(kind: impl ComponentKind) -> Component {
        let capacity = kind.cache_capacity();
        Component {
            inner: Rc::new(ComponentInner {
                id: next_component_id(),
                kind: Box::new(kind),
                phase: Cell::new(Phase::Creating),
                flags: Flags::default(),
                state: RefCell::new(HashMap::default()),
                state_version: Cell::new(0),
                prepared_version: Cell::new(0),
                prepare_epoch: Cell::new(0),
                parent: RefCell::new(None),
                context: RefCell::new(None),
                context_reads: RefCell::new(KeySet::new()),
                step_reads: RefCell::new(KeySet::new()),
                children_prepare: RefCell::new(Rc::new(ChildSet::new())),
                children_rendered: RefCell::new(Rc::new(ChildSet::new())),
                prepare: RefCell::new(PrepareState::NotPrepared),
                result: RefCell::new(None),
                render_cache: RefCell::new(RenderCache::new(capacity)),
                prepare_patch: RefCell::new(PatchSlot::default()),
                render_patch: RefCell::new(PatchSlot::default()),
                ready_slot: RefCell::new(None),
                rendered_slot: RefCell::new(None),
                runtime: RefCell::new(None),
                _not_send: PhantomData,
            }),
        }
    }

    pub fn id(&self) -> ComponentId {
        self.inner.id
    }

    pub fn phase(&self) -> Phase {
        self.inner.phase.get()
    }

    pub fn downgrade(&self) -> WeakComponent {
        WeakComponent {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn parent(&self) -> Option<Component> {
        self.inner
            .parent
            .borrow()
            .as_ref()
            .and_then(WeakComponent::upgrade)
    }

    /// Mounted components have a live parent or are registered roots.
    pub fn is_mounted(&self) -> bool {
        self.inner.flags.root.get() || self.parent().is_some()
    }

    pub fn is_root(&self) -> bool {
        self.inner.flags.root.get()
    }

    /// Whether the last commit was the pending placeholder.
    pub fn is_pending(&self) -> bool {
        self.inner.flags.pending.get()
    }

    pub fn is_prepared(&self) -> bool {
        matches!(*self.inner.prepare.borrow(), PrepareState::Ready(_))
    }

    /// The prepare result, once prepare has completed successfully.
    pub fn prepared(&self) -> Option<Value> {
        match &*self.inner.prepare.borrow() {
            PrepareState::Ready(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Last committed result, placeholder included.
    pub fn result(&self) -> Option<Value> {
        self.inner.result.borrow().clone()
    }

    /// The context received at the last mount or render. Reads through the
    /// returned handle count toward this component's dependency set.
    pub fn context(&self) -> Context {
        self.inner
            .context
            .borrow()
            .clone()
            .unwrap_or_else(Context::empty)
    }

    /// Writes a named state entry. Assigning a pointer-identical value is a
    /// no-op; an actual change invalidates cached renders (here and up the
    /// chain of rendered ancestors) and schedules a re-render.
    pub fn set_state(&self, name: &str, value: Value) {
        let changed = {
            let mut state = self.inner.state.borrow_mut();
            match state.get(name) {
                Some(current) if Rc::ptr_eq(current, &value) => false,
                _ => {
                    state.insert(name.to_string(), value);
                    true
                }
            }
        };
        if !changed {
            return;
        }
        self.inner.state_version.set(self.inner.state_version.get() + 1);
        log::trace!("component #{} state '{name}' changed", self.id());
        self.note_invalidated();
    }

    pub fn state(&self, name: &str) -> Option<Value> {
        self.inner.state.borrow().get(name).cloned()
    }

    /// Typed state lookup.
    pub fn state_as<T: 'static>(&self, name: &str) -> Option<Rc<T>> {
        self.state(name).and_then(|value| value.downcast::<T>().ok())
    }

    pub fn state_changed_since_prepare(&self) -> bool {
        self.inner.state_version.get() != self.inner.prepared_version.get()
    }

    /// Drops cached renders for this component, invalidates rendered
    /// ancestors and schedules a re-render of the owning root.
    pub fn invalidate(&self) {
        log::trace!("component #{} invalidated", self.id());
        self.note_invalidated();
    }

    /// Like [`Component::invalidate`], but also drops the prepare result so
    /// the next render runs prepare again regardless of `should_prepare`.
    pub fn invalidate_prepare(&self) {
        self.clear_prepare();
        log::trace!("component #{} prepare invalidated", self.id());
        self.note_invalidated();
    }

    /// Settles when prepare completes: resolved with the prepare result or
    /// rejected with the prepare error.
    pub fn ready(&self) -> Deferred<Value> {
        match &*self.inner.prepare.borrow() {
            PrepareState::Ready(value) => return Deferred::resolved(value.clone()),
            PrepareState::Failed(error) => return Deferred::rejected(Rc::clone(error)),
            _ => {}
        }
        self.inner
            .ready_slot
            .borrow_mut()
            .get_or_insert_with(Deferred::new)
            .clone()
    }

    /// Settles with the next committed non-placeholder result.
    pub fn rendered(&self) -> Deferred<Value> {
        if !self.inner.flags.pending.get() {
            if let Some(result) = self.result() {
                return Deferred::resolved(result);
            }
        }
        self.inner
            .rendered_slot
            .borrow_mut()
            .get_or_insert_with(Deferred::new)
            .clone()
    }

    /// Indented dump of the rendered tree below this component.
    pub fn debug_tree(&self) -> String {
        let mut out = String::new();
        self.write_tree(&mut out, 0);
        out
    }

    fn write_tree(&self, out: &mut String, depth: usize) {
        use std::fmt::Write;
        let mut marks = String::new();
        if self.is_root() {
            marks.push_str(" root");
        }
        if self.is_pending() {
            marks.push_str(" pending");
        }
        let _ = writeln!(
            out,
            "{:indent$}#{} {:?}{marks}",
            "",
            self.id(),
            self.phase(),
            indent = depth * 2
        );
        let children = Rc::clone(&*self.inner.children_rendered.borrow());
        for record in children.iter() {
            record.component.write_tree(out, depth + 1);
        }
    }

    /// Shared invalidation path for state changes and explicit requests.
    fn note_invalidated(&self) {
        self.clear_render_cache();
        // a failed prepare is retried after the next invalidation
        if matches!(*self.inner.prepare.borrow(), PrepareState::Failed(_)) {
            self.clear_prepare();
        }
        self.invalidate_rendered_ancestors();
        self.request_render();
    }

    pub(crate) fn clear_render_cache(&self) {
        self.inner.render_cache.borrow_mut().clear();
    }

    pub(crate) fn clear_prepare(&self) {
        *self.inner.prepare.borrow_mut() = PrepareState::NotPrepared;
        self.inner
            .prepare_epoch
            .set(self.inner.prepare_epoch.get() + 1);
    }

    /// Clears render caches up the parent chain, stopping at the first
    /// ancestor that is not in a settled phase.
    pub(crate) fn invalidate_rendered_ancestors(&self) {
        let mut current = self.parent();
        while let Some(component) = current {
            if !matches!(component.phase(), Phase::Rendered | Phase::Restoring) {
                break;
            }
            component.clear_render_cache();
            current = component.parent();
        }
    }

    /// Schedules a re-render of the root above this component, if any.
    pub(crate) fn request_render(&self) {
        let Some(root) = self.root_component() else {
            return;
        };
        let Some(runtime) = root.inner.runtime.borrow().clone() else {
            return;
        };
        runtime.request_root_render(&root);
    }

    pub(crate) fn root_component(&self) -> Option<Component> {
        let mut current = self.clone();
        loop {
            if current.inner.flags.root.get() {
                return Some(current);
            }
            current = current.parent()?;
        }
    }

    pub(crate) fn note_context_read(&self, key: ContextKey) {
        self.inner.context_reads.borrow_mut().insert(key);
        self.inner.step_reads.borrow_mut().insert(key);
    }

    pub(crate) fn kind(&self) -> &dyn ComponentKind {
        self.inner.kind.as_ref()
    }

    pub(crate) fn bind_runtime(&self, handle: RuntimeHandle) {
        *self.inner.runtime.borrow_mut() = Some(handle);
    }

    pub(crate) fn runtime(&self) -> Option<RuntimeHandle> {
        self.inner.runtime.borrow().clone()
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
