//! The render pass engine.
//!
//! A pass walks the tree from a root, mounting components, running the
//! prepare protocol, serving renders from per-component caches where valid
//! and reconciling children afterward. Passes are cooperative: component
//! kinds can interrupt a pass, and the next pass resumes past the point
//! where the previous one stopped.

use crate::context::{Context, KeySet};
use crate::render_cache::CacheEntry;
use crate::runtime::RuntimeHandle;
use crate::{
    Arg, ChildRecord, ChildSet, Component, Deferred, DynError, Phase, PrepareState, RenderError,
    RenderFault, Value,
};
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Counters handed to `should_interrupt` before each component render.
#[derive(Clone, Debug)]
pub struct InterruptProbe {
    /// Pass number on this root; grows by one per pass.
    pub generation: u64,
    /// Time since the pass started.
    pub elapsed: Duration,
    /// Components rendered since the point the previous pass stopped at.
    pub rendered_since_resume: usize,
}

/// How a pending child reports back to the parent that rendered it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PendingMode {
    /// Hand the placeholder to the caller and let the parent's
    /// `should_wait_for_children` decide whether the parent pends too.
    #[default]
    Inherit,
    /// Raise [`RenderError::Pending`] to the caller.
    Required,
    /// Hand the placeholder to the caller without flagging the parent.
    Optional,
}

/// Options for [`Component::render_with`].
#[derive(Clone, Default)]
pub struct RenderOptions {
    /// Context override for this child. Defaults to the parent's modified
    /// context.
    pub context: Option<Context>,
    pub pending: PendingMode,
}

/// One step's collection point: the component being prepared or rendered,
/// the context its children receive, and the children seen so far.
struct Frame {
    component: Component,
    children: RefCell<ChildSet>,
    child_context: Context,
    /// Set when a child rendered in `Inherit` mode committed a placeholder.
    pending_child: Cell<bool>,
    /// Components rendered below this frame's component.
    descendants: Cell<usize>,
}

struct PassCore {
    runtime: RuntimeHandle,
    root: Component,
    generation: u64,
    started: Instant,
    rendered: Cell<usize>,
    /// Renders are not interruptible again until the count passes the point
    /// the previous pass stopped at.
    resume_floor: usize,
    interrupted: Cell<bool>,
    active: Cell<bool>,
    stack: RefCell<Vec<Rc<Frame>>>,
    _not_send: PhantomData<*const ()>,
}

/// A single render pass over one root. Handed to every hook that may render
/// children; renders must go through the innermost active pass.
#[derive(Clone)]
pub struct RenderPass {
    core: Rc<PassCore>,
}

impl RenderPass {
    pub fn runtime(&self) -> RuntimeHandle {
        self.core.runtime.clone()
    }

    pub fn root(&self) -> Component {
        self.core.root.clone()
    }

    pub fn generation(&self) -> u64 {
        self.core.generation
    }

    pub fn rendered_count(&self) -> usize {
        self.core.rendered.get()
    }

    pub fn elapsed(&self) -> Duration {
        self.core.started.elapsed()
    }

    pub fn is_interrupted(&self) -> bool {
        self.core.interrupted.get()
    }

    fn top_frame(&self) -> Option<Rc<Frame>> {
        self.core.stack.borrow().last().cloned()
    }
}

mod pass_stack {
    use super::PassCore;
    use std::cell::RefCell;
    use std::rc::Rc;

    thread_local! {
        static PASS_STACK: RefCell<Vec<Rc<PassCore>>> = RefCell::new(Vec::new());
    }

    #[must_use = "the pass stays entered until the guard drops"]
    pub(super) struct PassGuard;

    impl Drop for PassGuard {
        fn drop(&mut self) {
            PASS_STACK.with(|stack| {
                stack.borrow_mut().pop();
            });
        }
    }

    pub(super) fn enter(core: &Rc<PassCore>) -> PassGuard {
        PASS_STACK.with(|stack| {
            stack.borrow_mut().push(Rc::clone(core));
        });
        PassGuard
    }

    pub(super) fn current() -> Option<Rc<PassCore>> {
        PASS_STACK.with(|stack| stack.borrow().last().cloned())
    }
}

/// Internal outcome of rendering one component.
enum Rendered {
    /// Committed a real result.
    Done(Value),
    /// Committed the pending placeholder.
    Pended(Value),
}

type RenderResult = Result<Rendered, DynError>;

enum Prepared {
    Ready(Value),
    Outstanding,
    Failed(DynError),
}

impl Component {
    /// Renders this component as a child of the component currently being
    /// prepared or rendered in `pass`.
    ///
    /// Panics when called outside an active pass, through a pass that is not
    /// the innermost one, or re-entrantly for a component that is already
    /// mid-render (which would mean two simultaneous parents).
    pub fn render(&self, pass: &RenderPass, arg: Arg) -> Result<Value, RenderError> {
        self.render_with(pass, arg, RenderOptions::default())
    }

    /// [`Component::render`] with an explicit context override and pending
    /// mode.
    pub fn render_with(
        &self,
        pass: &RenderPass,
        arg: Arg,
        options: RenderOptions,
    ) -> Result<Value, RenderError> {
        let parent_frame = pass.top_frame();
        match render_component(self, pass, arg, options.context, parent_frame.as_ref()) {
            Ok(Rendered::Done(value)) => Ok(value),
            Ok(Rendered::Pended(placeholder)) => match options.pending {
                PendingMode::Required => Err(RenderError::Pending),
                PendingMode::Optional => Ok(placeholder),
                PendingMode::Inherit => {
                    if let Some(frame) = parent_frame {
                        frame.pending_child.set(true);
                    }
                    Ok(placeholder)
                }
            },
            Err(error) => Err(RenderError::Failed(error)),
        }
    }

    /// Renders this component as a root with the unit argument.
    pub fn render_root(&self, runtime: &RuntimeHandle) -> Result<Value, RenderError> {
        self.render_root_with(runtime, crate::unit_value(), None)
    }

    /// Renders this component as a root of its own pass. Registers it with
    /// the runtime's root table so later invalidation requests can schedule
    /// further passes. A pending root commits its placeholder and returns it
    /// without raising.
    pub fn render_root_with(
        &self,
        runtime: &RuntimeHandle,
        arg: Arg,
        context: Option<Context>,
    ) -> Result<Value, RenderError> {
        render_root(self, runtime, arg, context)
    }

    /// Like [`Component::render_root`], but observed through a deferred that
    /// settles with the first non-placeholder result (or the first
    /// unrecovered failure) across this and subsequent passes.
    pub fn render_root_deferred(&self, runtime: &RuntimeHandle) -> Deferred<Value> {
        self.render_root_deferred_with(runtime, crate::unit_value(), None)
    }

    pub fn render_root_deferred_with(
        &self,
        runtime: &RuntimeHandle,
        arg: Arg,
        context: Option<Context>,
    ) -> Deferred<Value> {
        let deferred = Deferred::new();
        runtime.push_root_waiter(self, deferred.clone());
        let _ = render_root(self, runtime, arg, context);
        deferred
    }

    /// Unmounts a root and its subtree: unmount hooks fire children-first,
    /// caches drop, and disappearance hooks are deferred by one tick.
    pub fn unmount_root(&self) {
        if !self.inner.flags.root.get() {
            return;
        }
        log::debug!("root #{} unmounting", self.id());
        self.inner.flags.root.set(false);
        if let Some(runtime) = self.runtime() {
            runtime.remove_root(self);
        }
        unmount_subtree(self);
    }
}

fn render_root(
    root: &Component,
    runtime: &RuntimeHandle,
    arg: Arg,
    context: Option<Context>,
) -> Result<Value, RenderError> {
    root.bind_runtime(runtime.clone());
    root.inner.flags.root.set(true);
    runtime.register_root(root, arg.clone(), context.clone());
    let Some((generation, resume_floor)) = runtime.begin_root_pass(root) else {
        return Err(RenderError::Failed(Rc::new(RenderFault::new(
            "runtime is gone",
        ))));
    };
    log::debug!(
        "root #{} pass {generation} starting (resume floor {resume_floor})",
        root.id()
    );
    let core = Rc::new(PassCore {
        runtime: runtime.clone(),
        root: root.clone(),
        generation,
        started: Instant::now(),
        rendered: Cell::new(0),
        resume_floor,
        interrupted: Cell::new(false),
        active: Cell::new(true),
        stack: RefCell::new(Vec::new()),
        _not_send: PhantomData,
    });
    let pass = RenderPass {
        core: Rc::clone(&core),
    };
    let outcome = {
        let _guard = pass_stack::enter(&core);
        render_component(root, &pass, arg, context, None)
    };
    core.active.set(false);

    if core.interrupted.get() {
        let recorded = runtime.take_interrupted(root);
        log::debug!(
            "root #{} pass {generation} interrupted after {} renders ({} recorded)",
            root.id(),
            core.rendered.get(),
            recorded.len()
        );
        resume_sweep(&recorded);
        runtime.set_resume_floor(root, core.rendered.get());
        runtime.request_root_render(root);
    } else {
        runtime.set_resume_floor(root, 0);
    }

    match outcome {
        Ok(Rendered::Done(value)) => {
            runtime.settle_root_waiters(root, Ok(value.clone()));
            Ok(value)
        }
        Ok(Rendered::Pended(placeholder)) => Ok(placeholder),
        Err(error) => {
            runtime.settle_root_waiters(root, Err(Rc::clone(&error)));
            Err(RenderError::Failed(error))
        }
    }
}

/// Invalidates everything the interrupted pass threw away, so the follow-up
/// pass re-renders down to each recorded component: the components lose both
/// caches, their settled ancestors lose render caches.
fn resume_sweep(recorded: &[Component]) {
    for component in recorded {
        component.clear_render_cache();
        component.clear_prepare();
        component.invalidate_rendered_ancestors();
    }
}

fn render_component(
    component: &Component,
    pass: &RenderPass,
    arg: Arg,
    context_override: Option<Context>,
    parent_frame: Option<&Rc<Frame>>,
) -> RenderResult {
    let core = &pass.core;
    if !core.active.get() {
        panic!(
            "component #{} rendered outside an active render pass; \
             renders must happen synchronously within the pass that produced the handle",
            component.id()
        );
    }
    match pass_stack::current() {
        Some(top) if Rc::ptr_eq(&top, core) => {}
        _ => panic!(
            "component #{} rendered through a pass that is not the innermost active one",
            component.id()
        ),
    }
    if matches!(
        component.phase(),
        Phase::Mounting | Phase::Preparing | Phase::Rendering
    ) {
        panic!(
            "component #{} is already mid-render; a component cannot be mounted under two parents at once",
            component.id()
        );
    }

    let received = match context_override {
        Some(context) => context,
        None => match parent_frame {
            Some(frame) => frame.child_context.clone(),
            None => component
                .inner
                .context
                .borrow()
                .as_ref()
                .map(Context::without_reader)
                .unwrap_or_else(Context::empty),
        },
    };

    enter_component(component, pass, parent_frame.map(|frame| &frame.component), &received);

    let count = core.rendered.get() + 1;
    core.rendered.set(count);
    let interrupt_now = core.interrupted.get() || {
        count > core.resume_floor && {
            let probe = InterruptProbe {
                generation: core.generation,
                elapsed: core.started.elapsed(),
                rendered_since_resume: count - core.resume_floor,
            };
            component.kind().should_interrupt(&probe)
        }
    };
    if interrupt_now {
        if !core.interrupted.get() {
            core.interrupted.set(true);
            log::debug!(
                "pass on root #{} interrupted at component #{} (render {count})",
                core.root.id(),
                component.id()
            );
        }
        core.runtime.record_interrupted(&core.root, component);
        return pend(component, pass, &arg, &received, parent_frame);
    }

    component.inner.step_reads.borrow_mut().clear();

    let prepared = match ensure_prepared(component, pass, &received) {
        Prepared::Ready(value) => value,
        Prepared::Outstanding => return pend(component, pass, &arg, &received, parent_frame),
        Prepared::Failed(error) => {
            return render_error_path(component, pass, &arg, &received, error, parent_frame)
        }
    };

    if let Some(entry) = cache_lookup(component, &arg, &received) {
        log::trace!("component #{} served from cache", component.id());
        restore_cached(component, &entry);
        component
            .kind()
            .on_cached_render(component, &arg, &entry.result);
        commit(component, entry.result.clone(), false);
        core.rendered.set(core.rendered.get() + entry.descendants);
        note_child(
            parent_frame,
            component,
            entry.result.clone(),
            Rc::clone(&entry.children),
            &received,
            entry.reads.clone(),
            entry.descendants,
            false,
        );
        return Ok(Rendered::Done(entry.result.clone()));
    }

    component.inner.phase.set(Phase::Rendering);
    let frame = Rc::new(Frame {
        component: component.clone(),
        children: RefCell::new(ChildSet::new()),
        child_context: child_context_for_render(component, &received, &prepared),
        pending_child: Cell::new(false),
        descendants: Cell::new(0),
    });
    push_frame(core, &frame);
    let output = component.kind().render(component, pass, &arg);
    pop_frame(core, &frame);

    match output {
        Ok(value) => {
            if frame.pending_child.get() && component.kind().should_wait_for_children(component) {
                // the computed value is discarded; children stay mounted
                return pend(component, pass, &arg, &received, parent_frame);
            }
            let reads = component.inner.step_reads.borrow_mut().take();
            let children = Rc::new(frame.children.replace(ChildSet::new()));
            reconcile_rendered(component, &children);
            *component.inner.children_rendered.borrow_mut() = Rc::clone(&children);
            let descendants = frame.descendants.get();
            component.inner.render_cache.borrow_mut().insert(
                CacheEntry {
                    arg: arg.clone(),
                    result: value.clone(),
                    children: Rc::clone(&children),
                    context: received.without_reader(),
                    reads: reads.clone(),
                    descendants,
                },
                component.kind(),
            );
            commit(component, value.clone(), false);
            note_child(
                parent_frame,
                component,
                value.clone(),
                children,
                &received,
                reads,
                descendants,
                false,
            );
            Ok(Rendered::Done(value))
        }
        Err(RenderError::Pending) => pend(component, pass, &arg, &received, parent_frame),
        Err(RenderError::Failed(error)) => {
            render_error_path(component, pass, &arg, &received, error, parent_frame)
        }
    }
}

/// Attaches the component for this render: a plain context refresh when the
/// parent is unchanged, otherwise move detachment followed by a mount.
fn enter_component(
    component: &Component,
    pass: &RenderPass,
    parent: Option<&Component>,
    received: &Context,
) {
    component.bind_runtime(pass.core.runtime.clone());
    let previous = component.parent();
    let attached_as_root = component.is_root()
        && !matches!(component.phase(), Phase::Creating | Phase::Unmounting);
    let settled_here = match parent {
        Some(parent) => previous.as_ref() == Some(parent),
        None => attached_as_root && previous.is_none(),
    };
    if settled_here {
        receive_context(component, received);
        return;
    }

    if previous.is_some() || attached_as_root {
        if component.is_root() && parent.is_some() {
            // a root rendered under a parent stops being a root
            component.inner.flags.root.set(false);
            if let Some(runtime) = component.runtime() {
                runtime.remove_root(component);
            }
        }
        detach_for_move(component);
    }

    component.inner.phase.set(Phase::Mounting);
    *component.inner.parent.borrow_mut() = parent.map(Component::downgrade);
    // a remount cancels a scheduled disappearance
    component.inner.flags.disappear_pending.set(false);
    receive_context(component, received);
    if !component.inner.flags.appeared.get() {
        component.inner.flags.appeared.set(true);
        component.kind().on_appear(component);
    }
    component.kind().on_mount(component);
    log::trace!(
        "component #{} mounted under {:?}",
        component.id(),
        parent.map(Component::id)
    );
}

/// Stores the received context and fires the context hook when its identity
/// changed. A change that touches a previously read key drops the prepare
/// record and render cache.
fn receive_context(component: &Component, received: &Context) {
    let changed = {
        let stored = component.inner.context.borrow();
        match stored.as_ref() {
            Some(current) => !current.same(received),
            None => true,
        }
    };
    if !changed {
        return;
    }
    let stale = {
        let stored = component.inner.context.borrow();
        match stored.as_ref() {
            Some(previous) => {
                reads_differ(previous, received, &component.inner.context_reads.borrow())
            }
            None => false,
        }
    };
    *component.inner.context.borrow_mut() = Some(received.with_reader(component));
    if stale {
        log::debug!(
            "component #{} context changed on a read key; caches dropped",
            component.id()
        );
        component.clear_render_cache();
        component.clear_prepare();
        component.inner.context_reads.borrow_mut().clear();
    }
    component.kind().on_receive_context(component, received);
}

fn reads_differ(previous: &Context, next: &Context, reads: &KeySet) -> bool {
    reads.iter().any(|key| {
        match (previous.value_at(key), next.value_at(key)) {
            (None, None) => false,
            (Some(a), Some(b)) => !Rc::ptr_eq(a, b),
            _ => true,
        }
    })
}

fn ensure_prepared(component: &Component, pass: &RenderPass, received: &Context) -> Prepared {
    let settled = {
        let state = component.inner.prepare.borrow();
        match &*state {
            PrepareState::InFlight(_) => Some(Prepared::Outstanding),
            PrepareState::Failed(error) => Some(Prepared::Failed(Rc::clone(error))),
            PrepareState::Ready(value) => Some(Prepared::Ready(value.clone())),
            PrepareState::NotPrepared => None,
        }
    };
    match settled {
        Some(Prepared::Ready(value)) => {
            if component.kind().should_prepare(component) {
                run_prepare(component, pass, received)
            } else {
                Prepared::Ready(value)
            }
        }
        Some(outcome) => outcome,
        None => run_prepare(component, pass, received),
    }
}

fn run_prepare(component: &Component, pass: &RenderPass, received: &Context) -> Prepared {
    log::debug!("component #{} preparing", component.id());
    // renders built on the previous prepare are stale
    component.clear_render_cache();
    component.clear_prepare();
    component
        .inner
        .prepared_version
        .set(component.inner.state_version.get());
    let epoch = component.inner.prepare_epoch.get();
    component.inner.phase.set(Phase::Preparing);

    let frame = Rc::new(Frame {
        component: component.clone(),
        children: RefCell::new(ChildSet::new()),
        child_context: child_context_for_prepare(component, received),
        pending_child: Cell::new(false),
        descendants: Cell::new(0),
    });
    push_frame(&pass.core, &frame);
    let deferred = component.kind().prepare(component, pass);
    pop_frame(&pass.core, &frame);

    // the synchronous part is done: prepare children commit now
    let children = Rc::new(frame.children.replace(ChildSet::new()));
    reconcile_prepare(component, &children);
    *component.inner.children_prepare.borrow_mut() = children;

    match deferred.peek() {
        Some(Ok(value)) => {
            *component.inner.prepare.borrow_mut() = PrepareState::Ready(value.clone());
            settle_ready(component, Ok(value.clone()));
            Prepared::Ready(value)
        }
        Some(Err(error)) => {
            *component.inner.prepare.borrow_mut() = PrepareState::Failed(Rc::clone(&error));
            settle_ready(component, Err(Rc::clone(&error)));
            Prepared::Failed(error)
        }
        None => {
            *component.inner.prepare.borrow_mut() = PrepareState::InFlight(deferred.clone());
            let weak = component.downgrade();
            deferred.on_settle(move |outcome| {
                let Some(component) = weak.upgrade() else {
                    return;
                };
                if component.inner.prepare_epoch.get() != epoch {
                    return; // a newer prepare superseded this one
                }
                match outcome {
                    Ok(value) => {
                        log::trace!("component #{} prepare resolved", component.id());
                        *component.inner.prepare.borrow_mut() =
                            PrepareState::Ready(value.clone());
                        settle_ready(&component, Ok(value));
                    }
                    Err(error) => {
                        log::debug!(
                            "component #{} prepare rejected: {error}",
                            component.id()
                        );
                        *component.inner.prepare.borrow_mut() =
                            PrepareState::Failed(Rc::clone(&error));
                        settle_ready(&component, Err(error));
                    }
                }
                // ancestors may hold cached renders embedding the placeholder
                component.invalidate_rendered_ancestors();
                component.request_render();
            });
            Prepared::Outstanding
        }
    }
}

fn settle_ready(component: &Component, outcome: Result<Value, DynError>) {
    let waiter = component.inner.ready_slot.borrow_mut().take();
    if let Some(deferred) = waiter {
        match outcome {
            Ok(value) => deferred.resolve(value),
            Err(error) => deferred.reject(error),
        }
    }
}

/// Context for children rendered during prepare: the received context plus
/// the kind's prepare-phase modifications.
fn child_context_for_prepare(component: &Component, received: &Context) -> Context {
    let readable = received.with_reader(component);
    let patch = component.kind().prepare_context_patch(component, &readable);
    component
        .inner
        .prepare_patch
        .borrow_mut()
        .apply(received, &patch)
}

/// Context for children rendered during the render step: prepare-phase
/// modifications first, then the post-prepare ones computed from the
/// prepare result.
fn child_context_for_render(component: &Component, received: &Context, prepared: &Value) -> Context {
    let base = child_context_for_prepare(component, received);
    let readable = base.with_reader(component);
    let patch = component.kind().context_patch(component, &readable, prepared);
    component
        .inner
        .render_patch
        .borrow_mut()
        .apply(&base, &patch)
}

/// Fallback child context for placeholder and recovery renders, where a
/// prepare result may not exist.
fn child_context_for_recovery(component: &Component, received: &Context) -> Context {
    match component.prepared() {
        Some(prepared) => child_context_for_render(component, received, &prepared),
        None => child_context_for_prepare(component, received),
    }
}

fn cache_lookup(component: &Component, arg: &Arg, received: &Context) -> Option<Rc<CacheEntry>> {
    if component.kind().should_render(component, arg) {
        return None;
    }
    let mut cache = component.inner.render_cache.borrow_mut();
    cache.lookup(arg, component.kind(), |entry| {
        entry.context.same(received) || !reads_differ(&entry.context, received, &entry.reads)
    })
}

/// Re-establishes the cached subtree: the recorded children become current
/// again, re-attaching (with unmount/mount hooks) wherever a child's parent
/// changed since the entry was taken.
fn restore_cached(component: &Component, entry: &CacheEntry) {
    *component.inner.children_rendered.borrow_mut() = Rc::clone(&entry.children);
    for record in entry.children.iter() {
        reattach_restored(component, record);
    }
}

fn reattach_restored(parent: &Component, record: &ChildRecord) {
    let child = &record.component;
    let previous = child.parent();
    if previous.as_ref() != Some(parent) {
        if previous.is_some() {
            detach_for_move(child);
        }
        child.inner.phase.set(Phase::Restoring);
        *child.inner.parent.borrow_mut() = Some(parent.downgrade());
        child.inner.flags.disappear_pending.set(false);
        receive_context(child, &record.context);
        if !child.inner.flags.appeared.get() {
            child.inner.flags.appeared.set(true);
            child.kind().on_appear(child);
        }
        child.kind().on_mount(child);
        log::trace!(
            "component #{} restored under #{}",
            child.id(),
            parent.id()
        );
    } else {
        receive_context(child, &record.context);
    }
    *child.inner.result.borrow_mut() = Some(record.result.clone());
    child.inner.flags.pending.set(record.pending);
    *child.inner.children_rendered.borrow_mut() = Rc::clone(&record.children);
    for grandchild in record.children.iter() {
        reattach_restored(child, grandchild);
    }
}

/// Commits the pending placeholder: the placeholder hook renders (children
/// it mounts stay, but are not recorded), no cache entry is taken and the
/// rendered deferred stays unsettled.
fn pend(
    component: &Component,
    pass: &RenderPass,
    arg: &Arg,
    received: &Context,
    parent_frame: Option<&Rc<Frame>>,
) -> RenderResult {
    component.inner.phase.set(Phase::Rendering);
    let frame = Rc::new(Frame {
        component: component.clone(),
        children: RefCell::new(ChildSet::new()),
        child_context: child_context_for_recovery(component, received),
        pending_child: Cell::new(false),
        descendants: Cell::new(0),
    });
    push_frame(&pass.core, &frame);
    let placeholder = component.kind().render_pending(component, pass, arg);
    pop_frame(&pass.core, &frame);

    let reads = component.inner.step_reads.borrow_mut().take();
    commit(component, placeholder.clone(), true);
    note_child(
        parent_frame,
        component,
        placeholder.clone(),
        Rc::clone(&*component.inner.children_rendered.borrow()),
        received,
        reads,
        frame.descendants.get(),
        true,
    );
    Ok(Rendered::Pended(placeholder))
}

/// Routes a failed render (or failed prepare) through the recovery hook.
/// Previously rendered children are preserved; a failure inside the
/// recovery render propagates to the caller.
fn render_error_path(
    component: &Component,
    pass: &RenderPass,
    arg: &Arg,
    received: &Context,
    error: DynError,
    parent_frame: Option<&Rc<Frame>>,
) -> RenderResult {
    log::debug!("component #{} render failed: {error}", component.id());
    component.inner.phase.set(Phase::Rendering);
    let frame = Rc::new(Frame {
        component: component.clone(),
        children: RefCell::new(ChildSet::new()),
        child_context: child_context_for_recovery(component, received),
        pending_child: Cell::new(false),
        descendants: Cell::new(0),
    });
    push_frame(&pass.core, &frame);
    let recovery = component.kind().render_error(component, pass, arg, &error);
    pop_frame(&pass.core, &frame);

    match recovery {
        Ok(value) => {
            let reads = component.inner.step_reads.borrow_mut().take();
            commit(component, value.clone(), false);
            note_child(
                parent_frame,
                component,
                value.clone(),
                Rc::clone(&*component.inner.children_rendered.borrow()),
                received,
                reads,
                frame.descendants.get(),
                false,
            );
            Ok(Rendered::Done(value))
        }
        Err(RenderError::Pending) => pend(component, pass, arg, received, parent_frame),
        Err(RenderError::Failed(error)) => {
            component.inner.phase.set(Phase::Rendered);
            Err(error)
        }
    }
}

fn commit(component: &Component, value: Value, pending: bool) {
    *component.inner.result.borrow_mut() = Some(value.clone());
    component.inner.phase.set(Phase::Rendered);
    component.inner.flags.pending.set(pending);
    if !pending {
        let waiter = component.inner.rendered_slot.borrow_mut().take();
        if let Some(deferred) = waiter {
            deferred.resolve(value);
        }
    }
}

/// Records a finished child in the parent's frame and folds the child's
/// reads and render counts into the parent.
#[allow(clippy::too_many_arguments)]
fn note_child(
    parent_frame: Option<&Rc<Frame>>,
    child: &Component,
    result: Value,
    children: Rc<ChildSet>,
    context: &Context,
    reads: KeySet,
    descendants: usize,
    pending: bool,
) {
    let Some(frame) = parent_frame else {
        return;
    };
    frame
        .component
        .inner
        .step_reads
        .borrow_mut()
        .union_with(&reads);
    frame.descendants.set(frame.descendants.get() + descendants + 1);
    frame.children.borrow_mut().insert(ChildRecord {
        component: child.clone(),
        result,
        children,
        context: context.without_reader(),
        reads,
        descendants,
        pending,
    });
}

/// Unmounts previously rendered children missing from the new set, unless
/// they already moved to another parent during this pass.
fn reconcile_rendered(component: &Component, next: &Rc<ChildSet>) {
    let previous = Rc::clone(&*component.inner.children_rendered.borrow());
    for record in previous.iter() {
        let id = record.component.id();
        if next.contains(id) || component.inner.children_prepare.borrow().contains(id) {
            continue;
        }
        if record.component.parent().as_ref() != Some(component) {
            continue;
        }
        unmount_subtree(&record.component);
    }
}

fn reconcile_prepare(component: &Component, next: &Rc<ChildSet>) {
    let previous = Rc::clone(&*component.inner.children_prepare.borrow());
    for record in previous.iter() {
        let id = record.component.id();
        if next.contains(id) || component.inner.children_rendered.borrow().contains(id) {
            continue;
        }
        if record.component.parent().as_ref() != Some(component) {
            continue;
        }
        unmount_subtree(&record.component);
    }
}

/// Full teardown: children first, unmount hooks, caches and records dropped,
/// disappearance deferred one tick (canceled by a remount in between).
fn unmount_subtree(component: &Component) {
    if matches!(component.phase(), Phase::Creating | Phase::Unmounting) {
        return;
    }
    let prepare = Rc::clone(&*component.inner.children_prepare.borrow());
    let rendered = Rc::clone(&*component.inner.children_rendered.borrow());
    for record in prepare.iter().chain(rendered.iter()) {
        if record.component.parent().as_ref() == Some(component) {
            unmount_subtree(&record.component);
        }
    }
    log::debug!("component #{} unmounting", component.id());
    component.inner.phase.set(Phase::Unmounting);
    component.kind().on_unmount(component);
    *component.inner.parent.borrow_mut() = None;
    component.clear_render_cache();
    component.clear_prepare();
    component.inner.context_reads.borrow_mut().clear();
    *component.inner.children_prepare.borrow_mut() = Rc::new(ChildSet::new());
    *component.inner.children_rendered.borrow_mut() = Rc::new(ChildSet::new());
    component.inner.flags.disappear_pending.set(true);
    if let Some(runtime) = component.runtime() {
        runtime.defer_disappear(component);
    }
}

/// Move detachment: unmount hooks fire through the subtree (children first)
/// and parent links clear, but caches, records and prepare results survive
/// for the mount that follows.
fn detach_for_move(component: &Component) {
    let prepare = Rc::clone(&*component.inner.children_prepare.borrow());
    let rendered = Rc::clone(&*component.inner.children_rendered.borrow());
    for record in prepare.iter().chain(rendered.iter()) {
        if record.component.parent().as_ref() == Some(component) {
            detach_for_move(&record.component);
        }
    }
    component.inner.phase.set(Phase::Unmounting);
    component.kind().on_unmount(component);
    *component.inner.parent.borrow_mut() = None;
    log::trace!("component #{} detached for move", component.id());
}

fn push_frame(core: &Rc<PassCore>, frame: &Rc<Frame>) {
    core.stack.borrow_mut().push(Rc::clone(frame));
}

fn pop_frame(core: &Rc<PassCore>, frame: &Rc<Frame>) {
    let popped = core.stack.borrow_mut().pop();
    debug_assert!(
        popped.map(|top| Rc::ptr_eq(&top, frame)).unwrap_or(false),
        "frame stack out of order"
    );
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
