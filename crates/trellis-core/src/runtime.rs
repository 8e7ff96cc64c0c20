//! Runtime services behind the tree: the scheduling tick queue, a local
//! task executor, the root registry and deferred disappearance.
//!
//! The runtime never spins a thread of its own. A host supplies a
//! [`TickScheduler`] whose `wake` is called whenever work lands in the
//! queue; the host then calls [`Runtime::drain_ticks`] at a convenient
//! moment on the runtime's thread.

use crate::collections::map::HashMap;
use crate::context::Context;
use crate::deferred::Deferred;
use crate::{unit_value, Component, ComponentId, DynError, RenderFault, Value, WeakComponent};
use futures_task::{waker, ArcWake};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};

/// Host-side wakeup. `wake` may be called from any thread; it should make
/// the host call [`Runtime::drain_ticks`] soon, on the runtime's thread.
pub trait TickScheduler: Send + Sync {
    fn wake(&self);
}

pub type TickId = u64;
pub type TaskId = u64;

struct TickEntry {
    id: TickId,
    callback: Box<dyn FnOnce()>,
}

struct TaskEntry {
    id: TaskId,
    future: Pin<Box<dyn Future<Output = ()>>>,
}

/// Per-root bookkeeping: pass numbering, resume state, re-render batching
/// and result waiters.
struct RootEntry {
    component: WeakComponent,
    /// Replaces the default re-render when set.
    handler: RefCell<Option<Rc<dyn Fn(&Component)>>>,
    /// Argument and context of the most recent explicit root render; the
    /// default re-render repeats them.
    last_arg: RefCell<Option<(Value, Option<Context>)>>,
    generation: Cell<u64>,
    resume_floor: Cell<usize>,
    /// Components that hit the interrupt gate during the current pass.
    interrupted: RefCell<Vec<Component>>,
    /// A re-render tick is already queued.
    scheduled: Cell<bool>,
    waiters: RefCell<Vec<Deferred<Value>>>,
}

struct RuntimeInner {
    scheduler: Arc<dyn TickScheduler>,
    ticks: RefCell<VecDeque<TickEntry>>,
    next_tick_id: Cell<TickId>,
    tasks: RefCell<Vec<TaskEntry>>,
    next_task_id: Cell<TaskId>,
    /// Task ids woken since the last poll sweep. Shared with wakers, which
    /// may fire from other threads.
    woken: Arc<Mutex<Vec<TaskId>>>,
    roots: RefCell<HashMap<ComponentId, Rc<RootEntry>>>,
    draining: Cell<bool>,
}

impl RuntimeInner {
    fn root_entry(&self, id: ComponentId) -> Option<Rc<RootEntry>> {
        self.roots.borrow().get(&id).map(Rc::clone)
    }

    fn ensure_root_entry(&self, root: &Component) -> Rc<RootEntry> {
        let mut roots = self.roots.borrow_mut();
        let entry = roots.entry(root.id()).or_insert_with(|| {
            log::debug!("root #{} registered", root.id());
            Rc::new(RootEntry {
                component: root.downgrade(),
                handler: RefCell::new(None),
                last_arg: RefCell::new(None),
                generation: Cell::new(0),
                resume_floor: Cell::new(0),
                interrupted: RefCell::new(Vec::new()),
                scheduled: Cell::new(false),
                waiters: RefCell::new(Vec::new()),
            })
        });
        Rc::clone(entry)
    }

    fn drain_woken(&self) -> Vec<TaskId> {
        let mut woken = match self.woken.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::take(&mut *woken)
    }
}

struct TaskWaker {
    id: TaskId,
    woken: Arc<Mutex<Vec<TaskId>>>,
    scheduler: Arc<dyn TickScheduler>,
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        {
            let mut woken = match arc_self.woken.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            woken.push(arc_self.id);
        }
        arc_self.scheduler.wake();
    }
}

/// Owning half of the runtime. Dropping it cancels all queued ticks and
/// tasks; handles become inert.
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

impl Runtime {
    pub fn new(scheduler: Arc<dyn TickScheduler>) -> Runtime {
        Runtime {
            inner: Rc::new(RuntimeInner {
                scheduler,
                ticks: RefCell::new(VecDeque::new()),
                next_tick_id: Cell::new(1),
                tasks: RefCell::new(Vec::new()),
                next_task_id: Cell::new(1),
                woken: Arc::new(Mutex::new(Vec::new())),
                roots: RefCell::new(HashMap::default()),
                draining: Cell::new(false),
            }),
        }
    }

    pub fn handle(&self) -> RuntimeHandle {
        RuntimeHandle {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Runs queued tick callbacks and polls woken tasks until neither
    /// produces more work. Re-entrant calls return immediately.
    pub fn drain_ticks(&self) {
        if self.inner.draining.replace(true) {
            return;
        }
        loop {
            let batch: Vec<TickEntry> = {
                let mut ticks = self.inner.ticks.borrow_mut();
                ticks.drain(..).collect()
            };
            let had_ticks = !batch.is_empty();
            for entry in batch {
                (entry.callback)();
            }
            let polled = self.poll_woken();
            if !had_ticks && !polled {
                break;
            }
        }
        self.inner.draining.set(false);
    }

    /// No queued ticks and no tasks awaiting a poll.
    pub fn is_idle(&self) -> bool {
        if !self.inner.ticks.borrow().is_empty() {
            return false;
        }
        let woken = match self.inner.woken.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        woken.is_empty()
    }

    fn poll_woken(&self) -> bool {
        let mut polled = false;
        loop {
            let woken = self.inner.drain_woken();
            if woken.is_empty() {
                break;
            }
            for id in woken {
                // removed while polled, so a poll can reach the task list
                let task = {
                    let mut tasks = self.inner.tasks.borrow_mut();
                    tasks
                        .iter()
                        .position(|task| task.id == id)
                        .map(|index| tasks.remove(index))
                };
                let Some(mut task) = task else {
                    continue;
                };
                polled = true;
                let waker = waker(Arc::new(TaskWaker {
                    id,
                    woken: Arc::clone(&self.inner.woken),
                    scheduler: Arc::clone(&self.inner.scheduler),
                }));
                let mut cx = TaskContext::from_waker(&waker);
                match task.future.as_mut().poll(&mut cx) {
                    Poll::Ready(()) => {
                        log::trace!("task #{} finished", task.id);
                    }
                    Poll::Pending => self.inner.tasks.borrow_mut().push(task),
                }
            }
        }
        polled
    }
}

/// Weak handle onto a [`Runtime`]. Every operation is a no-op (or `None`)
/// once the runtime is dropped.
#[derive(Clone)]
pub struct RuntimeHandle {
    inner: Weak<RuntimeInner>,
}

impl RuntimeHandle {
    fn upgrade(&self) -> Option<Rc<RuntimeInner>> {
        self.inner.upgrade()
    }

    /// Queues a callback for the next drain and wakes the host.
    pub fn schedule_tick(&self, callback: impl FnOnce() + 'static) -> Option<TickId> {
        let inner = self.upgrade()?;
        let id = inner.next_tick_id.get();
        inner.next_tick_id.set(id + 1);
        inner.ticks.borrow_mut().push_back(TickEntry {
            id,
            callback: Box::new(callback),
        });
        inner.scheduler.wake();
        Some(id)
    }

    /// Removes a queued tick. Returns whether it was still queued.
    pub fn cancel_tick(&self, id: TickId) -> bool {
        let Some(inner) = self.upgrade() else {
            return false;
        };
        let mut ticks = inner.ticks.borrow_mut();
        let before = ticks.len();
        ticks.retain(|entry| entry.id != id);
        ticks.len() != before
    }

    /// Adds a local task. The first poll happens on the next drain.
    pub fn spawn_local(&self, future: impl Future<Output = ()> + 'static) -> Option<TaskId> {
        let inner = self.upgrade()?;
        let id = inner.next_task_id.get();
        inner.next_task_id.set(id + 1);
        inner.tasks.borrow_mut().push(TaskEntry {
            id,
            future: Box::pin(future),
        });
        {
            let mut woken = match inner.woken.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            woken.push(id);
        }
        inner.scheduler.wake();
        Some(id)
    }

    /// Drops a task without polling it again. Returns whether it existed.
    pub fn cancel_task(&self, id: TaskId) -> bool {
        let Some(inner) = self.upgrade() else {
            return false;
        };
        let mut tasks = inner.tasks.borrow_mut();
        let before = tasks.len();
        tasks.retain(|task| task.id != id);
        tasks.len() != before
    }

    /// Installs a callback that runs instead of the default re-render when
    /// this root is invalidated.
    pub fn set_render_request_handler(
        &self,
        root: &Component,
        handler: impl Fn(&Component) + 'static,
    ) {
        let Some(inner) = self.upgrade() else {
            return;
        };
        let entry = inner.ensure_root_entry(root);
        *entry.handler.borrow_mut() = Some(Rc::new(handler));
    }

    pub(crate) fn register_root(&self, root: &Component, arg: Value, context: Option<Context>) {
        let Some(inner) = self.upgrade() else {
            return;
        };
        let entry = inner.ensure_root_entry(root);
        *entry.last_arg.borrow_mut() = Some((arg, context));
    }

    pub(crate) fn remove_root(&self, root: &Component) {
        let Some(inner) = self.upgrade() else {
            return;
        };
        let entry = inner.roots.borrow_mut().remove(&root.id());
        let Some(entry) = entry else {
            return;
        };
        log::debug!("root #{} removed", root.id());
        let waiters = std::mem::take(&mut *entry.waiters.borrow_mut());
        if !waiters.is_empty() {
            let error: DynError = Rc::new(RenderFault::new("root unmounted"));
            for waiter in waiters {
                waiter.reject(Rc::clone(&error));
            }
        }
    }

    /// Starts a pass on `root`: bumps the pass number and hands back the
    /// resume floor left by an interrupted predecessor.
    pub(crate) fn begin_root_pass(&self, root: &Component) -> Option<(u64, usize)> {
        let inner = self.upgrade()?;
        let entry = inner.ensure_root_entry(root);
        let generation = entry.generation.get() + 1;
        entry.generation.set(generation);
        Some((generation, entry.resume_floor.get()))
    }

    pub(crate) fn set_resume_floor(&self, root: &Component, floor: usize) {
        let Some(inner) = self.upgrade() else {
            return;
        };
        if let Some(entry) = inner.root_entry(root.id()) {
            entry.resume_floor.set(floor);
        }
    }

    pub(crate) fn record_interrupted(&self, root: &Component, component: &Component) {
        let Some(inner) = self.upgrade() else {
            return;
        };
        if let Some(entry) = inner.root_entry(root.id()) {
            entry.interrupted.borrow_mut().push(component.clone());
        }
    }

    pub(crate) fn take_interrupted(&self, root: &Component) -> Vec<Component> {
        let Some(inner) = self.upgrade() else {
            return Vec::new();
        };
        match inner.root_entry(root.id()) {
            Some(entry) => std::mem::take(&mut *entry.interrupted.borrow_mut()),
            None => Vec::new(),
        }
    }

    /// Queues a re-render of `root`. Requests between now and the tick
    /// coalesce into one.
    pub(crate) fn request_root_render(&self, root: &Component) {
        let Some(inner) = self.upgrade() else {
            return;
        };
        let Some(entry) = inner.root_entry(root.id()) else {
            return;
        };
        if entry.scheduled.replace(true) {
            return;
        }
        log::trace!("root #{} re-render queued", root.id());
        let handle = self.clone();
        let id = root.id();
        let _ = self.schedule_tick(move || {
            let Some(inner) = handle.upgrade() else {
                return;
            };
            let Some(entry) = inner.root_entry(id) else {
                return;
            };
            entry.scheduled.set(false);
            let Some(root) = entry.component.upgrade() else {
                return;
            };
            if !root.is_root() {
                return;
            }
            let handler = entry.handler.borrow().clone();
            match handler {
                Some(handler) => handler(&root),
                None => {
                    let last = entry.last_arg.borrow().clone();
                    let (arg, context) = last.unwrap_or_else(|| (unit_value(), None));
                    let _ = root.render_root_with(&handle, arg, context);
                }
            }
        });
    }

    pub(crate) fn push_root_waiter(&self, root: &Component, waiter: Deferred<Value>) {
        let Some(inner) = self.upgrade() else {
            return;
        };
        let entry = inner.ensure_root_entry(root);
        entry.waiters.borrow_mut().push(waiter);
    }

    pub(crate) fn settle_root_waiters(&self, root: &Component, outcome: Result<Value, DynError>) {
        let Some(inner) = self.upgrade() else {
            return;
        };
        let Some(entry) = inner.root_entry(root.id()) else {
            return;
        };
        let waiters = std::mem::take(&mut *entry.waiters.borrow_mut());
        for waiter in waiters {
            match &outcome {
                Ok(value) => waiter.resolve(value.clone()),
                Err(error) => waiter.reject(Rc::clone(error)),
            }
        }
    }

    /// Schedules the disappearance check that follows an unmount. The hook
    /// fires on the next drain unless the component remounted in between.
    pub(crate) fn defer_disappear(&self, component: &Component) {
        let weak = component.downgrade();
        let _ = self.schedule_tick(move || {
            let Some(component) = weak.upgrade() else {
                return;
            };
            if !component.inner.flags.disappear_pending.replace(false) {
                return;
            }
            if component.is_mounted() {
                return;
            }
            log::trace!("component #{} disappeared", component.id());
            component.kind().on_disappear(&component);
        });
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::{Runtime, TickScheduler};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    pub(crate) struct TestTicker {
        wakes: AtomicUsize,
    }

    impl TestTicker {
        pub(crate) fn wake_count(&self) -> usize {
            self.wakes.load(Ordering::Relaxed)
        }
    }

    impl TickScheduler for TestTicker {
        fn wake(&self) {
            self.wakes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn test_runtime() -> (Runtime, Arc<TestTicker>) {
        let ticker = Arc::new(TestTicker::default());
        let runtime = Runtime::new(Arc::clone(&ticker) as Arc<dyn TickScheduler>);
        (runtime, ticker)
    }
}

#[cfg(test)]
#[path = "tests/runtime_tests.rs"]
mod tests;
