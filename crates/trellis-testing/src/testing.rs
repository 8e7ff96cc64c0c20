use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use trellis_core::{
    unit_value, Component, ComponentKind, Context, RenderError, Runtime, RuntimeHandle,
    TickScheduler, Value,
};

/// Scheduler that counts wakeups instead of driving an event loop.
///
/// Work queued behind a wakeup runs when the test calls
/// [`TestTree::pump_until_idle`].
#[derive(Default)]
pub struct TestTicker {
    wakes: AtomicUsize,
}

impl TestTicker {
    pub fn wake_count(&self) -> usize {
        self.wakes.load(Ordering::Relaxed)
    }
}

impl TickScheduler for TestTicker {
    fn wake(&self) {
        self.wakes.fetch_add(1, Ordering::Relaxed);
    }
}

/// Headless harness for exercising a render tree in tests.
///
/// `TestTree` owns a runtime wired to a [`TestTicker`], keeps the root
/// component alive and replays the last render argument when state changes
/// call for another pass. Nothing runs in the background: after mutating
/// state, call [`TestTree::pump_until_idle`] to drain the scheduled work.
pub struct TestTree {
    runtime: Runtime,
    ticker: Arc<TestTicker>,
    root: Component,
    last_input: RefCell<(Value, Option<Context>)>,
}

impl TestTree {
    pub fn new(kind: impl ComponentKind) -> TestTree {
        TestTree::with_root(Component::new(kind))
    }

    pub fn with_root(root: Component) -> TestTree {
        let ticker = Arc::new(TestTicker::default());
        let runtime = Runtime::new(ticker.clone());
        TestTree {
            runtime,
            ticker,
            root,
            last_input: RefCell::new((unit_value(), None)),
        }
    }

    /// Renders the root with the unit argument, or with whatever
    /// [`TestTree::render_with`] passed last.
    pub fn render(&self) -> Result<Value, RenderError> {
        let (arg, context) = self.last_input.borrow().clone();
        log::debug!("test render of component #{}", self.root.id());
        self.root
            .render_root_with(&self.runtime.handle(), arg, context)
    }

    pub fn render_with(
        &self,
        arg: Value,
        context: Option<Context>,
    ) -> Result<Value, RenderError> {
        *self.last_input.borrow_mut() = (arg.clone(), context.clone());
        log::debug!("test render of component #{}", self.root.id());
        self.root
            .render_root_with(&self.runtime.handle(), arg, context)
    }

    /// Drains scheduled ticks and spawned futures until the runtime reports
    /// idle. Re-renders requested by state changes run here too.
    pub fn pump_until_idle(&self) {
        let mut iterations = 0;
        while !self.runtime.is_idle() {
            iterations += 1;
            if iterations > 100 {
                panic!("pump_until_idle looped too many times!");
            }
            log::trace!("pump iteration {iterations}");
            self.runtime.drain_ticks();
        }
    }

    pub fn unmount(&self) {
        self.root.unmount_root();
    }

    pub fn handle(&self) -> RuntimeHandle {
        self.runtime.handle()
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn root(&self) -> &Component {
        &self.root
    }

    pub fn wake_count(&self) -> usize {
        self.ticker.wake_count()
    }

    pub fn dump_tree(&self) -> String {
        self.root.debug_tree()
    }
}

/// Runs `f` against a fresh [`TestTree`] rooted at `kind`.
pub fn run_test_tree<R>(kind: impl ComponentKind, f: impl FnOnce(&TestTree) -> R) -> R {
    let tree = TestTree::new(kind);
    f(&tree)
}

#[cfg(test)]
#[path = "tests/testing_tests.rs"]
mod tests;
