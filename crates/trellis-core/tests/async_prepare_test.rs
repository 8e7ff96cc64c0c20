//! The asynchronous prepare flow end to end: a component whose prepare
//! resolves later commits a placeholder first, and the released value lands
//! on the next pump.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use trellis_core::{
    is_pending_value, unit_value, value, Arg, Component, ComponentKind, Deferred, DynError,
    RenderError, RenderFault, RenderPass, Value,
};
use trellis_testing::TestTree;

type Gate = Rc<RefCell<Option<Deferred<Value>>>>;

struct Fetch {
    gate: Gate,
    prepares: Rc<Cell<usize>>,
    renders: Rc<Cell<usize>>,
}

impl ComponentKind for Fetch {
    fn prepare(&self, _component: &Component, _pass: &RenderPass) -> Deferred<Value> {
        self.prepares.set(self.prepares.get() + 1);
        let deferred = Deferred::new();
        *self.gate.borrow_mut() = Some(deferred.clone());
        deferred
    }

    fn render(
        &self,
        component: &Component,
        _pass: &RenderPass,
        _arg: &Arg,
    ) -> Result<Value, RenderError> {
        self.renders.set(self.renders.get() + 1);
        Ok(component.prepared().unwrap_or_else(unit_value))
    }
}

fn fetch() -> (Fetch, Gate, Rc<Cell<usize>>, Rc<Cell<usize>>) {
    let gate: Gate = Rc::new(RefCell::new(None));
    let prepares = Rc::new(Cell::new(0));
    let renders = Rc::new(Cell::new(0));
    let kind = Fetch {
        gate: gate.clone(),
        prepares: prepares.clone(),
        renders: renders.clone(),
    };
    (kind, gate, prepares, renders)
}

fn fault(message: &str) -> DynError {
    Rc::new(RenderFault::new(message))
}

fn release(gate: &Gate, result: Value) {
    let deferred = gate
        .borrow_mut()
        .take()
        .expect("a prepare should be in flight");
    deferred.resolve(result);
}

fn refuse(gate: &Gate, message: &str) {
    let deferred = gate
        .borrow_mut()
        .take()
        .expect("a prepare should be in flight");
    deferred.reject(fault(message));
}

#[test]
fn placeholder_until_the_release() {
    let (kind, gate, _prepares, renders) = fetch();
    let tree = TestTree::new(kind);

    let first = tree.render().expect("pending render");
    assert!(is_pending_value(&first));
    assert!(tree.root().is_pending());
    assert_eq!(renders.get(), 0);

    release(&gate, value(42i32));
    tree.pump_until_idle();

    assert_eq!(renders.get(), 1);
    assert!(!tree.root().is_pending());
    let result = tree.root().result().expect("settled result");
    assert_eq!(result.downcast_ref::<i32>(), Some(&42));
}

#[test]
fn deferred_root_render_resolves_on_release() {
    let (kind, gate, _prepares, _renders) = fetch();
    let tree = TestTree::new(kind);

    let waiter = tree.root().render_root_deferred(&tree.handle());
    assert!(!waiter.is_settled());

    release(&gate, value(7i32));
    tree.pump_until_idle();

    let settled = waiter.peek().expect("waiter should be settled");
    let result = settled.expect("waiter should resolve");
    assert_eq!(result.downcast_ref::<i32>(), Some(&7));
}

#[test]
fn failed_prepare_renders_again_after_a_state_change() {
    let (kind, gate, prepares, renders) = fetch();
    let tree = TestTree::new(kind);

    let first = tree.render().expect("pending render");
    assert!(is_pending_value(&first));

    refuse(&gate, "offline");
    tree.pump_until_idle();

    assert_eq!(prepares.get(), 1);
    assert_eq!(renders.get(), 0);
    assert!(tree.root().result().is_none());
    match tree.render() {
        Err(RenderError::Failed(error)) => assert_eq!(error.to_string(), "offline"),
        _ => panic!("render should fail until state changes"),
    }

    tree.root().set_state("retry", value(1i32));
    tree.pump_until_idle();
    assert_eq!(prepares.get(), 2);

    release(&gate, value(9i32));
    tree.pump_until_idle();

    assert_eq!(renders.get(), 1);
    let result = tree.root().result().expect("settled result");
    assert_eq!(result.downcast_ref::<i32>(), Some(&9));
}
