//! Single-assignment result cells shared between producers and observers.

use crate::DynError;
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

enum DeferredState<T> {
    Pending,
    Resolved(T),
    Rejected(DynError),
}

struct DeferredInner<T> {
    state: DeferredState<T>,
    callbacks: Vec<Box<dyn FnOnce(Result<T, DynError>)>>,
    wakers: Vec<Waker>,
}

/// A clonable handle to a value that settles exactly once, either with a
/// result or with an error. Settling runs registered callbacks synchronously
/// and wakes any tasks awaiting the handle; later settles are ignored.
pub struct Deferred<T> {
    inner: Rc<RefCell<DeferredInner<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Clone + 'static> Deferred<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(DeferredInner {
                state: DeferredState::Pending,
                callbacks: Vec::new(),
                wakers: Vec::new(),
            })),
        }
    }

    pub fn resolved(value: T) -> Self {
        let deferred = Self::new();
        deferred.resolve(value);
        deferred
    }

    pub fn rejected(error: DynError) -> Self {
        let deferred = Self::new();
        deferred.reject(error);
        deferred
    }

    pub fn resolve(&self, value: T) {
        self.settle(Ok(value));
    }

    pub fn reject(&self, error: DynError) {
        self.settle(Err(error));
    }

    /// Non-blocking inspection of the settled outcome, if any.
    pub fn peek(&self) -> Option<Result<T, DynError>> {
        match &self.inner.borrow().state {
            DeferredState::Pending => None,
            DeferredState::Resolved(value) => Some(Ok(value.clone())),
            DeferredState::Rejected(error) => Some(Err(error.clone())),
        }
    }

    pub fn is_settled(&self) -> bool {
        !matches!(self.inner.borrow().state, DeferredState::Pending)
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.inner.borrow().state, DeferredState::Resolved(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self.inner.borrow().state, DeferredState::Rejected(_))
    }

    /// Runs `callback` with the outcome once settled. If the handle has
    /// already settled the callback runs immediately.
    pub fn on_settle(&self, callback: impl FnOnce(Result<T, DynError>) + 'static) {
        let mut callback = Some(callback);
        {
            let mut inner = self.inner.borrow_mut();
            if matches!(inner.state, DeferredState::Pending) {
                if let Some(callback) = callback.take() {
                    inner.callbacks.push(Box::new(callback));
                }
            }
        }
        if let Some(callback) = callback.take() {
            if let Some(outcome) = self.peek() {
                callback(outcome);
            }
        }
    }

    fn settle(&self, outcome: Result<T, DynError>) {
        let (callbacks, wakers) = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.state, DeferredState::Pending) {
                return;
            }
            inner.state = match &outcome {
                Ok(value) => DeferredState::Resolved(value.clone()),
                Err(error) => DeferredState::Rejected(error.clone()),
            };
            (
                std::mem::take(&mut inner.callbacks),
                std::mem::take(&mut inner.wakers),
            )
        };
        for callback in callbacks {
            callback(outcome.clone());
        }
        for waker in wakers {
            waker.wake();
        }
    }
}

impl<T: Clone + 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + 'static> Future for Deferred<T> {
    type Output = Result<T, DynError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.inner.borrow_mut();
        match &inner.state {
            DeferredState::Resolved(value) => Poll::Ready(Ok(value.clone())),
            DeferredState::Rejected(error) => Poll::Ready(Err(error.clone())),
            DeferredState::Pending => {
                let waker = cx.waker();
                if !inner.wakers.iter().any(|known| known.will_wake(waker)) {
                    inner.wakers.push(waker.clone());
                }
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/deferred_tests.rs"]
mod tests;
