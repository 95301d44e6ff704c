//! FIFO parking of cooperative coroutines.
//!
//! A suspension point is an await on [`WaitQueue::suspend`]. Wakeups are
//! hints, not guarantees: a resumed coroutine must re-check the predicate it
//! slept on, because a competing coroutine may have consumed the condition
//! first.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

struct Waiter {
    woken: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

/// A queue of suspended coroutines waiting to be woken up.
pub(crate) struct WaitQueue {
    waiters: RefCell<VecDeque<Rc<Waiter>>>,
}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        WaitQueue {
            waiters: RefCell::new(VecDeque::new()),
        }
    }

    /// Suspend the current coroutine until it is woken up.
    pub(crate) fn suspend(&self) -> Suspend<'_> {
        Suspend {
            queue: self,
            waiter: None,
        }
    }

    /// Wake the first coroutine parked on the queue, if any.
    pub(crate) fn wake_first(&self) {
        let head = self.waiters.borrow_mut().pop_front();
        if let Some(waiter) = head {
            waiter.woken.set(true);
            if let Some(waker) = waiter.waker.borrow_mut().take() {
                waker.wake();
            }
        }
    }

    /// Wake every parked coroutine, e.g. when the condition they wait for
    /// can never come true again.
    pub(crate) fn wake_all(&self) {
        let drained: Vec<_> = self.waiters.borrow_mut().drain(..).collect();
        for waiter in drained {
            waiter.woken.set(true);
            if let Some(waker) = waiter.waker.borrow_mut().take() {
                waker.wake();
            }
        }
    }

    fn forget(&self, target: &Rc<Waiter>) {
        let mut waiters = self.waiters.borrow_mut();
        if let Some(pos) = waiters.iter().position(|w| Rc::ptr_eq(w, target)) {
            waiters.remove(pos);
        }
    }
}

/// Future returned by [`WaitQueue::suspend`]. Parks itself on first poll,
/// completes once popped by `wake_first`/`wake_all`.
pub(crate) struct Suspend<'a> {
    queue: &'a WaitQueue,
    waiter: Option<Rc<Waiter>>,
}

impl Future for Suspend<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let Some(waiter) = self.waiter.clone() else {
            let waiter = Rc::new(Waiter {
                woken: Cell::new(false),
                waker: RefCell::new(Some(cx.waker().clone())),
            });
            self.queue.waiters.borrow_mut().push_back(Rc::clone(&waiter));
            self.waiter = Some(waiter);
            return Poll::Pending;
        };
        if waiter.woken.get() {
            self.waiter = None;
            Poll::Ready(())
        } else {
            *waiter.waker.borrow_mut() = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl Drop for Suspend<'_> {
    fn drop(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            if waiter.woken.get() {
                // Cancelled after the wakeup already consumed our queue
                // slot; relay it so the credit is not lost.
                self.queue.wake_first();
            } else {
                self.queue.forget(&waiter);
            }
        }
    }
}
