//! Single-waiter suspension primitive.
//!
//! Every delivery loop in this crate parks on a [`Resumable`]: a one-slot
//! handoff where [`Resumable::resume`] either wakes the task currently parked
//! in [`Resumable::wait`] or arms the next `wait` so it returns immediately.
//! Repeated `resume` calls without an intervening `wait` collapse into one
//! pending wake.
//!
//! [`WakerSet`] covers the few places where any number of tasks wait for the
//! same condition, such as producers waiting for subscribers to show up.

use std::{
  future::Future,
  pin::Pin,
  sync::atomic::{AtomicBool, Ordering},
  task::{Context, Poll, Waker},
};

use futures::task::AtomicWaker;
use parking_lot::Mutex;

/// A resumable handoff with at most one waiter and at most one pending wake.
///
/// `resume` may be called from any thread. Only one task may wait at a time;
/// a second concurrent waiter replaces the first one's registration.
/// Cancelling a wait is dropping the [`Resumed`] future.
#[derive(Debug, Default)]
pub struct Resumable {
  armed: AtomicBool,
  waker: AtomicWaker,
}

impl Resumable {
  pub fn new() -> Self { Self::default() }

  /// Wake the parked waiter, or arm the next [`wait`](Self::wait).
  pub fn resume(&self) {
    self.armed.store(true, Ordering::Release);
    self.waker.wake();
  }

  /// Suspend until [`resume`](Self::resume) has been called since the last
  /// wait returned.
  pub fn wait(&self) -> Resumed<'_> { Resumed { resumable: self } }

  /// Poll-style variant of [`wait`](Self::wait) for hand-written
  /// `Stream`/`Future` implementations.
  ///
  /// Consumes the pending wake when it returns `Ready`.
  pub fn poll_wait(&self, cx: &mut Context<'_>) -> Poll<()> {
    if self.armed.swap(false, Ordering::AcqRel) {
      return Poll::Ready(());
    }
    self.waker.register(cx.waker());
    // A resume may have landed between the first check and the registration.
    if self.armed.swap(false, Ordering::AcqRel) {
      Poll::Ready(())
    } else {
      Poll::Pending
    }
  }
}

/// Future returned by [`Resumable::wait`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct Resumed<'a> {
  resumable: &'a Resumable,
}

impl Future for Resumed<'_> {
  type Output = ();

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> { self.resumable.poll_wait(cx) }
}

/// Wakers of every task waiting for a shared condition.
///
/// Waiters re-check their condition after registering, so a
/// [`wake_all`](Self::wake_all) racing a registration is never lost.
#[derive(Debug, Default)]
pub(crate) struct WakerSet {
  wakers: Mutex<Vec<Waker>>,
}

impl WakerSet {
  fn register(&self, waker: &Waker) {
    let mut wakers = self.wakers.lock();
    // A task polled again before the next wake keeps a single entry.
    match wakers.iter_mut().find(|w| w.will_wake(waker)) {
      Some(existing) => existing.clone_from(waker),
      None => wakers.push(waker.clone()),
    }
  }

  /// Wake and forget every registered waiter.
  pub(crate) fn wake_all(&self) {
    let wakers = std::mem::take(&mut *self.wakers.lock());
    wakers.into_iter().for_each(Waker::wake);
  }

  /// `Ready` once `ready()` holds, otherwise park `cx` until the next
  /// [`wake_all`](Self::wake_all).
  pub(crate) fn poll_until(&self, cx: &mut Context<'_>, ready: impl Fn() -> bool) -> Poll<()> {
    if ready() {
      return Poll::Ready(());
    }
    self.register(cx.waker());
    if ready() {
      Poll::Ready(())
    } else {
      Poll::Pending
    }
  }

  #[cfg(test)]
  fn len(&self) -> usize { self.wakers.lock().len() }
}
