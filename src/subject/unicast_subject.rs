use std::{
  pin::Pin,
  sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
  },
  task::{ready, Context, Poll},
};

use crossbeam::queue::SegQueue;
use futures::Stream;
use tracing::{debug, trace};

use super::SubjectApi;
use crate::{
  error::SubjectError,
  resumable::{Resumable, WakerSet},
  terminal::TerminalCell,
};

const VACANT: u8 = 0;
const ACTIVE: u8 = 1;
const CONSUMED: u8 = 2;

/// What happens when the single subscriber leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Reuse {
  /// The subject is used up; buffered and future values are discarded.
  Once,
  /// The slot opens again and the buffer is kept for the next subscriber.
  Sequential,
}

/// Shared state of the unicast subjects.
pub(super) struct UnicastCore<T, E> {
  queue: SegQueue<T>,
  terminal: TerminalCell<E>,
  resumable: Resumable,
  state: AtomicU8,
  arrivals: WakerSet,
  reuse: Reuse,
}

impl<T, E> UnicastCore<T, E> {
  pub(super) fn new(reuse: Reuse) -> Self {
    Self {
      queue: SegQueue::new(),
      terminal: TerminalCell::default(),
      resumable: Resumable::new(),
      state: AtomicU8::new(VACANT),
      arrivals: WakerSet::default(),
      reuse,
    }
  }

  fn discard(&self) { while self.queue.pop().is_some() {} }

  pub(super) fn emit(&self, value: T) {
    if self.reuse == Reuse::Once {
      if self.terminal.is_terminated() || self.state.load(Ordering::Acquire) == CONSUMED {
        return;
      }
      self.queue.push(value);
      // The subscriber may have left while we pushed.
      if self.state.load(Ordering::Acquire) == CONSUMED {
        self.discard();
        return;
      }
    } else {
      self.queue.push(value);
    }
    self.resumable.resume();
  }

  pub(super) fn emit_error(&self, err: E) {
    if self.terminal.fail(err) {
      debug!(reuse = ?self.reuse, "unicast subject failed");
      self.resumable.resume();
    }
  }

  pub(super) fn complete(&self) {
    if self.terminal.complete() {
      debug!(reuse = ?self.reuse, "unicast subject completed");
      self.resumable.resume();
    }
  }

  pub(super) fn is_terminated(&self) -> bool { self.terminal.is_terminated() }

  pub(super) fn collector_count(&self) -> usize {
    usize::from(self.state.load(Ordering::Acquire) == ACTIVE)
  }

  pub(super) fn poll_collectors(&self, n: usize, cx: &mut Context<'_>) -> Poll<()> {
    self.arrivals.poll_until(cx, || self.collector_count() >= n)
  }

  pub(super) fn buffered(&self) -> usize { self.queue.len() }

  fn claim(&self) -> Result<(), SubjectError> {
    match self
      .state
      .compare_exchange(VACANT, ACTIVE, Ordering::AcqRel, Ordering::Acquire)
    {
      Ok(_) => {
        trace!("unicast subscriber attached");
        self.arrivals.wake_all();
        Ok(())
      }
      Err(ACTIVE) => Err(SubjectError::AlreadySubscribed),
      Err(_) => Err(SubjectError::Consumed),
    }
  }

  fn leave(&self) {
    match self.reuse {
      Reuse::Once => {
        self.state.store(CONSUMED, Ordering::Release);
        self.discard();
      }
      Reuse::Sequential => self.state.store(VACANT, Ordering::Release),
    }
    trace!(reuse = ?self.reuse, "unicast subscriber detached");
  }
}

pub(super) fn try_subscribe<T, E>(
  core: &Arc<UnicastCore<T, E>>,
) -> Result<UnicastSubscription<T, E>, SubjectError> {
  core.claim()?;
  Ok(UnicastSubscription { core: core.clone(), finished: false })
}

pub(super) fn subscribe_or_panic<T, E>(core: &Arc<UnicastCore<T, E>>) -> UnicastSubscription<T, E> {
  match try_subscribe(core) {
    Ok(subscription) => subscription,
    Err(err) => panic!("{err}"),
  }
}

/// A subject that buffers values for exactly one subscriber.
///
/// Values emitted before anyone subscribed are kept until the subscriber
/// arrives. Once that subscriber leaves (it saw the terminal signal, or its
/// stream was dropped), the subject is used up: further values are discarded
/// and new subscriptions fail with [`SubjectError::Consumed`].
pub struct UnicastSubject<T, E> {
  core: Arc<UnicastCore<T, E>>,
}

impl<T, E> Clone for UnicastSubject<T, E> {
  fn clone(&self) -> Self { Self { core: self.core.clone() } }
}

impl<T, E> Default for UnicastSubject<T, E> {
  fn default() -> Self { Self::new() }
}

impl<T, E> UnicastSubject<T, E> {
  pub fn new() -> Self { Self { core: Arc::new(UnicastCore::new(Reuse::Once)) } }

  /// Subscribe, or report why the subject can not take a subscriber.
  ///
  /// # Errors
  ///
  /// [`SubjectError::AlreadySubscribed`] while another subscription is
  /// active, [`SubjectError::Consumed`] after it left.
  pub fn try_subscribe(&self) -> Result<UnicastSubscription<T, E>, SubjectError> {
    try_subscribe(&self.core)
  }

  /// Values waiting for the subscriber.
  pub fn buffered(&self) -> usize { self.core.buffered() }

  pub fn is_terminated(&self) -> bool { self.core.is_terminated() }
}

impl<T, E> SubjectApi<T, E> for UnicastSubject<T, E>
where
  T: Send + 'static,
  E: Clone + Send + Sync + 'static,
{
  type Subscription = UnicastSubscription<T, E>;

  async fn emit(&self, value: T) { self.core.emit(value) }

  async fn emit_error(&self, err: E) { self.core.emit_error(err) }

  async fn complete(&self) { self.core.complete() }

  /// # Panics
  ///
  /// When the subject already has, or had, a subscriber; use
  /// [`try_subscribe`](UnicastSubject::try_subscribe) to handle that.
  fn subscribe(&self) -> UnicastSubscription<T, E> { subscribe_or_panic(&self.core) }

  fn collector_count(&self) -> usize { self.core.collector_count() }

  fn poll_collectors(&self, n: usize, cx: &mut Context<'_>) -> Poll<()> {
    self.core.poll_collectors(n, cx)
  }
}

/// Subscription stream of a unicast subject.
pub struct UnicastSubscription<T, E> {
  core: Arc<UnicastCore<T, E>>,
  finished: bool,
}

impl<T, E: Clone> Stream for UnicastSubscription<T, E> {
  type Item = Result<T, E>;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    let this = self.get_mut();
    if this.finished {
      return Poll::Ready(None);
    }
    let core = &this.core;
    loop {
      let done = core.terminal.is_terminated();
      if let Some(value) = core.queue.pop() {
        return Poll::Ready(Some(Ok(value)));
      }
      if done {
        this.finished = true;
        core.leave();
        return Poll::Ready(core.terminal.final_item());
      }
      ready!(core.resumable.poll_wait(cx));
    }
  }
}

impl<T, E> Drop for UnicastSubscription<T, E> {
  fn drop(&mut self) {
    if !self.finished {
      self.core.leave();
    }
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use futures::{StreamExt, TryStreamExt};

  use super::*;

  #[hotrx_macro::test(local)]
  async fn values_wait_for_the_subscriber() {
    let subject = UnicastSubject::<i32, ()>::new();
    for i in 1..=3 {
      subject.emit(i).await;
    }
    subject.complete().await;
    subject.emit(4).await;
    assert_eq!(subject.buffered(), 3);

    assert_eq!(subject.subscribe().try_collect::<Vec<_>>().await, Ok(vec![1, 2, 3]));
  }

  #[hotrx_macro::test(shared)]
  async fn live_values_then_error_once() {
    let subject = UnicastSubject::<usize, &str>::new();
    let sub = tokio::spawn(subject.subscribe().collect::<Vec<_>>());
    subject.await_collector().await;
    for i in 0..100 {
      subject.emit(i).await;
    }
    subject.emit_error("boom").await;
    subject.emit_error("again").await;

    let mut expected = (0..100).map(Ok).collect::<Vec<_>>();
    expected.push(Err("boom"));
    assert_eq!(sub.await.unwrap(), expected);
  }

  #[test]
  fn second_concurrent_subscriber_is_rejected() {
    let subject = UnicastSubject::<i32, ()>::new();
    let first = subject.try_subscribe().unwrap();
    assert_eq!(subject.collector_count(), 1);
    assert_eq!(subject.try_subscribe().err(), Some(SubjectError::AlreadySubscribed));
    drop(first);
    assert_eq!(subject.try_subscribe().err(), Some(SubjectError::Consumed));
    assert_eq!(subject.collector_count(), 0);
  }

  #[test]
  #[should_panic(expected = "already has an active subscriber")]
  fn subscribe_panics_on_a_second_subscriber() {
    let subject = UnicastSubject::<i32, ()>::new();
    let _first = subject.subscribe();
    let _second = subject.subscribe();
  }

  #[hotrx_macro::test(local)]
  async fn leaving_discards_the_buffer() {
    let subject = UnicastSubject::<i32, ()>::new();
    subject.emit(1).await;
    subject.emit(2).await;
    let mut sub = subject.subscribe();
    assert_eq!(sub.next().await, Some(Ok(1)));
    drop(sub);

    assert_eq!(subject.buffered(), 0);
    subject.emit(3).await;
    assert_eq!(subject.buffered(), 0);
  }

  #[hotrx_macro::test(local)]
  async fn await_collector_wakes_when_the_slot_is_claimed() {
    let subject = UnicastSubject::<i32, ()>::new();
    let waiting = tokio::spawn({
      let subject = subject.clone();
      async move { subject.await_collector().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!waiting.is_finished());

    let _sub = subject.subscribe();
    waiting.await.unwrap();
  }

  #[hotrx_macro::test(local)]
  async fn subscriber_parks_until_a_value_arrives() {
    let subject = UnicastSubject::<i32, ()>::new();
    let mut sub = subject.subscribe();
    let next = tokio::spawn(async move { sub.next().await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!next.is_finished());

    subject.emit(5).await;
    assert_eq!(next.await.unwrap(), Some(Ok(5)));
  }
}
