use std::{
  pin::Pin,
  sync::Arc,
  task::{Context, Poll},
  time::Duration,
};

use futures::Stream;
use tracing::{debug, trace};

use super::{
  collectors::Collectors,
  replay_buffer::{BoundedBuffer, Cursor, ReplayBuffer, UnboundedBuffer},
  SubjectApi,
};
use crate::{
  clock::{Clock, SystemClock},
  resumable::Resumable,
};

/// How much history a [`ReplaySubject`] keeps.
///
/// Sizes below one are treated as one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplayPolicy {
  /// Keep every value.
  #[default]
  Unbounded,
  /// Keep the last `n` values.
  Size(usize),
  /// Keep values younger than the given age.
  Time(Duration),
  /// Keep at most `n` values, none older than the given age.
  SizeAndTime(usize, Duration),
}

struct Inner<T, E> {
  buffer: Box<dyn ReplayBuffer<T, E>>,
  collectors: Collectors<Resumable>,
}

/// A subject that replays its retained history to every subscriber, then
/// continues live.
///
/// Subscribers arriving after termination still get the retained history,
/// followed by the terminal error (if any).
pub struct ReplaySubject<T, E> {
  inner: Arc<Inner<T, E>>,
}

impl<T, E> Clone for ReplaySubject<T, E> {
  fn clone(&self) -> Self { Self { inner: self.inner.clone() } }
}

impl<T, E> ReplaySubject<T, E>
where
  T: Clone + Send + Sync + 'static,
  E: Send + Sync + 'static,
{
  /// Age-bounded policies measure time with a [`SystemClock`].
  pub fn new(policy: ReplayPolicy) -> Self { Self::with_clock(policy, SystemClock::new()) }

  /// Like [`new`](Self::new), timestamping values with `clock`.
  pub fn with_clock(policy: ReplayPolicy, clock: impl Clock) -> Self {
    let clock: Arc<dyn Clock> = Arc::new(clock);
    let buffer: Box<dyn ReplayBuffer<T, E>> = match policy {
      ReplayPolicy::Unbounded => Box::new(UnboundedBuffer::new()),
      ReplayPolicy::Size(n) => Box::new(BoundedBuffer::new(n)),
      ReplayPolicy::Time(age) => Box::new(BoundedBuffer::with_max_age(usize::MAX, age, clock)),
      ReplayPolicy::SizeAndTime(n, age) => Box::new(BoundedBuffer::with_max_age(n, age, clock)),
    };
    Self { inner: Arc::new(Inner { buffer, collectors: Collectors::default() }) }
  }
}

impl<T, E> ReplaySubject<T, E> {
  /// Number of values currently retained for replay.
  pub fn retained(&self) -> usize { self.inner.buffer.len() }

  pub fn is_terminated(&self) -> bool { self.inner.buffer.terminal().is_terminated() }

  fn wake_all(&self, terminal: bool) {
    let collectors = &self.inner.collectors;
    let set = if terminal { collectors.terminate() } else { collectors.snapshot() };
    if terminal {
      debug!(subscribers = set.len(), "replay subject terminated");
    }
    set.iter().for_each(|r| r.resume());
  }
}

impl<T, E> SubjectApi<T, E> for ReplaySubject<T, E>
where
  T: Clone + Send + Sync + 'static,
  E: Clone + Send + Sync + 'static,
{
  type Subscription = ReplaySubscription<T, E>;

  async fn emit(&self, value: T) {
    if self.is_terminated() {
      return;
    }
    self.inner.buffer.emit(value);
    self.wake_all(false);
  }

  async fn emit_error(&self, err: E) {
    if self.inner.buffer.error(err) {
      self.wake_all(true);
    }
  }

  async fn complete(&self) {
    if self.inner.buffer.complete() {
      self.wake_all(true);
    }
  }

  fn subscribe(&self) -> ReplaySubscription<T, E> {
    ReplaySubscription {
      inner: self.inner.clone(),
      handle: None,
      cursor: Cursor::Unstarted,
      finished: false,
    }
  }

  fn collector_count(&self) -> usize { self.inner.collectors.len() }

  fn poll_collectors(&self, n: usize, cx: &mut Context<'_>) -> Poll<()> {
    self.inner.collectors.poll_at_least(n, cx)
  }
}

/// Subscription stream of a [`ReplaySubject`].
pub struct ReplaySubscription<T, E> {
  inner: Arc<Inner<T, E>>,
  handle: Option<Arc<Resumable>>,
  cursor: Cursor<T>,
  finished: bool,
}

impl<T, E> ReplaySubscription<T, E> {
  fn leave(&mut self) {
    if let Some(handle) = self.handle.take() {
      if self.inner.collectors.remove(&handle) {
        trace!("replay subscriber removed");
      }
    }
  }
}

impl<T, E: Clone> Stream for ReplaySubscription<T, E> {
  type Item = Result<T, E>;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    let this = self.get_mut();
    if this.finished {
      return Poll::Ready(None);
    }
    let handle = match &this.handle {
      Some(handle) => handle.clone(),
      None => {
        let handle = Arc::new(Resumable::new());
        // A terminated subject refuses the handle but still replays.
        if this.inner.collectors.add(&handle) {
          trace!("replay subscriber registered");
        }
        this.handle = Some(handle.clone());
        handle
      }
    };
    let polled = this
      .inner
      .buffer
      .poll_replay(&mut this.cursor, &handle, cx);
    if let Poll::Ready(None | Some(Err(_))) = polled {
      this.finished = true;
      this.leave();
    }
    polled
  }
}

impl<T, E> Drop for ReplaySubscription<T, E> {
  fn drop(&mut self) { self.leave(); }
}

#[cfg(test)]
mod tests {
  use futures::{StreamExt, TryStreamExt};

  use super::*;
  use crate::clock::ManualClock;

  #[hotrx_macro::test(local)]
  async fn late_subscriber_gets_the_last_max_size_values() {
    let subject = ReplaySubject::<i32, ()>::new(ReplayPolicy::Size(3));
    for i in 0..5 {
      subject.emit(i).await;
    }
    assert_eq!(subject.retained(), 3);

    let mut sub = subject.subscribe();
    for expected in [2, 3, 4] {
      assert_eq!(sub.next().await, Some(Ok(expected)));
    }
    assert_eq!(subject.collector_count(), 1);
    drop(sub);
    assert_eq!(subject.collector_count(), 0);
  }

  #[hotrx_macro::test(local)]
  async fn history_then_live_values() {
    let subject = ReplaySubject::<i32, &str>::new(ReplayPolicy::Unbounded);
    subject.emit(1).await;
    subject.emit(2).await;

    let early = tokio::spawn(subject.subscribe().collect::<Vec<_>>());
    subject.await_collector().await;
    subject.emit(3).await;
    subject.emit_error("boom").await;
    subject.emit(4).await;

    let expected = vec![Ok(1), Ok(2), Ok(3), Err("boom")];
    assert_eq!(early.await.unwrap(), expected);
    assert_eq!(subject.subscribe().collect::<Vec<_>>().await, expected);
  }

  #[hotrx_macro::test(local)]
  async fn size_below_one_keeps_one_value() {
    let subject = ReplaySubject::<i32, ()>::new(ReplayPolicy::Size(0));
    subject.emit(1).await;
    subject.emit(2).await;
    subject.complete().await;
    assert_eq!(subject.subscribe().try_collect::<Vec<_>>().await, Ok(vec![2]));
  }

  #[hotrx_macro::test(local)]
  async fn time_policy_forgets_expired_values() {
    let clock = ManualClock::new();
    let policy = ReplayPolicy::Time(Duration::from_millis(100));
    let subject = ReplaySubject::<i32, ()>::with_clock(policy, clock.clone());
    subject.emit(1).await;
    clock.advance(Duration::from_millis(60));
    subject.emit(2).await;
    clock.advance(Duration::from_millis(60));
    subject.complete().await;

    assert_eq!(subject.subscribe().try_collect::<Vec<_>>().await, Ok(vec![2]));
  }

  #[hotrx_macro::test(shared)]
  async fn concurrent_subscribers_see_the_same_order() {
    let subject = ReplaySubject::<usize, ()>::new(ReplayPolicy::Size(1000));
    let subscribers = (0..4)
      .map(|_| tokio::spawn(subject.subscribe().try_collect::<Vec<_>>()))
      .collect::<Vec<_>>();
    subject.await_collectors(4).await;

    for i in 0..500 {
      subject.emit(i).await;
    }
    subject.complete().await;

    for sub in subscribers {
      assert_eq!(sub.await.unwrap(), Ok((0..500).collect::<Vec<_>>()));
    }
  }
}
