use std::{
  pin::Pin,
  sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  },
  task::{Context, Poll},
};

use futures::{lock::Mutex, Stream};
use tracing::{debug, trace};

use super::{collectors::Collectors, SubjectApi};
use crate::{
  collector::BufferedResumableCollector, error::SubjectError, resumable::Resumable,
  terminal::TerminalCell,
};

/// Per-subscriber buffer size used by [`MulticastSubject::new`].
pub const DEFAULT_COLLECTOR_CAPACITY: usize = 32;

struct Inner<T, E> {
  collectors: Collectors<BufferedResumableCollector<T, E>>,
  terminal: TerminalCell<E>,
  /// Subscribers still missing before emission may start.
  remaining: AtomicUsize,
  gate: Resumable,
  emit_lock: Mutex<()>,
  capacity: usize,
}

impl<T, E> Inner<T, E> {
  fn gate_open(&self) -> bool { self.remaining.load(Ordering::Acquire) == 0 }

  /// Count one registration towards the rendezvous.
  fn arrive(&self) {
    let opened = self
      .remaining
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
      == Ok(1);
    if opened {
      debug!("multicast gate opened");
      self.gate.resume();
    }
  }
}

/// A subject that holds producers back until enough subscribers arrived.
///
/// `emit` suspends until `expected` subscribers have registered, then hands
/// every value to each subscriber's own bounded buffer, waiting for room when
/// a buffer is full. Subscribers that arrive later only see values emitted
/// after they registered. Once the gate opened it stays open, even if
/// subscribers leave again.
pub struct MulticastSubject<T, E> {
  inner: Arc<Inner<T, E>>,
}

impl<T, E> Clone for MulticastSubject<T, E> {
  fn clone(&self) -> Self { Self { inner: self.inner.clone() } }
}

impl<T, E> MulticastSubject<T, E> {
  /// Gate emission on `expected` subscribers (at least one).
  pub fn new(expected: usize) -> Self { Self::with_capacity(expected, DEFAULT_COLLECTOR_CAPACITY) }

  /// Like [`new`](Self::new), buffering up to `capacity` values per
  /// subscriber.
  pub fn with_capacity(expected: usize, capacity: usize) -> Self {
    Self {
      inner: Arc::new(Inner {
        collectors: Collectors::default(),
        terminal: TerminalCell::default(),
        remaining: AtomicUsize::new(expected.max(1)),
        gate: Resumable::new(),
        emit_lock: Mutex::new(()),
        capacity,
      }),
    }
  }

  pub fn is_terminated(&self) -> bool { self.inner.terminal.is_terminated() }
}

impl<T, E> SubjectApi<T, E> for MulticastSubject<T, E>
where
  T: Clone + Send + Sync + 'static,
  E: Clone + Send + Sync + 'static,
{
  type Subscription = MulticastSubscription<T, E>;

  async fn emit(&self, value: T) {
    let inner = &self.inner;
    let _guard = inner.emit_lock.lock().await;
    while !inner.gate_open() && !inner.terminal.is_terminated() {
      inner.gate.wait().await;
    }
    if inner.terminal.is_terminated() {
      return;
    }
    let set = inner.collectors.snapshot();
    for collector in set.iter() {
      if let Err(SubjectError::Cancelled) = collector.next(value.clone()).await {
        inner.collectors.remove(collector);
        debug!("dropped cancelled multicast collector");
      }
    }
  }

  async fn emit_error(&self, err: E) {
    let inner = &self.inner;
    if !inner.terminal.fail(err.clone()) {
      return;
    }
    let set = inner.collectors.terminate();
    debug!(subscribers = set.len(), "multicast subject failed");
    set.iter().for_each(|c| c.error(err.clone()));
    inner.gate.resume();
  }

  async fn complete(&self) {
    let inner = &self.inner;
    if !inner.terminal.complete() {
      return;
    }
    let set = inner.collectors.terminate();
    debug!(subscribers = set.len(), "multicast subject completed");
    set.iter().for_each(|c| c.complete());
    inner.gate.resume();
  }

  fn subscribe(&self) -> MulticastSubscription<T, E> {
    MulticastSubscription { inner: self.inner.clone(), collector: None, finished: false }
  }

  fn collector_count(&self) -> usize { self.inner.collectors.len() }

  fn poll_collectors(&self, n: usize, cx: &mut Context<'_>) -> Poll<()> {
    self.inner.collectors.poll_at_least(n, cx)
  }
}

/// Subscription stream of a [`MulticastSubject`].
pub struct MulticastSubscription<T, E> {
  inner: Arc<Inner<T, E>>,
  collector: Option<Arc<BufferedResumableCollector<T, E>>>,
  finished: bool,
}

impl<T, E: Clone> Stream for MulticastSubscription<T, E> {
  type Item = Result<T, E>;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    let this = self.get_mut();
    if this.finished {
      return Poll::Ready(None);
    }
    let collector = match &this.collector {
      Some(collector) => collector.clone(),
      None => {
        let collector = Arc::new(BufferedResumableCollector::new(this.inner.capacity));
        if !this.inner.collectors.add(&collector) {
          this.finished = true;
          return Poll::Ready(this.inner.terminal.final_item());
        }
        trace!("multicast subscriber registered");
        this.inner.arrive();
        this.collector = Some(collector.clone());
        collector
      }
    };
    let polled = collector.poll_recv(cx);
    if let Poll::Ready(None | Some(Err(_))) = polled {
      this.finished = true;
    }
    polled
  }
}

impl<T, E> Drop for MulticastSubscription<T, E> {
  fn drop(&mut self) {
    if let Some(collector) = self.collector.take() {
      if self.inner.collectors.remove(&collector) {
        trace!("multicast subscriber removed");
      }
      collector.cancel();
    }
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use futures::{StreamExt, TryStreamExt};

  use super::*;

  #[hotrx_macro::test(local)]
  async fn emit_waits_for_expected_subscribers() {
    let subject = MulticastSubject::<i32, ()>::new(2);
    let first = tokio::spawn(subject.subscribe().try_collect::<Vec<_>>());

    let emitting = tokio::spawn({
      let subject = subject.clone();
      async move {
        for i in 0..3 {
          subject.emit(i).await;
        }
        subject.complete().await;
      }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(subject.collector_count(), 1);
    assert!(!emitting.is_finished());

    let second = tokio::spawn(subject.subscribe().try_collect::<Vec<_>>());
    emitting.await.unwrap();
    assert_eq!(first.await.unwrap(), Ok(vec![0, 1, 2]));
    assert_eq!(second.await.unwrap(), Ok(vec![0, 1, 2]));
  }

  #[hotrx_macro::test(local)]
  async fn expected_size_is_at_least_one() {
    let subject = MulticastSubject::<i32, ()>::new(0);
    let sub = tokio::spawn(subject.subscribe().try_collect::<Vec<_>>());
    subject.await_collector().await;
    subject.emit(1).await;
    subject.complete().await;
    assert_eq!(sub.await.unwrap(), Ok(vec![1]));
  }

  #[hotrx_macro::test(local)]
  async fn terminal_releases_a_waiting_producer() {
    let subject = MulticastSubject::<i32, &str>::new(3);
    let emitting = tokio::spawn({
      let subject = subject.clone();
      async move { subject.emit(1).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!emitting.is_finished());

    subject.emit_error("boom").await;
    emitting.await.unwrap();

    let mut late = subject.subscribe();
    assert_eq!(late.next().await, Some(Err("boom")));
    assert_eq!(late.next().await, None);
  }

  #[hotrx_macro::test(local)]
  async fn completed_subject_ends_new_subscribers_immediately() {
    let subject = MulticastSubject::<i32, &str>::new(1);
    subject.complete().await;
    subject.emit_error("ignored").await;
    assert_eq!(subject.subscribe().next().await, None);
  }

  #[hotrx_macro::test(shared)]
  async fn dropped_subscriber_does_not_block_emission() {
    let subject = MulticastSubject::<usize, ()>::with_capacity(2, 2);
    let keeper = tokio::spawn(subject.subscribe().try_collect::<Vec<_>>());
    let mut quitter = subject.subscribe();
    let quit = tokio::spawn(async move {
      let first = quitter.next().await;
      drop(quitter);
      first
    });
    subject.await_collectors(2).await;

    for i in 0..50 {
      subject.emit(i).await;
    }
    subject.complete().await;

    assert_eq!(quit.await.unwrap(), Some(Ok(0)));
    assert_eq!(keeper.await.unwrap(), Ok((0..50).collect::<Vec<_>>()));
    assert_eq!(subject.collector_count(), 0);
  }
}
