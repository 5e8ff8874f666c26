//! Bounded multi-producer/single-consumer handoff with backpressure.

use std::{
  sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering},
  task::{ready, Context, Poll},
};

use futures::{future::poll_fn, lock::Mutex, Sink, SinkExt};

use crate::{
  error::{CollectError, SubjectError},
  queue::SpscArrayQueue,
  resumable::Resumable,
  terminal::TerminalCell,
};

/// A bounded buffer between producers and one consumer.
///
/// Producers call [`next`](Self::next), which suspends while the buffer is
/// full; the consumer drains with [`drain`](Self::drain) (or `poll_recv` from a
/// hand-written stream). Producers are serialised internally so the
/// underlying [`SpscArrayQueue`] only ever sees one of them.
///
/// The consumer hands room back in batches: every `limit` deliveries (three
/// quarters of the capacity) it resumes a parked producer once, instead of
/// once per value.
pub struct BufferedResumableCollector<T, E> {
  queue: SpscArrayQueue<T>,
  terminal: TerminalCell<E>,
  cancelled: AtomicBool,
  /// Values offered but not yet taken by the consumer. May dip below zero
  /// briefly when the consumer takes a value before the producer counts it.
  available: AtomicIsize,
  /// Deliveries since the last batch release. Consumer side only.
  consumed: AtomicUsize,
  limit: usize,
  producer: Resumable,
  value_ready: Resumable,
  producers: Mutex<()>,
}

impl<T, E> BufferedResumableCollector<T, E> {
  /// Create a collector buffering at least `capacity` values; the capacity
  /// is rounded up to a power of two.
  pub fn new(capacity: usize) -> Self {
    let queue = SpscArrayQueue::new(capacity);
    let capacity = queue.capacity();
    Self {
      queue,
      terminal: TerminalCell::default(),
      cancelled: AtomicBool::new(false),
      available: AtomicIsize::new(0),
      consumed: AtomicUsize::new(0),
      limit: (capacity - (capacity >> 2)).max(1),
      producer: Resumable::new(),
      value_ready: Resumable::new(),
      producers: Mutex::new(()),
    }
  }

  /// Maximum number of values that can sit unconsumed.
  pub fn capacity(&self) -> usize { self.queue.capacity() }

  /// Values currently waiting for the consumer.
  pub fn buffered(&self) -> usize { self.available.load(Ordering::Acquire).max(0) as usize }

  pub fn is_cancelled(&self) -> bool { self.cancelled.load(Ordering::Acquire) }

  pub fn is_terminated(&self) -> bool { self.terminal.is_terminated() }

  /// Hand `value` to the consumer, suspending while the buffer is full.
  ///
  /// # Errors
  ///
  /// [`SubjectError::Cancelled`] when the consumer went away; the value is
  /// dropped.
  pub async fn next(&self, value: T) -> Result<(), SubjectError> {
    let _serial = self.producers.lock().await;
    let mut value = value;
    loop {
      if self.is_cancelled() {
        return Err(SubjectError::Cancelled);
      }
      match self.queue.offer(value) {
        Ok(()) => {
          if self.available.fetch_add(1, Ordering::AcqRel) == 0 {
            self.value_ready.resume();
          }
          return Ok(());
        }
        Err(back) => {
          value = back;
          self.producer.wait().await;
        }
      }
    }
  }

  /// Terminate with an error. Values already buffered are still delivered
  /// first.
  pub fn error(&self, err: E) {
    self.terminal.fail(err);
    self.value_ready.resume();
  }

  /// Terminate normally. Values already buffered are still delivered first.
  pub fn complete(&self) {
    self.terminal.complete();
    self.value_ready.resume();
  }

  /// Mark the consumer as gone and release any producer parked in
  /// [`next`](Self::next).
  pub fn cancel(&self) {
    self.cancelled.store(true, Ordering::Release);
    self.producer.resume();
  }

  fn release_one(&self) {
    let consumed = self.consumed.load(Ordering::Relaxed) + 1;
    if consumed == self.limit {
      self.consumed.store(0, Ordering::Relaxed);
      self.producer.resume();
    } else {
      self.consumed.store(consumed, Ordering::Relaxed);
    }
  }
}

impl<T, E: Clone> BufferedResumableCollector<T, E> {
  /// Consumer-side poll: the next value, then the terminal error (if any),
  /// then `None`.
  pub(crate) fn poll_recv(&self, cx: &mut Context<'_>) -> Poll<Option<Result<T, E>>> {
    loop {
      let done = self.terminal.is_terminated();
      if let Some(value) = self.queue.poll() {
        self.available.fetch_sub(1, Ordering::AcqRel);
        self.release_one();
        return Poll::Ready(Some(Ok(value)));
      }
      if done {
        return Poll::Ready(self.terminal.final_item());
      }
      ready!(self.value_ready.poll_wait(cx));
    }
  }

  /// Deliver every buffered and future value to `sink` until the collector
  /// terminates. Must only run on one consumer at a time.
  ///
  /// # Errors
  ///
  /// [`CollectError::Upstream`] with the terminal error, or
  /// [`CollectError::Sink`] when `sink` rejects a value. In the latter case
  /// the collector is cancelled and `on_crash` runs before returning.
  pub async fn drain<S, F>(&self, mut sink: S, on_crash: F) -> Result<(), CollectError<E, S::Error>>
  where
    S: Sink<T> + Unpin,
    F: FnOnce(&Self),
  {
    loop {
      match poll_fn(|cx| self.poll_recv(cx)).await {
        Some(Ok(value)) => {
          if let Err(err) = sink.send(value).await {
            self.cancel();
            on_crash(self);
            return Err(CollectError::Sink(err));
          }
        }
        Some(Err(err)) => return Err(CollectError::Upstream(err)),
        None => return Ok(()),
      }
    }
  }
}

impl<T, E> std::fmt::Debug for BufferedResumableCollector<T, E> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("BufferedResumableCollector")
      .field("capacity", &self.capacity())
      .field("buffered", &self.buffered())
      .field("cancelled", &self.is_cancelled())
      .field("terminated", &self.is_terminated())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use std::{
    convert::Infallible,
    sync::{
      atomic::{AtomicUsize, Ordering},
      Arc,
    },
    time::Duration,
  };

  use futures::{channel::mpsc, executor::block_on, sink, StreamExt};

  use super::*;

  #[test]
  fn limit_is_three_quarters_of_capacity() {
    assert_eq!(BufferedResumableCollector::<u8, ()>::new(1).limit, 1);
    assert_eq!(BufferedResumableCollector::<u8, ()>::new(4).limit, 3);
    assert_eq!(BufferedResumableCollector::<u8, ()>::new(100).limit, 96);
  }

  #[test]
  fn buffered_values_drain_before_completion() {
    let c = BufferedResumableCollector::<i32, Infallible>::new(8);
    block_on(async {
      for i in 0..5 {
        c.next(i).await.unwrap();
      }
    });
    c.complete();

    let (tx, rx) = mpsc::unbounded();
    block_on(c.drain(tx, |_| unreachable!())).unwrap();
    assert_eq!(block_on(rx.collect::<Vec<_>>()), vec![0, 1, 2, 3, 4]);
  }

  #[test]
  fn error_surfaces_after_buffered_values() {
    let c = BufferedResumableCollector::<i32, &str>::new(4);
    block_on(c.next(1)).unwrap();
    c.error("boom");
    c.complete();

    let (tx, rx) = mpsc::unbounded();
    let res = block_on(c.drain(tx, |_| {}));
    assert_eq!(res, Err(CollectError::Upstream("boom")));
    assert_eq!(block_on(rx.collect::<Vec<_>>()), vec![1]);
  }

  #[hotrx_macro::test(shared)]
  async fn producer_suspends_at_capacity() {
    let c = Arc::new(BufferedResumableCollector::<usize, Infallible>::new(4));
    let offered = Arc::new(AtomicUsize::new(0));

    let producer = tokio::spawn({
      let c = c.clone();
      let offered = offered.clone();
      async move {
        for i in 0..20 {
          c.next(i).await.unwrap();
          offered.fetch_add(1, Ordering::SeqCst);
          assert!(c.buffered() <= c.capacity());
        }
        c.complete();
      }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(offered.load(Ordering::SeqCst), 4);
    assert_eq!(c.buffered(), 4);

    let seen = Arc::new(AtomicUsize::new(0));
    let c_seen = seen.clone();
    let sink = sink::unfold(0usize, move |expected, v: usize| {
      let seen = c_seen.clone();
      async move {
        assert_eq!(v, expected);
        seen.fetch_add(1, Ordering::SeqCst);
        Ok::<_, Infallible>(expected + 1)
      }
    });
    c.drain(Box::pin(sink), |_| {}).await.unwrap();

    producer.await.unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 20);
  }

  #[hotrx_macro::test(shared)]
  async fn sink_failure_cancels_blocked_producer() {
    let c = Arc::new(BufferedResumableCollector::<usize, Infallible>::new(2));
    let producer = tokio::spawn({
      let c = c.clone();
      async move {
        let mut i = 0;
        loop {
          if let Err(err) = c.next(i).await {
            return (i, err);
          }
          i += 1;
        }
      }
    });

    let crashed = Arc::new(AtomicUsize::new(0));
    let c_crashed = crashed.clone();
    let sink = sink::unfold((), |(), v: usize| async move {
      if v == 3 {
        Err("sink closed")
      } else {
        Ok(())
      }
    });
    let res = c
      .drain(Box::pin(sink), move |_| {
        c_crashed.fetch_add(1, Ordering::SeqCst);
      })
      .await;

    assert_eq!(res, Err(CollectError::Sink("sink closed")));
    assert_eq!(crashed.load(Ordering::SeqCst), 1);
    let (_, err) = producer.await.unwrap();
    assert_eq!(err, SubjectError::Cancelled);
    assert!(c.is_cancelled());
  }
}
