use std::{
  mem,
  pin::Pin,
  sync::Arc,
  task::{ready, Context, Poll},
};

use arc_swap::ArcSwap;
use futures::{lock::Mutex, Stream};
use tracing::{debug, trace};

use super::{
  collectors::{CollectorSet, Collectors},
  node::{self, Node},
  SubjectApi,
};
use crate::{resumable::Resumable, terminal::TerminalCell};

enum Item<T> {
  /// Head of a subject created without an initial value.
  Empty,
  Value(T),
  /// End of the chain; carries the last value so `value()` survives
  /// termination.
  Done(Option<T>),
}

#[derive(Default)]
struct Handle {
  /// Parks the subscriber until a producer hands it the next node.
  resumable: Resumable,
  /// Signalled by the subscriber when it has caught up and can take more.
  consume_ready: Resumable,
}

struct Inner<T, E> {
  current: ArcSwap<Node<Item<T>>>,
  collectors: Collectors<Handle>,
  terminal: TerminalCell<E>,
  /// One producer at a time runs the ready/resume handshake.
  emit_lock: Mutex<()>,
}

impl<T, E> Inner<T, E> {
  async fn handshake(&self, set: &CollectorSet<Handle>) {
    for handle in set.iter() {
      handle.consume_ready.wait().await;
      handle.resumable.resume();
    }
  }

  fn leave(&self, handle: &Arc<Handle>) {
    if self.collectors.remove(handle) {
      trace!("behavior subscriber removed");
    }
    // A producer may be parked on this subscriber's readiness.
    handle.consume_ready.resume();
  }
}

/// A subject that remembers its latest value.
///
/// Every new subscriber first receives the current value (if any) and then
/// every value emitted after it registered. Emission is a two-step handshake
/// with each subscriber: the producer waits until the subscriber has caught
/// up, then wakes it. A subscriber that is registered but not being polled
/// therefore holds producers back; drop it to release them.
///
/// ```rust
/// use futures::TryStreamExt;
/// use hotrx::prelude::*;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let subject = BehaviorSubject::<i32, ()>::new(0);
/// let collected = tokio::spawn(subject.subscribe().try_collect::<Vec<_>>());
/// subject.await_collector().await;
///
/// for i in 1..=3 {
///   subject.emit(i).await;
/// }
/// subject.complete().await;
/// assert_eq!(collected.await.unwrap(), Ok(vec![0, 1, 2, 3]));
/// assert_eq!(subject.value(), Some(3));
/// # }
/// ```
pub struct BehaviorSubject<T, E> {
  inner: Arc<Inner<T, E>>,
}

impl<T, E> Clone for BehaviorSubject<T, E> {
  fn clone(&self) -> Self { Self { inner: self.inner.clone() } }
}

impl<T, E> BehaviorSubject<T, E> {
  /// Create a subject holding `initial` as its current value.
  pub fn new(initial: T) -> Self { Self::with_head(Item::Value(initial)) }

  /// Create a subject with no current value; subscribers only see values
  /// emitted after they registered.
  pub fn empty() -> Self { Self::with_head(Item::Empty) }

  fn with_head(head: Item<T>) -> Self {
    Self {
      inner: Arc::new(Inner {
        current: ArcSwap::new(Node::new(head)),
        collectors: Collectors::default(),
        terminal: TerminalCell::default(),
        emit_lock: Mutex::new(()),
      }),
    }
  }

  pub fn is_terminated(&self) -> bool { self.inner.terminal.is_terminated() }
}

impl<T: Clone, E> BehaviorSubject<T, E> {
  /// The latest value, kept after the subject terminated.
  pub fn value(&self) -> Option<T> {
    match &self.inner.current.load().value {
      Item::Value(v) => Some(v.clone()),
      Item::Done(last) => last.clone(),
      Item::Empty => None,
    }
  }

  async fn terminate(&self, failed: Option<E>) {
    let inner = &self.inner;
    let first = match failed {
      Some(err) => inner.terminal.fail(err),
      None => inner.terminal.complete(),
    };
    if !first {
      return;
    }
    let _guard = inner.emit_lock.lock().await;
    node::append(&inner.current, Node::new(Item::Done(self.value())));
    let set = inner.collectors.terminate();
    debug!(subscribers = set.len(), "behavior subject terminated");
    inner.handshake(&set).await;
  }
}

impl<T, E> SubjectApi<T, E> for BehaviorSubject<T, E>
where
  T: Clone + Send + Sync + 'static,
  E: Clone + Send + Sync + 'static,
{
  type Subscription = BehaviorSubscription<T, E>;

  async fn emit(&self, value: T) {
    let inner = &self.inner;
    // A terminal handshake may hold the lock behind a stalled subscriber.
    if inner.terminal.is_terminated() {
      return;
    }
    let _guard = inner.emit_lock.lock().await;
    if inner.terminal.is_terminated() {
      return;
    }
    node::append(&inner.current, Node::new(Item::Value(value)));
    inner
      .handshake(&inner.collectors.snapshot())
      .await;
  }

  async fn emit_error(&self, err: E) { self.terminate(Some(err)).await }

  async fn complete(&self) { self.terminate(None).await }

  fn subscribe(&self) -> BehaviorSubscription<T, E> {
    BehaviorSubscription { inner: self.inner.clone(), state: State::Idle }
  }

  fn collector_count(&self) -> usize { self.inner.collectors.len() }

  fn poll_collectors(&self, n: usize, cx: &mut Context<'_>) -> Poll<()> {
    self.inner.collectors.poll_at_least(n, cx)
  }
}

enum State<T> {
  /// Not registered yet; registration happens on the first poll.
  Idle,
  Active {
    handle: Arc<Handle>,
    cursor: Arc<Node<Item<T>>>,
    /// Readiness was signalled since the last wake.
    signalled: bool,
  },
  Finished,
}

/// Subscription stream of a [`BehaviorSubject`].
pub struct BehaviorSubscription<T, E> {
  inner: Arc<Inner<T, E>>,
  state: State<T>,
}

impl<T, E: Clone> BehaviorSubscription<T, E> {
  fn finish(&mut self) -> Poll<Option<Result<T, E>>> {
    if let State::Active { handle, .. } = mem::replace(&mut self.state, State::Finished) {
      self.inner.leave(&handle);
    }
    Poll::Ready(self.inner.terminal.final_item())
  }
}

impl<T: Clone, E: Clone> Stream for BehaviorSubscription<T, E> {
  type Item = Result<T, E>;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    let this = self.get_mut();
    loop {
      match &mut this.state {
        State::Idle => {
          let handle = Arc::new(Handle::default());
          if !this.inner.collectors.add(&handle) {
            this.state = State::Finished;
            return Poll::Ready(this.inner.terminal.final_item());
          }
          trace!("behavior subscriber registered");
          let cursor = this.inner.current.load_full();
          this.state = State::Active { handle, cursor: cursor.clone(), signalled: false };
          match &cursor.value {
            Item::Value(v) => return Poll::Ready(Some(Ok(v.clone()))),
            Item::Done(_) => return this.finish(),
            Item::Empty => {}
          }
        }
        State::Active { handle, cursor, signalled } => {
          if let Some(next) = cursor.next() {
            *cursor = next;
            match &cursor.value {
              Item::Value(v) => return Poll::Ready(Some(Ok(v.clone()))),
              Item::Empty => continue,
              Item::Done(_) => {}
            }
            return this.finish();
          }
          if !*signalled {
            handle.consume_ready.resume();
            *signalled = true;
          }
          ready!(handle.resumable.poll_wait(cx));
          *signalled = false;
        }
        State::Finished => return Poll::Ready(None),
      }
    }
  }
}

impl<T, E> Drop for BehaviorSubscription<T, E> {
  fn drop(&mut self) {
    if let State::Active { handle, .. } = &self.state {
      self.inner.leave(handle);
    }
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use futures::{StreamExt, TryStreamExt};

  use super::*;

  #[hotrx_macro::test(local)]
  async fn early_subscriber_sees_initial_then_every_value() {
    let subject = BehaviorSubject::<i32, &str>::new(0);
    let collected = tokio::spawn(subject.subscribe().try_collect::<Vec<_>>());
    subject.await_collector().await;

    for i in 1..=5 {
      subject.emit(i).await;
    }
    subject.complete().await;

    assert_eq!(collected.await.unwrap(), Ok(vec![0, 1, 2, 3, 4, 5]));
    assert_eq!(subject.collector_count(), 0);
  }

  #[hotrx_macro::test(local)]
  async fn late_subscriber_starts_from_latest_value() {
    let subject = BehaviorSubject::<i32, &str>::new(0);
    subject.emit(1).await;
    subject.emit(2).await;
    assert_eq!(subject.value(), Some(2));

    let mut sub = subject.subscribe();
    assert_eq!(sub.next().await, Some(Ok(2)));

    let completing = tokio::spawn({
      let subject = subject.clone();
      async move { subject.complete().await }
    });
    assert_eq!(sub.next().await, None);
    completing.await.unwrap();
    assert_eq!(subject.value(), Some(2));
  }

  #[hotrx_macro::test(local)]
  async fn empty_subject_has_no_value_to_replay() {
    let subject = BehaviorSubject::<i32, &str>::empty();
    assert_eq!(subject.value(), None);

    let collected = tokio::spawn(subject.subscribe().collect::<Vec<_>>());
    subject.await_collector().await;
    subject.emit(7).await;
    subject.emit_error("boom").await;

    assert_eq!(collected.await.unwrap(), vec![Ok(7), Err("boom")]);
  }

  #[hotrx_macro::test(local)]
  async fn subscribing_after_error_yields_it_once() {
    let subject = BehaviorSubject::<i32, &str>::new(1);
    subject.emit_error("boom").await;
    subject.emit(2).await;
    subject.complete().await;

    let mut sub = subject.subscribe();
    assert_eq!(sub.next().await, Some(Err("boom")));
    assert_eq!(sub.next().await, None);
    assert_eq!(sub.next().await, None);
    assert_eq!(subject.value(), Some(1));
    assert!(subject.is_terminated());
  }

  #[hotrx_macro::test(local)]
  async fn dropping_a_stalled_subscriber_releases_the_producer() {
    let subject = BehaviorSubject::<i32, ()>::new(0);
    let mut sub = subject.subscribe();
    assert_eq!(sub.next().await, Some(Ok(0)));
    assert!(subject.has_collectors());

    let emitting = tokio::spawn({
      let subject = subject.clone();
      async move { subject.emit(1).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!emitting.is_finished());

    drop(sub);
    emitting.await.unwrap();
    assert_eq!(subject.collector_count(), 0);
    assert_eq!(subject.value(), Some(1));
  }

  #[hotrx_macro::test(local)]
  async fn emit_after_terminal_does_not_wait_for_stalled_subscribers() {
    let subject = BehaviorSubject::<i32, ()>::new(0);
    let mut sub = subject.subscribe();
    assert_eq!(sub.next().await, Some(Ok(0)));

    let completing = tokio::spawn({
      let subject = subject.clone();
      async move { subject.complete().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!completing.is_finished());

    tokio::time::timeout(Duration::from_millis(100), subject.emit(1))
      .await
      .expect("emit after complete must return at once");
    assert_eq!(subject.value(), Some(0));

    drop(sub);
    completing.await.unwrap();
  }

  #[hotrx_macro::test(shared)]
  async fn every_subscriber_gets_every_value_exactly_once() {
    let subject = BehaviorSubject::<usize, ()>::new(0);
    let subscribers = (0..4)
      .map(|_| tokio::spawn(subject.subscribe().try_collect::<Vec<_>>()))
      .collect::<Vec<_>>();
    subject.await_collectors(4).await;

    for i in 1..=200 {
      subject.emit(i).await;
    }
    subject.complete().await;

    for sub in subscribers {
      assert_eq!(sub.await.unwrap(), Ok((0..=200).collect::<Vec<_>>()));
    }
  }
}
