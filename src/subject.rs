//! Hot broadcast subjects.
//!
//! A subject is a shared, thread-safe entry point that producers push into
//! with [`emit`](SubjectApi::emit), [`emit_error`](SubjectApi::emit_error) and
//! [`complete`](SubjectApi::complete), and that any number of consumers
//! observe through the [`Stream`] returned by
//! [`subscribe`](SubjectApi::subscribe).
//!
//! Every subscription stream yields `Ok(value)` for values, at most one
//! `Err(e)` when the subject fails, and then ends. Dropping the stream
//! unsubscribes.
//!
//! | Subject | Fan-out | History |
//! |---------|---------|---------|
//! | [`BehaviorSubject`] | all subscribers, producer waits for each | latest value |
//! | [`MulticastSubject`] | all subscribers, after a rendezvous | none |
//! | [`ReplaySubject`] | all subscribers | bounded or unbounded |
//! | [`UnicastSubject`] | one subscriber, once | everything not yet consumed |
//! | [`UnicastWorkSubject`] | one subscriber at a time | everything not yet consumed |
//!
//! ```rust
//! use futures::TryStreamExt;
//! use hotrx::prelude::*;
//!
//! # futures::executor::block_on(async {
//! let subject = ReplaySubject::<i32, ()>::new(ReplayPolicy::Size(3));
//! for i in 0..5 {
//!   subject.emit(i).await;
//! }
//! subject.complete().await;
//!
//! let late = subject.subscribe().try_collect::<Vec<_>>().await;
//! assert_eq!(late, Ok(vec![2, 3, 4]));
//! # });
//! ```

use std::{
  future::Future,
  task::{Context, Poll},
};

use futures::{future::poll_fn, Sink, SinkExt, Stream, StreamExt};

use crate::error::CollectError;

mod behavior_subject;
mod collectors;
mod multicast_subject;
pub(crate) mod node;
mod replay_buffer;
mod replay_subject;
mod unicast_subject;
mod unicast_work_subject;

pub use behavior_subject::{BehaviorSubject, BehaviorSubscription};
pub use multicast_subject::{MulticastSubject, MulticastSubscription, DEFAULT_COLLECTOR_CAPACITY};
pub use replay_subject::{ReplayPolicy, ReplaySubject, ReplaySubscription};
pub use unicast_subject::{UnicastSubject, UnicastSubscription};
pub use unicast_work_subject::{UnicastWorkSubject, UnicastWorkSubscription};

/// The producer and subscriber surface shared by every subject.
///
/// Producer methods may be called concurrently from any number of tasks and
/// threads. They are `async` because some subjects make producers wait: for a
/// rendezvous, for room in a subscriber's buffer, or for a subscriber to be
/// ready to take the next value.
pub trait SubjectApi<T, E>: Send + Sync {
  /// The stream handed out by [`subscribe`](Self::subscribe).
  type Subscription: Stream<Item = Result<T, E>>;

  /// Broadcast a value. A no-op once the subject terminated.
  fn emit(&self, value: T) -> impl Future<Output = ()> + Send;

  /// Terminate with `err`. Only the first terminal call has an effect.
  fn emit_error(&self, err: E) -> impl Future<Output = ()> + Send;

  /// Terminate normally. Only the first terminal call has an effect.
  fn complete(&self) -> impl Future<Output = ()> + Send;

  /// Subscribe to the subject.
  fn subscribe(&self) -> Self::Subscription;

  /// Number of currently registered subscribers.
  fn collector_count(&self) -> usize;

  /// `Ready` once at least `n` subscribers are registered; otherwise `cx` is
  /// woken by the next registration.
  fn poll_collectors(&self, n: usize, cx: &mut Context<'_>) -> Poll<()>;

  fn has_collectors(&self) -> bool { self.collector_count() > 0 }

  /// Wait until at least one subscriber is registered.
  fn await_collector(&self) -> impl Future<Output = ()> + Send { self.await_collectors(1) }

  /// Wait until at least `n` subscribers are registered.
  ///
  /// Subscriptions register when they are first polled, so the subscribing
  /// tasks must be running for this to make progress.
  fn await_collectors(&self, n: usize) -> impl Future<Output = ()> + Send {
    poll_fn(move |cx| self.poll_collectors(n, cx))
  }

  /// Pump `upstream` into this subject until it ends.
  ///
  /// Values are emitted in order; an `Err` item fails the subject and stops
  /// the pump, and the end of `upstream` completes it.
  fn forward_from<S>(&self, upstream: S) -> impl Future<Output = ()> + Send
  where
    S: Stream<Item = Result<T, E>> + Send,
    T: Send,
    E: Send,
  {
    async move {
      let mut upstream = std::pin::pin!(upstream);
      while let Some(item) = upstream.next().await {
        match item {
          Ok(value) => self.emit(value).await,
          Err(err) => return self.emit_error(err).await,
        }
      }
      self.complete().await;
    }
  }
}

/// Sink-side consumption of a subscription stream.
pub trait SubscriptionExt<T, E>: Stream<Item = Result<T, E>> + Sized {
  /// Deliver every value to `sink` until the stream ends.
  ///
  /// The stream is dropped on return, which unsubscribes it; a failing sink
  /// therefore just removes this subscriber and never affects the subject.
  ///
  /// # Errors
  ///
  /// [`CollectError::Upstream`] with the subject's terminal error, or
  /// [`CollectError::Sink`] when `sink` rejects a value.
  fn collect_into<S>(
    self, sink: S,
  ) -> impl Future<Output = Result<(), CollectError<E, S::Error>>> + Send
  where
    Self: Send,
    S: Sink<T> + Unpin + Send,
    T: Send,
    E: Send,
  {
    async move {
      let mut sink = sink;
      let mut stream = std::pin::pin!(self);
      while let Some(item) = stream.next().await {
        match item {
          Ok(value) => sink.send(value).await.map_err(CollectError::Sink)?,
          Err(err) => return Err(CollectError::Upstream(err)),
        }
      }
      Ok(())
    }
  }
}

impl<T, E, St> SubscriptionExt<T, E> for St where St: Stream<Item = Result<T, E>> {}
