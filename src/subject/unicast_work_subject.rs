use std::{
  sync::Arc,
  task::{Context, Poll},
};

use super::{
  unicast_subject::{subscribe_or_panic, try_subscribe, Reuse, UnicastCore, UnicastSubscription},
  SubjectApi,
};
use crate::error::SubjectError;

/// Subscription stream of a [`UnicastWorkSubject`].
pub type UnicastWorkSubscription<T, E> = UnicastSubscription<T, E>;

/// A work queue with one consumer at a time.
///
/// Like [`UnicastSubject`](super::UnicastSubject), but when the subscriber
/// leaves the slot opens again and everything it did not take stays buffered
/// for the next one. Values emitted after the terminal signal are queued too;
/// each later subscriber drains them and then observes the stored terminal
/// signal.
pub struct UnicastWorkSubject<T, E> {
  core: Arc<UnicastCore<T, E>>,
}

impl<T, E> Clone for UnicastWorkSubject<T, E> {
  fn clone(&self) -> Self { Self { core: self.core.clone() } }
}

impl<T, E> Default for UnicastWorkSubject<T, E> {
  fn default() -> Self { Self::new() }
}

impl<T, E> UnicastWorkSubject<T, E> {
  pub fn new() -> Self { Self { core: Arc::new(UnicastCore::new(Reuse::Sequential)) } }

  /// Subscribe unless another subscription is active.
  ///
  /// # Errors
  ///
  /// [`SubjectError::AlreadySubscribed`] while another subscription is
  /// active.
  pub fn try_subscribe(&self) -> Result<UnicastWorkSubscription<T, E>, SubjectError> {
    try_subscribe(&self.core)
  }

  /// Values waiting for a subscriber.
  pub fn buffered(&self) -> usize { self.core.buffered() }

  pub fn is_terminated(&self) -> bool { self.core.is_terminated() }
}

impl<T, E> SubjectApi<T, E> for UnicastWorkSubject<T, E>
where
  T: Send + 'static,
  E: Clone + Send + Sync + 'static,
{
  type Subscription = UnicastWorkSubscription<T, E>;

  async fn emit(&self, value: T) { self.core.emit(value) }

  async fn emit_error(&self, err: E) { self.core.emit_error(err) }

  async fn complete(&self) { self.core.complete() }

  /// # Panics
  ///
  /// While another subscription is active.
  fn subscribe(&self) -> UnicastWorkSubscription<T, E> { subscribe_or_panic(&self.core) }

  fn collector_count(&self) -> usize { self.core.collector_count() }

  fn poll_collectors(&self, n: usize, cx: &mut Context<'_>) -> Poll<()> {
    self.core.poll_collectors(n, cx)
  }
}
