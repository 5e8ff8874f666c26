//! Share one upstream subscription between several consumers through a
//! [`ReplaySubject`].
//!
//! ```rust
//! use futures::{future::ready, stream, StreamExt, TryStreamExt};
//! use hotrx::prelude::*;
//!
//! # futures::executor::block_on(async {
//! let out = stream::iter((1..=5).map(Ok::<i32, ()>))
//!   .replay(ReplayPolicy::Size(2), |shared| {
//!     let evens = shared.subscribe().try_filter(|v| ready(v % 2 == 0));
//!     // Subscribes once `evens` ended, so it only sees the retained tail.
//!     evens.chain(shared.subscribe())
//!   })
//!   .try_collect::<Vec<_>>()
//!   .await;
//! assert_eq!(out, Ok(vec![2, 4, 4, 5]));
//! # });
//! ```

use std::{
  pin::Pin,
  task::{Context, Poll},
};

use futures::{future::BoxFuture, FutureExt, Stream};
use tracing::trace;

use crate::subject::{ReplayPolicy, ReplaySubject, SubjectApi};

/// Adds [`replay`](ReplayExt::replay) to every `Stream<Item = Result<T, E>>`.
pub trait ReplayExt<T, E>: Stream<Item = Result<T, E>> + Sized {
  /// Feed this stream into a fresh [`ReplaySubject`] retaining what `policy`
  /// allows, and build the output from that subject with `transform`.
  ///
  /// `transform` may subscribe to the subject any number of times, now or
  /// later; later subscriptions start from the retained history. The upstream
  /// is only consumed while the output is polled, and is dropped as soon as
  /// the output ends.
  fn replay<F, R>(self, policy: ReplayPolicy, transform: F) -> Replayed<R>
  where
    Self: Send + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    F: FnOnce(ReplaySubject<T, E>) -> R,
    R: Stream,
  {
    self.replay_with(|| ReplaySubject::new(policy), transform)
  }

  /// Like [`replay`](Self::replay), with the subject built by `subject`,
  /// for example one timestamping values with a custom
  /// [`Clock`](crate::clock::Clock).
  fn replay_with<P, F, R>(self, subject: P, transform: F) -> Replayed<R>
  where
    Self: Send + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    P: FnOnce() -> ReplaySubject<T, E>,
    F: FnOnce(ReplaySubject<T, E>) -> R,
    R: Stream,
  {
    let subject = subject();
    let output = Box::pin(transform(subject.clone()));
    let pump = async move { subject.forward_from(self).await }.boxed();
    Replayed { output, pump: Some(pump), finished: false }
  }
}

impl<T, E, S> ReplayExt<T, E> for S where S: Stream<Item = Result<T, E>> {}

/// Output stream of [`ReplayExt::replay`].
///
/// Every poll first polls the transformed stream, so its subscriptions are
/// registered before the upstream pump emits anything into the subject.
pub struct Replayed<R> {
  output: Pin<Box<R>>,
  pump: Option<BoxFuture<'static, ()>>,
  finished: bool,
}

impl<R: Stream> Stream for Replayed<R> {
  type Item = R::Item;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<R::Item>> {
    let this = self.get_mut();
    if this.finished {
      return Poll::Ready(None);
    }
    loop {
      if let Poll::Ready(item) = this.output.as_mut().poll_next(cx) {
        if item.is_none() {
          this.finished = true;
          if this.pump.take().is_some() {
            trace!("replay output ended before its upstream");
          }
        }
        return Poll::Ready(item);
      }
      match &mut this.pump {
        Some(pump) => {
          if pump.as_mut().poll(cx).is_pending() {
            return Poll::Pending;
          }
          trace!("replay upstream drained");
          this.pump = None;
        }
        None => return Poll::Pending,
      }
    }
  }
}
