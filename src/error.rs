//! Error types shared by every subject.
//!
//! Producer-supplied terminal errors are generic (`E`) and travel through the
//! subscription stream as `Err(e)`. The enums here cover what the subjects
//! themselves can report: protocol violations, cancellation, and the outcome
//! of draining a subscription into a [`Sink`](futures::Sink).

use thiserror::Error;

/// Errors raised by the subjects themselves, as opposed to the terminal errors
/// that producers broadcast through them.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SubjectError {
  /// A unicast subject already has an active subscriber.
  #[error("unicast subject already has an active subscriber")]
  AlreadySubscribed,
  /// A [`UnicastSubject`](crate::subject::UnicastSubject) was consumed by its
  /// one subscriber and can not be subscribed again.
  #[error("unicast subject has already been consumed")]
  Consumed,
  /// The consumer side went away while a producer was handing it a value.
  #[error("collector was cancelled")]
  Cancelled,
}

/// Why driving a subscription into a sink stopped early.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CollectError<E, S> {
  /// The subject terminated with an error.
  #[error("upstream terminated with an error: {0}")]
  Upstream(E),
  /// The downstream sink rejected a value.
  #[error("downstream sink failed: {0}")]
  Sink(S),
}

impl<E, S> CollectError<E, S> {
  /// Returns `true` when the failure came from the subject.
  pub fn is_upstream(&self) -> bool { matches!(self, CollectError::Upstream(_)) }
}
