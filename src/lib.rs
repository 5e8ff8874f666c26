//! # hotrx: hot broadcast subjects for async Rust
//!
//! Subjects are shared entry points that producers push values into and any
//! number of subscribers consume as a [`Stream`](futures::Stream). They are
//! *hot*: a value is broadcast when it is emitted, and what a subscriber sees
//! depends on when it subscribed and on the subject's history policy.
//!
//! ```rust
//! use futures::TryStreamExt;
//! use hotrx::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let subject = MulticastSubject::<&str, ()>::new(2);
//! let a = tokio::spawn(subject.subscribe().try_collect::<Vec<_>>());
//! let b = tokio::spawn(subject.subscribe().try_collect::<Vec<_>>());
//!
//! // Waits until both subscribers are registered.
//! subject.emit("hello").await;
//! subject.complete().await;
//!
//! assert_eq!(a.await.unwrap(), Ok(vec!["hello"]));
//! assert_eq!(b.await.unwrap(), Ok(vec!["hello"]));
//! # }
//! ```
//!
//! ## Key Concepts
//!
//! | Type | Description |
//! |------|-------------|
//! | [`SubjectApi`] | `emit`, `emit_error`, `complete`, `subscribe` |
//! | [`Resumable`] | The single-waiter park/unpark primitive every loop waits on |
//! | [`BufferedResumableCollector`] | Bounded handoff with backpressure |
//! | [`SpscArrayQueue`] | Lock-free single-producer/single-consumer ring |
//! | [`ReplayExt`] | `replay`: share one upstream through a replay subject |
//!
//! Subscriptions yield `Ok(value)` items, at most one `Err(e)` when the
//! subject fails, and then end. Dropping a subscription unsubscribes it.
//!
//! ## Logging
//!
//! Lifecycle events (subscribers registering and leaving, terminal
//! transitions, gates opening, history trimming) are reported through
//! [`tracing`] at `debug` and `trace` level. The crate never installs a
//! subscriber.
//!
//! [`SubjectApi`]: subject::SubjectApi
//! [`Resumable`]: resumable::Resumable
//! [`BufferedResumableCollector`]: collector::BufferedResumableCollector
//! [`SpscArrayQueue`]: queue::SpscArrayQueue
//! [`ReplayExt`]: ops::ReplayExt

pub mod clock;
pub mod collector;
pub mod error;
pub mod ops;
pub mod prelude;
pub mod queue;
pub mod resumable;
pub mod subject;
mod terminal;

pub use prelude::*;
