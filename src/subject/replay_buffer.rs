//! History buffers behind [`ReplaySubject`](super::ReplaySubject).

use std::{
  sync::{
    atomic::{AtomicIsize, Ordering},
    Arc,
  },
  task::{ready, Context, Poll},
  time::Duration,
};

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use tracing::trace;

use super::node::{self, Node};
use crate::{clock::Clock, resumable::Resumable, terminal::TerminalCell};

/// Where a subscriber is in a buffer's history.
pub(crate) enum Cursor<T> {
  /// Not positioned yet; the buffer picks the oldest retained value on first
  /// use.
  Unstarted,
  Index(usize),
  Node(Arc<Node<Slot<T>>>),
}

/// A retained value. `value` is `None` only for the initial head sentinel.
pub(crate) struct Slot<T> {
  value: Option<T>,
  timestamp: Duration,
}

/// A replay history plus its terminal state.
pub(crate) trait ReplayBuffer<T, E>: Send + Sync {
  fn terminal(&self) -> &TerminalCell<E>;

  /// Append a value to the history.
  fn emit(&self, value: T);

  /// Take the value after `cursor` and advance past it.
  fn try_next(&self, cursor: &mut Cursor<T>) -> Option<T>;

  /// Number of values currently retained.
  fn len(&self) -> usize;

  /// Returns `false` if the buffer was already terminal.
  fn error(&self, err: E) -> bool { self.terminal().fail(err) }

  /// Returns `false` if the buffer was already terminal.
  fn complete(&self) -> bool { self.terminal().complete() }

  /// Replay step for one subscriber: the next value, else the terminal item
  /// once the cursor caught up with a terminated buffer, else park on
  /// `resumable`.
  fn poll_replay(
    &self, cursor: &mut Cursor<T>, resumable: &Resumable, cx: &mut Context<'_>,
  ) -> Poll<Option<Result<T, E>>>
  where
    E: Clone,
  {
    loop {
      // Read `done` first: a value appended before termination must still be
      // seen by the `try_next` below.
      let done = self.terminal().is_terminated();
      if let Some(value) = self.try_next(cursor) {
        return Poll::Ready(Some(Ok(value)));
      }
      if done {
        return Poll::Ready(self.terminal().final_item());
      }
      ready!(resumable.poll_wait(cx));
    }
  }
}

/// Keeps every value ever emitted.
pub(crate) struct UnboundedBuffer<T, E> {
  values: RwLock<Vec<T>>,
  terminal: TerminalCell<E>,
}

impl<T, E> UnboundedBuffer<T, E> {
  pub(crate) fn new() -> Self {
    Self { values: RwLock::new(Vec::new()), terminal: TerminalCell::default() }
  }
}

impl<T, E> ReplayBuffer<T, E> for UnboundedBuffer<T, E>
where
  T: Clone + Send + Sync,
  E: Send + Sync,
{
  fn terminal(&self) -> &TerminalCell<E> { &self.terminal }

  fn emit(&self, value: T) { self.values.write().push(value); }

  fn try_next(&self, cursor: &mut Cursor<T>) -> Option<T> {
    let index = match cursor {
      Cursor::Index(index) => *index,
      _ => 0,
    };
    let value = self.values.read().get(index).cloned()?;
    *cursor = Cursor::Index(index + 1);
    Some(value)
  }

  fn len(&self) -> usize { self.values.read().len() }
}

/// Keeps the last `max_size` values, optionally dropping values older than
/// `max_age` as well.
///
/// The history is a node chain from `head` (a sentinel whose successor is
/// the oldest retained value) to `tail`. Eviction only moves `head`; a
/// subscriber still holding an evicted node keeps reading from it.
pub(crate) struct BoundedBuffer<T, E> {
  head: ArcSwap<Node<Slot<T>>>,
  tail: ArcSwap<Node<Slot<T>>>,
  /// Retained values. Transiently off by the appends still in flight.
  size: AtomicIsize,
  max_size: isize,
  max_age: Option<(Duration, Arc<dyn Clock>)>,
  terminal: TerminalCell<E>,
}

impl<T, E> BoundedBuffer<T, E> {
  /// Size-bounded history.
  pub(crate) fn new(max_size: usize) -> Self { Self::build(max_size, None) }

  /// Size- and age-bounded history.
  pub(crate) fn with_max_age(max_size: usize, max_age: Duration, clock: Arc<dyn Clock>) -> Self {
    Self::build(max_size, Some((max_age, clock)))
  }

  fn build(max_size: usize, max_age: Option<(Duration, Arc<dyn Clock>)>) -> Self {
    let head = Node::new(Slot { value: None, timestamp: Duration::ZERO });
    Self {
      tail: ArcSwap::new(head.clone()),
      head: ArcSwap::new(head),
      size: AtomicIsize::new(0),
      max_size: isize::try_from(max_size.max(1)).unwrap_or(isize::MAX),
      max_age,
      terminal: TerminalCell::default(),
    }
  }

  fn now(&self) -> Duration {
    self
      .max_age
      .as_ref()
      .map_or(Duration::ZERO, |(_, clock)| clock.now())
  }

  /// Oldest timestamp still retained at `now`, if values can expire.
  fn expiry(&self, now: Duration) -> Option<Duration> {
    let (max_age, _) = self.max_age.as_ref()?;
    now.checked_sub(*max_age)
  }

  /// Move `head` one node forward if it still is `from`.
  fn evict(&self, from: &Arc<Node<Slot<T>>>, to: Arc<Node<Slot<T>>>) -> bool {
    let prev = self.head.compare_and_swap(from, to);
    let moved = Arc::ptr_eq(&*prev, from);
    if moved {
      self.size.fetch_sub(1, Ordering::AcqRel);
    }
    moved
  }

  fn trim_size(&self) {
    while self.size.load(Ordering::Acquire) > self.max_size {
      let head = self.head.load_full();
      match head.next() {
        Some(next) => {
          self.evict(&head, next);
        }
        None => break,
      }
    }
  }

  fn trim_time(&self, now: Duration) {
    let Some(limit) = self.expiry(now) else {
      return;
    };
    let mut evicted = 0usize;
    loop {
      let head = self.head.load_full();
      match head.next() {
        Some(next) if next.value.timestamp <= limit => {
          if self.evict(&head, next) {
            evicted += 1;
          }
        }
        _ => break,
      }
    }
    if evicted > 0 {
      trace!(evicted, "replay history trimmed by age");
    }
  }

  /// Where a new subscriber starts: `head`, skipping values that expired
  /// since the last emit.
  fn find_head(&self) -> Arc<Node<Slot<T>>> {
    let mut head = self.head.load_full();
    if let Some(limit) = self.expiry(self.now()) {
      while let Some(next) = head.next() {
        if next.value.timestamp > limit {
          break;
        }
        head = next;
      }
    }
    head
  }
}

impl<T, E> ReplayBuffer<T, E> for BoundedBuffer<T, E>
where
  T: Clone + Send + Sync,
  E: Send + Sync,
{
  fn terminal(&self) -> &TerminalCell<E> { &self.terminal }

  fn emit(&self, value: T) {
    let now = self.now();
    node::append(&self.tail, Node::new(Slot { value: Some(value), timestamp: now }));
    self.size.fetch_add(1, Ordering::AcqRel);
    self.trim_size();
    self.trim_time(now);
  }

  fn try_next(&self, cursor: &mut Cursor<T>) -> Option<T> {
    let at = match cursor {
      Cursor::Node(node) => node.clone(),
      _ => self.find_head(),
    };
    match at.next() {
      Some(next) => {
        let value = next.value.value.clone();
        *cursor = Cursor::Node(next);
        value
      }
      None => {
        *cursor = Cursor::Node(at);
        None
      }
    }
  }

  fn len(&self) -> usize { self.size.load(Ordering::Acquire).max(0) as usize }
}
