use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};

/// One link of an append-only, singly-linked value chain.
///
/// Readers hold an `Arc` to the node they are at and follow `next` without
/// locking. A reader that falls behind keeps its part of the chain alive on
/// its own, after the owner has moved its head past it.
pub(crate) struct Node<V> {
  pub(crate) value: V,
  next: ArcSwapOption<Node<V>>,
}

impl<V> Node<V> {
  pub(crate) fn new(value: V) -> Arc<Self> {
    Arc::new(Self { value, next: ArcSwapOption::empty() })
  }

  pub(crate) fn next(&self) -> Option<Arc<Node<V>>> { self.next.load_full() }

  /// Link `node` after `self` unless something already is; in that case the
  /// existing successor comes back as the error.
  fn try_link(&self, node: &Arc<Node<V>>) -> Result<(), Arc<Node<V>>> {
    let prev = self
      .next
      .compare_and_swap(&None::<Arc<Node<V>>>, Some(node.clone()));
    match &*prev {
      None => Ok(()),
      Some(next) => Err(next.clone()),
    }
  }
}

/// Append `node` at the end of the chain whose last node `tail` points at,
/// and move `tail` to it.
///
/// Safe to call from several producers at once: each append lands atomically
/// and a producer that loses the race helps move `tail` forward before
/// retrying, so no node is ever orphaned. The relative order of concurrent
/// appends is unspecified.
pub(crate) fn append<V>(tail: &ArcSwap<Node<V>>, node: Arc<Node<V>>) {
  loop {
    let last = tail.load_full();
    match last.try_link(&node) {
      Ok(()) => {
        tail.compare_and_swap(&last, node);
        return;
      }
      Err(next) => {
        tail.compare_and_swap(&last, next);
      }
    }
  }
}

impl<V> Drop for Node<V> {
  // Unlink iteratively; the default recursive drop overflows the stack on
  // long chains.
  fn drop(&mut self) {
    let mut next = self.next.swap(None);
    while let Some(node) = next {
      match Arc::try_unwrap(node) {
        Ok(node) => next = node.next.swap(None),
        Err(_) => break,
      }
    }
  }
}
