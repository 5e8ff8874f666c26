use std::{
  sync::Arc,
  task::{Context, Poll},
};

use arc_swap::ArcSwap;
use smallvec::SmallVec;

use crate::resumable::WakerSet;

/// An immutable snapshot of the registered subscriber handles.
///
/// Snapshots are never mutated: every add/remove builds a new one and swaps it
/// in. A snapshot with `terminated` set is the final state of a subject and
/// refuses further registrations.
pub(crate) struct CollectorSet<H> {
  terminated: bool,
  handles: SmallVec<[Arc<H>; 4]>,
}

impl<H> CollectorSet<H> {
  fn open() -> Self { Self { terminated: false, handles: SmallVec::new() } }

  fn terminated() -> Self { Self { terminated: true, handles: SmallVec::new() } }

  pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<H>> { self.handles.iter() }

  pub(crate) fn len(&self) -> usize { self.handles.len() }
}

/// Lock-free registry of subscriber handles.
///
/// Writers race with compare-and-swap over whole snapshots, so readers always
/// see either the old or the new set and never a half-applied change.
pub(crate) struct Collectors<H> {
  set: ArcSwap<CollectorSet<H>>,
  /// Tasks waiting for more registrations.
  arrivals: WakerSet,
}

impl<H> Default for Collectors<H> {
  fn default() -> Self {
    Self { set: ArcSwap::from_pointee(CollectorSet::open()), arrivals: WakerSet::default() }
  }
}

impl<H> Collectors<H> {
  /// Register `handle`. Returns `false` if the set was already terminated.
  pub(crate) fn add(&self, handle: &Arc<H>) -> bool {
    loop {
      let current = self.set.load();
      if current.terminated {
        return false;
      }
      let mut handles = current.handles.clone();
      handles.push(handle.clone());
      let next = Arc::new(CollectorSet { terminated: false, handles });
      let prev = self.set.compare_and_swap(&current, next);
      if Arc::ptr_eq(&*prev, &*current) {
        self.arrivals.wake_all();
        return true;
      }
    }
  }

  /// Unregister `handle`. Returns `false` if it was not registered.
  pub(crate) fn remove(&self, handle: &Arc<H>) -> bool {
    loop {
      let current = self.set.load();
      let Some(at) = current.handles.iter().position(|h| Arc::ptr_eq(h, handle)) else {
        return false;
      };
      let mut handles = current.handles.clone();
      handles.remove(at);
      let next = Arc::new(CollectorSet { terminated: current.terminated, handles });
      let prev = self.set.compare_and_swap(&current, next);
      if Arc::ptr_eq(&*prev, &*current) {
        return true;
      }
    }
  }

  /// Swap in the terminated set and hand back whatever was registered.
  ///
  /// Only the first call sees the live handles; later calls get an empty set,
  /// which is what makes terminal delivery happen once per handle.
  pub(crate) fn terminate(&self) -> Arc<CollectorSet<H>> {
    self.set.swap(Arc::new(CollectorSet::terminated()))
  }

  pub(crate) fn snapshot(&self) -> Arc<CollectorSet<H>> { self.set.load_full() }

  pub(crate) fn len(&self) -> usize { self.set.load().len() }

  /// `Ready` once at least `n` handles are registered.
  pub(crate) fn poll_at_least(&self, n: usize, cx: &mut Context<'_>) -> Poll<()> {
    self.arrivals.poll_until(cx, || self.len() >= n)
  }
}
