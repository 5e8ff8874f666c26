//! Bounded single-producer/single-consumer ring buffer.

use std::{
  cell::UnsafeCell,
  mem::MaybeUninit,
  sync::atomic::{AtomicU8, AtomicUsize, Ordering},
};

const EMPTY: u8 = 0;
const WRITING: u8 = 1;
const FULL: u8 = 2;
const READING: u8 = 3;

struct Slot<T> {
  state: AtomicU8,
  value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Drop for Slot<T> {
  fn drop(&mut self) {
    if *self.state.get_mut() == FULL {
      // SAFETY: `FULL` means `value` was written and not read back yet.
      unsafe { self.value.get_mut().assume_init_drop() };
    }
  }
}

/// A lock-free ring buffer for exactly one producer and one consumer.
///
/// Capacity is rounded up to the next power of two so indices can be masked
/// instead of taken modulo. Each slot stores its value inline next to a state
/// byte; `offer` fails when the slot under the producer index is not empty and
/// `poll` fails when the slot under the consumer index is not full.
///
/// Using it from several producers (or several consumers) at once stays
/// memory safe, since a slot is claimed before it is touched, but may report
/// spurious fullness or reorder values. Wrap it like
/// [`BufferedResumableCollector`](crate::collector::BufferedResumableCollector)
/// does when more than one producer is involved.
pub struct SpscArrayQueue<T> {
  slots: Box<[Slot<T>]>,
  mask: usize,
  producer_index: AtomicUsize,
  consumer_index: AtomicUsize,
}

// Values only ever move between the producer and the consumer thread, and
// each slot is claimed through its state byte before it is accessed.
unsafe impl<T: Send> Sync for SpscArrayQueue<T> {}

impl<T> SpscArrayQueue<T> {
  /// Create a queue holding at least `capacity` values (minimum 1).
  pub fn new(capacity: usize) -> Self {
    let capacity = capacity.max(1).next_power_of_two();
    let slots = (0..capacity)
      .map(|_| Slot { state: AtomicU8::new(EMPTY), value: UnsafeCell::new(MaybeUninit::uninit()) })
      .collect::<Vec<_>>()
      .into_boxed_slice();
    Self {
      slots,
      mask: capacity - 1,
      producer_index: AtomicUsize::new(0),
      consumer_index: AtomicUsize::new(0),
    }
  }

  /// The rounded-up capacity.
  #[inline]
  pub fn capacity(&self) -> usize { self.mask + 1 }

  /// Enqueue `value`, handing it back when the queue is full.
  pub fn offer(&self, value: T) -> Result<(), T> {
    let index = self.producer_index.load(Ordering::Relaxed);
    let slot = &self.slots[index & self.mask];
    if slot
      .state
      .compare_exchange(EMPTY, WRITING, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      return Err(value);
    }
    // SAFETY: the `WRITING` claim gives this call exclusive access to the
    // slot, and `EMPTY` means it holds no value.
    unsafe { (*slot.value.get()).write(value) };
    slot.state.store(FULL, Ordering::Release);
    self.producer_index.store(index.wrapping_add(1), Ordering::Relaxed);
    Ok(())
  }

  /// Dequeue the oldest value, or `None` when empty.
  pub fn poll(&self) -> Option<T> {
    let index = self.consumer_index.load(Ordering::Relaxed);
    let slot = &self.slots[index & self.mask];
    slot
      .state
      .compare_exchange(FULL, READING, Ordering::Acquire, Ordering::Relaxed)
      .ok()?;
    // SAFETY: the `READING` claim gives this call exclusive access, and the
    // acquired `FULL` state means the producer's write is visible.
    let value = unsafe { (*slot.value.get()).assume_init_read() };
    slot.state.store(EMPTY, Ordering::Release);
    self.consumer_index.store(index.wrapping_add(1), Ordering::Relaxed);
    Some(value)
  }

  /// Drop every queued value. Consumer side only.
  pub fn clear(&self) { while self.poll().is_some() {} }

  /// Whether the next `poll` would find nothing.
  pub fn is_empty(&self) -> bool {
    let index = self.consumer_index.load(Ordering::Relaxed);
    self.slots[index & self.mask].state.load(Ordering::Acquire) != FULL
  }
}

impl<T> std::fmt::Debug for SpscArrayQueue<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SpscArrayQueue")
      .field("capacity", &self.capacity())
      .field("producer_index", &self.producer_index.load(Ordering::Relaxed))
      .field("consumer_index", &self.consumer_index.load(Ordering::Relaxed))
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use std::{sync::Arc, thread};

  use super::*;

  #[test]
  fn capacity_rounds_up_to_power_of_two() {
    assert_eq!(SpscArrayQueue::<u8>::new(0).capacity(), 1);
    assert_eq!(SpscArrayQueue::<u8>::new(3).capacity(), 4);
    assert_eq!(SpscArrayQueue::<u8>::new(16).capacity(), 16);
    assert_eq!(SpscArrayQueue::<u8>::new(17).capacity(), 32);
  }

  #[test]
  fn offer_fails_when_full_and_poll_when_empty() {
    let q = SpscArrayQueue::new(2);
    assert!(q.is_empty());
    assert_eq!(q.poll(), None);

    assert_eq!(q.offer(1), Ok(()));
    assert_eq!(q.offer(2), Ok(()));
    assert_eq!(q.offer(3), Err(3));

    assert_eq!(q.poll(), Some(1));
    assert_eq!(q.offer(3), Ok(()));
    assert_eq!(q.poll(), Some(2));
    assert_eq!(q.poll(), Some(3));
    assert_eq!(q.poll(), None);
    assert!(q.is_empty());
  }

  #[test]
  fn clear_and_drop_release_values() {
    let value = Arc::new(());
    let q = SpscArrayQueue::new(4);
    for _ in 0..3 {
      q.offer(value.clone()).unwrap();
    }
    assert_eq!(Arc::strong_count(&value), 4);
    q.clear();
    assert!(q.is_empty());
    assert_eq!(Arc::strong_count(&value), 1);

    q.offer(value.clone()).unwrap();
    drop(q);
    assert_eq!(Arc::strong_count(&value), 1);
  }

  #[test]
  fn values_live_inline_across_many_wraps() {
    let value = Arc::new(());
    let q = SpscArrayQueue::new(2);
    for round in 0..1000 {
      q.offer(value.clone()).unwrap();
      q.offer(value.clone()).unwrap();
      assert!(q.offer(value.clone()).is_err(), "round {round}");
      assert_eq!(Arc::strong_count(&value), 3);
      assert!(q.poll().is_some());
      assert!(q.poll().is_some());
      assert!(q.poll().is_none());
    }
    assert_eq!(Arc::strong_count(&value), 1);
  }

  #[test]
  fn producer_and_consumer_threads_preserve_order() {
    const N: usize = 100_000;
    let q = Arc::new(SpscArrayQueue::new(64));
    let producer = {
      let q = q.clone();
      thread::spawn(move || {
        for i in 0..N {
          let mut v = i;
          while let Err(back) = q.offer(v) {
            v = back;
            thread::yield_now();
          }
        }
      })
    };

    let mut expected = 0;
    while expected < N {
      match q.poll() {
        Some(v) => {
          assert_eq!(v, expected);
          expected += 1;
        }
        None => thread::yield_now(),
      }
    }
    producer.join().unwrap();
    assert!(q.is_empty());
  }
}
