// Communication channels lock-free
//
// Bounded single-producer/single-consumer hand-off generic over the payload.
// A full channel drops the new item and counts it; unread items are never
// overwritten.

use crate::diagnostics::{Counter, Diagnostics};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::Arc;

/// Producer half, owned by exactly one writer thread
pub struct Sender<T> {
    inner: HeapProd<T>,
    diagnostics: Arc<Diagnostics>,
    dropped: u64,
}

/// Consumer half, owned by exactly one reader thread
pub struct Receiver<T> {
    inner: HeapCons<T>,
}

pub fn spsc_channel<T>(capacity: usize, diagnostics: Arc<Diagnostics>) -> (Sender<T>, Receiver<T>) {
    let rb = HeapRb::<T>::new(capacity.max(1));
    let (prod, cons) = rb.split();
    (
        Sender {
            inner: prod,
            diagnostics,
            dropped: 0,
        },
        Receiver { inner: cons },
    )
}

impl<T> Sender<T> {
    /// Non-blocking send, returns false if the item was dropped
    pub fn send(&mut self, item: T) -> bool {
        if self.inner.try_push(item).is_err() {
            self.dropped += 1;
            self.diagnostics.bump(Counter::QueueOverflow);
            false
        } else {
            true
        }
    }

    /// Items dropped by this sender because the channel was full
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn is_full(&self) -> bool {
        self.inner.is_full()
    }
}

impl<T> Receiver<T> {
    pub fn recv(&mut self) -> Option<T> {
        self.inner.try_pop()
    }

    pub fn len(&self) -> usize {
        self.inner.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity().get()
    }
}
