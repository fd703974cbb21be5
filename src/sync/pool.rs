// Event pool - fixed-capacity arena of event slots addressed by handle
//
// Nothing is allocated after construction: acquire() hands out a free slot,
// release() returns it. Consumers that only look at an event get a Borrowed
// view which cannot be released.

use std::ops::Deref;

/// Index of an acquired slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(u32);

impl EventHandle {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Read-only view of a pooled event, owned by the pool
#[derive(Debug)]
pub struct Borrowed<'a, T> {
    handle: EventHandle,
    value: &'a T,
}

impl<'a, T> Borrowed<'a, T> {
    pub fn handle(&self) -> EventHandle {
        self.handle
    }

    pub fn get(&self) -> &'a T {
        self.value
    }
}

impl<T> Deref for Borrowed<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value
    }
}

pub struct EventPool<T> {
    slots: Vec<Option<T>>,
    free: Vec<u32>,
}

impl<T> EventPool<T> {
    /// Pre-allocate `capacity` slots
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        // Reverse so low indexes are handed out first
        let free = (0..capacity as u32).rev().collect();
        Self { slots, free }
    }

    /// Store `value` in a free slot, None when exhausted
    pub fn acquire(&mut self, value: T) -> Option<EventHandle> {
        let index = self.free.pop()?;
        self.slots[index as usize] = Some(value);
        Some(EventHandle(index))
    }

    /// Return a slot to the pool, yielding its value
    pub fn release(&mut self, handle: EventHandle) -> Option<T> {
        let value = self.slots.get_mut(handle.index())?.take()?;
        self.free.push(handle.0);
        Some(value)
    }

    pub fn get(&self, handle: EventHandle) -> Option<&T> {
        self.slots.get(handle.index())?.as_ref()
    }

    pub fn borrow(&self, handle: EventHandle) -> Option<Borrowed<'_, T>> {
        self.get(handle).map(|value| Borrowed { handle, value })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn in_use(&self) -> usize {
        self.capacity() - self.available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release() {
        let mut pool = EventPool::new(2);
        let a = pool.acquire(10).unwrap();
        let b = pool.acquire(20).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.available(), 0);
        assert!(pool.acquire(30).is_none());

        assert_eq!(pool.release(a), Some(10));
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.get(b), Some(&20));

        let c = pool.acquire(30).unwrap();
        assert_eq!(pool.get(c), Some(&30));
    }

    #[test]
    fn test_double_release() {
        let mut pool = EventPool::new(1);
        let a = pool.acquire(1).unwrap();
        assert_eq!(pool.release(a), Some(1));
        assert_eq!(pool.release(a), None);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_borrowed_view() {
        let mut pool = EventPool::new(4);
        let handle = pool.acquire(String::from("pulse")).unwrap();
        let view = pool.borrow(handle).unwrap();
        assert_eq!(view.len(), 5);
        assert_eq!(view.handle(), handle);
    }
}
