//! Fixed-capacity ring buffer
use core::fmt;

use super::Init;

/// A double-ended ring buffer with a capacity of `N` elements. Used as the
/// storage of message queues and pipes.
pub struct Ring<T, const N: usize> {
    slots: [Option<T>; N],
    head: usize,
    len: usize,
}

impl<T, const N: usize> Init for Ring<T, N> {
    const INIT: Self = Self::new();
}

impl<T: fmt::Debug, const N: usize> fmt::Debug for Ring<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T, const N: usize> Ring<T, N> {
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; N],
            head: 0,
            len: 0,
        }
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len == N
    }

    /// The number of elements that can be pushed before the buffer becomes
    /// full.
    #[inline]
    pub fn room(&self) -> usize {
        N - self.len
    }

    /// Append an element. Returns the element back if the buffer is full.
    pub fn push_back(&mut self, x: T) -> Result<(), T> {
        if self.is_full() {
            return Err(x);
        }
        let i = (self.head + self.len) % N;
        debug_assert!(self.slots[i].is_none());
        self.slots[i] = Some(x);
        self.len += 1;
        Ok(())
    }

    /// Prepend an element. Returns the element back if the buffer is full.
    pub fn push_front(&mut self, x: T) -> Result<(), T> {
        if self.is_full() {
            return Err(x);
        }
        self.head = (self.head + N - 1) % N;
        debug_assert!(self.slots[self.head].is_none());
        self.slots[self.head] = Some(x);
        self.len += 1;
        Ok(())
    }

    pub fn pop_front(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let x = self.slots[self.head].take();
        self.head = (self.head + 1) % N;
        self.len -= 1;
        x
    }

    /// Append as many elements of `src` as fit. Returns the number of
    /// elements appended.
    pub fn write(&mut self, src: &[T]) -> usize
    where
        T: Copy,
    {
        let len = src.len().min(self.room());
        for &x in &src[..len] {
            let i = (self.head + self.len) % N;
            self.slots[i] = Some(x);
            self.len += 1;
        }
        len
    }

    /// Move elements from the front into `dst` until either runs out.
    /// Returns the number of elements moved.
    pub fn read(&mut self, dst: &mut [T]) -> usize {
        let mut len = 0;
        for slot in dst.iter_mut() {
            let Some(x) = self.pop_front() else { break };
            *slot = x;
            len += 1;
        }
        len
    }

    pub fn front(&self) -> Option<&T> {
        if self.is_empty() {
            None
        } else {
            self.slots[self.head].as_ref()
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.len).filter_map(move |i| self.slots[(self.head + i) % N].as_ref())
    }
}
