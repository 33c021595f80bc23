//! Integer handle allocation for backend-held objects.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Maps integer handles to objects, always reusing the lowest freed handle.
#[derive(Debug)]
pub struct HandleAllocator<T> {
    next: usize,
    freed: BinaryHeap<Reverse<usize>>,
    live: HashMap<usize, T>,
}

impl<T> Default for HandleAllocator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleAllocator<T> {
    pub fn new() -> Self {
        Self {
            next: 0,
            freed: BinaryHeap::new(),
            live: HashMap::new(),
        }
    }

    /// Store `obj` under the lowest available handle
    pub fn add(&mut self, obj: T) -> usize {
        let handle = match self.freed.pop() {
            Some(Reverse(h)) => h,
            None => {
                let h = self.next;
                self.next += 1;
                h
            }
        };
        self.live.insert(handle, obj);
        handle
    }

    pub fn get(&self, handle: usize) -> Option<&T> {
        self.live.get(&handle)
    }

    pub fn get_mut(&mut self, handle: usize) -> Option<&mut T> {
        self.live.get_mut(&handle)
    }

    /// Release a handle. Unknown handles are ignored.
    pub fn remove(&mut self, handle: usize) -> Option<T> {
        let obj = self.live.remove(&handle)?;
        self.freed.push(Reverse(handle));
        Some(obj)
    }

    pub fn reset(&mut self) {
        self.next = 0;
        self.freed.clear();
        self.live.clear();
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Live handles in ascending order
    pub fn live_handles(&self) -> Vec<usize> {
        let mut handles: Vec<usize> = self.live.keys().copied().collect();
        handles.sort_unstable();
        handles
    }
}
