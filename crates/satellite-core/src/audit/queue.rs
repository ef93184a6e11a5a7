//! Segments waiting to be audited.

use std::collections::VecDeque;

use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct Queue {
    paths: Mutex<VecDeque<String>>,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the queue contents with a fresh sample.
    pub fn swap(&self, paths: Vec<String>) {
        *self.paths.lock() = paths.into();
    }

    pub fn next(&self) -> Option<String> {
        self.paths.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.paths.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.lock().is_empty()
    }
}
