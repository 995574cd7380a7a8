//! Fixed-capacity sample history.

use std::collections::VecDeque;

use anyhow::{Result, bail};

/// Keeps the `capacity` most recent samples, newest first.
///
/// # Example
///
/// ```
/// use fancontrold::ring_buffer::RingBuffer;
///
/// let mut history = RingBuffer::new(3)?;
/// for t in [10, 20, 30, 40] {
///     history.push(t);
/// }
/// assert_eq!(history.iter().copied().collect::<Vec<_>>(), vec![40, 30, 20]);
/// assert_eq!(history.oldest(), Some(&20));
/// # Ok::<(), anyhow::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    samples: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Creates an empty buffer.
    ///
    /// # Errors
    ///
    /// A zero capacity is rejected.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            bail!("Ring buffer capacity must be positive");
        }
        Ok(Self {
            samples: VecDeque::new(),
            capacity,
        })
    }

    /// Inserts a sample, evicting the oldest one when full.
    pub fn push(&mut self, value: T) {
        if self.samples.len() == self.capacity {
            self.samples.pop_back();
        }
        self.samples.push_front(value);
    }

    pub fn newest(&self) -> Option<&T> {
        self.samples.front()
    }

    /// Oldest retained sample.
    pub fn oldest(&self) -> Option<&T> {
        self.samples.back()
    }

    /// Samples from newest to oldest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.samples.iter()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

impl RingBuffer<f64> {
    /// Arithmetic mean of the retained samples.
    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }
}
