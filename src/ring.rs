//! Forensic ring buffer
//!
//! Fixed-capacity circular log of the most recent raw request payloads.
//! When the SUT stops responding, the supervisor dumps this buffer to a
//! crash artifact so the offending input sequence can be replayed offline.

use std::io::Write;
use std::path::Path;

use crate::error::Result;

/// Default number of requests retained between crashes
pub const DEFAULT_CAPACITY: usize = 128;

/// Circular overwrite log. Oldest entry is evicted first once full; a dump
/// always yields entries in insertion order regardless of slot layout.
///
/// Not internally synchronized. The supervisor wraps it in the mutex shared
/// with its crash path, so dumps see a snapshot uncontaminated by pushes.
#[derive(Debug)]
pub struct RingBuffer {
    capacity: usize,
    items: Vec<Vec<u8>>,
    tail: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            capacity,
            items: Vec::with_capacity(capacity),
            tail: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Append below capacity; overwrite the rotating tail slot once full.
    pub fn push(&mut self, data: Vec<u8>) {
        if self.items.len() < self.capacity {
            self.items.push(data);
        } else {
            self.items[self.tail] = data;
        }
        self.tail = (self.tail + 1) % self.capacity;
    }

    /// Stored items, oldest first. When not yet full the physical order is
    /// the logical order; when full the oldest surviving item sits at the
    /// current tail.
    pub fn iter_ordered(&self) -> impl Iterator<Item = &[u8]> {
        let start = if self.items.len() < self.capacity {
            0
        } else {
            self.tail
        };
        (0..self.items.len()).map(move |i| {
            let idx = (start + i) % self.capacity;
            self.items[idx].as_slice()
        })
    }

    /// Write all retained payloads to `path`, oldest first.
    pub fn dump(&self, path: &Path) -> Result<()> {
        let mut file = std::fs::File::create(path)?;
        for item in self.iter_ordered() {
            file.write_all(item)?;
        }
        file.flush()?;
        Ok(())
    }
}
