//! Outbound byte accumulation for a connection.
//!
//! The [`OutputBuffer`] keeps the segments a connection has accepted but not yet
//! flushed, in write order, together with their total size. Segments stay in the
//! buffer while a flush of them is in flight; they are removed only once the
//! socket reports them written, so an empty buffer always means "nothing left to
//! send".

use bytes::{Buf, Bytes};
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct OutputBuffer {
    segments: VecDeque<Bytes>,
    size: usize,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a segment. Empty segments are ignored.
    pub fn push(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.size += bytes.len();
        self.segments.push_back(bytes);
    }

    /// Total number of queued bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Number of queued segments.
    #[inline]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Returns cheap clones of every queued segment, front first.
    pub fn snapshot(&self) -> Vec<Bytes> {
        self.segments.iter().cloned().collect()
    }

    /// Removes `count` bytes from the front of the buffer.
    ///
    /// Advancing past the end empties the buffer.
    pub fn advance(&mut self, mut count: usize) {
        while count > 0 {
            let Some(front) = self.segments.front_mut() else {
                break;
            };

            if front.len() <= count {
                count -= front.len();
                self.size -= front.len();
                self.segments.pop_front();
            } else {
                front.advance(count);
                self.size -= count;
                count = 0;
            }
        }
    }

    /// Drops everything that is queued.
    pub fn clear(&mut self) {
        self.segments.clear();
        self.size = 0;
    }
}
