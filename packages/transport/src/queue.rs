//! Ordered write queue with partial-write resumption
//!
//! Chunks are flushed strictly in enqueue order. The head chunk carries a
//! progress offset so a partial write resumes exactly where the transport
//! stopped. Owned payloads (`Bytes::from(Vec)`) enter without copying;
//! borrowed payloads are copied into the chunk at enqueue time.

use std::collections::VecDeque;

use bytes::Bytes;

#[derive(Default)]
pub(crate) struct WriteQueue {
    chunks: VecDeque<Bytes>,
    /// Bytes of the head chunk already handed to the transport.
    head_sent: usize,
}

impl WriteQueue {
    pub(crate) fn new() -> Self {
        WriteQueue::default()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.chunks.len()
    }

    pub(crate) fn push_owned(&mut self, data: Vec<u8>) {
        self.chunks.push_back(Bytes::from(data));
    }

    pub(crate) fn push_copied(&mut self, data: &[u8]) {
        self.chunks.push_back(Bytes::copy_from_slice(data));
    }

    /// The head chunk and its progress offset; the chunk handle is cheap to
    /// clone and stays valid while the queue is mutated.
    pub(crate) fn head(&self) -> Option<(Bytes, usize)> {
        self.chunks.front().map(|c| (c.clone(), self.head_sent))
    }

    /// Records `n` more bytes of the head chunk as sent, disposing of it
    /// once fully written.
    pub(crate) fn advance_head(&mut self, n: usize) {
        self.head_sent += n;
        let done = match self.chunks.front() {
            Some(c) => self.head_sent >= c.len(),
            None => false,
        };
        if done {
            self.chunks.pop_front();
            self.head_sent = 0;
        }
    }

    /// Sets the progress offset of a freshly queued head chunk after an
    /// immediate partial write.
    pub(crate) fn set_head_sent(&mut self, n: usize) {
        debug_assert!(self.chunks.len() == 1);
        self.head_sent = n;
    }

    /// Drops every queued chunk unconditionally.
    pub(crate) fn clear(&mut self) {
        self.chunks.clear();
        self.head_sent = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_drain_in_order() {
        let mut q = WriteQueue::new();
        q.push_copied(b"one");
        q.push_owned(b"two".to_vec());
        q.push_copied(b"three");

        let mut drained = Vec::new();
        while let Some((chunk, sent)) = q.head() {
            drained.extend_from_slice(&chunk[sent..]);
            q.advance_head(chunk.len() - sent);
        }
        assert_eq!(drained, b"onetwothree");
        assert!(q.is_empty());
    }

    #[test]
    fn partial_progress_resumes_on_head() {
        let mut q = WriteQueue::new();
        q.push_copied(b"abcdef");
        q.set_head_sent(2);
        let (chunk, sent) = q.head().expect("head present");
        assert_eq!(&chunk[sent..], b"cdef");
        q.advance_head(3);
        let (chunk, sent) = q.head().expect("still incomplete");
        assert_eq!(&chunk[sent..], b"f");
        q.advance_head(1);
        assert!(q.is_empty());
        assert_eq!(q.head_sent, 0);
    }

    #[test]
    fn clear_disposes_everything() {
        let mut q = WriteQueue::new();
        q.push_copied(b"a");
        q.push_owned(vec![b'b'; 128]);
        q.clear();
        assert!(q.is_empty());
        assert_eq!(q.len(), 0);
        assert!(q.head().is_none());
    }
}
