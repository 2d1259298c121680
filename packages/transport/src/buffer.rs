//! Fixed-capacity read buffer with offset/length/scan-cursor bookkeeping
//!
//! The buffer holds bytes received from the transport until the protocol
//! layer consumes them, either as raw byte runs or as newline-terminated
//! lines. A memoized scan cursor guarantees that bytes are scanned for a
//! newline at most once across repeated `read_line` calls.

/// Capacity of the per-channel receive buffer. Running out of space with no
/// line delimiter in sight is a protocol error, not a resize trigger.
pub const READ_BUFFER_SIZE: usize = 100_000;

pub(crate) struct ReadBuffer {
    buf: Box<[u8]>,
    /// Start of the valid region.
    offset: usize,
    /// Length of the valid region.
    len: usize,
    /// How far into the valid region the newline scan has already looked.
    scan: usize,
}

impl ReadBuffer {
    pub(crate) fn new() -> Self {
        ReadBuffer {
            buf: vec![0u8; READ_BUFFER_SIZE].into_boxed_slice(),
            offset: 0,
            len: 0,
            scan: 0,
        }
    }

    fn check(&self) {
        debug_assert!(self.offset + self.len <= self.buf.len());
        debug_assert!(self.scan <= self.len);
    }

    /// Number of bytes the free tail can still absorb.
    pub(crate) fn free_len(&self) -> usize {
        self.buf.len() - self.offset - self.len
    }

    /// The writable region after the valid bytes. Pair with [`commit`].
    pub(crate) fn free_tail(&mut self) -> &mut [u8] {
        let start = self.offset + self.len;
        &mut self.buf[start..]
    }

    /// Marks `n` bytes of the free tail as valid received data.
    pub(crate) fn commit(&mut self, n: usize) {
        self.len += n;
        self.check();
    }

    pub(crate) fn available(&self) -> usize {
        self.len
    }

    /// Copies up to `out.len()` bytes into `out` and consumes them.
    pub(crate) fn read(&mut self, out: &mut [u8]) -> usize {
        let n = self.len.min(out.len());
        out[..n].copy_from_slice(&self.buf[self.offset..self.offset + n]);
        self.len -= n;
        if self.len == 0 {
            // Drained; restart at the front so the tail region is maximal.
            self.offset = 0;
        } else {
            self.offset += n;
        }
        self.scan = self.scan.saturating_sub(n);
        self.check();
        n
    }

    /// Extracts the next newline-terminated line, with the trailing `\n` and
    /// one preceding `\r` stripped.
    ///
    /// Returns `None` when no complete line is buffered yet; in that case the
    /// scan position is memoized, and if the buffer has grown to capacity the
    /// valid bytes are compacted to the front to make room for more input.
    pub(crate) fn read_line(&mut self) -> Option<&[u8]> {
        let start = self.offset + self.scan;
        let end = self.offset + self.len;
        match self.buf[start..end].iter().position(|&b| b == b'\n') {
            None => {
                self.scan = self.len;
                if self.offset + self.len == self.buf.len() && self.offset > 0 {
                    self.buf.copy_within(self.offset..end, 0);
                    self.offset = 0;
                }
                self.check();
                None
            }
            Some(i) => {
                let nl = start + i;
                let line_start = self.offset;
                let consumed = nl + 1 - self.offset;
                self.offset += consumed;
                self.len -= consumed;
                self.scan = 0;
                self.check();
                let mut line_end = nl;
                if line_end > line_start && self.buf[line_end - 1] == b'\r' {
                    line_end -= 1;
                }
                Some(&self.buf[line_start..line_end])
            }
        }
    }

    #[cfg(test)]
    fn feed(&mut self, data: &[u8]) {
        let tail = self.free_tail();
        tail[..data.len()].copy_from_slice(data);
        self.commit(data.len());
    }
}
