//! Streaming compression filter (raw deflate, both directions)
//!
//! Once enabled, every write is compressed with an immediate flush so the
//! peer can decode it without waiting for more input, and every read is
//! inflated into the receive buffer. Both streams use the raw (headerless)
//! deflate format, which is what COMPRESS-style protocol extensions
//! negotiate out-of-band.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

/// Initial capacity of the growable compressed-output buffer; it doubles
/// whenever the compressor fills it.
const INITIAL_OUT_CAPACITY: usize = 32;

pub(crate) struct ZlibFilter {
    deflate: Compress,
    inflate: Decompress,
    /// Compressed output a prior partial write could not flush; must drain
    /// before any new input is compressed.
    pending_out: Vec<u8>,
    /// Compressed input the receive buffer had no room to inflate yet.
    pending_in: Vec<u8>,
}

impl ZlibFilter {
    pub(crate) fn new() -> Self {
        ZlibFilter {
            deflate: Compress::new(Compression::default(), false),
            inflate: Decompress::new(false),
            pending_out: Vec::new(),
            pending_in: Vec::new(),
        }
    }

    /// Compresses `input` with a sync flush, growing the output buffer by
    /// doubling whenever the compressor reports it filled the current
    /// capacity.
    pub(crate) fn compress(&mut self, input: &[u8]) -> Result<Vec<u8>, String> {
        let mut out = Vec::with_capacity(INITIAL_OUT_CAPACITY);
        let mut consumed = 0usize;
        loop {
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(INITIAL_OUT_CAPACITY));
            }
            let in_before = self.deflate.total_in();
            let status = self
                .deflate
                .compress_vec(&input[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|e| e.to_string())?;
            consumed += (self.deflate.total_in() - in_before) as usize;
            if let Status::StreamEnd = status {
                return Err("unexpected end of compression stream".to_string());
            }
            if consumed == input.len() && out.len() < out.capacity() {
                return Ok(out);
            }
        }
    }

    /// Inflates as much of `input` into `out` as fits. Returns
    /// `(consumed, produced)`; unconsumed input must be retained by the
    /// caller via [`set_pending_in`].
    pub(crate) fn decompress(
        &mut self,
        input: &[u8],
        out: &mut [u8],
    ) -> Result<(usize, usize), String> {
        let in_before = self.inflate.total_in();
        let out_before = self.inflate.total_out();
        self.inflate
            .decompress(input, out, FlushDecompress::Sync)
            .map_err(|e| e.to_string())?;
        let consumed = (self.inflate.total_in() - in_before) as usize;
        let produced = (self.inflate.total_out() - out_before) as usize;
        Ok((consumed, produced))
    }

    pub(crate) fn take_pending_out(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending_out)
    }

    pub(crate) fn set_pending_out(&mut self, rest: Vec<u8>) {
        self.pending_out = rest;
    }

    pub(crate) fn take_pending_in(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending_in)
    }

    pub(crate) fn set_pending_in(&mut self, rest: Vec<u8>) {
        self.pending_in = rest;
    }
}
