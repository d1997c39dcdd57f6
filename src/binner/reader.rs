//! Whole-record reads from a binner's output stream

use super::record::{BinRecord, RecordLayout};
use std::io::{self, ErrorKind, Read};

/// Reads fixed-width records from a byte stream.
///
/// Each call fills exactly one record. A stream that ends partway through a
/// record, or before one starts, is a clean end of stream.
pub struct RecordReader<R> {
    inner: R,
    layout: RecordLayout,
    buf: Vec<u8>,
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R, layout: RecordLayout) -> Self {
        Self {
            inner,
            layout,
            buf: vec![0u8; layout.record_size()],
        }
    }

    pub fn layout(&self) -> RecordLayout {
        self.layout
    }

    /// Read the next record, or `None` at end of stream
    pub fn next_record(&mut self) -> io::Result<Option<BinRecord>> {
        let mut filled = 0;
        while filled < self.buf.len() {
            match self.inner.read(&mut self.buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if filled < self.buf.len() {
            if filled > 0 {
                tracing::debug!("Discarding {} trailing bytes at end of stream", filled);
            }
            return Ok(None);
        }
        Ok(self.layout.decode(&self.buf))
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}
