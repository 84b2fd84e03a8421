//! NUL-delimited frame reassembly.
//!
//! The wire protocol separates messages with a single `\0` byte.  Reads
//! from the socket arrive in arbitrarily sized chunks, so the buffer
//! accumulates bytes and yields only complete frames, keeping the trailing
//! remainder around for the next chunk.

/// The frame delimiter on the wire.
pub const DELIMITER: u8 = 0;

/// Reassembles NUL-delimited frames from arbitrarily chunked reads.
///
/// Frames are yielded in arrival order and never contain the delimiter.
/// Partial trailing data is retained across calls to [`FrameBuffer::push`];
/// nothing is ever dropped.  Frames are raw bytes rather than strings so
/// that a multi-byte character split across two reads cannot corrupt a
/// frame; UTF-8 validation happens when the frame is decoded.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every frame it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Frames<'_> {
        self.buf.extend_from_slice(chunk);
        Frames { buf: &mut self.buf }
    }

    /// Bytes buffered past the last complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Draining iterator over the complete frames currently buffered.
///
/// Returned by [`FrameBuffer::push`]; frames left unconsumed stay in the
/// buffer and reappear on the next push.
pub struct Frames<'a> {
    buf: &'a mut Vec<u8>,
}

impl Iterator for Frames<'_> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        let end = self.buf.iter().position(|&b| b == DELIMITER)?;
        let mut frame: Vec<u8> = self.buf.drain(..=end).collect();
        frame.pop();
        Some(frame)
    }
}
