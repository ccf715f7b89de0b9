//! Reassembly buffer for accumulating partial reads.
//!
//! Bytes arrive from the transport in arbitrary chunks: a frame may be
//! split across many reads, and one read may carry several frames. The
//! buffer holds zero or more complete frames followed by at most one
//! partial frame. Bytes are discarded from the front only once the whole
//! frame they belong to is present, so a partial header or body is never
//! consumed and never re-read.

use bytes::{Buf, BytesMut};
use std::io::{self, Read};

use super::codec::{read_length, Frame, HEADER_LEN};
use crate::error::{Result, RpcError};

/// Default initial capacity.
const DEFAULT_CAPACITY: usize = 4 * 1024;

/// What the buffer is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// Fewer than four bytes buffered.
    AwaitingHeader,
    /// Header present, `missing` body bytes still to arrive.
    AwaitingBody { length: u32, missing: usize },
    /// At least one complete frame is buffered.
    FrameReady,
}

/// Accumulates raw bytes and yields complete frames in arrival order.
#[derive(Debug)]
pub struct ReassemblyBuffer {
    buf: BytesMut,
    max_frame_size: u32,
}

impl ReassemblyBuffer {
    /// Create a buffer that rejects bodies longer than `max_frame_size`.
    pub fn new(max_frame_size: u32) -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, max_frame_size)
    }

    pub fn with_capacity(capacity: usize, max_frame_size: u32) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            max_frame_size,
        }
    }

    /// Append newly received bytes to the tail.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Issue one `read` of up to `chunk` bytes directly into the tail.
    ///
    /// Returns the byte count from the reader; 0 means end of stream.
    pub fn read_from<R: Read>(&mut self, reader: &mut R, chunk: usize) -> io::Result<usize> {
        let start = self.buf.len();
        self.buf.resize(start + chunk, 0);

        match reader.read(&mut self.buf[start..]) {
            Ok(n) => {
                self.buf.truncate(start + n);
                Ok(n)
            }
            Err(e) => {
                self.buf.truncate(start);
                Err(e)
            }
        }
    }

    /// Cut the next complete frame off the front, if one is present.
    ///
    /// A header announcing more than `max_frame_size` bytes is an error;
    /// the connection cannot be resynchronised after it.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(length) = self.peek_length() else {
            return Ok(None);
        };

        if length > self.max_frame_size {
            return Err(RpcError::FrameTooLarge {
                length: u64::from(length),
                max: self.max_frame_size,
            });
        }

        let total = HEADER_LEN + length as usize;
        if self.buf.len() < total {
            return Ok(None);
        }

        let mut raw = self.buf.split_to(total);
        raw.advance(HEADER_LEN);

        Ok(Some(Frame {
            length,
            body: raw.freeze(),
        }))
    }

    /// Iterate over every complete frame currently buffered.
    pub fn frames(&mut self) -> Frames<'_> {
        Frames {
            buffer: self,
            failed: false,
        }
    }

    /// Current reassembly state.
    pub fn state(&self) -> ReadState {
        match self.peek_length() {
            None => ReadState::AwaitingHeader,
            Some(length) => {
                let have = self.buf.len() - HEADER_LEN;
                if have >= length as usize {
                    ReadState::FrameReady
                } else {
                    ReadState::AwaitingBody {
                        length,
                        missing: length as usize - have,
                    }
                }
            }
        }
    }

    /// Called at end of stream: leftover bytes mean the peer cut a frame short.
    pub fn finish(&self) -> Result<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(RpcError::Truncated {
                buffered: self.buf.len(),
            })
        }
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn peek_length(&self) -> Option<u32> {
        self.buf.first_chunk::<HEADER_LEN>().map(read_length)
    }
}

/// Iterator returned by [`ReassemblyBuffer::frames`].
///
/// Stops at the first incomplete frame, or after yielding one error.
pub struct Frames<'a> {
    buffer: &'a mut ReassemblyBuffer,
    failed: bool,
}

impl Iterator for Frames<'_> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let next = self.buffer.next_frame().transpose();
        self.failed = matches!(next, Some(Err(_)));
        next
    }
}
