//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements the length-field framing as a small state machine:
//! - `WaitingForLength`: need the magic bytes plus the 4-byte total length
//! - `WaitingForFrame`: length known, need the rest of the frame
//!
//! Emitted frames start at the length field; the magic is stripped.
//!
//! # Example
//!
//! ```ignore
//! use rpcwire::protocol::FrameBuffer;
//!
//! let mut buffer = FrameBuffer::new();
//!
//! // Data arrives in chunks from socket
//! for frame in buffer.push(&chunk)? {
//!     let message = codec.decode(frame)?;
//! }
//! ```

use bytes::{Bytes, BytesMut};

use super::wire_format::{DEFAULT_MAX_FRAME_SIZE, LENGTH_FIELD_SIZE, MAGIC_CODE, MIN_FRAME_SIZE};
use crate::error::CodecError;

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for magic + length field.
    WaitingForLength,
    /// Length parsed (counted from the length field), waiting for the frame.
    WaitingForFrame { length: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Expected leading bytes of every frame, may be empty.
    magic: Vec<u8>,
    /// Maximum allowed total length.
    max_frame_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with the default magic and 16 MiB limit.
    pub fn new() -> Self {
        Self::with_config(&MAGIC_CODE, DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a frame buffer for a dialect with its own magic and size limit.
    pub fn with_config(magic: &[u8], max_frame_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForLength,
            magic: magic.to_vec(),
            max_frame_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data is kept for the next push.
    ///
    /// # Errors
    ///
    /// Returns a format error on a magic mismatch or an out-of-range length.
    /// The stream cannot be resynchronised after that.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>, CodecError> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Bytes>, CodecError> {
        match self.state {
            State::WaitingForLength => {
                let prefix = self.magic.len() + LENGTH_FIELD_SIZE;
                if self.buffer.len() < prefix {
                    return Ok(None);
                }

                let magic_len = self.magic.len();
                if self.buffer[..magic_len] != self.magic[..] {
                    return Err(CodecError::format(format!(
                        "bad magic {:02X?}, expected {:02X?}",
                        &self.buffer[..magic_len],
                        self.magic
                    )));
                }

                let mut raw = [0u8; LENGTH_FIELD_SIZE];
                raw.copy_from_slice(&self.buffer[magic_len..prefix]);
                let length = u32::from_be_bytes(raw);

                if length < MIN_FRAME_SIZE || length > self.max_frame_size {
                    return Err(CodecError::format(format!(
                        "frame length {} out of range [{}, {}]",
                        length, MIN_FRAME_SIZE, self.max_frame_size
                    )));
                }

                let _ = self.buffer.split_to(magic_len);
                self.state = State::WaitingForFrame {
                    length: length as usize,
                };
                self.try_extract_one()
            }

            State::WaitingForFrame { length } => {
                if self.buffer.len() < length {
                    return Ok(None);
                }

                let frame = self.buffer.split_to(length).freeze();
                self.state = State::WaitingForLength;
                Ok(Some(frame))
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForLength;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForLength => "WaitingForLength",
            State::WaitingForFrame { .. } => "WaitingForFrame",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
