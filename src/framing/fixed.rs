//! Fixed-size framing.

use super::{FrameStep, Framer};
use crate::core::FrameError;

/// Every frame is exactly `size` bytes, no header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedFramer {
    size: usize,
}

impl FixedFramer {
    /// Create a fixed-size framer. `size` must be non-zero.
    pub fn new(size: usize) -> Result<Self, FrameError> {
        if size == 0 {
            return Err(FrameError::InvalidParameters("fixed frame size must be > 0"));
        }
        Ok(Self { size })
    }

    /// Frame size.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Framer for FixedFramer {
    fn frame_for_send(&self, payload: &[u8]) -> Result<Vec<Vec<u8>>, FrameError> {
        if payload.len() != self.size {
            return Err(FrameError::SizeMismatch {
                expected: self.size,
                actual: payload.len(),
            });
        }
        Ok(vec![payload.to_vec()])
    }

    fn decode_frame(&self, inbound: &[u8]) -> FrameStep {
        if inbound.len() < self.size {
            return FrameStep::Incomplete;
        }
        FrameStep::Complete {
            frame: inbound[..self.size].to_vec(),
            consumed: self.size,
        }
    }

    fn expected_bytes_for_next_frame(&self) -> Option<usize> {
        Some(self.size)
    }
}
