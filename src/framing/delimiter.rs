//! Sentinel-terminated framing (e.g. newline protocols).

use super::{FrameStep, Framer};
use crate::core::FrameError;

/// Each payload is followed by a single delimiter byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelimiterFramer {
    delimiter: u8,
}

impl DelimiterFramer {
    /// Create a delimiter framer.
    pub const fn new(delimiter: u8) -> Self {
        Self { delimiter }
    }

    /// The sentinel byte.
    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }
}

impl Framer for DelimiterFramer {
    fn frame_for_send(&self, payload: &[u8]) -> Result<Vec<Vec<u8>>, FrameError> {
        if payload.contains(&self.delimiter) {
            return Err(FrameError::DelimiterInPayload(self.delimiter));
        }
        let mut framed = Vec::with_capacity(payload.len() + 1);
        framed.extend_from_slice(payload);
        framed.push(self.delimiter);
        Ok(vec![framed])
    }

    fn decode_frame(&self, inbound: &[u8]) -> FrameStep {
        match inbound.iter().position(|&b| b == self.delimiter) {
            Some(end) => FrameStep::Complete {
                frame: inbound[..end].to_vec(),
                consumed: end + 1,
            },
            None => FrameStep::Incomplete,
        }
    }
}
