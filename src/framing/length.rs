//! Length-prefixed framing, the usual ISO-8583 transport.

use super::{ByteOrder, FrameStep, Framer, LengthWidth};
use crate::core::FrameError;

/// Frames each payload behind a 2- or 4-byte length header.
///
/// When `includes_header` is set, the declared length counts the header
/// itself; otherwise it counts only the payload.
///
/// Wire format (2-byte, big-endian, header excluded):
/// ```text
/// +--------+--------+------------------+
/// | len hi | len lo |  payload (len)   |
/// +--------+--------+------------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LengthPrefixedFramer {
    width: LengthWidth,
    order: ByteOrder,
    includes_header: bool,
}

impl LengthPrefixedFramer {
    /// Create a length-prefixed framer.
    pub const fn new(width: LengthWidth, order: ByteOrder, includes_header: bool) -> Self {
        Self {
            width,
            order,
            includes_header,
        }
    }

    /// Header width.
    pub fn width(&self) -> LengthWidth {
        self.width
    }

    /// Header byte order.
    pub fn order(&self) -> ByteOrder {
        self.order
    }

    /// Whether the declared length counts the header.
    pub fn includes_header(&self) -> bool {
        self.includes_header
    }

    fn header_overhead(&self) -> usize {
        if self.includes_header {
            self.width.size()
        } else {
            0
        }
    }

    /// Largest payload this framer can encode.
    pub fn max_payload(&self) -> usize {
        self.width.max_value() - self.header_overhead()
    }
}

impl Framer for LengthPrefixedFramer {
    fn frame_for_send(&self, payload: &[u8]) -> Result<Vec<Vec<u8>>, FrameError> {
        if payload.len() > self.max_payload() {
            return Err(FrameError::PayloadTooLarge {
                len: payload.len(),
                max: self.max_payload(),
            });
        }
        let declared = payload.len() + self.header_overhead();
        Ok(vec![
            self.width.encode(declared, self.order),
            payload.to_vec(),
        ])
    }

    fn decode_frame(&self, inbound: &[u8]) -> FrameStep {
        let header = self.width.size();
        let Some(declared) = self.width.decode(inbound, self.order) else {
            return FrameStep::Incomplete;
        };

        let total = if self.includes_header {
            if declared < header {
                return FrameStep::Malformed(FrameError::Malformed(
                    "declared length is smaller than the length header",
                ));
            }
            declared
        } else {
            header + declared
        };

        if inbound.len() < total {
            return FrameStep::Incomplete;
        }

        FrameStep::Complete {
            frame: inbound[header..total].to_vec(),
            consumed: total,
        }
    }
}
