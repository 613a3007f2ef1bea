//! Framing layer.
//!
//! A [`Framer`] turns an outbound payload into ordered wire segments and
//! incrementally carves complete frames out of an inbound byte stream. Four
//! strategies are provided:
//!
//! - [`LengthPrefixedFramer`]: 2- or 4-byte length header (the ISO-8583 norm)
//! - [`TpduFramer`]: length header followed by a fixed TPDU
//! - [`DelimiterFramer`]: payload terminated by a sentinel byte
//! - [`FixedFramer`]: exactly N bytes per frame
//!
//! Decoding never mutates its input. When not enough bytes are available the
//! result carries no frames and zero consumed bytes, so the caller can append
//! more data and call again.
//!
//! ```text
//!   inbound: [ frame 0 ][ frame 1 ][ partial ...
//!            └──────── consumed ───┘
//! ```

mod delimiter;
mod fixed;
mod length;
mod tpdu;

use std::fmt;

use crate::core::FrameError;

pub use delimiter::DelimiterFramer;
pub use fixed::FixedFramer;
pub use length::LengthPrefixedFramer;
pub use tpdu::TpduFramer;

/// Outcome of decoding a single frame from the front of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameStep {
    /// A complete frame was found.
    Complete {
        /// Frame payload (header and trailer stripped).
        frame: Vec<u8>,
        /// Bytes of input it occupied. Always non-zero.
        consumed: usize,
    },
    /// More bytes are needed.
    Incomplete,
    /// The front of the buffer can never become a valid frame.
    Malformed(FrameError),
}

/// Result of [`Framer::try_decode`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decoded {
    /// Complete frames, in stream order.
    pub frames: Vec<Vec<u8>>,
    /// Bytes consumed by `frames`.
    pub consumed: usize,
    /// Set when decoding stopped at bytes that cannot form a frame.
    ///
    /// Those bytes are not counted in `consumed`; treating them is a
    /// protocol-level decision left to the caller.
    pub error: Option<FrameError>,
}

impl Decoded {
    /// Whether no frame was produced.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Converts payloads to wire segments and back.
///
/// Implementations are stateless and shared between the client and its
/// engine.
pub trait Framer: Send + Sync + fmt::Debug {
    /// Encode `payload` into ordered wire segments.
    fn frame_for_send(&self, payload: &[u8]) -> Result<Vec<Vec<u8>>, FrameError>;

    /// Decode at most one frame from the front of `inbound`.
    fn decode_frame(&self, inbound: &[u8]) -> FrameStep;

    /// Decode every complete frame at the front of `inbound`.
    fn try_decode(&self, inbound: &[u8]) -> Decoded {
        let mut decoded = Decoded::default();
        loop {
            match self.decode_frame(&inbound[decoded.consumed..]) {
                FrameStep::Complete { frame, consumed } => {
                    decoded.frames.push(frame);
                    decoded.consumed += consumed;
                }
                FrameStep::Incomplete => break,
                FrameStep::Malformed(error) => {
                    decoded.error = Some(error);
                    break;
                }
            }
        }
        decoded
    }

    /// Bytes the next frame needs, when known up front.
    fn expected_bytes_for_next_frame(&self) -> Option<usize> {
        None
    }
}

/// Byte order of a length header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    /// Network byte order.
    #[default]
    BigEndian,
    /// Least significant byte first.
    LittleEndian,
}

/// Width of a length header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LengthWidth {
    /// 2-byte header, lengths up to 65535.
    #[default]
    Two,
    /// 4-byte header, lengths up to `u32::MAX`.
    Four,
}

impl LengthWidth {
    /// Header size in bytes.
    pub const fn size(self) -> usize {
        match self {
            LengthWidth::Two => 2,
            LengthWidth::Four => 4,
        }
    }

    /// Largest value the header can carry.
    pub const fn max_value(self) -> usize {
        match self {
            LengthWidth::Two => u16::MAX as usize,
            LengthWidth::Four => u32::MAX as usize,
        }
    }

    /// Encode `value`. Callers check `value <= max_value()` first.
    pub(crate) fn encode(self, value: usize, order: ByteOrder) -> Vec<u8> {
        match (self, order) {
            (LengthWidth::Two, ByteOrder::BigEndian) => (value as u16).to_be_bytes().to_vec(),
            (LengthWidth::Two, ByteOrder::LittleEndian) => (value as u16).to_le_bytes().to_vec(),
            (LengthWidth::Four, ByteOrder::BigEndian) => (value as u32).to_be_bytes().to_vec(),
            (LengthWidth::Four, ByteOrder::LittleEndian) => (value as u32).to_le_bytes().to_vec(),
        }
    }

    /// Decode a header from the first `size()` bytes of `bytes`.
    pub(crate) fn decode(self, bytes: &[u8], order: ByteOrder) -> Option<usize> {
        match self {
            LengthWidth::Two => {
                let raw: [u8; 2] = bytes.get(..2)?.try_into().ok()?;
                Some(match order {
                    ByteOrder::BigEndian => u16::from_be_bytes(raw),
                    ByteOrder::LittleEndian => u16::from_le_bytes(raw),
                } as usize)
            }
            LengthWidth::Four => {
                let raw: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
                Some(match order {
                    ByteOrder::BigEndian => u32::from_be_bytes(raw),
                    ByteOrder::LittleEndian => u32::from_le_bytes(raw),
                } as usize)
            }
        }
    }
}

/// Concatenate wire segments, as a peer would see them.
pub fn join_segments(segments: &[Vec<u8>]) -> Vec<u8> {
    segments.concat()
}
