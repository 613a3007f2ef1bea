//! TPDU + length framing, common for ISO-8583 over TCP.

use super::{ByteOrder, FrameStep, Framer, LengthWidth};
use crate::core::FrameError;

/// Length header followed by a fixed TPDU, then the payload.
///
/// The length counts only the payload.
///
/// ```text
/// +-------------+----------------+------------------+
/// | len (2 / 4) | TPDU (N bytes) |  payload (len)   |
/// +-------------+----------------+------------------+
/// ```
///
/// Inbound frames whose TPDU differs from the configured one are reported
/// as malformed without consuming any input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpduFramer {
    tpdu: Vec<u8>,
    width: LengthWidth,
    order: ByteOrder,
}

impl TpduFramer {
    /// Create a TPDU framer. `tpdu` must be non-empty.
    pub fn new(
        tpdu: impl Into<Vec<u8>>,
        width: LengthWidth,
        order: ByteOrder,
    ) -> Result<Self, FrameError> {
        let tpdu = tpdu.into();
        if tpdu.is_empty() {
            return Err(FrameError::InvalidParameters("TPDU must not be empty"));
        }
        Ok(Self { tpdu, width, order })
    }

    /// Configured TPDU bytes.
    pub fn tpdu(&self) -> &[u8] {
        &self.tpdu
    }

    fn prefix_len(&self) -> usize {
        self.width.size() + self.tpdu.len()
    }
}

impl Framer for TpduFramer {
    fn frame_for_send(&self, payload: &[u8]) -> Result<Vec<Vec<u8>>, FrameError> {
        let max = self.width.max_value();
        if payload.len() > max {
            return Err(FrameError::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }
        let mut header = self.width.encode(payload.len(), self.order);
        header.extend_from_slice(&self.tpdu);
        Ok(vec![header, payload.to_vec()])
    }

    fn decode_frame(&self, inbound: &[u8]) -> FrameStep {
        let prefix = self.prefix_len();
        if inbound.len() < prefix {
            return FrameStep::Incomplete;
        }
        let Some(body_len) = self.width.decode(inbound, self.order) else {
            return FrameStep::Incomplete;
        };
        if inbound[self.width.size()..prefix] != self.tpdu[..] {
            return FrameStep::Malformed(FrameError::Malformed("TPDU mismatch"));
        }

        let total = prefix + body_len;
        if inbound.len() < total {
            return FrameStep::Incomplete;
        }
        FrameStep::Complete {
            frame: inbound[prefix..total].to_vec(),
            consumed: total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::join_segments;

    const TPDU: [u8; 5] = [0x60, 0x00, 0x03, 0x00, 0x00];

    fn framer() -> TpduFramer {
        TpduFramer::new(TPDU, LengthWidth::Two, ByteOrder::BigEndian).unwrap()
    }

    #[test]
    fn test_empty_tpdu_rejected() {
        assert!(TpduFramer::new(Vec::new(), LengthWidth::Two, ByteOrder::BigEndian).is_err());
    }

    #[test]
    fn test_wire_layout() {
        let wire = join_segments(&framer().frame_for_send(&[0x08, 0x00]).unwrap());
        assert_eq!(hex::encode(&wire), "000260000300000800");
    }

    #[test]
    fn test_roundtrip_sizes() {
        let small = framer();
        let large = TpduFramer::new(TPDU, LengthWidth::Four, ByteOrder::LittleEndian).unwrap();
        for (framer, size) in [(&small, 0usize), (&small, 1), (&large, 70_000)] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 13) as u8).collect();
            let wire = join_segments(&framer.frame_for_send(&payload).unwrap());
            let decoded = framer.try_decode(&wire);
            assert_eq!(decoded.frames, vec![payload]);
            assert_eq!(decoded.consumed, wire.len());
        }
    }

    #[test]
    fn test_tpdu_mismatch_rejected_without_consuming() {
        let framer = framer();
        let other = TpduFramer::new([0x60, 0x00, 0x04, 0x00, 0x00], LengthWidth::Two, ByteOrder::BigEndian)
            .unwrap();
        let wire = join_segments(&other.frame_for_send(b"payload").unwrap());
        let snapshot = wire.clone();

        let decoded = framer.try_decode(&wire);
        assert!(decoded.is_empty());
        assert_eq!(decoded.consumed, 0);
        assert_eq!(decoded.error, Some(FrameError::Malformed("TPDU mismatch")));
        assert_eq!(wire, snapshot);
    }

    #[test]
    fn test_partial_input_consumes_nothing() {
        let framer = framer();
        let wire = join_segments(&framer.frame_for_send(b"hello").unwrap());
        for cut in 0..wire.len() {
            let decoded = framer.try_decode(&wire[..cut]);
            assert!(decoded.is_empty(), "cut {cut}");
            assert_eq!(decoded.consumed, 0);
            assert!(decoded.error.is_none());
        }
    }
}
