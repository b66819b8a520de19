//! COBS framing over the raw byte stream
//!
//! Frames are delimited by zero bytes on both sides. Consecutive delimiters
//! (idle line, keep-alives) produce empty segments, which are skipped.

/// Encodes one frame for the wire, including both delimiters
pub(crate) fn encode_frame(frame: &[u8]) -> Vec<u8> {
    let encoded = cobs::encode_vec(frame);
    let mut wire = Vec::with_capacity(encoded.len() + 2);
    wire.push(0);
    wire.extend_from_slice(&encoded);
    wire.push(0);
    wire
}

/// Splits the inbound byte stream back into frames
///
/// Stateful: bytes of one frame may arrive across any number of reads.
#[derive(Debug, Default)]
pub(crate) struct Deframer {
    pending: Vec<u8>,
}

impl Deframer {
    pub fn new() -> Self {
        Deframer::default()
    }

    /// Feeds received bytes, returning every completed frame (COBS-decoded)
    ///
    /// Segments that fail COBS decoding are returned as `Err` markers so the
    /// caller can count them.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<Vec<u8>, ()>> {
        let mut frames = Vec::new();
        for &byte in bytes {
            if byte == 0 {
                if !self.pending.is_empty() {
                    let segment = core::mem::take(&mut self.pending);
                    frames.push(cobs::decode_vec(&segment).map_err(|_| ()));
                }
            } else {
                self.pending.push(byte);
            }
        }
        frames
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip_across_split_reads() {
        let frame = vec![0u8, 1, 2, 0, 3, 255];
        let wire = encode_frame(&frame);

        let mut deframer = Deframer::new();
        let (first, second) = wire.split_at(wire.len() / 2);
        assert!(deframer.feed(first).is_empty());
        let frames = deframer.feed(second);
        assert_eq!(frames, vec![Ok(frame)]);
    }

    #[test]
    fn idle_line_produces_nothing() {
        let mut deframer = Deframer::new();
        assert!(deframer.feed(&[0, 0, 0, 0]).is_empty());
    }

    #[test]
    fn two_frames_in_one_read() {
        let mut wire = encode_frame(&[1, 2, 3]);
        wire.extend_from_slice(&encode_frame(&[4, 5]));
        let mut deframer = Deframer::new();
        let frames = deframer.feed(&wire);
        assert_eq!(frames, vec![Ok(vec![1, 2, 3]), Ok(vec![4, 5])]);
    }
}
