use super::utils::{SML_ESCAPE, SML_END_MARKER, SML_VERSION_1};
use log::{debug, warn};

/// Upper bound for buffered bytes that did not turn into a frame yet.
pub const MAX_BUFFER_SIZE: usize = 16 * 1024;

const START_SEQUENCE_LEN: usize = 8;
const END_SEQUENCE_LEN: usize = 8;

/// Cuts complete SML transport frames out of a byte stream.
///
/// Bytes are fed with [`FrameAssembler::add`] in whatever chunks the serial
/// port delivers them. [`FrameAssembler::next_frame`] hands out one complete
/// frame at a time (start sequence up to and including the CRC) and keeps a
/// trailing partial frame for the next chunk. The checksum is not verified
/// here, that is up to the decoder.
#[derive(Debug)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
    max_size: usize,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::with_limit(MAX_BUFFER_SIZE)
    }

    pub fn with_limit(max_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_size: max_size.max(START_SEQUENCE_LEN + END_SEQUENCE_LEN),
        }
    }

    pub fn add(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);

        if self.buffer.len() > self.max_size {
            let excess = self.buffer.len() - self.max_size;
            warn!("SML buffer exceeds {} bytes, dropping the oldest {} bytes", self.max_size, excess);
            self.buffer.drain(..excess);
        }
    }

    /// Drops everything buffered, including a partially received frame.
    pub fn reset(&mut self) {
        if !self.buffer.is_empty() {
            debug!("Discarding {} buffered SML bytes", self.buffer.len());
        }
        self.buffer.clear();
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        'search: loop {
            let start = match find_start(&self.buffer) {
                Some(start) => start,
                None => {
                    // Keep a tail that could be the beginning of a start sequence
                    let keep = self.buffer.len().min(START_SEQUENCE_LEN - 1);
                    let drop = self.buffer.len() - keep;
                    if drop > 0 {
                        debug!("No SML start sequence in {} bytes, dropping them", drop);
                        self.buffer.drain(..drop);
                    }
                    return None;
                }
            };

            if start > 0 {
                debug!("Skipping {} bytes before SML start sequence", start);
                self.buffer.drain(..start);
            }

            // Escape sequences are aligned to 4 bytes relative to the frame start
            let mut i = START_SEQUENCE_LEN;
            loop {
                if i + 4 > self.buffer.len() {
                    return None;
                }
                if self.buffer[i..i + 4] != SML_ESCAPE {
                    i += 4;
                    continue;
                }
                if i + END_SEQUENCE_LEN > self.buffer.len() {
                    return None;
                }

                let next = &self.buffer[i + 4..i + 8];
                if next == SML_ESCAPE {
                    // Escaped escape sequence inside the payload
                    i += 8;
                } else if next == SML_VERSION_1 {
                    warn!("SML frame restarted after {} bytes, dropping the incomplete one", i);
                    self.buffer.drain(..i);
                    continue 'search;
                } else if next[0] == SML_END_MARKER {
                    let frame: Vec<u8> = self.buffer.drain(..i + END_SEQUENCE_LEN).collect();
                    debug!("Assembled SML frame of {} bytes", frame.len());
                    return Some(frame);
                } else {
                    warn!("Invalid SML escape sequence {:02X?}, resynchronizing", next);
                    self.buffer.drain(..i + 4);
                    continue 'search;
                }
            }
        }
    }
}

fn find_start(data: &[u8]) -> Option<usize> {
    data.windows(START_SEQUENCE_LEN)
        .position(|w| w[..4] == SML_ESCAPE && w[4..] == SML_VERSION_1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::structs::ObisCode;
    use super::super::test_frames::*;

    fn sample_frame(raw: i64) -> Vec<u8> {
        meter_frame(&[signed_entry(ObisCode::new(1, 0, 1, 8, 0, 255), 30, 0, raw)])
    }

    #[test]
    fn test_empty_assembler_has_no_frame() {
        let mut assembler = FrameAssembler::new();
        assert!(assembler.next_frame().is_none());
    }

    #[test]
    fn test_two_back_to_back_frames_in_order() {
        let first = sample_frame(1);
        let second = sample_frame(2);

        let mut assembler = FrameAssembler::new();
        let mut chunk = first.clone();
        chunk.extend_from_slice(&second);
        assembler.add(&chunk);

        assert_eq!(assembler.next_frame(), Some(first));
        assert_eq!(assembler.next_frame(), Some(second));
        assert_eq!(assembler.next_frame(), None);
        assert!(assembler.is_empty());
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let frame = sample_frame(42);
        let (head, tail) = frame.split_at(frame.len() / 2 + 1);

        let mut assembler = FrameAssembler::new();
        assembler.add(head);
        assert_eq!(assembler.next_frame(), None);
        assert_eq!(assembler.len(), head.len());

        assembler.add(tail);
        assert_eq!(assembler.next_frame(), Some(frame));
    }

    #[test]
    fn test_end_sequence_split_inside_trailer() {
        let frame = sample_frame(7);
        let mut assembler = FrameAssembler::new();
        assembler.add(&frame[..frame.len() - 2]);
        assert_eq!(assembler.next_frame(), None);
        assembler.add(&frame[frame.len() - 2..]);
        assert_eq!(assembler.next_frame(), Some(frame));
    }

    #[test]
    fn test_garbage_before_start_is_skipped() {
        let frame = sample_frame(3);
        let mut chunk = vec![0x00, 0x42, 0x1B, 0x1B, 0x13];
        chunk.extend_from_slice(&frame);

        let mut assembler = FrameAssembler::new();
        assembler.add(&chunk);
        assert_eq!(assembler.next_frame(), Some(frame));
    }

    #[test]
    fn test_tail_of_a_frame_without_start_is_dropped() {
        let frame = sample_frame(3);
        let mut assembler = FrameAssembler::new();
        assembler.add(&frame[20..]);
        assert_eq!(assembler.next_frame(), None);
        assert!(assembler.len() < START_SEQUENCE_LEN);
    }

    #[test]
    fn test_restarted_frame_replaces_partial_one() {
        let first = sample_frame(1);
        let second = sample_frame(2);

        // Cut the first frame at an aligned offset, then a full second frame
        let mut chunk = first[..32].to_vec();
        chunk.extend_from_slice(&second);

        let mut assembler = FrameAssembler::new();
        assembler.add(&chunk);
        assert_eq!(assembler.next_frame(), Some(second));
        assert_eq!(assembler.next_frame(), None);
    }

    #[test]
    fn test_escaped_escape_does_not_end_frame() {
        let frame = meter_frame(&[signed_entry(ObisCode::new(1, 0, 1, 8, 0, 255), 30, 0, 0x1B1B_1B1B)]);
        let mut assembler = FrameAssembler::new();
        assembler.add(&frame);
        assert_eq!(assembler.next_frame(), Some(frame));
    }

    #[test]
    fn test_buffer_is_capped() {
        let mut assembler = FrameAssembler::with_limit(64);
        let mut junk = SML_ESCAPE.to_vec();
        junk.extend_from_slice(&SML_VERSION_1);
        junk.extend(std::iter::repeat(0x55).take(200));

        assembler.add(&junk);
        assert!(assembler.len() <= 64);
        assert_eq!(assembler.next_frame(), None);
    }

    #[test]
    fn test_reset_drops_partial_frame() {
        let frame = sample_frame(9);
        let mut assembler = FrameAssembler::new();
        assembler.add(&frame[..frame.len() - 4]);
        assembler.reset();
        assembler.add(&frame[frame.len() - 4..]);
        assert_eq!(assembler.next_frame(), None);
    }
}
