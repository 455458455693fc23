//! H.264 Annex-B keyframe detection.

/// NAL unit type of an IDR slice.
pub const NAL_TYPE_IDR: u8 = 5;

/// Scans Annex-B elementary bytes for IDR NAL units.
///
/// Chunks may split start codes anywhere; the unscanned trailing bytes (at
/// most three) are carried over so a start code is never missed or counted
/// twice.
#[derive(Debug, Default)]
pub struct KeyframeDetector {
    tail: Vec<u8>,
}

impl KeyframeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget carried-over bytes, e.g. at a PES boundary on a new stream.
    pub fn reset(&mut self) {
        self.tail.clear();
    }

    /// Scan one chunk and return how many IDR units start in it.
    pub fn push(&mut self, chunk: &[u8]) -> usize {
        let mut data = std::mem::take(&mut self.tail);
        data.extend_from_slice(chunk);

        let mut found = 0;
        let mut i = 0;
        // A start code plus the NAL header byte needs 4 bytes.
        while i + 3 < data.len() {
            if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
                if data[i + 3] & 0x1F == NAL_TYPE_IDR {
                    found += 1;
                }
                i += 3;
            } else {
                i += 1;
            }
        }

        // Positions from `i` on have not been checked for a start code.
        self.tail = data.split_off(i.min(data.len()));
        found
    }
}
