//! Rolling and strong checksums for the delta engine
//!
//! The weak checksum is the rsync rolling checksum so a one-byte slide costs a
//! handful of adds; BLAKE3 confirms candidate matches.

/// Offset folded into every byte, as in rsync's get_checksum1.
const CHAR_OFFSET: u32 = 31;

/// Rolling checksum over a fixed-size window.
pub struct RollingChecksum {
    s1: u32,
    s2: u32,
    window: usize,
}

impl RollingChecksum {
    pub fn new(window: usize) -> Self {
        Self { s1: 0, s2: 0, window }
    }

    /// Initialize over a full window of data.
    pub fn init(&mut self, data: &[u8]) {
        self.s1 = 0;
        self.s2 = 0;

        let len = data.len();
        let mut i = 0;

        // Four bytes at a time, same unrolling as rsync.
        while i + 4 <= len {
            let b0 = data[i] as u32;
            let b1 = data[i + 1] as u32;
            let b2 = data[i + 2] as u32;
            let b3 = data[i + 3] as u32;

            self.s2 = self.s2.wrapping_add(
                4u32.wrapping_mul(self.s1.wrapping_add(b0))
                    .wrapping_add(3u32.wrapping_mul(b1))
                    .wrapping_add(2u32.wrapping_mul(b2))
                    .wrapping_add(b3)
                    .wrapping_add(10u32.wrapping_mul(CHAR_OFFSET)),
            );
            self.s1 = self.s1.wrapping_add(
                b0.wrapping_add(b1)
                    .wrapping_add(b2)
                    .wrapping_add(b3)
                    .wrapping_add(4u32.wrapping_mul(CHAR_OFFSET)),
            );

            i += 4;
        }

        while i < len {
            let byte = data[i] as u32;
            self.s1 = self.s1.wrapping_add(byte.wrapping_add(CHAR_OFFSET));
            self.s2 = self.s2.wrapping_add(self.s1);
            i += 1;
        }
    }

    /// Slide the window one byte forward.
    pub fn roll(&mut self, old_byte: u8, new_byte: u8) {
        let old = old_byte as u32 + CHAR_OFFSET;
        let new = new_byte as u32 + CHAR_OFFSET;

        self.s1 = self.s1.wrapping_sub(old).wrapping_add(new);
        self.s2 = self
            .s2
            .wrapping_sub(self.window as u32 * old)
            .wrapping_add(self.s1);
    }

    /// s1 in the lower 16 bits, s2 in the upper 16 (rsync layout).
    pub fn value(&self) -> u32 {
        (self.s1 & 0xFFFF) | (self.s2 << 16)
    }
}

/// One-shot rolling checksum of a block.
pub fn rolling_checksum(data: &[u8]) -> u32 {
    let mut rolling = RollingChecksum::new(data.len());
    rolling.init(data);
    rolling.value()
}

/// Strong checksum of a block.
pub fn strong_checksum(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}
