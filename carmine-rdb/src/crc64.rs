//! CRC-64/ECMA-182: polynomial 0x42F0E1EBA9EA3693, MSB-first, zero init,
//! no final xor. Table-driven, one table built on first use.

use once_cell::sync::Lazy;

const POLY: u64 = 0x42F0_E1EB_A9EA_3693;

static TABLE: Lazy<[u64; 256]> = Lazy::new(|| {
    let mut table = [0u64; 256];
    for (i, slot) in table.iter_mut().enumerate() {
        let mut crc = (i as u64) << 56;
        for _ in 0..8 {
            crc = if crc & (1 << 63) != 0 {
                (crc << 1) ^ POLY
            } else {
                crc << 1
            };
        }
        *slot = crc;
    }
    table
});

/// Running CRC state, fed incrementally while bytes are written or read.
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc64(u64);

impl Crc64 {
    pub fn update(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 = (self.0 << 8) ^ TABLE[(((self.0 >> 56) as u8) ^ b) as usize];
        }
    }

    pub fn finish(&self) -> u64 {
        self.0
    }
}

/// One-shot convenience.
pub fn crc64(bytes: &[u8]) -> u64 {
    let mut crc = Crc64::default();
    crc.update(bytes);
    crc.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecma_182_check_value() {
        assert_eq!(crc64(b"123456789"), 0x6C40_DF5F_0B49_7347);
    }

    #[test]
    fn incremental_matches_one_shot() {
        let mut crc = Crc64::default();
        crc.update(b"hello ");
        crc.update(b"world");
        assert_eq!(crc.finish(), crc64(b"hello world"));
    }

    #[test]
    fn empty_input_is_zero() {
        assert_eq!(crc64(b""), 0);
    }
}
