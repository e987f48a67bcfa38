//! Rolling CRC32C (Castagnoli polynomial, reflected).
//!
//! Both persistence engines thread this checksum through multi-field
//! records, so the function takes the previous CRC and folds more bytes in:
//!
//! ```
//! use perunkv_core::crc32c::crc32c;
//!
//! let whole = crc32c(0, b"hello world");
//! let split = crc32c(crc32c(0, b"hello "), b"world");
//! assert_eq!(whole, split);
//! ```

/// Reflected form of the Castagnoli polynomial 0x1EDC6F41.
const POLY: u32 = 0x82F6_3B78;

const CRC32C_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ POLY;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// Folds `data` into `crc` and returns the updated checksum. Seed with `0`.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)] // table index is masked to 0..=255
pub fn crc32c(crc: u32, data: &[u8]) -> u32 {
    let mut crc = !crc;
    for &byte in data {
        let idx = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32C_TABLE[idx];
    }
    !crc
}
