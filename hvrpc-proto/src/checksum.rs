//! Checksum shared by guest and host for the buffer-exercise call.
//!
//! The checksum is the wrapping `u32` sum of every processed byte, taken
//! across all buffers of one call.

/// Wrapping byte sum of `data`, continuing from `seed`.
pub fn byte_sum(seed: u32, data: &[u8]) -> u32 {
    data.iter()
        .fold(seed, |acc, b| acc.wrapping_add(u32::from(*b)))
}

/// Checksum of `total` bytes all equal to the low byte of `pattern`.
///
/// This is what a WRITE of `pattern` over buffers totalling `total` bytes
/// reports, and what a matching VERIFY reports afterwards.
#[allow(clippy::cast_possible_truncation)]
pub const fn pattern_checksum(pattern: u32, total: u64) -> u32 {
    // Reduction modulo 2^64 then 2^32 equals reduction modulo 2^32.
    ((pattern & 0xFF) as u64).wrapping_mul(total) as u32
}
