//! CRC-32 (IEEE 802.3, reflected) as used by the frame checksum field.

const POLYNOMIAL: u32 = 0xEDB8_8320;

/// Compute the CRC-32 of `data`.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ POLYNOMIAL;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

/// Render a checksum the way it appears on the wire: eight lowercase hex digits.
pub fn format_crc(crc: u32) -> String {
    format!("{:08x}", crc)
}
