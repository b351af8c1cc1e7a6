//! CRC-32C (Castagnoli) over headers and aux payloads.

use ::crc::{Crc, CRC_32_ISCSI};

use crate::header::{ByteOrder, HDR_CRC_OFFSET};

static CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// CRC over an arbitrary region.
pub fn crc32(data: &[u8]) -> u32 {
    CASTAGNOLI.checksum(data)
}

/// Header CRC over a raw header with its CRC field treated as zero.
pub fn header_crc(raw: &[u8]) -> u32 {
    let mut digest = CASTAGNOLI.digest();
    digest.update(&raw[..HDR_CRC_OFFSET]);
    digest.update(&[0u8; 4]);
    digest.update(&raw[HDR_CRC_OFFSET + 4..]);
    digest.finalize()
}

/// Compute the header CRC of a raw header and store it in place.
pub fn seal_header(raw: &mut [u8], order: ByteOrder) {
    let crc = header_crc(raw);
    raw[HDR_CRC_OFFSET..HDR_CRC_OFFSET + 4].copy_from_slice(&order.u32_bytes(crc));
}
