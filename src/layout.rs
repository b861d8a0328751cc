//! On-disk page layout: the footer every flushed page carries and the LSN
//! embedded at the start of the durable page body.

use crate::types::Lsn;

/// Marker written at the head of every flushed page.
pub const MAGIC_NUMBER: u64 = 0xFACB03FE;

pub const MAGIC_OFFSET: usize = 0;
pub const CHECKSUM_OFFSET: usize = 8;
/// First byte of the durable page body; the CRC covers `[BODY_OFFSET ..)`.
pub const BODY_OFFSET: usize = 12;

/// The durable-page contract places the page LSN at the start of the body.
pub const LSN_SEGMENT_OFFSET: usize = BODY_OFFSET;
pub const LSN_POSITION_OFFSET: usize = BODY_OFFSET + 8;

/// Smallest page able to carry the footer plus the embedded LSN.
pub const MIN_PAGE_SIZE: usize = LSN_POSITION_OFFSET + 8;

/// CRC32 (ISO-3309) of the page body.
pub fn page_crc(page: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page[BODY_OFFSET..]);
    hasher.finalize()
}

/// Stamps the magic number and body CRC into the first twelve bytes.
pub fn write_footer(page: &mut [u8]) {
    page[MAGIC_OFFSET..MAGIC_OFFSET + 8].copy_from_slice(&MAGIC_NUMBER.to_ne_bytes());
    let crc = page_crc(page);
    page[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&(crc as i32).to_ne_bytes());
}

/// Checks the footer of a page image read back from disk.
///
/// Returns `(magic_ok, crc_ok)`; callers report the two failures separately.
pub fn verify_page(page: &[u8]) -> (bool, bool) {
    let mut magic = [0u8; 8];
    magic.copy_from_slice(&page[MAGIC_OFFSET..MAGIC_OFFSET + 8]);
    let magic_ok = u64::from_ne_bytes(magic) == MAGIC_NUMBER;

    let mut stored = [0u8; 4];
    stored.copy_from_slice(&page[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4]);
    let crc_ok = i32::from_ne_bytes(stored) == page_crc(page) as i32;

    (magic_ok, crc_ok)
}

/// Reads the LSN a consumer embedded in the page body.
pub fn page_lsn(page: &[u8]) -> Lsn {
    let mut segment = [0u8; 8];
    segment.copy_from_slice(&page[LSN_SEGMENT_OFFSET..LSN_SEGMENT_OFFSET + 8]);
    let mut position = [0u8; 8];
    position.copy_from_slice(&page[LSN_POSITION_OFFSET..LSN_POSITION_OFFSET + 8]);
    Lsn::new(u64::from_be_bytes(segment), u64::from_be_bytes(position))
}

/// Embeds an LSN into the page body at the durable-page offset.
pub fn set_page_lsn(page: &mut [u8], lsn: Lsn) {
    page[LSN_SEGMENT_OFFSET..LSN_SEGMENT_OFFSET + 8].copy_from_slice(&lsn.segment.to_be_bytes());
    page[LSN_POSITION_OFFSET..LSN_POSITION_OFFSET + 8].copy_from_slice(&lsn.position.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn footer_round_trips() {
        let mut page = vec![0u8; 4096];
        page[100] = 0xAB;
        write_footer(&mut page);
        assert_eq!(verify_page(&page), (true, true));
    }

    #[test]
    fn body_tampering_breaks_crc_only() {
        let mut page = vec![0u8; 4096];
        write_footer(&mut page);
        page[1000] ^= 0xFF;
        assert_eq!(verify_page(&page), (true, false));
    }

    #[test]
    fn footer_tampering_breaks_magic() {
        let mut page = vec![0u8; 4096];
        write_footer(&mut page);
        page[0] ^= 0xFF;
        let (magic_ok, _) = verify_page(&page);
        assert!(!magic_ok);
    }

    #[test]
    fn lsn_round_trips_at_body_start() {
        let mut page = vec![0u8; 4096];
        set_page_lsn(&mut page, Lsn::new(7, 1234));
        assert_eq!(page_lsn(&page), Lsn::new(7, 1234));

        // The LSN lives inside the body, so it is covered by the CRC.
        write_footer(&mut page);
        assert_eq!(verify_page(&page), (true, true));
    }
}
