#![forbid(unsafe_code)]

/// Checksum over one journal record: the journal nonce, the page number and
/// the page image. A torn record at the journal tail fails this check.
pub fn journal_crc32(nonce: u64, page_no: u32, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&nonce.to_be_bytes());
    hasher.update(&page_no.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}
