#![forbid(unsafe_code)]

/// CRC32 of a page image, salted with its page number and the per-file salt
/// so that a page written at the wrong offset or copied from another file
/// fails validation.
pub fn page_crc32(page_no: u64, salt: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page_no.to_be_bytes());
    hasher.update(&salt.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}
