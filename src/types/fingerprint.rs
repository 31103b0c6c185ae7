//! Content fingerprints for checking that an exchange moved the bytes.

/// CRC32 of a page's length and content, independent of where it lives.
pub fn page_fingerprint(payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&(payload.len() as u64).to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}
