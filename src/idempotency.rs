use sha2::{Digest, Sha256};

use crate::constants::FINGERPRINT_TITLE_CHARS;
use crate::domain::Record;

/// Dedup fingerprint: sha256 over `lower(url)|lower(title prefix)`.
///
/// Only the identity URL and the first `FINGERPRINT_TITLE_CHARS` characters of the
/// title take part, so any other field can change without changing identity.
pub fn compute_fingerprint(url: &str, title: Option<&str>) -> String {
    let title_prefix: String = title
        .unwrap_or("")
        .to_lowercase()
        .chars()
        .take(FINGERPRINT_TITLE_CHARS)
        .collect();

    let mut s = String::with_capacity(url.len() + title_prefix.len() + 1);
    s.push_str(&url.to_lowercase());
    s.push('|');
    s.push_str(&title_prefix);

    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn record_fingerprint(record: &Record) -> String {
    compute_fingerprint(record.identity_url(), record.title.as_deref())
}
