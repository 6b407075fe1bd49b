//! Request fingerprinting.
//!
//! The exact cache key is a SHA-256 over the normalized question text, the
//! answer mode, and the tenant tag, joined by an ASCII unit separator so no
//! component can bleed into its neighbour. Two requests share a fingerprint
//! iff their normalized `(text, mode, tenant)` triples are byte-equal.

use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use crate::api_types::AnswerMode;

const FIELD_SEPARATOR: u8 = 0x1F;

/// Canonical form of a question: trimmed, NFKC-normalized, lowercased.
///
/// This is also the text handed to the embedding client, so exact and
/// semantic lookups agree on what a question "is".
pub fn normalize_text(text: &str) -> String {
    text.trim().nfkc().collect::<String>().to_lowercase()
}

/// The cache identity of one query, computed once per request and carried
/// through exact lookup, single-flight, semantic lookup, and the final put.
#[derive(Debug, Clone)]
pub struct QueryKey {
    pub fingerprint: String,
    pub normalized_text: String,
    pub mode: AnswerMode,
    pub tenant: Option<String>,
}

impl QueryKey {
    pub fn new(text: &str, mode: AnswerMode, tenant: Option<&str>) -> Self {
        Self {
            fingerprint: fingerprint(text, mode, tenant),
            normalized_text: normalize_text(text),
            mode,
            tenant: tenant.map(|t| t.to_string()),
        }
    }
}

/// Exact cache key for a query triple. Hex-encoded SHA-256.
pub fn fingerprint(text: &str, mode: AnswerMode, tenant: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_text(text).as_bytes());
    hasher.update([FIELD_SEPARATOR]);
    hasher.update(mode.as_str().as_bytes());
    hasher.update([FIELD_SEPARATOR]);
    hasher.update(tenant.unwrap_or_default().as_bytes());
    hex::encode(hasher.finalize())
}
