use crate::models::AnalysisResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Checksummed envelope for analyses kept in the in-memory cache.
///
/// The checksum covers the cache key, the timestamp and the serialized analysis, so an
/// entry that was corrupted, or filed under the wrong key, is rejected on read and the
/// lead is scored again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedCacheEntry {
    pub analysis: AnalysisResult,
    pub cached_at: DateTime<Utc>,
    /// SHA-256 of key + timestamp + analysis JSON (hex encoded).
    pub checksum: String,
}

impl ValidatedCacheEntry {
    /// Seals an analysis under `key`.
    pub fn seal(key: &str, analysis: AnalysisResult, cached_at: DateTime<Utc>) -> Self {
        let checksum = Self::compute_checksum(key, &analysis, cached_at);
        Self {
            analysis,
            cached_at,
            checksum,
        }
    }

    fn compute_checksum(key: &str, analysis: &AnalysisResult, cached_at: DateTime<Utc>) -> String {
        let body = serde_json::to_string(analysis).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hasher.update(b"\n");
        hasher.update(cached_at.to_rfc3339().as_bytes());
        hasher.update(b"\n");
        hasher.update(body.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// True if the checksum matches the contents for `key`.
    pub fn is_valid_for(&self, key: &str) -> bool {
        Self::compute_checksum(key, &self.analysis, self.cached_at) == self.checksum
    }

    /// True once the entry is older than `ttl` at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now - self.cached_at >= ttl,
            Err(_) => false,
        }
    }

    pub fn serialize(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Deserializes an entry and checks it against `key`.
    ///
    /// Returns `None` for invalid JSON or a checksum mismatch.
    pub fn deserialize_and_validate(key: &str, serialized: &str) -> Option<Self> {
        let entry: ValidatedCacheEntry = serde_json::from_str(serialized).ok()?;

        if entry.is_valid_for(key) {
            Some(entry)
        } else {
            tracing::warn!(
                "Cache validation failed: checksum mismatch for key {}...",
                &key[..12.min(key.len())]
            );
            None
        }
    }
}
