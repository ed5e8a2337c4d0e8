//! Coarse submission fingerprints

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Leading bytes of the audio that take part in the fingerprint
const PREFIX_BYTES: usize = 64;

/// Coarse key identifying "the same capture submitted again"
///
/// Derived from the persona, the audio length, a leading-byte sample and the
/// wall-clock bucket of the submission. Two submissions collide only when all
/// four agree, so a retry of the same recording inside one bucket is caught
/// while a new recording of identical length is not.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute a fingerprint for `audio` submitted for `persona_id` at `at`
    ///
    /// `bucket` is the width of the wall-clock bucket, normally the dedup window.
    #[must_use]
    pub fn compute(persona_id: &str, audio: &[u8], at: DateTime<Utc>, bucket: Duration) -> Self {
        Self::in_bucket(persona_id, audio, bucket_index(at, bucket))
    }

    /// Fingerprint the same submission would have had one bucket earlier
    ///
    /// A resubmission less than one bucket after the first attempt matches
    /// either this or [`Fingerprint::compute`] taken at the same instant.
    #[must_use]
    pub fn compute_previous(
        persona_id: &str,
        audio: &[u8],
        at: DateTime<Utc>,
        bucket: Duration,
    ) -> Self {
        Self::in_bucket(persona_id, audio, bucket_index(at, bucket) - 1)
    }

    fn in_bucket(persona_id: &str, audio: &[u8], bucket_index: i64) -> Self {
        let prefix = &audio[..audio.len().min(PREFIX_BYTES)];

        let mut hasher = Sha256::new();
        hasher.update(persona_id.as_bytes());
        hasher.update([0]);
        hasher.update((audio.len() as u64).to_le_bytes());
        hasher.update(prefix);
        hasher.update(bucket_index.to_le_bytes());

        let digest = hasher.finalize();
        Self(hex::encode(&digest[..16]))
    }

    /// Hex form of the fingerprint
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn bucket_index(at: DateTime<Utc>, bucket: Duration) -> i64 {
    let bucket_ms = i64::try_from(bucket.as_millis()).unwrap_or(i64::MAX).max(1);
    at.timestamp_millis().div_euclid(bucket_ms)
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
