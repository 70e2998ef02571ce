use std::time::Duration;

use sha2::{Digest, Sha256};

/// Returns the wait before retry number `attempt` (1-based).
///
/// The delay is `base × attempt` plus a jitter in `[0, jitter]` derived from
/// `seed` and `attempt`, so two supervisors retrying the same argv do not
/// need shared randomness to spread out.
pub fn retry_delay(base: Duration, jitter: Duration, attempt: u32, seed: &str) -> Duration {
    let scaled = base.saturating_mul(attempt.max(1));
    let jitter_ms = u64::try_from(jitter.as_millis()).unwrap_or(u64::MAX);
    if jitter_ms == 0 {
        return scaled;
    }
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(attempt.to_le_bytes());
    let digest = hasher.finalize();
    let mut seed_bytes = [0_u8; 8];
    seed_bytes.copy_from_slice(&digest[..8]);
    let deterministic_jitter = u64::from_le_bytes(seed_bytes) % jitter_ms.saturating_add(1);
    scaled.saturating_add(Duration::from_millis(deterministic_jitter))
}
