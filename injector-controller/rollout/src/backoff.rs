use ahash::AHashMap;
use parking_lot::Mutex;
use std::time::Duration;

const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(5 * 60);

/// Per-key exponential backoff for reconcile failures. Recording and
/// resetting are tied to the scheduling decision: only generic errors grow
/// the delay, and any success or scheduled continuation clears it.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempts: Mutex<AHashMap<String, u32>>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: BASE_DELAY,
            max: MAX_DELAY,
            attempts: Mutex::new(AHashMap::new()),
        }
    }
}

impl Backoff {
    /// Records a failure for `key` and returns the delay before its retry.
    pub fn delay(&self, key: &str) -> Duration {
        let mut attempts = self.attempts.lock();
        let n = attempts.entry(key.to_string()).or_insert(0);
        *n = n.saturating_add(1);
        let exp = self.base.saturating_mul(1u32 << (*n - 1).min(16));
        exp.min(self.max)
    }

    pub fn reset(&self, key: &str) {
        self.attempts.lock().remove(key);
    }
}
