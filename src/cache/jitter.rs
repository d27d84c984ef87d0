use rand::Rng;
use std::time::Duration;

/// Ticker that fires every `base` plus a random extra of up to a tenth of `base`.
#[derive(Debug, Clone)]
pub struct JitterTicker {
    base: Duration,
    max_jitter: Duration,
}

impl JitterTicker {
    pub fn new(base: Duration) -> Self {
        Self { base, max_jitter: base / 10 }
    }

    pub fn next_delay(&self) -> Duration {
        let jitter_nanos = u64::try_from(self.max_jitter.as_nanos()).unwrap_or(u64::MAX);
        if jitter_nanos == 0 {
            return self.base;
        }
        self.base + Duration::from_nanos(rand::thread_rng().gen_range(0..jitter_nanos))
    }

    pub async fn tick(&mut self) {
        tokio::time::sleep(self.next_delay()).await;
    }
}
