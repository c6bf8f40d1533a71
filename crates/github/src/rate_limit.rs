use std::time::{Duration, Instant};

use autoforge_config::RateLimitSettings;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::GitHubError;

/// Classic token bucket: fixed capacity, constant refill rate, one token
/// per operation.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity: capacity as f64,
            refill_rate,
            tokens: capacity as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = Instant::now();
    }

    pub fn try_acquire(&mut self, tokens: u32) -> bool {
        self.refill();
        if self.tokens >= tokens as f64 {
            self.tokens -= tokens as f64;
            true
        } else {
            false
        }
    }

    /// Seconds until `tokens` will be available at the current rate.
    pub fn wait_time(&mut self, tokens: u32) -> Duration {
        self.refill();
        let deficit = tokens as f64 - self.tokens;
        if deficit <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(deficit / self.refill_rate)
        }
    }

    pub fn available(&mut self) -> f64 {
        self.refill();
        self.tokens
    }
}

/// Per-million-token pricing for cost accounting, by model name fragment.
const MODEL_PRICING: &[(&str, f64, f64)] = &[
    ("opus", 15.0, 75.0),
    ("sonnet", 3.0, 15.0),
    ("haiku", 0.8, 4.0),
];

const DEFAULT_PRICING: (f64, f64) = (3.0, 15.0);

fn pricing_for(model: &str) -> (f64, f64) {
    let lower = model.to_lowercase();
    MODEL_PRICING
        .iter()
        .find(|(fragment, _, _)| lower.contains(fragment))
        .map(|(_, input, output)| (*input, *output))
        .unwrap_or(DEFAULT_PRICING)
}

#[derive(Debug, Default)]
struct CostTracker {
    spent_usd: f64,
}

/// Process-global limiter for external calls: a GitHub token bucket plus
/// a hard dollar cap on model usage per run. The bucket holds its own
/// lock; callers share the limiter by reference.
pub struct RateLimiter {
    github: Mutex<TokenBucket>,
    cost: Mutex<CostTracker>,
    settings: RateLimitSettings,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            github: Mutex::new(TokenBucket::new(
                settings.github_capacity,
                settings.github_refill_rate,
            )),
            cost: Mutex::new(CostTracker::default()),
            settings,
        }
    }

    /// Acquire one GitHub call, waiting up to the configured bound for a
    /// refill before surfacing `RateLimitExceeded`.
    pub async fn acquire_github(&self) -> Result<(), GitHubError> {
        let wait = {
            let mut bucket = self.github.lock().await;
            if bucket.try_acquire(1) {
                return Ok(());
            }
            bucket.wait_time(1)
        };

        let bound = Duration::from_secs(self.settings.lock_wait_secs);
        if wait > bound {
            warn!(wait_secs = wait.as_secs_f64(), "rate limit wait exceeds bound");
            return Err(GitHubError::RateLimitExceeded);
        }
        debug!(wait_ms = wait.as_millis() as u64, "waiting for rate limit refill");
        tokio::time::sleep(wait).await;

        let mut bucket = self.github.lock().await;
        if bucket.try_acquire(1) {
            Ok(())
        } else {
            Err(GitHubError::RateLimitExceeded)
        }
    }

    /// Record model usage. Crossing the budget is a hard stop: the error
    /// is returned and the overspend stays on the books.
    pub async fn track_model_cost(
        &self,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<f64, GitHubError> {
        let (input_price, output_price) = pricing_for(model);
        let cost = (input_tokens as f64 * input_price + output_tokens as f64 * output_price)
            / 1_000_000.0;

        let mut tracker = self.cost.lock().await;
        tracker.spent_usd += cost;
        if tracker.spent_usd > self.settings.cost_limit_usd {
            return Err(GitHubError::CostLimitExceeded {
                spent: tracker.spent_usd,
                limit: self.settings.cost_limit_usd,
            });
        }
        Ok(tracker.spent_usd)
    }

    pub async fn spent_usd(&self) -> f64 {
        self.cost.lock().await.spent_usd
    }

    pub async fn github_tokens_available(&self) -> f64 {
        self.github.lock().await.available()
    }
}
