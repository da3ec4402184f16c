use std::time;

/// The retry policy used to pace delivery attempts against a webhook endpoint.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    /// Retries allowed after the initial attempt.
    retries: u32,
    /// Coefficient to multiply initial_backoff with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval after the first failed attempt.
    initial_backoff: time::Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32, backoff_coefficient: u32, initial_backoff: time::Duration) -> Self {
        Self {
            retries,
            backoff_coefficient,
            initial_backoff,
        }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Backoff to sleep after the given zero-indexed attempt.
    pub fn backoff(&self, attempt: u32) -> time::Duration {
        self.initial_backoff * self.backoff_coefficient.pow(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            backoff_coefficient: 2,
            initial_backoff: time::Duration::from_millis(500),
        }
    }
}
