use std::collections::VecDeque;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Request budget shared by every registry query in a run.
///
/// A token bucket holding `capacity` tokens where each spent token returns to
/// the bucket exactly one `window` after it was spent. Any rolling window
/// therefore sees at most `capacity` requests, regardless of how many images
/// are queried concurrently.
#[derive(Debug)]
pub struct RequestBudget {
    capacity: usize,
    window: Duration,
    /// Spend times of tokens not yet returned, oldest first.
    spent: Mutex<VecDeque<Instant>>,
}

impl RequestBudget {
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity: usize::try_from(capacity).unwrap_or(usize::MAX).max(1),
            window,
            spent: Mutex::new(VecDeque::new()),
        }
    }

    pub fn per_minute(capacity: u32) -> Self {
        Self::new(capacity, Duration::from_secs(60))
    }

    /// Wait until a token is available, then spend it.
    pub async fn acquire(&self) {
        loop {
            let wake_at = {
                let mut spent = self.spent.lock().await;
                let now = Instant::now();
                self.refill(&mut spent, now);
                if spent.len() < self.capacity {
                    spent.push_back(now);
                    return;
                }
                match spent.front() {
                    Some(oldest) => *oldest + self.window,
                    None => now,
                }
            };
            tracing::debug!(
                capacity = self.capacity,
                "Registry request budget exhausted, waiting for a token"
            );
            tokio::time::sleep_until(wake_at).await;
        }
    }

    /// Tokens currently available without waiting.
    pub async fn available(&self) -> usize {
        let mut spent = self.spent.lock().await;
        self.refill(&mut spent, Instant::now());
        self.capacity - spent.len()
    }

    fn refill(&self, spent: &mut VecDeque<Instant>, now: Instant) {
        while spent
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            spent.pop_front();
        }
    }
}
