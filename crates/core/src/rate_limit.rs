use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_requests: u32,
    pub window: Duration,
    pub min_delay: Duration,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimitWindow {
    pub requests: u32,
    pub window_start: Option<Instant>,
    pub last_request: Option<Instant>,
}

#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    policy: RateLimitPolicy,
    state: Mutex<RateLimitWindow>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, policy: RateLimitPolicy) -> Self {
        Self {
            name: name.into(),
            policy: RateLimitPolicy {
                max_requests: policy.max_requests.max(1),
                ..policy
            },
            state: Mutex::new(RateLimitWindow::default()),
        }
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    /// Waits until one more request fits both the window budget and the
    /// minimum spacing, then records it.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;

        let now = Instant::now();
        match state.window_start {
            Some(start) if now.duration_since(start) < self.policy.window => {}
            _ => {
                state.window_start = Some(now);
                state.requests = 0;
            }
        }

        if state.requests >= self.policy.max_requests {
            if let Some(start) = state.window_start {
                let reopen = start + self.policy.window;
                tracing::info!(
                    limiter = %self.name,
                    wait_ms = reopen.saturating_duration_since(now).as_millis() as u64,
                    "request window exhausted, waiting"
                );
                tokio::time::sleep_until(reopen).await;
            }
            state.window_start = Some(Instant::now());
            state.requests = 0;
        }

        if let Some(last) = state.last_request {
            let earliest = last + self.policy.min_delay;
            if earliest > Instant::now() {
                tokio::time::sleep_until(earliest).await;
            }
        }

        state.requests += 1;
        state.last_request = Some(Instant::now());
    }

    pub async fn snapshot(&self) -> RateLimitWindow {
        *self.state.lock().await
    }
}
