use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

pub const RATE_LIMIT_MAX_REQUESTS: usize = 100;
pub const RATE_LIMIT_WINDOW_SECONDS: i64 = 60;

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    window_start: DateTime<Utc>,
    count: usize,
}

/// Fixed-window per-client request limiter. The window resets on the first
/// request after expiry rather than sliding.
pub struct RateLimiter {
    windows: Mutex<HashMap<String, WindowEntry>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Records a request from `client` and returns whether it is allowed.
    pub async fn check(&self, client: &str) -> bool {
        self.check_at(client, Utc::now()).await
    }

    /// Clock-injected variant so tests can drive the window directly.
    pub async fn check_at(&self, client: &str, now: DateTime<Utc>) -> bool {
        let mut windows = self.windows.lock().await;
        let entry = windows
            .entry(client.to_string())
            .or_insert(WindowEntry {
                window_start: now,
                count: 0,
            });

        if (now - entry.window_start).num_seconds() > RATE_LIMIT_WINDOW_SECONDS {
            *entry = WindowEntry {
                window_start: now,
                count: 1,
            };
            return true;
        }

        entry.count += 1;
        entry.count <= RATE_LIMIT_MAX_REQUESTS
    }
}
