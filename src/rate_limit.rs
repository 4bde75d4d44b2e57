//! Admission gates - sliding-window rate limiting at the edges
//!
//! Two independent counters front the expensive entry points: session
//! creation (keyed by principal) and join attempts (keyed by source address).
//! Each key maps to a list of recent attempt timestamps; a check prunes the
//! list to the window, compares against the limit, and records the attempt on
//! success. A periodic sweep drops keys whose lists have emptied out so the
//! maps cannot grow without bound.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// At most this many timestamps are retained per key
const MAX_RECORDED: usize = 20;

/// How often idle keys are swept out of the gates
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// A sliding-window counter over string keys
pub struct SlidingWindow {
    entries: Mutex<HashMap<String, Vec<f64>>>,
    limit: usize,
    window_ms: f64,
}

impl SlidingWindow {
    /// Allow `limit` attempts per key within the past `window_ms` milliseconds
    pub fn new(limit: usize, window_ms: f64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            limit,
            window_ms,
        }
    }

    /// Check and record one attempt. Returns false when the key is over its
    /// limit; a refused attempt is not recorded.
    pub fn check(&self, key: &str, now_ms: f64) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let stamps = entries.entry(key.to_string()).or_default();
        stamps.retain(|stamp| now_ms - stamp < self.window_ms);
        if stamps.len() >= self.limit {
            return false;
        }
        stamps.push(now_ms);
        if stamps.len() > MAX_RECORDED {
            let excess = stamps.len() - MAX_RECORDED;
            stamps.drain(..excess);
        }
        true
    }

    /// Drop keys whose recorded attempts have all aged out of the window
    pub fn sweep(&self, now_ms: f64) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, stamps| {
            stamps.retain(|stamp| now_ms - stamp < self.window_ms);
            !stamps.is_empty()
        });
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

/// Periodic sweep of both admission gates
pub async fn sweep_loop(state: Arc<crate::AppState>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        let now = crate::now_ms();
        state.create_gate.sweep(now);
        state.join_gate.sweep(now);
        tracing::debug!("swept rate-limit gates");
    }
}
