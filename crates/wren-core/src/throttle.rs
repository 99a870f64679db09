//! Sliding-window rate limiter for outbound writes.
//!
//! Process-local on purpose: the limiter protects against local burst rate,
//! not cross-process coordination, so losing the window on restart is fine.

use std::{collections::VecDeque, time::Duration};

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    admissions: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            // max_requests == 0 would never admit; the contract is that
            // admission always eventually succeeds.
            max_requests: max_requests.max(1),
            window,
            admissions: Mutex::new(VecDeque::new()),
        }
    }

    /// Wait until the trailing window has capacity, then take a slot.
    ///
    /// An explicit loop rather than recursion: after each sleep the window is
    /// re-evaluated, because concurrent callers may have taken the freed slot
    /// in the interim. Never rejects; there is no maximum wait. Callers that
    /// need a ceiling wrap this in their own timeout.
    pub async fn admit(&self) {
        loop {
            let wait = {
                let mut slots = self.admissions.lock().await;
                let now = Instant::now();

                while slots
                    .front()
                    .map(|t| now.duration_since(*t) >= self.window)
                    .unwrap_or(false)
                {
                    slots.pop_front();
                }

                if slots.len() < self.max_requests {
                    slots.push_back(now);
                    return;
                }

                match slots.front() {
                    Some(oldest) => self.window.saturating_sub(now.duration_since(*oldest)),
                    None => Duration::ZERO,
                }
            };

            sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}
