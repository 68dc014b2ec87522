//! Per-mint circuit breaker (component D): 3 failures in a 60 s sliding
//! window opens the circuit for a 30 s cooldown, then one trial call is
//! allowed through (half-open) before fully closing again.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const FAILURE_WINDOW: Duration = Duration::from_secs(60);
const FAILURE_THRESHOLD: usize = 3;
const COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerState {
    state: State,
    failures: Vec<Instant>,
    opened_at: Option<Instant>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: State::Closed,
            failures: Vec::new(),
            opened_at: None,
        }
    }

    fn can_call(&mut self, now: Instant) -> bool {
        match self.state {
            State::Closed | State::HalfOpen => true,
            State::Open => {
                let opened_at = self.opened_at.expect("open state always has opened_at");
                if now.duration_since(opened_at) >= COOLDOWN {
                    self.state = State::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn on_failure(&mut self, now: Instant) {
        match self.state {
            State::HalfOpen => {
                self.state = State::Open;
                self.opened_at = Some(now);
                self.failures.clear();
            }
            State::Closed | State::Open => {
                self.failures.retain(|t| now.duration_since(*t) < FAILURE_WINDOW);
                self.failures.push(now);
                if self.failures.len() >= FAILURE_THRESHOLD {
                    self.state = State::Open;
                    self.opened_at = Some(now);
                    self.failures.clear();
                }
            }
        }
    }

    fn on_success(&mut self) {
        self.state = State::Closed;
        self.failures.clear();
        self.opened_at = None;
    }
}

/// Registry of one breaker per mint URL, populated lazily under a single
/// mutex. Redeem is already I/O-bound, so lock contention here is noise.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, BreakerState>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn can_call(&self, mint_url: &str) -> bool {
        let mut breakers = self.breakers.lock().unwrap();
        breakers
            .entry(mint_url.to_string())
            .or_insert_with(BreakerState::new)
            .can_call(Instant::now())
    }

    pub fn on_failure(&self, mint_url: &str) {
        let mut breakers = self.breakers.lock().unwrap();
        breakers
            .entry(mint_url.to_string())
            .or_insert_with(BreakerState::new)
            .on_failure(Instant::now());
    }

    pub fn on_success(&self, mint_url: &str) {
        let mut breakers = self.breakers.lock().unwrap();
        breakers
            .entry(mint_url.to_string())
            .or_insert_with(BreakerState::new)
            .on_success();
    }
}
