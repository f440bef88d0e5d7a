//! Circuit breaker guarding a remote tier
//!
//! Consecutive failures open the breaker; while open every call is skipped.
//! After the cool-down one probe is let through (half-open). A successful
//! probe closes the breaker, a failed one re-opens it.

use crate::config::BreakerConfig;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    probe_started: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: BreakerConfig) -> Self {
        Self {
            name,
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
                probe_started: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Check if a call should be allowed through
    ///
    /// In half-open state only one caller at a time gets `true`.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.cool_down)
                    .unwrap_or(true);
                if cooled {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    inner.probe_started = Some(Instant::now());
                    info!("{} breaker half-open, probing", self.name);
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight && !self.probe_abandoned(&inner) {
                    false
                } else {
                    inner.probe_in_flight = true;
                    inner.probe_started = Some(Instant::now());
                    true
                }
            }
        }
    }

    /// Whether calls are currently being skipped
    pub fn is_open(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            BreakerState::Closed => false,
            BreakerState::HalfOpen => inner.probe_in_flight && !self.probe_abandoned(&inner),
            BreakerState::Open => inner
                .opened_at
                .map(|at| at.elapsed() < self.config.cool_down)
                .unwrap_or(false),
        }
    }

    /// A probe whose caller went away never reports back
    fn probe_abandoned(&self, inner: &Inner) -> bool {
        inner
            .probe_started
            .map(|at| at.elapsed() >= self.config.cool_down)
            .unwrap_or(true)
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != BreakerState::Closed {
            info!("{} breaker closed, normal operation resumed", self.name);
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
        inner.probe_started = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.probe_in_flight = false;

        let trip = match inner.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            BreakerState::Open => false,
        };
        if trip {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            warn!(
                "{} breaker opened after {} consecutive failures, skipping for {:?}",
                self.name, inner.consecutive_failures, self.config.cool_down
            );
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn cool_down(&self) -> Duration {
        self.config.cool_down
    }
}
