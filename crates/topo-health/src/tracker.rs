//! Liveness debounce for a single member.
//!
//! A member that just passed readiness starts `Healthy`. It flips to
//! `Unhealthy` after `failure_threshold` consecutive failed probes and back
//! after `success_threshold` consecutive successes, so a single dropped
//! probe never removes a member from service.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use topo_runtime::ProbeResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug)]
pub struct HealthTracker {
    status: HealthStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    failure_threshold: u32,
    success_threshold: u32,
    /// When the member last became unhealthy.
    unhealthy_since: Option<Instant>,
}

impl HealthTracker {
    pub fn new(failure_threshold: u32, success_threshold: u32) -> Self {
        Self {
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
            consecutive_successes: 0,
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            unhealthy_since: None,
        }
    }

    /// Record a probe result and return the resulting status.
    pub fn record(&mut self, result: ProbeResult) -> HealthStatus {
        match result {
            ProbeResult::Healthy => {
                self.consecutive_failures = 0;
                self.consecutive_successes += 1;

                if self.status == HealthStatus::Unhealthy
                    && self.consecutive_successes >= self.success_threshold
                {
                    debug!(successes = self.consecutive_successes, "member recovered");
                    self.status = HealthStatus::Healthy;
                    self.unhealthy_since = None;
                }
            }
            ProbeResult::Unhealthy | ProbeResult::Failed => {
                self.consecutive_successes = 0;
                self.consecutive_failures += 1;

                if self.status == HealthStatus::Healthy
                    && self.consecutive_failures >= self.failure_threshold
                {
                    warn!(
                        failures = self.consecutive_failures,
                        threshold = self.failure_threshold,
                        "member marked unhealthy"
                    );
                    self.status = HealthStatus::Unhealthy;
                    self.unhealthy_since = Some(Instant::now());
                }
            }
        }
        self.status
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// How long the member has been unhealthy, if it is.
    pub fn unhealthy_for(&self) -> Option<Duration> {
        self.unhealthy_since.map(|since| since.elapsed())
    }
}
