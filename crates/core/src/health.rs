//! Health tracking for long-running background loops

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Consecutive-failure counter for one background loop
///
/// A loop records every iteration's outcome. Once `threshold` storage
/// failures happen in a row the loop reports degraded, until the next success.
#[derive(Debug)]
pub struct LoopHealth {
    name: &'static str,
    threshold: u32,
    consecutive_failures: AtomicU32,
    degraded: AtomicBool,
}

impl LoopHealth {
    pub fn new(name: &'static str, threshold: u32) -> Self {
        Self {
            name,
            threshold: threshold.max(1),
            consecutive_failures: AtomicU32::new(0),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if self.degraded.swap(false, Ordering::SeqCst) {
            tracing::info!(loop_name = self.name, "Loop recovered");
        }
    }

    /// Count a failed iteration
    ///
    /// # Returns
    /// Failures in a row so far, including this one
    pub fn record_failure(&self) -> u32 {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.threshold && !self.degraded.swap(true, Ordering::SeqCst) {
            tracing::error!(
                loop_name = self.name,
                failures,
                "Loop degraded after repeated storage failures"
            );
        }
        failures
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }
}

/// Aggregate health of the orchestrator's loops
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded { loops: Vec<String> },
}

impl HealthStatus {
    /// Summarize a set of loops
    pub fn from_loops<'a>(loops: impl IntoIterator<Item = &'a LoopHealth>) -> Self {
        let degraded: Vec<String> = loops
            .into_iter()
            .filter(|l| l.is_degraded())
            .map(|l| l.name().to_string())
            .collect();
        if degraded.is_empty() {
            Self::Healthy
        } else {
            Self::Degraded { loops: degraded }
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}
