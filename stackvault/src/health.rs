//! Health verifier: polls a container until its state converges.
//!
//! A container without a probe converges once it runs with a live process.
//! With a probe, only an explicit healthy or unhealthy verdict is terminal.
//! Polling uses a fixed interval; the timeout is the only bound.

use std::fmt;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::runtime::{ContainerRuntime, HealthStatus};
use crate::utils::errors::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    Healthy,
    Unhealthy,
    TimedOut,
    /// The container no longer exists
    Vanished,
    /// The container left the running state
    Stopped,
}

impl HealthOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthOutcome::Healthy)
    }
}

impl fmt::Display for HealthOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthOutcome::Healthy => "healthy",
            HealthOutcome::Unhealthy => "unhealthy",
            HealthOutcome::TimedOut => "timed out",
            HealthOutcome::Vanished => "vanished",
            HealthOutcome::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Poll `container` every `interval` until it converges or `timeout` elapses.
pub async fn await_healthy(
    runtime: &dyn ContainerRuntime,
    container: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<HealthOutcome> {
    let deadline = Instant::now() + timeout;

    loop {
        let Some(state) = runtime.inspect(container).await? else {
            return Ok(HealthOutcome::Vanished);
        };

        if !state.running {
            return Ok(HealthOutcome::Stopped);
        }

        if state.has_probe {
            match state.health {
                HealthStatus::Healthy => return Ok(HealthOutcome::Healthy),
                HealthStatus::Unhealthy => return Ok(HealthOutcome::Unhealthy),
                HealthStatus::Starting | HealthStatus::None => {
                    debug!(container, "Health probe pending");
                }
            }
        } else if state.pid > 0 {
            return Ok(HealthOutcome::Healthy);
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(HealthOutcome::TimedOut);
        }
        sleep(interval.min(deadline - now)).await;
    }
}
