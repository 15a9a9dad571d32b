//! Fixed-interval retry for races that resolve on their own

use crate::error::{ClusterError, NodeError};
use log::info;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Errors that are worth retrying
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for ClusterError {
    fn is_transient(&self) -> bool {
        ClusterError::is_transient(self)
    }
}

impl Transient for NodeError {
    fn is_transient(&self) -> bool {
        NodeError::is_transient(self)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    interval: Duration,
    max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Retries forever, sleeping `interval` between attempts
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    /// Runs `op` until it succeeds or fails with a non-transient error
    ///
    /// The first attempt starts immediately.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        E: Transient + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && self.max_attempts.map_or(true, |max| attempt < max) => {
                    info!(
                        "{} not available yet (attempt {}): {}; retrying in {:?}",
                        what, attempt, e, self.interval
                    );
                    tokio::time::sleep(self.interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
