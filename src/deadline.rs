use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

/// Marker error distinguishing deadline expiry from RPC failure. Callers
/// check for it with `err.is::<DeadlineExceeded>()`.
#[derive(Debug, Error)]
#[error("deadline exceeded")]
pub struct DeadlineExceeded;

/// A scoped deadline. Child scopes are always clamped to their parent, so an
/// inner timeout can never outlive the outer one.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(d: Duration) -> Self {
        Self {
            at: Instant::now() + d,
        }
    }

    /// Derive a child deadline of at most `d`, clamped to this scope.
    pub fn child(&self, d: Duration) -> Self {
        Self {
            at: self.at.min(Instant::now() + d),
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Run a fallible future under this deadline, mapping expiry to
    /// [`DeadlineExceeded`].
    pub async fn run<T, F>(&self, fut: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout_at(self.at, fut).await {
            Ok(res) => res,
            Err(_) => Err(DeadlineExceeded.into()),
        }
    }
}
