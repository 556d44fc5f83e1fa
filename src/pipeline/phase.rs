// file: src/pipeline/phase.rs
// version: 1.1.0
// guid: 6b2d8f40-1c9e-4a75-93d6-a0e4b7c15f28

//! Pipeline phases and cooperative cancellation

use crate::error::ProvisionError;
use crate::Result;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Provisioning phases in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Phase {
    ValidateIntent,
    ResolveIdentity,
    ResolveImage,
    ResolveDevice,
    RenderSeed,
    AcquireDevice,
    WriteImage,
    AppendSeedPartition,
    PlaceSeed,
    ReleaseDevice,
    RecordNode,
}

impl Phase {
    pub const ALL: [Phase; 11] = [
        Phase::ValidateIntent,
        Phase::ResolveIdentity,
        Phase::ResolveImage,
        Phase::ResolveDevice,
        Phase::RenderSeed,
        Phase::AcquireDevice,
        Phase::WriteImage,
        Phase::AppendSeedPartition,
        Phase::PlaceSeed,
        Phase::ReleaseDevice,
        Phase::RecordNode,
    ];

    pub const TOTAL: usize = Self::ALL.len();

    /// 1-based position
    pub fn step(&self) -> usize {
        *self as usize + 1
    }

    pub fn name(&self) -> &'static str {
        match self {
            Phase::ValidateIntent => "ValidateIntent",
            Phase::ResolveIdentity => "ResolveIdentity",
            Phase::ResolveImage => "ResolveImage",
            Phase::ResolveDevice => "ResolveDevice",
            Phase::RenderSeed => "RenderSeed",
            Phase::AcquireDevice => "AcquireDevice",
            Phase::WriteImage => "WriteImage",
            Phase::AppendSeedPartition => "AppendSeedPartition",
            Phase::PlaceSeed => "PlaceSeed",
            Phase::ReleaseDevice => "ReleaseDevice",
            Phase::RecordNode => "RecordNode",
        }
    }

    /// Phases that touch the device; never retried automatically
    pub fn is_destructive(&self) -> bool {
        (Phase::AcquireDevice..=Phase::ReleaseDevice).contains(self)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shared cancellation signal.
///
/// Pure phases are raced against it and stop as soon as it fires; destructive
/// phases only look at it at subphase boundaries, so a raw write in flight
/// always runs to completion or timeout.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: CancellationToken,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Resolves once cancellation was requested
    pub async fn cancelled(&self) {
        self.inner.cancelled().await
    }

    /// `Err(Canceled)` naming `at` once cancellation was requested
    pub fn check(&self, at: impl fmt::Display) -> Result<()> {
        if self.is_canceled() {
            Err(ProvisionError::canceled(at.to_string()))
        } else {
            Ok(())
        }
    }

    /// Drive `work` unless cancellation arrives first; `work` is dropped then
    pub async fn run<T, F>(&self, at: impl fmt::Display, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.inner.cancelled() => Err(ProvisionError::canceled(at.to_string())),
            result = work => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_steps_are_one_based_and_ordered() {
        assert_eq!(Phase::ValidateIntent.step(), 1);
        assert_eq!(Phase::RecordNode.step(), Phase::TOTAL);
        assert!(Phase::ALL.windows(2).all(|w| w[0].step() + 1 == w[1].step()));
    }

    #[test]
    fn test_destructive_range() {
        let destructive: Vec<Phase> = Phase::ALL.into_iter().filter(Phase::is_destructive).collect();
        assert_eq!(destructive.first(), Some(&Phase::AcquireDevice));
        assert_eq!(destructive.last(), Some(&Phase::ReleaseDevice));
        assert_eq!(destructive.len(), 5);
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check("RenderSeed").is_ok());

        clone.cancel();

        let err = token.check("RenderSeed").unwrap_err();
        assert_eq!(err.code(), "CANCELED");
        assert!(err.to_string().contains("RenderSeed"));
    }

    #[tokio::test]
    async fn test_run_interrupts_pending_work() {
        let token = CancelToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();

        let result: Result<()> = token
            .run("ResolveImage", async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;

        assert_eq!(result.unwrap_err().code(), "CANCELED");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_run_passes_through_when_not_canceled() {
        let token = CancelToken::new();

        let value = token.run("RenderSeed", async { Ok(7) }).await.unwrap();

        assert_eq!(value, 7);
    }
}
