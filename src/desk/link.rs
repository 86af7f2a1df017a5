//! The GATT operations the movement controller needs from a connected desk,
//! and the stop flag shared between the run lifecycle and in-flight moves.

use std::future::Future;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::protocol::DeskCommand;
use crate::error::DeskError;

/// Raw payloads notified on one characteristic
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

/// An open GATT session to one desk
#[async_trait]
pub trait DeskLink: Send + Sync {
    /// One-shot read of a characteristic
    async fn read(&self, uuid: Uuid) -> Result<Vec<u8>, DeskError>;

    async fn write(&self, uuid: Uuid, payload: &[u8]) -> Result<(), DeskError>;

    /// Start notifications on a characteristic.
    ///
    /// Only one subscription per characteristic may be active. The stream
    /// ends when the transport drops.
    async fn subscribe(&self, uuid: Uuid) -> Result<NotificationStream, DeskError>;

    async fn unsubscribe(&self, uuid: Uuid) -> Result<(), DeskError>;

    /// Whether the stack accepts writes to the reference input characteristic
    fn supports_reference_input(&self) -> bool {
        cfg!(target_os = "linux")
    }

    async fn send(&self, command: DeskCommand) -> Result<(), DeskError> {
        log::debug!("Sending command: {:?} -> bytes: {:02X?}", command, command.to_bytes());
        self.write(command.characteristic(), &command.to_bytes()).await
    }

    /// Stop the desk the way the vendor app does: stop on the command
    /// characteristic, then stop on the reference input where supported.
    /// Only the first write can fail the stop.
    async fn stop(&self) -> Result<(), DeskError> {
        self.send(DeskCommand::Stop).await?;

        if self.supports_reference_input() {
            if let Err(e) = self.send(DeskCommand::ReferenceInputStop).await {
                log::debug!("Reference input stop ignored: {}", e);
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// SIGINT/SIGTERM asked the process to wind down
    Shutdown,
    /// The transport reported the desk gone
    Disconnected,
}

/// Cancellation shared by the signal handler, the disconnect watcher and
/// any running move or monitor loop. The first reason recorded wins.
#[derive(Debug, Clone, Default)]
pub struct StopFlag {
    token: CancellationToken,
    reason: Arc<OnceLock<StopReason>>,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, reason: StopReason) {
        if self.reason.set(reason).is_ok() {
            log::debug!("Stop requested: {:?}", reason);
        }
        self.token.cancel();
    }

    pub fn reason(&self) -> Option<StopReason> {
        self.reason.get().copied()
    }

    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once a stop has been requested
    pub async fn requested(&self) -> StopReason {
        self.token.cancelled().await;
        self.reason().unwrap_or(StopReason::Shutdown)
    }

    /// Run `future` to completion unless a stop is requested first, in
    /// which case it is dropped
    pub async fn unless_requested<F>(&self, future: F) -> Result<F::Output, StopReason>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            reason = self.requested() => Err(reason),
            output = future => Ok(output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_reason_wins() {
        let stop = StopFlag::new();
        assert!(!stop.is_requested());
        assert_eq!(stop.reason(), None);

        stop.request(StopReason::Disconnected);
        stop.request(StopReason::Shutdown);

        assert!(stop.is_requested());
        assert_eq!(stop.reason(), Some(StopReason::Disconnected));
    }

    #[tokio::test]
    async fn test_clones_observe_request() {
        let stop = StopFlag::new();
        let watcher = stop.clone();

        let handle = tokio::spawn(async move { watcher.requested().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        stop.request(StopReason::Shutdown);

        let reason = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, StopReason::Shutdown);
    }

    #[tokio::test]
    async fn test_unless_requested_abandons_pending_work() {
        let stop = StopFlag::new();
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.request(StopReason::Disconnected);
        });

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            stop.unless_requested(std::future::pending::<()>()),
        )
        .await
        .expect("a stop should abandon the pending future");

        assert_eq!(result, Err(StopReason::Disconnected));
    }

    #[tokio::test]
    async fn test_unless_requested_passes_output_through() {
        let stop = StopFlag::new();
        assert_eq!(stop.unless_requested(async { 42 }).await, Ok(42));

        stop.request(StopReason::Shutdown);
        assert_eq!(
            stop.unless_requested(async { 42 }).await,
            Err(StopReason::Shutdown)
        );
    }
}
