use futures::StreamExt;

use super::link::{DeskLink, StopFlag, StopReason};
use super::protocol::{Telemetry, HEIGHT_CHARACTERISTIC_UUID};
use crate::error::DeskError;

/// Report every height notification until a stop is requested.
///
/// A shutdown ends the watch normally; losing the desk is an error.
pub async fn watch<L, F>(link: &L, stop: &StopFlag, mut report: F) -> Result<(), DeskError>
where
    L: DeskLink + ?Sized,
    F: FnMut(Telemetry),
{
    let mut notifications =
        match stop.unless_requested(link.subscribe(HEIGHT_CHARACTERISTIC_UUID)).await {
            Ok(notifications) => notifications?,
            Err(reason) => return stopped(reason),
        };
    log::info!("Monitoring desk height, press Ctrl-C to stop");

    let result = loop {
        tokio::select! {
            biased;
            reason = stop.requested() => break stopped(reason),
            payload = notifications.next() => match payload {
                Some(payload) => match Telemetry::decode(&payload) {
                    Ok(telemetry) => report(telemetry),
                    Err(e) => log::warn!("Skipping malformed notification: {}", e),
                },
                None => break Err(DeskError::Disconnected),
            },
        }
    };
    drop(notifications);

    if !matches!(result, Err(DeskError::Disconnected)) {
        if let Err(e) = link.unsubscribe(HEIGHT_CHARACTERISTIC_UUID).await {
            log::warn!("Failed to unsubscribe from height notifications: {}", e);
        }
    }

    result
}

fn stopped(reason: StopReason) -> Result<(), DeskError> {
    match reason {
        StopReason::Shutdown => Ok(()),
        StopReason::Disconnected => Err(DeskError::Disconnected),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desk::testing::{telemetry, ScriptedLink};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[tokio::test]
    async fn test_reports_until_shutdown() {
        let (link, tx) = ScriptedLink::new(0);
        tx.send(telemetry(100, 10)).unwrap();
        tx.send(vec![0x00]).unwrap();
        tx.send(telemetry(200, -10)).unwrap();

        let stop = StopFlag::new();
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.request(StopReason::Shutdown);
        });

        let mut seen = Vec::new();
        watch(&link, &stop, |t| seen.push(t.height)).await.unwrap();

        assert_eq!(seen, vec![100, 200]);
        assert_eq!(link.unsubscribes.load(Ordering::SeqCst), 1);
        assert!(link.commands().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_is_an_error() {
        let (link, _tx) = ScriptedLink::new(0);
        let stop = StopFlag::new();
        stop.request(StopReason::Disconnected);

        let result = watch(&link, &stop, |_| {}).await;

        assert!(matches!(result, Err(DeskError::Disconnected)));
        assert_eq!(link.unsubscribes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_during_stalled_subscribe() {
        let (link, _tx) = ScriptedLink::new(0);
        let link = link.hanging_subscribe();
        let stop = StopFlag::new();

        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.request(StopReason::Shutdown);
        });

        let result = tokio::time::timeout(Duration::from_secs(1), watch(&link, &stop, |_| {}))
            .await
            .expect("a shutdown should end the watch while subscribing");

        assert!(result.is_ok());
        assert_eq!(link.unsubscribes.load(Ordering::SeqCst), 0);
    }
}
