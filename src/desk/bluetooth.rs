use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::{Peripheral, PeripheralId};
use futures::{Stream, StreamExt};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use super::link::{DeskLink, NotificationStream, StopFlag, StopReason};
use super::protocol::{
    COMMAND_CHARACTERISTIC_UUID, HEIGHT_CHARACTERISTIC_UUID, REFERENCE_INPUT_UUID,
};
use super::resolver::DeskDevice;
use crate::error::DeskError;

/// An open GATT connection to one desk.
///
/// Must be closed with [`DeskSession::disconnect`], which consumes it.
pub struct DeskSession {
    peripheral: Peripheral,
    address: String,
    height_char: Characteristic,
    command_char: Characteristic,
    reference_char: Option<Characteristic>,
    subscribed: Subscriptions,
    watcher: JoinHandle<()>,
}

impl DeskSession {
    /// Connect to a resolved desk and discover its characteristics.
    ///
    /// Losing the link afterwards requests [`StopReason::Disconnected`] on
    /// `stop`.
    pub async fn connect(
        device: &DeskDevice,
        connect_timeout: Duration,
        stop: StopFlag,
    ) -> Result<Self, DeskError> {
        let peripheral = device.peripheral.clone();

        // Register for adapter events first so a drop right after connecting
        // still reaches the watcher
        let events = device.adapter.events().await?;

        let is_connected = peripheral.is_connected().await?;
        if !is_connected {
            log::info!("Connecting to {}...", device.address);
            match timeout(connect_timeout, peripheral.connect()).await {
                Ok(Ok(())) => {
                    log::info!("Bluetooth connection established");
                }
                Ok(Err(e)) => {
                    log::error!("Bluetooth connection failed: {}", e);
                    return Err(DeskError::Connection(e.to_string()));
                }
                Err(_) => {
                    log::error!("Bluetooth connection timed out after {:?}", connect_timeout);
                    return Err(DeskError::Connection(format!(
                        "timed out after {}s",
                        connect_timeout.as_secs()
                    )));
                }
            }
        } else {
            log::info!("Desk already connected");
        }

        log::debug!("Discovering desk services and characteristics...");
        match timeout(connect_timeout, peripheral.discover_services()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = peripheral.disconnect().await;
                return Err(DeskError::Connection(format!(
                    "service discovery failed: {}",
                    e
                )));
            }
            Err(_) => {
                let _ = peripheral.disconnect().await;
                return Err(DeskError::Connection(
                    "timed out discovering services".to_string(),
                ));
            }
        }

        let chars = peripheral.characteristics();
        log::debug!("Found {} characteristics total", chars.len());
        let find = |uuid: Uuid| chars.iter().find(|c| c.uuid == uuid).cloned();

        let (Some(height_char), Some(command_char)) = (
            find(HEIGHT_CHARACTERISTIC_UUID),
            find(COMMAND_CHARACTERISTIC_UUID),
        ) else {
            log::error!(
                "Available characteristics: {:?}",
                chars.iter().map(|c| c.uuid).collect::<Vec<_>>()
            );
            let missing = if find(HEIGHT_CHARACTERISTIC_UUID).is_none() {
                HEIGHT_CHARACTERISTIC_UUID
            } else {
                COMMAND_CHARACTERISTIC_UUID
            };
            let _ = peripheral.disconnect().await;
            return Err(DeskError::MissingCharacteristic(missing));
        };

        let reference_char = find(REFERENCE_INPUT_UUID);
        if reference_char.is_none() {
            log::debug!("Desk has no reference input characteristic");
        }

        let watcher = spawn_disconnect_watcher(events, peripheral.id(), device.address.clone(), stop);

        Ok(Self {
            peripheral,
            address: device.address.clone(),
            height_char,
            command_char,
            reference_char,
            subscribed: Subscriptions::default(),
            watcher,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic, DeskError> {
        if uuid == HEIGHT_CHARACTERISTIC_UUID {
            Ok(&self.height_char)
        } else if uuid == COMMAND_CHARACTERISTIC_UUID {
            Ok(&self.command_char)
        } else if uuid == REFERENCE_INPUT_UUID {
            self.reference_char
                .as_ref()
                .ok_or(DeskError::MissingCharacteristic(uuid))
        } else {
            Err(DeskError::MissingCharacteristic(uuid))
        }
    }

    /// Release the connection. Consuming `self` keeps this to one call.
    pub async fn disconnect(self) -> Result<(), DeskError> {
        // An intentional disconnect is not a lost connection
        self.watcher.abort();

        if self.peripheral.is_connected().await? {
            self.peripheral.disconnect().await?;
            log::info!("Disconnected from desk {}", self.address);
        }
        Ok(())
    }
}

#[async_trait]
impl DeskLink for DeskSession {
    async fn read(&self, uuid: Uuid) -> Result<Vec<u8>, DeskError> {
        let characteristic = self.characteristic(uuid)?;
        let data = self.peripheral.read(characteristic).await?;
        log::debug!("Read {} bytes from {}: {:02X?}", data.len(), uuid, data);
        Ok(data)
    }

    async fn write(&self, uuid: Uuid, payload: &[u8]) -> Result<(), DeskError> {
        let characteristic = self.characteristic(uuid)?;
        self.peripheral
            .write(characteristic, payload, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, uuid: Uuid) -> Result<NotificationStream, DeskError> {
        let characteristic = self.characteristic(uuid)?.clone();
        if !self.subscribed.mark(uuid, true) {
            return Err(DeskError::AlreadySubscribed(uuid));
        }

        // Take the stream before subscribing so no early notification is lost
        let notifications = match self.peripheral.notifications().await {
            Ok(notifications) => notifications,
            Err(e) => {
                self.subscribed.mark(uuid, false);
                return Err(e.into());
            }
        };
        if let Err(e) = self.peripheral.subscribe(&characteristic).await {
            self.subscribed.mark(uuid, false);
            return Err(e.into());
        }
        log::debug!("Subscribed to {}", uuid);

        Ok(notifications
            .filter(move |n| futures::future::ready(n.uuid == uuid))
            .map(|n| n.value)
            .boxed())
    }

    async fn unsubscribe(&self, uuid: Uuid) -> Result<(), DeskError> {
        let characteristic = self.characteristic(uuid)?;
        self.subscribed.mark(uuid, false);
        self.peripheral.unsubscribe(characteristic).await?;
        log::debug!("Unsubscribed from {}", uuid);
        Ok(())
    }

    fn supports_reference_input(&self) -> bool {
        // Other stacks reject this write
        cfg!(target_os = "linux") && self.reference_char.is_some()
    }
}

/// Characteristics with notifications currently enabled
#[derive(Debug, Default)]
struct Subscriptions(Mutex<HashSet<Uuid>>);

impl Subscriptions {
    /// Record `uuid` as (un)subscribed. Returns false when nothing changed.
    fn mark(&self, uuid: Uuid, active: bool) -> bool {
        // The set stays consistent even if a holder panicked
        let mut subscribed = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if active {
            subscribed.insert(uuid)
        } else {
            subscribed.remove(&uuid)
        }
    }
}

/// How the disconnect watcher ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchEnd {
    /// The desk dropped while nothing had asked the run to stop
    Lost,
    /// The desk dropped after a stop had already been requested
    LostAfterStop,
    /// The adapter event stream closed
    EventsClosed,
}

/// Request a stop when the desk drops off
fn spawn_disconnect_watcher<S>(
    events: S,
    desk: PeripheralId,
    address: String,
    stop: StopFlag,
) -> JoinHandle<()>
where
    S: Stream<Item = CentralEvent> + Send + Unpin + 'static,
{
    let disconnected = events.filter_map(|event| {
        futures::future::ready(match event {
            CentralEvent::DeviceDisconnected(id) => Some(id),
            _ => None,
        })
    });

    tokio::spawn(async move {
        let end = watch_disconnects(disconnected, &desk, &address, &stop).await;
        log::debug!("Disconnect watcher for {} ended: {:?}", address, end);
    })
}

/// Wait until `desk` appears among the disconnected peripherals
async fn watch_disconnects<S, I>(
    mut disconnected: S,
    desk: &I,
    address: &str,
    stop: &StopFlag,
) -> WatchEnd
where
    S: Stream<Item = I> + Unpin,
    I: PartialEq,
{
    while let Some(id) = disconnected.next().await {
        if id != *desk {
            continue;
        }

        let end = if stop.is_requested() {
            WatchEnd::LostAfterStop
        } else {
            println!("Lost connection with {}", address);
            WatchEnd::Lost
        };
        log::warn!("Desk {} disconnected", address);
        stop.request(StopReason::Disconnected);
        return end;
    }

    WatchEnd::EventsClosed
}
