//! In-memory desk used by the controller and monitor tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::link::{DeskLink, NotificationStream};
use super::protocol::{DeskCommand, COMMAND_CHARACTERISTIC_UUID, REFERENCE_INPUT_UUID};
use crate::error::DeskError;

pub fn telemetry(height: u16, speed: i16) -> Vec<u8> {
    let mut payload = height.to_le_bytes().to_vec();
    payload.extend_from_slice(&speed.to_le_bytes());
    payload
}

pub struct ScriptedLink {
    height: Vec<u8>,
    notifications: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    writes: Mutex<Vec<(Uuid, Vec<u8>)>>,
    pub unsubscribes: AtomicUsize,
    reference_input: bool,
    fail_reference_input: bool,
    fail_commands: bool,
    hang_subscribe: bool,
}

impl ScriptedLink {
    /// A desk resting at `height` raw units; notifications are fed through
    /// the returned sender.
    pub fn new(height: u16) -> (Self, mpsc::UnboundedSender<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Self {
            height: telemetry(height, 0),
            notifications: Mutex::new(Some(rx)),
            writes: Mutex::new(Vec::new()),
            unsubscribes: AtomicUsize::new(0),
            reference_input: true,
            fail_reference_input: false,
            fail_commands: false,
            hang_subscribe: false,
        };
        (link, tx)
    }

    pub fn without_reference_input(mut self) -> Self {
        self.reference_input = false;
        self
    }

    pub fn failing_reference_input(mut self) -> Self {
        self.fail_reference_input = true;
        self
    }

    pub fn failing_commands(mut self) -> Self {
        self.fail_commands = true;
        self
    }

    /// Subscribing never completes, like a stalled GATT stack
    pub fn hanging_subscribe(mut self) -> Self {
        self.hang_subscribe = true;
        self
    }

    pub fn is_subscribed(&self) -> bool {
        self.notifications.lock().unwrap().is_none()
    }

    /// Successful writes, decoded back into commands
    pub fn commands(&self) -> Vec<DeskCommand> {
        const ALL: [DeskCommand; 6] = [
            DeskCommand::Up,
            DeskCommand::Down,
            DeskCommand::Stop,
            DeskCommand::ReferenceInputStop,
            DeskCommand::ReferenceInputUp,
            DeskCommand::ReferenceInputDown,
        ];

        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(uuid, bytes)| {
                ALL.into_iter().find(|command| {
                    command.characteristic() == *uuid && command.to_bytes()[..] == bytes[..]
                })
            })
            .collect()
    }
}

#[async_trait]
impl DeskLink for ScriptedLink {
    async fn read(&self, _uuid: Uuid) -> Result<Vec<u8>, DeskError> {
        Ok(self.height.clone())
    }

    async fn write(&self, uuid: Uuid, payload: &[u8]) -> Result<(), DeskError> {
        if (uuid == COMMAND_CHARACTERISTIC_UUID && self.fail_commands)
            || (uuid == REFERENCE_INPUT_UUID && self.fail_reference_input)
        {
            return Err(DeskError::Ble(btleplug::Error::NotConnected));
        }
        self.writes.lock().unwrap().push((uuid, payload.to_vec()));
        Ok(())
    }

    async fn subscribe(&self, uuid: Uuid) -> Result<NotificationStream, DeskError> {
        if self.hang_subscribe {
            std::future::pending::<()>().await;
        }
        let rx = self
            .notifications
            .lock()
            .unwrap()
            .take()
            .ok_or(DeskError::AlreadySubscribed(uuid))?;

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|payload| (payload, rx))
        })
        .boxed())
    }

    async fn unsubscribe(&self, _uuid: Uuid) -> Result<(), DeskError> {
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn supports_reference_input(&self) -> bool {
        self.reference_input
    }
}
