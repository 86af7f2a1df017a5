//! Closed-loop movement to a target height.
//!
//! The desk only understands "run up" and "run down" pulses of about one
//! second (roughly 16 height notifications). The controller re-issues the
//! pulse every [`RESEND_INTERVAL`] notifications so the motor never coasts,
//! and stops as soon as a reported height lands within tolerance.

use std::time::Duration;

use futures::StreamExt;

use super::link::{DeskLink, NotificationStream, StopFlag, StopReason};
use super::protocol::{DeskCommand, Telemetry, HEIGHT_CHARACTERISTIC_UUID};
use super::units::{max_raw_height, raw_to_mm, raw_to_speed};
use crate::error::{ConfigError, DeskError};

/// Notifications between re-issued movement commands
pub const RESEND_INTERVAL: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn towards(target: u16, current: u16) -> Self {
        if target > current {
            Self::Up
        } else {
            Self::Down
        }
    }

    pub fn command(self) -> DeskCommand {
        match self {
            Self::Up => DeskCommand::Up,
            Self::Down => DeskCommand::Down,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovePhase {
    Idle,
    AwaitingFirstCommand,
    Driving,
    Converged,
    TimedOut,
    Interrupted,
    Cancelled,
    Disconnected,
}

/// How a move ended, when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    /// Already within tolerance, nothing was sent
    AlreadyAtTarget { height: u16 },
    /// Reached the target and stopped the desk
    Converged { height: u16 },
    /// Gave up waiting; the desk is left as it was
    TimedOut { last_height: u16 },
    /// The desk stopped on its own away from the target, e.g. after a
    /// button press on the desk panel
    Interrupted { height: u16 },
    /// A shutdown was requested mid-move
    Cancelled { last_height: u16 },
}

impl MoveOutcome {
    pub fn issued_commands(&self) -> bool {
        !matches!(self, Self::AlreadyAtTarget { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveRequest {
    /// Destination in raw units
    pub target: u16,
    /// Convergence band in raw units
    pub tolerance: u16,
    pub timeout: Duration,
    /// End the move when the desk reports speed 0 away from the target
    pub detect_interference: bool,
}

pub fn has_reached_target(height: u16, target: u16, tolerance: u16) -> bool {
    height.abs_diff(target) <= tolerance
}

/// What the driver must do after a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
    Wait,
    Resend(Direction),
    Stop,
    Halt,
}

/// State of one move, owned by the driver loop
#[derive(Debug)]
struct MoveSession {
    target: u16,
    tolerance: u16,
    direction: Direction,
    resend_count: u32,
    phase: MovePhase,
    last_height: u16,
    seen_motion: bool,
    detect_interference: bool,
}

impl MoveSession {
    fn new(request: &MoveRequest, initial: Telemetry) -> Self {
        Self {
            target: request.target,
            tolerance: request.tolerance,
            direction: Direction::towards(request.target, initial.height),
            resend_count: 0,
            phase: MovePhase::Idle,
            last_height: initial.height,
            seen_motion: false,
            detect_interference: request.detect_interference,
        }
    }

    fn enter(&mut self, phase: MovePhase) {
        log::debug!("Move phase {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    fn on_telemetry(&mut self, telemetry: Telemetry) -> Intent {
        self.resend_count += 1;
        self.last_height = telemetry.height;

        log::info!(
            "Height: {:4.0}mm Target: {:4.0}mm Speed: {:2.0}mm/s",
            raw_to_mm(telemetry.height),
            raw_to_mm(self.target),
            raw_to_speed(telemetry.speed)
        );

        if has_reached_target(telemetry.height, self.target, self.tolerance) {
            return Intent::Stop;
        }

        if telemetry.speed != 0 {
            self.seen_motion = true;
        } else if self.detect_interference && self.seen_motion {
            return Intent::Halt;
        }

        if self.resend_count >= RESEND_INTERVAL {
            self.resend_count = 0;
            Intent::Resend(self.direction)
        } else {
            Intent::Wait
        }
    }
}

/// Drive the desk to `request.target`.
///
/// Returns `Err` only for failures that end the run: a lost connection, a
/// malformed notification or a failed command write. Timing out is an
/// outcome, not an error.
pub async fn move_to<L>(
    link: &L,
    request: &MoveRequest,
    stop: &StopFlag,
) -> Result<MoveOutcome, DeskError>
where
    L: DeskLink + ?Sized,
{
    if request.target > max_raw_height() {
        let mm = raw_to_mm(request.target).round() as u16;
        return Err(ConfigError::TargetOutOfRange(mm).into());
    }
    if stop.reason() == Some(StopReason::Disconnected) {
        return Err(DeskError::Disconnected);
    }

    let initial = Telemetry::decode(&link.read(HEIGHT_CHARACTERISTIC_UUID).await?)?;

    if has_reached_target(initial.height, request.target, request.tolerance) {
        log::info!(
            "Desk already at {:.0}mm (target {:.0}mm)",
            initial.height_mm(),
            raw_to_mm(request.target)
        );
        return Ok(MoveOutcome::AlreadyAtTarget {
            height: initial.height,
        });
    }

    if stop.is_requested() {
        return Ok(MoveOutcome::Cancelled {
            last_height: initial.height,
        });
    }

    let mut session = MoveSession::new(request, initial);
    session.enter(MovePhase::AwaitingFirstCommand);
    log::info!(
        "Moving {:?} from {:.0}mm to {:.0}mm",
        session.direction,
        initial.height_mm(),
        raw_to_mm(request.target)
    );

    // Subscribing is part of the move and bounded the same way
    let mut subscribed = false;
    let driven = tokio::time::timeout(
        request.timeout,
        subscribe_and_drive(link, &mut session, stop, &mut subscribed),
    )
    .await;

    let phase = match driven {
        Ok(Ok(phase)) => phase,
        Err(_) => MovePhase::TimedOut,
        Ok(Err(DeskError::Disconnected)) => {
            session.enter(MovePhase::Disconnected);
            log::error!("Lost connection while moving");
            return Err(DeskError::Disconnected);
        }
        Ok(Err(e @ DeskError::Decode(_))) => {
            log::error!("Aborting move: {}", e);
            if let Err(stop_err) = link.stop().await {
                log::warn!("Failed to stop desk after bad telemetry: {}", stop_err);
            }
            release(link, subscribed).await;
            return Err(e);
        }
        Ok(Err(e)) => {
            log::error!("Aborting move: {}", e);
            release(link, subscribed).await;
            return Err(e);
        }
    };

    session.enter(phase);
    release(link, subscribed).await;

    let outcome = match phase {
        MovePhase::Converged => MoveOutcome::Converged {
            height: session.last_height,
        },
        MovePhase::Interrupted => {
            log::warn!(
                "Desk stopped at {:.0}mm before reaching the target",
                raw_to_mm(session.last_height)
            );
            MoveOutcome::Interrupted {
                height: session.last_height,
            }
        }
        MovePhase::Cancelled => MoveOutcome::Cancelled {
            last_height: session.last_height,
        },
        _ => {
            log::warn!("Timed out while waiting for desk after {:?}", request.timeout);
            MoveOutcome::TimedOut {
                last_height: session.last_height,
            }
        }
    };

    Ok(outcome)
}

async fn subscribe_and_drive<L>(
    link: &L,
    session: &mut MoveSession,
    stop: &StopFlag,
    subscribed: &mut bool,
) -> Result<MovePhase, DeskError>
where
    L: DeskLink + ?Sized,
{
    let mut notifications =
        match stop.unless_requested(link.subscribe(HEIGHT_CHARACTERISTIC_UUID)).await {
            Ok(notifications) => notifications?,
            Err(reason) => return stopped(reason),
        };
    *subscribed = true;
    drive(link, session, &mut notifications, stop).await
}

/// Issue the first pulse, then react to notifications until a terminal phase
async fn drive<L>(
    link: &L,
    session: &mut MoveSession,
    notifications: &mut NotificationStream,
    stop: &StopFlag,
) -> Result<MovePhase, DeskError>
where
    L: DeskLink + ?Sized,
{
    link.send(session.direction.command()).await?;
    session.enter(MovePhase::Driving);

    loop {
        let payload = tokio::select! {
            biased;
            reason = stop.requested() => return stopped(reason),
            payload = notifications.next() => match payload {
                Some(payload) => payload,
                None => return Err(DeskError::Disconnected),
            },
        };

        let telemetry = Telemetry::decode(&payload)?;

        match session.on_telemetry(telemetry) {
            Intent::Wait => {}
            Intent::Resend(direction) => link.send(direction.command()).await?,
            Intent::Stop => {
                link.stop().await?;
                return Ok(MovePhase::Converged);
            }
            Intent::Halt => return Ok(MovePhase::Interrupted),
        }
    }
}

fn stopped(reason: StopReason) -> Result<MovePhase, DeskError> {
    match reason {
        StopReason::Shutdown => Ok(MovePhase::Cancelled),
        StopReason::Disconnected => Err(DeskError::Disconnected),
    }
}

/// Drop the height subscription, if one was made
async fn release<L>(link: &L, subscribed: bool)
where
    L: DeskLink + ?Sized,
{
    if !subscribed {
        return;
    }
    if let Err(e) = link.unsubscribe(HEIGHT_CHARACTERISTIC_UUID).await {
        log::warn!("Failed to unsubscribe from height notifications: {}", e);
    }
}
