pub mod bluetooth;
pub mod link;
pub mod monitor;
pub mod movement;
pub mod protocol;
pub mod resolver;
pub mod units;

#[cfg(test)]
mod testing;

pub use bluetooth::DeskSession;
pub use link::{DeskLink, StopFlag, StopReason};
pub use movement::{MoveOutcome, MoveRequest};
pub use resolver::{DeviceCache, DeviceResolver, Discovery};
