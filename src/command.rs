use std::time::Duration;

use log::{debug, warn};
use rusb::Direction;

use crate::device::BulkDevice;

/// Single-byte commands understood by the device firmware.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceCommand {
    /// Stop producing or consuming data.
    Stop = 0x01,

    /// Start producing bulk IN data.
    StartIn = 0x23,

    /// Start consuming bulk OUT data.
    StartOut = 0x42,
}

impl DeviceCommand {
    /// Returns the command that starts a test in `direction`.
    pub fn start(direction: Direction) -> DeviceCommand {
        match direction {
            Direction::In => DeviceCommand::StartIn,
            Direction::Out => DeviceCommand::StartOut,
        }
    }
}

impl From<DeviceCommand> for u8 {
    fn from(command: DeviceCommand) -> u8 {
        command as u8
    }
}

impl TryFrom<u8> for DeviceCommand {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(DeviceCommand::Stop),
            0x23 => Ok(DeviceCommand::StartIn),
            0x42 => Ok(DeviceCommand::StartOut),
            other => Err(other),
        }
    }
}

/// Sequences the device through its command endpoint.
///
/// Write failures are logged and returned but never touch transfer state.
/// `stop` goes out at most once per channel.
#[derive(Debug)]
pub struct CommandChannel {
    endpoint: u8,
    timeout: Duration,
    stop_sent: bool,
}

impl CommandChannel {
    pub fn new(endpoint: u8, timeout: Duration) -> CommandChannel {
        CommandChannel {
            endpoint,
            timeout,
            stop_sent: false,
        }
    }

    pub fn send<D: BulkDevice + ?Sized>(
        &mut self,
        device: &mut D,
        command: DeviceCommand,
    ) -> rusb::Result<()> {
        debug!("Sending {:?} to endpoint {:#04x}", command, self.endpoint);

        match device.write_bulk(self.endpoint, &[command.into()], self.timeout) {
            Ok(1) => Ok(()),
            Ok(_) => {
                warn!("Command {:?} was not accepted by the device", command);
                Err(rusb::Error::Io)
            }
            Err(err) => {
                warn!("Failed to send {:?}: {}", command, err);
                Err(err)
            }
        }
    }

    /// Sends `Stop`, unless this channel already did.
    pub fn stop<D: BulkDevice + ?Sized>(&mut self, device: &mut D) -> rusb::Result<()> {
        if self.stop_sent {
            return Ok(());
        }

        self.stop_sent = true;
        self.send(device, DeviceCommand::Stop)
    }

    pub fn stop_sent(&self) -> bool {
        self.stop_sent
    }
}
