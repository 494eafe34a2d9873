//! Compiled-in benchmark settings.
//!
//! The safe queue depth differs by direction. The reference device happily
//! keeps sixteen IN transfers in flight, but cannot sink more than one
//! concurrent OUT transfer: deeper OUT queues fail with `NotFound` on
//! submission or `NoDevice` on completion. Validate both values against the
//! actual hardware before trusting a result.

use std::time::Duration;

use libc::c_int;
use rusb::Direction;

use crate::error::SetupError;

pub const VENDOR_ID: u16 = 0x16d0;
pub const PRODUCT_ID: u16 = 0x0f3b;

pub const INTERFACE_NUMBER: u8 = 0;
pub const BULK_ENDPOINT_NUMBER: u8 = 1;
pub const COMMAND_ENDPOINT_NUMBER: u8 = 2;

/// Total amount of data exchanged by each test.
pub const TEST_DATA_SIZE: u64 = 1024 * 1024;

/// Size of each individual IN transfer.
pub const TEST_TRANSFER_SIZE: usize = 16 * 1024;

/// Size of each individual OUT transfer, one high-speed bulk packet.
pub const OUT_TRANSFER_SIZE: usize = 512;

pub const IN_QUEUE_DEPTH: usize = 16;
pub const OUT_QUEUE_DEPTH: usize = 1;

pub const TRANSFER_TIMEOUT: Duration = Duration::from_millis(1000);
pub const COMMAND_TIMEOUT: Duration = Duration::from_millis(1000);

/// Upper bound on waiting for cancellations at teardown.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a single event-handling call may block before the loop re-checks
/// its state.
pub const EVENT_TIMEOUT: Duration = Duration::from_millis(100);

/// Pause between the IN and OUT tests.
pub const TEST_INTERVAL: Duration = Duration::from_secs(1);

/// What to do with a transfer that completes with a stalled endpoint.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StallRecovery {
    /// Log and leave the slot idle.
    LeaveIdle,

    /// Cancel the queue, clear the endpoint halt once nothing is in flight and
    /// re-arm every slot. Once `max_attempts` recoveries have been spent in a
    /// run, the next stall fails the run.
    ClearHalt { max_attempts: u32 },
}

impl Default for StallRecovery {
    fn default() -> Self {
        StallRecovery::ClearHalt { max_attempts: 3 }
    }
}

/// Identity and endpoint layout of the device under test.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    pub interface: u8,
    pub bulk_endpoint: u8,
    pub command_endpoint: u8,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            vendor_id: VENDOR_ID,
            product_id: PRODUCT_ID,
            interface: INTERFACE_NUMBER,
            bulk_endpoint: BULK_ENDPOINT_NUMBER,
            command_endpoint: COMMAND_ENDPOINT_NUMBER,
        }
    }
}

/// Settings for one benchmark run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchConfig {
    pub device: DeviceConfig,
    pub test_data_size: u64,
    pub transfer_size: usize,
    pub out_transfer_size: usize,
    pub in_queue_depth: usize,
    pub out_queue_depth: usize,
    pub transfer_timeout: Duration,
    pub command_timeout: Duration,
    pub drain_timeout: Duration,
    pub event_timeout: Duration,
    pub stall_recovery: StallRecovery,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            device: DeviceConfig::default(),
            test_data_size: TEST_DATA_SIZE,
            transfer_size: TEST_TRANSFER_SIZE,
            out_transfer_size: OUT_TRANSFER_SIZE,
            in_queue_depth: IN_QUEUE_DEPTH,
            out_queue_depth: OUT_QUEUE_DEPTH,
            transfer_timeout: TRANSFER_TIMEOUT,
            command_timeout: COMMAND_TIMEOUT,
            drain_timeout: DRAIN_TIMEOUT,
            event_timeout: EVENT_TIMEOUT,
            stall_recovery: StallRecovery::default(),
        }
    }
}

impl BenchConfig {
    /// Returns the number of transfers kept in flight for `direction`.
    pub fn queue_depth(&self, direction: Direction) -> usize {
        match direction {
            Direction::In => self.in_queue_depth,
            Direction::Out => self.out_queue_depth,
        }
    }

    /// Returns the length of each transfer in `direction`.
    pub fn transfer_length(&self, direction: Direction) -> usize {
        match direction {
            Direction::In => self.transfer_size,
            Direction::Out => self.out_transfer_size,
        }
    }

    /// Returns the bulk endpoint address for `direction`.
    pub fn endpoint(&self, direction: Direction) -> u8 {
        match direction {
            Direction::In => 0x80 | self.device.bulk_endpoint,
            Direction::Out => self.device.bulk_endpoint & 0x7f,
        }
    }

    /// Returns the command endpoint address.
    pub fn command_endpoint(&self) -> u8 {
        self.device.command_endpoint & 0x7f
    }

    /// The data sent by every OUT transfer.
    pub fn out_payload(&self) -> Vec<u8> {
        (0..self.out_transfer_size).map(|i| (i % 256) as u8).collect()
    }

    pub fn validate(&self) -> Result<(), SetupError> {
        if self.in_queue_depth == 0 || self.out_queue_depth == 0 {
            return Err(SetupError::InvalidConfig("queue depth must be at least one"));
        }
        if self.transfer_size == 0 || self.out_transfer_size == 0 {
            return Err(SetupError::InvalidConfig("transfer size must be non-zero"));
        }
        if c_int::try_from(self.transfer_size.max(self.out_transfer_size)).is_err() {
            return Err(SetupError::InvalidConfig(
                "transfer size does not fit a libusb transfer length",
            ));
        }
        if self.transfer_timeout.is_zero() {
            // libusb treats zero as "wait forever"
            return Err(SetupError::InvalidConfig("transfer timeout must be non-zero"));
        }
        Ok(())
    }
}
