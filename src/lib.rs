//! This crate measures sustained USB bulk throughput against a device that
//! streams or sinks data on command.
//!
//! A fixed queue of asynchronous transfers is kept in flight with libusb,
//! each transfer resubmitted from its own completion until enough data has
//! moved, then the queue is drained and the device told to stop.

pub use crate::command::{CommandChannel, DeviceCommand};
pub use crate::config::{BenchConfig, DeviceConfig, StallRecovery};
pub use crate::device::BulkDevice;
pub use crate::driver::{direction_name, BenchmarkDriver, DriverState};
pub use crate::error::{BenchError, FailureKind, SetupError, SubmissionError};
pub use crate::libusb::LibusbDevice;
pub use crate::queue::TransferQueue;
pub use crate::throughput::{Report, Throughput};
pub use crate::transfer::{Completion, SlotId, SlotState, TransferSlot, TransferStatus};

pub use rusb::Direction;

#[cfg(test)]
mod test_helpers;

#[macro_use]
mod error;

pub mod config;

mod command;
mod device;
mod driver;
mod libusb;
mod queue;
mod throughput;
mod transfer;
