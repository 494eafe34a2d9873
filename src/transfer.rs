use std::time::Duration;

use libc::c_int;
use log::debug;
use rusb::ffi::constants::*;
use rusb::Direction;

use crate::device::BulkDevice;
use crate::error::SubmissionError;

/// Identifies a transfer slot by its position in the queue.
pub type SlotId = usize;

/// The status of a finished transfer, as reported by the I/O subsystem.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    /// Completed without error. Fewer bytes than requested may have moved.
    Completed,

    /// Failed (IO error)
    Error,

    /// Timed out
    TimedOut,

    /// Cancelled
    Cancelled,

    /// Endpoint stalled
    Stall,

    /// Device was disconnected
    NoDevice,

    /// Device sent more data than requested
    Overflow,
}

impl TransferStatus {
    pub(crate) fn from_libusb(status: c_int) -> Self {
        match status {
            LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
            LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
            LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
            LIBUSB_TRANSFER_STALL => TransferStatus::Stall,
            LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
            LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Overflow,
            _ => TransferStatus::Error,
        }
    }
}

/// A finished transfer, pulled from the completion queue by the event loop.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Completion {
    pub slot: SlotId,
    pub status: TransferStatus,
    pub actual_length: usize,
}

/// Lifecycle of a transfer slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Submitted,
    Completed,
    Cancelled,
    Failed,
}

/// One asynchronous bulk transfer, resubmitted for the lifetime of a run.
///
/// The buffer is allocated once and handed to the I/O subsystem on every
/// submission. It must not be touched while the slot is `Submitted`.
#[derive(Debug)]
pub struct TransferSlot {
    id: SlotId,
    endpoint: u8,
    buffer: Vec<u8>,
    state: SlotState,
    timeout: Duration,
    actual_length: usize,
    cancel_requested: bool,
}

impl TransferSlot {
    /// Creates an IN slot receiving up to `length` bytes per transfer.
    pub fn bulk_in(id: SlotId, endpoint: u8, length: usize, timeout: Duration) -> TransferSlot {
        Self::new(id, endpoint | LIBUSB_ENDPOINT_IN, vec![0; length], timeout)
    }

    /// Creates an OUT slot sending `payload` on every transfer.
    pub fn bulk_out(id: SlotId, endpoint: u8, payload: Vec<u8>, timeout: Duration) -> TransferSlot {
        Self::new(id, endpoint & !LIBUSB_ENDPOINT_DIR_MASK, payload, timeout)
    }

    fn new(id: SlotId, endpoint: u8, buffer: Vec<u8>, timeout: Duration) -> TransferSlot {
        TransferSlot {
            id,
            endpoint,
            buffer,
            state: SlotState::Idle,
            timeout,
            actual_length: 0,
            cancel_requested: false,
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    /// Returns the endpoint address, direction bit included.
    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    pub fn direction(&self) -> Direction {
        if self.endpoint & LIBUSB_ENDPOINT_DIR_MASK == LIBUSB_ENDPOINT_IN {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the number of bytes requested (IN) or sent (OUT) per transfer.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_submitted(&self) -> bool {
        self.state == SlotState::Submitted
    }

    /// Returns the bytes moved by the last completed transfer.
    ///
    /// Empty while the slot is in flight.
    pub fn actual(&self) -> &[u8] {
        if self.is_submitted() {
            &[]
        } else {
            &self.buffer[..self.actual_length]
        }
    }

    /// Hands the slot to the I/O subsystem.
    pub fn submit<D: BulkDevice + ?Sized>(&mut self, device: &mut D) -> Result<(), SubmissionError> {
        debug_assert!(!self.is_submitted(), "slot {} is already in flight", self.id);

        self.actual_length = 0;
        self.cancel_requested = false;

        match device.submit(self) {
            Ok(()) => {
                self.state = SlotState::Submitted;
                Ok(())
            }
            Err(source) => {
                self.state = SlotState::Failed;
                Err(SubmissionError {
                    slot: self.id,
                    source,
                })
            }
        }
    }

    /// Requests that an in-flight transfer be aborted.
    ///
    /// Does nothing unless the slot is `Submitted`. The slot stays `Submitted`
    /// until the cancellation is acknowledged by a completion.
    pub fn cancel<D: BulkDevice + ?Sized>(&mut self, device: &mut D) {
        if !self.is_submitted() || self.cancel_requested {
            return;
        }

        self.cancel_requested = true;
        if let Err(err) = device.cancel(self) {
            // Usually means the transfer already finished and its completion is queued.
            debug!("Cancelling slot {} failed: {}", self.id, err);
        }
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    /// Applies a completion to the slot, returning it to a terminal state.
    pub(crate) fn complete(&mut self, status: TransferStatus, actual_length: usize) {
        self.actual_length = actual_length.min(self.buffer.len());
        self.state = match status {
            TransferStatus::Completed => SlotState::Completed,
            TransferStatus::Cancelled => SlotState::Cancelled,
            TransferStatus::Stall => SlotState::Idle,
            _ => SlotState::Failed,
        };
    }

    /// Returns a stalled slot to `Idle` until the queue is re-armed.
    pub(crate) fn park(&mut self) {
        self.state = SlotState::Idle;
    }

    /// Gives the I/O subsystem the buffer address and length to transfer.
    pub(crate) fn raw_buffer(&mut self) -> (*mut u8, usize) {
        (self.buffer.as_mut_ptr(), self.buffer.len())
    }

    /// Leaks the buffer of a slot whose cancellation was never acknowledged,
    /// so a late completion cannot write into freed memory.
    pub(crate) fn abandon(&mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        std::mem::forget(buffer);
        self.actual_length = 0;
        self.state = SlotState::Failed;
    }
}
