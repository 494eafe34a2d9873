use std::fmt;

use libc::c_int;
use rusb::ffi::constants::*;

use crate::transfer::{SlotId, TransferStatus};

/// Classification of a failed benchmark run.
///
/// The discriminants are the process exit status reported for each class.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Generic transfer or I/O error.
    Error = 1,

    /// A transfer exceeded its timeout.
    TimedOut = 2,

    /// A transfer was cancelled before the run finished.
    Cancelled = 3,

    /// The endpoint stalled and was not recovered.
    Stalled = 4,

    /// The device went away, or refused more transfers than it can sink.
    DeviceLost = 5,

    /// The device sent more data than was requested.
    Overflow = 6,
}

impl FailureKind {
    /// Returns the process exit status for this failure class.
    pub fn exit_code(self) -> u8 {
        self as u8
    }

    /// Classifies a failed transfer status.
    ///
    /// Returns `None` for a successful completion.
    pub fn from_status(status: TransferStatus) -> Option<FailureKind> {
        match status {
            TransferStatus::Completed => None,
            TransferStatus::Error => Some(FailureKind::Error),
            TransferStatus::TimedOut => Some(FailureKind::TimedOut),
            TransferStatus::Cancelled => Some(FailureKind::Cancelled),
            TransferStatus::Stall => Some(FailureKind::Stalled),
            TransferStatus::NoDevice => Some(FailureKind::DeviceLost),
            TransferStatus::Overflow => Some(FailureKind::Overflow),
        }
    }

    /// Classifies an error returned by libusb outside of a transfer completion.
    ///
    /// A device that cannot accept another concurrent transfer reports `NotFound`,
    /// so it is grouped with a lost device.
    pub fn from_usb_error(err: &rusb::Error) -> FailureKind {
        match err {
            rusb::Error::Timeout => FailureKind::TimedOut,
            rusb::Error::Interrupted => FailureKind::Cancelled,
            rusb::Error::Pipe => FailureKind::Stalled,
            rusb::Error::NoDevice | rusb::Error::NotFound => FailureKind::DeviceLost,
            rusb::Error::Overflow => FailureKind::Overflow,
            _ => FailureKind::Error,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(match self {
            FailureKind::Error => "error'd out",
            FailureKind::TimedOut => "timed out",
            FailureKind::Cancelled => "was prematurely cancelled",
            FailureKind::Stalled => "was stalled",
            FailureKind::DeviceLost => "lost the device it was connected to",
            FailureKind::Overflow => "sent more data than expected.",
        })
    }
}

/// Errors raised before any transfer is attempted.
#[derive(thiserror::Error, Debug)]
pub enum SetupError {
    #[error("No device with ID {vendor_id:04x}:{product_id:04x} was found")]
    DeviceNotFound { vendor_id: u16, product_id: u16 },

    #[error("Unable to claim interface {interface}: {source}")]
    Claim {
        interface: u8,
        #[source]
        source: rusb::Error,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),
}

/// A transfer slot could not be handed to the I/O subsystem.
#[derive(thiserror::Error, Debug)]
#[error("Transfer slot {slot} could not be submitted: {source}")]
pub struct SubmissionError {
    pub slot: SlotId,
    #[source]
    pub source: rusb::Error,
}

impl SubmissionError {
    pub fn kind(&self) -> FailureKind {
        FailureKind::from_usb_error(&self.source)
    }
}

/// The outcome of a benchmark run that did not produce a report.
#[derive(thiserror::Error, Debug)]
pub enum BenchError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error("Test failed because a transfer {0}")]
    Failed(FailureKind),
}

impl BenchError {
    /// Returns the process exit status for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            BenchError::Setup(_) => FailureKind::Error.exit_code(),
            BenchError::Failed(kind) => kind.exit_code(),
        }
    }
}

/// Translates a negative libusb return code into a `rusb::Error`.
pub(crate) fn from_libusb(err: c_int) -> rusb::Error {
    match err {
        LIBUSB_ERROR_IO => rusb::Error::Io,
        LIBUSB_ERROR_INVALID_PARAM => rusb::Error::InvalidParam,
        LIBUSB_ERROR_ACCESS => rusb::Error::Access,
        LIBUSB_ERROR_NO_DEVICE => rusb::Error::NoDevice,
        LIBUSB_ERROR_NOT_FOUND => rusb::Error::NotFound,
        LIBUSB_ERROR_BUSY => rusb::Error::Busy,
        LIBUSB_ERROR_TIMEOUT => rusb::Error::Timeout,
        LIBUSB_ERROR_OVERFLOW => rusb::Error::Overflow,
        LIBUSB_ERROR_PIPE => rusb::Error::Pipe,
        LIBUSB_ERROR_INTERRUPTED => rusb::Error::Interrupted,
        LIBUSB_ERROR_NO_MEM => rusb::Error::NoMem,
        LIBUSB_ERROR_NOT_SUPPORTED => rusb::Error::NotSupported,
        _ => rusb::Error::Other,
    }
}

// Wraps a libusb call returning a status code, mapping failures to `rusb::Error`.
macro_rules! try_unsafe {
    ($x:expr) => {
        match unsafe { $x } {
            0 => (),
            err => return Err($crate::error::from_libusb(err)),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_failure_classes() {
        assert_eq!(FailureKind::Error.exit_code(), 1);
        assert_eq!(FailureKind::TimedOut.exit_code(), 2);
        assert_eq!(FailureKind::Cancelled.exit_code(), 3);
        assert_eq!(FailureKind::Stalled.exit_code(), 4);
        assert_eq!(FailureKind::DeviceLost.exit_code(), 5);
        assert_eq!(FailureKind::Overflow.exit_code(), 6);
    }

    #[test]
    fn busy_endpoint_is_grouped_with_lost_device() {
        assert_eq!(
            FailureKind::from_usb_error(&rusb::Error::NotFound),
            FailureKind::DeviceLost
        );
        assert_eq!(
            FailureKind::from_usb_error(&rusb::Error::NoDevice),
            FailureKind::DeviceLost
        );
        assert_eq!(
            FailureKind::from_usb_error(&rusb::Error::Busy),
            FailureKind::Error
        );
    }

    #[test]
    fn setup_errors_exit_with_generic_code() {
        let err = BenchError::from(SetupError::DeviceNotFound {
            vendor_id: 0x16d0,
            product_id: 0x0f3b,
        });
        assert_eq!(err.exit_code(), 1);
        assert_eq!(err.to_string(), "No device with ID 16d0:0f3b was found");
    }

    #[test]
    fn failure_message_names_the_class() {
        let err = BenchError::Failed(FailureKind::TimedOut);
        assert_eq!(err.to_string(), "Test failed because a transfer timed out");
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn libusb_codes_map_to_errors() {
        assert_eq!(from_libusb(LIBUSB_ERROR_NO_DEVICE), rusb::Error::NoDevice);
        assert_eq!(from_libusb(LIBUSB_ERROR_TIMEOUT), rusb::Error::Timeout);
        assert_eq!(from_libusb(-1234), rusb::Error::Other);
    }
}
