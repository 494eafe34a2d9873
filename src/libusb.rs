use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::rc::Rc;
use std::time::Duration;

use libc::{c_int, c_uint};
use log::{debug, warn};
use rusb::{ffi, Context, DeviceHandle, UsbContext};

use crate::config::DeviceConfig;
use crate::device::BulkDevice;
use crate::error::SetupError;
use crate::transfer::{Completion, SlotId, TransferSlot, TransferStatus};

/// Data touched by the libusb completion callback.
///
/// Callbacks only run inside `libusb_handle_events_*` on the thread that
/// called it, so plain cells are enough.
#[derive(Default)]
struct CompletionSink {
    completed: RefCell<VecDeque<Completion>>,

    /// Set by the callback so `libusb_handle_events_timeout_completed` returns
    /// as soon as something finished.
    flag: Cell<c_int>,
}

/// Per-transfer user data, boxed so the callback can find its slot.
struct TransferUserData {
    slot: SlotId,
    sink: Rc<CompletionSink>,
}

/// The libusb transfer struct backing one slot, allocated once per run.
struct RawTransfer {
    ptr: NonNull<ffi::libusb_transfer>,
    in_flight: bool,
}

impl RawTransfer {
    fn alloc(slot: SlotId, sink: &Rc<CompletionSink>) -> rusb::Result<RawTransfer> {
        // non-isochronous endpoints (e.g. control, bulk, interrupt) specify a value of 0
        let Some(ptr) = NonNull::new(unsafe { ffi::libusb_alloc_transfer(0) }) else {
            return Err(rusb::Error::NoMem);
        };

        let user_data = Box::new(TransferUserData {
            slot,
            sink: sink.clone(),
        });

        // SAFETY: ptr was just allocated; user_data is freed only with the transfer.
        unsafe {
            (*ptr.as_ptr()).user_data = Box::into_raw(user_data).cast();
        }

        Ok(RawTransfer {
            ptr,
            in_flight: false,
        })
    }

    /// Points the transfer at the slot's buffer and submits it.
    fn submit(&mut self, handle: &DeviceHandle<Context>, slot: &mut TransferSlot) -> rusb::Result<()> {
        let (buffer, length) = slot.raw_buffer();
        let length = c_int::try_from(length).map_err(|_| rusb::Error::InvalidParam)?;
        let timeout = c_uint::try_from(slot.timeout().as_millis()).unwrap_or(c_uint::MAX);

        // SAFETY: the transfer is not in flight, and the slot keeps its buffer
        // alive until the completion for this submission has been returned.
        unsafe {
            let user_data = (*self.ptr.as_ptr()).user_data;
            ffi::libusb_fill_bulk_transfer(
                self.ptr.as_ptr(),
                handle.as_raw(),
                slot.endpoint(),
                buffer,
                length,
                transfer_cb,
                user_data,
                timeout,
            );
        }

        try_unsafe!(ffi::libusb_submit_transfer(self.ptr.as_ptr()));
        self.in_flight = true;
        Ok(())
    }

    fn cancel(&self) -> rusb::Result<()> {
        try_unsafe!(ffi::libusb_cancel_transfer(self.ptr.as_ptr()));
        Ok(())
    }
}

impl Drop for RawTransfer {
    fn drop(&mut self) {
        if self.in_flight {
            // libusb still owns it; a late callback must find valid user data.
            warn!("Leaking a transfer that is still in flight");
            return;
        }

        // SAFETY: the transfer is idle, so libusb holds no reference to it.
        unsafe {
            drop(Box::from_raw(
                (*self.ptr.as_ptr()).user_data.cast::<TransferUserData>(),
            ));
            ffi::libusb_free_transfer(self.ptr.as_ptr());
        }
    }
}

/// The libusb transfer completion callback.
extern "system" fn transfer_cb(transfer: *mut ffi::libusb_transfer) {
    // SAFETY: libusb passes back the transfer we submitted, whose user data
    // outlives every submission.
    unsafe {
        let transfer = &*transfer;
        let user_data = &*transfer.user_data.cast::<TransferUserData>();

        user_data.sink.completed.borrow_mut().push_back(Completion {
            slot: user_data.slot,
            status: TransferStatus::from_libusb(transfer.status),
            actual_length: transfer.actual_length.max(0) as usize,
        });
        user_data.sink.flag.set(1);
    }
}

/// A device opened through libusb with its bulk interface claimed.
pub struct LibusbDevice {
    handle: DeviceHandle<Context>,
    interface: u8,
    transfers: Vec<Option<RawTransfer>>,
    sink: Rc<CompletionSink>,
}

impl LibusbDevice {
    /// Opens the first device matching the configured vendor and product ID
    /// and claims its interface.
    pub fn open(context: &Context, config: &DeviceConfig) -> Result<LibusbDevice, SetupError> {
        let handle = context
            .open_device_with_vid_pid(config.vendor_id, config.product_id)
            .ok_or(SetupError::DeviceNotFound {
                vendor_id: config.vendor_id,
                product_id: config.product_id,
            })?;

        handle
            .claim_interface(config.interface)
            .map_err(|source| SetupError::Claim {
                interface: config.interface,
                source,
            })?;

        debug!(
            "Opened {:04x}:{:04x}, claimed interface {}",
            config.vendor_id, config.product_id, config.interface
        );

        Ok(LibusbDevice {
            handle,
            interface: config.interface,
            transfers: Vec::new(),
            sink: Rc::new(CompletionSink::default()),
        })
    }

    fn take_completed(&mut self, completions: &mut VecDeque<Completion>) {
        let mut completed = self.sink.completed.borrow_mut();
        for completion in completed.drain(..) {
            if let Some(Some(transfer)) = self.transfers.get_mut(completion.slot) {
                transfer.in_flight = false;
            }
            completions.push_back(completion);
        }
    }
}

impl BulkDevice for LibusbDevice {
    fn submit(&mut self, slot: &mut TransferSlot) -> rusb::Result<()> {
        let handle = &self.handle;
        let sink = &self.sink;

        if self.transfers.len() <= slot.id() {
            self.transfers.resize_with(slot.id() + 1, || None);
        }
        let entry = &mut self.transfers[slot.id()];
        if entry.is_none() {
            *entry = Some(RawTransfer::alloc(slot.id(), sink)?);
        }

        match entry {
            Some(transfer) => transfer.submit(handle, slot),
            None => Err(rusb::Error::NoMem),
        }
    }

    fn cancel(&mut self, slot: &TransferSlot) -> rusb::Result<()> {
        match self.transfers.get(slot.id()) {
            Some(Some(transfer)) if transfer.in_flight => transfer.cancel(),
            _ => Err(rusb::Error::NotFound),
        }
    }

    fn handle_events(
        &mut self,
        timeout: Duration,
        completions: &mut VecDeque<Completion>,
    ) -> rusb::Result<()> {
        if self.sink.completed.borrow().is_empty() {
            self.sink.flag.set(0);

            let timeval = libc::timeval {
                tv_sec: timeout.as_secs().try_into().unwrap_or(86_400),
                tv_usec: timeout.subsec_micros().try_into().unwrap_or(0),
            };
            try_unsafe!(ffi::libusb_handle_events_timeout_completed(
                self.handle.context().as_raw(),
                &timeval,
                self.sink.flag.as_ptr(),
            ));
        }

        self.take_completed(completions);
        Ok(())
    }

    fn write_bulk(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize> {
        self.handle.write_bulk(endpoint, data, timeout)
    }

    fn clear_halt(&mut self, endpoint: u8) -> rusb::Result<()> {
        self.handle.clear_halt(endpoint)
    }
}

impl Drop for LibusbDevice {
    fn drop(&mut self) {
        self.transfers.clear();

        if let Err(err) = self.handle.release_interface(self.interface) {
            warn!("Unable to release interface {}: {}", self.interface, err);
        }
        // The handle closes when it drops.
    }
}
