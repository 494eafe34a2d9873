use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use crate::device::BulkDevice;
use crate::transfer::{Completion, SlotId, TransferSlot, TransferStatus};

/// Everything a `MockDevice` was asked to do. Survives the device being
/// dropped so tests can check teardown.
#[derive(Debug, Clone, Default)]
pub struct MockLog {
    /// `(slot, endpoint)` for every accepted submission.
    pub submissions: Vec<(SlotId, u8)>,
    pub cancellations: Vec<SlotId>,
    /// `(endpoint, data)` for every command write attempted.
    pub commands: Vec<(u8, Vec<u8>)>,
    pub clear_halts: Vec<u8>,
    /// Transfers still pending on the device at each `clear_halt`.
    pub pending_at_clear_halt: Vec<usize>,
    pub delivered: Vec<Completion>,
    pub released: bool,
}

impl MockLog {
    pub fn stops(&self) -> usize {
        self.commands.iter().filter(|(_, data)| data[..] == [0x01]).count()
    }

    pub fn commands_sent(&self) -> Vec<u8> {
        self.commands.iter().map(|(_, data)| data[0]).collect()
    }
}

type Script = Box<dyn FnMut(usize, SlotId, usize) -> (TransferStatus, usize)>;

/// A scripted device. Submitted transfers finish one batch per
/// `handle_events` call, in submission order, with whatever the script says.
pub struct MockDevice {
    log: Rc<RefCell<MockLog>>,
    pending: VecDeque<(SlotId, usize)>,
    cancelling: Vec<SlotId>,
    batch: usize,
    delivered: usize,
    submitted: usize,
    script: Script,
    submit_failures: HashMap<usize, rusb::Error>,
    command_error: Option<rusb::Error>,
    ignore_cancel: bool,
}

impl MockDevice {
    /// A device that completes every transfer in full.
    pub fn new() -> MockDevice {
        MockDevice {
            log: Rc::new(RefCell::new(MockLog::default())),
            pending: VecDeque::new(),
            cancelling: Vec::new(),
            batch: 1,
            delivered: 0,
            submitted: 0,
            script: Box::new(|_, _, len| (TransferStatus::Completed, len)),
            submit_failures: HashMap::new(),
            command_error: None,
            ignore_cancel: false,
        }
    }

    /// Decides the outcome of the `n`th completion (counting from zero) for a
    /// given slot and requested length.
    pub fn with_script<F>(mut self, script: F) -> MockDevice
    where
        F: FnMut(usize, SlotId, usize) -> (TransferStatus, usize) + 'static,
    {
        self.script = Box::new(script);
        self
    }

    /// Delivers up to `batch` completions per `handle_events` call.
    pub fn with_batch(mut self, batch: usize) -> MockDevice {
        self.batch = batch;
        self
    }

    /// Makes the `n`th submission (counting from zero) fail with `err`.
    pub fn fail_submission(&mut self, n: usize, err: rusb::Error) {
        self.submit_failures.insert(n, err);
    }

    pub fn fail_commands(&mut self, err: rusb::Error) {
        self.command_error = Some(err);
    }

    /// Cancelled transfers never finish, as if the host controller lost them.
    pub fn ignore_cancel(&mut self) {
        self.ignore_cancel = true;
    }

    pub fn log(&self) -> MockLog {
        self.log.borrow().clone()
    }

    pub fn log_handle(&self) -> Rc<RefCell<MockLog>> {
        self.log.clone()
    }
}

impl BulkDevice for MockDevice {
    fn submit(&mut self, slot: &mut TransferSlot) -> rusb::Result<()> {
        let n = self.submitted;
        self.submitted += 1;

        if let Some(err) = self.submit_failures.remove(&n) {
            return Err(err);
        }

        self.pending.push_back((slot.id(), slot.len()));
        self.log
            .borrow_mut()
            .submissions
            .push((slot.id(), slot.endpoint()));
        Ok(())
    }

    fn cancel(&mut self, slot: &TransferSlot) -> rusb::Result<()> {
        self.log.borrow_mut().cancellations.push(slot.id());

        if !self.pending.iter().any(|(id, _)| *id == slot.id()) {
            return Err(rusb::Error::NotFound);
        }
        if self.ignore_cancel {
            // The transfer hangs: it neither completes nor acknowledges.
            self.pending.retain(|(pending, _)| *pending != slot.id());
        } else {
            self.cancelling.push(slot.id());
        }
        Ok(())
    }

    fn handle_events(
        &mut self,
        timeout: Duration,
        completions: &mut VecDeque<Completion>,
    ) -> rusb::Result<()> {
        let mut log = self.log.borrow_mut();

        for id in self.cancelling.drain(..) {
            self.pending.retain(|(pending, _)| *pending != id);
            let completion = Completion {
                slot: id,
                status: TransferStatus::Cancelled,
                actual_length: 0,
            };
            log.delivered.push(completion);
            completions.push_back(completion);
        }

        if !completions.is_empty() {
            return Ok(());
        }

        for _ in 0..self.batch {
            let Some((slot, len)) = self.pending.pop_front() else {
                break;
            };
            let (status, actual_length) = (self.script)(self.delivered, slot, len);
            self.delivered += 1;

            let completion = Completion {
                slot,
                status,
                actual_length,
            };
            log.delivered.push(completion);
            completions.push_back(completion);
        }

        if completions.is_empty() {
            std::thread::sleep(timeout.min(Duration::from_millis(1)));
        }
        Ok(())
    }

    fn write_bulk(&mut self, endpoint: u8, data: &[u8], _timeout: Duration) -> rusb::Result<usize> {
        self.log
            .borrow_mut()
            .commands
            .push((endpoint, data.to_vec()));

        match self.command_error {
            Some(err) => Err(err),
            None => Ok(data.len()),
        }
    }

    fn clear_halt(&mut self, endpoint: u8) -> rusb::Result<()> {
        let mut log = self.log.borrow_mut();
        log.clear_halts.push(endpoint);
        log.pending_at_clear_halt.push(self.pending.len());
        Ok(())
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.log.borrow_mut().released = true;
    }
}
