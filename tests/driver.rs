use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use bulk_speed_test::{
    BenchConfig, BenchError, BenchmarkDriver, BulkDevice, Completion, DeviceCommand, Direction,
    DriverState, FailureKind, TransferSlot, TransferStatus,
};

#[derive(Default)]
struct Record {
    commands: Vec<u8>,
    released: bool,
}

/// Completes every transfer in full, failing the `fail_at`th completion.
struct Loopback {
    pending: VecDeque<(usize, usize)>,
    fail_at: Option<(usize, TransferStatus)>,
    completed: usize,
    record: Rc<RefCell<Record>>,
}

impl Loopback {
    fn new(fail_at: Option<(usize, TransferStatus)>) -> (Loopback, Rc<RefCell<Record>>) {
        let record = Rc::new(RefCell::new(Record::default()));
        let device = Loopback {
            pending: VecDeque::new(),
            fail_at,
            completed: 0,
            record: record.clone(),
        };
        (device, record)
    }
}

impl BulkDevice for Loopback {
    fn submit(&mut self, slot: &mut TransferSlot) -> rusb::Result<()> {
        self.pending.push_back((slot.id(), slot.len()));
        Ok(())
    }

    fn cancel(&mut self, slot: &TransferSlot) -> rusb::Result<()> {
        for entry in self.pending.iter_mut().filter(|(id, _)| *id == slot.id()) {
            entry.1 = usize::MAX;
        }
        Ok(())
    }

    fn handle_events(
        &mut self,
        _timeout: Duration,
        completions: &mut VecDeque<Completion>,
    ) -> rusb::Result<()> {
        for (slot, len) in self.pending.drain(..) {
            let status = match self.fail_at {
                _ if len == usize::MAX => TransferStatus::Cancelled,
                Some((n, status)) if n == self.completed => status,
                _ => TransferStatus::Completed,
            };
            self.completed += 1;
            completions.push_back(Completion {
                slot,
                status,
                actual_length: if status == TransferStatus::Completed { len } else { 0 },
            });
        }
        Ok(())
    }

    fn write_bulk(&mut self, _endpoint: u8, data: &[u8], _timeout: Duration) -> rusb::Result<usize> {
        self.record.borrow_mut().commands.extend_from_slice(data);
        Ok(data.len())
    }

    fn clear_halt(&mut self, _endpoint: u8) -> rusb::Result<()> {
        Ok(())
    }
}

impl Drop for Loopback {
    fn drop(&mut self) {
        self.record.borrow_mut().released = true;
    }
}

fn config() -> BenchConfig {
    BenchConfig {
        test_data_size: 1_048_576,
        transfer_size: 16_384,
        in_queue_depth: 16,
        out_queue_depth: 1,
        ..BenchConfig::default()
    }
}

#[test]
fn successful_run_reports_and_stops_once() {
    let config = config();
    let (device, record) = Loopback::new(None);
    let mut driver = BenchmarkDriver::new(&config, Direction::In);

    let report = driver.run(|_| Ok(device)).unwrap();

    assert_eq!(driver.state(), DriverState::Reported);
    assert!(report.completions >= 64);
    assert!(report.bytes_total > config.test_data_size);
    assert!(report.bytes_total - config.test_data_size <= config.transfer_size as u64);

    let record = record.borrow();
    assert_eq!(
        record.commands,
        vec![u8::from(DeviceCommand::StartIn), u8::from(DeviceCommand::Stop)]
    );
    assert!(record.released);
}

#[test]
fn failed_run_stops_once_and_surfaces_exit_code() {
    let config = config();
    let (device, record) = Loopback::new(Some((3, TransferStatus::Overflow)));
    let mut driver = BenchmarkDriver::new(&config, Direction::Out);

    let err = driver.run(|_| Ok(device)).unwrap_err();

    assert_eq!(driver.state(), DriverState::Failed);
    assert!(matches!(err, BenchError::Failed(FailureKind::Overflow)));
    assert_eq!(err.exit_code(), 6);

    let record = record.borrow();
    assert_eq!(record.commands, vec![0x42, 0x01]);
    assert!(record.released);
}
