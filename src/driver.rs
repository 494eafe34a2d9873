use std::collections::VecDeque;
use std::time::Instant;

use log::{debug, info, warn};
use rusb::Direction;

use crate::command::{CommandChannel, DeviceCommand};
use crate::config::{BenchConfig, DeviceConfig, StallRecovery};
use crate::device::BulkDevice;
use crate::error::{BenchError, FailureKind, SetupError};
use crate::queue::TransferQueue;
use crate::throughput::{Report, Throughput};
use crate::transfer::{Completion, TransferStatus};

/// Progress of a benchmark run.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    DeviceOpened,
    QueueArmed,
    Running,
    Draining,
    Reported,
    Failed,
}

/// Returns the conventional name of a transfer direction.
pub fn direction_name(direction: Direction) -> &'static str {
    match direction {
        Direction::In => "IN",
        Direction::Out => "OUT",
    }
}

/// Runs one throughput test in one direction.
#[derive(Debug)]
pub struct BenchmarkDriver<'c> {
    config: &'c BenchConfig,
    direction: Direction,
    state: DriverState,
}

impl<'c> BenchmarkDriver<'c> {
    pub fn new(config: &'c BenchConfig, direction: Direction) -> BenchmarkDriver<'c> {
        BenchmarkDriver {
            config,
            direction,
            state: DriverState::Idle,
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Opens the device with `open` and runs the test to completion.
    ///
    /// Once the device is open, every path sends `Stop` exactly once and drops
    /// the device before returning.
    pub fn run<D, F>(&mut self, open: F) -> Result<Report, BenchError>
    where
        D: BulkDevice,
        F: FnOnce(&DeviceConfig) -> Result<D, SetupError>,
    {
        if self.state != DriverState::Idle {
            return Err(SetupError::InvalidConfig("driver has already run").into());
        }

        let device = match self
            .config
            .validate()
            .and_then(|()| open(&self.config.device))
        {
            Ok(device) => device,
            Err(err) => {
                self.state = DriverState::Failed;
                return Err(err.into());
            }
        };

        let mut run = Run {
            config: self.config,
            direction: self.direction,
            device,
            queue: TransferQueue::for_direction(self.config, self.direction),
            throughput: Throughput::new(self.config.test_data_size),
            commands: CommandChannel::new(
                self.config.command_endpoint(),
                self.config.command_timeout,
            ),
            completions: VecDeque::with_capacity(self.config.queue_depth(self.direction)),
            stall_recoveries: 0,
            halted: false,
            state: DriverState::Idle,
        };
        run.transition(DriverState::DeviceOpened);

        run.arm();
        run.start();
        run.process_events();
        run.drain();

        let (state, result) = run.finish();
        self.state = state;
        result
    }
}

/// Everything owned by a run between opening the device and reporting.
struct Run<'c, D: BulkDevice> {
    config: &'c BenchConfig,
    direction: Direction,
    device: D,
    queue: TransferQueue,
    throughput: Throughput,
    commands: CommandChannel,
    completions: VecDeque<Completion>,
    stall_recoveries: u32,
    /// Set while the endpoint is halted and the queue is being emptied before
    /// the halt is cleared.
    halted: bool,
    state: DriverState,
}

impl<'c, D: BulkDevice> Run<'c, D> {
    fn transition(&mut self, state: DriverState) {
        debug!("{:?} -> {:?}", self.state, state);
        self.state = state;
    }

    fn arm(&mut self) {
        self.throughput.start();

        if let Err(err) = self.queue.arm(&mut self.device) {
            warn!("{}", err);
            self.throughput.record_failure(err.kind());
        }
        self.transition(DriverState::QueueArmed);
    }

    fn start(&mut self) {
        if !self.throughput.should_terminate() {
            // A lost command shows up as transfer timeouts, so it is only logged.
            let _ = self
                .commands
                .send(&mut self.device, DeviceCommand::start(self.direction));
        }
        self.transition(DriverState::Running);
    }

    fn process_events(&mut self) {
        while !self.throughput.should_terminate() {
            if self.halted && self.queue.in_flight() == 0 {
                self.clear_halt();
                continue;
            }

            if self.queue.in_flight() == 0 {
                warn!("No transfers left in flight");
                self.throughput.record_failure(FailureKind::Stalled);
                break;
            }

            match self
                .device
                .handle_events(self.config.event_timeout, &mut self.completions)
            {
                Ok(()) | Err(rusb::Error::Interrupted) => {}
                Err(err) => {
                    warn!("Event handling failed: {}", err);
                    self.throughput
                        .record_failure(FailureKind::from_usb_error(&err));
                    break;
                }
            }

            while let Some(completion) = self.completions.pop_front() {
                self.dispatch(completion);
            }
        }
    }

    fn dispatch(&mut self, completion: Completion) {
        let Completion {
            slot: id,
            status,
            actual_length,
        } = completion;

        let Some(slot) = self.queue.slot_mut(id) else {
            warn!("Completion for unknown transfer slot {}", id);
            return;
        };
        slot.complete(status, actual_length);
        let actual_length = slot.actual().len();

        // Whatever finishes after the termination decision belongs to teardown.
        if self.throughput.should_terminate() {
            debug!("Slot {} finished with {:?} after termination", id, status);
            return;
        }

        match status {
            TransferStatus::Completed => {
                self.throughput.record(actual_length);
                debug!(
                    "Slot {} completed: {} bytes ({} total)",
                    id,
                    actual_length,
                    self.throughput.bytes_total()
                );

                if self.throughput.should_terminate() {
                    debug!("Target reached, terminating");
                    return;
                }

                // Re-armed together once the halt is cleared.
                if self.halted {
                    return;
                }

                if let Err(err) = slot.submit(&mut self.device) {
                    warn!("{}", err);
                    self.throughput.record_failure(err.kind());
                }
            }
            TransferStatus::Stall => match self.config.stall_recovery {
                StallRecovery::LeaveIdle => {
                    info!("Transfer stalled, backing off");
                    slot.park();
                }
                StallRecovery::ClearHalt { max_attempts } => {
                    slot.park();

                    // Every transfer queued behind a halt fails the same way.
                    if self.halted {
                        debug!("Slot {} stalled while the halt is pending", id);
                        return;
                    }

                    if self.stall_recoveries >= max_attempts {
                        warn!("Slot {} stalled again, giving up", id);
                        self.throughput.record_failure(FailureKind::Stalled);
                        return;
                    }
                    self.stall_recoveries += 1;
                    self.halted = true;

                    info!(
                        "Transfer stalled, cancelling the queue before clearing the halt ({}/{})",
                        self.stall_recoveries, max_attempts
                    );
                    self.queue.cancel_all(&mut self.device);
                }
            },
            TransferStatus::Cancelled if self.halted => {
                debug!("Slot {} cancelled for halt recovery", id);
            }
            status => {
                debug!("Slot {} failed with {:?}", id, status);
                if let Some(kind) = FailureKind::from_status(status) {
                    self.throughput.record_failure(kind);
                }
            }
        }
    }

    /// Clears the endpoint halt once nothing is in flight, then re-arms the
    /// whole queue.
    fn clear_halt(&mut self) {
        let endpoint = self.config.endpoint(self.direction);
        info!("Clearing halt on endpoint {:#04x}", endpoint);

        if let Err(err) = self.device.clear_halt(endpoint) {
            warn!("Unable to clear halt on endpoint {:#04x}: {}", endpoint, err);
            self.throughput.record_failure(FailureKind::Stalled);
            return;
        }
        self.halted = false;

        if let Err(err) = self.queue.arm(&mut self.device) {
            warn!("{}", err);
            self.throughput.record_failure(err.kind());
        }
    }

    fn drain(&mut self) {
        self.transition(DriverState::Draining);

        let outstanding = self.queue.cancel_all(&mut self.device);
        debug!("Cancelling {} outstanding transfers", outstanding);

        let deadline = Instant::now() + self.config.drain_timeout;
        while self.queue.in_flight() > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match self.device.handle_events(
                remaining.min(self.config.event_timeout),
                &mut self.completions,
            ) {
                Ok(()) | Err(rusb::Error::Interrupted) => {}
                Err(err) => {
                    warn!("Event handling failed while draining: {}", err);
                    break;
                }
            }

            while let Some(completion) = self.completions.pop_front() {
                if let Some(slot) = self.queue.slot_mut(completion.slot) {
                    slot.complete(completion.status, completion.actual_length);
                }
                debug!(
                    "Slot {} drained with {:?}",
                    completion.slot, completion.status
                );
            }
        }

        self.queue.abandon_in_flight();
    }

    fn finish(mut self) -> (DriverState, Result<Report, BenchError>) {
        let result = match self.throughput.finish(self.direction) {
            Ok(report) => {
                info!("{}", report);
                let _ = self.commands.stop(&mut self.device);
                self.transition(DriverState::Reported);
                Ok(report)
            }
            Err(kind) => {
                let _ = self.commands.stop(&mut self.device);
                self.transition(DriverState::Failed);
                Err(BenchError::Failed(kind))
            }
        };

        let Run {
            device,
            queue,
            state,
            ..
        } = self;

        // Release the handle before the slot buffers go away.
        drop(device);
        drop(queue);

        (state, result)
    }
}
