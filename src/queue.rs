use std::time::Duration;

use log::warn;
use rusb::Direction;

use crate::config::BenchConfig;
use crate::device::BulkDevice;
use crate::error::SubmissionError;
use crate::transfer::{SlotId, SlotState, TransferSlot};

/// A fixed set of transfer slots kept in flight against one endpoint.
///
/// Slots are submitted together once, then each one is resubmitted on its
/// own as it completes.
#[derive(Debug)]
pub struct TransferQueue {
    direction: Direction,
    slots: Vec<TransferSlot>,
}

impl TransferQueue {
    /// Allocates `depth` IN slots receiving up to `length` bytes each.
    pub fn bulk_in(endpoint: u8, depth: usize, length: usize, timeout: Duration) -> TransferQueue {
        TransferQueue {
            direction: Direction::In,
            slots: (0..depth)
                .map(|id| TransferSlot::bulk_in(id, endpoint, length, timeout))
                .collect(),
        }
    }

    /// Allocates `depth` OUT slots, each with its own copy of `payload`.
    pub fn bulk_out(endpoint: u8, depth: usize, payload: &[u8], timeout: Duration) -> TransferQueue {
        TransferQueue {
            direction: Direction::Out,
            slots: (0..depth)
                .map(|id| TransferSlot::bulk_out(id, endpoint, payload.to_vec(), timeout))
                .collect(),
        }
    }

    /// Allocates the queue for a run in `direction`.
    pub fn for_direction(config: &BenchConfig, direction: Direction) -> TransferQueue {
        let endpoint = config.endpoint(direction);
        let depth = config.queue_depth(direction);

        match direction {
            Direction::In => {
                Self::bulk_in(endpoint, depth, config.transfer_length(direction), config.transfer_timeout)
            }
            Direction::Out => Self::bulk_out(
                endpoint,
                depth,
                &config.out_payload(),
                config.transfer_timeout,
            ),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Submits every slot, stopping at the first failure.
    ///
    /// Slots submitted before the failure stay in flight.
    pub fn arm<D: BulkDevice + ?Sized>(&mut self, device: &mut D) -> Result<(), SubmissionError> {
        for slot in self.slots.iter_mut() {
            slot.submit(device)?;
        }
        Ok(())
    }

    pub fn slot(&self, id: SlotId) -> Option<&TransferSlot> {
        self.slots.get(id)
    }

    pub fn slot_mut(&mut self, id: SlotId) -> Option<&mut TransferSlot> {
        self.slots.get_mut(id)
    }

    pub fn slots(&self) -> impl Iterator<Item = &TransferSlot> {
        self.slots.iter()
    }

    /// Returns the number of slots currently in flight.
    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_submitted()).count()
    }

    /// Requests cancellation of every slot in flight, returning how many
    /// cancellations are outstanding.
    pub fn cancel_all<D: BulkDevice + ?Sized>(&mut self, device: &mut D) -> usize {
        // Cancel in reverse order so a later slot cannot reach the bus after an
        // earlier one was cancelled.
        for slot in self.slots.iter_mut().rev() {
            slot.cancel(device);
        }
        self.in_flight()
    }

    /// Gives up on slots whose cancellation never completed, returning how
    /// many were abandoned.
    pub fn abandon_in_flight(&mut self) -> usize {
        let mut abandoned = 0;
        for slot in self.slots.iter_mut().filter(|slot| slot.is_submitted()) {
            warn!("Transfer slot {} did not finish cancelling, leaking its buffer", slot.id());
            slot.abandon();
            abandoned += 1;
        }
        abandoned
    }

    pub fn count(&self, state: SlotState) -> usize {
        self.slots.iter().filter(|slot| slot.state() == state).count()
    }
}
