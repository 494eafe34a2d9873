use std::collections::VecDeque;
use std::time::Duration;

use crate::transfer::{Completion, TransferSlot};

/// The asynchronous I/O subsystem driving one opened device.
///
/// Transfers are submitted per slot and finish through `handle_events`, the
/// only call that blocks. Completions are appended to the caller's queue in
/// the order the transport reports them; nothing is dispatched from inside
/// the subsystem. Dropping the device releases the claimed interface and
/// closes the handle.
pub trait BulkDevice {
    /// Starts a transfer for `slot`, reading into or writing from its buffer.
    ///
    /// The buffer must stay untouched until the slot's completion is returned
    /// from `handle_events`.
    fn submit(&mut self, slot: &mut TransferSlot) -> rusb::Result<()>;

    /// Requests cancellation of the in-flight transfer for `slot`.
    ///
    /// Cancellation is asynchronous: it is acknowledged by a `Cancelled`
    /// completion (or by a completion that raced it).
    fn cancel(&mut self, slot: &TransferSlot) -> rusb::Result<()>;

    /// Blocks until at least one transfer finishes or `timeout` elapses,
    /// appending the finished transfers to `completions`.
    fn handle_events(
        &mut self,
        timeout: Duration,
        completions: &mut VecDeque<Completion>,
    ) -> rusb::Result<()>;

    /// Writes `data` to an OUT endpoint synchronously.
    fn write_bulk(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize>;

    /// Clears a halt/stall condition on an endpoint.
    fn clear_halt(&mut self, endpoint: u8) -> rusb::Result<()>;
}
