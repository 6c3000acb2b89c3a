//! # Transfers
//!
//! The engine never reads archive bytes directly: it asks a
//! [`TransferDevice`] to copy them into the heap, either blocking or
//! asynchronously. Asynchronous transfers report completion on a
//! [`CompletionQueue`] that the engine polls without blocking at the start of
//! each tick.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐ submit(request + reply) ┌──────────────┐
//! │   Engine   │────────────────────────▶│    Device    │
//! │  (ticks)   │                         │ (ROM, DMA..) │
//! └────────────┘                         └──────────────┘
//!       ▲   poll()      ┌───────────┐  service(): bytes land  │
//!       └───────────────│ Completion│◀── in the heap, then ───┘
//!                       │   Queue   │    TransferDone is sent
//!                       └───────────┘
//! ```

mod cache;
mod rom;

pub use cache::{SampleCache, SampleView, SlotClass};
pub use rom::RomDevice;

use cadence_core::{Block, Heap};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};

use crate::error::EngineResult;

/// An address in the transfer device's address space.
pub type DeviceAddr = u32;

/// Notification that an asynchronous transfer has landed in the heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferDone {
    /// Caller-chosen tag from the request.
    pub tag: u32,
    /// Block that was filled.
    pub dest: Block,
}

/// An asynchronous copy from the device into the heap.
#[derive(Clone, Debug)]
pub struct TransferRequest {
    /// Device address of the first byte.
    pub source: DeviceAddr,
    /// Destination; its length is the transfer length.
    pub dest: Block,
    /// Caller-chosen tag echoed in [`TransferDone`].
    pub tag: u32,
    /// Where completion is reported.
    pub reply: Sender<TransferDone>,
}

/// The hardware (or simulated hardware) that moves archive bytes.
pub trait TransferDevice {
    /// Size of the device address space.
    fn size(&self) -> u32;

    /// Copies `dest.len()` bytes starting at `source`, blocking until done.
    ///
    /// # Errors
    ///
    /// [`crate::EngineError::Transfer`] if the range is not readable.
    fn copy_blocking(&mut self, source: DeviceAddr, dest: &mut [u8]) -> EngineResult<()>;

    /// Queues an asynchronous transfer.
    ///
    /// # Errors
    ///
    /// [`crate::EngineError::Transfer`] if the device cannot accept it.
    fn submit(&mut self, request: TransferRequest) -> EngineResult<()>;

    /// Lets the device make progress: finished transfers write their bytes
    /// into `heap` and post a [`TransferDone`].
    fn service(&mut self, heap: &mut Heap);

    /// Transfers submitted but not yet completed.
    fn in_flight(&self) -> usize;
}

/// Bounded queue of transfer completions.
#[derive(Clone, Debug)]
pub struct CompletionQueue {
    sender: Sender<TransferDone>,
    receiver: Receiver<TransferDone>,
}

impl CompletionQueue {
    /// Creates a queue holding up to `capacity` unread completions.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self { sender, receiver }
    }

    /// Sender handle to put in a [`TransferRequest`].
    #[inline]
    #[must_use]
    pub fn reply_to(&self) -> Sender<TransferDone> {
        self.sender.clone()
    }

    /// Takes one completion without blocking.
    #[inline]
    #[must_use]
    pub fn poll(&self) -> Option<TransferDone> {
        match self.receiver.try_recv() {
            Ok(done) => Some(done),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Discards every pending completion, returning how many there were.
    pub fn drain(&self) -> usize {
        self.receiver.try_iter().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_queue_poll_and_drain() {
        let queue = CompletionQueue::new(4);
        assert!(queue.poll().is_none());

        let reply = queue.reply_to();
        let done = TransferDone {
            tag: 3,
            dest: Block::new(16, 32),
        };
        reply.try_send(done).unwrap();
        reply.try_send(done).unwrap();

        assert_eq!(queue.poll(), Some(done));
        assert_eq!(queue.drain(), 1);
        assert!(queue.poll().is_none());
    }
}
