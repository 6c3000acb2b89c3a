//! # ROM Device
//!
//! An in-memory transfer device over an archive image, with a configurable
//! completion latency. Used by the runner binary and the tests.

use std::collections::VecDeque;

use cadence_core::Heap;
use crossbeam_channel::TrySendError;

use super::{DeviceAddr, TransferDevice, TransferDone, TransferRequest};
use crate::error::{EngineError, EngineResult};

/// Transfers queued at once before `submit` starts rejecting.
const MAX_PENDING: usize = 256;

struct Pending {
    request: TransferRequest,
    ticks_left: u32,
}

/// Transfer device backed by an archive image in memory.
pub struct RomDevice {
    image: Vec<u8>,
    latency: u32,
    pending: VecDeque<Pending>,
    stalled: bool,
    submitted: u64,
    blocking_copies: u64,
}

impl RomDevice {
    /// Creates a device over `image` whose async transfers complete on the
    /// `latency`-th service call after submission (0 = the next one).
    #[must_use]
    pub fn new(image: Vec<u8>, latency: u32) -> Self {
        Self {
            image,
            latency,
            pending: VecDeque::with_capacity(MAX_PENDING),
            stalled: false,
            submitted: 0,
            blocking_copies: 0,
        }
    }

    /// Freezes (or resumes) every asynchronous transfer.
    pub fn set_stalled(&mut self, stalled: bool) {
        self.stalled = stalled;
    }

    /// Asynchronous transfers submitted so far.
    #[inline]
    #[must_use]
    pub const fn submitted(&self) -> u64 {
        self.submitted
    }

    /// Blocking copies performed so far.
    #[inline]
    #[must_use]
    pub const fn blocking_copies(&self) -> u64 {
        self.blocking_copies
    }

    /// Bytes of the image at `[source, source + len)`, if readable.
    fn range(&self, source: DeviceAddr, len: usize) -> Option<&[u8]> {
        let start = usize::try_from(source).ok()?;
        self.image.get(start..start.checked_add(len)?)
    }
}

impl TransferDevice for RomDevice {
    fn size(&self) -> u32 {
        u32::try_from(self.image.len()).unwrap_or(u32::MAX)
    }

    fn copy_blocking(&mut self, source: DeviceAddr, dest: &mut [u8]) -> EngineResult<()> {
        let bytes = self.range(source, dest.len()).ok_or(EngineError::Transfer {
            address: source,
            len: dest.len(),
        })?;
        dest.copy_from_slice(bytes);
        self.blocking_copies += 1;
        Ok(())
    }

    fn submit(&mut self, request: TransferRequest) -> EngineResult<()> {
        if self.pending.len() >= MAX_PENDING {
            return Err(EngineError::Transfer {
                address: request.source,
                len: request.dest.len(),
            });
        }
        self.submitted += 1;
        self.pending.push_back(Pending {
            request,
            ticks_left: self.latency,
        });
        Ok(())
    }

    fn service(&mut self, heap: &mut Heap) {
        if self.stalled {
            return;
        }

        let mut index = 0;
        while index < self.pending.len() {
            if self.pending[index].ticks_left > 0 {
                self.pending[index].ticks_left -= 1;
                index += 1;
                continue;
            }
            let Some(Pending { request, .. }) = self.pending.remove(index) else {
                break;
            };

            let target = heap.slice_mut(request.dest);
            let len = target.len();
            match self.range(request.source, len) {
                Some(bytes) => target.copy_from_slice(bytes),
                None => {
                    // Reads past the image end return zeroes, as open bus.
                    tracing::warn!(source = request.source, len, "transfer beyond image end");
                    target.fill(0);
                }
            }

            let done = TransferDone {
                tag: request.tag,
                dest: request.dest,
            };
            match request.reply.try_send(done) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(tag = request.tag, "completion queue full, notification dropped");
                }
            }
        }
    }

    fn in_flight(&self) -> usize {
        self.pending.len()
    }
}
