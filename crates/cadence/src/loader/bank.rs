//! # Bank Relocation
//!
//! A bank body arrives in the heap with every embedded reference stored as
//! a body-relative offset. Relocation validates each offset against the
//! body, then rewrites it in place:
//!
//! ```text
//! record offsets   body-relative ──▶ heap offset
//! sample address   region-relative ──▶ device address   (or heap offset when resident)
//! ```
//!
//! Records can be shared by several table entries, so each one carries a
//! relocated flag and is rewritten at most once.

use cadence_core::{ArenaPool, Block, Heap};
use cadence_shared::archive::{
    read_record, read_u32, write_record, DrumRecord, InstrumentRecord, SampleRecord, SoundRecord,
    RECORD_RELOCATED, SAMPLE_IN_HEAP, SAMPLE_RELOCATED, SAMPLE_RESIDENT,
};
use bytemuck::Pod;

use crate::error::{EngineError, EngineResult};
use crate::transfer::{DeviceAddr, TransferDevice};

/// A relocated bank resident in the heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BankEntry {
    body: Block,
    instruments: u32,
    drums: u32,
}

impl BankEntry {
    /// Heap block holding the bank body.
    #[inline]
    #[must_use]
    pub const fn block(&self) -> Block {
        self.body
    }

    /// Number of instrument slots.
    #[inline]
    #[must_use]
    pub const fn instrument_count(&self) -> u32 {
        self.instruments
    }

    /// Number of drum slots.
    #[inline]
    #[must_use]
    pub const fn drum_count(&self) -> u32 {
        self.drums
    }

    /// Instrument `index`, if the slot is filled.
    #[must_use]
    pub fn instrument(&self, heap: &Heap, index: u8) -> Option<InstrumentRecord> {
        if u32::from(index) >= self.instruments {
            return None;
        }
        let at = read_u32(heap.bytes(), self.body.offset() + 4 + 4 * usize::from(index))?;
        if at == 0 {
            return None;
        }
        read_record(heap.bytes(), at as usize)
    }

    /// Drum `index`, if the slot is filled.
    #[must_use]
    pub fn drum(&self, heap: &Heap, index: u8) -> Option<DrumRecord> {
        if u32::from(index) >= self.drums {
            return None;
        }
        let table = read_u32(heap.bytes(), self.body.offset())?;
        if table == 0 {
            return None;
        }
        let at = read_u32(heap.bytes(), table as usize + 4 * usize::from(index))?;
        if at == 0 {
            return None;
        }
        read_record(heap.bytes(), at as usize)
    }

    /// Sample metadata behind `sound`.
    #[must_use]
    pub fn sample(heap: &Heap, sound: &SoundRecord) -> Option<SampleRecord> {
        if sound.sample == 0 {
            return None;
        }
        read_record(heap.bytes(), sound.sample as usize)
    }
}

/// Patches a freshly transferred bank body in place.
pub struct Relocator<'a> {
    heap: &'a mut Heap,
    body: Block,
    sample_base: DeviceAddr,
}

impl<'a> Relocator<'a> {
    /// Prepares relocation of `body` whose samples live at `sample_base`.
    pub fn new(heap: &'a mut Heap, body: Block, sample_base: DeviceAddr) -> Self {
        Self {
            heap,
            body,
            sample_base,
        }
    }

    /// Rewrites every offset of a bank with the given table sizes.
    ///
    /// Resident samples are copied into `misc` when it has room; otherwise
    /// they stay on the device.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidArchive`] if any offset points outside the body.
    pub fn run(
        mut self,
        instruments: u32,
        drums: u32,
        misc: &mut ArenaPool,
        device: &mut dyn TransferDevice,
    ) -> EngineResult<BankEntry> {
        let table_end = 4 + 4 * instruments as usize;
        if table_end > self.body.len() {
            return Err(EngineError::InvalidArchive("instrument table outside bank"));
        }

        let drum_table = self.read::<u32>(self.body.offset())?;
        if drum_table != 0 && drums > 0 {
            let table = self.patch_offset(self.body.offset(), drums as usize * 4)?;
            for index in 0..drums as usize {
                let slot = table + index * 4;
                if self.read::<u32>(slot)? == 0 {
                    continue;
                }
                let drum = self.patch_offset(slot, std::mem::size_of::<DrumRecord>())?;
                self.relocate_drum(drum, misc, device)?;
            }
        }

        for index in 0..instruments as usize {
            let slot = self.body.offset() + 4 + index * 4;
            if self.read::<u32>(slot)? == 0 {
                continue;
            }
            let instrument = self.patch_offset(slot, std::mem::size_of::<InstrumentRecord>())?;
            self.relocate_instrument(instrument, misc, device)?;
        }

        Ok(BankEntry {
            body: self.body,
            instruments,
            drums,
        })
    }

    fn read<T: Pod>(&self, at: usize) -> EngineResult<T> {
        read_record(self.heap.bytes(), at).ok_or(EngineError::InvalidArchive("read outside bank"))
    }

    fn write<T: Pod>(&mut self, at: usize, value: &T) -> EngineResult<()> {
        if write_record(self.heap.bytes_mut(), at, value) {
            Ok(())
        } else {
            Err(EngineError::InvalidArchive("write outside bank"))
        }
    }

    /// Converts a body-relative offset into a heap offset after checking
    /// that `len` bytes fit behind it.
    fn resolve(&self, relative: u32, len: usize) -> EngineResult<u32> {
        let relative = relative as usize;
        if !self.body.contains_range(self.body.offset() + relative, len) {
            return Err(EngineError::InvalidArchive("bank offset out of range"));
        }
        u32::try_from(self.body.offset() + relative)
            .map_err(|_| EngineError::InvalidArchive("bank offset out of range"))
    }

    /// Rewrites the u32 offset stored at `slot` and returns its heap target.
    fn patch_offset(&mut self, slot: usize, len: usize) -> EngineResult<usize> {
        let relative = self.read::<u32>(slot)?;
        let absolute = self.resolve(relative, len)?;
        self.write(slot, &absolute)?;
        Ok(absolute as usize)
    }

    fn relocate_instrument(
        &mut self,
        at: usize,
        misc: &mut ArenaPool,
        device: &mut dyn TransferDevice,
    ) -> EngineResult<()> {
        let mut record = self.read::<InstrumentRecord>(at)?;
        if record.flags & RECORD_RELOCATED != 0 {
            return Ok(());
        }
        record.envelope = self.resolve_envelope(record.envelope)?;
        record.low = self.relocate_sound(record.low, misc, device)?;
        record.normal = self.relocate_sound(record.normal, misc, device)?;
        record.high = self.relocate_sound(record.high, misc, device)?;
        record.flags |= RECORD_RELOCATED;
        self.write(at, &record)
    }

    fn relocate_drum(
        &mut self,
        at: usize,
        misc: &mut ArenaPool,
        device: &mut dyn TransferDevice,
    ) -> EngineResult<()> {
        let mut record = self.read::<DrumRecord>(at)?;
        if record.flags & RECORD_RELOCATED != 0 {
            return Ok(());
        }
        record.envelope = self.resolve_envelope(record.envelope)?;
        record.sound = self.relocate_sound(record.sound, misc, device)?;
        record.flags |= RECORD_RELOCATED;
        self.write(at, &record)
    }

    fn resolve_envelope(&self, relative: u32) -> EngineResult<u32> {
        if relative == 0 {
            return Ok(0);
        }
        self.resolve(relative, 4)
    }

    fn relocate_sound(
        &mut self,
        mut sound: SoundRecord,
        misc: &mut ArenaPool,
        device: &mut dyn TransferDevice,
    ) -> EngineResult<SoundRecord> {
        if sound.sample == 0 {
            return Ok(sound);
        }
        sound.sample = self.resolve(sound.sample, std::mem::size_of::<SampleRecord>())?;
        let at = sound.sample as usize;

        let mut sample = self.read::<SampleRecord>(at)?;
        if sample.flags & SAMPLE_RELOCATED != 0 {
            return Ok(sound);
        }

        let device_addr = self
            .sample_base
            .checked_add(sample.address)
            .ok_or(EngineError::InvalidArchive("sample address overflow"))?;
        sample.address = device_addr;
        if sample.loop_ref != 0 {
            sample.loop_ref = self.resolve(sample.loop_ref, 4)?;
        }
        if sample.book != 0 {
            sample.book = self.resolve(sample.book, 4)?;
        }

        if sample.flags & SAMPLE_RESIDENT != 0 {
            let size = sample.size as usize;
            match misc.alloc(self.heap, size) {
                Some(block) => {
                    let block = Block::new(block.offset(), size);
                    device.copy_blocking(device_addr, self.heap.slice_mut(block))?;
                    sample.address = u32::try_from(block.offset())
                        .map_err(|_| EngineError::InvalidArchive("sample beyond heap range"))?;
                    sample.flags |= SAMPLE_IN_HEAP;
                }
                None => {
                    tracing::debug!(size, "no room for resident sample, leaving it on device");
                }
            }
        }

        sample.flags |= SAMPLE_RELOCATED;
        self.write(at, &sample)?;
        Ok(sound)
    }
}
