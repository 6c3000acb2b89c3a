//! # Archive Builder
//!
//! Writes archives in the layout the loader reads. Used by the runner binary
//! to synthesise demo content and by the tests to stage exact scenarios.
//!
//! ```rust,ignore
//! let mut archive = ArchiveBuilder::new();
//! let bank = archive.add_bank(BankBuilder::new().sample(&pcm).instrument(0, 1.0));
//! archive.add_sequence(&script, &[bank]);
//! let device = RomDevice::new(archive.build(), 1);
//! ```

use cadence_shared::archive::{
    ArchiveHeader, BankHeader, DirectoryEntry, DirectoryHeader, DrumRecord, EnvelopePoint,
    InstrumentRecord, SampleRecord, SoundRecord, ARCHIVE_MAGIC, DIRECTORY_MAGIC,
    SAMPLE_RESIDENT,
};

/// Envelope every built instrument and drum points at.
const DEFAULT_ENVELOPE: [EnvelopePoint; 3] = [
    EnvelopePoint { delay: 1, arg: 32_000 },
    EnvelopePoint { delay: 1000, arg: 32_000 },
    EnvelopePoint { delay: 0, arg: 0 },
];

const INSTRUMENT_LEN: usize = std::mem::size_of::<InstrumentRecord>();
const DRUM_LEN: usize = std::mem::size_of::<DrumRecord>();
const SAMPLE_LEN: usize = std::mem::size_of::<SampleRecord>();

fn pad16(bytes: &mut Vec<u8>) {
    while bytes.len() % 16 != 0 {
        bytes.push(0);
    }
}

fn offset_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[derive(Clone, Debug)]
enum InstrumentSlot {
    Empty,
    Filled {
        range_lo: u8,
        range_hi: u8,
        release_rate: u8,
        sounds: [(usize, f32); 3],
    },
}

#[derive(Clone, Debug)]
struct DrumSpec {
    sample: usize,
    tuning: f32,
    pan: u8,
}

#[derive(Clone, Debug)]
struct SampleSpec {
    data: Vec<u8>,
    resident: bool,
}

/// Builds one bank blob plus its sample region.
#[derive(Clone, Debug, Default)]
pub struct BankBuilder {
    samples: Vec<SampleSpec>,
    instruments: Vec<InstrumentSlot>,
    drums: Vec<DrumSpec>,
}

impl BankBuilder {
    /// Starts an empty bank.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a device-resident sample. Samples are numbered in insertion order.
    #[must_use]
    pub fn sample(mut self, data: &[u8]) -> Self {
        self.samples.push(SampleSpec {
            data: data.to_vec(),
            resident: false,
        });
        self
    }

    /// Adds a sample copied into the heap when the bank loads.
    #[must_use]
    pub fn resident_sample(mut self, data: &[u8]) -> Self {
        self.samples.push(SampleSpec {
            data: data.to_vec(),
            resident: true,
        });
        self
    }

    /// Adds an instrument playing `sample` at every pitch.
    #[must_use]
    pub fn instrument(self, sample: usize, tuning: f32) -> Self {
        self.split_instrument(0, 127, [(sample, tuning); 3])
    }

    /// Adds an instrument with low / normal / high sounds split at
    /// `range_lo` and `range_hi`.
    #[must_use]
    pub fn split_instrument(mut self, range_lo: u8, range_hi: u8, sounds: [(usize, f32); 3]) -> Self {
        self.instruments.push(InstrumentSlot::Filled {
            range_lo,
            range_hi,
            release_rate: 0x20,
            sounds,
        });
        self
    }

    /// Leaves an instrument slot empty.
    #[must_use]
    pub fn empty_instrument(mut self) -> Self {
        self.instruments.push(InstrumentSlot::Empty);
        self
    }

    /// Adds a drum.
    #[must_use]
    pub fn drum(mut self, sample: usize, tuning: f32, pan: u8) -> Self {
        self.drums.push(DrumSpec { sample, tuning, pan });
        self
    }

    /// Encodes the bank as `(blob, sample region)`.
    #[must_use]
    pub fn encode(&self) -> (Vec<u8>, Vec<u8>) {
        // Body layout, all offsets body-relative:
        // [drum table off][instrument offs..][instruments][drum table][drums][samples][envelope]
        let instrument_table = 4;
        let instruments_at = instrument_table + 4 * self.instruments.len();
        let filled = self
            .instruments
            .iter()
            .filter(|slot| matches!(slot, InstrumentSlot::Filled { .. }))
            .count();
        let drum_table_at = instruments_at + INSTRUMENT_LEN * filled;
        let drums_at = drum_table_at + 4 * self.drums.len();
        let samples_at = drums_at + DRUM_LEN * self.drums.len();
        let envelope_at = samples_at + SAMPLE_LEN * self.samples.len();
        let body_len = envelope_at + std::mem::size_of_val(&DEFAULT_ENVELOPE);

        let mut body = vec![0u8; body_len];
        let sound = |(sample, tuning): (usize, f32)| SoundRecord {
            sample: if sample < self.samples.len() {
                offset_u32(samples_at + sample * SAMPLE_LEN)
            } else {
                0
            },
            tuning,
        };

        if !self.drums.is_empty() {
            body[0..4].copy_from_slice(&offset_u32(drum_table_at).to_le_bytes());
        }

        let mut next = instruments_at;
        for (index, slot) in self.instruments.iter().enumerate() {
            let InstrumentSlot::Filled {
                range_lo,
                range_hi,
                release_rate,
                sounds,
            } = slot
            else {
                continue;
            };
            let record = InstrumentRecord {
                flags: 0,
                range_lo: *range_lo,
                range_hi: *range_hi,
                release_rate: *release_rate,
                envelope: offset_u32(envelope_at),
                low: sound(sounds[0]),
                normal: sound(sounds[1]),
                high: sound(sounds[2]),
            };
            let table_slot = instrument_table + 4 * index;
            body[table_slot..table_slot + 4].copy_from_slice(&offset_u32(next).to_le_bytes());
            body[next..next + INSTRUMENT_LEN].copy_from_slice(bytemuck::bytes_of(&record));
            next += INSTRUMENT_LEN;
        }

        for (index, drum) in self.drums.iter().enumerate() {
            let at = drums_at + DRUM_LEN * index;
            let record = DrumRecord {
                flags: 0,
                release_rate: 0x20,
                pan: drum.pan,
                reserved: 0,
                envelope: offset_u32(envelope_at),
                sound: sound((drum.sample, drum.tuning)),
            };
            let table_slot = drum_table_at + 4 * index;
            body[table_slot..table_slot + 4].copy_from_slice(&offset_u32(at).to_le_bytes());
            body[at..at + DRUM_LEN].copy_from_slice(bytemuck::bytes_of(&record));
        }

        let mut region = Vec::new();
        for (index, sample) in self.samples.iter().enumerate() {
            let record = SampleRecord {
                flags: if sample.resident { SAMPLE_RESIDENT } else { 0 },
                address: offset_u32(region.len()),
                size: offset_u32(sample.data.len()),
                ..SampleRecord::default()
            };
            region.extend_from_slice(&sample.data);
            pad16(&mut region);
            let at = samples_at + SAMPLE_LEN * index;
            body[at..at + SAMPLE_LEN].copy_from_slice(bytemuck::bytes_of(&record));
        }

        body[envelope_at..].copy_from_slice(bytemuck::cast_slice(&DEFAULT_ENVELOPE));

        let header = BankHeader {
            instruments: offset_u32(self.instruments.len()),
            drums: offset_u32(self.drums.len()),
            reserved: [0; 2],
        };
        let mut blob = bytemuck::bytes_of(&header).to_vec();
        blob.extend_from_slice(&body);
        (blob, region)
    }
}

/// Builds a complete archive image.
#[derive(Clone, Debug, Default)]
pub struct ArchiveBuilder {
    banks: Vec<BankBuilder>,
    sequences: Vec<(Vec<u8>, Vec<u8>)>,
}

impl ArchiveBuilder {
    /// Starts an empty archive.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a bank and returns its id.
    pub fn add_bank(&mut self, bank: BankBuilder) -> u8 {
        self.banks.push(bank);
        u8::try_from(self.banks.len() - 1).unwrap_or(u8::MAX)
    }

    /// Adds a sequence using `banks` (in set order, last is the default)
    /// and returns its id.
    pub fn add_sequence(&mut self, bytecode: &[u8], banks: &[u8]) -> u8 {
        self.sequences.push((bytecode.to_vec(), banks.to_vec()));
        u8::try_from(self.sequences.len() - 1).unwrap_or(u8::MAX)
    }

    /// Lays out the archive.
    #[must_use]
    pub fn build(&self) -> Vec<u8> {
        let encoded: Vec<(Vec<u8>, Vec<u8>)> = self.banks.iter().map(BankBuilder::encode).collect();

        let mut image = vec![0u8; std::mem::size_of::<ArchiveHeader>()];
        pad16(&mut image);

        let sequences = image.len();
        let blobs: Vec<&[u8]> = self.sequences.iter().map(|(code, _)| code.as_slice()).collect();
        write_directory(&mut image, &blobs);

        let banks = image.len();
        let blobs: Vec<&[u8]> = encoded.iter().map(|(blob, _)| blob.as_slice()).collect();
        write_directory(&mut image, &blobs);

        let samples = image.len();
        let blobs: Vec<&[u8]> = encoded.iter().map(|(_, region)| region.as_slice()).collect();
        write_directory(&mut image, &blobs);

        let bank_sets = image.len();
        let table = self.bank_set_table();
        image.extend_from_slice(&table);
        pad16(&mut image);

        let header = ArchiveHeader {
            magic: ARCHIVE_MAGIC,
            sequences: offset_u32(sequences),
            banks: offset_u32(banks),
            samples: offset_u32(samples),
            bank_sets: offset_u32(bank_sets),
            bank_sets_len: offset_u32(table.len()),
            reserved: [0; 2],
        };
        image[..std::mem::size_of::<ArchiveHeader>()].copy_from_slice(bytemuck::bytes_of(&header));
        image
    }

    fn bank_set_table(&self) -> Vec<u8> {
        let mut table = vec![0u8; self.sequences.len() * 2];
        for (index, (_, banks)) in self.sequences.iter().enumerate() {
            let offset = u16::try_from(table.len()).unwrap_or(u16::MAX);
            table[index * 2..index * 2 + 2].copy_from_slice(&offset.to_le_bytes());
            table.push(u8::try_from(banks.len()).unwrap_or(u8::MAX));
            table.extend_from_slice(banks);
        }
        table
    }
}

/// Appends a directory whose blobs follow its entry table.
fn write_directory(image: &mut Vec<u8>, blobs: &[&[u8]]) {
    let start = image.len();
    let header = DirectoryHeader {
        magic: DIRECTORY_MAGIC,
        count: offset_u32(blobs.len()),
        reserved: [0; 2],
    };
    image.extend_from_slice(bytemuck::bytes_of(&header));
    let entries_at = image.len();
    image.resize(entries_at + blobs.len() * std::mem::size_of::<DirectoryEntry>(), 0);
    pad16(image);

    for (index, blob) in blobs.iter().enumerate() {
        let entry = DirectoryEntry {
            offset: offset_u32(image.len() - start),
            len: offset_u32(blob.len()),
        };
        let at = entries_at + index * std::mem::size_of::<DirectoryEntry>();
        image[at..at + std::mem::size_of::<DirectoryEntry>()]
            .copy_from_slice(bytemuck::bytes_of(&entry));
        image.extend_from_slice(blob);
        pad16(image);
    }
}
