use bincode::Options;
use core_types::{
    DecodedHit, RawRecord, TriggerFault, TruncationReason, BANK_HEADER_WORDS,
};
use serde::{Deserialize, Serialize};

mod builder;

pub use builder::{run_header_record, HitRecordBuilder};

/// The event builder caps events at 10000 hits, but hardware faults can
/// produce records with up to 10240 channels.
pub const MAX_NHIT: u32 = 10_240;
/// Maximum record buffer size in bytes (4 MiB).
pub const MAX_BUFFSIZE: usize = 0x40_0000;
pub const MAX_BUFFSIZE_WORDS: usize = MAX_BUFFSIZE / 4;

/// Sub-record header flag: another sub-record follows.
pub const SUB_NOT_LAST: u32 = 0x8000_0000;
/// Sub-record header length field (words).
pub const SUB_LENGTH_MASK: u32 = 0x0003_ffff;

/// Fixed event header: five record words plus the six-word trigger-card block.
pub const PMT_RECORD_WORDS: usize = 11;
pub const WORDS_PER_HIT: usize = 3;
/// Word index of the first sub-record header inside the event header.
const SUB_HEADER_WORD: usize = 4;

/// Fixed-width event header as it sits on the wire.
/// Layout (big-endian words):
/// [info][run][event][nhit:16|daq_status:16][sub_header][mtc; 6]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PmtEventHeader {
    pub info: u32,
    pub run_number: u32,
    pub event_number: u32,
    pub nhit_status: u32,
    pub sub_header: u32,
    pub mtc: [u32; 6],
}

impl PmtEventHeader {
    pub fn nhit(&self) -> u32 {
        self.nhit_status & 0xffff
    }

    /// 43-bit primary clock: 32 high bits in word 2, 11 low bits at the top of word 1.
    pub fn time50(&self) -> u64 {
        (u64::from(self.mtc[2]) << 11) + u64::from(self.mtc[1] >> 21)
    }

    /// Secondary clock: 21 high bits at the bottom of word 1, 32 low bits in word 0.
    pub fn time10(&self) -> u64 {
        (u64::from(self.mtc[1] & 0x001f_ffff) << 32) + u64::from(self.mtc[0])
    }

    pub fn gtid(&self) -> u32 {
        self.mtc[3] & 0x00ff_ffff
    }

    pub fn trigger_word(&self) -> u32 {
        ((self.mtc[3] & 0xff00_0000) >> 24) | ((self.mtc[4] & 0x0003_ffff) << 8)
    }
}

/// Run header record. Only the run number and run-type mask are interpreted.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunHeader {
    pub date: u32,
    pub time: u32,
    pub daq_version: u32,
    pub run_number: u32,
    pub calibration_trial: u32,
    pub source_mask: u32,
    pub run_type: u32,
    pub gt_crate_mask: u32,
    pub first_gtid: u32,
    pub valid_gtid: u32,
}

/// Explicit big-endian + fixed-width encoding for the detector wire format.
#[inline]
pub fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

/// Read-only host-order view over wire-order words. The underlying record is
/// never modified; every read converts one word.
#[derive(Debug, Clone, Copy)]
pub struct WireWords<'a> {
    bytes: &'a [u8],
}

impl<'a> WireWords<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len() / 4
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<u32> {
        let start = index.checked_mul(4)?;
        let raw = self.bytes.get(start..start.checked_add(4)?)?;
        Some(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub fn to_host(&self) -> Vec<u32> {
        self.bytes
            .chunks_exact(4)
            .map(|w| u32::from_be_bytes([w[0], w[1], w[2], w[3]]))
            .collect()
    }
}

/// Inverse of [`WireWords::to_host`]: host words back to wire order.
pub fn wire_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

/// Decodes a hit record. Non-hit banks yield `Ok(None)` and are left for the
/// caller to pass through.
pub fn decode_hit(record: &RawRecord) -> Result<Option<DecodedHit>, TriggerFault> {
    if !record.is_hit_record() {
        return Ok(None);
    }

    let header: PmtEventHeader = wire_options()
        .deserialize(&record.payload)
        .map_err(|_| TriggerFault::TruncatedRecord {
            reason: TruncationReason::ShortHeader,
            word: record.payload_words(),
        })?;

    let nhit = header.nhit();
    if nhit > MAX_NHIT {
        return Err(TriggerFault::MalformedRecord {
            nhit,
            max: MAX_NHIT,
        });
    }

    let words = WireWords::new(&record.payload);
    let hit_end = PMT_RECORD_WORDS + WORDS_PER_HIT * nhit as usize;
    if words.len() < hit_end {
        return Err(TriggerFault::TruncatedRecord {
            reason: TruncationReason::ShortHitBlock,
            word: words.len(),
        });
    }

    let reclen_words = record_length_words(&words, nhit)?;

    Ok(Some(DecodedHit {
        time50: header.time50(),
        time10: header.time10(),
        nhit,
        trigger_word: header.trigger_word(),
        gtid: header.gtid(),
        run: header.run_number,
        reclen_words,
    }))
}

/// Bank header + event header + hit words + every chained sub-record.
fn record_length_words(words: &WireWords<'_>, nhit: u32) -> Result<u32, TriggerFault> {
    let mut size = (BANK_HEADER_WORDS + PMT_RECORD_WORDS + WORDS_PER_HIT * nhit as usize) as u64;
    let mut pos = SUB_HEADER_WORD;
    let mut sub_header = words.get(pos).ok_or(TriggerFault::TruncatedRecord {
        reason: TruncationReason::ShortHeader,
        word: pos,
    })?;

    while sub_header & SUB_NOT_LAST != 0 {
        let jump = (sub_header & SUB_LENGTH_MASK) as usize;
        if jump == 0 {
            return Err(TriggerFault::TruncatedRecord {
                reason: TruncationReason::ZeroJump,
                word: pos,
            });
        }
        if pos + jump > MAX_BUFFSIZE_WORDS {
            return Err(TriggerFault::TruncatedRecord {
                reason: TruncationReason::JumpTooLarge,
                word: pos,
            });
        }
        pos += jump;
        sub_header = words.get(pos).ok_or(TriggerFault::TruncatedRecord {
            reason: TruncationReason::JumpOutsideRecord,
            word: pos,
        })?;
        let len = (sub_header & SUB_LENGTH_MASK) as usize;
        if pos + len > words.len() {
            return Err(TriggerFault::TruncatedRecord {
                reason: TruncationReason::ShortSubRecord,
                word: pos,
            });
        }
        size += len as u64;
    }

    u32::try_from(size).map_err(|_| TriggerFault::TruncatedRecord {
        reason: TruncationReason::JumpTooLarge,
        word: pos,
    })
}

/// Decodes a run header. Other banks yield `Ok(None)`.
pub fn decode_run_header(record: &RawRecord) -> Result<Option<RunHeader>, TriggerFault> {
    if !record.is_run_header() {
        return Ok(None);
    }
    wire_options()
        .deserialize(&record.payload)
        .map(Some)
        .map_err(|_| TriggerFault::TruncatedRecord {
            reason: TruncationReason::ShortHeader,
            word: record.payload_words(),
        })
}
