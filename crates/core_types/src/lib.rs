use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bank tag of a hit (event) record: ASCII `"ZDAB"` as a big-endian word.
pub const ZDAB_BANK: u32 = u32::from_be_bytes(*b"ZDAB");
/// Bank tag of a run header record.
pub const RHDR_BANK: u32 = u32::from_be_bytes(*b"RHDR");
/// Words of bank header that precede every payload and count toward record length.
pub const BANK_HEADER_WORDS: usize = 9;

/// One raw record as read from the stream. The payload stays in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub bank: u32,
    pub payload: Vec<u8>,
}

impl RawRecord {
    pub fn new(bank: u32, payload: Vec<u8>) -> Self {
        Self { bank, payload }
    }

    pub fn is_hit_record(&self) -> bool {
        self.bank == ZDAB_BANK
    }

    pub fn is_run_header(&self) -> bool {
        self.bank == RHDR_BANK
    }

    /// Whole payload words; a trailing partial word is ignored.
    pub fn payload_words(&self) -> usize {
        self.payload.len() / 4
    }

    /// Framed size in bytes including the bank header.
    pub fn byte_len(&self) -> usize {
        (BANK_HEADER_WORDS + self.payload_words()) * 4
    }

    pub fn bank_name(&self) -> String {
        String::from_utf8_lossy(&self.bank.to_be_bytes()).into_owned()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DecodedHit {
    /// 43-bit primary (50 MHz) clock.
    pub time50: u64,
    /// Secondary (10 MHz) clock.
    pub time10: u64,
    pub nhit: u32,
    pub trigger_word: u32,
    pub gtid: u32,
    pub run: u32,
    /// Total record length in words, chained sub-records included.
    pub reclen_words: u32,
}

impl DecodedHit {
    pub fn byte_len(&self) -> usize {
        self.reclen_words as usize * 4
    }
}

/// Reconciled time of the most recent hit record.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeState {
    pub time50: u64,
    pub time10: u64,
    /// Rollover-free primary clock: `time50 + 2^43 * epoch`.
    pub longtime: u64,
    pub epoch: u32,
    pub walltime: i64,
    pub oldwalltime: i64,
    /// Tick at which a lowered threshold reverts to the high cut.
    pub exptime: u64,
}

impl TimeState {
    /// Records the wall-clock second of this update; returns true when the
    /// second differs from the previous update.
    pub fn update_walltime(&mut self, now_sec: i64) -> bool {
        if self.walltime != 0 {
            self.oldwalltime = self.walltime;
        }
        self.walltime = now_sec;
        self.walltime != self.oldwalltime
    }
}

/// Retrigger flags carried between consecutive hit records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetriggerLatch {
    /// The previous event was accepted; a retrigger of it may use the retrigger cut.
    pub pass_retrigger: bool,
    /// This event follows the previous one within the retrigger window.
    pub retrigger: bool,
}

/// Per-run cut parameters. Tick values are primary-clock (50 MHz) ticks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunConfig {
    pub nhithi: u32,
    pub nhitlo: u32,
    /// Hit count above which the low cut is armed.
    pub lothresh: u32,
    pub lowindow: u64,
    pub retrigcut: u32,
    pub retrigwindow: u64,
    /// Trigger bits that mark an event as externally triggered.
    pub bitmask: u32,
    pub nhitbcut: u32,
    pub burstwindow: u64,
    pub burstsize: u32,
    pub endrate: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            nhithi: 30,
            nhitlo: 20,
            lothresh: 100,
            // 5 s
            lowindow: 250_000_000,
            retrigcut: 5,
            // 460 ns
            retrigwindow: 23,
            bitmask: 0x0000_8000,
            nhitbcut: 40,
            // 10 s
            burstwindow: 500_000_000,
            burstsize: 30,
            endrate: 10,
        }
    }
}

/// Index into the 8-way acceptance histogram. Bit 0: over the active cut,
/// bit 1: externally triggered, bit 2: accepted as a retrigger.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CutBucket(u8);

impl CutBucket {
    pub const OVER_THRESHOLD: u8 = 0b001;
    pub const EXTERNAL: u8 = 0b010;
    pub const RETRIGGER: u8 = 0b100;
    pub const COUNT: usize = 8;

    pub fn from_flags(over_threshold: bool, external: bool, retrigger: bool) -> Self {
        let mut bits = 0;
        if over_threshold {
            bits |= Self::OVER_THRESHOLD;
        }
        if external {
            bits |= Self::EXTERNAL;
        }
        if retrigger {
            bits |= Self::RETRIGGER;
        }
        Self(bits)
    }

    pub fn from_index(index: usize) -> Option<Self> {
        (index < Self::COUNT).then_some(Self(index as u8))
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn passed(self) -> bool {
        self.0 != 0
    }

    pub fn over_threshold(self) -> bool {
        self.0 & Self::OVER_THRESHOLD != 0
    }

    pub fn external(self) -> bool {
        self.0 & Self::EXTERNAL != 0
    }

    pub fn retrigger(self) -> bool {
        self.0 & Self::RETRIGGER != 0
    }

    pub fn label(self) -> &'static str {
        match self.0 {
            0 => "pass no cut",
            1 => "pass only nhit cut",
            2 => "pass only external trigger cut",
            3 => "pass both external trigger and nhit cuts",
            4 => "pass only retrigger cut",
            5 => "pass both retrigger and nhit cuts",
            6 => "pass both retrigger and external trigger cuts",
            _ => "pass all three cuts",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilterHistogram([u64; CutBucket::COUNT]);

impl FilterHistogram {
    pub fn record(&mut self, bucket: CutBucket) {
        self.0[bucket.index()] += 1;
    }

    pub fn count(&self, bucket: CutBucket) -> u64 {
        self.0[bucket.index()]
    }

    pub fn total(&self) -> u64 {
        self.0.iter().sum()
    }

    pub fn as_array(&self) -> [u64; CutBucket::COUNT] {
        self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = (CutBucket, u64)> + '_ {
        self.0
            .iter()
            .enumerate()
            .map(|(i, n)| (CutBucket(i as u8), *n))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunCounters {
    pub records: u64,
    pub events: u64,
    /// Records forwarded to output (accepted events and pass-through records).
    pub written: u64,
    /// Hit records dropped as malformed or truncated.
    pub dropped: u64,
    pub orphans: u64,
    pub histogram: FilterHistogram,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Success,
    Warning,
    Error,
}

impl Severity {
    pub const ALL: [Severity; 5] = [
        Severity::Debug,
        Severity::Info,
        Severity::Success,
        Severity::Warning,
        Severity::Error,
    ];

    /// Maps a legacy monitoring log level onto a severity class.
    pub fn from_level(level: i32) -> Self {
        match level {
            20 => Self::Info,
            21 => Self::Success,
            30 => Self::Warning,
            40 => Self::Error,
            _ => Self::Debug,
        }
    }

    /// Numeric level understood by the monitoring endpoint.
    pub fn level(self) -> i32 {
        match self {
            Self::Debug => 10,
            Self::Info => 20,
            Self::Success => 21,
            Self::Warning => 30,
            Self::Error => 40,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Self::Debug => 0,
            Self::Info => 1,
            Self::Success => 2,
            Self::Warning => 3,
            Self::Error => 4,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        };
        f.write_str(value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TruncationReason {
    ShortHeader,
    ShortHitBlock,
    JumpTooLarge,
    JumpOutsideRecord,
    ShortSubRecord,
    ZeroJump,
}

impl fmt::Display for TruncationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::ShortHeader => "record shorter than event header",
            Self::ShortHitBlock => "record shorter than its hit block",
            Self::JumpTooLarge => "sub-record jump past the end of the buffer",
            Self::JumpOutsideRecord => "sub-record jump outside the record",
            Self::ShortSubRecord => "sub-record extends past the end of the record",
            Self::ZeroJump => "zero-length sub-record jump",
        };
        f.write_str(value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClockAnomalyKind {
    TimeRunningBackward,
    LargeGap,
}

impl fmt::Display for ClockAnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::TimeRunningBackward => "time running backward",
            Self::LargeGap => "large time gap between events",
        };
        f.write_str(value)
    }
}

/// Per-record and external-write faults. None of these stop a run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TriggerFault {
    #[error("malformed record: {nhit} pmt hits exceeds maximum {max}")]
    MalformedRecord { nhit: u32, max: u32 },
    #[error("truncated record: {reason} (word {word})")]
    TruncatedRecord { reason: TruncationReason, word: usize },
    #[error("clock anomaly: {kind} (standard {standard}, observed {observed})")]
    ClockAnomaly {
        kind: ClockAnomalyKind,
        standard: u64,
        observed: u64,
    },
    #[error("no run header record found; using default cuts")]
    ConfigMissing,
    #[error("write to {target} failed: {detail}")]
    ExternalWriteFailure { target: String, detail: String },
}

impl TriggerFault {
    pub fn severity(&self) -> Severity {
        Severity::Warning
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedRecord { .. } => "malformed_record",
            Self::TruncatedRecord { .. } => "truncated_record",
            Self::ClockAnomaly { .. } => "clock_anomaly",
            Self::ConfigMissing => "config_missing",
            Self::ExternalWriteFailure { .. } => "external_write_failure",
        }
    }
}

/// Statistics for one wall-clock second.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub walltime: i64,
    pub records_in: u64,
    pub records_out: u64,
    pub events: u64,
    pub gtid: u32,
    pub orphans: u64,
    pub burst_active: bool,
    pub histogram: [u64; CutBucket::COUNT],
}

/// The configuration a run settled on, as logged to the statistics store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigRecord {
    pub run: u32,
    pub source: String,
    pub profile: String,
    pub config: RunConfig,
}

pub trait RecordSource {
    /// Next raw record, or `None` at end of stream.
    fn next_record(&mut self) -> Result<Option<RawRecord>>;
}

pub trait RecordSink {
    fn write(&mut self, record: &RawRecord) -> Result<()>;
    /// Closes the output; returns the checksum when the sink keeps one.
    fn finish(&mut self) -> Result<Option<String>>;
}

/// Windowed burst detection fed with qualifying events.
pub trait BurstSink {
    /// Returns whether a burst is in progress.
    fn observe(
        &mut self,
        longtime: u64,
        record: &RawRecord,
        byte_len: usize,
        cfg: &RunConfig,
    ) -> bool;
    /// Clears the buffer after a clock reset, flushing events up to `flush_to`.
    fn reset(&mut self, flush_to: u64);
    fn end_of_run(&mut self, longtime: u64);
}

pub trait StatsSink {
    fn write_second(&mut self, snapshot: &StatsSnapshot) -> Result<()>;
    fn write_config(&mut self, record: &ConfigRecord) -> Result<()>;
}

pub trait Notifier {
    fn notify(&mut self, severity: Severity, message: &str) -> Result<()>;
}
