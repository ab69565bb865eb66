use core_types::{RawRecord, RHDR_BANK, ZDAB_BANK};

use crate::{
    wire_bytes, PMT_RECORD_WORDS, SUB_HEADER_WORD, SUB_LENGTH_MASK, SUB_NOT_LAST, WORDS_PER_HIT,
};

/// Assembles well-formed hit records. Used by tests, fixtures and the
/// replay tooling.
#[derive(Debug, Clone, Default)]
pub struct HitRecordBuilder {
    run: u32,
    event: u32,
    nhit: u32,
    time50: u64,
    time10: u64,
    gtid: u32,
    trigger_word: u32,
    sub_records: Vec<u32>,
}

impl HitRecordBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run(mut self, run: u32) -> Self {
        self.run = run;
        self
    }

    pub fn event(mut self, event: u32) -> Self {
        self.event = event;
        self
    }

    pub fn nhit(mut self, nhit: u32) -> Self {
        self.nhit = nhit;
        self
    }

    pub fn time50(mut self, ticks: u64) -> Self {
        self.time50 = ticks;
        self
    }

    pub fn time10(mut self, ticks: u64) -> Self {
        self.time10 = ticks;
        self
    }

    pub fn gtid(mut self, gtid: u32) -> Self {
        self.gtid = gtid;
        self
    }

    pub fn trigger_word(mut self, word: u32) -> Self {
        self.trigger_word = word;
        self
    }

    /// Appends a chained sub-record of `len` words, its header included.
    pub fn sub_record(mut self, len: u32) -> Self {
        self.sub_records.push(len.max(1));
        self
    }

    pub fn build(&self) -> RawRecord {
        let hit_words = WORDS_PER_HIT * self.nhit as usize;
        let sub_words: usize = self.sub_records.iter().map(|l| *l as usize).sum();
        let mut words = vec![0u32; PMT_RECORD_WORDS + hit_words + sub_words];

        let time50 = self.time50 & ((1 << 43) - 1);
        let time10 = self.time10 & ((1 << 53) - 1);

        words[0] = 0;
        words[1] = self.run;
        words[2] = self.event;
        words[3] = self.nhit & 0xffff;
        words[5] = time10 as u32;
        words[6] = ((time10 >> 32) as u32 & 0x001f_ffff) | (((time50 & 0x7ff) as u32) << 21);
        words[7] = (time50 >> 11) as u32;
        words[8] = (self.gtid & 0x00ff_ffff) | ((self.trigger_word & 0xff) << 24);
        words[9] = (self.trigger_word >> 8) & 0x0003_ffff;

        if !self.sub_records.is_empty() {
            let first_jump = (PMT_RECORD_WORDS - SUB_HEADER_WORD + hit_words) as u32;
            words[SUB_HEADER_WORD] = SUB_NOT_LAST | (first_jump & SUB_LENGTH_MASK);
            let mut pos = PMT_RECORD_WORDS + hit_words;
            let last = self.sub_records.len() - 1;
            for (i, len) in self.sub_records.iter().enumerate() {
                let more = if i < last { SUB_NOT_LAST } else { 0 };
                words[pos] = more | (len & SUB_LENGTH_MASK);
                pos += *len as usize;
            }
        }

        RawRecord::new(ZDAB_BANK, wire_bytes(&words))
    }
}

/// Eighteen-word run header with the given run number and run-type mask.
pub fn run_header_record(run: u32, run_type: u32) -> RawRecord {
    let mut words = [0u32; 18];
    words[3] = run;
    words[6] = run_type;
    RawRecord::new(RHDR_BANK, wire_bytes(&words))
}
