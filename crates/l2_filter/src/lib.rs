use core_types::{CutBucket, RetriggerLatch, RunConfig};
use serde::{Deserialize, Serialize};

mod threshold;

pub use threshold::{ActiveCut, ThresholdController};

#[derive(Debug, Clone, Copy, Default)]
pub struct FilterInput {
    pub nhit: u32,
    pub trigger_word: u32,
    pub latch: RetriggerLatch,
    pub active_cut: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilterDecision {
    pub accept: bool,
    pub bucket: CutBucket,
}

impl FilterDecision {
    pub fn reason(&self) -> &'static str {
        self.bucket.label()
    }
}

/// The level-two cut. An event is kept when it is over the active hit-count
/// cut, externally triggered, or a retrigger of a kept event above the
/// retrigger cut. The bucket records which of the three held.
pub fn evaluate(input: &FilterInput, cfg: &RunConfig) -> FilterDecision {
    let over_threshold = input.nhit > input.active_cut;
    let external = input.trigger_word & cfg.bitmask != 0;
    let retrigger =
        input.latch.pass_retrigger && input.latch.retrigger && input.nhit > cfg.retrigcut;

    let bucket = CutBucket::from_flags(over_threshold, external, retrigger);
    FilterDecision {
        accept: bucket.passed(),
        bucket,
    }
}

/// Runs [`evaluate`] and arms the retrigger latch when the event is kept.
pub fn apply(input: &FilterInput, latch: &mut RetriggerLatch, cfg: &RunConfig) -> FilterDecision {
    let decision = evaluate(input, cfg);
    if decision.accept {
        latch.pass_retrigger = true;
    }
    decision
}
