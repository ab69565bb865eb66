use core_types::{BurstSink, RawRecord, RunConfig};

/// Burst collaborator for runs without a burst detector attached. Counts what
/// it is fed and never reports a burst.
#[derive(Debug, Default)]
pub struct NullBurstSink {
    observed: u64,
    resets: u64,
}

impl NullBurstSink {
    pub fn observed(&self) -> u64 {
        self.observed
    }

    pub fn resets(&self) -> u64 {
        self.resets
    }
}

impl BurstSink for NullBurstSink {
    fn observe(
        &mut self,
        _longtime: u64,
        _record: &RawRecord,
        _byte_len: usize,
        _cfg: &RunConfig,
    ) -> bool {
        self.observed += 1;
        false
    }

    fn reset(&mut self, flush_to: u64) {
        self.resets += 1;
        tracing::info!(flush_to, "burst buffer cleared");
    }

    fn end_of_run(&mut self, longtime: u64) {
        tracing::debug!(longtime, observed = self.observed, "burst buffer closed");
    }
}
