use alarm_channel::AlarmLimiter;
use anyhow::{Context, Result};
use core_types::{
    BurstSink, ConfigRecord, CutBucket, DecodedHit, RawRecord, RecordSink, RecordSource,
    RetriggerLatch, RunConfig, RunCounters, Severity, StatsSink, StatsSnapshot, TimeState,
    TriggerFault,
};
use infra_clock::{ClockOutcome, ClockReconciler, ClockVerdict, WallClock};
use l2_filter::{FilterInput, ThresholdController};
use serde::Serialize;
use zdab_wire::{decode_hit, decode_run_header};

use crate::config_loader::{Profile, TriggerConfig};

pub const RECORDS_TOTAL: &str = "l2_records_total";
pub const EVENTS_TOTAL: &str = "l2_events_total";
pub const ACCEPTED_TOTAL: &str = "l2_accepted_total";
pub const DROPPED_TOTAL: &str = "l2_dropped_total";
pub const ORPHANS_TOTAL: &str = "l2_orphans_total";
pub const CLOCK_ANOMALIES_TOTAL: &str = "l2_clock_anomalies_total";
pub const FAULTS_TOTAL: &str = "l2_faults_total";

pub fn describe_metrics() {
    metrics::describe_counter!(RECORDS_TOTAL, "records read from the input stream");
    metrics::describe_counter!(EVENTS_TOTAL, "hit records seen, including dropped ones");
    metrics::describe_counter!(ACCEPTED_TOTAL, "events kept by the level-two filter");
    metrics::describe_counter!(DROPPED_TOTAL, "malformed or truncated hit records");
    metrics::describe_counter!(ORPHANS_TOTAL, "hits with a zero primary clock");
    metrics::describe_counter!(CLOCK_ANOMALIES_TOTAL, "hits rejected by the clock reconciler");
    metrics::describe_counter!(FAULTS_TOTAL, "per-record and external-write faults by kind");
}

/// External collaborators the orchestrator dispatches to.
pub struct Collaborators {
    pub sink: Box<dyn RecordSink>,
    pub burst: Box<dyn BurstSink>,
    pub stats: Box<dyn StatsSink>,
    pub clock: Box<dyn WallClock>,
    pub alarms: AlarmLimiter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordDisposition {
    /// Non-hit record forwarded unchanged.
    PassThrough,
    /// Run header forwarded; `profile` is set when it configured the run.
    RunHeader { run: u32, profile: Option<Profile> },
    Accepted { bucket: CutBucket },
    Rejected { bucket: CutBucket },
    /// Hit record that could not be decoded; not forwarded.
    Dropped(TriggerFault),
}

impl RecordDisposition {
    fn forwards(&self) -> bool {
        matches!(
            self,
            Self::PassThrough | Self::RunHeader { .. } | Self::Accepted { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveRun {
    pub run: u32,
    pub profile: Profile,
    pub config: RunConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub source: String,
    pub counters: RunCounters,
    pub profile: Option<Profile>,
    pub burst_active: bool,
    pub epoch: u32,
    pub checksum: Option<String>,
}

impl RunSummary {
    pub fn closing_message(&self) -> String {
        let mut msg = format!(
            "Subfile {} finished.  {} records,  {} events processed.\n",
            self.source, self.counters.records, self.counters.events
        );
        for (bucket, n) in self.counters.histogram.iter() {
            msg.push_str(&format!("{n} events {}\n", bucket.label()));
        }
        msg
    }
}

/// Drives records one at a time through decode, clock reconciliation,
/// threshold adaptation, the filter, and dispatch.
pub struct Orchestrator {
    settings: TriggerConfig,
    source_name: String,
    sink: Box<dyn RecordSink>,
    burst: Box<dyn BurstSink>,
    stats: Box<dyn StatsSink>,
    clock: Box<dyn WallClock>,
    alarms: AlarmLimiter,
    reconciler: ClockReconciler,
    threshold: ThresholdController,
    time: TimeState,
    latch: RetriggerLatch,
    counters: RunCounters,
    active: Option<ActiveRun>,
    burst_active: bool,
    last_gtid: u32,
}

impl Orchestrator {
    pub fn new(
        settings: TriggerConfig,
        source_name: impl Into<String>,
        collab: Collaborators,
    ) -> Self {
        Self {
            settings,
            source_name: source_name.into(),
            sink: collab.sink,
            burst: collab.burst,
            stats: collab.stats,
            clock: collab.clock,
            alarms: collab.alarms,
            reconciler: ClockReconciler::new(),
            threshold: ThresholdController::new(),
            time: TimeState::default(),
            latch: RetriggerLatch::default(),
            counters: RunCounters::default(),
            active: None,
            burst_active: false,
            last_gtid: 0,
        }
    }

    pub fn counters(&self) -> &RunCounters {
        &self.counters
    }

    pub fn time(&self) -> &TimeState {
        &self.time
    }

    pub fn active_run(&self) -> Option<&ActiveRun> {
        self.active.as_ref()
    }

    pub fn threshold(&self) -> &ThresholdController {
        &self.threshold
    }

    pub fn burst_active(&self) -> bool {
        self.burst_active
    }

    pub fn alarms(&self) -> &AlarmLimiter {
        &self.alarms
    }

    /// Processes every record from `source`. A read error stops the loop
    /// and is returned; the caller still finishes the run.
    pub fn run(&mut self, source: &mut dyn RecordSource) -> Result<()> {
        loop {
            let record = match source.next_record() {
                Ok(Some(record)) => record,
                Ok(None) => return Ok(()),
                Err(err) => {
                    let now = self.clock.now_sec();
                    self.alarm(now, Severity::Error, &format!("input stream error: {err:#}"));
                    return Err(err);
                }
            };
            self.process(&record)?;
        }
    }

    /// Handles one record. Only an output write failure is an error.
    pub fn process(&mut self, record: &RawRecord) -> Result<RecordDisposition> {
        let now = self.clock.now_sec();
        self.alarms.tick(now);
        self.counters.records += 1;
        metrics::counter!(RECORDS_TOTAL).increment(1);

        let disposition = if record.is_run_header() {
            self.on_run_header(now, record)
        } else {
            match decode_hit(record) {
                Ok(Some(hit)) => self.on_hit(now, record, &hit),
                Ok(None) => RecordDisposition::PassThrough,
                Err(fault) => {
                    self.counters.events += 1;
                    self.counters.dropped += 1;
                    metrics::counter!(EVENTS_TOTAL).increment(1);
                    metrics::counter!(DROPPED_TOTAL).increment(1);
                    self.raise_fault(now, &fault);
                    RecordDisposition::Dropped(fault)
                }
            }
        };

        if disposition.forwards() {
            self.sink
                .write(record)
                .with_context(|| format!("write {} record to output", record.bank_name()))?;
            self.counters.written += 1;
        }
        Ok(disposition)
    }

    /// Closes the output, flushes the burst collaborator, and sends the
    /// closing summary. A failure to close the output is returned after the
    /// summary has gone out.
    pub fn finish(mut self) -> Result<RunSummary> {
        let now = self.clock.now_sec();
        let closed = self.sink.finish().context("close output");
        if let Err(err) = &closed {
            self.alarm(now, Severity::Error, &format!("{err:#}"));
        }
        self.burst.end_of_run(self.time.longtime);
        if self.time.walltime != 0 {
            self.write_snapshot(now, self.time.walltime);
        }
        let checksum = closed.as_ref().ok().cloned().flatten();

        let summary = RunSummary {
            source: self.source_name.clone(),
            counters: self.counters.clone(),
            profile: self.active.as_ref().map(|a| a.profile),
            burst_active: self.burst_active,
            epoch: self.time.epoch,
            checksum,
        };
        self.alarm(now, Severity::Success, &summary.closing_message());
        self.alarms.flush_pending();
        closed?;
        Ok(summary)
    }

    fn on_run_header(&mut self, now: i64, record: &RawRecord) -> RecordDisposition {
        let header = match decode_run_header(record) {
            Ok(Some(header)) => header,
            Ok(None) => return RecordDisposition::PassThrough,
            Err(fault) => {
                self.raise_fault(now, &fault);
                return RecordDisposition::PassThrough;
            }
        };

        if let Some(active) = &self.active {
            let msg = format!(
                "run header record in the middle of a run (run {}, keeping {} cuts of run {})",
                header.run_number, active.profile, active.run
            );
            self.alarm(now, Severity::Warning, &msg);
            return RecordDisposition::RunHeader {
                run: header.run_number,
                profile: None,
            };
        }

        let (profile, config) = self.settings.select(header.run_type);
        tracing::info!(
            run = header.run_number,
            run_type = format_args!("{:#x}", header.run_type),
            %profile,
            "run configured"
        );
        self.activate(now, header.run_number, profile, config);
        RecordDisposition::RunHeader {
            run: header.run_number,
            profile: Some(profile),
        }
    }

    fn on_hit(&mut self, now: i64, record: &RawRecord, hit: &DecodedHit) -> RecordDisposition {
        self.counters.events += 1;
        metrics::counter!(EVENTS_TOTAL).increment(1);

        let cfg = self.run_config(now, hit.run);

        let outcome = self
            .reconciler
            .reconcile(hit, &self.time, &mut self.latch, cfg.retrigwindow);
        self.on_clock(now, &outcome);
        self.time = outcome.state;
        self.last_gtid = hit.gtid;

        if self.time.update_walltime(now) && self.time.oldwalltime != 0 {
            self.write_snapshot(now, self.time.oldwalltime);
        }

        let active_cut = self.threshold.update(hit.nhit, &mut self.time, &cfg);

        if hit.nhit > cfg.nhitbcut && hit.trigger_word & cfg.bitmask == 0 {
            let bursting = self
                .burst
                .observe(self.time.longtime, record, hit.byte_len(), &cfg);
            self.burst_active |= bursting;
        }

        let input = FilterInput {
            nhit: hit.nhit,
            trigger_word: hit.trigger_word,
            latch: self.latch,
            active_cut,
        };
        let decision = l2_filter::apply(&input, &mut self.latch, &cfg);
        self.counters.histogram.record(decision.bucket);

        if decision.accept {
            metrics::counter!(ACCEPTED_TOTAL).increment(1);
            RecordDisposition::Accepted {
                bucket: decision.bucket,
            }
        } else {
            RecordDisposition::Rejected {
                bucket: decision.bucket,
            }
        }
    }

    fn on_clock(&mut self, now: i64, outcome: &ClockOutcome) {
        if outcome.orphan {
            self.counters.orphans += 1;
            metrics::counter!(ORPHANS_TOTAL).increment(1);
        }
        if let Some(dd) = outcome.drift_ticks {
            let msg = format!(
                "The 50MHz clock jumped by {dd} ticks relative to the 10MHz clock"
            );
            self.alarm(now, Severity::Warning, &msg);
        }

        match &outcome.verdict {
            ClockVerdict::Rollover => {
                let msg = format!("new clock epoch {}", outcome.state.epoch);
                self.alarm(now, Severity::Info, &msg);
            }
            ClockVerdict::Rejected(fault) => {
                metrics::counter!(CLOCK_ANOMALIES_TOTAL).increment(1);
                self.raise_fault(now, fault);
            }
            ClockVerdict::Reset { fault, flush_to } => {
                metrics::counter!(CLOCK_ANOMALIES_TOTAL).increment(1);
                self.raise_fault(now, fault);
                self.alarm(
                    now,
                    Severity::Error,
                    "Events out of order - resetting buffers",
                );
                self.burst.reset(*flush_to);
                self.threshold.reset();
            }
            ClockVerdict::First | ClockVerdict::Advance | ClockVerdict::Orphan => {}
        }
    }

    /// Cuts for the current run, falling back to the built-in profile (and
    /// reporting it) when no run header has been seen.
    fn run_config(&mut self, now: i64, run: u32) -> RunConfig {
        if let Some(active) = &self.active {
            return active.config.clone();
        }
        self.raise_fault(now, &TriggerFault::ConfigMissing);
        let config = self.settings.profile(Profile::Default);
        self.activate(now, run, Profile::Default, config.clone());
        config
    }

    fn activate(&mut self, now: i64, run: u32, profile: Profile, config: RunConfig) {
        let record = ConfigRecord {
            run,
            source: self.source_name.clone(),
            profile: profile.to_string(),
            config: config.clone(),
        };
        if let Err(err) = self.stats.write_config(&record) {
            let payload = serde_json::to_string(&record).unwrap_or_default();
            self.report_write_failure(now, "configuration log", &err, &payload);
        }
        self.active = Some(ActiveRun {
            run,
            profile,
            config,
        });
    }

    fn write_snapshot(&mut self, now: i64, walltime: i64) {
        let snapshot = StatsSnapshot {
            walltime,
            records_in: self.counters.records,
            records_out: self.counters.written,
            events: self.counters.events,
            gtid: self.last_gtid,
            orphans: self.counters.orphans,
            burst_active: self.burst_active,
            histogram: self.counters.histogram.as_array(),
        };
        if let Err(err) = self.stats.write_second(&snapshot) {
            let payload = serde_json::to_string(&snapshot).unwrap_or_default();
            self.report_write_failure(now, "statistics store", &err, &payload);
        }
    }

    fn report_write_failure(&mut self, now: i64, target: &str, err: &anyhow::Error, payload: &str) {
        let fault = TriggerFault::ExternalWriteFailure {
            target: target.to_string(),
            detail: format!("{err:#}"),
        };
        tracing::warn!(
            target: "l2_fallback",
            kind = fault.kind(),
            payload,
            "{fault}; logging here instead"
        );
        self.raise_fault(now, &fault);
    }

    fn raise_fault(&mut self, now: i64, fault: &TriggerFault) {
        metrics::counter!(FAULTS_TOTAL, "kind" => fault.kind()).increment(1);
        self.alarm(now, fault.severity(), &fault.to_string());
    }

    fn alarm(&mut self, now: i64, severity: Severity, message: &str) {
        self.alarms.emit(now, severity, message);
    }
}
