use std::path::PathBuf;

use alarm_channel::{AlarmLimiter, HttpNotifier, LogNotifier};
use anyhow::Result;
use clap::Parser;
use core_types::{Notifier, Severity, StatsSink};
use infra_clock::{SystemWallClock, WallClock};
use observability::{init_metrics, init_tracing, write_metrics_snapshot};
use record_stream::{ChecksumRecordWriter, FramedRecordReader};
use stats_store::{LogStatsSink, SqliteStatsStore};
use trigger_runner::{
    describe_metrics, load_trigger_config, Collaborators, NullBurstSink, Orchestrator,
    TriggerConfig,
};

#[derive(Parser, Debug)]
#[command(
    name = "trigger_runner",
    about = "Level-two trigger filter for detector record streams",
    version
)]
struct Cli {
    /// Input record file.
    #[arg(short = 'i', long, env = "L2_INPUT")]
    input: PathBuf,
    /// Output base; writes <base>.zdab and appends its checksum to <base>.lock.
    #[arg(short = 'o', long, env = "L2_OUTPUT_BASE")]
    output: PathBuf,
    #[arg(short = 'c', long, env = "L2_CONFIG_PATH")]
    config: Option<PathBuf>,
    /// SQLite database for per-second statistics; logs them when unset.
    #[arg(long, env = "L2_STATS_DB")]
    stats_db: Option<PathBuf>,
    /// Refuse to overwrite an existing output file.
    #[arg(short = 'n', long, default_value_t = false)]
    no_clobber: bool,
    /// Keep alarms local instead of posting them to the monitoring endpoint.
    #[arg(short = 's', long, env = "L2_SILENT", default_value_t = false)]
    silent: bool,
    #[arg(long, env = "L2_ALARM_URL")]
    alarm_url: Option<String>,
    #[arg(long, env = "L2_LOG_DIR")]
    log_dir: Option<PathBuf>,
    /// Write a Prometheus text snapshot here at end of run.
    #[arg(long, env = "L2_METRICS_OUT")]
    metrics_out: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guards = init_tracing("trigger_runner", cli.log_dir.as_deref())?;
    let prometheus = init_metrics()?;
    describe_metrics();

    let clock = SystemWallClock;
    let loaded = match &cli.config {
        Some(path) => load_trigger_config(path),
        None => Ok(TriggerConfig::default()),
    };
    let fallback = TriggerConfig::default();
    let mut alarms = build_alarms(&cli, loaded.as_ref().unwrap_or(&fallback))?;

    let settings = match loaded {
        Ok(settings) => settings,
        Err(err) => return Err(abort(&mut alarms, &clock, "could not load configuration", err)),
    };
    let mut reader = match FramedRecordReader::open(&cli.input) {
        Ok(reader) => reader,
        Err(err) => return Err(abort(&mut alarms, &clock, "could not open input file", err)),
    };
    let writer = match ChecksumRecordWriter::create(&cli.output, !cli.no_clobber) {
        Ok(writer) => writer,
        Err(err) => return Err(abort(&mut alarms, &clock, "could not open output file", err)),
    };
    let stats = open_stats(&cli, &mut alarms, &clock);

    let source_name = cli
        .input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| cli.input.display().to_string());
    tracing::info!(
        input = %cli.input.display(),
        output = %writer.path().display(),
        silent = cli.silent,
        "trigger run starting"
    );

    let mut orchestrator = Orchestrator::new(
        settings,
        source_name,
        Collaborators {
            sink: Box::new(writer),
            burst: Box::new(NullBurstSink::default()),
            stats,
            clock: Box::new(clock),
            alarms,
        },
    );
    let streamed = orchestrator.run(&mut reader);
    let summary = orchestrator.finish()?;

    if let Some(path) = &cli.metrics_out {
        write_metrics_snapshot(&prometheus, path)?;
    }
    tracing::info!(
        records = summary.counters.records,
        events = summary.counters.events,
        written = summary.counters.written,
        dropped = summary.counters.dropped,
        checksum = summary.checksum.as_deref().unwrap_or(""),
        "trigger run finished"
    );
    streamed
}

fn build_alarms(cli: &Cli, settings: &TriggerConfig) -> Result<AlarmLimiter> {
    let http = settings.alarms.http_config(cli.alarm_url.as_deref());
    let notifier: Box<dyn Notifier> = match http {
        Some(cfg) if !cli.silent => match HttpNotifier::new(cfg) {
            Ok(notifier) => Box::new(notifier),
            Err(err) => {
                tracing::error!(error = %err, "could not initialize the alarm channel");
                return Err(err);
            }
        },
        _ => Box::new(LogNotifier::default()),
    };
    Ok(AlarmLimiter::new(settings.alarms.budgets, notifier))
}

fn open_stats(cli: &Cli, alarms: &mut AlarmLimiter, clock: &SystemWallClock) -> Box<dyn StatsSink> {
    let Some(path) = &cli.stats_db else {
        return Box::new(LogStatsSink::default());
    };
    match SqliteStatsStore::open(path) {
        Ok(store) => Box::new(store),
        Err(err) => {
            let msg = format!("could not open statistics database, logging here instead: {err:#}");
            alarms.emit(clock.now_sec(), Severity::Warning, &msg);
            Box::new(LogStatsSink::default())
        }
    }
}

fn abort(
    alarms: &mut AlarmLimiter,
    clock: &SystemWallClock,
    what: &str,
    err: anyhow::Error,
) -> anyhow::Error {
    let msg = format!("{what}. Aborting. ({err:#})");
    alarms.emit(clock.now_sec(), Severity::Error, &msg);
    err.context(what.to_string())
}
