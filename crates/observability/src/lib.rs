use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Keeps the non-blocking writers alive; dropping it flushes pending lines.
#[must_use = "log lines are lost when the guards are dropped"]
pub struct TracingGuards {
    _guards: Vec<WorkerGuard>,
}

/// Installs the global subscriber: stdout always, plus a daily-rolling
/// `<service>.log` under `log_dir` when given. A second call is a no-op.
pub fn init_tracing(service_name: &str, log_dir: Option<&Path>) -> Result<TracingGuards> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{service_name}=info,info")));

    let (stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let mut guards = vec![stdout_guard];

    let file_layer = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("create log dir {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, format!("{service_name}.log"));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);
            Some(fmt::layer().with_ansi(false).with_writer(writer))
        }
        None => None,
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(stdout))
        .with(file_layer)
        .try_init();

    Ok(TracingGuards { _guards: guards })
}

pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = PROM_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("install prometheus recorder")?;

    let _ = PROM_HANDLE.set(handle.clone());
    Ok(handle)
}

/// Writes the current Prometheus text exposition to `path`.
pub fn write_metrics_snapshot(handle: &PrometheusHandle, path: &Path) -> Result<()> {
    fs::write(path, handle.render())
        .with_context(|| format!("write metrics snapshot {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_handle_is_installed_once_and_renders_counters() {
        let a = init_metrics().expect("first install");
        let b = init_metrics().expect("second install");
        metrics::counter!("observability_test_total").increment(3);

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("metrics.prom");
        write_metrics_snapshot(&b, &path).expect("write snapshot");
        let text = std::fs::read_to_string(&path).expect("read snapshot");
        assert!(text.contains("observability_test_total 3"));
        assert_eq!(a.render(), b.render());
    }

    #[test]
    fn tracing_init_creates_log_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logs = dir.path().join("logs");
        let _guards = init_tracing("observability_test", Some(&logs)).expect("init tracing");
        assert!(logs.is_dir());
    }
}
