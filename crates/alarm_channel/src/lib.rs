use core_types::{Notifier, Severity};
use serde::{Deserialize, Serialize};

mod http;

pub use http::{HttpNotifier, HttpNotifierConfig, LogNotifier, CLIENT_NAME};

/// Deliveries allowed per wall-clock second for each severity class.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AlarmBudgets {
    pub debug: u32,
    pub info: u32,
    pub success: u32,
    pub warning: u32,
    pub error: u32,
}

impl Default for AlarmBudgets {
    fn default() -> Self {
        Self {
            debug: 5,
            info: 3,
            success: 2,
            warning: 5,
            error: 1,
        }
    }
}

impl AlarmBudgets {
    pub fn for_severity(&self, severity: Severity) -> u32 {
        match severity {
            Severity::Debug => self.debug,
            Severity::Info => self.info,
            Severity::Success => self.success,
            Severity::Warning => self.warning,
            Severity::Error => self.error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Handed to the notifier, which reported an error. Logged locally.
    Failed,
    Suppressed,
}

/// Per-second, per-class rate limiter in front of a [`Notifier`].
///
/// Counters reset whenever the wall-clock second changes. Before the reset,
/// every class that dropped messages in the old second gets one error-class
/// summary that bypasses the budget.
pub struct AlarmLimiter {
    budgets: AlarmBudgets,
    emitted: [u32; 5],
    suppressed: [u32; 5],
    last_sec: Option<i64>,
    notifier: Box<dyn Notifier>,
    failures: u64,
}

impl AlarmLimiter {
    pub fn new(budgets: AlarmBudgets, notifier: Box<dyn Notifier>) -> Self {
        Self {
            budgets,
            emitted: [0; 5],
            suppressed: [0; 5],
            last_sec: None,
            notifier,
            failures: 0,
        }
    }

    pub fn budgets(&self) -> &AlarmBudgets {
        &self.budgets
    }

    pub fn emitted(&self, severity: Severity) -> u32 {
        self.emitted[severity.index()]
    }

    pub fn suppressed(&self, severity: Severity) -> u32 {
        self.suppressed[severity.index()]
    }

    /// Deliveries the notifier rejected over the limiter's lifetime.
    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn emit(&mut self, now_sec: i64, severity: Severity, message: &str) -> Delivery {
        self.tick(now_sec);

        let idx = severity.index();
        self.emitted[idx] = self.emitted[idx].saturating_add(1);
        if self.emitted[idx] > self.budgets.for_severity(severity) {
            self.suppressed[idx] += 1;
            tracing::debug!(%severity, alarm = message, "alarm suppressed by rate limit");
            return Delivery::Suppressed;
        }
        self.deliver(severity, message)
    }

    /// Translates a legacy numeric level before emitting.
    pub fn emit_level(&mut self, now_sec: i64, level: i32, message: &str) -> Delivery {
        self.emit(now_sec, Severity::from_level(level), message)
    }

    /// Rolls the counters over when `now_sec` starts a new second.
    pub fn tick(&mut self, now_sec: i64) {
        if self.last_sec == Some(now_sec) {
            return;
        }
        self.flush_pending();
        self.emitted = [0; 5];
        self.last_sec = Some(now_sec);
    }

    /// Sends a skip summary for every class with suppressed messages and
    /// clears those counts.
    pub fn flush_pending(&mut self) {
        for severity in Severity::ALL {
            let idx = severity.index();
            let skipped = std::mem::take(&mut self.suppressed[idx]);
            if skipped > 0 {
                let summary = format!("ERROR OVERFLOW: {skipped} {severity} messages skipped");
                self.deliver(Severity::Error, &summary);
            }
        }
    }

    fn deliver(&mut self, severity: Severity, message: &str) -> Delivery {
        log_locally(severity, message);
        match self.notifier.notify(severity, message) {
            Ok(()) => Delivery::Sent,
            Err(err) => {
                self.failures += 1;
                tracing::warn!(
                    %severity,
                    level = severity.level(),
                    alarm = message,
                    error = %err,
                    "alarm delivery failed"
                );
                Delivery::Failed
            }
        }
    }
}

fn log_locally(severity: Severity, message: &str) {
    match severity {
        Severity::Debug => tracing::debug!(target: "alarm", "{message}"),
        Severity::Info | Severity::Success => {
            tracing::info!(target: "alarm", %severity, "{message}")
        }
        Severity::Warning => tracing::warn!(target: "alarm", "{message}"),
        Severity::Error => tracing::error!(target: "alarm", "{message}"),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use anyhow::anyhow;

    use super::*;

    type Log = Rc<RefCell<Vec<(Severity, String)>>>;

    struct Recording {
        log: Log,
        fail: bool,
    }

    impl Notifier for Recording {
        fn notify(&mut self, severity: Severity, message: &str) -> anyhow::Result<()> {
            self.log.borrow_mut().push((severity, message.to_string()));
            if self.fail {
                return Err(anyhow!("endpoint unreachable"));
            }
            Ok(())
        }
    }

    fn limiter(fail: bool) -> (AlarmLimiter, Log) {
        let log: Log = Rc::default();
        let notifier = Recording {
            log: log.clone(),
            fail,
        };
        (AlarmLimiter::new(AlarmBudgets::default(), Box::new(notifier)), log)
    }

    #[test]
    fn over_budget_messages_are_suppressed_then_summarized() {
        let (mut limiter, log) = limiter(false);
        let budget = limiter.budgets().warning;
        let mut sent = 0;
        for i in 0..=budget {
            if limiter.emit(100, Severity::Warning, &format!("w{i}")) == Delivery::Sent {
                sent += 1;
            }
        }
        assert_eq!(sent, budget);
        assert_eq!(limiter.suppressed(Severity::Warning), 1);
        assert_eq!(log.borrow().len(), budget as usize);

        assert_eq!(limiter.emit(101, Severity::Info, "next"), Delivery::Sent);
        let log = log.borrow();
        let summary = &log[budget as usize];
        assert_eq!(summary.0, Severity::Error);
        assert_eq!(summary.1, "ERROR OVERFLOW: 1 warning messages skipped");
        assert_eq!(log.last().map(|(_, m)| m.as_str()), Some("next"));
        assert_eq!(limiter.suppressed(Severity::Warning), 0);
        assert_eq!(limiter.emitted(Severity::Warning), 0);
        assert_eq!(limiter.emitted(Severity::Info), 1);
    }

    #[test]
    fn summaries_ignore_the_error_budget() {
        let (mut limiter, log) = limiter(false);
        for _ in 0..3 {
            limiter.emit(5, Severity::Debug, "d");
            limiter.emit(5, Severity::Error, "e");
        }
        limiter.emit(5, Severity::Success, "s1");
        limiter.emit(5, Severity::Success, "s2");
        limiter.emit(5, Severity::Success, "s3");
        assert_eq!(limiter.suppressed(Severity::Error), 2);
        assert_eq!(limiter.suppressed(Severity::Success), 1);

        log.borrow_mut().clear();
        limiter.tick(6);
        let log = log.borrow();
        assert_eq!(log.len(), 2);
        assert!(log.iter().all(|(s, _)| *s == Severity::Error));
        assert_eq!(log[0].1, "ERROR OVERFLOW: 1 success messages skipped");
        assert_eq!(log[1].1, "ERROR OVERFLOW: 2 error messages skipped");
    }

    #[test]
    fn same_second_tick_keeps_counters() {
        let (mut limiter, _log) = limiter(false);
        limiter.emit(9, Severity::Error, "a");
        limiter.emit(9, Severity::Error, "b");
        limiter.tick(9);
        assert_eq!(limiter.suppressed(Severity::Error), 1);
        assert_eq!(limiter.emitted(Severity::Error), 2);
    }

    #[test]
    fn failed_delivery_is_not_retried() {
        let (mut limiter, log) = limiter(true);
        assert_eq!(limiter.emit(1, Severity::Error, "boom"), Delivery::Failed);
        assert_eq!(limiter.failures(), 1);
        assert_eq!(log.borrow().len(), 1);
        assert_eq!(limiter.emit(1, Severity::Error, "again"), Delivery::Suppressed);
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn flush_pending_reports_at_end_of_run() {
        let (mut limiter, log) = limiter(false);
        limiter.emit(3, Severity::Error, "first");
        limiter.emit(3, Severity::Error, "second");
        limiter.flush_pending();
        assert_eq!(
            log.borrow().last().map(|(_, m)| m.clone()),
            Some("ERROR OVERFLOW: 1 error messages skipped".to_string())
        );
        limiter.flush_pending();
        assert_eq!(log.borrow().len(), 2);
    }

    #[test]
    fn legacy_levels_use_their_class_budget() {
        let (mut limiter, _log) = limiter(false);
        limiter.emit_level(1, 21, "ok");
        limiter.emit_level(1, 21, "ok");
        assert_eq!(limiter.emit_level(1, 21, "ok"), Delivery::Suppressed);
        assert_eq!(limiter.emitted(Severity::Success), 3);
    }

    #[test]
    fn budgets_parse_with_defaults() {
        let budgets: AlarmBudgets = toml::from_str("error = 4").expect("parse budgets");
        assert_eq!(budgets.error, 4);
        assert_eq!(budgets.warning, 5);
    }
}
