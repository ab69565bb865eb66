use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use core_types::{ConfigRecord, StatsSink, StatsSnapshot};
use rusqlite::{params, Connection};

/// Per-second trigger statistics and per-run cut configuration in SQLite.
pub struct SqliteStatsStore {
    conn: Connection,
}

impl SqliteStatsStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).context("create stats db dir")?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open stats db {}", path.display()))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn stats_rows(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM l2_stats", [], |row| row.get(0))?)
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS l2_config (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            logged_at_ms INTEGER NOT NULL,
            run INTEGER NOT NULL,
            source TEXT NOT NULL,
            profile TEXT NOT NULL,
            nhithi INTEGER NOT NULL,
            nhitlo INTEGER NOT NULL,
            lothresh INTEGER NOT NULL,
            lowindow INTEGER NOT NULL,
            retrigcut INTEGER NOT NULL,
            retrigwindow INTEGER NOT NULL,
            bitmask INTEGER NOT NULL,
            nhitbcut INTEGER NOT NULL,
            burstwindow INTEGER NOT NULL,
            burstsize INTEGER NOT NULL,
            endrate INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_l2_config_run ON l2_config(run);

        CREATE TABLE IF NOT EXISTS l2_stats (
            walltime INTEGER PRIMARY KEY,
            records_in INTEGER NOT NULL,
            records_out INTEGER NOT NULL,
            events INTEGER NOT NULL,
            gtid INTEGER NOT NULL,
            orphans INTEGER NOT NULL,
            burst_active INTEGER NOT NULL,
            pass_none INTEGER NOT NULL,
            pass_nhit INTEGER NOT NULL,
            pass_external INTEGER NOT NULL,
            pass_nhit_external INTEGER NOT NULL,
            pass_retrigger INTEGER NOT NULL,
            pass_nhit_retrigger INTEGER NOT NULL,
            pass_external_retrigger INTEGER NOT NULL,
            pass_all INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}

impl StatsSink for SqliteStatsStore {
    fn write_second(&mut self, s: &StatsSnapshot) -> Result<()> {
        let h = &s.histogram;
        self.conn.execute(
            r#"
            INSERT INTO l2_stats (
                walltime, records_in, records_out, events, gtid, orphans, burst_active,
                pass_none, pass_nhit, pass_external, pass_nhit_external,
                pass_retrigger, pass_nhit_retrigger, pass_external_retrigger, pass_all
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(walltime) DO UPDATE SET
                records_in=excluded.records_in,
                records_out=excluded.records_out,
                events=excluded.events,
                gtid=excluded.gtid,
                orphans=excluded.orphans,
                burst_active=excluded.burst_active,
                pass_none=excluded.pass_none,
                pass_nhit=excluded.pass_nhit,
                pass_external=excluded.pass_external,
                pass_nhit_external=excluded.pass_nhit_external,
                pass_retrigger=excluded.pass_retrigger,
                pass_nhit_retrigger=excluded.pass_nhit_retrigger,
                pass_external_retrigger=excluded.pass_external_retrigger,
                pass_all=excluded.pass_all
            "#,
            params![
                s.walltime,
                s.records_in as i64,
                s.records_out as i64,
                s.events as i64,
                s.gtid,
                s.orphans as i64,
                if s.burst_active { 1_i64 } else { 0_i64 },
                h[0] as i64,
                h[1] as i64,
                h[2] as i64,
                h[3] as i64,
                h[4] as i64,
                h[5] as i64,
                h[6] as i64,
                h[7] as i64,
            ],
        )?;
        Ok(())
    }

    fn write_config(&mut self, r: &ConfigRecord) -> Result<()> {
        let c = &r.config;
        self.conn.execute(
            r#"
            INSERT INTO l2_config (
                logged_at_ms, run, source, profile,
                nhithi, nhitlo, lothresh, lowindow, retrigcut, retrigwindow,
                bitmask, nhitbcut, burstwindow, burstsize, endrate
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                Utc::now().timestamp_millis(),
                r.run,
                r.source,
                r.profile,
                c.nhithi,
                c.nhitlo,
                c.lothresh,
                c.lowindow as i64,
                c.retrigcut,
                c.retrigwindow as i64,
                c.bitmask,
                c.nhitbcut,
                c.burstwindow as i64,
                c.burstsize,
                c.endrate,
            ],
        )?;
        tracing::debug!(run = r.run, profile = %r.profile, "run config logged");
        Ok(())
    }
}

/// Statistics sink used without a database: every payload goes to the log
/// as JSON.
#[derive(Debug, Default)]
pub struct LogStatsSink {
    written: u64,
}

impl LogStatsSink {
    pub fn written(&self) -> u64 {
        self.written
    }
}

impl StatsSink for LogStatsSink {
    fn write_second(&mut self, snapshot: &StatsSnapshot) -> Result<()> {
        let payload = serde_json::to_string(snapshot).context("encode stats snapshot")?;
        tracing::info!(target: "l2_stats", stats = %payload, "second complete");
        self.written += 1;
        Ok(())
    }

    fn write_config(&mut self, record: &ConfigRecord) -> Result<()> {
        let payload = serde_json::to_string(record).context("encode run config")?;
        tracing::info!(target: "l2_stats", config = %payload, "run config");
        self.written += 1;
        Ok(())
    }
}
