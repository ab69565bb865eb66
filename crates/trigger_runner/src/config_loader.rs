use std::fmt;
use std::fs;
use std::path::Path;

use alarm_channel::{AlarmBudgets, HttpNotifierConfig};
use anyhow::{Context, Result};
use core_types::RunConfig;
use serde::{Deserialize, Serialize};

/// Run-type bit that marks a physics run.
pub const DEFAULT_PHYSICS_RUN_MASK: u32 = 0x0000_0004;

/// Which set of cuts a run is using.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    Physics,
    Calibration,
    /// Built-in cuts used when the stream carries no run header.
    Default,
}

impl Profile {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Physics => "physics",
            Self::Calibration => "calibration",
            Self::Default => "default",
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Profiles {
    pub physics: RunConfig,
    pub calibration: RunConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AlarmSettings {
    /// Monitoring endpoint; alarms stay local when unset.
    pub url: Option<String>,
    pub timeout_ms: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    pub budgets: AlarmBudgets,
}

impl Default for AlarmSettings {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: HttpNotifierConfig::default().timeout_ms,
            username: None,
            password: None,
            budgets: AlarmBudgets::default(),
        }
    }
}

impl AlarmSettings {
    pub fn http_config(&self, url_override: Option<&str>) -> Option<HttpNotifierConfig> {
        let url = url_override
            .map(ToString::to_string)
            .or_else(|| self.url.clone())
            .filter(|u| !u.trim().is_empty())?;
        Some(HttpNotifierConfig {
            url,
            timeout_ms: self.timeout_ms,
            username: self.username.clone(),
            password: self.password.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TriggerConfig {
    pub physics_run_mask: u32,
    pub profiles: Profiles,
    pub alarms: AlarmSettings,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            physics_run_mask: DEFAULT_PHYSICS_RUN_MASK,
            profiles: Profiles::default(),
            alarms: AlarmSettings::default(),
        }
    }
}

impl TriggerConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(raw).context("parse trigger config")?;
        cfg.warn_on_suspicious_cuts();
        Ok(cfg)
    }

    /// Picks the profile for a run header's run-type mask.
    pub fn select(&self, run_type: u32) -> (Profile, RunConfig) {
        if run_type & self.physics_run_mask != 0 {
            (Profile::Physics, self.profiles.physics.clone())
        } else {
            (Profile::Calibration, self.profiles.calibration.clone())
        }
    }

    pub fn profile(&self, profile: Profile) -> RunConfig {
        match profile {
            Profile::Physics => self.profiles.physics.clone(),
            Profile::Calibration => self.profiles.calibration.clone(),
            Profile::Default => RunConfig::default(),
        }
    }

    fn warn_on_suspicious_cuts(&self) {
        for (name, cfg) in [
            ("physics", &self.profiles.physics),
            ("calibration", &self.profiles.calibration),
        ] {
            if cfg.nhitlo > cfg.nhithi {
                tracing::warn!(
                    profile = name,
                    nhitlo = cfg.nhitlo,
                    nhithi = cfg.nhithi,
                    "low cut is above the high cut"
                );
            }
        }
    }
}

pub fn load_trigger_config(path: &Path) -> Result<TriggerConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read trigger config {}", path.display()))?;
    TriggerConfig::from_toml_str(&raw)
        .with_context(|| format!("load trigger config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
physics_run_mask = 0x6

[profiles.physics]
nhithi = 40
nhitlo = 25

[profiles.calibration]
nhithi = 12
bitmask = 0xffff

[alarms]
url = "http://monitor.local/log"
timeout_ms = 500

[alarms.budgets]
error = 3
"#;

    #[test]
    fn sample_config_overrides_defaults() {
        let cfg = TriggerConfig::from_toml_str(SAMPLE).expect("parse");
        assert_eq!(cfg.physics_run_mask, 0x6);
        assert_eq!(cfg.profiles.physics.nhithi, 40);
        assert_eq!(cfg.profiles.physics.retrigcut, RunConfig::default().retrigcut);
        assert_eq!(cfg.profiles.calibration.bitmask, 0xffff);
        assert_eq!(cfg.alarms.budgets.error, 3);
        assert_eq!(cfg.alarms.budgets.info, AlarmBudgets::default().info);
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let cfg = TriggerConfig::from_toml_str("").expect("parse");
        assert_eq!(cfg, TriggerConfig::default());
        assert!(cfg.alarms.http_config(None).is_none());
    }

    #[test]
    fn run_type_mask_selects_profile() {
        let cfg = TriggerConfig::from_toml_str(SAMPLE).expect("parse");
        assert_eq!(cfg.select(0x4).0, Profile::Physics);
        assert_eq!(cfg.select(0x2).1.nhithi, 40);
        let (profile, cuts) = cfg.select(0x1);
        assert_eq!(profile, Profile::Calibration);
        assert_eq!(cuts.nhithi, 12);
        assert_eq!(cfg.profile(Profile::Default), RunConfig::default());
    }

    #[test]
    fn url_override_beats_file() {
        let cfg = TriggerConfig::from_toml_str(SAMPLE).expect("parse");
        let http = cfg.alarms.http_config(Some("http://other/log")).expect("http");
        assert_eq!(http.url, "http://other/log");
        assert_eq!(http.timeout_ms, 500);
        assert_eq!(
            cfg.alarms.http_config(None).map(|h| h.url),
            Some("http://monitor.local/log".to_string())
        );
    }

    #[test]
    fn bad_toml_is_an_error() {
        assert!(TriggerConfig::from_toml_str("physics_run_mask = \"x\"").is_err());
    }

    #[test]
    fn shipped_config_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../configs/l2.toml");
        let cfg = load_trigger_config(&path).expect("load shipped config");
        assert_eq!(cfg.physics_run_mask, DEFAULT_PHYSICS_RUN_MASK);
    }
}
