use core_types::{RunConfig, TimeState};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActiveCut {
    #[default]
    High,
    Low,
}

/// Hysteretic hit-count cut. A large event lowers the cut for `lowindow`
/// ticks; each further large event extends the window.
#[derive(Debug, Clone, Default)]
pub struct ThresholdController {
    active: ActiveCut,
}

impl ThresholdController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> ActiveCut {
        self.active
    }

    /// Applies one event and returns the cut now in force.
    pub fn update(&mut self, nhit: u32, time: &mut TimeState, cfg: &RunConfig) -> u32 {
        if nhit > cfg.lothresh {
            time.exptime = time.longtime.saturating_add(cfg.lowindow);
            self.active = ActiveCut::Low;
        }
        if time.longtime > time.exptime {
            self.active = ActiveCut::High;
        }
        self.active_cut(cfg)
    }

    pub fn reset(&mut self) {
        self.active = ActiveCut::High;
    }

    pub fn active_cut(&self, cfg: &RunConfig) -> u32 {
        match self.active {
            ActiveCut::High => cfg.nhithi,
            ActiveCut::Low => cfg.nhitlo,
        }
    }
}
