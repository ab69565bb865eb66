use core_types::{ClockAnomalyKind, DecodedHit, RetriggerLatch, TimeState, TriggerFault};

use crate::{MAXTIME, MAX_DRIFT, MAX_JUMP};

const HALF_PERIOD: u64 = MAXTIME / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockPhase {
    /// No hit seen yet this run.
    #[default]
    Unset,
    Tracking,
    /// The last hit was rejected; another rejection forces a reset.
    Faulted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClockVerdict {
    First,
    Advance,
    /// Primary clock wrapped; epoch was incremented.
    Rollover,
    /// Primary clock read zero; previous state kept.
    Orphan,
    /// Hit rejected; the last known-good state is returned.
    Rejected(TriggerFault),
    /// Second consecutive rejection. Time restarts from this hit and
    /// buffered events up to `flush_to` must be released.
    Reset { fault: TriggerFault, flush_to: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockOutcome {
    pub state: TimeState,
    pub verdict: ClockVerdict,
    /// Set when the hit's primary clock read zero.
    pub orphan: bool,
    /// Primary-vs-secondary disagreement when it exceeds the tolerance.
    pub drift_ticks: Option<u64>,
}

impl ClockOutcome {
    fn new(state: TimeState, verdict: ClockVerdict) -> Self {
        Self {
            state,
            verdict,
            orphan: false,
            drift_ticks: None,
        }
    }

    pub fn is_reset(&self) -> bool {
        matches!(self.verdict, ClockVerdict::Reset { .. })
    }

    pub fn fault(&self) -> Option<&TriggerFault> {
        match &self.verdict {
            ClockVerdict::Rejected(fault) | ClockVerdict::Reset { fault, .. } => Some(fault),
            _ => None,
        }
    }
}

/// Turns raw 43-bit clock readings into a monotonic timeline, handling
/// rollover, orphans, and out-of-order events. Performs no I/O; callers
/// act on the returned verdict.
#[derive(Debug, Default)]
pub struct ClockReconciler {
    standard: TimeState,
    phase: ClockPhase,
}

impl ClockReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> ClockPhase {
        self.phase
    }

    /// Last known-good time state.
    pub fn standard(&self) -> &TimeState {
        &self.standard
    }

    pub fn reconcile(
        &mut self,
        hit: &DecodedHit,
        prev: &TimeState,
        latch: &mut RetriggerLatch,
        retrigwindow: u64,
    ) -> ClockOutcome {
        let mut next = *prev;
        next.time50 = hit.time50;
        next.time10 = hit.time10;

        if self.phase == ClockPhase::Unset {
            next.longtime = next.time50;
            self.standard = next;
            self.phase = ClockPhase::Tracking;
            let mut out = ClockOutcome::new(next, ClockVerdict::First);
            out.orphan = hit.time50 == 0;
            return out;
        }

        let dd = drift(prev, &next);
        let drift_ticks = (dd > MAX_DRIFT).then_some(dd);

        if next.time50 > prev.time50 && next.time50 - prev.time50 <= retrigwindow {
            latch.retrigger = true;
        } else {
            latch.retrigger = false;
            latch.pass_retrigger = false;
        }

        if hit.time50 == 0 {
            let mut out = ClockOutcome::new(*prev, ClockVerdict::Orphan);
            out.orphan = true;
            out.drift_ticks = drift_ticks;
            return out;
        }

        let mut out = match self.check_order(&mut next, dd) {
            Ok(rolled) => {
                next.longtime = next.time50 + MAXTIME * u64::from(next.epoch);
                self.standard = next;
                self.phase = ClockPhase::Tracking;
                let verdict = if rolled {
                    ClockVerdict::Rollover
                } else {
                    ClockVerdict::Advance
                };
                ClockOutcome::new(next, verdict)
            }
            Err(fault) if self.phase == ClockPhase::Faulted => {
                let flush_to = self.standard.longtime;
                next.epoch = 0;
                next.longtime = next.time50;
                next.exptime = 0;
                self.standard = next;
                self.phase = ClockPhase::Tracking;
                ClockOutcome::new(next, ClockVerdict::Reset { fault, flush_to })
            }
            Err(fault) => {
                self.phase = ClockPhase::Faulted;
                let mut kept = self.standard;
                kept.walltime = prev.walltime;
                kept.oldwalltime = prev.oldwalltime;
                kept.exptime = prev.exptime;
                ClockOutcome::new(kept, ClockVerdict::Rejected(fault))
            }
        };
        out.drift_ticks = drift_ticks;
        out
    }

    /// Validates `next` against the last good state. `Ok(true)` means the
    /// primary clock rolled over and `next.epoch` was bumped.
    fn check_order(&self, next: &mut TimeState, dd: u64) -> Result<bool, TriggerFault> {
        let standard = &self.standard;
        let mut rolled = false;
        let mut gap = next.time50.wrapping_sub(standard.time50);

        if next.time50 < standard.time50 {
            let plausible_rollover = standard.time50 + next.time50 < MAXTIME + MAX_JUMP
                && dd < MAX_DRIFT
                && standard.time50 > MAXTIME - MAX_JUMP;
            if !plausible_rollover {
                return Err(anomaly(
                    ClockAnomalyKind::TimeRunningBackward,
                    standard,
                    next,
                ));
            }
            next.epoch += 1;
            rolled = true;
            gap = next.time50 + MAXTIME - standard.time50;
        }

        if gap > MAX_JUMP {
            return Err(anomaly(ClockAnomalyKind::LargeGap, standard, next));
        }
        Ok(rolled)
    }
}

fn anomaly(kind: ClockAnomalyKind, standard: &TimeState, observed: &TimeState) -> TriggerFault {
    TriggerFault::ClockAnomaly {
        kind,
        standard: standard.time50,
        observed: observed.time50,
    }
}

/// Signed primary-clock difference `a - b`, taken modulo the clock period.
fn wrapped_delta(a: u64, b: u64) -> i64 {
    let d = a.wrapping_sub(b) & (MAXTIME - 1);
    if d >= HALF_PERIOD {
        d as i64 - MAXTIME as i64
    } else {
        d as i64
    }
}

/// |5 * Δtime10 - Δtime50| between two readings, in primary ticks.
fn drift(old: &TimeState, new: &TimeState) -> u64 {
    let d50 = wrapped_delta(old.time50, new.time50);
    let d10 = old.time10 as i64 - new.time10 as i64;
    (d10.saturating_mul(5).saturating_sub(d50)).unsigned_abs()
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: u64 = 23;

    fn hit(time50: u64, time10: u64) -> DecodedHit {
        DecodedHit {
            time50,
            time10,
            nhit: 10,
            ..DecodedHit::default()
        }
    }

    struct Driver {
        clock: ClockReconciler,
        state: TimeState,
        latch: RetriggerLatch,
    }

    impl Driver {
        fn new() -> Self {
            Self {
                clock: ClockReconciler::new(),
                state: TimeState::default(),
                latch: RetriggerLatch::default(),
            }
        }

        fn feed(&mut self, time50: u64, time10: u64) -> ClockOutcome {
            let out = self
                .clock
                .reconcile(&hit(time50, time10), &self.state, &mut self.latch, WINDOW);
            self.state = out.state;
            out
        }
    }

    #[test]
    fn first_hit_starts_tracking() {
        let mut d = Driver::new();
        assert_eq!(d.clock.phase(), ClockPhase::Unset);
        let out = d.feed(1_000, 200);
        assert_eq!(out.verdict, ClockVerdict::First);
        assert_eq!(out.state.longtime, 1_000);
        assert!(!out.orphan);
        assert_eq!(d.clock.phase(), ClockPhase::Tracking);
    }

    #[test]
    fn first_hit_at_zero_is_an_orphan_but_still_tracks() {
        let mut d = Driver::new();
        let out = d.feed(0, 0);
        assert_eq!(out.verdict, ClockVerdict::First);
        assert!(out.orphan);
        assert_eq!(d.clock.phase(), ClockPhase::Tracking);
    }

    #[test]
    fn forward_hits_advance_longtime() {
        let mut d = Driver::new();
        d.feed(1_000, 200);
        let out = d.feed(6_000, 1_200);
        assert_eq!(out.verdict, ClockVerdict::Advance);
        assert_eq!(out.state.longtime, 6_000);
        assert_eq!(out.drift_ticks, None);
        assert_eq!(d.clock.standard().time50, 6_000);
    }

    #[test]
    fn zero_primary_clock_keeps_previous_state() {
        let mut d = Driver::new();
        d.feed(1_000, 200);
        let before = d.state;
        let out = d.feed(0, 300);
        assert_eq!(out.verdict, ClockVerdict::Orphan);
        assert!(out.orphan);
        assert_eq!(out.state, before);
    }

    #[test]
    fn rollover_near_period_end_bumps_epoch_once() {
        let mut d = Driver::new();
        d.feed(MAXTIME - 100, 1_000);
        let a = d.feed(MAXTIME - 95, 1_001);
        assert_eq!(a.verdict, ClockVerdict::Advance);
        let b = d.feed(50, 1_030);
        assert_eq!(b.verdict, ClockVerdict::Rollover);
        assert_eq!(b.state.epoch, 1);
        assert_eq!(b.state.longtime, MAXTIME + 50);
        assert!(b.state.longtime > a.state.longtime);
        assert_eq!(b.drift_ticks, None);

        let c = d.feed(400, 1_100);
        assert_eq!(c.verdict, ClockVerdict::Advance);
        assert_eq!(c.state.epoch, 1);
        assert_eq!(c.state.longtime, MAXTIME + 400);
    }

    #[test]
    fn wrap_with_clock_disagreement_runs_backward() {
        let mut d = Driver::new();
        d.feed(MAXTIME - 100, 1_000);
        // Secondary clock claims a 20_000-tick step while the primary moved 150.
        let out = d.feed(50, 5_000);
        assert!(matches!(
            out.verdict,
            ClockVerdict::Rejected(TriggerFault::ClockAnomaly {
                kind: ClockAnomalyKind::TimeRunningBackward,
                ..
            })
        ));
        assert!(out.drift_ticks.is_some());
        assert_eq!(out.state.epoch, 0);
    }

    #[test]
    fn single_backward_hit_is_rejected_and_standard_returned() {
        let mut d = Driver::new();
        d.feed(1_000_000, 200_000);
        d.state.exptime = 77;
        let out = d.feed(500_000, 100_000);
        assert!(matches!(out.verdict, ClockVerdict::Rejected(_)));
        assert_eq!(out.state.time50, 1_000_000);
        assert_eq!(out.state.longtime, 1_000_000);
        assert_eq!(out.state.exptime, 77);
        assert_eq!(d.clock.phase(), ClockPhase::Faulted);

        let ok = d.feed(1_000_500, 200_100);
        assert_eq!(ok.verdict, ClockVerdict::Advance);
        assert_eq!(d.clock.phase(), ClockPhase::Tracking);
    }

    #[test]
    fn two_consecutive_bad_hits_force_exactly_one_reset() {
        let mut d = Driver::new();
        d.feed(1_000_000, 200_000);
        d.state.exptime = 55;
        let outcomes = [
            d.feed(500_000, 100_000),
            d.feed(400_000, 80_000),
            d.feed(400_500, 80_100),
        ];
        let resets = outcomes.iter().filter(|o| o.is_reset()).count();
        assert_eq!(resets, 1);

        let reset = &outcomes[1];
        assert_eq!(
            reset.verdict,
            ClockVerdict::Reset {
                fault: TriggerFault::ClockAnomaly {
                    kind: ClockAnomalyKind::TimeRunningBackward,
                    standard: 1_000_000,
                    observed: 400_000,
                },
                flush_to: 1_000_000,
            }
        );
        assert_eq!(reset.state.longtime, 400_000);
        assert_eq!(reset.state.epoch, 0);
        assert_eq!(reset.state.exptime, 0);
        assert_eq!(outcomes[2].verdict, ClockVerdict::Advance);
    }

    #[test]
    fn large_forward_gap_is_rejected() {
        let mut d = Driver::new();
        d.feed(1_000, 200);
        let t = 1_000 + MAX_JUMP + 1;
        let out = d.feed(t, 200 + (MAX_JUMP + 1) / 5);
        assert!(matches!(
            out.fault(),
            Some(TriggerFault::ClockAnomaly {
                kind: ClockAnomalyKind::LargeGap,
                ..
            })
        ));
        assert_eq!(out.state.time50, 1_000);
    }

    #[test]
    fn gap_of_exactly_max_jump_is_accepted() {
        let mut d = Driver::new();
        d.feed(1_000, 200);
        let out = d.feed(1_000 + MAX_JUMP, 200 + MAX_JUMP / 5);
        assert_eq!(out.verdict, ClockVerdict::Advance);
    }

    #[test]
    fn drift_beyond_tolerance_is_reported_but_accepted() {
        let mut d = Driver::new();
        d.feed(10_000, 2_000);
        let out = d.feed(20_000, 2_000);
        assert_eq!(out.verdict, ClockVerdict::Advance);
        assert_eq!(out.drift_ticks, Some(10_000));

        let ok = d.feed(20_100, 2_020);
        assert_eq!(ok.drift_ticks, None);
    }

    #[test]
    fn retrigger_latch_tracks_window() {
        let mut d = Driver::new();
        d.feed(1_000, 200);
        d.latch.pass_retrigger = true;

        d.feed(1_000 + WINDOW, 200);
        assert!(d.latch.retrigger);
        assert!(d.latch.pass_retrigger);

        d.feed(1_000 + 3 * WINDOW, 200);
        assert!(!d.latch.retrigger);
        assert!(!d.latch.pass_retrigger);
    }

    #[test]
    fn wrapped_delta_is_signed_modulo_period() {
        assert_eq!(wrapped_delta(MAXTIME - 95, 50), -145);
        assert_eq!(wrapped_delta(50, MAXTIME - 95), 145);
        assert_eq!(wrapped_delta(10, 3), 7);
    }
}
