//! Orchestrator run state machine.
//!
//! Happy path:
//! CHECK_NEW_DATA -> INGEST -> CHECK_DRIFT -> RETRAIN -> REDEPLOY -> DIAGNOSE -> DONE
//!
//! Early terminals: NO_NEW_DATA (after CHECK_NEW_DATA), NO_DRIFT (after CHECK_DRIFT).
//! Any working state may end in FAILED.
//!
//! The trace keeps one [`StageReport`] per visited working state, with its wall-clock duration.

use std::fmt;
use std::time::{Duration, Instant};
use serde::{Serialize, Deserialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState { CheckNewData, Ingest, CheckDrift, Retrain, Redeploy, Diagnose, Done, NoNewData, NoDrift, Failed }

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::CheckNewData => "CHECK_NEW_DATA",
            PipelineState::Ingest => "INGEST",
            PipelineState::CheckDrift => "CHECK_DRIFT",
            PipelineState::Retrain => "RETRAIN",
            PipelineState::Redeploy => "REDEPLOY",
            PipelineState::Diagnose => "DIAGNOSE",
            PipelineState::Done => "DONE",
            PipelineState::NoNewData => "NO_NEW_DATA",
            PipelineState::NoDrift => "NO_DRIFT",
            PipelineState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool { matches!(self, PipelineState::Done | PipelineState::NoNewData | PipelineState::NoDrift | PipelineState::Failed) }

    pub fn can_advance_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        if next == Failed { return !self.is_terminal(); }
        matches!((self, next),
            (CheckNewData, Ingest) | (CheckNewData, NoNewData)
            | (Ingest, CheckDrift)
            | (CheckDrift, Retrain) | (CheckDrift, NoDrift)
            | (Retrain, Redeploy)
            | (Redeploy, Diagnose)
            | (Diagnose, Done))
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome { Succeeded, Failed { reason: String } }

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageReport {
    pub stage: PipelineState,
    pub elapsed_ms: f64,
    pub outcome: StageOutcome,
}

impl StageReport {
    pub fn elapsed(&self) -> Duration { Duration::from_secs_f64(self.elapsed_ms.max(0.0) / 1000.0) }
    pub fn succeeded(&self) -> bool { self.outcome == StageOutcome::Succeeded }
}

#[derive(Debug)]
pub struct RunTrace {
    state: PipelineState,
    started_at: Instant,
    state_started_at: Instant,
    reports: Vec<StageReport>,
}

impl RunTrace {
    pub fn new() -> Self { let now = Instant::now(); Self { state: PipelineState::CheckNewData, started_at: now, state_started_at: now, reports: Vec::new() } }
    pub fn state(&self) -> PipelineState { self.state }
    pub fn reports(&self) -> &[StageReport] { &self.reports }
    pub fn total_elapsed(&self) -> Duration { self.started_at.elapsed() }

    /// Close the current working state and move to `next`.
    pub fn advance(&mut self, next: PipelineState) {
        debug_assert!(self.state.can_advance_to(next), "illegal transition {} -> {}", self.state, next);
        self.close(StageOutcome::Succeeded);
        self.state = next;
    }

    /// Close the current state as failed and land in FAILED.
    pub fn fail(&mut self, reason: impl Into<String>) {
        debug_assert!(self.state.can_advance_to(PipelineState::Failed));
        self.close(StageOutcome::Failed { reason: reason.into() });
        self.state = PipelineState::Failed;
    }

    /// Close the current state as failed but keep going to `next` (non-fatal stages only).
    pub fn advance_degraded(&mut self, next: PipelineState, reason: impl Into<String>) {
        debug_assert!(self.state.can_advance_to(next), "illegal transition {} -> {}", self.state, next);
        self.close(StageOutcome::Failed { reason: reason.into() });
        self.state = next;
    }

    fn close(&mut self, outcome: StageOutcome) {
        if self.state.is_terminal() { return; }
        let now = Instant::now();
        let dur = now - self.state_started_at;
        self.reports.push(StageReport { stage: self.state, elapsed_ms: dur.as_secs_f64() * 1000.0, outcome });
        self.state_started_at = now;
    }
}

impl Default for RunTrace {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_records_every_working_state() {
        let mut t = RunTrace::new();
        for next in [PipelineState::Ingest, PipelineState::CheckDrift, PipelineState::Retrain, PipelineState::Redeploy, PipelineState::Diagnose, PipelineState::Done] {
            t.advance(next);
        }
        assert_eq!(t.state(), PipelineState::Done);
        let stages: Vec<_> = t.reports().iter().map(|r| r.stage).collect();
        assert_eq!(stages, vec![PipelineState::CheckNewData, PipelineState::Ingest, PipelineState::CheckDrift, PipelineState::Retrain, PipelineState::Redeploy, PipelineState::Diagnose]);
        assert!(t.reports().iter().all(|r| r.succeeded()));
    }

    #[test]
    fn early_exit_and_failure_are_terminal() {
        let mut t = RunTrace::new();
        t.advance(PipelineState::NoNewData);
        assert!(t.state().is_terminal());

        let mut t = RunTrace::new();
        t.advance(PipelineState::Ingest);
        t.fail("disk full");
        assert_eq!(t.state(), PipelineState::Failed);
        assert_eq!(t.reports().last().unwrap().outcome, StageOutcome::Failed { reason: "disk full".into() });
    }

    #[test]
    fn transition_table() {
        assert!(PipelineState::CheckDrift.can_advance_to(PipelineState::NoDrift));
        assert!(!PipelineState::CheckNewData.can_advance_to(PipelineState::Retrain));
        assert!(!PipelineState::Done.can_advance_to(PipelineState::Failed));
        assert_eq!(PipelineState::NoNewData.to_string(), "NO_NEW_DATA");
    }
}
