//! Pipeline state and its phase transitions.
//!
//! `PipelineState` is a plain value: the pipeline state machine owns and mutates it,
//! the checkpoint manager only (de)serializes it.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::core::error::StateError;
use crate::core::types::{Phase, PhaseResult, PhaseStatus};
use crate::cwa::EntryId;

/// Issue created in the external tracker for one plan document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedIssue {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub plan_path: Option<PathBuf>,
}

/// Epic plus issues produced by the beads sync phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeadsLink {
    pub epic_id: String,
    pub issues: Vec<TrackedIssue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineState {
    started: DateTime<Utc>,
    current_phase: Option<Phase>,
    #[serde(default = "all_pending", deserialize_with = "deserialize_statuses")]
    phase_statuses: BTreeMap<Phase, PhaseStatus>,
    #[serde(default)]
    phase_results: BTreeMap<Phase, PhaseResult>,
    #[serde(default)]
    context_entry_ids: BTreeMap<Phase, Vec<EntryId>>,
    #[serde(default)]
    checkpoint_id: Option<String>,
    #[serde(default)]
    beads_epic_id: Option<String>,
    #[serde(default)]
    beads_issues: Vec<TrackedIssue>,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new_at(Utc::now())
    }
}

impl PipelineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_at(started: DateTime<Utc>) -> Self {
        Self {
            started,
            current_phase: None,
            phase_statuses: all_pending(),
            phase_results: BTreeMap::new(),
            context_entry_ids: BTreeMap::new(),
            checkpoint_id: None,
            beads_epic_id: None,
            beads_issues: Vec::new(),
        }
    }

    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }

    pub fn current_phase(&self) -> Option<Phase> {
        self.current_phase
    }

    pub fn status(&self, phase: Phase) -> PhaseStatus {
        self.phase_statuses.get(&phase).copied().unwrap_or_default()
    }

    pub fn statuses(&self) -> impl Iterator<Item = (Phase, PhaseStatus)> + '_ {
        Phase::ALL.into_iter().map(|phase| (phase, self.status(phase)))
    }

    pub fn result(&self, phase: Phase) -> Option<&PhaseResult> {
        self.phase_results.get(&phase)
    }

    pub fn entries_for(&self, phase: Phase) -> &[EntryId] {
        self.context_entry_ids
            .get(&phase)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn checkpoint_id(&self) -> Option<&str> {
        self.checkpoint_id.as_deref()
    }

    pub fn beads_epic_id(&self) -> Option<&str> {
        self.beads_epic_id.as_deref()
    }

    pub fn beads_issues(&self) -> &[TrackedIssue] {
        &self.beads_issues
    }

    /// `Pending | Failed -> InProgress`; sets the current phase.
    pub fn start_phase(&mut self, phase: Phase) -> Result<(), StateError> {
        self.transition(phase, PhaseStatus::InProgress)?;
        self.current_phase = Some(phase);
        Ok(())
    }

    /// `InProgress -> Completed`; clears the current phase and stores the result.
    pub fn complete_phase(&mut self, phase: Phase, result: PhaseResult) -> Result<(), StateError> {
        self.finish(phase, PhaseStatus::Completed, result)
    }

    /// `InProgress -> Failed`; clears the current phase and stores the result.
    pub fn fail_phase(&mut self, phase: Phase, result: PhaseResult) -> Result<(), StateError> {
        self.finish(phase, PhaseStatus::Failed, result)
    }

    /// First phase still pending in canonical order.
    pub fn get_next_phase(&self) -> Option<Phase> {
        Phase::ALL
            .into_iter()
            .find(|phase| self.status(*phase) == PhaseStatus::Pending)
    }

    /// Append an entry id to the phase's list. Never overwrites.
    pub fn track_entry(&mut self, phase: Phase, entry_id: EntryId) {
        self.context_entry_ids
            .entry(phase)
            .or_default()
            .push(entry_id);
    }

    pub fn set_checkpoint_id(&mut self, id: impl Into<String>) {
        self.checkpoint_id = Some(id.into());
    }

    pub fn set_beads_link(&mut self, link: BeadsLink) {
        self.beads_epic_id = Some(link.epic_id);
        self.beads_issues = link.issues;
    }

    /// Fail any phase left `InProgress` by an interrupted process.
    ///
    /// Returns the phase that was interrupted, if any.
    pub fn mark_interrupted(&mut self) -> Option<Phase> {
        let interrupted = Phase::ALL
            .into_iter()
            .find(|phase| self.status(*phase) == PhaseStatus::InProgress)?;
        let result = PhaseResult::failure(interrupted, "interrupted before completion");
        // InProgress -> Failed is always legal.
        self.phase_statuses.insert(interrupted, PhaseStatus::Failed);
        self.phase_results.insert(interrupted, result);
        self.current_phase = None;
        Some(interrupted)
    }

    /// Highest entry id referenced by any phase.
    pub fn max_entry_id(&self) -> Option<EntryId> {
        self.context_entry_ids.values().flatten().copied().max()
    }

    pub fn failed_phases(&self) -> Vec<Phase> {
        self.statuses()
            .filter(|(_, status)| *status == PhaseStatus::Failed)
            .map(|(phase, _)| phase)
            .collect()
    }

    pub fn is_finished(&self) -> bool {
        self.statuses().all(|(_, status)| status.is_terminal())
    }

    fn finish(
        &mut self,
        phase: Phase,
        to: PhaseStatus,
        result: PhaseResult,
    ) -> Result<(), StateError> {
        if result.phase != phase {
            return Err(StateError::PhaseMismatch {
                phase,
                result: result.phase,
            });
        }
        self.transition(phase, to)?;
        if self.current_phase == Some(phase) {
            self.current_phase = None;
        }
        self.phase_results.insert(phase, result);
        Ok(())
    }

    fn transition(&mut self, phase: Phase, to: PhaseStatus) -> Result<(), StateError> {
        let from = self.status(phase);
        if !from.can_transition_to(to) {
            return Err(StateError::IllegalTransition { phase, from, to });
        }
        self.phase_statuses.insert(phase, to);
        Ok(())
    }
}

fn all_pending() -> BTreeMap<Phase, PhaseStatus> {
    Phase::ALL
        .into_iter()
        .map(|phase| (phase, PhaseStatus::Pending))
        .collect()
}

/// Missing phases default to `Pending` so every phase always has a status.
fn deserialize_statuses<'de, D>(deserializer: D) -> Result<BTreeMap<Phase, PhaseStatus>, D::Error>
where
    D: Deserializer<'de>,
{
    let mut statuses = BTreeMap::<Phase, PhaseStatus>::deserialize(deserializer)?;
    for phase in Phase::ALL {
        statuses.entry(phase).or_default();
    }
    Ok(statuses)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(phase: Phase) -> PhaseResult {
        PhaseResult::success(phase, Some("ok".to_string()), Vec::new()).expect("result")
    }

    #[test]
    fn fresh_state_has_every_phase_pending() {
        let state = PipelineState::new();
        assert!(
            state
                .statuses()
                .all(|(_, status)| status == PhaseStatus::Pending)
        );
        assert_eq!(state.statuses().count(), 6);
        assert_eq!(state.current_phase(), None);
    }

    #[test]
    fn next_phase_advances_after_completion() {
        let mut state = PipelineState::new();
        assert_eq!(state.get_next_phase(), Some(Phase::Research));

        state.start_phase(Phase::Research).expect("start");
        assert_eq!(state.current_phase(), Some(Phase::Research));
        state
            .complete_phase(Phase::Research, ok(Phase::Research))
            .expect("complete");

        assert_eq!(state.current_phase(), None);
        assert_eq!(state.get_next_phase(), Some(Phase::Decomposition));
    }

    #[test]
    fn next_phase_is_none_when_all_terminal() {
        let mut state = PipelineState::new();
        for phase in Phase::ALL {
            state.start_phase(phase).expect("start");
            if phase == Phase::BeadsSync {
                state
                    .fail_phase(phase, PhaseResult::failure(phase, "bd missing"))
                    .expect("fail");
            } else {
                state.complete_phase(phase, ok(phase)).expect("complete");
            }
        }
        assert_eq!(state.get_next_phase(), None);
        assert!(state.is_finished());
        assert_eq!(state.failed_phases(), vec![Phase::BeadsSync]);
    }

    #[test]
    fn rejects_pending_to_completed() {
        let mut state = PipelineState::new();
        let err = state
            .complete_phase(Phase::Research, ok(Phase::Research))
            .expect_err("illegal");
        assert_eq!(
            err,
            StateError::IllegalTransition {
                phase: Phase::Research,
                from: PhaseStatus::Pending,
                to: PhaseStatus::Completed,
            }
        );
        assert_eq!(state.status(Phase::Research), PhaseStatus::Pending);
        assert!(state.result(Phase::Research).is_none());
    }

    #[test]
    fn rejects_completed_to_in_progress() {
        let mut state = PipelineState::new();
        state.start_phase(Phase::Research).expect("start");
        state
            .complete_phase(Phase::Research, ok(Phase::Research))
            .expect("complete");

        let err = state.start_phase(Phase::Research).expect_err("illegal");
        assert!(matches!(
            err,
            StateError::IllegalTransition {
                from: PhaseStatus::Completed,
                to: PhaseStatus::InProgress,
                ..
            }
        ));
        assert_eq!(state.status(Phase::Research), PhaseStatus::Completed);
    }

    #[test]
    fn failed_phase_can_be_retried() {
        let mut state = PipelineState::new();
        state.start_phase(Phase::Decomposition).expect("start");
        state
            .fail_phase(
                Phase::Decomposition,
                PhaseResult::failure(Phase::Decomposition, "model error"),
            )
            .expect("fail");
        assert_eq!(state.current_phase(), None);

        state.start_phase(Phase::Decomposition).expect("retry");
        assert_eq!(state.status(Phase::Decomposition), PhaseStatus::InProgress);
    }

    #[test]
    fn result_for_other_phase_is_rejected() {
        let mut state = PipelineState::new();
        state.start_phase(Phase::Research).expect("start");
        let err = state
            .complete_phase(Phase::Research, ok(Phase::MultiDoc))
            .expect_err("mismatch");
        assert!(matches!(err, StateError::PhaseMismatch { .. }));
        assert_eq!(state.status(Phase::Research), PhaseStatus::InProgress);
    }

    #[test]
    fn track_entry_appends() {
        let mut state = PipelineState::new();
        state.track_entry(Phase::Research, EntryId::new(3));
        state.track_entry(Phase::Research, EntryId::new(7));
        state.track_entry(Phase::MultiDoc, EntryId::new(9));

        assert_eq!(
            state.entries_for(Phase::Research),
            &[EntryId::new(3), EntryId::new(7)]
        );
        assert_eq!(state.max_entry_id(), Some(EntryId::new(9)));
        assert!(state.entries_for(Phase::BeadsSync).is_empty());
    }

    #[test]
    fn mark_interrupted_fails_in_progress_phase() {
        let mut state = PipelineState::new();
        state.start_phase(Phase::Research).expect("start");
        state
            .complete_phase(Phase::Research, ok(Phase::Research))
            .expect("complete");
        state.start_phase(Phase::Decomposition).expect("start");

        assert_eq!(state.mark_interrupted(), Some(Phase::Decomposition));
        assert_eq!(state.status(Phase::Decomposition), PhaseStatus::Failed);
        assert_eq!(state.current_phase(), None);
        assert_eq!(state.mark_interrupted(), None);
    }

    #[test]
    fn deserialize_fills_missing_statuses() {
        let json = r#"{
            "started": "2026-01-01T00:00:00Z",
            "current_phase": null,
            "phase_statuses": {"research": "completed"}
        }"#;
        let state: PipelineState = serde_json::from_str(json).expect("parse");
        assert_eq!(state.status(Phase::Research), PhaseStatus::Completed);
        assert_eq!(state.statuses().count(), 6);
        assert_eq!(state.get_next_phase(), Some(Phase::Decomposition));
    }

    #[test]
    fn serializes_statuses_as_lowercase_strings() {
        let mut state = PipelineState::new();
        state.start_phase(Phase::Research).expect("start");
        let value = serde_json::to_value(&state).expect("serialize");
        assert_eq!(value["phase_statuses"]["research"], "in_progress");
        assert_eq!(value["phase_statuses"]["tdd_planning"], "pending");
        assert_eq!(value["current_phase"], "research");
    }
}
