use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::models::{AutoFixState, AutoFixStatus};
use crate::store::GitHubStore;

/// Legal forward moves in the auto-fix lifecycle. Terminal states have
/// no exits; RateLimited and MergeConflict can resume.
fn can_transition(from: AutoFixStatus, to: AutoFixStatus) -> bool {
    use AutoFixStatus::*;
    if from == to {
        return true;
    }
    match from {
        Pending => matches!(to, Analyzing | Cancelled),
        Analyzing => matches!(to, CreatingSpec | Failed | Cancelled | RateLimited),
        CreatingSpec => matches!(to, WaitingApproval | Building | Failed | Cancelled | Stale),
        WaitingApproval => matches!(to, Building | Cancelled | Stale),
        Building => matches!(to, QaReview | Failed | Cancelled | MergeConflict | RateLimited),
        QaReview => matches!(to, PrCreated | Building | Failed | Cancelled),
        PrCreated => matches!(to, Completed | MergeConflict | Failed),
        MergeConflict => matches!(to, Building | Failed | Cancelled),
        RateLimited => matches!(to, Analyzing | Building | Cancelled),
        Stale => matches!(to, Analyzing | Cancelled),
        Completed | Failed | Cancelled => false,
    }
}

/// Tracks the state of automatic issue fixes, persisting every move so a
/// restart resumes where the flow stopped.
pub struct AutoFixTracker {
    store: Arc<GitHubStore>,
}

impl AutoFixTracker {
    pub fn new(store: Arc<GitHubStore>) -> Self {
        Self { store }
    }

    pub fn current(&self, issue_number: u64) -> AutoFixState {
        self.store
            .load_autofix(issue_number)
            .unwrap_or(AutoFixState {
                issue_number,
                status: AutoFixStatus::Pending,
                spec_dir: None,
                pr_number: None,
                error: None,
                updated_at: Utc::now(),
            })
    }

    /// Advance the flow. Illegal transitions are rejected so two racing
    /// flows cannot corrupt the lifecycle.
    pub fn advance(
        &self,
        issue_number: u64,
        to: AutoFixStatus,
        update: impl FnOnce(&mut AutoFixState),
    ) -> anyhow::Result<AutoFixState> {
        let mut state = self.current(issue_number);
        if !can_transition(state.status, to) {
            anyhow::bail!(
                "illegal auto-fix transition for issue {issue_number}: {:?} -> {to:?}",
                state.status
            );
        }
        state.status = to;
        state.updated_at = Utc::now();
        update(&mut state);

        if let Err(e) = self.store.save_autofix(&state) {
            warn!(issue_number, error = %e, "could not persist auto-fix state");
        }
        info!(issue_number, status = ?state.status, "auto-fix state advanced");
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(dir: &std::path::Path) -> AutoFixTracker {
        AutoFixTracker::new(Arc::new(GitHubStore::open(dir, 3).unwrap()))
    }

    #[test]
    fn walks_the_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path());

        for status in [
            AutoFixStatus::Analyzing,
            AutoFixStatus::CreatingSpec,
            AutoFixStatus::Building,
            AutoFixStatus::QaReview,
            AutoFixStatus::PrCreated,
            AutoFixStatus::Completed,
        ] {
            tracker.advance(9, status, |_| {}).unwrap();
        }
        assert_eq!(tracker.current(9).status, AutoFixStatus::Completed);
    }

    #[test]
    fn terminal_states_are_final() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path());
        tracker.advance(9, AutoFixStatus::Analyzing, |_| {}).unwrap();
        tracker.advance(9, AutoFixStatus::Failed, |_| {}).unwrap();
        assert!(tracker.advance(9, AutoFixStatus::Analyzing, |_| {}).is_err());
    }

    #[test]
    fn cannot_jump_from_pending_to_building() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path());
        assert!(tracker.advance(9, AutoFixStatus::Building, |_| {}).is_err());
    }

    #[test]
    fn merge_conflict_can_resume_building() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path());
        for status in [
            AutoFixStatus::Analyzing,
            AutoFixStatus::CreatingSpec,
            AutoFixStatus::Building,
            AutoFixStatus::MergeConflict,
            AutoFixStatus::Building,
        ] {
            tracker.advance(9, status, |_| {}).unwrap();
        }
        assert_eq!(tracker.current(9).status, AutoFixStatus::Building);
    }

    #[test]
    fn state_persists_across_tracker_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let tracker = tracker(dir.path());
            tracker
                .advance(9, AutoFixStatus::Analyzing, |state| {
                    state.spec_dir = Some("specs/issue-9".into());
                })
                .unwrap();
        }
        let tracker = tracker(dir.path());
        let state = tracker.current(9);
        assert_eq!(state.status, AutoFixStatus::Analyzing);
        assert_eq!(state.spec_dir.as_deref(), Some("specs/issue-9"));
    }
}
