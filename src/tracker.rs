//! The sync tracker runs one synchronization job at a time and exposes its evolving state.
//!
//! States: `idle -> checking -> (first_sync_prompt | syncing) -> (success | error)`, and back to
//! `idle` through `reset()`. A first-ever sync for a scope is gated behind `first_sync_prompt`
//! where the user picks the historical window, or skips syncing altogether.
//!
//! Every run has a `RunId`. Events are applied through `apply`, which drops anything that does
//! not carry the id of the active run. `reset()` and every new start drop the subscription of the
//! previous run, so late events of an abandoned run can never change what is displayed.

use crate::api::{SyncApi, SyncStream};
use crate::config::{DEFAULT_SYNC_DAYS, MAX_SYNC_DAYS, RESULT_TIMEOUT_SECS};
use crate::model::{
    RunId, SyncEvent, SyncOutcome, SyncPhase, SyncProgress, SyncRunResult, SyncScope,
};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Tunables of a `SyncTracker`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TrackerSettings {
    /// The window offered in the first-sync prompt.
    pub default_days: u32,
    pub max_days: u32,
    /// How long to wait for the result once the run reported `complete`.
    pub result_timeout: Duration,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            default_days: DEFAULT_SYNC_DAYS,
            max_days: MAX_SYNC_DAYS,
            result_timeout: Duration::from_secs(RESULT_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerState {
    #[default]
    Idle,
    Checking,
    FirstSyncPrompt,
    Syncing,
    Success,
    Error,
}

serde_plain::derive_display_from_serialize!(TrackerState);

impl TrackerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TrackerState::Success | TrackerState::Error)
    }
}

/// What `apply` did with an event.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EventDisposition {
    Applied,
    /// The event belongs to a run that was reset or superseded.
    Stale,
    /// The event would move displayed progress backwards.
    OutOfOrder,
    /// The run is no longer syncing, e.g. a second terminal event.
    Ignored,
}

/// Everything the presentation layer needs to render the tracker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackerSnapshot {
    pub state: TrackerState,
    pub run: Option<RunId>,
    pub scope: SyncScope,
    pub first_sync_days: u32,
    pub progress: Option<SyncProgress>,
    pub outcome: Option<SyncOutcome>,
    pub error: Option<String>,
}

impl TrackerSnapshot {
    fn initial(first_sync_days: u32) -> Self {
        Self {
            state: TrackerState::Idle,
            run: None,
            scope: SyncScope::default(),
            first_sync_days,
            progress: None,
            outcome: None,
            error: None,
        }
    }
}

/// The subscription of the active run.
struct ActiveRun {
    id: RunId,
    events: SyncStream,
    complete: bool,
    /// When the result has to be in, set once `complete` is first seen.
    result_deadline: Option<Instant>,
    result: Option<SyncRunResult>,
}

/// Runs exactly one synchronization job at a time. See the module documentation.
pub struct SyncTracker {
    api: Box<dyn SyncApi>,
    settings: TrackerSettings,
    view: TrackerSnapshot,
    run: Option<ActiveRun>,
    watch: watch::Sender<TrackerSnapshot>,
}

impl SyncTracker {
    pub fn new(api: Box<dyn SyncApi>, settings: TrackerSettings) -> Self {
        let view = TrackerSnapshot::initial(settings.default_days);
        let (watch, _) = watch::channel(view.clone());
        Self {
            api,
            settings,
            view,
            run: None,
            watch,
        }
    }

    pub fn state(&self) -> TrackerState {
        self.view.state
    }

    pub fn progress(&self) -> Option<&SyncProgress> {
        self.view.progress.as_ref()
    }

    pub fn outcome(&self) -> Option<&SyncOutcome> {
        self.view.outcome.as_ref()
    }

    /// The result of the last completed run, if it completed.
    pub fn result(&self) -> Option<&SyncRunResult> {
        self.view.outcome.as_ref().and_then(|o| o.result())
    }

    pub fn error(&self) -> Option<&str> {
        self.view.error.as_deref()
    }

    pub fn first_sync_days(&self) -> u32 {
        self.view.first_sync_days
    }

    pub fn run_id(&self) -> Option<RunId> {
        self.view.run
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    pub fn snapshot(&self) -> &TrackerSnapshot {
        &self.view
    }

    /// A receiver that sees every change of the snapshot, including progress while `run` is
    /// awaiting.
    pub fn subscribe(&self) -> watch::Receiver<TrackerSnapshot> {
        self.watch.subscribe()
    }

    /// Checks whether `scope` has ever been synced. If not, waits in `first_sync_prompt` for the
    /// user to pick a window; otherwise starts a run right away.
    ///
    /// # Errors
    /// Returns a `Collaborator` error if the check or the start fails. The message is also recorded
    /// in `error()` and the tracker is left in `error`.
    pub async fn check_and_sync(&mut self, scope: SyncScope) -> Result<()> {
        self.abandon_run();
        self.view.scope = scope;
        self.set_state(TrackerState::Checking);
        match self.api.check_first_sync(&self.view.scope).await {
            Ok(true) => {
                debug!("First sync for {:?}, asking for a window", self.view.scope);
                self.set_state(TrackerState::FirstSyncPrompt);
                Ok(())
            }
            Ok(false) => self.start(None).await,
            Err(e) => Err(self.fail(e.to_string())),
        }
    }

    /// Changes the window offered in the first-sync prompt.
    ///
    /// # Errors
    /// Returns a `Validation` error, leaving the selection unchanged, unless
    /// `1 <= days <= max_days`.
    pub fn set_first_sync_days(&mut self, days: u32) -> Result<()> {
        validate_days(days, self.settings.max_days)?;
        self.view.first_sync_days = days;
        self.publish();
        Ok(())
    }

    /// Commits the chosen window and starts the run.
    pub async fn confirm_first_sync(&mut self) -> Result<()> {
        if self.view.state != TrackerState::FirstSyncPrompt {
            return Err(Error::internal(format!(
                "There is no first sync waiting for confirmation (state is {})",
                self.view.state
            )));
        }
        let days = self.view.first_sync_days;
        self.start(Some(days)).await
    }

    /// Abandons the first sync and reports success without syncing.
    pub fn skip(&mut self) -> Result<()> {
        if self.view.state != TrackerState::FirstSyncPrompt {
            return Err(Error::internal(format!(
                "Only a first sync can be skipped (state is {})",
                self.view.state
            )));
        }
        debug!("First sync skipped");
        self.view.outcome = Some(SyncOutcome::Skipped);
        self.set_state(TrackerState::Success);
        Ok(())
    }

    /// Starts a run right away, without the first-sync check. Used when the window was already
    /// chosen elsewhere.
    pub async fn sync(&mut self, scope: SyncScope, days: Option<u32>) -> Result<()> {
        if let Some(days) = days {
            validate_days(days, self.settings.max_days)?;
        }
        self.abandon_run();
        self.view.scope = scope;
        self.start(days).await
    }

    /// Returns to `idle` and forgets the active run. The server-side job may keep running; its
    /// events are ignored from now on.
    pub fn reset(&mut self) {
        if let Some(run) = self.run.take() {
            debug!("Abandoning run {}", run.id);
        }
        self.view = TrackerSnapshot::initial(self.settings.default_days);
        self.publish();
    }

    /// Waits for the next event of the active run and applies it. Returns `false` when there is no
    /// run to wait for.
    pub async fn next_event(&mut self) -> bool {
        if self.view.state != TrackerState::Syncing {
            return false;
        }
        let Some(run) = self.run.as_mut() else {
            return false;
        };
        let id = run.id;
        let received = if let Some(deadline) = run.result_deadline {
            match tokio::time::timeout_at(deadline, run.events.recv()).await {
                Ok(received) => received,
                Err(_) => {
                    warn!("Run {id} completed but its result did not arrive in time");
                    self.succeed(SyncRunResult::unknown_totals());
                    return true;
                }
            }
        } else {
            run.events.recv().await
        };
        match received {
            Some(event) => {
                self.apply(id, event);
            }
            None => self.stream_closed(),
        }
        true
    }

    /// Applies events until the run reaches `success` or `error`. Returns immediately when no run
    /// is active.
    pub async fn run(&mut self) -> TrackerState {
        while self.next_event().await {}
        self.view.state
    }

    /// Applies one event of run `id`.
    pub fn apply(&mut self, id: RunId, event: SyncEvent) -> EventDisposition {
        let Some(run) = self.run.as_mut().filter(|r| r.id == id) else {
            trace!("Discarding event of stale run {id}");
            return EventDisposition::Stale;
        };
        if self.view.state != TrackerState::Syncing {
            return EventDisposition::Ignored;
        }
        match event {
            SyncEvent::Progress(progress) => {
                let Some(merged) = merge_progress(self.view.progress.as_ref(), progress) else {
                    trace!("Discarding out-of-order progress of run {id}");
                    return EventDisposition::OutOfOrder;
                };
                if merged.phase == SyncPhase::Complete && !run.complete {
                    run.complete = true;
                    run.result_deadline = Some(Instant::now() + self.settings.result_timeout);
                }
                trace!(
                    "Run {id}: {} {}/{:?} {}",
                    merged.phase,
                    merged.transactions_current,
                    merged.transactions_total,
                    merged.message
                );
                self.view.progress = Some(merged);
                let finished = run.complete.then(|| run.result.take()).flatten();
                match finished {
                    Some(result) => self.succeed(result),
                    None => self.publish(),
                }
            }
            SyncEvent::Finished(result) => {
                if run.complete {
                    self.succeed(result);
                } else {
                    debug!("Run {id} sent its result before completing, holding it");
                    run.result = Some(result);
                }
            }
            SyncEvent::Failed(message) => {
                self.fail(message);
            }
        }
        EventDisposition::Applied
    }

    async fn start(&mut self, days: Option<u32>) -> Result<()> {
        debug!("Starting sync of {:?} with days {:?}", self.view.scope, days);
        self.view.progress = Some(SyncProgress::starting());
        match self.api.start_sync(&self.view.scope, days).await {
            Ok(events) => {
                let id = RunId::new();
                self.run = Some(ActiveRun {
                    id,
                    events,
                    complete: false,
                    result_deadline: None,
                    result: None,
                });
                self.view.run = Some(id);
                self.set_state(TrackerState::Syncing);
                Ok(())
            }
            Err(e) => Err(self.fail(e.to_string())),
        }
    }

    /// The collaborator closed the stream.
    fn stream_closed(&mut self) {
        let Some(run) = self.run.take() else {
            return;
        };
        match (run.complete, run.result) {
            (_, Some(result)) => self.succeed(result),
            (true, None) => {
                warn!("Run {} completed but its result never arrived", run.id);
                self.succeed(SyncRunResult::unknown_totals());
            }
            (false, None) => {
                self.fail("sync stream ended unexpectedly".to_string());
            }
        }
    }

    /// Forgets the previous run and its terminal output.
    fn abandon_run(&mut self) {
        if let Some(run) = self.run.take() {
            debug!("Run {} superseded", run.id);
        }
        self.view.run = None;
        self.view.progress = None;
        self.view.outcome = None;
        self.view.error = None;
    }

    fn succeed(&mut self, result: SyncRunResult) {
        self.run = None;
        if let Some(progress) = self.view.progress.as_mut() {
            progress.phase = SyncPhase::Complete;
        }
        debug!(
            "Sync finished: {} imported, {} skipped, {} failed",
            result.total_imported, result.total_skipped, result.total_failed
        );
        self.view.outcome = Some(SyncOutcome::Completed(result));
        self.set_state(TrackerState::Success);
    }

    /// Records `message` as the error, leaves the tracker in `error` and returns the public error.
    fn fail(&mut self, message: String) -> Error {
        warn!("Sync failed: {message}");
        self.run = None;
        self.view.error = Some(message.clone());
        self.set_state(TrackerState::Error);
        Error::collaborator(message)
    }

    fn set_state(&mut self, state: TrackerState) {
        if self.view.state != state {
            debug!("Tracker {} -> {}", self.view.state, state);
        }
        self.view.state = state;
        self.publish();
    }

    fn publish(&self) {
        self.watch.send_replace(self.view.clone());
    }
}

pub(crate) fn validate_days(days: u32, max: u32) -> Result<()> {
    if days == 0 || days > max {
        return Err(Error::validation(format!(
            "Choose between 1 and {max} days of history"
        )));
    }
    Ok(())
}

/// Merges `next` into the displayed progress. Returns `None` if `next` would move progress
/// backwards: phases only advance and within a phase the account index only grows. While the
/// account stays the same its transaction counter only grows and a known total is kept. Moving to
/// another account starts its counter and total afresh. The current count never exceeds the total.
fn merge_progress(current: Option<&SyncProgress>, mut next: SyncProgress) -> Option<SyncProgress> {
    if let Some(current) = current {
        if next.phase < current.phase
            || (next.phase == current.phase && next.account_index < current.account_index)
        {
            return None;
        }
        if next.account_index == current.account_index {
            if next.transactions_current < current.transactions_current {
                return None;
            }
            if current.transactions_total.is_some() {
                next.transactions_total = current.transactions_total;
            }
        }
    }
    if let Some(total) = next.transactions_total {
        next.transactions_current = next.transactions_current.min(total);
    }
    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StepStatus;
    use crate::test::{progress, progress_snapshot, ScriptedRun, ScriptedSync};

    fn tracker(sync: ScriptedSync) -> SyncTracker {
        SyncTracker::new(Box::new(sync), TrackerSettings::default())
    }

    fn finished(total_imported: u64) -> SyncEvent {
        SyncEvent::Finished(SyncRunResult {
            total_imported,
            accounts_synced: 1,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_first_sync_prompt_then_confirm() {
        let (sync, handle) = ScriptedSync::new();
        handle.push_check(Ok(true));
        handle.push_run(ScriptedRun::closed(vec![
            progress(SyncPhase::Connecting, 0, None),
            progress(SyncPhase::Fetching, 0, Some(50)),
            progress(SyncPhase::Classifying, 25, Some(50)),
            progress(SyncPhase::Complete, 50, Some(50)),
            finished(50),
        ]));
        let mut tracker = tracker(sync);

        tracker.check_and_sync(SyncScope::All).await.unwrap();
        assert_eq!(tracker.state(), TrackerState::FirstSyncPrompt);
        assert_eq!(tracker.first_sync_days(), 90);

        tracker.set_first_sync_days(365).unwrap();
        tracker.confirm_first_sync().await.unwrap();
        assert_eq!(tracker.state(), TrackerState::Syncing);
        assert_eq!(handle.starts(), vec![(SyncScope::All, Some(365))]);

        assert_eq!(tracker.run().await, TrackerState::Success);
        assert_eq!(tracker.result().unwrap().total_imported, 50);
        assert!(tracker.error().is_none());
    }

    #[tokio::test]
    async fn test_not_first_sync_starts_immediately() {
        let (sync, handle) = ScriptedSync::new();
        handle.push_check(Ok(false));
        handle.push_run(ScriptedRun::closed(vec![
            progress(SyncPhase::Complete, 0, Some(0)),
            finished(0),
        ]));
        let mut tracker = tracker(sync);

        let scope = SyncScope::Accounts(vec!["DE1".to_string()]);
        tracker.check_and_sync(scope.clone()).await.unwrap();
        assert_eq!(tracker.state(), TrackerState::Syncing);
        assert_eq!(handle.starts(), vec![(scope, None)]);
        assert_eq!(handle.check_count(), 1);
        assert_eq!(tracker.run().await, TrackerState::Success);
        // A run that imported nothing is not the same as a skipped sync.
        assert_eq!(
            tracker.outcome(),
            Some(&SyncOutcome::Completed(SyncRunResult {
                accounts_synced: 1,
                ..Default::default()
            }))
        );
    }

    #[tokio::test]
    async fn test_check_failure_is_surfaced_verbatim() {
        let (sync, handle) = ScriptedSync::new();
        handle.push_check(Err("backend unavailable"));
        let mut tracker = tracker(sync);

        let err = tracker.check_and_sync(SyncScope::All).await.unwrap_err();
        assert!(err.is_collaborator());
        assert_eq!(tracker.state(), TrackerState::Error);
        assert_eq!(tracker.error(), Some("backend unavailable"));
        assert!(handle.starts().is_empty());
    }

    #[tokio::test]
    async fn test_start_failure_is_surfaced_verbatim() {
        let (sync, handle) = ScriptedSync::new();
        handle.push_check(Ok(false));
        handle.fail_next_start("job queue full");
        let mut tracker = tracker(sync);

        let err = tracker.check_and_sync(SyncScope::All).await.unwrap_err();
        assert_eq!(err.message(), "job queue full");
        assert_eq!(tracker.state(), TrackerState::Error);
        assert_eq!(tracker.error(), Some("job queue full"));
    }

    #[tokio::test]
    async fn test_skip_reports_success_without_sync() {
        let (sync, handle) = ScriptedSync::new();
        handle.push_check(Ok(true));
        let mut tracker = tracker(sync);

        tracker.check_and_sync(SyncScope::All).await.unwrap();
        tracker.skip().unwrap();
        assert_eq!(tracker.state(), TrackerState::Success);
        assert_eq!(tracker.outcome(), Some(&SyncOutcome::Skipped));
        assert!(tracker.result().is_none());
        assert!(handle.starts().is_empty());
    }

    #[tokio::test]
    async fn test_skip_and_confirm_require_prompt() {
        let (sync, _handle) = ScriptedSync::new();
        let mut tracker = tracker(sync);
        assert!(tracker.skip().is_err());
        assert!(tracker.confirm_first_sync().await.is_err());
        assert_eq!(tracker.state(), TrackerState::Idle);
    }

    #[tokio::test]
    async fn test_days_validation() {
        let (sync, _handle) = ScriptedSync::new();
        let mut tracker = tracker(sync);
        assert!(tracker.set_first_sync_days(0).unwrap_err().is_validation());
        assert!(tracker.set_first_sync_days(731).unwrap_err().is_validation());
        assert_eq!(tracker.first_sync_days(), 90);
        tracker.set_first_sync_days(730).unwrap();
        assert_eq!(tracker.first_sync_days(), 730);
        let err = tracker.sync(SyncScope::All, Some(0)).await.unwrap_err();
        assert!(err.is_validation());
        assert_eq!(tracker.state(), TrackerState::Idle);
    }

    #[tokio::test]
    async fn test_progress_never_regresses() {
        let (sync, handle) = ScriptedSync::new();
        handle.push_run(ScriptedRun::open(Vec::new()));
        let mut tracker = tracker(sync);
        tracker.sync(SyncScope::All, Some(30)).await.unwrap();
        let id = tracker.run_id().unwrap();

        let events = vec![
            (progress(SyncPhase::Fetching, 0, Some(10)), EventDisposition::Applied),
            (progress(SyncPhase::Classifying, 4, Some(10)), EventDisposition::Applied),
            (progress(SyncPhase::Classifying, 2, Some(10)), EventDisposition::OutOfOrder),
            (progress(SyncPhase::Fetching, 4, Some(10)), EventDisposition::OutOfOrder),
            (progress(SyncPhase::Classifying, 4, Some(10)), EventDisposition::Applied),
            (progress(SyncPhase::Classifying, 7, Some(12)), EventDisposition::Applied),
            (progress(SyncPhase::Classifying, 15, None), EventDisposition::Applied),
        ];
        let mut last_current = 0;
        for (event, expected) in events {
            assert_eq!(tracker.apply(id, event), expected);
            let p = tracker.progress().unwrap();
            assert!(p.transactions_current >= last_current);
            assert!(p.transactions_current <= p.transactions_total.unwrap());
            last_current = p.transactions_current;
        }
        let p = tracker.progress().unwrap();
        assert_eq!(p.transactions_total, Some(10));
        assert_eq!(p.transactions_current, 10);
        assert_eq!(tracker.state(), TrackerState::Syncing);
    }

    #[tokio::test]
    async fn test_account_index_never_regresses_within_phase() {
        let (sync, handle) = ScriptedSync::new();
        handle.push_run(ScriptedRun::open(Vec::new()));
        let mut tracker = tracker(sync);
        tracker.sync(SyncScope::All, None).await.unwrap();
        let id = tracker.run_id().unwrap();

        let second = progress_snapshot(SyncPhase::Fetching, 1, 0, None);
        let first = progress(SyncPhase::Fetching, 0, None);
        assert_eq!(
            tracker.apply(id, SyncEvent::Progress(second)),
            EventDisposition::Applied
        );
        assert_eq!(tracker.apply(id, first), EventDisposition::OutOfOrder);
        assert_eq!(tracker.progress().unwrap().account_index, 1);
    }

    #[tokio::test]
    async fn test_total_is_kept_per_account() {
        let (sync, handle) = ScriptedSync::new();
        handle.push_run(ScriptedRun::open(Vec::new()));
        let mut tracker = tracker(sync);
        tracker.sync(SyncScope::All, None).await.unwrap();
        let id = tracker.run_id().unwrap();

        let events = vec![
            (progress_snapshot(SyncPhase::Fetching, 0, 0, Some(0)), EventDisposition::Applied),
            (progress_snapshot(SyncPhase::Fetching, 1, 0, Some(4)), EventDisposition::Applied),
            (progress_snapshot(SyncPhase::Classifying, 1, 2, Some(9)), EventDisposition::Applied),
            (
                progress_snapshot(SyncPhase::Classifying, 1, 1, Some(4)),
                EventDisposition::OutOfOrder,
            ),
        ];
        for (event, expected) in events {
            assert_eq!(tracker.apply(id, SyncEvent::Progress(event)), expected);
        }

        let p = tracker.progress().unwrap();
        assert_eq!(p.account_index, 1);
        assert_eq!(p.transactions_total, Some(4));
        assert_eq!(p.transactions_current, 2);
        assert_eq!(p.classify_step(), StepStatus::Active);
    }

    #[tokio::test]
    async fn test_counters_restart_with_each_account() {
        let (sync, handle) = ScriptedSync::new();
        handle.push_run(ScriptedRun::open(Vec::new()));
        let mut tracker = tracker(sync);
        tracker.sync(SyncScope::All, None).await.unwrap();
        let id = tracker.run_id().unwrap();

        let first = progress_snapshot(SyncPhase::Classifying, 0, 3, Some(3));
        let second = progress_snapshot(SyncPhase::Classifying, 1, 1, Some(5));
        assert_eq!(
            tracker.apply(id, SyncEvent::Progress(first)),
            EventDisposition::Applied
        );
        assert_eq!(
            tracker.apply(id, SyncEvent::Progress(second)),
            EventDisposition::Applied
        );
        let p = tracker.progress().unwrap();
        assert_eq!(p.transactions_current, 1);
        assert_eq!(p.transactions_total, Some(5));
    }

    #[tokio::test]
    async fn test_zero_transactions_skip_classification() {
        let (sync, handle) = ScriptedSync::new();
        handle.push_run(ScriptedRun::open(vec![progress(SyncPhase::Fetching, 0, Some(0))]));
        let mut tracker = tracker(sync);
        tracker.sync(SyncScope::All, None).await.unwrap();
        assert!(tracker.next_event().await);

        let p = tracker.progress().unwrap();
        assert_eq!(p.phase, SyncPhase::Fetching);
        assert_eq!(p.classify_step(), StepStatus::Complete);
        assert_eq!(tracker.state(), TrackerState::Syncing);
    }

    #[tokio::test]
    async fn test_waits_for_both_complete_and_result() {
        let (sync, handle) = ScriptedSync::new();
        handle.push_run(ScriptedRun::open(Vec::new()));
        let mut tracker = tracker(sync);
        tracker.sync(SyncScope::All, None).await.unwrap();
        let id = tracker.run_id().unwrap();

        // Result first: held until `complete` arrives.
        assert_eq!(tracker.apply(id, finished(3)), EventDisposition::Applied);
        assert_eq!(tracker.state(), TrackerState::Syncing);
        let complete = progress(SyncPhase::Complete, 3, Some(3));
        assert_eq!(tracker.apply(id, complete), EventDisposition::Applied);
        assert_eq!(tracker.state(), TrackerState::Success);
        assert_eq!(tracker.result().unwrap().total_imported, 3);

        // A second terminal event changes nothing, it belongs to a finished run.
        assert_eq!(tracker.apply(id, finished(9)), EventDisposition::Stale);
        assert_eq!(tracker.result().unwrap().total_imported, 3);
    }

    #[tokio::test]
    async fn test_complete_without_result_times_out() {
        let (sync, handle) = ScriptedSync::new();
        handle.push_run(ScriptedRun::open(vec![progress(SyncPhase::Complete, 2, Some(2))]));
        let settings = TrackerSettings {
            result_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let mut tracker = SyncTracker::new(Box::new(sync), settings);
        tracker.sync(SyncScope::All, None).await.unwrap();

        assert_eq!(tracker.run().await, TrackerState::Success);
        assert!(tracker.result().unwrap().totals_unknown);
    }

    #[tokio::test]
    async fn test_repeated_complete_does_not_extend_the_wait() {
        let (sync, handle) = ScriptedSync::new();
        handle.push_run(ScriptedRun::open(Vec::new()));
        let settings = TrackerSettings {
            result_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let mut tracker = SyncTracker::new(Box::new(sync), settings);
        tracker.sync(SyncScope::All, None).await.unwrap();

        let tx = handle.sender(0);
        let repeater = tokio::spawn(async move {
            loop {
                let complete = progress(SyncPhase::Complete, 2, Some(2));
                if tx.send(complete).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let state = tokio::time::timeout(Duration::from_secs(5), tracker.run())
            .await
            .unwrap();
        assert_eq!(state, TrackerState::Success);
        assert!(tracker.result().unwrap().totals_unknown);
        repeater.abort();
    }

    #[tokio::test]
    async fn test_complete_then_closed_stream_is_unknown_totals() {
        let (sync, handle) = ScriptedSync::new();
        handle.push_run(ScriptedRun::closed(vec![progress(SyncPhase::Complete, 2, Some(2))]));
        let mut tracker = tracker(sync);
        tracker.sync(SyncScope::All, None).await.unwrap();

        assert_eq!(tracker.run().await, TrackerState::Success);
        assert!(tracker.result().unwrap().totals_unknown);
    }

    #[tokio::test]
    async fn test_result_then_closed_stream_succeeds() {
        let (sync, handle) = ScriptedSync::new();
        handle.push_run(ScriptedRun::closed(vec![finished(4)]));
        let mut tracker = tracker(sync);
        tracker.sync(SyncScope::All, None).await.unwrap();

        assert_eq!(tracker.run().await, TrackerState::Success);
        assert_eq!(tracker.result().unwrap().total_imported, 4);
        assert!(!tracker.result().unwrap().totals_unknown);
    }

    #[tokio::test]
    async fn test_stream_ending_early_is_an_error() {
        let (sync, handle) = ScriptedSync::new();
        handle.push_run(ScriptedRun::closed(vec![progress(SyncPhase::Fetching, 0, None)]));
        let mut tracker = tracker(sync);
        tracker.sync(SyncScope::All, None).await.unwrap();

        assert_eq!(tracker.run().await, TrackerState::Error);
        assert_eq!(tracker.error(), Some("sync stream ended unexpectedly"));
    }

    #[tokio::test]
    async fn test_failed_event_is_surfaced_verbatim() {
        let (sync, handle) = ScriptedSync::new();
        handle.push_run(ScriptedRun::closed(vec![
            progress(SyncPhase::Connecting, 0, None),
            SyncEvent::Failed("TAN approval timed out at the bank".to_string()),
        ]));
        let mut tracker = tracker(sync);
        tracker.sync(SyncScope::All, None).await.unwrap();

        assert_eq!(tracker.run().await, TrackerState::Error);
        assert_eq!(tracker.error(), Some("TAN approval timed out at the bank"));
        assert!(tracker.outcome().is_none());
    }

    #[tokio::test]
    async fn test_reset_discards_late_events() {
        let (sync, handle) = ScriptedSync::new();
        handle.push_check(Ok(true));
        handle.push_run(ScriptedRun::open(Vec::new()));
        let mut tracker = tracker(sync);
        tracker.check_and_sync(SyncScope::All).await.unwrap();
        tracker.set_first_sync_days(200).unwrap();
        tracker.confirm_first_sync().await.unwrap();
        let old = tracker.run_id().unwrap();

        tracker.reset();
        assert_eq!(tracker.apply(old, finished(1)), EventDisposition::Stale);
        assert_eq!(tracker.snapshot(), &TrackerSnapshot::initial(90));
        assert!(!tracker.next_event().await);
        // The job is still "running" at the collaborator; only our interest is gone.
        assert!(handle.sender(0).is_closed());
    }

    #[tokio::test]
    async fn test_new_run_supersedes_old_one() {
        let (sync, handle) = ScriptedSync::new();
        handle.push_run(ScriptedRun::open(Vec::new()));
        handle.push_run(ScriptedRun::open(Vec::new()));
        let mut tracker = tracker(sync);
        tracker.sync(SyncScope::All, None).await.unwrap();
        let first = tracker.run_id().unwrap();
        tracker.apply(first, SyncEvent::Failed("boom".to_string()));
        assert_eq!(tracker.state(), TrackerState::Error);

        tracker.sync(SyncScope::All, None).await.unwrap();
        let second = tracker.run_id().unwrap();
        assert_ne!(first, second);
        assert!(tracker.error().is_none());
        assert_eq!(
            tracker.apply(first, progress(SyncPhase::Complete, 0, None)),
            EventDisposition::Stale
        );
        assert_eq!(
            tracker.apply(second, progress(SyncPhase::Fetching, 0, None)),
            EventDisposition::Applied
        );
    }

    #[tokio::test]
    async fn test_subscribers_see_progress() {
        let (sync, handle) = ScriptedSync::new();
        handle.push_run(ScriptedRun::open(vec![progress(SyncPhase::Classifying, 1, Some(5))]));
        let mut tracker = tracker(sync);
        let rx = tracker.subscribe();
        tracker.sync(SyncScope::All, None).await.unwrap();
        assert!(tracker.next_event().await);

        let seen = rx.borrow().clone();
        assert_eq!(seen.state, TrackerState::Syncing);
        assert_eq!(seen.progress.unwrap().transactions_current, 1);
    }

    #[test]
    fn test_merge_clamps_to_total() {
        let next = progress_snapshot(SyncPhase::Classifying, 0, 9, Some(5));
        let merged = merge_progress(None, next).unwrap();
        assert_eq!(merged.transactions_current, 5);
    }
}
