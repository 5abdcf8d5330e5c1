//! Inventory synchronization tracker.
//!
//! Sole writer of [`SyncOperation`] state. One run at a time:
//!
//! ```text
//! idle → pending → running → completed | failed → idle (on acknowledge / next trigger)
//! ```
//!
//! The data movement itself belongs to the [`SyncSource`]; the tracker only folds its
//! progress updates into the current operation and publishes snapshots to subscribers.

use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::CatalogError;
use crate::inventory::{SyncSource, SyncUpdate};
use crate::models::{
    LogLevel, SyncLogEntry, SyncOperation, SyncProgress, SyncStatus, SyncStatusSummary,
    SyncTrigger,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerState {
    Idle,
    Pending,
    Running,
    Completed,
    Failed,
}

impl From<SyncStatus> for TrackerState {
    fn from(status: SyncStatus) -> Self {
        match status {
            SyncStatus::Pending => TrackerState::Pending,
            SyncStatus::Running => TrackerState::Running,
            SyncStatus::Completed => TrackerState::Completed,
            SyncStatus::Failed => TrackerState::Failed,
        }
    }
}

struct TrackerInner {
    current: Option<SyncOperation>,
    // Whether the source has announced the run's total yet
    total_announced: bool,
    // Terminal operations, oldest first
    history: VecDeque<SyncOperation>,
    schedule_interval: Option<Duration>,
}

pub struct SyncTracker {
    source: Arc<dyn SyncSource>,
    inner: Mutex<TrackerInner>,
    updates: watch::Sender<Option<SyncOperation>>,
    history_limit: usize,
}

fn log_entry(level: LogLevel, message: impl Into<String>) -> SyncLogEntry {
    SyncLogEntry {
        timestamp: Utc::now(),
        level,
        message: message.into(),
    }
}

impl SyncTracker {
    pub fn new(source: Arc<dyn SyncSource>, history_limit: usize) -> Self {
        let (updates, _) = watch::channel(None);
        Self {
            source,
            inner: Mutex::new(TrackerInner {
                current: None,
                total_announced: false,
                history: VecDeque::new(),
                schedule_interval: None,
            }),
            updates,
            history_limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, current: Option<SyncOperation>) {
        self.updates.send_replace(current);
    }

    fn archive(&self, inner: &mut TrackerInner, operation: SyncOperation) {
        inner.history.push_back(operation);
        while inner.history.len() > self.history_limit {
            inner.history.pop_front();
        }
    }

    /// Starts a new run.
    ///
    /// Fails fast with `SyncAlreadyInProgress` while a run is pending or running. A finished
    /// run that was not acknowledged yet is acknowledged implicitly. The returned snapshot is
    /// already `running`.
    pub fn trigger_sync(self: &Arc<Self>, trigger: SyncTrigger) -> Result<SyncOperation, CatalogError> {
        let operation = {
            let mut inner = self.lock();

            if let Some(current) = inner.current.as_ref() {
                if current.status.is_active() {
                    debug!(operation_id = %current.id, "Sync trigger rejected, run in progress");
                    return Err(CatalogError::SyncAlreadyInProgress(current.id.clone()));
                }
            }
            if let Some(finished) = inner.current.take() {
                self.archive(&mut inner, finished);
            }

            let mut operation = SyncOperation {
                id: uuid::Uuid::new_v4().to_string(),
                trigger,
                status: SyncStatus::Pending,
                started_at: Utc::now(),
                completed_at: None,
                progress: SyncProgress::default(),
                log_entries: vec![log_entry(
                    LogLevel::Info,
                    format!("{:?} sync requested", trigger).to_lowercase(),
                )],
                failure: None,
            };
            self.publish(Some(operation.clone()));

            operation.status = SyncStatus::Running;
            operation
                .log_entries
                .push(log_entry(LogLevel::Info, "sync started"));
            inner.current = Some(operation.clone());
            inner.total_announced = false;
            self.publish(Some(operation.clone()));
            operation
        };

        info!(operation_id = %operation.id, trigger = ?trigger, "Inventory sync started");
        let stream = self.source.run_sync(&operation.id);
        tokio::spawn(Arc::clone(self).drive(operation.id.clone(), stream));

        Ok(operation)
    }

    async fn drive(self: Arc<Self>, operation_id: String, mut stream: BoxStream<'static, SyncUpdate>) {
        while let Some(update) = stream.next().await {
            if self.apply(&operation_id, update) {
                return;
            }
        }
        // Source hung up without a verdict
        self.apply(
            &operation_id,
            SyncUpdate::Failed("sync source ended before reporting an outcome".to_string()),
        );
    }

    // Folds one update into the current operation. Returns true once the run is terminal.
    fn apply(&self, operation_id: &str, update: SyncUpdate) -> bool {
        let mut inner = self.lock();
        let total_announced = inner.total_announced;
        let Some(operation) = inner.current.as_mut().filter(|op| op.id == operation_id) else {
            return true;
        };
        if operation.status.is_terminal() {
            return true;
        }

        let mut announce_total = false;
        match update {
            SyncUpdate::Total(total) => {
                let accounted = operation.progress.accounted();
                if total < accounted {
                    warn!(operation_id, total, accounted, "Announced total below items already reported");
                }
                operation.progress.total = total.max(accounted);
                announce_total = true;
            }
            SyncUpdate::Processed(count) => {
                let applied = Self::room_for(operation, total_announced, count);
                operation.progress.processed += applied;
            }
            SyncUpdate::ItemFailed { item, reason } => {
                if Self::room_for(operation, total_announced, 1) == 1 {
                    operation.progress.failed += 1;
                    operation
                        .log_entries
                        .push(log_entry(LogLevel::Warn, format!("{}: {}", item, reason)));
                }
            }
            SyncUpdate::Log { level, message } => {
                operation.log_entries.push(log_entry(level, message));
            }
            SyncUpdate::Completed => {
                operation.status = SyncStatus::Completed;
                operation.completed_at = Some(Utc::now());
                let progress = operation.progress;
                operation.log_entries.push(log_entry(
                    LogLevel::Info,
                    format!(
                        "sync completed: {} processed, {} failed of {}",
                        progress.processed, progress.failed, progress.total
                    ),
                ));
                info!(operation_id, processed = progress.processed, failed = progress.failed, "Inventory sync completed");
            }
            SyncUpdate::Failed(reason) => {
                operation.status = SyncStatus::Failed;
                operation.completed_at = Some(Utc::now());
                operation
                    .log_entries
                    .push(log_entry(LogLevel::Error, format!("sync failed: {}", reason)));
                error!(operation_id, reason = %reason, "Inventory sync failed");
                operation.failure = Some(reason);
            }
        }

        let terminal = operation.status.is_terminal();
        let snapshot = operation.clone();
        if announce_total {
            inner.total_announced = true;
        }
        self.publish(Some(snapshot));
        terminal
    }

    // How many of `count` newly reported items fit. Before the total is announced the total
    // grows with the reports; afterwards processed + failed never exceed it.
    fn room_for(operation: &mut SyncOperation, total_announced: bool, count: u64) -> u64 {
        let progress = &mut operation.progress;
        if !total_announced {
            progress.total = progress.total.max(progress.accounted() + count);
            return count;
        }
        let room = progress.total.saturating_sub(progress.accounted());
        if count > room {
            warn!(operation_id = %operation.id, count, room, "Progress beyond announced total ignored");
            operation.log_entries.push(log_entry(
                LogLevel::Warn,
                format!("ignored {} items reported beyond the announced total", count - room),
            ));
        }
        count.min(room)
    }

    /// Latest snapshot of the most recent operation, or None if no sync ever ran.
    pub fn get_status(&self) -> Option<SyncOperation> {
        let inner = self.lock();
        inner
            .current
            .clone()
            .or_else(|| inner.history.back().cloned())
    }

    pub fn state(&self) -> TrackerState {
        self.lock()
            .current
            .as_ref()
            .map_or(TrackerState::Idle, |op| op.status.into())
    }

    /// Returns a finished run to `idle`. Returns the acknowledged operation, or None if the
    /// tracker is idle or a run is still active.
    pub fn acknowledge(&self) -> Option<SyncOperation> {
        let mut inner = self.lock();
        if !inner.current.as_ref().is_some_and(|op| op.status.is_terminal()) {
            return None;
        }
        let finished = inner.current.take()?;
        self.archive(&mut inner, finished.clone());
        self.publish(None);
        debug!(operation_id = %finished.id, "Sync outcome acknowledged");
        Some(finished)
    }

    /// Waits until the given run is terminal. A failed run is reported as `SyncFailed`; an
    /// id that is neither current nor in history is `NotFound`.
    pub async fn wait_for_outcome(&self, operation_id: &str) -> Result<SyncOperation, CatalogError> {
        let mut updates = self.subscribe();
        loop {
            let operation = self
                .find(operation_id)
                .ok_or_else(|| CatalogError::NotFound(format!("sync operation {}", operation_id)))?;
            match operation.status {
                SyncStatus::Completed => return Ok(operation),
                SyncStatus::Failed => {
                    return Err(CatalogError::SyncFailed {
                        id: operation.id,
                        reason: operation.failure.unwrap_or_default(),
                    });
                }
                SyncStatus::Pending | SyncStatus::Running => {}
            }
            if updates.changed().await.is_err() {
                return Err(CatalogError::NotFound(format!("sync operation {}", operation_id)));
            }
        }
    }

    fn find(&self, operation_id: &str) -> Option<SyncOperation> {
        let inner = self.lock();
        inner
            .current
            .iter()
            .chain(inner.history.iter().rev())
            .find(|op| op.id == operation_id)
            .cloned()
    }

    /// Terminal operations, oldest first.
    pub fn history(&self) -> Vec<SyncOperation> {
        self.lock().history.iter().cloned().collect()
    }

    /// Receives the current operation on every change; None means idle.
    pub fn subscribe(&self) -> watch::Receiver<Option<SyncOperation>> {
        self.updates.subscribe()
    }

    pub fn summary(&self) -> SyncStatusSummary {
        let inner = self.lock();
        let latest = inner.current.as_ref().or_else(|| inner.history.back());
        let last_finished = inner
            .current
            .as_ref()
            .filter(|op| op.status.is_terminal())
            .or_else(|| inner.history.back());
        let last_sync = last_finished.and_then(|op| op.completed_at);

        let progress = latest.map(|op| op.progress).unwrap_or_default();
        let errors = latest
            .map(|op| {
                op.log_entries
                    .iter()
                    .filter(|entry| entry.level != LogLevel::Info)
                    .map(|entry| entry.message.clone())
                    .collect()
            })
            .unwrap_or_default();
        let next_sync = inner.schedule_interval.and_then(|interval| {
            let base = last_sync.unwrap_or_else(Utc::now);
            chrono::Duration::from_std(interval).ok().map(|d| base + d)
        });

        SyncStatusSummary {
            last_sync,
            is_running: latest.is_some_and(|op| op.status.is_active()),
            total_items: progress.total,
            synced_items: progress.processed,
            failed_items: progress.failed,
            errors,
            next_sync,
        }
    }

    /// Triggers a scheduled run every `interval`, starting one interval from now.
    /// A tick that finds a run in progress is skipped.
    pub fn spawn_scheduler(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        self.lock().schedule_interval = Some(interval);
        let tracker = Arc::clone(self);
        info!(?interval, "Scheduled inventory sync enabled");

        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                ticker.tick().await;
                match tracker.trigger_sync(SyncTrigger::Scheduled) {
                    Ok(operation) => debug!(operation_id = %operation.id, "Scheduled sync triggered"),
                    Err(CatalogError::SyncAlreadyInProgress(id)) => {
                        info!(operation_id = %id, "Skipping scheduled sync, run still in progress")
                    }
                    Err(e) => warn!(error = %e, "Scheduled sync could not start"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;
    use futures::stream;

    // Hands out one channel per run so tests drive progress by hand
    #[derive(Default)]
    struct ChannelSync {
        senders: Mutex<Vec<mpsc::UnboundedSender<SyncUpdate>>>,
    }

    impl ChannelSync {
        fn send(&self, run: usize, update: SyncUpdate) {
            self.senders.lock().unwrap()[run].unbounded_send(update).unwrap();
        }

        fn hang_up(&self, run: usize) {
            self.senders.lock().unwrap()[run].close_channel();
        }
    }

    impl SyncSource for ChannelSync {
        fn run_sync(&self, _operation_id: &str) -> BoxStream<'static, SyncUpdate> {
            let (tx, rx) = mpsc::unbounded();
            self.senders.lock().unwrap().push(tx);
            rx.boxed()
        }
    }

    // Replays a fixed script for every run
    struct ScriptedSync(Vec<SyncUpdate>);

    impl SyncSource for ScriptedSync {
        fn run_sync(&self, _operation_id: &str) -> BoxStream<'static, SyncUpdate> {
            stream::iter(self.0.clone()).boxed()
        }
    }

    fn tracker_with(source: Arc<dyn SyncSource>) -> Arc<SyncTracker> {
        Arc::new(SyncTracker::new(source, 3))
    }

    async fn wait_terminal(tracker: &SyncTracker) -> SyncOperation {
        let mut rx = tracker.subscribe();
        let op = rx
            .wait_for(|op| op.as_ref().is_some_and(|op| op.status.is_terminal()))
            .await
            .unwrap();
        op.clone().unwrap()
    }

    #[tokio::test]
    async fn trigger_returns_running_operation() {
        let source = Arc::new(ChannelSync::default());
        let tracker = tracker_with(source.clone());
        assert_eq!(tracker.state(), TrackerState::Idle);
        assert!(tracker.get_status().is_none());

        let op = tracker.trigger_sync(SyncTrigger::Manual).unwrap();
        assert_eq!(op.status, SyncStatus::Running);
        assert_eq!(op.trigger, SyncTrigger::Manual);
        assert!(op.completed_at.is_none());
        assert_eq!(tracker.state(), TrackerState::Running);
        assert_eq!(tracker.get_status().unwrap().id, op.id);
    }

    #[tokio::test]
    async fn second_trigger_while_running_fails_fast() {
        let source = Arc::new(ChannelSync::default());
        let tracker = tracker_with(source.clone());

        let op = tracker.trigger_sync(SyncTrigger::Manual).unwrap();
        assert_eq!(
            tracker.trigger_sync(SyncTrigger::Scheduled),
            Err(CatalogError::SyncAlreadyInProgress(op.id.clone()))
        );
        // Only one run reached the source
        assert_eq!(source.senders.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn progress_accumulates_and_completion_is_stamped() {
        let source = Arc::new(ChannelSync::default());
        let tracker = tracker_with(source.clone());
        tracker.trigger_sync(SyncTrigger::Manual).unwrap();

        source.send(0, SyncUpdate::Total(10));
        source.send(0, SyncUpdate::Processed(7));
        source.send(0, SyncUpdate::ItemFailed {
            item: "vin-123".into(),
            reason: "missing price".into(),
        });
        source.send(0, SyncUpdate::Processed(2));
        source.send(0, SyncUpdate::Completed);

        let op = wait_terminal(&tracker).await;
        assert_eq!(op.status, SyncStatus::Completed);
        assert_eq!(op.progress, SyncProgress { total: 10, processed: 9, failed: 1 });
        assert!(op.completed_at.is_some());
        assert!(op.log_entries.iter().any(|e| e.message.contains("vin-123")));
        assert_eq!(tracker.state(), TrackerState::Completed);
    }

    #[tokio::test]
    async fn progress_never_exceeds_announced_total() {
        let source = Arc::new(ChannelSync::default());
        let tracker = tracker_with(source.clone());
        tracker.trigger_sync(SyncTrigger::Manual).unwrap();

        source.send(0, SyncUpdate::Total(3));
        source.send(0, SyncUpdate::Processed(2));
        source.send(0, SyncUpdate::Processed(5));
        source.send(0, SyncUpdate::ItemFailed { item: "x".into(), reason: "y".into() });
        source.send(0, SyncUpdate::Completed);

        let op = wait_terminal(&tracker).await;
        assert_eq!(op.progress, SyncProgress { total: 3, processed: 3, failed: 0 });
    }

    #[tokio::test]
    async fn total_grows_with_reports_until_announced() {
        let source = Arc::new(ScriptedSync(vec![
            SyncUpdate::Processed(4),
            SyncUpdate::ItemFailed { item: "a".into(), reason: "b".into() },
            SyncUpdate::Completed,
        ]));
        let tracker = tracker_with(source);
        tracker.trigger_sync(SyncTrigger::Scheduled).unwrap();

        let op = wait_terminal(&tracker).await;
        assert_eq!(op.progress, SyncProgress { total: 5, processed: 4, failed: 1 });
    }

    #[tokio::test]
    async fn transport_failure_fails_the_run_and_allows_retrigger() {
        let source = Arc::new(ChannelSync::default());
        let tracker = tracker_with(source.clone());
        tracker.trigger_sync(SyncTrigger::Manual).unwrap();

        source.send(0, SyncUpdate::Total(5));
        source.send(0, SyncUpdate::Processed(2));
        source.send(0, SyncUpdate::Failed("connection reset".into()));

        let failed = wait_terminal(&tracker).await;
        assert_eq!(failed.status, SyncStatus::Failed);
        assert!(failed.completed_at.is_some());
        assert_eq!(tracker.state(), TrackerState::Failed);

        // A failed run does not block the next trigger, which starts from scratch
        let next = tracker.trigger_sync(SyncTrigger::Manual).unwrap();
        assert_ne!(next.id, failed.id);
        assert_eq!(next.progress, SyncProgress::default());
        assert_eq!(tracker.history().len(), 1);
        assert_eq!(tracker.history()[0].id, failed.id);
    }

    #[tokio::test]
    async fn source_hanging_up_counts_as_failure() {
        let source = Arc::new(ChannelSync::default());
        let tracker = tracker_with(source.clone());
        tracker.trigger_sync(SyncTrigger::Manual).unwrap();
        source.send(0, SyncUpdate::Processed(1));
        source.hang_up(0);

        let op = wait_terminal(&tracker).await;
        assert_eq!(op.status, SyncStatus::Failed);
    }

    #[tokio::test]
    async fn waiting_on_a_failed_run_reports_the_reason() {
        let source = Arc::new(ChannelSync::default());
        let tracker = tracker_with(source.clone());
        let op = tracker.trigger_sync(SyncTrigger::Manual).unwrap();

        let waiter = {
            let tracker = Arc::clone(&tracker);
            let id = op.id.clone();
            tokio::spawn(async move { tracker.wait_for_outcome(&id).await })
        };
        source.send(0, SyncUpdate::Processed(1));
        source.send(0, SyncUpdate::Failed("dealer feed rejected".into()));

        let result = waiter.await.unwrap();
        assert_eq!(
            result,
            Err(CatalogError::SyncFailed {
                id: op.id.clone(),
                reason: "dealer feed rejected".into()
            })
        );
        assert_eq!(tracker.get_status().unwrap().failure.as_deref(), Some("dealer feed rejected"));
    }

    #[tokio::test]
    async fn waiting_on_a_finished_or_unknown_run() {
        let tracker = tracker_with(Arc::new(ScriptedSync(vec![SyncUpdate::Completed])));
        let op = tracker.trigger_sync(SyncTrigger::Manual).unwrap();

        let done = tracker.wait_for_outcome(&op.id).await.unwrap();
        assert_eq!(done.status, SyncStatus::Completed);
        assert!(done.failure.is_none());

        // Still found once acknowledged and archived
        tracker.acknowledge();
        assert_eq!(tracker.wait_for_outcome(&op.id).await.unwrap().id, op.id);
        assert!(matches!(
            tracker.wait_for_outcome("missing").await,
            Err(CatalogError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn acknowledge_returns_to_idle_and_keeps_status_readable() {
        let tracker = tracker_with(Arc::new(ScriptedSync(vec![SyncUpdate::Completed])));
        let op = tracker.trigger_sync(SyncTrigger::Manual).unwrap();

        // Still running: nothing to acknowledge
        if tracker.state() == TrackerState::Running {
            assert!(tracker.acknowledge().is_none());
        }
        wait_terminal(&tracker).await;

        let acked = tracker.acknowledge().unwrap();
        assert_eq!(acked.id, op.id);
        assert_eq!(tracker.state(), TrackerState::Idle);
        assert_eq!(tracker.get_status().unwrap().id, op.id);
        assert!(tracker.subscribe().borrow().is_none());
        assert!(tracker.acknowledge().is_none());
    }

    #[tokio::test]
    async fn history_is_bounded_oldest_first() {
        let tracker = tracker_with(Arc::new(ScriptedSync(vec![SyncUpdate::Completed])));
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(tracker.trigger_sync(SyncTrigger::Manual).unwrap().id);
            wait_terminal(&tracker).await;
            tracker.acknowledge();
        }

        let history: Vec<String> = tracker.history().into_iter().map(|op| op.id).collect();
        assert_eq!(history, ids[2..].to_vec());
    }

    #[tokio::test]
    async fn summary_reports_last_run() {
        let tracker = tracker_with(Arc::new(ScriptedSync(vec![
            SyncUpdate::Total(150),
            SyncUpdate::Processed(149),
            SyncUpdate::ItemFailed { item: "vin-9".into(), reason: "bad year".into() },
            SyncUpdate::Completed,
        ])));
        assert_eq!(tracker.summary().last_sync, None);

        tracker.trigger_sync(SyncTrigger::Manual).unwrap();
        let op = wait_terminal(&tracker).await;

        let summary = tracker.summary();
        assert_eq!(summary.last_sync, op.completed_at);
        assert!(!summary.is_running);
        assert_eq!(summary.total_items, 150);
        assert_eq!(summary.synced_items, 149);
        assert_eq!(summary.failed_items, 1);
        assert_eq!(summary.errors, vec!["vin-9: bad year".to_string()]);
        assert_eq!(summary.next_sync, None);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_triggers_scheduled_runs() {
        let tracker = tracker_with(Arc::new(ScriptedSync(vec![SyncUpdate::Completed])));
        let handle = tracker.spawn_scheduler(Duration::from_secs(3600));
        assert!(tracker.get_status().is_none());

        tokio::time::sleep(Duration::from_secs(3601)).await;
        let op = wait_terminal(&tracker).await;
        assert_eq!(op.trigger, SyncTrigger::Scheduled);

        let summary = tracker.summary();
        let expected_next =
            op.completed_at.unwrap() + chrono::Duration::from_std(Duration::from_secs(3600)).unwrap();
        assert_eq!(summary.next_sync, Some(expected_next));
        handle.abort();
    }
}
