//! Sync engine.
//!
//! Drains the pending queue against the remote service one transaction at a
//! time, oldest first, then refreshes the read caches. At most one run is in
//! flight: the run phase lives in a watch channel and a trigger that finds it
//! `Running` returns an "already syncing" result instead of queueing.
//!
//! Runs are started by a manual trigger, by the reconnect watcher (after a
//! settle delay, and only with work queued), by the periodic timer while the
//! app is in the foreground, and by the app coming back to the foreground.
//! A run that has started always completes its queue pass; cancellation only
//! stops the background watchers between runs.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{with_timeout, RemoteService};
use crate::db::{self, DbState};
use crate::error::Result;
use crate::facade::refresh_read_caches;
use crate::history::DEFAULT_HISTORY_LIMIT;
use crate::models::{PendingStatus, PendingTransaction};
use crate::network::NetworkObserver;
use crate::pending::{self, DEFAULT_MAX_ATTEMPTS};
use crate::sync_log;

const EVENT_CHANNEL_CAPACITY: usize = 64;
const EXHAUSTED_PREFIX: &str = "Gave up after";

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Idle,
    Running,
}

/// What started a run. Recorded in the sync log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Manual,
    Reconnect,
    Periodic,
    Foreground,
}

impl SyncTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncTrigger::Manual => "manual",
            SyncTrigger::Reconnect => "reconnect",
            SyncTrigger::Periodic => "periodic",
            SyncTrigger::Foreground => "foreground",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub total: usize,
    pub completed: usize,
    pub current_label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncItemError {
    /// `None` for run-level errors (offline, already syncing, storage).
    pub local_id: Option<String>,
    pub message: String,
}

impl SyncItemError {
    fn run_level(message: impl Into<String>) -> Self {
        Self {
            local_id: None,
            message: message.into(),
        }
    }

    fn item(local_id: &str, message: impl Into<String>) -> Self {
        Self {
            local_id: Some(local_id.to_string()),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunStatus {
    Completed,
    AlreadySyncing,
    Offline,
    /// The queue could not be read; nothing was attempted.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,
    pub synced: usize,
    pub failed: usize,
    /// Items left alone because they reached the attempt cap.
    pub skipped: usize,
    pub errors: Vec<SyncItemError>,
    pub status: SyncRunStatus,
}

impl SyncResult {
    pub fn offline() -> Self {
        Self::rejected(SyncRunStatus::Offline, "device is offline")
    }

    pub fn already_syncing() -> Self {
        Self::rejected(SyncRunStatus::AlreadySyncing, "sync already in progress")
    }

    fn rejected(status: SyncRunStatus, message: &str) -> Self {
        Self {
            success: false,
            synced: 0,
            failed: 0,
            skipped: 0,
            errors: vec![SyncItemError::run_level(message)],
            status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SyncEvent {
    StateChanged(SyncPhase),
    Progress(SyncProgress),
    Finished(SyncResult),
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub max_attempts: i64,
    pub request_timeout: Duration,
    pub reconnect_settle: Duration,
    pub periodic_interval: Duration,
    pub history_limit: usize,
    pub sync_log_retention: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            request_timeout: crate::api::DEFAULT_TIMEOUT,
            reconnect_settle: Duration::from_secs(2),
            periodic_interval: Duration::from_secs(30),
            history_limit: DEFAULT_HISTORY_LIMIT,
            sync_log_retention: 200,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SyncEngine {
    db: Arc<DbState>,
    remote: Arc<dyn RemoteService>,
    network: Arc<NetworkObserver>,
    settings: SyncSettings,
    phase: watch::Sender<SyncPhase>,
    events: broadcast::Sender<SyncEvent>,
    foreground: AtomicBool,
}

/// Resets the phase to `Idle` when a run ends, however it ends.
struct RunGuard<'a> {
    phase: &'a watch::Sender<SyncPhase>,
    events: &'a broadcast::Sender<SyncEvent>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.phase.send_replace(SyncPhase::Idle);
        let _ = self.events.send(SyncEvent::StateChanged(SyncPhase::Idle));
    }
}

impl SyncEngine {
    pub fn new(
        db: Arc<DbState>,
        remote: Arc<dyn RemoteService>,
        network: Arc<NetworkObserver>,
        settings: SyncSettings,
    ) -> Self {
        let (phase, _) = watch::channel(SyncPhase::Idle);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            db,
            remote,
            network,
            settings,
            phase,
            events,
            foreground: AtomicBool::new(true),
        }
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.db
    }

    pub fn network(&self) -> &Arc<NetworkObserver> {
        &self.network
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    pub fn is_syncing(&self) -> bool {
        self.phase() == SyncPhase::Running
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Transactions not yet confirmed by the server, in any state.
    pub fn pending_count(&self) -> Result<i64> {
        pending::count_pending(&self.db, &[])
    }

    pub fn failed_count(&self) -> Result<i64> {
        pending::count_pending(&self.db, &[PendingStatus::Failed])
    }

    pub fn last_sync_time(&self) -> Result<Option<DateTime<Utc>>> {
        db::last_sync_time(&self.db)
    }

    pub fn is_foreground(&self) -> bool {
        self.foreground.load(Ordering::SeqCst)
    }

    /// The periodic timer only fires while the app is in the foreground.
    pub fn set_foreground(&self, foreground: bool) {
        let was = self.foreground.swap(foreground, Ordering::SeqCst);
        if was != foreground {
            debug!(foreground, "App foreground state changed");
        }
    }

    /// App came back to the foreground: sync if there is work and a network.
    pub async fn on_app_foreground(&self) -> Option<SyncResult> {
        self.set_foreground(true);
        self.run_if_work(SyncTrigger::Foreground).await
    }

    /// Manual trigger.
    pub async fn trigger_sync(&self) -> SyncResult {
        self.trigger(SyncTrigger::Manual).await
    }

    /// Start a run unless one is already in flight.
    pub async fn trigger(&self, trigger: SyncTrigger) -> SyncResult {
        if !self.network.is_effectively_online() {
            info!(trigger = trigger.as_str(), "Sync skipped: device is offline");
            return SyncResult::offline();
        }

        let acquired = self.phase.send_if_modified(|phase| {
            if *phase == SyncPhase::Idle {
                *phase = SyncPhase::Running;
                true
            } else {
                false
            }
        });
        if !acquired {
            debug!(trigger = trigger.as_str(), "Sync already in progress");
            return SyncResult::already_syncing();
        }
        let guard = RunGuard {
            phase: &self.phase,
            events: &self.events,
        };
        let _ = self.events.send(SyncEvent::StateChanged(SyncPhase::Running));

        let result = self.run(trigger).await;

        drop(guard);
        let _ = self.events.send(SyncEvent::Finished(result.clone()));
        result
    }

    async fn run_if_work(&self, trigger: SyncTrigger) -> Option<SyncResult> {
        if !self.network.is_effectively_online() {
            return None;
        }
        match pending::count_retryable(&self.db, self.settings.max_attempts) {
            Ok(0) => {
                debug!(trigger = trigger.as_str(), "Nothing retryable queued; sync not started");
                None
            }
            Ok(count) => {
                info!(trigger = trigger.as_str(), pending = count, "Starting sync");
                Some(self.trigger(trigger).await)
            }
            Err(e) => {
                warn!(trigger = trigger.as_str(), error = %e, "Could not count pending sales");
                None
            }
        }
    }

    async fn run(&self, trigger: SyncTrigger) -> SyncResult {
        let started = Instant::now();
        let log_id = match sync_log::begin(&self.db, trigger.as_str()) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, "Could not open sync log entry");
                None
            }
        };

        let result = match self.drain_queue().await {
            Ok(result) => {
                let report = refresh_read_caches(
                    &self.db,
                    self.remote.as_ref(),
                    self.settings.history_limit,
                    self.settings.request_timeout,
                )
                .await;
                if !report.is_complete() {
                    debug!(errors = ?report.errors, "Cache refresh errors ignored for run result");
                }
                if let Err(e) = db::set_last_sync_time(&self.db, Utc::now()) {
                    warn!(error = %e, "Could not stamp last sync time");
                }
                result
            }
            Err(e) => {
                error!(error = %e, "Sync aborted: pending queue unreadable");
                SyncResult {
                    success: false,
                    synced: 0,
                    failed: 0,
                    skipped: 0,
                    errors: vec![SyncItemError::run_level(e.to_string())],
                    status: SyncRunStatus::Aborted,
                }
            }
        };

        if let Some(id) = log_id {
            let run_error = match result.status {
                SyncRunStatus::Aborted => result.errors.first().map(|e| e.message.as_str()),
                _ => None,
            };
            if let Err(e) = sync_log::finish(&self.db, id, result.synced, result.failed, run_error)
            {
                warn!(error = %e, "Could not close sync log entry");
            }
            if let Err(e) = sync_log::prune(&self.db, self.settings.sync_log_retention) {
                warn!(error = %e, "Could not prune sync log");
            }
        }

        info!(
            trigger = trigger.as_str(),
            synced = result.synced,
            failed = result.failed,
            skipped = result.skipped,
            duration_ms = started.elapsed().as_millis() as u64,
            "Sync run finished"
        );
        result
    }

    /// One sequential pass over the queue. Only a failure to read the queue
    /// is returned as an error; per-item failures are collected in the result.
    async fn drain_queue(&self) -> Result<SyncResult> {
        pending::recover_interrupted(&self.db)?;
        let queue = pending::list_pending_transactions(
            &self.db,
            &[PendingStatus::Pending, PendingStatus::Failed],
        )?;

        let total = queue.len();
        let mut result = SyncResult {
            success: true,
            synced: 0,
            failed: 0,
            skipped: 0,
            errors: Vec::new(),
            status: SyncRunStatus::Completed,
        };
        if total > 0 {
            info!(total, "Draining pending sales");
        }

        for (idx, item) in queue.iter().enumerate() {
            self.sync_one(item, &mut result).await;
            let _ = self.events.send(SyncEvent::Progress(SyncProgress {
                total,
                completed: idx + 1,
                current_label: item.label(),
            }));
        }

        result.success = result.failed == 0;
        Ok(result)
    }

    async fn sync_one(&self, item: &PendingTransaction, result: &mut SyncResult) {
        let max_attempts = self.settings.max_attempts;
        let local_id = item.local_id.as_str();

        if item.attempt >= max_attempts {
            let message = match &item.error_message {
                Some(prev) if prev.starts_with(EXHAUSTED_PREFIX) => prev.clone(),
                Some(prev) => format!("{EXHAUSTED_PREFIX} {} attempts: {prev}", item.attempt),
                None => format!("{EXHAUSTED_PREFIX} {} attempts", item.attempt),
            };
            let marked = pending::mark_pending_transaction_exhausted(&self.db, local_id, &message);
            if let Err(e) = marked {
                warn!(local_id = %local_id, error = %e, "Could not mark sale as exhausted");
            }
            debug!(local_id = %local_id, attempt = item.attempt, "Skipping sale at attempt cap");
            result.skipped += 1;
            return;
        }

        if let Err(e) = pending::mark_pending_transaction_status(
            &self.db,
            local_id,
            PendingStatus::Syncing,
            None,
            max_attempts,
        ) {
            warn!(local_id = %local_id, error = %e, "Could not mark sale as syncing");
            result.failed += 1;
            result.errors.push(SyncItemError::item(local_id, e.to_string()));
            return;
        }

        let payload = item.to_payload();
        match with_timeout(
            self.settings.request_timeout,
            "create transaction",
            self.remote.create_transaction(&payload),
        )
        .await
        {
            Ok(created) => {
                result.synced += 1;
                info!(local_id = %local_id, remote_id = created.id, "Pending sale synced");
                if let Err(e) = pending::remove_pending_transaction(&self.db, local_id) {
                    // The server has it; a retry would submit it twice.
                    error!(
                        local_id = %local_id,
                        error = %e,
                        "Synced sale could not be removed from queue"
                    );
                    result.errors.push(SyncItemError::item(
                        local_id,
                        format!("synced but not removed locally: {e}"),
                    ));
                }
            }
            Err(e) => {
                let message = e.to_string();
                warn!(
                    local_id = %local_id,
                    attempt = item.attempt + 1,
                    error = %message,
                    "Pending sale sync failed"
                );
                if let Err(store_err) = pending::mark_pending_transaction_status(
                    &self.db,
                    local_id,
                    PendingStatus::Failed,
                    Some(&message),
                    max_attempts,
                ) {
                    warn!(
                        local_id = %local_id,
                        error = %store_err,
                        "Could not record sync failure"
                    );
                }
                result.failed += 1;
                result.errors.push(SyncItemError::item(local_id, message));
            }
        }
    }

    // -- background triggers ------------------------------------------------

    /// On an offline to online transition, wait for the link to settle, then
    /// sync if anything is queued.
    pub fn spawn_reconnect_watcher(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        // Subscribe before spawning so a transition right after start is seen.
        let mut rx = engine.network.subscribe();
        let mut was_online = rx.borrow_and_update().is_effectively_online();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let online = rx.borrow_and_update().is_effectively_online();
                let restored = online && !was_online;
                was_online = online;
                if !restored {
                    continue;
                }

                debug!(
                    settle_ms = engine.settings.reconnect_settle.as_millis() as u64,
                    "Network restored; waiting to settle"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(engine.settings.reconnect_settle) => {}
                }
                engine.run_if_work(SyncTrigger::Reconnect).await;
            }
            debug!("Reconnect watcher stopped");
        })
    }

    /// Sync every `periodic_interval` while foregrounded and online, if a
    /// queued sale is still below the attempt cap.
    pub fn spawn_periodic(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let period = engine.settings.periodic_interval;
            info!(interval_secs = period.as_secs(), "Periodic sync started");
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if !engine.is_foreground() {
                    continue;
                }
                engine.run_if_work(SyncTrigger::Periodic).await;
            }
            info!("Periodic sync stopped");
        })
    }

    /// Start the reconnect watcher and the periodic timer.
    pub fn start(self: &Arc<Self>) -> SyncHandle {
        let cancel = CancellationToken::new();
        let handles = vec![
            self.spawn_reconnect_watcher(cancel.child_token()),
            self.spawn_periodic(cancel.child_token()),
        ];
        SyncHandle { cancel, handles }
    }
}

/// Background sync tasks. Dropping the handle leaves them running; call
/// [`SyncHandle::shutdown`] to stop them.
pub struct SyncHandle {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl SyncHandle {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the watchers. A run already in progress finishes first.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Sync task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RemoteError;
    use crate::models::{
        Customer, LoginResponse, Product, RemoteTransaction, TransactionItem, TransactionPayload,
    };
    use crate::network::NetworkStatus;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Accepts or rejects every create call and records the notes it saw.
    struct ScriptedRemote {
        reject: AtomicBool,
        seen: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedRemote {
        fn new(reject: bool) -> Self {
            Self {
                reject: AtomicBool::new(reject),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RemoteService for ScriptedRemote {
        async fn list_products(&self) -> std::result::Result<Vec<Product>, RemoteError> {
            Ok(vec![])
        }

        async fn list_customers(&self) -> std::result::Result<Vec<Customer>, RemoteError> {
            Ok(vec![])
        }

        async fn list_transactions(
            &self,
            _limit: usize,
        ) -> std::result::Result<Vec<RemoteTransaction>, RemoteError> {
            Ok(vec![])
        }

        async fn create_transaction(
            &self,
            payload: &TransactionPayload,
        ) -> std::result::Result<RemoteTransaction, RemoteError> {
            self.seen.lock().unwrap().push(payload.notes.clone());
            if self.reject.load(Ordering::SeqCst) {
                return Err(RemoteError::Status {
                    status: 422,
                    message: "rejected".into(),
                });
            }
            Ok(RemoteTransaction {
                id: 1,
                transaction_number: None,
                customer_id: None,
                customer_name: None,
                total: 0.0,
                payment_method: None,
                status: None,
                created_at: None,
                items: vec![],
            })
        }

        async fn login(
            &self,
            _login: &str,
            _password: &str,
        ) -> std::result::Result<LoginResponse, RemoteError> {
            Err(RemoteError::Unreachable("stub".into()))
        }
    }

    fn sale(note: &str) -> TransactionPayload {
        TransactionPayload {
            customer_id: None,
            items: vec![TransactionItem {
                product_id: 1,
                quantity: 1,
                unit_price: 3.0,
                discount: None,
            }],
            payment_method: "cash".into(),
            notes: Some(note.into()),
        }
    }

    fn engine(remote: Arc<ScriptedRemote>, status: NetworkStatus) -> Arc<SyncEngine> {
        let db = Arc::new(DbState::in_memory().unwrap());
        let network = Arc::new(NetworkObserver::new(status, None, Duration::from_secs(5)));
        Arc::new(SyncEngine::new(db, remote, network, SyncSettings::default()))
    }

    #[tokio::test]
    async fn offline_run_is_rejected_without_touching_queue() {
        let remote = Arc::new(ScriptedRemote::new(false));
        let engine = engine(remote.clone(), NetworkStatus::OFFLINE);
        pending::enqueue_pending_transaction(engine.db(), &sale("a")).unwrap();

        let result = engine.trigger_sync().await;
        assert_eq!(result.status, SyncRunStatus::Offline);
        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(engine.pending_count().unwrap(), 1);
        assert!(remote.seen.lock().unwrap().is_empty());
        assert!(engine.last_sync_time().unwrap().is_none());
    }

    #[tokio::test]
    async fn successful_run_empties_queue_and_stamps_time() {
        let remote = Arc::new(ScriptedRemote::new(false));
        let engine = engine(remote, NetworkStatus::ONLINE);
        pending::enqueue_pending_transaction(engine.db(), &sale("a")).unwrap();
        let mut events = engine.subscribe_events();

        let result = engine.trigger_sync().await;
        assert!(result.success);
        assert_eq!(result.synced, 1);
        assert_eq!(engine.pending_count().unwrap(), 0);
        assert!(engine.last_sync_time().unwrap().is_some());
        assert_eq!(engine.phase(), SyncPhase::Idle);

        let mut saw_progress = false;
        let mut saw_finished = false;
        while let Ok(event) = events.try_recv() {
            match event {
                SyncEvent::Progress(p) => {
                    saw_progress = true;
                    assert_eq!((p.total, p.completed), (1, 1));
                }
                SyncEvent::Finished(r) => saw_finished = r.synced == 1,
                SyncEvent::StateChanged(_) => {}
            }
        }
        assert!(saw_progress && saw_finished);

        let log = sync_log::recent(engine.db(), 5).unwrap();
        assert_eq!(log[0].sync_type, "manual");
        assert_eq!(log[0].status, "completed");
    }

    #[tokio::test]
    async fn rejected_sale_stays_queued_with_error() {
        let remote = Arc::new(ScriptedRemote::new(true));
        let engine = engine(remote, NetworkStatus::ONLINE);
        let id = pending::enqueue_pending_transaction(engine.db(), &sale("a")).unwrap();

        let result = engine.trigger_sync().await;
        assert!(!result.success);
        assert_eq!(result.failed, 1);
        assert_eq!(result.errors[0].local_id.as_deref(), Some(id.as_str()));

        let row = pending::get_pending_transaction(engine.db(), &id)
            .unwrap()
            .unwrap();
        assert_eq!(row.status, PendingStatus::Failed);
        assert_eq!(row.attempt, 1);
        assert!(row.error_message.unwrap().contains("rejected"));
    }

    #[tokio::test]
    async fn background_and_foreground_flags() {
        let remote = Arc::new(ScriptedRemote::new(false));
        let engine = engine(remote, NetworkStatus::ONLINE);
        assert!(engine.on_app_foreground().await.is_none());

        pending::enqueue_pending_transaction(engine.db(), &sale("a")).unwrap();
        engine.set_foreground(false);
        assert!(!engine.is_foreground());
        let result = engine.on_app_foreground().await.unwrap();
        assert_eq!(result.synced, 1);
        assert!(engine.is_foreground());
    }
}
