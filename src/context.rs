//! Read-side view of sync state for the UI layer.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::warn;

use crate::error::Result;
use crate::sync::{SyncEngine, SyncEvent, SyncPhase, SyncResult};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    pub is_online: bool,
    pub is_syncing: bool,
    pub pending_count: i64,
    pub failed_count: i64,
    pub last_sync_time: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct SyncContext {
    engine: Arc<SyncEngine>,
}

impl SyncContext {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }

    pub fn is_online(&self) -> bool {
        self.engine.network().is_effectively_online()
    }

    pub fn is_syncing(&self) -> bool {
        self.engine.is_syncing()
    }

    pub fn pending_count(&self) -> Result<i64> {
        self.engine.pending_count()
    }

    pub fn failed_count(&self) -> Result<i64> {
        self.engine.failed_count()
    }

    pub fn last_sync_time(&self) -> Result<Option<DateTime<Utc>>> {
        self.engine.last_sync_time()
    }

    pub async fn trigger_sync(&self) -> SyncResult {
        self.engine.trigger_sync().await
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncPhase> {
        self.engine.subscribe_phase()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.engine.subscribe_events()
    }

    /// Everything a status bar needs in one call. Counts that cannot be read
    /// are reported as zero.
    pub fn snapshot(&self) -> SyncSnapshot {
        let pending_count = self.pending_count().unwrap_or_else(|e| {
            warn!(error = %e, "Could not count pending sales");
            0
        });
        let failed_count = self.failed_count().unwrap_or_else(|e| {
            warn!(error = %e, "Could not count failed sales");
            0
        });
        let last_sync_time = self.last_sync_time().unwrap_or_else(|e| {
            warn!(error = %e, "Could not read last sync time");
            None
        });
        SyncSnapshot {
            is_online: self.is_online(),
            is_syncing: self.is_syncing(),
            pending_count,
            failed_count,
            last_sync_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{RemoteError, RemoteService};
    use crate::db::DbState;
    use crate::models::{
        Customer, LoginResponse, Product, RemoteTransaction, TransactionItem, TransactionPayload,
    };
    use crate::network::{NetworkObserver, NetworkStatus};
    use crate::pending;
    use crate::sync::SyncSettings;
    use async_trait::async_trait;
    use std::time::Duration;

    struct DownRemote;

    #[async_trait]
    impl RemoteService for DownRemote {
        async fn list_products(&self) -> std::result::Result<Vec<Product>, RemoteError> {
            Err(RemoteError::Unreachable("down".into()))
        }

        async fn list_customers(&self) -> std::result::Result<Vec<Customer>, RemoteError> {
            Err(RemoteError::Unreachable("down".into()))
        }

        async fn list_transactions(
            &self,
            _limit: usize,
        ) -> std::result::Result<Vec<RemoteTransaction>, RemoteError> {
            Err(RemoteError::Unreachable("down".into()))
        }

        async fn create_transaction(
            &self,
            _payload: &TransactionPayload,
        ) -> std::result::Result<RemoteTransaction, RemoteError> {
            Err(RemoteError::Unreachable("down".into()))
        }

        async fn login(
            &self,
            _login: &str,
            _password: &str,
        ) -> std::result::Result<LoginResponse, RemoteError> {
            Err(RemoteError::Unreachable("down".into()))
        }
    }

    #[tokio::test]
    async fn snapshot_reflects_queue_and_network() {
        let db = Arc::new(DbState::in_memory().unwrap());
        let network = Arc::new(NetworkObserver::new(
            NetworkStatus::OFFLINE,
            None,
            Duration::from_secs(5),
        ));
        let engine = Arc::new(SyncEngine::new(
            db.clone(),
            Arc::new(DownRemote),
            network.clone(),
            SyncSettings::default(),
        ));
        let ctx = SyncContext::new(engine);

        let payload = TransactionPayload {
            customer_id: None,
            items: vec![TransactionItem {
                product_id: 1,
                quantity: 2,
                unit_price: 1.0,
                discount: None,
            }],
            payment_method: "card".into(),
            notes: None,
        };
        pending::enqueue_pending_transaction(&db, &payload).unwrap();

        let snap = ctx.snapshot();
        assert!(!snap.is_online);
        assert!(!snap.is_syncing);
        assert_eq!(snap.pending_count, 1);
        assert_eq!(snap.failed_count, 0);
        assert_eq!(snap.last_sync_time, None);

        network.set_link(true);
        let result = ctx.trigger_sync().await;
        assert_eq!(result.failed, 1);

        let snap = ctx.snapshot();
        assert!(snap.is_online);
        assert_eq!(snap.failed_count, 1);
        assert!(snap.last_sync_time.is_some());

        let json = serde_json::to_value(&snap).unwrap();
        assert!(json.get("pendingCount").is_some());
    }
}
