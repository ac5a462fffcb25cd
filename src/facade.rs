//! Offline-aware gateways.
//!
//! Every read tries the remote service first and writes the result through to
//! the local cache; when the device is offline or the call fails, the cached
//! copy is returned instead and flagged with `is_offline`. Recording a sale
//! falls back to the pending queue so the UI can always tell "saved online"
//! from "queued offline".

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::api::{with_timeout, RemoteError, RemoteService};
use crate::catalog;
use crate::credentials;
use crate::customers;
use crate::db::{now_timestamp, DbState};
use crate::error::{Error, Result};
use crate::history;
use crate::models::{
    CachedCustomer, CatalogItem, NewCustomer, RemoteTransaction, TransactionCacheEntry,
    TransactionPayload, UserProfile,
};
use crate::network::NetworkObserver;
use crate::pending;

/// Data plus where it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Fetched<T> {
    pub data: T,
    pub is_offline: bool,
}

impl<T> Fetched<T> {
    fn online(data: T) -> Self {
        Self {
            data,
            is_offline: false,
        }
    }

    fn cached(data: T) -> Self {
        Self {
            data,
            is_offline: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SaleOutcome {
    SavedOnline(RemoteTransaction),
    QueuedOffline { local_id: String, total: f64 },
}

impl SaleOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, SaleOutcome::QueuedOffline { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginOutcome {
    pub profile: Option<UserProfile>,
    pub token: Option<String>,
    pub is_offline: bool,
}

/// What a cache refresh managed to replace. `None` means that cache kept its
/// previous contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshReport {
    pub products: Option<usize>,
    pub customers: Option<usize>,
    pub transactions: Option<usize>,
    pub errors: Vec<String>,
}

impl RefreshReport {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Refresh every read cache from the remote service. Each cache is replaced
/// atomically on its own; a failure leaves that cache untouched and is
/// reported, never returned.
pub async fn refresh_read_caches(
    db: &DbState,
    remote: &dyn RemoteService,
    history_limit: usize,
    timeout: Duration,
) -> RefreshReport {
    let mut report = RefreshReport::default();

    match with_timeout(timeout, "list products", remote.list_products()).await {
        Ok(products) => {
            let synced_at = now_timestamp();
            let items: Vec<CatalogItem> = products
                .into_iter()
                .map(|p| CatalogItem::from_remote(p, &synced_at))
                .collect();
            match catalog::replace_catalog(db, &items) {
                Ok(n) => report.products = Some(n),
                Err(e) => report.errors.push(format!("products: {e}")),
            }
        }
        Err(e) => report.errors.push(format!("products: {e}")),
    }

    match with_timeout(timeout, "list customers", remote.list_customers()).await {
        Ok(list) => match customers::replace_customers(db, &list) {
            Ok(n) => report.customers = Some(n),
            Err(e) => report.errors.push(format!("customers: {e}")),
        },
        Err(e) => report.errors.push(format!("customers: {e}")),
    }

    match with_timeout(
        timeout,
        "list transactions",
        remote.list_transactions(history_limit),
    )
    .await
    {
        Ok(list) => match history::replace_transaction_cache(db, list, history_limit) {
            Ok(n) => report.transactions = Some(n),
            Err(e) => report.errors.push(format!("transactions: {e}")),
        },
        Err(e) => report.errors.push(format!("transactions: {e}")),
    }

    if report.is_complete() {
        info!(
            products = ?report.products,
            customers = ?report.customers,
            transactions = ?report.transactions,
            "Read caches refreshed"
        );
    } else {
        warn!(errors = ?report.errors, "Read cache refresh incomplete");
    }
    report
}

pub struct OfflineGateway {
    db: Arc<DbState>,
    remote: Arc<dyn RemoteService>,
    network: Arc<NetworkObserver>,
    request_timeout: Duration,
    history_limit: usize,
    hash_cost: u32,
}

impl OfflineGateway {
    pub fn new(
        db: Arc<DbState>,
        remote: Arc<dyn RemoteService>,
        network: Arc<NetworkObserver>,
    ) -> Self {
        Self {
            db,
            remote,
            network,
            request_timeout: crate::api::DEFAULT_TIMEOUT,
            history_limit: history::DEFAULT_HISTORY_LIMIT,
            hash_cost: bcrypt::DEFAULT_COST,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn with_hash_cost(mut self, cost: u32) -> Self {
        self.hash_cost = cost;
        self
    }

    /// Run a remote call only when effectively online.
    async fn remote_call<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, RemoteError>>,
    {
        if !self.network.is_effectively_online() {
            return Err(Error::Offline);
        }
        Ok(with_timeout(self.request_timeout, what, fut).await?)
    }

    // -- reads --------------------------------------------------------------

    pub async fn list_products(&self) -> Result<Fetched<Vec<CatalogItem>>> {
        match self
            .remote_call("list products", self.remote.list_products())
            .await
        {
            Ok(products) => {
                let synced_at = now_timestamp();
                let items: Vec<CatalogItem> = products
                    .into_iter()
                    .map(|p| CatalogItem::from_remote(p, &synced_at))
                    .collect();
                if let Err(e) = catalog::replace_catalog(&self.db, &items) {
                    warn!(error = %e, "Catalog write-through failed; previous cache kept");
                }
                Ok(Fetched::online(items))
            }
            Err(e) => {
                log_fallback("products", &e);
                Ok(Fetched::cached(catalog::list_catalog(&self.db)?))
            }
        }
    }

    pub async fn list_customers(&self) -> Result<Fetched<Vec<CachedCustomer>>> {
        match self
            .remote_call("list customers", self.remote.list_customers())
            .await
        {
            Ok(list) => match customers::replace_customers(&self.db, &list) {
                // Re-read so local placeholders stay visible.
                Ok(_) => Ok(Fetched::online(customers::list_customers(&self.db)?)),
                Err(e) => {
                    warn!(error = %e, "Customer write-through failed; previous cache kept");
                    let synced_at = now_timestamp();
                    Ok(Fetched::online(
                        list.into_iter()
                            .map(|c| CachedCustomer::from_remote(c, &synced_at))
                            .collect(),
                    ))
                }
            },
            Err(e) => {
                log_fallback("customers", &e);
                Ok(Fetched::cached(customers::list_customers(&self.db)?))
            }
        }
    }

    pub async fn recent_transactions(&self) -> Result<Fetched<Vec<TransactionCacheEntry>>> {
        let limit = self.history_limit;
        match self
            .remote_call("list transactions", self.remote.list_transactions(limit))
            .await
        {
            Ok(list) => {
                if let Err(e) = history::replace_transaction_cache(&self.db, list.clone(), limit) {
                    warn!(error = %e, "History write-through failed; previous cache kept");
                }
                let cached_at = now_timestamp();
                Ok(Fetched::online(
                    list.into_iter()
                        .take(limit)
                        .map(|tx| TransactionCacheEntry::from_remote(tx, &cached_at))
                        .collect(),
                ))
            }
            Err(e) => {
                log_fallback("transactions", &e);
                Ok(Fetched::cached(history::list_transaction_cache(
                    &self.db, limit,
                )?))
            }
        }
    }

    /// Local-only product search, usable offline.
    pub fn search_products(&self, query: &str, limit: usize) -> Result<Vec<CatalogItem>> {
        catalog::search_catalog(&self.db, query, limit)
    }

    pub fn find_product_by_barcode(&self, barcode: &str) -> Result<Option<CatalogItem>> {
        catalog::find_by_barcode(&self.db, barcode)
    }

    pub fn search_customers(&self, query: &str, limit: usize) -> Result<Vec<CachedCustomer>> {
        customers::search_customers(&self.db, query, limit)
    }

    pub fn create_local_customer(&self, new: &NewCustomer) -> Result<CachedCustomer> {
        customers::create_local_customer(&self.db, new)
    }

    // -- writes -------------------------------------------------------------

    /// Record a sale. Malformed payloads are rejected before any remote call
    /// or queue write.
    pub async fn create_transaction(&self, payload: &TransactionPayload) -> Result<SaleOutcome> {
        payload.validate()?;

        match self
            .remote_call("create transaction", self.remote.create_transaction(payload))
            .await
        {
            Ok(created) => {
                info!(remote_id = created.id, "Sale saved online");
                return Ok(SaleOutcome::SavedOnline(created));
            }
            Err(e) => log_fallback("create transaction", &e),
        }

        let local_id = pending::enqueue_pending_transaction(&self.db, payload)?;
        for item in &payload.items {
            let decremented =
                catalog::decrement_catalog_stock(&self.db, item.product_id, item.quantity);
            if let Err(e) = decremented {
                warn!(
                    product_id = item.product_id,
                    error = %e,
                    "Speculative stock decrement failed"
                );
            }
        }
        let total = payload.totals().total;
        info!(local_id = %local_id, total, "Sale queued offline");
        Ok(SaleOutcome::QueuedOffline { local_id, total })
    }

    /// Log in online when possible, caching the credential for later offline
    /// use; otherwise verify against the cached credential.
    pub async fn login(&self, login: &str, password: &str) -> Result<LoginOutcome> {
        match self
            .remote_call("login", self.remote.login(login, password))
            .await
        {
            Ok(resp) => {
                let db = Arc::clone(&self.db);
                let (login, password) = (login.to_string(), Zeroizing::new(password.to_string()));
                let (user, token) = (resp.user.clone(), resp.token.clone());
                let cost = self.hash_cost;
                // bcrypt is CPU-bound; keep it off the async workers.
                let cached = tokio::task::spawn_blocking(move || {
                    credentials::upsert_credential(
                        &db,
                        &login,
                        &password,
                        &user,
                        Some(&token),
                        cost,
                    )
                })
                .await
                .map_err(Error::from)
                .and_then(|r| r);
                if let Err(e) = cached {
                    warn!(error = %e, "Could not cache offline credential");
                }
                return Ok(LoginOutcome {
                    profile: Some(resp.user),
                    token: Some(resp.token),
                    is_offline: false,
                });
            }
            Err(Error::Remote(e)) if is_login_rejection(&e) => {
                warn!(status = ?e.status(), "Login rejected by POS server");
                return Err(Error::InvalidCredentials);
            }
            Err(e) => log_fallback("login", &e),
        }

        let db = Arc::clone(&self.db);
        let (login, password) = (login.to_string(), Zeroizing::new(password.to_string()));
        let check = tokio::task::spawn_blocking(move || {
            credentials::verify_credential(&db, &login, &password)
        })
        .await??;
        if !check.valid {
            return Err(Error::InvalidCredentials);
        }
        info!("Logged in with cached offline credential");
        Ok(LoginOutcome {
            profile: check.profile,
            token: check.token,
            is_offline: true,
        })
    }
}

/// Statuses that mean the server looked at the login and said no. Anything
/// else (rate limiting, gateway errors) falls back to the cached credential.
const LOGIN_REJECTED_STATUSES: [u16; 4] = [400, 401, 403, 422];

fn is_login_rejection(err: &RemoteError) -> bool {
    matches!(err.status(), Some(s) if LOGIN_REJECTED_STATUSES.contains(&s))
}

fn log_fallback(what: &str, err: &Error) {
    if err.is_connectivity() {
        info!(operation = what, reason = %err, "Using local store");
    } else {
        warn!(operation = what, error = %err, "Remote call failed; using local store");
    }
}
