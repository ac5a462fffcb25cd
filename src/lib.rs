//! The Small POS - offline store and sync engine
//!
//! Keeps the till working without a network: sales are recorded in a local
//! SQLite queue, catalog/customer/history reads are served from a local
//! cache, and the sync engine drains the queue against the POS server once
//! connectivity returns.

pub mod api;
pub mod catalog;
pub mod config;
pub mod context;
pub mod credentials;
pub mod customers;
pub mod db;
pub mod error;
pub mod facade;
pub mod history;
pub mod logging;
pub mod models;
pub mod network;
pub mod pending;
pub mod sync;
pub mod sync_log;

pub use api::{HttpRemote, ReachabilityProbe, RemoteError, RemoteService};
pub use config::SyncConfig;
pub use context::{SyncContext, SyncSnapshot};
pub use db::DbState;
pub use error::{Error, Result};
pub use facade::{Fetched, LoginOutcome, OfflineGateway, SaleOutcome};
pub use network::{NetworkObserver, NetworkStatus};
pub use sync::{
    SyncEngine, SyncEvent, SyncHandle, SyncPhase, SyncProgress, SyncResult, SyncRunStatus,
    SyncSettings, SyncTrigger,
};
