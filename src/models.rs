//! Record types for the offline store and the remote POS service.
//!
//! Remote shapes accept both snake_case and camelCase field names because
//! the POS backend has shipped both over time. Money fields also accept
//! numeric strings (`"12.50"`), which the backend emits for DECIMAL columns.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

fn default_true() -> bool {
    true
}

/// Accept `12.5`, `"12.5"` or `null` for a money field.
fn lenient_f64<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_opt_f64(deserializer)?.unwrap_or(0.0))
}

fn lenient_opt_f64<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    })
}

/// Round to whole cents.
pub fn round_money(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Remote shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub barcode: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub price: f64,
    #[serde(default, alias = "costPrice", deserialize_with = "lenient_opt_f64")]
    pub cost_price: Option<f64>,
    #[serde(default, alias = "stockQuantity", alias = "stock")]
    pub stock_quantity: i64,
    #[serde(default = "default_true", alias = "isActive")]
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTransactionItem {
    #[serde(default, alias = "productId")]
    pub product_id: Option<i64>,
    #[serde(default)]
    pub quantity: i64,
    #[serde(default, alias = "unitPrice", deserialize_with = "lenient_f64")]
    pub unit_price: f64,
}

/// A transaction as confirmed by the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTransaction {
    pub id: i64,
    #[serde(default, alias = "transactionNumber")]
    pub transaction_number: Option<String>,
    #[serde(default, alias = "customerId")]
    pub customer_id: Option<i64>,
    #[serde(default, alias = "customerName")]
    pub customer_name: Option<String>,
    #[serde(
        default,
        alias = "totalAmount",
        alias = "total_amount",
        deserialize_with = "lenient_f64"
    )]
    pub total: f64,
    #[serde(default, alias = "paymentMethod")]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, alias = "createdAt")]
    pub created_at: Option<String>,
    #[serde(default)]
    pub items: Vec<RemoteTransactionItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginResponse {
    #[serde(alias = "access_token", alias = "accessToken")]
    pub token: String,
    pub user: UserProfile,
}

// ---------------------------------------------------------------------------
// Transaction payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionItem {
    pub product_id: i64,
    pub quantity: i64,
    pub unit_price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount: Option<f64>,
}

impl TransactionItem {
    /// Line amount after discount, rounded to cents.
    pub fn subtotal(&self) -> f64 {
        round_money(self.quantity as f64 * self.unit_price - self.discount.unwrap_or(0.0))
    }
}

/// Body of the remote "create transaction" call, and the shape a pending
/// sale is stored from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<i64>,
    pub items: Vec<TransactionItem>,
    pub payment_method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Totals {
    pub subtotal: f64,
    pub discount_total: f64,
    pub total: f64,
}

impl TransactionPayload {
    /// Reject malformed sales before they reach the remote service or the
    /// pending queue.
    pub fn validate(&self) -> Result<()> {
        if self.items.is_empty() {
            return Err(Error::Validation("a sale needs at least one item".into()));
        }
        if self.payment_method.trim().is_empty() {
            return Err(Error::Validation("missing payment method".into()));
        }
        for (idx, item) in self.items.iter().enumerate() {
            let line = idx + 1;
            if item.quantity <= 0 {
                return Err(Error::Validation(format!(
                    "line {line}: quantity must be positive"
                )));
            }
            if !item.unit_price.is_finite() || item.unit_price < 0.0 {
                return Err(Error::Validation(format!(
                    "line {line}: unit price must be a non-negative number"
                )));
            }
            if let Some(discount) = item.discount {
                let gross = item.quantity as f64 * item.unit_price;
                if !discount.is_finite() || discount < 0.0 || discount > gross {
                    return Err(Error::Validation(format!(
                        "line {line}: discount must be between 0 and {gross:.2}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Totals derived from the lines. `total` is the sum of the rounded line
    /// subtotals so stored lines always add up to the stored total.
    pub fn totals(&self) -> Totals {
        let subtotal = self
            .items
            .iter()
            .map(|i| i.quantity as f64 * i.unit_price)
            .sum::<f64>();
        let discount_total = self
            .items
            .iter()
            .map(|i| i.discount.unwrap_or(0.0))
            .sum::<f64>();
        let total = self.items.iter().map(TransactionItem::subtotal).sum::<f64>();
        Totals {
            subtotal: round_money(subtotal),
            discount_total: round_money(discount_total),
            total: round_money(total),
        }
    }
}

// ---------------------------------------------------------------------------
// Local rows
// ---------------------------------------------------------------------------

/// Cached mirror of a remote product.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogItem {
    pub id: i64,
    pub name: String,
    pub sku: Option<String>,
    pub barcode: Option<String>,
    pub price: f64,
    pub cost_price: Option<f64>,
    pub stock_quantity: i64,
    pub is_active: bool,
    pub last_synced_at: String,
}

impl CatalogItem {
    pub fn from_remote(product: Product, synced_at: &str) -> Self {
        Self {
            id: product.id,
            name: product.name,
            sku: product.sku,
            barcode: product.barcode,
            price: product.price,
            cost_price: product.cost_price,
            // Stock is never cached below zero.
            stock_quantity: product.stock_quantity.max(0),
            is_active: product.is_active,
            last_synced_at: synced_at.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedCustomer {
    /// Server id; `None` for customers created while offline.
    pub remote_id: Option<i64>,
    /// Locally generated id for offline-created customers.
    pub local_id: Option<String>,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub is_local: bool,
    pub last_synced_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NewCustomer {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    Pending,
    Syncing,
    Failed,
}

impl PendingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PendingStatus::Pending => "pending",
            PendingStatus::Syncing => "syncing",
            PendingStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for PendingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PendingStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PendingStatus::Pending),
            "syncing" => Ok(PendingStatus::Syncing),
            "failed" => Ok(PendingStatus::Failed),
            other => Err(format!("unknown pending status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingTransactionLine {
    pub line_no: i64,
    pub product_id: i64,
    pub quantity: i64,
    pub unit_price: f64,
    pub discount: f64,
    pub subtotal: f64,
}

/// A sale recorded locally and not yet confirmed by the remote service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingTransaction {
    pub local_id: String,
    pub customer_id: Option<i64>,
    pub payment_method: String,
    pub subtotal: f64,
    pub discount_total: f64,
    pub total: f64,
    pub notes: Option<String>,
    pub created_at: String,
    pub attempt: i64,
    pub last_attempt_at: Option<String>,
    pub status: PendingStatus,
    pub error_message: Option<String>,
    pub lines: Vec<PendingTransactionLine>,
}

impl PendingTransaction {
    /// Rebuild the remote payload from the stored row.
    pub fn to_payload(&self) -> TransactionPayload {
        TransactionPayload {
            customer_id: self.customer_id,
            items: self
                .lines
                .iter()
                .map(|l| TransactionItem {
                    product_id: l.product_id,
                    quantity: l.quantity,
                    unit_price: l.unit_price,
                    discount: (l.discount > 0.0).then_some(l.discount),
                })
                .collect(),
            payment_method: self.payment_method.clone(),
            notes: self.notes.clone(),
        }
    }

    /// Short human label used in progress events.
    pub fn label(&self) -> String {
        let short: String = self.local_id.chars().take(8).collect();
        format!("Sale {short} ({:.2})", self.total)
    }
}

/// Read-only mirror of a recent remote transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionCacheEntry {
    pub id: i64,
    pub transaction_number: Option<String>,
    pub customer_id: Option<i64>,
    pub customer_name: Option<String>,
    pub total: f64,
    pub payment_method: Option<String>,
    pub status: Option<String>,
    pub item_count: i64,
    pub created_at: Option<String>,
    pub cached_at: String,
}

impl TransactionCacheEntry {
    pub fn from_remote(tx: RemoteTransaction, cached_at: &str) -> Self {
        Self {
            id: tx.id,
            item_count: tx.items.len() as i64,
            transaction_number: tx.transaction_number,
            customer_id: tx.customer_id,
            customer_name: tx.customer_name,
            total: tx.total,
            payment_method: tx.payment_method,
            status: tx.status,
            created_at: tx.created_at,
            cached_at: cached_at.to_string(),
        }
    }
}

/// Outcome of an offline credential check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CredentialCheck {
    pub valid: bool,
    pub profile: Option<UserProfile>,
    pub token: Option<String>,
}

impl CredentialCheck {
    pub fn invalid() -> Self {
        Self {
            valid: false,
            profile: None,
            token: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncLogEntry {
    pub id: i64,
    pub sync_type: String,
    pub status: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub synced_count: i64,
    pub failed_count: i64,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(quantity: i64, unit_price: f64, discount: Option<f64>) -> TransactionItem {
        TransactionItem {
            product_id: 1,
            quantity,
            unit_price,
            discount,
        }
    }

    #[test]
    fn totals_sum_rounded_lines() {
        let payload = TransactionPayload {
            customer_id: None,
            items: vec![item(3, 0.333, None), item(2, 5.0, Some(1.0))],
            payment_method: "cash".into(),
            notes: None,
        };
        let totals = payload.totals();
        assert_eq!(totals.discount_total, 1.0);
        assert_eq!(totals.total, round_money(1.0 + 9.0));
        let line_sum: f64 = payload.items.iter().map(TransactionItem::subtotal).sum();
        assert!((line_sum - totals.total).abs() < 1e-9);
    }

    #[test]
    fn validate_rejects_malformed_sales() {
        let mut payload = TransactionPayload {
            customer_id: None,
            items: vec![],
            payment_method: "cash".into(),
            notes: None,
        };
        assert!(matches!(payload.validate(), Err(Error::Validation(_))));

        payload.items = vec![item(0, 1.0, None)];
        assert!(payload.validate().is_err());

        payload.items = vec![item(1, -1.0, None)];
        assert!(payload.validate().is_err());

        payload.items = vec![item(1, 2.0, Some(3.0))];
        assert!(payload.validate().is_err());

        payload.items = vec![item(1, 2.0, Some(0.5))];
        payload.payment_method = "  ".into();
        assert!(payload.validate().is_err());

        payload.payment_method = "card".into();
        assert!(payload.validate().is_ok());
    }

    #[test]
    fn product_accepts_string_prices_and_camel_case() {
        let product: Product = serde_json::from_value(serde_json::json!({
            "id": 7,
            "name": "Espresso",
            "price": "2.40",
            "costPrice": 0.8,
            "stockQuantity": 12,
            "isActive": false
        }))
        .unwrap();
        assert_eq!(product.price, 2.4);
        assert_eq!(product.cost_price, Some(0.8));
        assert_eq!(product.stock_quantity, 12);
        assert!(!product.is_active);
    }

    #[test]
    fn pending_status_round_trips_through_text() {
        for status in [
            PendingStatus::Pending,
            PendingStatus::Syncing,
            PendingStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<PendingStatus>(), Ok(status));
        }
        assert!("done".parse::<PendingStatus>().is_err());
    }
}
