// ===============================
// src/store.rs (tabular store adapter)
// ===============================
//
// The persistent backend is a remote tabular service exposed as named
// append-mostly ranges of string rows. Core logic never sees raw rows:
// every range has an explicit column schema mapped at this boundary.
//
// Two adapters behind one trait, selected by STORE_MODE:
// - MemStore  : in-memory, STORE_MODE=mock and the test harness
// - HttpStore : reqwest against the range API, bounded timeout per call
//
// Updates are row-targeted, keyed by matching the row's first cell.

use ahash::AHashMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

use crate::domain::{
    EntryKind, GameRevenueEntry, GameTag, Lot, PhoneUnit, RevGame, UnitStatus, WalletLedgerEntry,
};
use crate::metrics::{STORE_CALLS, STORE_ERRORS};

pub type Row = Vec<String>;

pub const RANGE_LOTS: &str = "lots";
pub const RANGE_PHONES: &str = "phones";
pub const RANGE_LEDGER: &str = "wallet_ledger";
pub const RANGE_REVENUE: &str = "revenue";
pub const RANGE_SETTINGS: &str = "settings";
pub const RANGE_AUDIT: &str = "audit";

pub const SETTING_SMART_PARSE: &str = "smart_parse";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store call failed, try again: {0}")]
    Transient(String),
    #[error("bad row in range {range}: {reason}")]
    BadRow { range: &'static str, reason: String },
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn read_range(&self, range: &str) -> Result<Vec<Row>, StoreError>;
    async fn append_rows(&self, range: &str, rows: Vec<Row>) -> Result<(), StoreError>;
    /// Replace existing rows whose first cell matches each given row's first cell.
    async fn update_rows(&self, range: &str, rows: Vec<Row>) -> Result<(), StoreError>;
    async fn clear_range(&self, range: &str) -> Result<(), StoreError>;
}

// ===== In-memory adapter =====

#[derive(Default)]
pub struct MemStore {
    ranges: Mutex<AHashMap<String, Vec<Row>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn read_range(&self, range: &str) -> Result<Vec<Row>, StoreError> {
        STORE_CALLS.with_label_values(&["read"]).inc();
        Ok(self.ranges.lock().await.get(range).cloned().unwrap_or_default())
    }

    async fn append_rows(&self, range: &str, rows: Vec<Row>) -> Result<(), StoreError> {
        STORE_CALLS.with_label_values(&["append"]).inc();
        self.ranges
            .lock()
            .await
            .entry(range.to_string())
            .or_default()
            .extend(rows);
        Ok(())
    }

    async fn update_rows(&self, range: &str, rows: Vec<Row>) -> Result<(), StoreError> {
        STORE_CALLS.with_label_values(&["update"]).inc();
        let mut guard = self.ranges.lock().await;
        let existing = guard.entry(range.to_string()).or_default();
        for row in rows {
            let Some(key) = row.first().cloned() else { continue };
            if let Some(target) = existing.iter_mut().find(|r| r.first() == Some(&key)) {
                *target = row;
            }
        }
        Ok(())
    }

    async fn clear_range(&self, range: &str) -> Result<(), StoreError> {
        STORE_CALLS.with_label_values(&["clear"]).inc();
        self.ranges.lock().await.remove(range);
        Ok(())
    }
}

// ===== HTTP adapter =====

pub struct HttpStore {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RowsBody {
    rows: Vec<Row>,
}

impl HttpStore {
    pub fn new(base_url: String, api_key: Option<String>, timeout_ms: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .unwrap_or_else(|e| panic!("store http client build failed: {e}"));
        Self { client, base_url, api_key }
    }

    fn url(&self, range: &str, op: Option<&str>) -> String {
        let base = self.base_url.trim_end_matches('/');
        let range = urlencoding::encode(range);
        match op {
            Some(op) => format!("{base}/ranges/{range}/{op}"),
            None => format!("{base}/ranges/{range}"),
        }
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("X-Api-Key", key),
            None => req,
        }
    }

    async fn post_rows(&self, op: &str, range: &str, rows: Vec<Row>) -> Result<(), StoreError> {
        STORE_CALLS.with_label_values(&[op]).inc();
        let resp = self
            .authed(self.client.post(self.url(range, Some(op))))
            .json(&serde_json::json!({ "rows": rows }))
            .send()
            .await
            .map_err(|e| {
                STORE_ERRORS.with_label_values(&[op]).inc();
                StoreError::Transient(e.to_string())
            })?;
        if !resp.status().is_success() {
            STORE_ERRORS.with_label_values(&[op]).inc();
            return Err(StoreError::Transient(format!("{op} {range}: http {}", resp.status())));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for HttpStore {
    async fn read_range(&self, range: &str) -> Result<Vec<Row>, StoreError> {
        STORE_CALLS.with_label_values(&["read"]).inc();
        let resp = self
            .authed(self.client.get(self.url(range, None)))
            .send()
            .await
            .map_err(|e| {
                STORE_ERRORS.with_label_values(&["read"]).inc();
                StoreError::Transient(e.to_string())
            })?;
        if !resp.status().is_success() {
            STORE_ERRORS.with_label_values(&["read"]).inc();
            return Err(StoreError::Transient(format!("read {range}: http {}", resp.status())));
        }
        let body: RowsBody = resp.json().await.map_err(|e| {
            STORE_ERRORS.with_label_values(&["read"]).inc();
            StoreError::Transient(e.to_string())
        })?;
        Ok(body.rows)
    }

    async fn append_rows(&self, range: &str, rows: Vec<Row>) -> Result<(), StoreError> {
        self.post_rows("append", range, rows).await
    }

    async fn update_rows(&self, range: &str, rows: Vec<Row>) -> Result<(), StoreError> {
        self.post_rows("update", range, rows).await
    }

    async fn clear_range(&self, range: &str) -> Result<(), StoreError> {
        self.post_rows("clear", range, Vec::new()).await
    }
}

// ===== Row schemas =====
//
// lots          : code | created_at | qty | model | total_price | unit_price | wallet | note
// phones        : id | lot_code | created_at | unit_price | status | game | note
// wallet_ledger : ts | wallet | kind | amount | ref_kind | ref_id | note | chat_id
// revenue       : ts | game | entry_type | amount | note | actor
// settings      : key | value
// audit         : ts | chat_id | actor | action | detail

fn cell<'a>(row: &'a Row, idx: usize, range: &'static str) -> Result<&'a str, StoreError> {
    row.get(idx).map(String::as_str).ok_or(StoreError::BadRow {
        range,
        reason: format!("missing column {idx}"),
    })
}

fn parse_ts(s: &str, range: &'static str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::BadRow { range, reason: format!("bad timestamp {s:?}: {e}") })
}

fn parse_i64(s: &str, range: &'static str) -> Result<i64, StoreError> {
    s.parse().map_err(|_| StoreError::BadRow { range, reason: format!("bad integer {s:?}") })
}

pub fn lot_to_row(lot: &Lot) -> Row {
    vec![
        lot.code.clone(),
        lot.created_at.to_rfc3339(),
        lot.qty.to_string(),
        lot.model.clone(),
        lot.total_price.to_string(),
        lot.unit_price.to_string(),
        lot.wallet.clone(),
        lot.note.clone(),
    ]
}

pub fn lot_from_row(row: &Row) -> Result<Lot, StoreError> {
    const R: &str = RANGE_LOTS;
    Ok(Lot {
        code: cell(row, 0, R)?.to_string(),
        created_at: parse_ts(cell(row, 1, R)?, R)?,
        qty: parse_i64(cell(row, 2, R)?, R)?,
        model: cell(row, 3, R)?.to_string(),
        total_price: parse_i64(cell(row, 4, R)?, R)?,
        unit_price: parse_i64(cell(row, 5, R)?, R)?,
        wallet: cell(row, 6, R)?.to_string(),
        note: cell(row, 7, R)?.to_string(),
    })
}

pub fn unit_to_row(unit: &PhoneUnit) -> Row {
    vec![
        unit.id.clone(),
        unit.lot_code.clone(),
        unit.created_at.to_rfc3339(),
        unit.unit_price.to_string(),
        unit.status.as_str().to_string(),
        unit.game.as_str().to_string(),
        unit.note.clone(),
    ]
}

pub fn unit_from_row(row: &Row) -> Result<PhoneUnit, StoreError> {
    const R: &str = RANGE_PHONES;
    let status = cell(row, 4, R)?;
    let game = cell(row, 5, R)?;
    Ok(PhoneUnit {
        id: cell(row, 0, R)?.to_string(),
        lot_code: cell(row, 1, R)?.to_string(),
        created_at: parse_ts(cell(row, 2, R)?, R)?,
        unit_price: parse_i64(cell(row, 3, R)?, R)?,
        status: UnitStatus::parse(status).ok_or(StoreError::BadRow {
            range: R,
            reason: format!("bad status {status:?}"),
        })?,
        game: GameTag::parse(game).ok_or(StoreError::BadRow {
            range: R,
            reason: format!("bad game {game:?}"),
        })?,
        note: cell(row, 6, R)?.to_string(),
    })
}

pub fn ledger_to_row(e: &WalletLedgerEntry) -> Row {
    vec![
        e.ts.to_rfc3339(),
        e.wallet.clone(),
        e.kind.as_str().to_string(),
        e.amount.to_string(),
        e.ref_kind.clone(),
        e.ref_id.clone(),
        e.note.clone(),
        e.chat_id.to_string(),
    ]
}

pub fn ledger_from_row(row: &Row) -> Result<WalletLedgerEntry, StoreError> {
    const R: &str = RANGE_LEDGER;
    let kind = cell(row, 2, R)?;
    Ok(WalletLedgerEntry {
        ts: parse_ts(cell(row, 0, R)?, R)?,
        wallet: cell(row, 1, R)?.to_string(),
        kind: EntryKind::parse(kind).ok_or(StoreError::BadRow {
            range: R,
            reason: format!("bad kind {kind:?}"),
        })?,
        amount: parse_i64(cell(row, 3, R)?, R)?,
        ref_kind: cell(row, 4, R)?.to_string(),
        ref_id: cell(row, 5, R)?.to_string(),
        note: cell(row, 6, R)?.to_string(),
        chat_id: parse_i64(cell(row, 7, R)?, R)?,
    })
}

pub fn revenue_to_row(e: &GameRevenueEntry) -> Row {
    vec![
        e.ts.to_rfc3339(),
        e.game.as_str().to_string(),
        e.entry_type.clone(),
        e.amount.to_string(),
        e.note.clone(),
        e.actor.clone(),
    ]
}

pub fn revenue_from_row(row: &Row) -> Result<GameRevenueEntry, StoreError> {
    const R: &str = RANGE_REVENUE;
    let game = cell(row, 1, R)?;
    Ok(GameRevenueEntry {
        ts: parse_ts(cell(row, 0, R)?, R)?,
        game: RevGame::parse(game).ok_or(StoreError::BadRow {
            range: R,
            reason: format!("bad game {game:?}"),
        })?,
        entry_type: cell(row, 2, R)?.to_string(),
        amount: parse_i64(cell(row, 3, R)?, R)?,
        note: cell(row, 4, R)?.to_string(),
        actor: cell(row, 5, R)?.to_string(),
    })
}

pub fn audit_row(chat_id: i64, actor: &str, action: &str, detail: &str) -> Row {
    vec![
        Utc::now().to_rfc3339(),
        chat_id.to_string(),
        actor.to_string(),
        action.to_string(),
        detail.to_string(),
    ]
}

// ===== Typed range reads (skip rows a manual edit broke, keep going) =====

pub async fn read_lots(store: &dyn Store) -> Result<Vec<Lot>, StoreError> {
    let rows = store.read_range(RANGE_LOTS).await?;
    Ok(rows
        .iter()
        .filter_map(|r| match lot_from_row(r) {
            Ok(l) => Some(l),
            Err(e) => {
                warn!(%e, "skipping unreadable lot row");
                None
            }
        })
        .collect())
}

pub async fn read_units(store: &dyn Store) -> Result<Vec<PhoneUnit>, StoreError> {
    let rows = store.read_range(RANGE_PHONES).await?;
    Ok(rows
        .iter()
        .filter_map(|r| match unit_from_row(r) {
            Ok(u) => Some(u),
            Err(e) => {
                warn!(%e, "skipping unreadable phone row");
                None
            }
        })
        .collect())
}

pub async fn read_ledger(store: &dyn Store) -> Result<Vec<WalletLedgerEntry>, StoreError> {
    let rows = store.read_range(RANGE_LEDGER).await?;
    Ok(rows
        .iter()
        .filter_map(|r| match ledger_from_row(r) {
            Ok(e) => Some(e),
            Err(e) => {
                warn!(%e, "skipping unreadable ledger row");
                None
            }
        })
        .collect())
}

pub async fn read_revenue(store: &dyn Store) -> Result<Vec<GameRevenueEntry>, StoreError> {
    let rows = store.read_range(RANGE_REVENUE).await?;
    Ok(rows
        .iter()
        .filter_map(|r| match revenue_from_row(r) {
            Ok(e) => Some(e),
            Err(e) => {
                warn!(%e, "skipping unreadable revenue row");
                None
            }
        })
        .collect())
}

// ===== Settings (key/value pairs in their own range) =====

pub async fn setting_get(store: &dyn Store, key: &str) -> Result<Option<String>, StoreError> {
    let rows = store.read_range(RANGE_SETTINGS).await?;
    Ok(rows
        .into_iter()
        .find(|r| r.first().map(String::as_str) == Some(key))
        .and_then(|r| r.get(1).cloned()))
}

pub async fn setting_set(store: &dyn Store, key: &str, value: &str) -> Result<(), StoreError> {
    let row = vec![key.to_string(), value.to_string()];
    let exists = setting_get(store, key).await?.is_some();
    if exists {
        store.update_rows(RANGE_SETTINGS, vec![row]).await
    } else {
        store.append_rows(RANGE_SETTINGS, vec![row]).await
    }
}

// ===== Fault-injection double (test builds only) =====

/// Delegates to a MemStore except for one op/range pair, which fails with
/// a transient error. Lets the failure-path write orderings be exercised.
#[cfg(test)]
pub(crate) struct FaultyStore {
    inner: MemStore,
    fail_op: &'static str,
    fail_range: &'static str,
}

#[cfg(test)]
impl FaultyStore {
    pub(crate) fn failing(fail_op: &'static str, fail_range: &'static str) -> Self {
        Self { inner: MemStore::new(), fail_op, fail_range }
    }

    fn gate(&self, op: &str, range: &str) -> Result<(), StoreError> {
        if op == self.fail_op && range == self.fail_range {
            return Err(StoreError::Transient("simulated outage".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
#[async_trait]
impl Store for FaultyStore {
    async fn read_range(&self, range: &str) -> Result<Vec<Row>, StoreError> {
        self.gate("read", range)?;
        self.inner.read_range(range).await
    }

    async fn append_rows(&self, range: &str, rows: Vec<Row>) -> Result<(), StoreError> {
        self.gate("append", range)?;
        self.inner.append_rows(range, rows).await
    }

    async fn update_rows(&self, range: &str, rows: Vec<Row>) -> Result<(), StoreError> {
        self.gate("update", range)?;
        self.inner.update_rows(range, rows).await
    }

    async fn clear_range(&self, range: &str) -> Result<(), StoreError> {
        self.gate("clear", range)?;
        self.inner.clear_range(range).await
    }
}
