// ===============================
// src/ledger.rs (wallet & revenue accumulator)
// ===============================
//
// Balances and revenue totals are derived views over append-only logs.
// There is no stored balance cell anywhere; "set balance to X" appends a
// single corrective entry of X - derived(current) and nothing when the
// delta is zero. The machine-outcome "analysis" is likewise derived by
// scanning units at report time and never stored.

use chrono::{DateTime, Datelike, Utc};
use tracing::info;

use crate::domain::{
    EntryKind, GameRevenueEntry, GameTag, RevGame, WalletLedgerEntry, WALLETS,
};
use crate::store::{
    ledger_to_row, read_ledger, read_lots, read_revenue, read_units, revenue_to_row, Store,
    StoreError, RANGE_LEDGER, RANGE_REVENUE,
};

// Fixed per-win payout table by game channel.
pub const PAYOUT_HQ: i64 = 150_000;
pub const PAYOUT_QR: i64 = 57_000;
pub const PAYOUT_DB: i64 = 100_000;

pub fn wallet_balance(entries: &[WalletLedgerEntry], wallet: &str) -> i64 {
    entries.iter().filter(|e| e.wallet == wallet).map(|e| e.amount).sum()
}

pub fn balances(entries: &[WalletLedgerEntry]) -> Vec<(&'static str, i64)> {
    WALLETS.iter().map(|w| (*w, wallet_balance(entries, w))).collect()
}

/// Absolute set as one corrective `wallet_adjust` entry; zero delta writes
/// nothing. Returns the delta actually appended.
pub async fn set_wallet_balance(
    store: &dyn Store,
    wallet: &str,
    target: i64,
    chat_id: i64,
) -> Result<i64, StoreError> {
    let entries = read_ledger(store).await?;
    let current = wallet_balance(&entries, wallet);
    let delta = target - current;
    if delta == 0 {
        return Ok(0);
    }
    let entry = WalletLedgerEntry {
        ts: Utc::now(),
        wallet: wallet.to_string(),
        kind: EntryKind::WalletAdjust,
        amount: delta,
        ref_kind: String::new(),
        ref_id: String::new(),
        note: format!("set balance to {target}"),
        chat_id,
    };
    store.append_rows(RANGE_LEDGER, vec![ledger_to_row(&entry)]).await?;
    info!(wallet, target, delta, "wallet balance corrected");
    Ok(delta)
}

// ===== Revenue =====

pub fn revenue_total(entries: &[GameRevenueEntry]) -> i64 {
    entries.iter().map(|e| e.amount).sum()
}

pub fn revenue_for_game(entries: &[GameRevenueEntry], game: RevGame) -> i64 {
    entries.iter().filter(|e| e.game == game).map(|e| e.amount).sum()
}

pub fn month_key(ts: &DateTime<Utc>) -> String {
    format!("{:04}-{:02}", ts.year(), ts.month())
}

pub fn current_month_key() -> String {
    month_key(&Utc::now())
}

pub fn previous_month_key() -> String {
    let now = Utc::now();
    let (y, m) = if now.month() == 1 { (now.year() - 1, 12) } else { (now.year(), now.month() - 1) };
    format!("{y:04}-{m:02}")
}

pub fn revenue_for_month(entries: &[GameRevenueEntry], key: &str) -> i64 {
    entries.iter().filter(|e| month_key(&e.ts) == key).map(|e| e.amount).sum()
}

pub async fn append_revenue(
    store: &dyn Store,
    game: RevGame,
    amount: i64,
    note: &str,
    actor: &str,
) -> Result<(), StoreError> {
    let entry = GameRevenueEntry {
        ts: Utc::now(),
        game,
        entry_type: "manual".to_string(),
        amount,
        note: note.to_string(),
        actor: actor.to_string(),
    };
    store.append_rows(RANGE_REVENUE, vec![revenue_to_row(&entry)]).await
}

/// Absolute-total correction, mirror of `set_wallet_balance`.
pub async fn set_revenue_total(
    store: &dyn Store,
    target: i64,
    actor: &str,
) -> Result<i64, StoreError> {
    let entries = read_revenue(store).await?;
    let delta = target - revenue_total(&entries);
    if delta == 0 {
        return Ok(0);
    }
    let entry = GameRevenueEntry {
        ts: Utc::now(),
        game: RevGame::Other,
        entry_type: "adjust".to_string(),
        amount: delta,
        note: format!("set total to {target}"),
        actor: actor.to_string(),
    };
    store.append_rows(RANGE_REVENUE, vec![revenue_to_row(&entry)]).await?;
    info!(target, delta, "revenue total corrected");
    Ok(delta)
}

// ===== Machine-outcome analysis (reporting-time derivation) =====

#[derive(Debug, Clone, Copy, Default)]
pub struct Analysis {
    pub hq_count: i64,
    pub qr_count: i64,
    pub db_count: i64,
    pub game_income: i64,
    pub sell_income: i64,
    pub buy_cost: i64,
    pub net: i64,
}

/// Counts game outcomes across ALL units regardless of status: a sold unit
/// keeps its game, so "including sold" falls out of a plain scan.
pub async fn analyze(store: &dyn Store) -> Result<Analysis, StoreError> {
    let units = read_units(store).await?;
    let ledger = read_ledger(store).await?;
    let lots = read_lots(store).await?;

    let mut a = Analysis::default();
    for u in &units {
        match u.game {
            GameTag::Hq => a.hq_count += 1,
            GameTag::Qr => a.qr_count += 1,
            GameTag::Db => a.db_count += 1,
            GameTag::None => {}
        }
    }
    a.game_income = a.hq_count * PAYOUT_HQ + a.qr_count * PAYOUT_QR + a.db_count * PAYOUT_DB;
    a.sell_income = ledger
        .iter()
        .filter(|e| e.kind == EntryKind::MachineSell)
        .map(|e| e.amount)
        .sum();
    a.buy_cost = lots.iter().map(|l| l.total_price).sum();
    a.net = a.game_income + a.sell_income - a.buy_cost;
    Ok(a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BuyIntent, Segment, SegmentKind};
    use crate::inventory::{apply_buy, apply_resolve, apply_sell};
    use crate::store::MemStore;
    use chrono::TimeZone;

    fn entry(wallet: &str, kind: EntryKind, amount: i64) -> WalletLedgerEntry {
        WalletLedgerEntry {
            ts: Utc::now(),
            wallet: wallet.to_string(),
            kind,
            amount,
            ref_kind: String::new(),
            ref_id: String::new(),
            note: String::new(),
            chat_id: 0,
        }
    }

    #[test]
    fn balance_is_sum_of_signed_entries() {
        let entries = vec![
            entry("hana", EntryKind::LotBuy, -50_000),
            entry("hana", EntryKind::MachineSell, 80_000),
            entry("uri", EntryKind::MachineSell, 10_000),
            entry("hana", EntryKind::WalletAdjust, -5_000),
        ];
        assert_eq!(wallet_balance(&entries, "hana"), 25_000);
        assert_eq!(wallet_balance(&entries, "uri"), 10_000);
        assert_eq!(wallet_balance(&entries, "kt"), 0);
    }

    #[tokio::test]
    async fn absolute_set_appends_single_corrective_entry() {
        let store = MemStore::new();
        assert_eq!(set_wallet_balance(&store, "hana", 100_000, 1).await.unwrap(), 100_000);
        // setting to the current derived balance writes nothing
        assert_eq!(set_wallet_balance(&store, "hana", 100_000, 1).await.unwrap(), 0);
        let entries = read_ledger(&store).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, EntryKind::WalletAdjust);
        assert_eq!(wallet_balance(&entries, "hana"), 100_000);

        assert_eq!(set_wallet_balance(&store, "hana", 40_000, 1).await.unwrap(), -60_000);
        let entries = read_ledger(&store).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(wallet_balance(&entries, "hana"), 40_000);
    }

    #[tokio::test]
    async fn revenue_totals_and_absolute_set() {
        let store = MemStore::new();
        append_revenue(&store, RevGame::Hq, 300_000, "", "boss").await.unwrap();
        append_revenue(&store, RevGame::Qr, 57_000, "", "boss").await.unwrap();
        let entries = read_revenue(&store).await.unwrap();
        assert_eq!(revenue_total(&entries), 357_000);
        assert_eq!(revenue_for_game(&entries, RevGame::Hq), 300_000);

        assert_eq!(set_revenue_total(&store, 400_000, "boss").await.unwrap(), 43_000);
        assert_eq!(set_revenue_total(&store, 400_000, "boss").await.unwrap(), 0);
        let entries = read_revenue(&store).await.unwrap();
        assert_eq!(revenue_total(&entries), 400_000);
        assert_eq!(entries.len(), 3);
    }

    #[test]
    fn month_keys() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 31, 23, 59, 0).unwrap();
        assert_eq!(month_key(&ts), "2025-03");
        let jan = Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap();
        assert_eq!(month_key(&jan), "2025-01");
    }

    #[tokio::test]
    async fn analysis_counts_games_including_sold() {
        let store = MemStore::new();
        let intent = BuyIntent {
            qty: 3,
            model: "Samsung".to_string(),
            total_price: 50_000,
            wallet: Some("hana".to_string()),
            note: String::new(),
        };
        apply_buy(&store, &intent, "hana", 1).await.unwrap();
        apply_resolve(
            &store,
            "MA01",
            &[
                Segment { kind: SegmentKind::Loi, count: 2, game: GameTag::Hq },
                Segment { kind: SegmentKind::Loi, count: 1, game: GameTag::Db },
            ],
        )
        .await
        .unwrap();
        // selling one winner must not remove it from the game tally
        apply_sell(&store, "MA01", 1, 30_000, "tm", 1).await.unwrap();

        let a = analyze(&store).await.unwrap();
        assert_eq!(a.hq_count, 2);
        assert_eq!(a.db_count, 1);
        assert_eq!(a.game_income, 2 * PAYOUT_HQ + PAYOUT_DB);
        assert_eq!(a.sell_income, 30_000);
        assert_eq!(a.buy_cost, 50_000);
        assert_eq!(a.net, a.game_income + 30_000 - 50_000);
    }
}
