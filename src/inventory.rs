// ===============================
// src/inventory.rs (lot & unit state machine)
// ===============================
//
// Owns the lifecycle of lots and phone units:
// - apply_buy     : assign next lot code, fan out units, charge the wallet
// - apply_resolve : per-unit outcome allocation (status/game only, no money)
// - apply_sell    : mark units sold, credit the wallet
//
// Write ordering fails safe: sell appends the ledger entry before patching
// unit rows (a failed patch leaves income over-reported, never silently
// sold inventory); buy fans out rows first and reports a partial buy if the
// wallet charge cannot be appended afterwards.

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::{
    BuyIntent, EntryKind, GameTag, Lot, PhoneUnit, Segment, SegmentKind, UnitStatus,
    WalletLedgerEntry,
};
use crate::parser::has_ungamed_win;
use crate::store::{
    ledger_to_row, lot_to_row, read_lots, read_units, unit_to_row, Store, StoreError, RANGE_LEDGER,
    RANGE_LOTS, RANGE_PHONES,
};

#[derive(Debug, Error)]
pub enum OpError {
    #[error("lot {0} has no units")]
    NotFound(String),
    #[error("lot {0} is already sold out")]
    SoldOut(String),
    #[error("a win segment is missing its game tag")]
    NeedsGame,
    #[error("lot {0} was created but the {1} wallet entry failed; balance needs a manual check")]
    PartialBuy(String, String),
    #[error("sale of lot {0} was charged but the unit patch failed; re-check unit statuses")]
    PartialSell(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy)]
pub struct SegOutcome {
    pub kind: SegmentKind,
    pub game: GameTag,
    pub requested: i64,
    pub applied: i64,
}

#[derive(Debug, Clone)]
pub struct SellReceipt {
    pub sold_ids: Vec<String>,
    pub requested: i64,
}

/// Next sequential code: max existing MA<n> + 1, starting at 1. Codes are
/// never reused, even after a lot's units are all sold.
pub fn next_lot_code(lots: &[Lot]) -> String {
    let max = lots
        .iter()
        .filter_map(|l| l.code.strip_prefix("MA")?.parse::<u32>().ok())
        .max()
        .unwrap_or(0);
    format!("MA{:02}", max + 1)
}

pub async fn apply_buy(
    store: &dyn Store,
    intent: &BuyIntent,
    wallet: &str,
    chat_id: i64,
) -> Result<Lot, OpError> {
    let lots = read_lots(store).await?;
    let code = next_lot_code(&lots);
    let now = Utc::now();
    let unit_price = ((intent.total_price as f64) / (intent.qty as f64)).round() as i64;

    let lot = Lot {
        code: code.clone(),
        created_at: now,
        qty: intent.qty,
        model: intent.model.clone(),
        total_price: intent.total_price,
        unit_price,
        wallet: wallet.to_string(),
        note: intent.note.clone(),
    };
    store.append_rows(RANGE_LOTS, vec![lot_to_row(&lot)]).await?;

    let units: Vec<PhoneUnit> = (1..=intent.qty)
        .map(|i| PhoneUnit {
            id: format!("{code}-{i}"),
            lot_code: code.clone(),
            created_at: now,
            unit_price,
            status: UnitStatus::New,
            game: GameTag::None,
            note: intent.note.clone(),
        })
        .collect();
    store
        .append_rows(RANGE_PHONES, units.iter().map(unit_to_row).collect())
        .await?;

    // Purchase is a cash outflow against the funding wallet.
    let entry = WalletLedgerEntry {
        ts: now,
        wallet: wallet.to_string(),
        kind: EntryKind::LotBuy,
        amount: -intent.total_price,
        ref_kind: "lot".to_string(),
        ref_id: code.clone(),
        note: intent.note.clone(),
        chat_id,
    };
    if let Err(e) = store.append_rows(RANGE_LEDGER, vec![ledger_to_row(&entry)]).await {
        warn!(%e, lot = %code, "buy: ledger append failed after unit fan-out");
        return Err(OpError::PartialBuy(code, wallet.to_string()));
    }

    info!(lot = %code, qty = lot.qty, total = lot.total_price, wallet, "lot created");
    Ok(lot)
}

/// Apply ordered outcome segments to a lot's units.
///
/// Allocation per segment: prefer `new` units, then any not-sold unit, in
/// storage order; a unit touched by an earlier segment of the same command
/// is never re-taken. Requests beyond availability under-fulfil silently.
/// Never writes to ledgers: win money is derived at report time.
pub async fn apply_resolve(
    store: &dyn Store,
    lot_code: &str,
    segments: &[Segment],
) -> Result<Vec<SegOutcome>, OpError> {
    // lot existence outranks the missing-game complaint
    let all = read_units(store).await?;
    let mut mine: Vec<PhoneUnit> = all.into_iter().filter(|u| u.lot_code == lot_code).collect();
    if mine.is_empty() {
        return Err(OpError::NotFound(lot_code.to_string()));
    }
    if has_ungamed_win(segments) {
        return Err(OpError::NeedsGame);
    }

    let mut taken = vec![false; mine.len()];
    let mut outcomes = Vec::with_capacity(segments.len());

    for seg in segments {
        let mut remaining = seg.count;
        let mut applied = 0i64;
        for pass in 0..2 {
            if remaining == 0 {
                break;
            }
            for (i, unit) in mine.iter_mut().enumerate() {
                if remaining == 0 {
                    break;
                }
                if taken[i] {
                    continue;
                }
                let eligible = match pass {
                    0 => unit.status == UnitStatus::New,
                    _ => unit.status != UnitStatus::Sold,
                };
                if !eligible {
                    continue;
                }
                taken[i] = true;
                match seg.kind {
                    SegmentKind::Loi => {
                        unit.status = UnitStatus::Loi;
                        unit.game = seg.game;
                    }
                    SegmentKind::Lo => {
                        unit.status = UnitStatus::Lo;
                        unit.game = GameTag::None;
                    }
                    SegmentKind::Hue => {
                        unit.status = UnitStatus::Hue;
                        unit.game = GameTag::None;
                    }
                }
                applied += 1;
                remaining -= 1;
            }
        }
        outcomes.push(SegOutcome { kind: seg.kind, game: seg.game, requested: seg.count, applied });
    }

    let updates: Vec<_> = mine
        .iter()
        .enumerate()
        .filter(|(i, _)| taken[*i])
        .map(|(_, u)| unit_to_row(u))
        .collect();
    if !updates.is_empty() {
        store.update_rows(RANGE_PHONES, updates).await?;
    }

    info!(lot = %lot_code, segments = outcomes.len(), "resolve applied");
    Ok(outcomes)
}

pub async fn apply_sell(
    store: &dyn Store,
    lot_code: &str,
    qty: i64,
    total_price: i64,
    wallet: &str,
    chat_id: i64,
) -> Result<SellReceipt, OpError> {
    let all = read_units(store).await?;
    let mut mine: Vec<PhoneUnit> = all.into_iter().filter(|u| u.lot_code == lot_code).collect();
    if mine.is_empty() {
        return Err(OpError::NotFound(lot_code.to_string()));
    }

    let mut order: Vec<usize> = (0..mine.len())
        .filter(|&i| mine[i].status != UnitStatus::Sold)
        .collect();
    if order.is_empty() {
        return Err(OpError::SoldOut(lot_code.to_string()));
    }
    // least informational value goes first, then storage order
    order.sort_by_key(|&i| (mine[i].status.sell_priority(), i));
    let chosen: Vec<usize> = order.into_iter().take(qty.max(0) as usize).collect();

    // Ledger entry must be durable before any status flips.
    let entry = WalletLedgerEntry {
        ts: Utc::now(),
        wallet: wallet.to_string(),
        kind: EntryKind::MachineSell,
        amount: total_price,
        ref_kind: "lot".to_string(),
        ref_id: lot_code.to_string(),
        note: String::new(),
        chat_id,
    };
    store.append_rows(RANGE_LEDGER, vec![ledger_to_row(&entry)]).await?;

    let mut sold_ids = Vec::with_capacity(chosen.len());
    for &i in &chosen {
        mine[i].status = UnitStatus::Sold;
        // game is deliberately untouched: post-sale analysis still counts it
        sold_ids.push(mine[i].id.clone());
    }
    let rows: Vec<_> = chosen.iter().map(|&i| unit_to_row(&mine[i])).collect();
    if let Err(e) = store.update_rows(RANGE_PHONES, rows).await {
        warn!(%e, lot = %lot_code, "sell: unit patch failed after ledger append");
        return Err(OpError::PartialSell(lot_code.to_string()));
    }

    info!(lot = %lot_code, sold = sold_ids.len(), total = total_price, wallet, "sell applied");
    Ok(SellReceipt { sold_ids, requested: qty })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::wallet_balance;
    use crate::store::{read_ledger, FaultyStore, MemStore};

    fn buy_intent(qty: i64, total: i64) -> BuyIntent {
        BuyIntent {
            qty,
            model: "Samsung".to_string(),
            total_price: total,
            wallet: Some("hana".to_string()),
            note: String::new(),
        }
    }

    fn seg(kind: SegmentKind, count: i64, game: GameTag) -> Segment {
        Segment { kind, count, game }
    }

    #[tokio::test]
    async fn buy_fans_out_units_and_charges_wallet() {
        let store = MemStore::new();
        let lot = apply_buy(&store, &buy_intent(3, 50_000), "hana", 7).await.unwrap();
        assert_eq!(lot.code, "MA01");
        assert_eq!(lot.unit_price, 16_667); // round(50000/3)

        let units = read_units(&store).await.unwrap();
        assert_eq!(units.len(), 3);
        assert!(units.iter().all(|u| u.status == UnitStatus::New && u.game == GameTag::None));
        assert_eq!(units[0].id, "MA01-1");
        assert_eq!(units[2].id, "MA01-3");

        let ledger = read_ledger(&store).await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].amount, -50_000);
        assert_eq!(wallet_balance(&ledger, "hana"), -50_000);

        // codes are monotonically assigned
        let lot2 = apply_buy(&store, &buy_intent(1, 10_000), "uri", 7).await.unwrap();
        assert_eq!(lot2.code, "MA02");
    }

    #[tokio::test]
    async fn resolve_allocates_in_segment_order_and_clamps() {
        let store = MemStore::new();
        apply_buy(&store, &buy_intent(5, 100_000), "hana", 1).await.unwrap();

        let outcomes = apply_resolve(
            &store,
            "MA01",
            &[
                seg(SegmentKind::Lo, 2, GameTag::None),
                seg(SegmentKind::Loi, 10, GameTag::Hq),
            ],
        )
        .await
        .unwrap();

        assert_eq!(outcomes[0].applied, 2);
        assert_eq!(outcomes[1].applied, 3); // clamped to availability

        let units = read_units(&store).await.unwrap();
        let lo = units.iter().filter(|u| u.status == UnitStatus::Lo).count();
        let loi_hq = units
            .iter()
            .filter(|u| u.status == UnitStatus::Loi && u.game == GameTag::Hq)
            .count();
        assert_eq!(lo, 2);
        assert_eq!(loi_hq, 3);
    }

    #[tokio::test]
    async fn resolve_requires_game_on_win_segments() {
        let store = MemStore::new();
        apply_buy(&store, &buy_intent(2, 20_000), "kt", 1).await.unwrap();
        let err = apply_resolve(&store, "MA01", &[seg(SegmentKind::Loi, 1, GameTag::None)])
            .await
            .unwrap_err();
        assert!(matches!(err, OpError::NeedsGame));
    }

    #[tokio::test]
    async fn resolve_unknown_lot_is_not_found() {
        let store = MemStore::new();
        let err = apply_resolve(&store, "MA09", &[seg(SegmentKind::Lo, 1, GameTag::None)])
            .await
            .unwrap_err();
        assert!(matches!(err, OpError::NotFound(_)));
    }

    #[tokio::test]
    async fn sell_keeps_game_and_credits_wallet() {
        let store = MemStore::new();
        apply_buy(&store, &buy_intent(1, 10_000), "hana", 1).await.unwrap();
        apply_resolve(&store, "MA01", &[seg(SegmentKind::Loi, 1, GameTag::Hq)])
            .await
            .unwrap();

        let receipt = apply_sell(&store, "MA01", 1, 30_000, "tm", 1).await.unwrap();
        assert_eq!(receipt.sold_ids, vec!["MA01-1".to_string()]);

        let units = read_units(&store).await.unwrap();
        assert_eq!(units[0].status, UnitStatus::Sold);
        assert_eq!(units[0].game, GameTag::Hq); // survives the sale

        let ledger = read_ledger(&store).await.unwrap();
        assert_eq!(wallet_balance(&ledger, "tm"), 30_000);
        assert_eq!(wallet_balance(&ledger, "hana"), -10_000);
    }

    #[tokio::test]
    async fn sell_prefers_least_informative_units() {
        let store = MemStore::new();
        apply_buy(&store, &buy_intent(4, 40_000), "hana", 1).await.unwrap();
        // MA01-1 -> loi/hq, MA01-2 -> lo, MA01-3 -> hue, MA01-4 stays new
        apply_resolve(
            &store,
            "MA01",
            &[
                seg(SegmentKind::Loi, 1, GameTag::Hq),
                seg(SegmentKind::Lo, 1, GameTag::None),
                seg(SegmentKind::Hue, 1, GameTag::None),
            ],
        )
        .await
        .unwrap();

        let receipt = apply_sell(&store, "MA01", 2, 60_000, "hana", 1).await.unwrap();
        assert_eq!(receipt.sold_ids, vec!["MA01-4".to_string(), "MA01-3".to_string()]);
    }

    #[tokio::test]
    async fn sell_under_fulfils_and_reports_sold_out() {
        let store = MemStore::new();
        apply_buy(&store, &buy_intent(2, 20_000), "hana", 1).await.unwrap();

        let receipt = apply_sell(&store, "MA01", 10, 50_000, "hana", 1).await.unwrap();
        assert_eq!(receipt.sold_ids.len(), 2);
        assert_eq!(receipt.requested, 10);

        let err = apply_sell(&store, "MA01", 1, 5_000, "hana", 1).await.unwrap_err();
        assert!(matches!(err, OpError::SoldOut(_)));
    }

    #[tokio::test]
    async fn resolve_checks_lot_before_game_tags() {
        let store = MemStore::new();
        // a game-less win on an unknown lot is a not-found, not a game prompt
        let err = apply_resolve(&store, "MA09", &[seg(SegmentKind::Loi, 1, GameTag::None)])
            .await
            .unwrap_err();
        assert!(matches!(err, OpError::NotFound(_)));
    }

    #[tokio::test]
    async fn sell_ledger_survives_failed_unit_patch() {
        let store = FaultyStore::failing("update", RANGE_PHONES);
        apply_buy(&store, &buy_intent(2, 20_000), "hana", 1).await.unwrap();

        let err = apply_sell(&store, "MA01", 1, 30_000, "uri", 1).await.unwrap_err();
        assert!(matches!(err, OpError::PartialSell(_)));

        // the sale money is already durable even though no unit flipped
        let ledger = read_ledger(&store).await.unwrap();
        assert_eq!(wallet_balance(&ledger, "uri"), 30_000);
        let units = read_units(&store).await.unwrap();
        assert!(units.iter().all(|u| u.status != UnitStatus::Sold));
    }

    #[tokio::test]
    async fn buy_partial_when_ledger_append_fails() {
        let store = FaultyStore::failing("append", RANGE_LEDGER);

        let err = apply_buy(&store, &buy_intent(3, 30_000), "hana", 1).await.unwrap_err();
        assert!(matches!(err, OpError::PartialBuy(_, _)));

        // lot and units are in place, only the wallet charge is missing
        assert_eq!(read_lots(&store).await.unwrap().len(), 1);
        assert_eq!(read_units(&store).await.unwrap().len(), 3);
        assert!(read_ledger(&store).await.unwrap().is_empty());
    }
}
