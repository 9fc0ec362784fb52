// ===============================
// src/handler.rs (conversation state machine)
// ===============================
//
// One worker task per chat consumes that chat's messages in order, so all
// session-mutating work for a chat is serialized by construction. Shared
// read-modify-write sequences against the store (lot code assignment, unit
// patches, balance corrections) additionally take `Ctx::write_lock`.
//
// Transition rule: a message is first offered to the active session's
// current step; if the step rejects it, the top-level recognizers run and
// any hit replaces the session (last command wins, no queuing); otherwise
// the step re-prompts without discarding state. The reset passphrase is the
// one exception: a wrong passphrase clears the session instead of
// re-prompting.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::config::Config;
use crate::domain::{
    BuyIntent, Event, GameTag, Inbound, Outbound, Parsed, ResolveIntent, RevGame, SegmentKind,
    SellIntent, UnitStatus, WALLETS,
};
use crate::inventory::{apply_buy, apply_resolve, apply_sell, OpError};
use crate::ledger::{
    analyze, balances, current_month_key, previous_month_key, revenue_for_game, revenue_for_month,
    revenue_total, set_revenue_total, set_wallet_balance, append_revenue,
};
use crate::metrics::{COMMANDS, MESSAGES, PARSE_FAIL, SESSIONS_OPENED};
use crate::normalize::{extract_money_from_text, normalize_for_parse, parse_money};
use crate::parser::{parse_buy, parse_lot_code, parse_resolve, parse_sell, parse_wallet, BUY_KEYWORD};
use crate::session::{Flow, Session, SessionData, Step};
use crate::store::{
    audit_row, read_ledger, read_revenue, read_units, setting_get, setting_set, Store,
    RANGE_AUDIT, RANGE_LEDGER, RANGE_LOTS, RANGE_PHONES, RANGE_REVENUE, SETTING_SMART_PARSE,
};

pub struct Ctx {
    pub cfg: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub out_tx: mpsc::Sender<Outbound>,
    pub rec_tx: mpsc::Sender<Event>,
    /// Serializes read-modify-write sequences against the store across chats.
    pub write_lock: Mutex<()>,
}

impl Ctx {
    async fn say(&self, chat_id: i64, text: impl Into<String>) {
        let text = text.into();
        let _ = self.rec_tx.try_send(Event::Out { chat_id, text: text.clone() });
        let _ = self.out_tx.send(Outbound { chat_id, text, keyboard: None }).await;
    }

    async fn say_kb(&self, chat_id: i64, text: impl Into<String>, keyboard: Vec<Vec<String>>) {
        let text = text.into();
        let _ = self.rec_tx.try_send(Event::Out { chat_id, text: text.clone() });
        let _ = self.out_tx.send(Outbound { chat_id, text, keyboard: Some(keyboard) }).await;
    }

    /// Best-effort audit append; never blocks or fails the primary write.
    fn audit(&self, chat_id: i64, actor: &str, action: &str, detail: &str) {
        let store = self.store.clone();
        let row = audit_row(chat_id, actor, action, detail);
        tokio::spawn(async move {
            if let Err(e) = store.append_rows(RANGE_AUDIT, vec![row]).await {
                warn!(%e, "audit append failed");
            }
        });
    }

    fn record_op(&self, chat_id: i64, action: &str, detail: String) {
        let _ = self.rec_tx.try_send(Event::Op { chat_id, action: action.to_string(), detail });
    }
}

enum StepResult {
    Consumed,
    NoMatch,
}

pub async fn run_chat(ctx: Arc<Ctx>, chat_id: i64, mut rx: mpsc::Receiver<Inbound>) {
    let mut session: Option<Session> = None;
    while let Some(msg) = rx.recv().await {
        MESSAGES.inc();
        let _ = ctx.rec_tx.try_send(Event::In(msg.clone()));
        if !handle(&ctx, &mut session, &msg).await {
            PARSE_FAIL.inc();
            ctx.say(chat_id, "Khong hieu. Gui 'menu' de xem lenh.").await;
        }
    }
    info!(chat = chat_id, "chat worker stopped");
}

/// Single entry point per message. Returns whether the message was consumed.
pub async fn handle(ctx: &Ctx, session: &mut Option<Session>, msg: &Inbound) -> bool {
    if session.is_some() {
        if let StepResult::Consumed = advance_session(ctx, session, msg).await {
            return true;
        }
    }
    if top_level(ctx, session, msg).await.is_some() {
        return true;
    }
    if let Some(sess) = session.as_ref() {
        // no match at the current step and no superseding command: re-prompt
        reprompt(ctx, msg.chat_id, sess).await;
        return true;
    }
    false
}

// ===== Top-level commands =====

async fn top_level(ctx: &Ctx, session: &mut Option<Session>, msg: &Inbound) -> Option<()> {
    let norm = normalize_for_parse(&msg.text);
    let first = norm.split_whitespace().next().unwrap_or("");
    let chat = msg.chat_id;

    match norm.as_str() {
        "menu" | "help" => {
            *session = None;
            COMMANDS.with_label_values(&["menu"]).inc();
            ctx.say_kb(chat, menu_text(), menu_keyboard()).await;
            return Some(());
        }
        "huy" | "cancel" => {
            *session = None;
            ctx.say(chat, "Da huy.").await;
            return Some(());
        }
        "so du" => {
            COMMANDS.with_label_values(&["balance"]).inc();
            report_balances(ctx, chat).await;
            *session = None;
            return Some(());
        }
        "phan tich" | "bao cao" => {
            COMMANDS.with_label_values(&["analysis"]).inc();
            report_analysis(ctx, chat).await;
            *session = None;
            return Some(());
        }
        "doanh thu" => {
            COMMANDS.with_label_values(&["revenue"]).inc();
            report_revenue(ctx, chat).await;
            *session = None;
            return Some(());
        }
        "sua doanh thu" => {
            COMMANDS.with_label_values(&["revenue_edit"]).inc();
            open_session(session, Session::new(Flow::RevenueEdit, Step::Amount, SessionData::Empty));
            ctx.say(chat, "Tong doanh thu moi?").await;
            return Some(());
        }
        "sua vi" | "vi" => {
            COMMANDS.with_label_values(&["wallet_edit"]).inc();
            open_session(session, Session::new(Flow::WalletEdit, Step::Wallet, SessionData::Empty));
            ctx.say_kb(chat, "Sua vi nao?", wallet_keyboard()).await;
            return Some(());
        }
        "smart on" | "smart off" => {
            *session = None;
            let on = norm.ends_with("on");
            let v = if on { "1" } else { "0" };
            match setting_set(ctx.store.as_ref(), SETTING_SMART_PARSE, v).await {
                Ok(()) => ctx.say(chat, format!("Smart parse: {}", if on { "ON" } else { "OFF" })).await,
                Err(e) => ctx.say(chat, e.to_string()).await,
            }
            return Some(());
        }
        "reset" => {
            if ctx.cfg.reset_pass_sha256.is_none() {
                ctx.say(chat, "Reset chua duoc cau hinh.").await;
                return Some(());
            }
            COMMANDS.with_label_values(&["reset"]).inc();
            open_session(session, Session::new(Flow::Reset, Step::Pass, SessionData::Empty));
            ctx.say(chat, "Nhap mat khau reset (sai 1 lan la huy):").await;
            return Some(());
        }
        "ds may" | "danh sach" | "danh sach may" => {
            COMMANDS.with_label_values(&["phone_list"]).inc();
            report_phone_list(ctx, session, chat, None).await;
            return Some(());
        }
        _ => {}
    }

    // dt <game> <amount> : manual revenue append
    if first == "dt" {
        let toks: Vec<&str> = norm.split_whitespace().collect();
        let game = toks.get(1).and_then(|t| RevGame::parse(t));
        let amount = extract_money_from_text(&msg.text);
        match (game, amount) {
            (Some(game), Some(amount)) => {
                COMMANDS.with_label_values(&["revenue_add"]).inc();
                match append_revenue(ctx.store.as_ref(), game, amount, "", &msg.user).await {
                    Ok(()) => {
                        ctx.audit(chat, &msg.user, "revenue_add", &format!("{} {amount}", game.as_str()));
                        ctx.say(chat, format!("Da ghi doanh thu {} +{amount}.", game.as_str())).await;
                    }
                    Err(e) => ctx.say(chat, e.to_string()).await,
                }
            }
            _ => ctx.say(chat, "Dung: dt <hq|qr|db|other> <so tien>").await,
        }
        *session = None;
        return Some(());
    }

    // explicit buy: the keyword leads the sentence
    if first == BUY_KEYWORD {
        COMMANDS.with_label_values(&["buy"]).inc();
        run_buy(ctx, session, msg, parse_buy(&msg.text)).await;
        return Some(());
    }

    match parse_sell(&msg.text) {
        Parsed::Hit(intent) => {
            COMMANDS.with_label_values(&["sell"]).inc();
            continue_sell(ctx, session, msg, intent).await;
            return Some(());
        }
        Parsed::Incomplete => {
            COMMANDS.with_label_values(&["sell"]).inc();
            open_session(session, Session::new(Flow::Sell, Step::Sentence, SessionData::Empty));
            ctx.say(chat, "Ban thieu ma lo hoac so tien. Vd: ban 2 ma01 500k uri").await;
            return Some(());
        }
        Parsed::Miss => {}
    }

    if let Parsed::Hit(intent) = parse_resolve(&msg.text) {
        COMMANDS.with_label_values(&["resolve"]).inc();
        run_resolve(ctx, session, msg, intent).await;
        return Some(());
    }

    // smart parse: free text still tried against the buy recognizer
    if smart_enabled(ctx).await {
        match parse_buy(&msg.text) {
            Parsed::Hit(intent) => {
                COMMANDS.with_label_values(&["buy"]).inc();
                continue_buy(ctx, session, msg, intent).await;
                return Some(());
            }
            Parsed::Incomplete => {
                COMMANDS.with_label_values(&["buy"]).inc();
                open_session(session, Session::new(Flow::BuyLot, Step::Sentence, SessionData::Empty));
                ctx.say(chat, "Mua thieu so tien. Vd: mua 3ss 50k hana").await;
                return Some(());
            }
            Parsed::Miss => {}
        }
    }

    None
}

// ===== Session advancement =====

async fn advance_session(ctx: &Ctx, session: &mut Option<Session>, msg: &Inbound) -> StepResult {
    let Some(sess) = session.clone() else { return StepResult::NoMatch };
    let chat = msg.chat_id;
    let norm = normalize_for_parse(&msg.text);

    match (sess.flow, sess.step) {
        (Flow::BuyLot, Step::Sentence) => match parse_buy(&msg.text) {
            Parsed::Hit(intent) => {
                continue_buy(ctx, session, msg, intent).await;
                StepResult::Consumed
            }
            Parsed::Incomplete => {
                ctx.say(chat, "Van thieu so tien. Vd: mua 3ss 50k").await;
                StepResult::Consumed
            }
            Parsed::Miss => StepResult::NoMatch,
        },
        (Flow::BuyLot, Step::Wallet) => {
            let Some(wallet) = parse_wallet(&msg.text) else { return StepResult::NoMatch };
            let SessionData::Buy(mut intent) = sess.data else { return StepResult::NoMatch };
            intent.wallet = Some(wallet);
            continue_buy(ctx, session, msg, intent).await;
            StepResult::Consumed
        }
        (Flow::BuyLot, Step::Note) => {
            if looks_like_command(&msg.text) {
                return StepResult::NoMatch;
            }
            let SessionData::Buy(mut intent) = sess.data else { return StepResult::NoMatch };
            if !is_skip(&norm) {
                intent.note = msg.text.trim().to_string();
            }
            finish_buy(ctx, session, msg, intent).await;
            StepResult::Consumed
        }
        (Flow::Sell, Step::Sentence) => match parse_sell(&msg.text) {
            Parsed::Hit(intent) => {
                continue_sell(ctx, session, msg, intent).await;
                StepResult::Consumed
            }
            Parsed::Incomplete => {
                ctx.say(chat, "Van thieu ma lo hoac so tien. Vd: ban 2 ma01 500k").await;
                StepResult::Consumed
            }
            Parsed::Miss => StepResult::NoMatch,
        },
        (Flow::Sell, Step::Wallet) => {
            let Some(wallet) = parse_wallet(&msg.text) else { return StepResult::NoMatch };
            let SessionData::Sell(mut intent) = sess.data else { return StepResult::NoMatch };
            intent.wallet = Some(wallet);
            finish_sell(ctx, session, msg, intent).await;
            StepResult::Consumed
        }
        (Flow::ResolveGame, Step::Pick) => {
            let Some(game) = GameTag::parse(norm.as_str()).filter(|g| *g != GameTag::None) else {
                return StepResult::NoMatch;
            };
            let SessionData::Resolve(mut intent) = sess.data else { return StepResult::NoMatch };
            // the pick applies to every game-less win segment of the command
            for seg in intent.segments.iter_mut() {
                if seg.kind == SegmentKind::Loi && seg.game == GameTag::None {
                    seg.game = game;
                }
            }
            finish_resolve(ctx, session, msg, intent).await;
            StepResult::Consumed
        }
        (Flow::WalletEdit, Step::Wallet) => {
            let Some(wallet) = parse_wallet(&msg.text) else { return StepResult::NoMatch };
            *session = Some(Session::new(Flow::WalletEdit, Step::Amount, SessionData::WalletPick(wallet.clone())));
            ctx.say(chat, format!("So du moi cua vi {wallet}?")).await;
            StepResult::Consumed
        }
        (Flow::WalletEdit, Step::Amount) => {
            if looks_like_command(&msg.text) {
                return StepResult::NoMatch;
            }
            let Some(target) = parse_amount_reply(&msg.text) else { return StepResult::NoMatch };
            let SessionData::WalletPick(wallet) = sess.data else { return StepResult::NoMatch };
            let _guard = ctx.write_lock.lock().await;
            match set_wallet_balance(ctx.store.as_ref(), &wallet, target, chat).await {
                Ok(0) => ctx.say(chat, format!("Vi {wallet} da o muc {target}, khong ghi gi.")).await,
                Ok(delta) => {
                    ctx.audit(chat, &msg.user, "wallet_set", &format!("{wallet} -> {target} ({delta:+})"));
                    ctx.record_op(chat, "wallet_set", format!("{wallet} -> {target}"));
                    ctx.say(chat, format!("Vi {wallet} = {target} (dieu chinh {delta:+}).")).await;
                }
                Err(e) => ctx.say(chat, e.to_string()).await,
            }
            *session = None;
            StepResult::Consumed
        }
        (Flow::RevenueEdit, Step::Amount) => {
            if looks_like_command(&msg.text) {
                return StepResult::NoMatch;
            }
            let Some(target) = parse_amount_reply(&msg.text) else { return StepResult::NoMatch };
            let _guard = ctx.write_lock.lock().await;
            match set_revenue_total(ctx.store.as_ref(), target, &msg.user).await {
                Ok(0) => ctx.say(chat, format!("Doanh thu da o muc {target}, khong ghi gi.")).await,
                Ok(delta) => {
                    ctx.audit(chat, &msg.user, "revenue_set", &format!("-> {target} ({delta:+})"));
                    ctx.record_op(chat, "revenue_set", format!("-> {target}"));
                    ctx.say(chat, format!("Doanh thu = {target} (dieu chinh {delta:+}).")).await;
                }
                Err(e) => ctx.say(chat, e.to_string()).await,
            }
            *session = None;
            StepResult::Consumed
        }
        (Flow::Reset, Step::Pass) => {
            // one-shot gate: a wrong passphrase clears the session, no retry
            let ok = ctx
                .cfg
                .reset_pass_sha256
                .as_deref()
                .map(|want| hex::encode(Sha256::digest(msg.text.trim().as_bytes())) == want.to_lowercase())
                .unwrap_or(false);
            *session = None;
            if !ok {
                warn!(chat, "reset refused: bad passphrase");
                ctx.say(chat, "Sai mat khau. Reset bi huy.").await;
                return StepResult::Consumed;
            }
            run_reset(ctx, msg).await;
            StepResult::Consumed
        }
        (Flow::PhoneList, Step::FilterLot) => {
            let Some(code) = parse_lot_code(&msg.text) else { return StepResult::NoMatch };
            report_phone_list(ctx, session, chat, Some(code)).await;
            StepResult::Consumed
        }
        _ => StepResult::NoMatch,
    }
}

async fn reprompt(ctx: &Ctx, chat: i64, sess: &Session) {
    match (sess.flow, sess.step) {
        (_, Step::Wallet) => ctx.say_kb(chat, "Chon vi:", wallet_keyboard()).await,
        (_, Step::Pick) => ctx.say_kb(chat, "Game nao? (hq/qr/db)", game_keyboard()).await,
        (_, Step::Amount) => ctx.say(chat, "Nhap so tien:").await,
        (_, Step::Note) => ctx.say(chat, "Ghi chu? ('bo qua' de bo)").await,
        (Flow::Sell, Step::Sentence) => ctx.say(chat, "Vd: ban 2 ma01 500k uri").await,
        (_, Step::Sentence) => ctx.say(chat, "Vd: mua 3ss 50k hana").await,
        (_, Step::FilterLot) => ctx.say(chat, "Gui ma lo (vd ma01) de loc.").await,
        (_, Step::Pass) => {}
    }
}

// ===== Buy flow =====

async fn run_buy(ctx: &Ctx, session: &mut Option<Session>, msg: &Inbound, parsed: Parsed<BuyIntent>) {
    match parsed {
        Parsed::Hit(intent) => continue_buy(ctx, session, msg, intent).await,
        _ => {
            open_session(session, Session::new(Flow::BuyLot, Step::Sentence, SessionData::Empty));
            ctx.say(msg.chat_id, "Mua thieu so tien. Vd: mua 3ss 50k hana").await;
        }
    }
}

async fn continue_buy(ctx: &Ctx, session: &mut Option<Session>, msg: &Inbound, intent: BuyIntent) {
    if intent.wallet.is_none() {
        open_session(session, Session::new(Flow::BuyLot, Step::Wallet, SessionData::Buy(intent)));
        ctx.say_kb(msg.chat_id, "Lay tien tu vi nao?", wallet_keyboard()).await;
        return;
    }
    if intent.note.is_empty() {
        open_session(session, Session::new(Flow::BuyLot, Step::Note, SessionData::Buy(intent)));
        ctx.say(msg.chat_id, "Ghi chu cho lo nay? ('bo qua' de bo)").await;
        return;
    }
    finish_buy(ctx, session, msg, intent).await;
}

async fn finish_buy(ctx: &Ctx, session: &mut Option<Session>, msg: &Inbound, intent: BuyIntent) {
    let chat = msg.chat_id;
    let wallet = intent.wallet.clone().unwrap_or_default();
    let _guard = ctx.write_lock.lock().await;
    match apply_buy(ctx.store.as_ref(), &intent, &wallet, chat).await {
        Ok(lot) => {
            ctx.audit(chat, &msg.user, "buy", &format!("{} {}x{} {}", lot.code, lot.qty, lot.model, lot.total_price));
            ctx.record_op(chat, "buy", format!("{} qty={} total={}", lot.code, lot.qty, lot.total_price));
            ctx.say(
                chat,
                format!(
                    "Da nhap lo {}: {} x {} @ {} (tong {}), vi {}.",
                    lot.code, lot.qty, lot.model, lot.unit_price, lot.total_price, wallet
                ),
            )
            .await;
        }
        Err(e) => ctx.say(chat, e.to_string()).await,
    }
    *session = None;
}

// ===== Sell flow =====

async fn continue_sell(ctx: &Ctx, session: &mut Option<Session>, msg: &Inbound, intent: SellIntent) {
    if intent.wallet.is_none() {
        open_session(session, Session::new(Flow::Sell, Step::Wallet, SessionData::Sell(intent)));
        ctx.say_kb(msg.chat_id, "Tien ban vao vi nao?", wallet_keyboard()).await;
        return;
    }
    finish_sell(ctx, session, msg, intent).await;
}

async fn finish_sell(ctx: &Ctx, session: &mut Option<Session>, msg: &Inbound, intent: SellIntent) {
    let chat = msg.chat_id;
    let wallet = intent.wallet.clone().unwrap_or_default();
    let _guard = ctx.write_lock.lock().await;
    match apply_sell(ctx.store.as_ref(), &intent.lot_code, intent.qty, intent.total_price, &wallet, chat).await {
        Ok(receipt) => {
            let sold = receipt.sold_ids.len() as i64;
            ctx.audit(chat, &msg.user, "sell", &format!("{} x{} {}", intent.lot_code, sold, intent.total_price));
            ctx.record_op(chat, "sell", format!("{} sold={} total={}", intent.lot_code, sold, intent.total_price));
            let mut text = format!(
                "Da ban {} may lo {} duoc {}, vao vi {}.",
                sold, intent.lot_code, intent.total_price, wallet
            );
            if sold < receipt.requested {
                text.push_str(&format!(" (chi con {sold} may)"));
            }
            ctx.say(chat, text).await;
        }
        Err(e) => ctx.say(chat, e.to_string()).await,
    }
    *session = None;
}

// ===== Resolve flow =====

async fn run_resolve(ctx: &Ctx, session: &mut Option<Session>, msg: &Inbound, intent: ResolveIntent) {
    if intent.segments.is_empty() {
        // bare lot code: show the lot instead of applying a no-op resolve
        report_phone_list(ctx, session, msg.chat_id, Some(intent.lot_code)).await;
        return;
    }
    if crate::parser::has_ungamed_win(&intent.segments) {
        // not-found outranks the game question, so check the lot first
        match read_units(ctx.store.as_ref()).await {
            Ok(units) if !units.iter().any(|u| u.lot_code == intent.lot_code) => {
                ctx.say(msg.chat_id, OpError::NotFound(intent.lot_code).to_string()).await;
                return;
            }
            Err(e) => {
                ctx.say(msg.chat_id, e.to_string()).await;
                return;
            }
            Ok(_) => {}
        }
        open_session(session, Session::new(Flow::ResolveGame, Step::Pick, SessionData::Resolve(intent)));
        ctx.say_kb(msg.chat_id, "Loi game nao? (ap cho tat ca loi chua co game)", game_keyboard()).await;
        return;
    }
    finish_resolve(ctx, session, msg, intent).await;
}

async fn finish_resolve(ctx: &Ctx, session: &mut Option<Session>, msg: &Inbound, intent: ResolveIntent) {
    let chat = msg.chat_id;
    let _guard = ctx.write_lock.lock().await;
    match apply_resolve(ctx.store.as_ref(), &intent.lot_code, &intent.segments).await {
        Ok(outcomes) => {
            let detail: Vec<String> = outcomes
                .iter()
                .map(|o| {
                    let kind = match o.kind {
                        SegmentKind::Loi => "loi",
                        SegmentKind::Lo => "lo",
                        SegmentKind::Hue => "hue",
                    };
                    let game = if o.game == GameTag::None { String::new() } else { format!("/{}", o.game.as_str()) };
                    format!("{kind}{game} {}/{}", o.applied, o.requested)
                })
                .collect();
            let detail = detail.join(", ");
            ctx.audit(chat, &msg.user, "resolve", &format!("{}: {detail}", intent.lot_code));
            ctx.record_op(chat, "resolve", format!("{}: {detail}", intent.lot_code));
            ctx.say(chat, format!("Chot lo {}: {detail}.", intent.lot_code)).await;
        }
        Err(e) => ctx.say(chat, e.to_string()).await,
    }
    *session = None;
}

// ===== Reports =====

async fn report_balances(ctx: &Ctx, chat: i64) {
    match read_ledger(ctx.store.as_ref()).await {
        Ok(entries) => {
            let lines: Vec<String> = balances(&entries)
                .into_iter()
                .map(|(w, b)| format!("{w}: {b}"))
                .collect();
            ctx.say(chat, format!("So du vi:\n{}", lines.join("\n"))).await;
        }
        Err(e) => ctx.say(chat, e.to_string()).await,
    }
}

async fn report_analysis(ctx: &Ctx, chat: i64) {
    match analyze(ctx.store.as_ref()).await {
        Ok(a) => {
            ctx.say(
                chat,
                format!(
                    "Phan tich may (tinh ca may da ban):\nhq: {} | qr: {} | db: {}\nTien game: {}\nTien ban may: {}\nTien nhap lo: {}\nNet: {}",
                    a.hq_count, a.qr_count, a.db_count, a.game_income, a.sell_income, a.buy_cost, a.net
                ),
            )
            .await;
        }
        Err(e) => ctx.say(chat, e.to_string()).await,
    }
}

async fn report_revenue(ctx: &Ctx, chat: i64) {
    match read_revenue(ctx.store.as_ref()).await {
        Ok(entries) => {
            let cur = current_month_key();
            let prev = previous_month_key();
            ctx.say(
                chat,
                format!(
                    "Doanh thu: {}\nhq: {} | qr: {} | db: {} | khac: {}\nThang {}: {}\nThang {}: {}",
                    revenue_total(&entries),
                    revenue_for_game(&entries, RevGame::Hq),
                    revenue_for_game(&entries, RevGame::Qr),
                    revenue_for_game(&entries, RevGame::Db),
                    revenue_for_game(&entries, RevGame::Other),
                    cur,
                    revenue_for_month(&entries, &cur),
                    prev,
                    revenue_for_month(&entries, &prev),
                ),
            )
            .await;
        }
        Err(e) => ctx.say(chat, e.to_string()).await,
    }
}

async fn report_phone_list(ctx: &Ctx, session: &mut Option<Session>, chat: i64, filter: Option<String>) {
    match read_units(ctx.store.as_ref()).await {
        Ok(units) => {
            if let Some(code) = filter {
                let mine: Vec<_> = units.iter().filter(|u| u.lot_code == code).collect();
                if mine.is_empty() {
                    ctx.say(chat, format!("Lo {code} khong co may.")).await;
                } else {
                    let lines: Vec<String> = mine
                        .iter()
                        .map(|u| {
                            let game = if u.game == GameTag::None { String::new() } else { format!(" {}", u.game.as_str()) };
                            format!("{} {}{}", u.id, u.status.as_str(), game)
                        })
                        .collect();
                    ctx.say(chat, format!("Lo {code}:\n{}", lines.join("\n"))).await;
                }
                *session = None;
                return;
            }

            if units.is_empty() {
                ctx.say(chat, "Chua co may nao.").await;
                *session = None;
                return;
            }
            let mut codes: Vec<String> = Vec::new();
            let mut lines: Vec<String> = Vec::new();
            for u in &units {
                if !codes.contains(&u.lot_code) {
                    codes.push(u.lot_code.clone());
                }
            }
            for code in &codes {
                let mine: Vec<_> = units.iter().filter(|u| &u.lot_code == code).collect();
                let count = |s: UnitStatus| mine.iter().filter(|u| u.status == s).count();
                lines.push(format!(
                    "{code}: {} may ({} new, {} loi, {} lo, {} hue, {} sold)",
                    mine.len(),
                    count(UnitStatus::New),
                    count(UnitStatus::Loi),
                    count(UnitStatus::Lo),
                    count(UnitStatus::Hue),
                    count(UnitStatus::Sold),
                ));
            }
            let kb: Vec<Vec<String>> = codes.chunks(3).map(|c| c.to_vec()).collect();
            open_session(session, Session::new(Flow::PhoneList, Step::FilterLot, SessionData::Empty));
            ctx.say_kb(chat, format!("Danh sach may:\n{}\nGui ma lo de xem chi tiet.", lines.join("\n")), kb).await;
        }
        Err(e) => ctx.say(chat, e.to_string()).await,
    }
}

// ===== Reset =====

async fn run_reset(ctx: &Ctx, msg: &Inbound) {
    let chat = msg.chat_id;
    let _guard = ctx.write_lock.lock().await;
    for range in [RANGE_LOTS, RANGE_PHONES, RANGE_REVENUE, RANGE_LEDGER, RANGE_AUDIT] {
        if let Err(e) = ctx.store.clear_range(range).await {
            ctx.say(chat, e.to_string()).await;
            return;
        }
    }
    warn!(chat, user = %msg.user, "full data reset executed");
    ctx.record_op(chat, "reset", "all ranges cleared".to_string());
    ctx.say(chat, "Da xoa toan bo du lieu.").await;
}

// ===== Helpers =====

fn open_session(session: &mut Option<Session>, next: Session) {
    SESSIONS_OPENED.inc();
    *session = Some(next);
}

fn is_skip(norm: &str) -> bool {
    matches!(norm, "bo qua" | "." | "khong" | "ko" | "skip")
}

/// Free-text steps (note, amounts) must not swallow a fresh command.
fn looks_like_command(text: &str) -> bool {
    let norm = normalize_for_parse(text);
    let first = norm.split_whitespace().next().unwrap_or("");
    if matches!(first, "mua" | "ban" | "dt" | "menu" | "help" | "reset" | "huy" | "cancel") {
        return true;
    }
    matches!(
        norm.as_str(),
        "so du" | "phan tich" | "bao cao" | "doanh thu" | "sua doanh thu" | "sua vi" | "vi"
            | "ds may" | "danh sach" | "danh sach may" | "smart on" | "smart off"
    ) || parse_lot_code(text).is_some()
}

fn parse_amount_reply(text: &str) -> Option<i64> {
    let t = text.trim();
    let (neg, t) = match t.strip_prefix('-') {
        Some(rest) => (true, rest.trim()),
        None => (false, t),
    };
    let v = parse_money(t).or_else(|| extract_money_from_text(t))?;
    Some(if neg { -v } else { v })
}

async fn smart_enabled(ctx: &Ctx) -> bool {
    match setting_get(ctx.store.as_ref(), SETTING_SMART_PARSE).await {
        Ok(Some(v)) => v != "0",
        Ok(None) => ctx.cfg.smart_parse_default,
        Err(e) => {
            warn!(%e, "settings read failed, using default");
            ctx.cfg.smart_parse_default
        }
    }
}

fn wallet_keyboard() -> Vec<Vec<String>> {
    WALLETS.chunks(2).map(|c| c.iter().map(|w| w.to_string()).collect()).collect()
}

fn game_keyboard() -> Vec<Vec<String>> {
    vec![vec!["hq".to_string(), "qr".to_string(), "db".to_string()]]
}

fn menu_keyboard() -> Vec<Vec<String>> {
    vec![
        vec!["so du".to_string(), "phan tich".to_string(), "doanh thu".to_string()],
        vec!["ds may".to_string(), "sua vi".to_string(), "sua doanh thu".to_string()],
    ]
}

fn menu_text() -> String {
    [
        "Lenh:",
        "  mua <sl><model> <tien> [vi] [ghi chu]",
        "  ban <sl> <ma lo> <tien> [vi]",
        "  <ma lo> loi/lo/hue ... (chot lo)",
        "  so du | phan tich | doanh thu | ds may",
        "  dt <game> <tien> | sua vi | sua doanh thu",
        "  smart on/off | reset | huy",
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, StoreMode};
    use crate::domain::GameTag;
    use crate::inventory::apply_buy;
    use crate::store::{read_lots, FaultyStore, MemStore};

    fn test_ctx() -> (Arc<Ctx>, mpsc::Receiver<Outbound>, mpsc::Receiver<Event>) {
        test_ctx_with(Arc::new(MemStore::new()))
    }

    fn test_ctx_with(
        store: Arc<dyn Store>,
    ) -> (Arc<Ctx>, mpsc::Receiver<Outbound>, mpsc::Receiver<Event>) {
        let (out_tx, out_rx) = mpsc::channel(64);
        let (rec_tx, rec_rx) = mpsc::channel(256);
        let cfg = Config {
            store_mode: StoreMode::Mock,
            store_base_url: String::new(),
            store_api_key: None,
            store_timeout_ms: 1000,
            metrics_port: 0,
            record_file: None,
            reset_pass_sha256: Some(hex::encode(Sha256::digest(b"secret"))),
            smart_parse_default: true,
            stdin_chat_id: 1,
        };
        let ctx = Arc::new(Ctx {
            cfg: Arc::new(cfg),
            store,
            out_tx,
            rec_tx,
            write_lock: Mutex::new(()),
        });
        (ctx, out_rx, rec_rx)
    }

    fn msg(text: &str) -> Inbound {
        Inbound { chat_id: 1, user: "boss".to_string(), text: text.to_string() }
    }

    #[tokio::test]
    async fn buy_flow_collects_wallet_and_note() {
        let (ctx, mut out_rx, _rec) = test_ctx();
        let mut session = None;

        assert!(handle(&ctx, &mut session, &msg("mua 3ss 50k")).await);
        let ask_wallet = out_rx.recv().await.unwrap();
        assert!(ask_wallet.keyboard.is_some());

        assert!(handle(&ctx, &mut session, &msg("hana")).await);
        out_rx.recv().await.unwrap(); // note prompt

        assert!(handle(&ctx, &mut session, &msg("bo qua")).await);
        let done = out_rx.recv().await.unwrap();
        assert!(done.text.contains("MA01"));
        assert!(session.is_none());

        let lots = read_lots(ctx.store.as_ref()).await.unwrap();
        assert_eq!(lots.len(), 1);
        assert_eq!(lots[0].wallet, "hana");
        assert_eq!(lots[0].total_price, 50_000);
    }

    #[tokio::test]
    async fn resolve_disambiguation_applies_to_all_ungamed_segments() {
        let (ctx, mut out_rx, _rec) = test_ctx();
        let mut session = None;
        let intent = BuyIntent {
            qty: 3,
            model: "Samsung".to_string(),
            total_price: 30_000,
            wallet: Some("hana".to_string()),
            note: "x".to_string(),
        };
        apply_buy(ctx.store.as_ref(), &intent, "hana", 1).await.unwrap();

        // two ungamed win segments around a loss
        assert!(handle(&ctx, &mut session, &msg("ma1 loi 1 tach 1 loi 1")).await);
        let ask = out_rx.recv().await.unwrap();
        assert!(ask.keyboard.is_some());
        assert!(session.is_some());

        assert!(handle(&ctx, &mut session, &msg("hq")).await);
        assert!(session.is_none());

        let units = read_units(ctx.store.as_ref()).await.unwrap();
        let loi_hq = units
            .iter()
            .filter(|u| u.status == UnitStatus::Loi && u.game == GameTag::Hq)
            .count();
        let lo = units.iter().filter(|u| u.status == UnitStatus::Lo).count();
        assert_eq!(loi_hq, 2);
        assert_eq!(lo, 1);
    }

    #[tokio::test]
    async fn top_level_command_supersedes_session() {
        let (ctx, mut out_rx, _rec) = test_ctx();
        let mut session = None;

        assert!(handle(&ctx, &mut session, &msg("mua 3ss 50k")).await);
        out_rx.recv().await.unwrap();
        assert!(session.is_some());

        // balance report replaces the pending buy (last command wins)
        assert!(handle(&ctx, &mut session, &msg("so du")).await);
        let reply = out_rx.recv().await.unwrap();
        assert!(reply.text.contains("hana"));
        assert!(session.is_none());
    }

    #[tokio::test]
    async fn reset_passphrase_is_one_shot() {
        let (ctx, mut out_rx, _rec) = test_ctx();
        let mut session = None;
        let intent = BuyIntent {
            qty: 1,
            model: "LG".to_string(),
            total_price: 10_000,
            wallet: Some("kt".to_string()),
            note: "x".to_string(),
        };
        apply_buy(ctx.store.as_ref(), &intent, "kt", 1).await.unwrap();

        assert!(handle(&ctx, &mut session, &msg("reset")).await);
        out_rx.recv().await.unwrap();

        // wrong passphrase clears the session instead of re-prompting
        assert!(handle(&ctx, &mut session, &msg("nope")).await);
        assert!(session.is_none());
        assert_eq!(read_lots(ctx.store.as_ref()).await.unwrap().len(), 1);

        assert!(handle(&ctx, &mut session, &msg("reset")).await);
        out_rx.recv().await.unwrap();
        assert!(handle(&ctx, &mut session, &msg("secret")).await);
        assert!(read_lots(ctx.store.as_ref()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn smart_parse_gates_free_text_buy() {
        let (ctx, mut out_rx, _rec) = test_ctx();
        let mut session = None;

        setting_set(ctx.store.as_ref(), SETTING_SMART_PARSE, "0").await.unwrap();
        assert!(!handle(&ctx, &mut session, &msg("sang nay mua 2 ip 300000")).await);

        setting_set(ctx.store.as_ref(), SETTING_SMART_PARSE, "1").await.unwrap();
        assert!(handle(&ctx, &mut session, &msg("sang nay mua 2 ip 300000")).await);
        out_rx.recv().await.unwrap();
        assert!(session.is_some()); // wallet step

        // explicit leading "mua" works regardless of the flag
        setting_set(ctx.store.as_ref(), SETTING_SMART_PARSE, "0").await.unwrap();
        let mut s2 = None;
        assert!(handle(&ctx, &mut s2, &msg("mua 1 ss 20k")).await);
    }

    #[tokio::test]
    async fn sell_not_found_and_sold_out_replies() {
        let (ctx, mut out_rx, _rec) = test_ctx();
        let mut session = None;

        assert!(handle(&ctx, &mut session, &msg("ban ma05 500k uri")).await);
        let reply = out_rx.recv().await.unwrap();
        assert!(reply.text.contains("MA05"));
        assert!(session.is_none());
    }

    #[tokio::test]
    async fn smart_toggle_supersedes_session() {
        let (ctx, mut out_rx, _rec) = test_ctx();
        let mut session = None;

        assert!(handle(&ctx, &mut session, &msg("mua 3ss 50k")).await);
        out_rx.recv().await.unwrap();
        assert!(session.is_some());

        assert!(handle(&ctx, &mut session, &msg("smart off")).await);
        assert!(session.is_none());
    }

    #[tokio::test]
    async fn resolve_unknown_lot_reports_before_game_prompt() {
        let (ctx, mut out_rx, _rec) = test_ctx();
        let mut session = None;

        // ungamed win on a lot that does not exist: no game keyboard
        assert!(handle(&ctx, &mut session, &msg("ma9 loi 1")).await);
        let reply = out_rx.recv().await.unwrap();
        assert!(reply.text.contains("MA09"));
        assert!(reply.keyboard.is_none());
        assert!(session.is_none());
    }

    #[tokio::test]
    async fn store_outage_surfaces_try_again() {
        let (ctx, mut out_rx, _rec) =
            test_ctx_with(Arc::new(FaultyStore::failing("read", RANGE_LEDGER)));
        let mut session = None;

        assert!(handle(&ctx, &mut session, &msg("so du")).await);
        let reply = out_rx.recv().await.unwrap();
        assert!(reply.text.contains("try again"));
    }
}
