// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Known cash wallets. Balance of each is derived from the ledger, never stored.
pub const WALLETS: [&str; 4] = ["hana", "uri", "kt", "tm"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitStatus { New, Loi, Lo, Hue, Sold }
impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self { UnitStatus::New => "new", UnitStatus::Loi => "loi", UnitStatus::Lo => "lo", UnitStatus::Hue => "hue", UnitStatus::Sold => "sold" }
    }
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(UnitStatus::New),
            "loi" => Some(UnitStatus::Loi),
            "lo" => Some(UnitStatus::Lo),
            "hue" => Some(UnitStatus::Hue),
            "sold" => Some(UnitStatus::Sold),
            _ => None,
        }
    }
    /// Sell picks the least informative units first.
    pub fn sell_priority(&self) -> u8 {
        match self { UnitStatus::New => 0, UnitStatus::Hue => 1, UnitStatus::Lo => 2, UnitStatus::Loi => 3, UnitStatus::Sold => 4 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameTag { None, Hq, Qr, Db }
impl GameTag {
    pub fn as_str(&self) -> &'static str {
        match self { GameTag::None => "", GameTag::Hq => "hq", GameTag::Qr => "qr", GameTag::Db => "db" }
    }
    pub fn parse(s: &str) -> Option<Self> {
        match s { "" => Some(GameTag::None), "hq" => Some(GameTag::Hq), "qr" => Some(GameTag::Qr), "db" => Some(GameTag::Db), _ => None }
    }
}

/// Game tag on the self-reported revenue log (wider than the unit tag: has `other`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevGame { Hq, Qr, Db, Other }
impl RevGame {
    pub fn as_str(&self) -> &'static str {
        match self { RevGame::Hq => "hq", RevGame::Qr => "qr", RevGame::Db => "db", RevGame::Other => "other" }
    }
    pub fn parse(s: &str) -> Option<Self> {
        match s { "hq" => Some(RevGame::Hq), "qr" => Some(RevGame::Qr), "db" => Some(RevGame::Db), "other" => Some(RevGame::Other), _ => None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind { LotBuy, MachineSell, WalletAdjust }
impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self { EntryKind::LotBuy => "lot_buy", EntryKind::MachineSell => "machine_sell", EntryKind::WalletAdjust => "wallet_adjust" }
    }
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "lot_buy" => Some(EntryKind::LotBuy),
            "machine_sell" => Some(EntryKind::MachineSell),
            "wallet_adjust" => Some(EntryKind::WalletAdjust),
            _ => None,
        }
    }
}

/// One purchase batch. Immutable after creation (only the note is display-edited).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lot {
    pub code: String,         // "MA" + zero-padded number, never reused
    pub created_at: DateTime<Utc>,
    pub qty: i64,             // 1..=50
    pub model: String,
    pub total_price: i64,
    pub unit_price: i64,      // round(total/qty), copied to units at fan-out
    pub wallet: String,
    pub note: String,
}

/// One physical unit, id = "<lotCode>-<index>", index 1..qty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhoneUnit {
    pub id: String,
    pub lot_code: String,
    pub created_at: DateTime<Utc>,
    pub unit_price: i64,
    pub status: UnitStatus,
    pub game: GameTag,
    pub note: String,
}

/// Append-only signed cash movement. Wallet balance = sum over entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletLedgerEntry {
    pub ts: DateTime<Utc>,
    pub wallet: String,
    pub kind: EntryKind,
    pub amount: i64,          // signed: buy negative, sell positive
    pub ref_kind: String,     // e.g. "lot"
    pub ref_id: String,       // e.g. "MA03"
    pub note: String,
    pub chat_id: i64,
}

/// Append-only self-reported revenue, decoupled from unit outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameRevenueEntry {
    pub ts: DateTime<Utc>,
    pub game: RevGame,
    pub entry_type: String,   // "manual" | "adjust"
    pub amount: i64,
    pub note: String,
    pub actor: String,
}

// ===== Parsed intents =====

/// Recognizer outcome: keyword matched and mandatory fields extracted (Hit),
/// keyword matched but a mandatory field is missing (Incomplete), or the
/// keyword is absent (Miss -> fall through to the next recognizer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed<T> { Hit(T), Incomplete, Miss }

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuyIntent {
    pub qty: i64,
    pub model: String,
    pub total_price: i64,
    pub wallet: Option<String>,  // absent is valid, resolved by the session flow
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SellIntent {
    pub lot_code: String,
    pub qty: i64,
    pub total_price: i64,
    pub wallet: Option<String>,
    pub model: String,           // informational only
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind { Loi, Lo, Hue }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub kind: SegmentKind,
    pub count: i64,              // clamped 0..=50
    pub game: GameTag,           // None on lo/hue; None on loi -> needs disambiguation
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveIntent {
    pub lot_code: String,
    pub segments: Vec<Segment>,
}

// ===== Transport boundary =====

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inbound { pub chat_id: i64, pub user: String, pub text: String }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outbound {
    pub chat_id: i64,
    pub text: String,
    pub keyboard: Option<Vec<Vec<String>>>,
}

/// Recorder events (JSONL).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    In(Inbound),
    Out { chat_id: i64, text: String },
    Op { chat_id: i64, action: String, detail: String },
    Note(String),
}
