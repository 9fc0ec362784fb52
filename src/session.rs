// ===============================
// src/session.rs (per-chat conversation state)
// ===============================
//
// A session carries a command across messages when the first message could
// not complete it (missing wallet, ungamed win, confirmation passphrase).
// One session per chat, owned by that chat's worker task; destroyed on
// completion, cancellation or supersession by a fresh top-level command.

use crate::domain::{BuyIntent, ResolveIntent, SellIntent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    BuyLot,
    Sell,
    ResolveGame,
    WalletEdit,
    RevenueEdit,
    Reset,
    PhoneList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Sentence,
    Wallet,
    Note,
    Pick,
    Amount,
    Pass,
    FilterLot,
}

/// Partially-built command riding along with the flow.
#[derive(Debug, Clone)]
pub enum SessionData {
    Empty,
    Buy(BuyIntent),
    Sell(SellIntent),
    Resolve(ResolveIntent),
    WalletPick(String),
}

#[derive(Debug, Clone)]
pub struct Session {
    pub flow: Flow,
    pub step: Step,
    pub data: SessionData,
}

impl Session {
    pub fn new(flow: Flow, step: Step, data: SessionData) -> Self {
        Self { flow, step, data }
    }
}
