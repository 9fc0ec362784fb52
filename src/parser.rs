// ===============================
// src/parser.rs (shorthand command interpreter)
// ===============================
//
// Three independent recognizers over the owner's shorthand:
// - parse_buy     : "mua 3ss 50k hana ghi chu..."
// - parse_sell    : "ban 2 ma01 500k uri"
// - parse_resolve : "ma01 loi 2 may hq tach 1 hue"
//
// Each returns Hit / Incomplete (keyword matched, mandatory field missing)
// / Miss (keyword absent). The grammar is closed and deterministic; token
// tables below are data, new shorthand goes into the tables.

use once_cell::sync::Lazy;
use regex::Regex;
use std::ops::Range;

use crate::domain::{BuyIntent, GameTag, Parsed, ResolveIntent, Segment, SegmentKind, SellIntent};
use crate::normalize::{cut_span, extract_money_spanned, normalize_for_parse};

pub const BUY_KEYWORD: &str = "mua";
pub const SELL_KEYWORD: &str = "ban";

// Ordered: first hit wins.
const MODEL_KEYWORDS: [(&str, &str); 13] = [
    ("samsung", "Samsung"),
    ("ss", "Samsung"),
    ("sam", "Samsung"),
    ("iphone", "iPhone"),
    ("ip", "iPhone"),
    ("lg", "LG"),
    ("oppo", "Oppo"),
    ("vivo", "Vivo"),
    ("xiaomi", "Xiaomi"),
    ("mi", "Xiaomi"),
    ("redmi", "Redmi"),
    ("nokia", "Nokia"),
    ("pixel", "Pixel"),
];

const WALLET_KEYWORDS: [(&str, &str); 7] = [
    ("hana", "hana"),
    ("hn", "hana"),
    ("uri", "uri"),
    ("kt", "kt"),
    ("tien mat", "tm"),
    ("tienmat", "tm"),
    ("tm", "tm"),
];

const WIN_WORDS: [&str; 2] = ["loi", "lai"];
const LOSS_WORDS: [&str; 2] = ["tach", "lo"];
const EVEN_WORDS: [&str; 3] = ["hue", "hoa", "von"];
const FILLER_WORDS: [&str; 2] = ["may", "dt"]; // "unit(s)" fillers after a win count

static LOT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bma\s*(?:so\s*)?(\d{1,3})\b").unwrap());
static FUSED_SS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d+ ?ss\b").unwrap());
static FUSED_IP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d+ ?ip\b").unwrap());

fn has_word(norm: &str, word: &str) -> bool {
    format!(" {norm} ").contains(&format!(" {word} "))
}

/// "hq2" -> ("hq", Some(2)); "hq" -> ("hq", None). Fused forms rarely survive
/// the normalizer's boundary split, but the grammar accepts them regardless.
fn split_tag_count(tok: &str) -> (&str, Option<i64>) {
    match tok.find(|c: char| c.is_ascii_digit()) {
        Some(idx) if idx > 0 && tok[idx..].chars().all(|c| c.is_ascii_digit()) => {
            (&tok[..idx], tok[idx..].parse().ok())
        }
        _ => (tok, None),
    }
}

/// "3ss" -> (3, "ss") for the compact <qty><modelAbbrev> buy form.
fn split_count_prefix(tok: &str) -> Option<(i64, &str)> {
    let idx = tok.find(|c: char| !c.is_ascii_digit())?;
    if idx == 0 {
        return None;
    }
    Some((tok[..idx].parse().ok()?, &tok[idx..]))
}

fn game_token(tok: &str) -> Option<(GameTag, Option<i64>)> {
    let (base, count) = split_tag_count(tok);
    match base {
        "hq" => Some((GameTag::Hq, count)),
        "qr" => Some((GameTag::Qr, count)),
        "db" => Some((GameTag::Db, count)),
        _ => None,
    }
}

fn kind_token(tok: &str, words: &[&str]) -> Option<Option<i64>> {
    let (base, count) = split_tag_count(tok);
    if words.contains(&base) {
        Some(count)
    } else {
        None
    }
}

fn clamp_count(n: i64) -> i64 {
    n.clamp(0, 50)
}

// ===== Lot code =====

/// Flexible "ma"/"maso" + 1-3 digits -> canonical "MA" + zero-padded (min 2).
/// Returns the matched span in the normalized input so callers can cut it
/// before walking the remaining tokens.
pub fn parse_lot_code_spanned(norm: &str) -> Option<(String, Range<usize>)> {
    let caps = LOT_RE.captures(norm)?;
    let n: u32 = caps[1].parse().ok()?;
    Some((format!("MA{n:02}"), caps.get(0).unwrap().range()))
}

pub fn parse_lot_code(text: &str) -> Option<String> {
    parse_lot_code_spanned(&normalize_for_parse(text)).map(|(c, _)| c)
}

// ===== Buy =====

fn detect_model(norm: &str) -> (String, Option<&'static str>) {
    for (kw, label) in MODEL_KEYWORDS {
        if has_word(norm, kw) {
            return (label.to_string(), Some(kw));
        }
    }
    if FUSED_SS_RE.is_match(norm) {
        return ("Samsung".to_string(), None);
    }
    if FUSED_IP_RE.is_match(norm) {
        return ("iPhone".to_string(), None);
    }
    ("Unknown".to_string(), None)
}

fn detect_wallet(norm: &str) -> Option<(String, &'static str)> {
    for (kw, wallet) in WALLET_KEYWORDS {
        if has_word(norm, kw) {
            return Some((wallet.to_string(), kw));
        }
    }
    None
}

/// Quantity = integer directly after the command keyword (or a compact
/// <qty><model> token), default 1, clamped to [1, 50].
fn qty_after_keyword(toks: &[&str], keyword: &str) -> (i64, Option<String>) {
    if let Some(pos) = toks.iter().position(|t| *t == keyword) {
        if let Some(next) = toks.get(pos + 1) {
            if next.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(n) = next.parse::<i64>() {
                    return (n.clamp(1, 50), Some((*next).to_string()));
                }
            }
            if let Some((n, _)) = split_count_prefix(next) {
                return (n.clamp(1, 50), Some((*next).to_string()));
            }
        }
    }
    (1, None)
}

/// Raw text with the command keyword, quantity/model/wallet tokens, currency
/// glyphs and the matched amount stripped; everything else kept verbatim.
fn leftover_note(stripped_raw: &str, drop_words: &[String]) -> String {
    let mut kept: Vec<String> = Vec::new();
    for tok in stripped_raw.split_whitespace() {
        let cleaned: String = tok.chars().filter(|c| *c != '₩').collect();
        if cleaned.is_empty() {
            continue;
        }
        let pieces = normalize_for_parse(&cleaned);
        let dropped = !pieces.is_empty()
            && pieces
                .split_whitespace()
                .all(|p| drop_words.iter().any(|d| d == p));
        if !dropped {
            kept.push(cleaned);
        }
    }
    kept.join(" ")
}

pub fn parse_buy(raw: &str) -> Parsed<BuyIntent> {
    let whole = normalize_for_parse(raw);
    if !has_word(&whole, BUY_KEYWORD) {
        return Parsed::Miss;
    }
    let Some((total_price, span)) = extract_money_spanned(raw) else {
        return Parsed::Incomplete;
    };
    let stripped_raw = cut_span(raw, &span);
    let norm = normalize_for_parse(&stripped_raw);
    let toks: Vec<&str> = norm.split_whitespace().collect();

    let (qty, qty_word) = qty_after_keyword(&toks, BUY_KEYWORD);
    let (model, model_kw) = detect_model(&norm);
    let wallet = detect_wallet(&norm);

    let mut drop: Vec<String> = vec![BUY_KEYWORD.to_string(), "won".to_string()];
    if let Some(q) = qty_word {
        drop.push(q);
        drop.push(qty.to_string());
    }
    if let Some(kw) = model_kw {
        drop.push(kw.to_string());
    }
    if let Some((_, kw)) = &wallet {
        drop.extend(kw.split_whitespace().map(str::to_string));
    }
    let note = leftover_note(&stripped_raw, &drop);

    Parsed::Hit(BuyIntent {
        qty,
        model,
        total_price,
        wallet: wallet.map(|(w, _)| w),
        note,
    })
}

/// Standalone wallet reply ("hana", "tien mat", ...) for session steps.
pub fn parse_wallet(text: &str) -> Option<String> {
    let norm = normalize_for_parse(text);
    detect_wallet(&norm).map(|(w, _)| w)
}

// ===== Sell =====

pub fn parse_sell(raw: &str) -> Parsed<SellIntent> {
    let whole = normalize_for_parse(raw);
    if !has_word(&whole, SELL_KEYWORD) {
        return Parsed::Miss;
    }
    let Some((total_price, span)) = extract_money_spanned(raw) else {
        return Parsed::Incomplete;
    };
    let norm = normalize_for_parse(&cut_span(raw, &span));
    let Some((lot_code, _)) = parse_lot_code_spanned(&norm) else {
        return Parsed::Incomplete;
    };
    let toks: Vec<&str> = norm.split_whitespace().collect();
    let (qty, _) = qty_after_keyword(&toks, SELL_KEYWORD);
    let (model, _) = detect_model(&norm);
    let wallet = detect_wallet(&norm).map(|(w, _)| w);

    Parsed::Hit(SellIntent { lot_code, qty, total_price, wallet, model })
}

// ===== Resolve =====

/// Ordered left-to-right segment walk. Unrecognized tokens are skipped; the
/// shorthand often arrives embedded in a sentence.
pub fn parse_segments(text: &str) -> Vec<Segment> {
    let toks: Vec<&str> = text.split_whitespace().collect();
    let mut segs: Vec<Segment> = Vec::new();
    let mut i = 0usize;

    while i < toks.len() {
        let tok = toks[i];

        // A game tag always opens a win segment, count from the fused digits
        // or a standalone digit token right after.
        if let Some((game, fused)) = game_token(tok) {
            i += 1;
            let count = match fused {
                Some(n) => n,
                None => take_count(&toks, &mut i).unwrap_or(1),
            };
            segs.push(Segment { kind: SegmentKind::Loi, count: clamp_count(count), game });
            continue;
        }

        if let Some(fused) = kind_token(tok, &WIN_WORDS) {
            i += 1;
            let count = fused.or_else(|| take_count(&toks, &mut i)).unwrap_or(1);
            if toks.get(i).map_or(false, |n| FILLER_WORDS.contains(n)) {
                i += 1;
            }
            let mut game = GameTag::None;
            if let Some(next) = toks.get(i) {
                if let Some((g, f)) = game_token(next) {
                    game = g;
                    // a fused game+count token is left in place: it opens its
                    // own segment on the next pass (no double counting)
                    if f.is_none() {
                        i += 1;
                    }
                }
            }
            segs.push(Segment { kind: SegmentKind::Loi, count: clamp_count(count), game });
            continue;
        }

        if let Some(fused) = kind_token(tok, &LOSS_WORDS) {
            i += 1;
            let count = fused.or_else(|| take_count(&toks, &mut i)).unwrap_or(1);
            segs.push(Segment { kind: SegmentKind::Lo, count: clamp_count(count), game: GameTag::None });
            continue;
        }

        if let Some(fused) = kind_token(tok, &EVEN_WORDS) {
            i += 1;
            let count = fused.or_else(|| take_count(&toks, &mut i)).unwrap_or(1);
            segs.push(Segment { kind: SegmentKind::Hue, count: clamp_count(count), game: GameTag::None });
            continue;
        }

        i += 1;
    }
    segs
}

fn take_count(toks: &[&str], i: &mut usize) -> Option<i64> {
    let tok = toks.get(*i)?;
    if !tok.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let n: i64 = tok.parse().ok()?;
    *i += 1;
    Some(n)
}

/// Resolve is keyed purely on a recognizable lot code; the code's own tokens
/// are cut before the segment walk so its digits never read as a count.
pub fn parse_resolve(raw: &str) -> Parsed<ResolveIntent> {
    let norm = normalize_for_parse(raw);
    let Some((lot_code, span)) = parse_lot_code_spanned(&norm) else {
        return Parsed::Miss;
    };
    let rest = cut_span(&norm, &span);
    let segments = parse_segments(&rest);
    Parsed::Hit(ResolveIntent { lot_code, segments })
}

pub fn has_ungamed_win(segments: &[Segment]) -> bool {
    segments
        .iter()
        .any(|s| s.kind == SegmentKind::Loi && s.game == GameTag::None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lot_code_round_trip() {
        for n in 1..=999u32 {
            let canonical = format!("MA{n:02}");
            assert_eq!(parse_lot_code(&format!("ma{n}")), Some(canonical.clone()));
            // idempotent under its own canonical form
            assert_eq!(parse_lot_code(&canonical), Some(canonical));
        }
        assert_eq!(parse_lot_code("maso 01"), Some("MA01".to_string()));
        assert_eq!(parse_lot_code("ma so 7"), Some("MA07".to_string()));
        assert_eq!(parse_lot_code("khong co gi"), None);
        assert_eq!(parse_lot_code("ma 1234"), None); // max 3 digits
    }

    #[test]
    fn buy_compact_form() {
        let Parsed::Hit(b) = parse_buy("mua 3ss 50k") else { panic!("expected hit") };
        assert_eq!(b.qty, 3);
        assert_eq!(b.model, "Samsung");
        assert_eq!(b.total_price, 50_000);
        assert_eq!(b.wallet, None);
        assert_eq!(b.note, "");
    }

    #[test]
    fn buy_with_wallet_and_note() {
        let Parsed::Hit(b) = parse_buy("Mua 2 iPhone 1,200,000 hàng đẹp hana") else {
            panic!("expected hit")
        };
        assert_eq!(b.qty, 2);
        assert_eq!(b.model, "iPhone");
        assert_eq!(b.total_price, 1_200_000);
        assert_eq!(b.wallet, Some("hana".to_string()));
        assert_eq!(b.note, "hàng đẹp");
    }

    #[test]
    fn buy_defaults_and_clamps() {
        let Parsed::Hit(b) = parse_buy("mua 50k") else { panic!() };
        assert_eq!(b.qty, 1);
        assert_eq!(b.model, "Unknown");

        let Parsed::Hit(b) = parse_buy("mua 99 ss 900k") else { panic!() };
        assert_eq!(b.qty, 50);
    }

    #[test]
    fn buy_requires_amount() {
        assert_eq!(parse_buy("mua 3 ss"), Parsed::Incomplete);
        assert_eq!(parse_buy("chao ban"), Parsed::Miss);
    }

    #[test]
    fn sell_full_and_incomplete() {
        let Parsed::Hit(s) = parse_sell("ban 2 ma01 500k uri") else { panic!() };
        assert_eq!(s.lot_code, "MA01");
        assert_eq!(s.qty, 2);
        assert_eq!(s.total_price, 500_000);
        assert_eq!(s.wallet, Some("uri".to_string()));

        assert_eq!(parse_sell("ban ma01"), Parsed::Incomplete); // no amount
        assert_eq!(parse_sell("ban 500k"), Parsed::Incomplete); // no lot code
        assert_eq!(parse_sell("mua 3ss 50k"), Parsed::Miss);
    }

    #[test]
    fn resolve_segments_in_order() {
        let Parsed::Hit(r) = parse_resolve("ma1 loi 2 may hq tach 1 hue") else { panic!() };
        assert_eq!(r.lot_code, "MA01");
        assert_eq!(
            r.segments,
            vec![
                Segment { kind: SegmentKind::Loi, count: 2, game: GameTag::Hq },
                Segment { kind: SegmentKind::Lo, count: 1, game: GameTag::None },
                Segment { kind: SegmentKind::Hue, count: 1, game: GameTag::None },
            ]
        );
    }

    #[test]
    fn resolve_game_tag_opens_win_segment() {
        let Parsed::Hit(r) = parse_resolve("ma 2 hq 3 qr") else { panic!() };
        assert_eq!(r.lot_code, "MA02");
        assert_eq!(
            r.segments,
            vec![
                Segment { kind: SegmentKind::Loi, count: 3, game: GameTag::Hq },
                Segment { kind: SegmentKind::Loi, count: 1, game: GameTag::Qr },
            ]
        );
    }

    #[test]
    fn resolve_win_without_game_stays_ungamed() {
        let Parsed::Hit(r) = parse_resolve("ma1 loi 2 tach 1") else { panic!() };
        assert_eq!(r.segments[0].kind, SegmentKind::Loi);
        assert_eq!(r.segments[0].game, GameTag::None);
        assert!(has_ungamed_win(&r.segments));
    }

    #[test]
    fn resolve_skips_stray_words() {
        let Parsed::Hit(r) = parse_resolve("hom nay ma1 chay tot loi 1 hq") else { panic!() };
        assert_eq!(
            r.segments,
            vec![Segment { kind: SegmentKind::Loi, count: 1, game: GameTag::Hq }]
        );
    }

    #[test]
    fn resolve_fused_counts_and_clamp() {
        assert_eq!(
            parse_segments("hq2"),
            vec![Segment { kind: SegmentKind::Loi, count: 2, game: GameTag::Hq }]
        );
        assert_eq!(
            parse_segments("loi2 hue3"),
            vec![
                Segment { kind: SegmentKind::Loi, count: 2, game: GameTag::None },
                Segment { kind: SegmentKind::Hue, count: 3, game: GameTag::None },
            ]
        );
        let segs = parse_segments("loi 99");
        assert_eq!(segs[0].count, 50);
    }

    #[test]
    fn resolve_fused_game_after_win_not_consumed() {
        // "loi 2 hq3": hq3 supplies the game for the first segment but keeps
        // its own count as a fresh segment
        let segs = parse_segments("loi 2 hq3");
        assert_eq!(
            segs,
            vec![
                Segment { kind: SegmentKind::Loi, count: 2, game: GameTag::Hq },
                Segment { kind: SegmentKind::Loi, count: 3, game: GameTag::Hq },
            ]
        );
    }

    #[test]
    fn resolve_without_segments_is_empty() {
        let Parsed::Hit(r) = parse_resolve("ma1") else { panic!() };
        assert!(r.segments.is_empty());
        assert_eq!(parse_resolve("khong lien quan"), Parsed::Miss);
    }
}
