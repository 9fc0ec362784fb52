// ===============================
// src/normalize.rs
// ===============================
//
// Text canonicalization + money extraction:
// - normalize_for_parse : email-safe lowercase/diacritic-free token form
// - parse_money         : "50k" / "1.5k" / "₩120,000" -> integer amount
// - extract_money_from_text : prioritized scan over raw text
//
// Money extraction runs on RAW text on purpose: the normalizer splits
// letter/digit boundaries, so "50k" would arrive as "50 k" and the digits
// could be mistaken for a quantity. Callers strip the matched raw span
// before running the token-level recognizers.

use once_cell::sync::Lazy;
use regex::Regex;
use std::ops::Range;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9][A-Za-z0-9._%+-]*@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap());

// Amount patterns, tried in priority order: an explicit currency glyph or a
// thousands marker disambiguates an amount from unrelated digits (e.g. a lot
// number) better than a bare run, so those come first. The bare run must be
// comma-grouped or at least 4 digits so quantities never read as money.
static RE_CURRENCY: Lazy<Regex> = Lazy::new(|| Regex::new(r"₩\s*\d[\d.,]*\s?[kK]?").unwrap());
static RE_K_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d[\d,]*(?:\.\d+)?\s?[kK]\b").unwrap());
static RE_BARE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{1,3}(?:,\d{3})+|\d{4,}").unwrap());

static MONEY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+(?:\.\d+)?) ?(k)?$").unwrap());

// Private-use sentinel so the boundary pass can never mutate a protected span.
const SHIELD: char = '\u{e000}';

fn fold_char(c: char) -> char {
    match c {
        'à' | 'á' | 'ạ' | 'ả' | 'ã' | 'â' | 'ầ' | 'ấ' | 'ậ' | 'ẩ' | 'ẫ' | 'ă' | 'ằ' | 'ắ'
        | 'ặ' | 'ẳ' | 'ẵ' => 'a',
        'è' | 'é' | 'ẹ' | 'ẻ' | 'ẽ' | 'ê' | 'ề' | 'ế' | 'ệ' | 'ể' | 'ễ' => 'e',
        'ì' | 'í' | 'ị' | 'ỉ' | 'ĩ' => 'i',
        'ò' | 'ó' | 'ọ' | 'ỏ' | 'õ' | 'ô' | 'ồ' | 'ố' | 'ộ' | 'ổ' | 'ỗ' | 'ơ' | 'ờ' | 'ớ'
        | 'ợ' | 'ở' | 'ỡ' => 'o',
        'ù' | 'ú' | 'ụ' | 'ủ' | 'ũ' | 'ư' | 'ừ' | 'ứ' | 'ự' | 'ử' | 'ữ' => 'u',
        'ỳ' | 'ý' | 'ỵ' | 'ỷ' | 'ỹ' => 'y',
        'đ' => 'd',
        _ => c,
    }
}

/// Canonical parse form: emails shielded, diacritics folded, lowercased,
/// letter<->digit boundaries split ("3ss" -> "3 ss"), whitespace collapsed,
/// full-width comma normalized. Emails are restored verbatim at the end.
pub fn normalize_for_parse(text: &str) -> String {
    let mut emails: Vec<String> = Vec::new();
    let protected = EMAIL_RE.replace_all(text, |caps: &regex::Captures| {
        let idx = emails.len();
        emails.push(caps[0].to_string());
        format!("{SHIELD}{idx}{SHIELD}")
    });

    let lowered = protected.to_lowercase();
    let folded: String = lowered.chars().map(fold_char).collect();
    let folded = folded.replace('，', ",");

    let mut spaced = String::with_capacity(folded.len() + 8);
    let mut prev: Option<char> = None;
    for c in folded.chars() {
        if let Some(p) = prev {
            let boundary = (p.is_alphabetic() && c.is_ascii_digit())
                || (p.is_ascii_digit() && c.is_alphabetic());
            if boundary {
                spaced.push(' ');
            }
        }
        spaced.push(c);
        prev = Some(c);
    }

    let mut out = spaced.split_whitespace().collect::<Vec<_>>().join(" ");
    for (idx, email) in emails.iter().enumerate() {
        out = out.replace(&format!("{SHIELD}{idx}{SHIELD}"), email);
    }
    out
}

/// Parse one monetary token. Strips the currency glyph, the literal word
/// "won" and thousands commas, then accepts `^\d+(\.\d+)?k?$` with an
/// optional space before `k` (x1000). Anything else is None.
pub fn parse_money(token: &str) -> Option<i64> {
    let t = token.to_lowercase();
    let t = t.replace('₩', "").replace("won", "").replace(',', "");
    let t = t.trim();
    let caps = MONEY_RE.captures(t)?;
    let magnitude: f64 = caps[1].parse().ok()?;
    let mult = if caps.get(2).is_some() { 1000.0 } else { 1.0 };
    Some((magnitude * mult).round() as i64)
}

/// First parsable amount in raw text, plus the matched byte span so the
/// caller can cut it out before tokenizing.
pub fn extract_money_spanned(text: &str) -> Option<(i64, Range<usize>)> {
    for re in [&*RE_CURRENCY, &*RE_K_SUFFIX, &*RE_BARE_RUN] {
        for m in re.find_iter(text) {
            if let Some(v) = parse_money(m.as_str()) {
                return Some((v, m.range()));
            }
        }
    }
    None
}

pub fn extract_money_from_text(text: &str) -> Option<i64> {
    extract_money_spanned(text).map(|(v, _)| v)
}

/// Remove a previously matched span, keeping a single space at the seam.
pub fn cut_span(text: &str, span: &Range<usize>) -> String {
    format!("{} {}", &text[..span.start], &text[span.end..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_splits_letter_digit_boundaries() {
        assert_eq!(normalize_for_parse("Mua 3SS 50k"), "mua 3 ss 50 k");
        assert_eq!(normalize_for_parse("ma01"), "ma 01");
    }

    #[test]
    fn normalize_folds_diacritics_and_collapses() {
        assert_eq!(normalize_for_parse("Chốt   lô  MA01"), "chot lo ma 01");
        assert_eq!(normalize_for_parse("bán tiền mặt"), "ban tien mat");
        assert_eq!(normalize_for_parse("a，b"), "a,b");
    }

    #[test]
    fn normalize_keeps_emails_verbatim() {
        let s = normalize_for_parse("note Shop.Owner@Example.VN gấp");
        assert!(s.contains("Shop.Owner@Example.VN"));
        assert!(s.ends_with("gap"));
    }

    #[test]
    fn money_token_forms() {
        assert_eq!(parse_money("50k"), Some(50_000));
        assert_eq!(parse_money("1.5k"), Some(1_500));
        assert_eq!(parse_money("abc"), None);
        assert_eq!(parse_money("₩120,000"), Some(120_000));
        assert_eq!(parse_money("300000"), Some(300_000));
        assert_eq!(parse_money("1.5 k"), Some(1_500));
        assert_eq!(parse_money("120000won"), Some(120_000));
        assert_eq!(parse_money(""), None);
        assert_eq!(parse_money("12a"), None);
    }

    #[test]
    fn extraction_prefers_marked_amounts() {
        // "2" is a quantity, not money: the k-marked amount wins.
        assert_eq!(extract_money_from_text("mua 2 ip 50k"), Some(50_000));
        assert_eq!(extract_money_from_text("ban ma01 ₩120,000"), Some(120_000));
        // bare run needs >=4 digits or comma grouping
        assert_eq!(extract_money_from_text("mua 2 ip 300000"), Some(300_000));
        assert_eq!(extract_money_from_text("mua 2 ip 1,200,000"), Some(1_200_000));
        assert_eq!(extract_money_from_text("ma01 loi 2"), None);
    }

    #[test]
    fn extraction_reports_span() {
        let raw = "mua 3ss 50k gap";
        let (v, span) = extract_money_spanned(raw).unwrap();
        assert_eq!(v, 50_000);
        assert_eq!(&raw[span.clone()], "50k");
        assert_eq!(normalize_for_parse(&cut_span(raw, &span)), "mua 3 ss gap");
    }
}
