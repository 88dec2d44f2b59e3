//! Payout amount normalization.
//!
//! Payout text is human-authored, so parsing is deliberately lenient: it
//! never fails, it degrades to a best-effort interpretation. Malformed
//! numerics come out as zero rather than an error.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AmountKind {
    Usd,
    Coin,
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedAmount {
    pub kind: AmountKind,
    pub raw: String,
    pub amount: Option<f64>,
    pub display: String,
}

static NUMERIC_ONLY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[\d.\-]+$").unwrap_or_else(|e| panic!("invalid numeric pattern: {e}"))
});

/// Extract the numeric value from free text by stripping everything except
/// digits, periods and minus signs. Defaults to zero when nothing parses.
fn numeric_part(s: &str) -> f64 {
    let digits: String = s
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    digits.parse::<f64>().unwrap_or(0.0)
}

/// Normalize a free-text payout amount. Rules in priority order:
/// currency symbol → USD; fully parenthesized → USD ("amount owed"
/// convention); contains `c`/`C` → COIN; pure numeric → COIN; anything
/// else is kept verbatim as TEXT. Empty input yields `None`.
pub fn parse_amount(input: &str) -> Option<ParsedAmount> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }

    if s.contains('$') {
        let v = numeric_part(s);
        return Some(ParsedAmount {
            kind: AmountKind::Usd,
            raw: s.to_string(),
            amount: Some(v),
            display: format!("${v}"),
        });
    }

    if s.starts_with('(') && s.ends_with(')') && s.len() >= 2 {
        let inner = s[1..s.len() - 1].trim();
        let v = numeric_part(inner);
        return Some(ParsedAmount {
            kind: AmountKind::Usd,
            raw: s.to_string(),
            amount: Some(v),
            display: format!("${v}"),
        });
    }

    if s.chars().any(|c| c == 'c' || c == 'C') {
        let v = numeric_part(s);
        return Some(ParsedAmount {
            kind: AmountKind::Coin,
            raw: s.to_string(),
            amount: Some(v),
            display: format!("{v}c"),
        });
    }

    if NUMERIC_ONLY.is_match(s) {
        let v = s.parse::<f64>().unwrap_or(0.0);
        return Some(ParsedAmount {
            kind: AmountKind::Coin,
            raw: s.to_string(),
            amount: Some(v),
            display: format!("{v}c"),
        });
    }

    Some(ParsedAmount {
        kind: AmountKind::Text,
        raw: s.to_string(),
        amount: None,
        display: s.to_string(),
    })
}
