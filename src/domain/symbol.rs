//! Instrument identifier normalization and equivalence.
//!
//! Exchanges spell the same perpetual as `BTC`, `BTC_USDT`, `BTCUSDT` or
//! `BTC-USDT`. Everything stored by this crate uses the canonical
//! `BASE-QUOTE` form produced by [`normalize_symbol`].

use super::error::SymbolError;
use std::collections::BTreeSet;

/// Quote assets recognised when splitting compact symbols. Longest first so
/// `BTCUSDT` splits on `USDT` rather than `USD`.
const QUOTE_ASSETS: [&str; 3] = ["USDT", "USDC", "USD"];

const MAX_SYMBOL_LEN: usize = 20;

/// Canonicalize a symbol to `BASE-QUOTE` (or a bare `BASE` when no quote
/// asset can be recognised).
pub fn normalize_symbol(symbol: &str) -> String {
    let s = symbol.trim().replace('_', "-").to_uppercase();
    if s.is_empty() || s.contains('-') {
        return s;
    }
    for quote in QUOTE_ASSETS {
        if s.len() > quote.len() && s.ends_with(quote) {
            let base = &s[..s.len() - quote.len()];
            return format!("{base}-{quote}");
        }
    }
    s
}

/// Base asset of a symbol: `BTC-USDT` -> `BTC`, `BTC` -> `BTC`.
pub fn base_asset(symbol: &str) -> String {
    let norm = normalize_symbol(symbol);
    match norm.split_once('-') {
        Some((base, _)) => base.to_string(),
        None => norm,
    }
}

/// Two identifiers denote the same instrument when their normalized forms
/// agree up to the separator: `BTC` ≡ `BTC-USDT` ≡ `BTC-USD`.
///
/// The comparison is on whole base assets, so `ETH` and `ETHFI` stay
/// distinct.
pub fn same_instrument(a: &str, b: &str) -> bool {
    let (na, nb) = (normalize_symbol(a), normalize_symbol(b));
    if na.is_empty() || nb.is_empty() {
        return false;
    }
    na == nb || base_asset(&na) == base_asset(&nb)
}

fn is_bare(symbol: &str) -> bool {
    !symbol.contains('-')
}

/// Merge an assignment symbol into a set of traded symbols for display.
///
/// If an equivalent symbol is already present the more specific variant
/// (`BASE-QUOTE` over bare `BASE`) wins; otherwise the assignment symbol is
/// added as a new row.
pub fn merge_symbol(symbols: &mut BTreeSet<String>, assignment_symbol: &str) {
    let incoming = normalize_symbol(assignment_symbol);
    if incoming.is_empty() {
        return;
    }

    let existing = symbols
        .iter()
        .find(|s| same_instrument(s, &incoming))
        .cloned();

    match existing {
        Some(current) if is_bare(&current) && !is_bare(&incoming) => {
            symbols.remove(&current);
            symbols.insert(incoming);
        }
        Some(_) => {}
        None => {
            symbols.insert(incoming);
        }
    }
}

/// Validate an operator-entered symbol and return its normalized form.
pub fn validate_symbol(symbol: &str) -> Result<String, SymbolError> {
    let trimmed = symbol.trim();
    if trimmed.is_empty() {
        return Err(SymbolError::Empty);
    }
    let len = trimmed.chars().count();
    if len > MAX_SYMBOL_LEN {
        return Err(SymbolError::TooLong(len));
    }
    if let Some(c) = trimmed
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(SymbolError::InvalidChar(c));
    }
    Ok(normalize_symbol(trimmed))
}
