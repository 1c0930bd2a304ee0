//! Deterministic matching of a user's selection against stored candidates.
//!
//! Ordinals are forgiving: an unparseable, zero or negative position picks
//! the first candidate. Years and season/episode specs are strict and
//! return `None` on any miss so the caller re-prompts.

use serde_json::Value;

use marquee_core::catalog::CatalogItem;
use marquee_core::selection::{RawStructuredSelection, SeasonEntry, SelectionCriterion, StructuredSelection};

/// Pick the candidate named by `criterion`.
pub fn resolve<'a>(criterion: &SelectionCriterion, candidates: &'a [CatalogItem]) -> Option<&'a CatalogItem> {
    match criterion {
        SelectionCriterion::Ordinal(value) => resolve_ordinal(value, candidates),
        SelectionCriterion::Year(value) => resolve_year(value, candidates),
    }
}

pub fn resolve_ordinal<'a>(value: &str, candidates: &'a [CatalogItem]) -> Option<&'a CatalogItem> {
    let first = candidates.first()?;
    let Some(position) = parse_leading_int(value) else {
        return Some(first);
    };
    let index = position.saturating_sub(1);
    if index < 0 {
        return Some(first);
    }
    usize::try_from(index).ok().and_then(|i| candidates.get(i))
}

pub fn resolve_year<'a>(value: &str, candidates: &'a [CatalogItem]) -> Option<&'a CatalogItem> {
    let year = parse_leading_int(value)?;
    candidates
        .iter()
        .find(|item| item.year.is_some_and(|y| i64::from(y) == year))
}

/// Validate a raw season/episode spec. Any malformed entry invalidates the
/// whole selection.
pub fn resolve_structured(raw: &RawStructuredSelection) -> Option<StructuredSelection> {
    let entries = match &raw.entries {
        None => return Some(StructuredSelection::EntireSeries),
        Some(entries) if entries.is_empty() => return Some(StructuredSelection::EntireSeries),
        Some(entries) => entries,
    };

    let mut resolved = Vec::with_capacity(entries.len());
    for entry in entries {
        let season = non_negative_int(&entry.season)?;
        let episodes = match &entry.episodes {
            None => None,
            Some(values) => Some(values.iter().map(non_negative_int).collect::<Option<Vec<_>>>()?),
        };
        resolved.push(SeasonEntry { season, episodes });
    }
    Some(StructuredSelection::Entries(resolved))
}

/// Integer prefix of `value`: optional whitespace and sign, then digits up
/// to the first non-digit. `None` when no digit leads.
pub fn parse_leading_int(value: &str) -> Option<i64> {
    let trimmed = value.trim_start();
    let (negative, rest) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let digits: &str = {
        let end = rest.bytes().take_while(u8::is_ascii_digit).count();
        &rest[..end]
    };
    if digits.is_empty() {
        return None;
    }
    let magnitude = digits.bytes().fold(0i64, |acc, b| {
        acc.saturating_mul(10).saturating_add(i64::from(b - b'0'))
    });
    Some(if negative { -magnitude } else { magnitude })
}

fn non_negative_int(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                return u32::try_from(u).ok();
            }
            let f = n.as_f64()?;
            (f >= 0.0 && f.fract() == 0.0 && f <= f64::from(u32::MAX)).then_some(f as u32)
        }
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            s.parse::<u32>().ok()
        }
        _ => None,
    }
}
