//! Raw price and quantity parsing
//!
//! Sources print prices as `1 299,00 ₽`, `1,299.00`, `1299р.` and stock as
//! `>10`, `5 шт`, `в наличии`. Parsed prices are exact decimals rounded to
//! kopecks; nothing goes through floating point.

use bigdecimal::{BigDecimal, RoundingMode};
use std::str::FromStr;

use super::types::{ParsedListing, StagingRecord};
use crate::error::{PipelineError, PipelineResult};

/// Decimal places kept for money
pub const PRICE_SCALE: i64 = 2;

/// Exclusive upper bound that fits the `NUMERIC(14, 2)` price columns
pub const PRICE_LIMIT: i64 = 1_000_000_000_000;

const OUT_OF_STOCK: &[&str] = &[
    "нет в наличии",
    "нет",
    "отсутствует",
    "под заказ",
    "ожидается",
    "out of stock",
    "sold out",
];

const IN_STOCK: &[&str] = &["в наличии", "есть", "много", "достаточно", "in stock", "available"];

/// Parse every numeric field of a record
pub fn parse_listing(record: &StagingRecord) -> PipelineResult<ParsedListing> {
    if record.name.trim().is_empty() {
        return Err(PipelineError::malformed("name", "empty product name"));
    }
    if record.outlet_code.trim().is_empty() {
        return Err(PipelineError::malformed("outlet_code", "empty outlet code"));
    }

    let price = parse_price(&record.price).map_err(|e| PipelineError::malformed("price", e))?;
    let old_price = match record.old_price.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(parse_price(raw).map_err(|e| PipelineError::malformed("old_price", e))?),
    };
    let quantity =
        parse_quantity(&record.quantity).map_err(|e| PipelineError::malformed("quantity", e))?;

    Ok(ParsedListing {
        price,
        old_price,
        quantity,
    })
}

/// Round to [`PRICE_SCALE`] places, half away from zero
pub fn round_price(value: &BigDecimal) -> BigDecimal {
    value.with_scale_round(PRICE_SCALE, RoundingMode::HalfUp)
}

pub fn parse_price(raw: &str) -> Result<BigDecimal, String> {
    let kept: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, ',' | '.' | '-'))
        .collect();
    let kept = kept.trim_matches(|c| c == '.' || c == ',');

    if !kept.chars().any(|c| c.is_ascii_digit()) {
        return Err(format!("no digits in '{}'", raw.trim()));
    }
    if kept.contains('-') {
        return Err(format!("negative or ranged price '{}'", raw.trim()));
    }

    let canonical = canonical_decimal(kept);
    let value = BigDecimal::from_str(&canonical)
        .map_err(|e| format!("invalid price '{}': {}", raw.trim(), e))?;
    let rounded = round_price(&value);
    if rounded >= BigDecimal::from(PRICE_LIMIT) {
        return Err(format!("price '{}' exceeds {}", raw.trim(), PRICE_LIMIT));
    }
    Ok(rounded)
}

/// Resolve thousands vs. decimal separators into a plain `1234.56` string
fn canonical_decimal(s: &str) -> String {
    let commas = s.matches(',').count();
    let dots = s.matches('.').count();

    let decimal_sep = match (commas, dots) {
        (0, 0) => None,
        (_, 0) => single_decimal(s, ','),
        (0, _) => single_decimal(s, '.'),
        _ => {
            // both present: whichever comes last is the decimal separator
            let last_comma = s.rfind(',');
            let last_dot = s.rfind('.');
            if last_comma > last_dot {
                Some(',')
            } else {
                Some('.')
            }
        }
    };

    match decimal_sep {
        None => s.chars().filter(|c| c.is_ascii_digit()).collect(),
        Some(sep) => {
            let index = s.rfind(sep).unwrap_or(s.len());
            let (int_part, frac_part) = s.split_at(index);
            let int_digits: String = int_part.chars().filter(|c| c.is_ascii_digit()).collect();
            let frac_digits: String = frac_part.chars().filter(|c| c.is_ascii_digit()).collect();
            let int_digits = if int_digits.is_empty() { "0".to_string() } else { int_digits };
            format!("{}.{}", int_digits, frac_digits)
        }
    }
}

/// A lone separator followed by exactly three digits groups thousands
fn single_decimal(s: &str, sep: char) -> Option<char> {
    if s.matches(sep).count() > 1 {
        return None;
    }
    let tail = s.rsplit(sep).next().unwrap_or("");
    if tail.len() == 3 {
        None
    } else {
        Some(sep)
    }
}

pub fn parse_quantity(raw: &str) -> Result<i32, String> {
    let text = raw.trim().to_lowercase();
    if text.is_empty() {
        return Err("empty quantity".to_string());
    }
    if OUT_OF_STOCK.iter().any(|p| text.contains(p)) {
        return Ok(0);
    }
    if text.starts_with('-') {
        return Err(format!("negative quantity '{}'", raw.trim()));
    }

    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if !digits.is_empty() {
        return digits
            .parse::<i32>()
            .map_err(|e| format!("invalid quantity '{}': {}", raw.trim(), e));
    }
    if IN_STOCK.iter().any(|p| text.contains(p)) {
        return Ok(1);
    }

    Err(format!("unrecognised quantity '{}'", raw.trim()))
}
