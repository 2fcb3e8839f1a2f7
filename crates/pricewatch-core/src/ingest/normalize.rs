//! Name, article and category normalisation
//!
//! Normalised names feed both candidate lookup and similarity scoring, so
//! every rule here changes which listings can merge. Steps, in order:
//!
//! 1. lowercase, `ё` folded to `е`
//! 2. decimal commas between digits become dots (`5,5` -> `5.5`)
//! 3. hyphens, slashes and underscores inside a model number are dropped
//!    (`SM-A515F` -> `sma515f`)
//! 4. any other punctuation becomes a separator
//! 5. unit aliases are unified and glued to their number (`64 ГБ` -> `64gb`)
//! 6. manufacturer boilerplate tokens are removed
//! 7. whitespace is collapsed

use regex::Regex;
use std::collections::HashSet;

use crate::error::PipelineResult;

/// Tokens that say nothing about which product a listing is
pub const DEFAULT_BOILERPLATE: &[&str] = &[
    "original", "orig", "oem", "genuine", "new", "premium", "high", "quality", "hq", "aaa",
    "оригинал", "оригинальный", "оригинальная", "ориг", "копия", "новый", "новая", "премиум",
    "качество", "высокое", "для", "for", "с", "with", "и", "and",
];

const UNIT_ALIASES: &[(&str, &str)] = &[
    ("гб", "gb"),
    ("gb", "gb"),
    ("тб", "tb"),
    ("tb", "tb"),
    ("мб", "mb"),
    ("mb", "mb"),
    ("мач", "mah"),
    ("mah", "mah"),
    ("ма", "ma"),
    ("вт", "w"),
    ("w", "w"),
    ("v", "v"),
    ("мм", "mm"),
    ("mm", "mm"),
    ("см", "cm"),
    ("дюйм", "in"),
    ("дюйма", "in"),
    ("дюймов", "in"),
    ("шт", "pcs"),
];

/// Compiled normalisation rules
#[derive(Debug, Clone)]
pub struct Normalizer {
    boilerplate: HashSet<String>,
    decimal_comma: Regex,
    punctuation: Regex,
}

impl Normalizer {
    pub fn new(extra_boilerplate: &[String]) -> PipelineResult<Self> {
        let mut boilerplate: HashSet<String> =
            DEFAULT_BOILERPLATE.iter().map(|s| s.to_string()).collect();
        // Names are matched token by token, so phrases contribute each word
        boilerplate.extend(
            extra_boilerplate
                .iter()
                .flat_map(|s| fold_case(s).split_whitespace().map(str::to_string).collect::<Vec<_>>()),
        );

        Ok(Self {
            boilerplate,
            decimal_comma: Regex::new(r"(\d),(\d)")?,
            punctuation: Regex::new(r"[^\p{L}\p{N}\s.]+")?,
        })
    }

    /// Normalised product name
    pub fn name(&self, raw: &str) -> String {
        let folded = fold_case(raw);
        let decimals = self.decimal_comma.replace_all(&folded, "$1.$2");
        let joined = drop_inner_joiners(&decimals);
        let spaced = self.punctuation.replace_all(&joined, " ");

        let tokens: Vec<&str> = spaced
            .split_whitespace()
            .map(|t| t.trim_matches('.'))
            .filter(|t| !t.is_empty())
            .collect();

        let mut out: Vec<String> = Vec::with_capacity(tokens.len());
        for token in tokens {
            let unit = unit_alias(token);
            if let Some(unit) = unit {
                if let Some(prev) = out.last_mut() {
                    if is_number(prev) {
                        prev.push_str(unit);
                        continue;
                    }
                }
            }
            if self.boilerplate.contains(token) {
                continue;
            }
            out.push(split_glued_unit(token));
        }

        out.join(" ")
    }

    /// Whitespace-separated tokens of an already normalised name
    pub fn tokens(normalized: &str) -> HashSet<&str> {
        normalized.split_whitespace().collect()
    }
}

/// Article reduced to lowercase letters and digits; `None` if nothing remains
pub fn normalize_article(raw: &str) -> Option<String> {
    let article: String = fold_case(raw).chars().filter(|c| c.is_alphanumeric()).collect();
    if article.is_empty() {
        None
    } else {
        Some(article)
    }
}

/// Trimmed, case-folded category path with empty levels removed
pub fn normalize_category(path: &[String]) -> Vec<String> {
    path.iter()
        .map(|level| fold_case(level).split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|level| !level.is_empty())
        .collect()
}

/// Lookup key for candidate selection
pub fn category_key(path: &[String]) -> String {
    normalize_category(path).join("/")
}

fn fold_case(raw: &str) -> String {
    raw.to_lowercase().replace('ё', "е")
}

fn drop_inner_joiners(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    for (i, &c) in chars.iter().enumerate() {
        if matches!(c, '-' | '/' | '_' | '\u{2010}' | '\u{2013}') {
            let before = i.checked_sub(1).and_then(|j| chars.get(j));
            let after = chars.get(i + 1);
            if let (Some(b), Some(a)) = (before, after) {
                if b.is_alphanumeric() && a.is_alphanumeric() {
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

fn unit_alias(token: &str) -> Option<&'static str> {
    UNIT_ALIASES
        .iter()
        .find(|(alias, _)| *alias == token)
        .map(|(_, unit)| *unit)
}

fn is_number(token: &str) -> bool {
    !token.is_empty() && token.chars().all(|c| c.is_ascii_digit() || c == '.')
}

/// `64гб` -> `64gb`: a number glued to a unit alias gets the canonical unit
fn split_glued_unit(token: &str) -> String {
    let split = token
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
        .map(|(i, _)| i);

    if let Some(i) = split {
        let (number, suffix) = token.split_at(i);
        if is_number(number) {
            if let Some(unit) = unit_alias(suffix) {
                return format!("{}{}", number, unit);
            }
        }
    }
    token.to_string()
}
