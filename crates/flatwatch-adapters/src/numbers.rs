//! Locale-aware parsing of prices, areas and room counts.
//!
//! German listings mix `.` and `,` as group and decimal separators. Only the last separator
//! can be a decimal point, and only when the digits after it look like a fraction for the kind
//! of quantity being parsed. Every other separator is a group separator and is dropped.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberKind {
    /// Decimal point only before exactly two trailing digits (`753,71`).
    Currency,
    /// Decimal point before one or two trailing digits (`2,5`, `78,25`).
    Measure,
}

fn is_group_space(ch: char) -> bool {
    ch == '\u{a0}' || ch == '\u{202f}'
}

fn is_separator(ch: char) -> bool {
    ch == '.' || ch == ',' || is_group_space(ch)
}

/// A plain space groups thousands only between a digit and exactly three digits (`1 180 €`).
fn is_space_group(token: &str, idx: usize) -> bool {
    let bytes = token.as_bytes();
    let before = idx.checked_sub(1).and_then(|i| bytes.get(i));
    let group = bytes.get(idx + 1..idx + 4);
    let after = bytes.get(idx + 4);
    before.is_some_and(u8::is_ascii_digit)
        && group.is_some_and(|g| g.iter().all(u8::is_ascii_digit))
        && !after.is_some_and(u8::is_ascii_digit)
}

/// First numeric token of `text`, separators included, trailing separators trimmed.
fn first_token(text: &str) -> Option<&str> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let rest = &text[start..];
    let end = rest
        .char_indices()
        .find(|&(idx, c)| {
            let part_of_number =
                c.is_ascii_digit() || is_separator(c) || (c == ' ' && is_space_group(rest, idx));
            !part_of_number
        })
        .map(|(idx, _)| idx)
        .unwrap_or(rest.len());
    Some(rest[..end].trim_end_matches(is_separator))
}

/// Normalize the first number in `text` to a plain decimal string such as `1540` or `2.5`.
pub fn normalize_number(text: &str, kind: NumberKind) -> Option<String> {
    let token = first_token(text)?;
    let decimal_at = token.rfind(['.', ',']).filter(|idx| {
        let fraction = &token[idx + 1..];
        let all_digits = fraction.chars().all(|c| c.is_ascii_digit());
        let len = fraction.len();
        all_digits
            && match kind {
                NumberKind::Currency => len == 2,
                NumberKind::Measure => (1..=2).contains(&len),
            }
    });

    let digits = |s: &str| s.chars().filter(char::is_ascii_digit).collect::<String>();
    let (whole, fraction) = match decimal_at {
        Some(idx) => (digits(&token[..idx]), Some(digits(&token[idx + 1..]))),
        None => (digits(token), None),
    };
    let whole = if whole.is_empty() { "0".to_string() } else { whole };
    Some(match fraction {
        Some(fraction) => format!("{whole}.{fraction}"),
        None => whole,
    })
}

fn whole_part(normalized: &str) -> Option<i64> {
    normalized.split('.').next()?.parse().ok()
}

/// Whole currency units; zero or negative amounts are treated as absent.
pub fn parse_price(text: &str) -> Option<i64> {
    normalize_number(text, NumberKind::Currency)
        .and_then(|n| whole_part(&n))
        .filter(|v| *v > 0)
}

/// Square meters, truncated; zero is treated as absent.
pub fn parse_size(text: &str) -> Option<i64> {
    normalize_number(text, NumberKind::Measure)
        .and_then(|n| whole_part(&n))
        .filter(|v| *v > 0)
}

/// Room count kept as a decimal string so half rooms survive.
pub fn parse_rooms(text: &str) -> Option<String> {
    let normalized = normalize_number(text, NumberKind::Measure)?;
    let value: f64 = normalized.parse().ok()?;
    (value > 0.0).then_some(normalized)
}
