//! Marketplace field extraction and listing fingerprints.
//!
//! Extraction is table driven: every marketplace contributes a [`rules::SourceRules`] table and
//! a single [`Extractor`] walks it. Parsing is synchronous and never touches the network.

use scraper::{ElementRef, Selector};
use thiserror::Error;

pub mod dates;
pub mod extract;
pub mod fingerprint;
pub mod numbers;
pub mod rules;

pub use dates::{DateEvidence, DateResolver, ResolvedDate};
pub use extract::{Extraction, Extractor, ExtractorConfig, UnknownDatePolicy};
pub use fingerprint::{content_hash, external_id, normalize_listing_url};
pub use numbers::{parse_price, parse_rooms, parse_size, NumberKind};
pub use rules::{rules_for, Rule, SourceRules};

pub const CRATE_NAME: &str = "flatwatch-adapters";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector {selector:?}: {message}")]
    Selector { selector: String, message: String },
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("no listing link in result card")]
    MissingLink,
    #[error("invalid listing url {0:?}")]
    InvalidUrl(String),
}

pub(crate) fn parse_selector(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| ExtractError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

/// Visible text of an element, whitespace collapsed.
pub(crate) fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].trim_end().to_string(),
        None => text.to_string(),
    }
}
