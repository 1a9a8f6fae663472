//! Content hashing, marketplace ids and listing URL normalization.

use flatwatch_core::Source;
use regex::Regex;
use sha2::{Digest, Sha256};
use url::Url;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Lowercase and collapse runs of whitespace.
pub fn normalize_fragment(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Stable hash over normalized title, price, location and source.
pub fn content_hash(source: Source, title: &str, price: Option<i64>, location: Option<&str>) -> String {
    let price = price.map(|p| p.to_string()).unwrap_or_default();
    let material = [
        normalize_fragment(title),
        price,
        normalize_fragment(location.unwrap_or_default()),
        source.as_str().to_string(),
    ]
    .join("|");
    sha256_hex(material.as_bytes())
}

/// Resolve `href` against `base` and drop the fragment, and the query when asked to.
pub fn normalize_listing_url(base: &str, href: &str, strip_query: bool) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with("javascript:") || href.starts_with('#') {
        return None;
    }
    let mut url = match Url::parse(base) {
        Ok(base) => base.join(href).ok()?,
        Err(_) => Url::parse(href).ok()?,
    };
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);
    if strip_query {
        url.set_query(None);
    }
    Some(url.to_string())
}

/// Id from the card attribute when present, else from the URL, else a URL digest.
pub fn external_id(
    attr_id: Option<&str>,
    url: &str,
    id_from_url: &[Regex],
    prefix: Option<&str>,
) -> String {
    let raw = attr_id
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(ToString::to_string)
        .or_else(|| {
            id_from_url.iter().find_map(|re| {
                re.captures(url)
                    .and_then(|caps| caps.get(1))
                    .map(|m| m.as_str().to_string())
            })
        })
        .unwrap_or_else(|| sha256_hex(url.trim().to_lowercase().as_bytes())[..16].to_string());
    match prefix {
        Some(prefix) if !raw.starts_with(prefix) => format!("{prefix}{raw}"),
        _ => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_ignores_case_and_whitespace() {
        let a = content_hash(Source::Immowelt, "Helle  Wohnung\n", Some(900), Some("60311 Frankfurt"));
        let b = content_hash(Source::Immowelt, "helle wohnung", Some(900), Some("60311  frankfurt"));
        let c = content_hash(Source::Kleinanzeigen, "helle wohnung", Some(900), Some("60311 frankfurt"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn urls_are_resolved_and_trimmed() {
        assert_eq!(
            normalize_listing_url(
                "https://www.kleinanzeigen.de/s-wohnung-mieten/darmstadt/c203l4888",
                "/s-anzeige/helle-wohnung/2891734412-203-4888#gallery",
                false
            )
            .as_deref(),
            Some("https://www.kleinanzeigen.de/s-anzeige/helle-wohnung/2891734412-203-4888")
        );
        assert_eq!(
            normalize_listing_url("https://www.immowelt.de/suche", "https://www.immowelt.de/expose/2b8kq5a?bc=13", true)
                .as_deref(),
            Some("https://www.immowelt.de/expose/2b8kq5a")
        );
        assert_eq!(normalize_listing_url("https://www.immowelt.de/", "javascript:void(0)", true), None);
    }

    #[test]
    fn external_id_prefers_attribute_then_url_then_digest() {
        let patterns = vec![Regex::new(r"/expose/(\d+)").unwrap()];
        let url = "https://www.immobilienscout24.de/expose/151234567";
        assert_eq!(
            external_id(Some("151234567"), url, &patterns, Some("immoscout_")),
            "immoscout_151234567"
        );
        assert_eq!(external_id(None, url, &patterns, Some("immoscout_")), "immoscout_151234567");

        let digest = external_id(None, "https://www.immobilienscout24.de/other", &patterns, None);
        assert_eq!(digest.len(), 16);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
