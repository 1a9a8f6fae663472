//! Core domain model for flatwatch: listings, recipients, search targets and delivery records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

pub const CRATE_NAME: &str = "flatwatch-core";

/// Length of a freshly granted trial window.
pub const TRIAL_DAYS: i64 = 14;
/// Length of a paid subscription window when none is given explicitly.
pub const SUBSCRIPTION_DAYS: i64 = 30;
/// Notifications per recipient per calendar day unless overridden.
pub const DEFAULT_DAILY_CAP: u32 = 50;
pub const DESCRIPTION_MAX_CHARS: usize = 500;
pub const TITLE_MAX_CHARS: usize = 200;
pub const TITLE_PLACEHOLDER: &str = "Untitled listing";

/// Marketplace a listing was extracted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Kleinanzeigen,
    Immowelt,
    Immoscout,
}

impl Source {
    pub const ALL: [Source; 3] = [Source::Kleinanzeigen, Source::Immowelt, Source::Immoscout];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Kleinanzeigen => "kleinanzeigen",
            Source::Immowelt => "immowelt",
            Source::Immoscout => "immoscout",
        }
    }

    pub fn domain(&self) -> &'static str {
        match self {
            Source::Kleinanzeigen => "kleinanzeigen.de",
            Source::Immowelt => "immowelt.de",
            Source::Immoscout => "immobilienscout24.de",
        }
    }

    /// Resolve the marketplace from a search or listing URL by its host.
    pub fn from_url(url: &str) -> Option<Self> {
        let parsed = Url::parse(url).ok()?;
        let host = parsed.host_str()?;
        Self::ALL
            .into_iter()
            .find(|source| host == source.domain() || host.ends_with(&format!(".{}", source.domain())))
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|source| source.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown source {s:?}"))
    }
}

/// One marketplace advertisement snapshot. Created once per extraction, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub source: Source,
    pub external_id: String,
    pub content_hash: String,
    pub title: String,
    /// Whole currency units; `None` means price on request.
    pub price: Option<i64>,
    /// Square meters, truncated.
    pub size: Option<i64>,
    /// Decimal kept as text so that `2.5` survives.
    pub rooms: Option<String>,
    pub location: Option<String>,
    pub description: String,
    pub url: String,
    pub date_posted: Option<DateTime<Utc>>,
    pub date_found: DateTime<Utc>,
}

impl Listing {
    /// Key used for per-recipient delivery dedup: the external id when present, else the content hash.
    pub fn listing_key(&self) -> &str {
        if self.external_id.trim().is_empty() {
            &self.content_hash
        } else {
            &self.external_id
        }
    }
}

/// Optional bounds a recipient attaches to a search target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingCriteria {
    #[serde(default)]
    pub max_price: Option<i64>,
    #[serde(default)]
    pub min_size: Option<i64>,
    #[serde(default)]
    pub max_size: Option<i64>,
    #[serde(default)]
    pub excluded_keywords: Vec<String>,
}

/// A marketplace search URL a recipient monitors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchTarget {
    pub url: String,
    #[serde(default)]
    pub location_filters: Vec<String>,
    #[serde(default)]
    pub criteria: ListingCriteria,
}

impl SearchTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            location_filters: Vec::new(),
            criteria: ListingCriteria::default(),
        }
    }

    pub fn with_location_filters(mut self, filters: Vec<String>) -> Self {
        self.location_filters = filters;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    Trial,
    #[default]
    Subscription,
}

/// Per-recipient access and cadence state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientAccessState {
    #[serde(default)]
    pub access_mode: AccessMode,
    #[serde(default)]
    pub trial_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub trial_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub subscription_expires_at: Option<DateTime<Utc>>,
    /// Set once the recipient moved to subscription mode; a trial can never be granted again.
    #[serde(default)]
    pub converted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub trial_expired_notified: bool,
    /// Per-recipient override of the daily notification cap.
    #[serde(default)]
    pub daily_cap: Option<u32>,
    /// Deliveries counted for the calendar day of `last_cycle_at`.
    #[serde(default)]
    pub daily_notification_count: u32,
    #[serde(default)]
    pub last_cycle_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_due_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub targets: Vec<SearchTarget>,
    #[serde(default)]
    pub access: RecipientAccessState,
}

impl Recipient {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            targets: Vec::new(),
            access: RecipientAccessState::default(),
        }
    }

    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }
}

/// What the messaging channel reported for a confirmed send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelOutcome {
    pub channel: String,
    #[serde(default)]
    pub message_ref: Option<String>,
}

/// Proof that one listing was delivered to one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub recipient_id: String,
    pub listing_key: String,
    pub sent_at: DateTime<Utc>,
    pub channel_outcome: ChannelOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn listing(external_id: &str) -> Listing {
        Listing {
            source: Source::Kleinanzeigen,
            external_id: external_id.to_string(),
            content_hash: "abc123".to_string(),
            title: "2 Zimmer Altbau".to_string(),
            price: Some(750),
            size: Some(54),
            rooms: Some("2".to_string()),
            location: Some("64283 Darmstadt".to_string()),
            description: String::new(),
            url: "https://www.kleinanzeigen.de/s-anzeige/x/123-203-1".to_string(),
            date_posted: None,
            date_found: Utc.with_ymd_and_hms(2026, 10, 19, 10, 0, 0).unwrap(),
        }
    }

    #[test]
    fn listing_key_prefers_external_id() {
        assert_eq!(listing("2891").listing_key(), "2891");
        assert_eq!(listing("  ").listing_key(), "abc123");
    }

    #[test]
    fn source_is_resolved_from_host() {
        assert_eq!(
            Source::from_url("https://www.kleinanzeigen.de/s-wohnung-mieten/darmstadt/c203l4888"),
            Some(Source::Kleinanzeigen)
        );
        assert_eq!(
            Source::from_url("https://www.immowelt.de/classified-search?locations=AD08DE6345"),
            Some(Source::Immowelt)
        );
        assert_eq!(
            Source::from_url("https://www.immobilienscout24.de/Suche/de/hessen/darmstadt/wohnung-mieten"),
            Some(Source::Immoscout)
        );
        assert_eq!(Source::from_url("https://example.com/immowelt.de"), None);
        assert_eq!(
            Source::from_url("https://agent@WWW.Immowelt.de:443/expose/2k9fj4"),
            Some(Source::Immowelt)
        );
        assert_eq!(Source::from_url("https://immowelt.de.mirror.test/expose/2k9fj4"), None);
        assert_eq!(Source::from_url("www.immowelt.de/expose/2k9fj4"), None);
        assert_eq!("Immowelt".parse::<Source>(), Ok(Source::Immowelt));
    }

    #[test]
    fn recipient_state_defaults_when_fields_are_missing() {
        let recipient: Recipient = serde_json::from_str(r#"{"id":"42"}"#).unwrap();
        assert_eq!(recipient.access.access_mode, AccessMode::Subscription);
        assert!(recipient.targets.is_empty());
        assert!(recipient.access.next_due_at.is_none());
        assert_eq!(recipient.label(), "42");
    }
}
