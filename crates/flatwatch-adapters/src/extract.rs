use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use flatwatch_core::{
    Listing, Source, DESCRIPTION_MAX_CHARS, TITLE_MAX_CHARS, TITLE_PLACEHOLDER,
};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::dates::DateResolver;
use crate::fingerprint::{content_hash, external_id, normalize_listing_url};
use crate::numbers::{parse_price, parse_rooms, parse_size};
use crate::rules::{rules_for, Rule, SourceRules};
use crate::{element_text, parse_selector, truncate_chars, ExtractError};

const LOCATION_MAX_CHARS: usize = 100;
/// Postcode and town name in free text. The town may carry a spa prefix (`Bad Vilbel`),
/// hyphenated parts (`Mörfelden-Walldorf`) and one river suffix (`Frankfurt am Main`); the
/// words after it are left out.
const LOCATION_FALLBACK: &str = r"\d{5}[ \t]+(?:(?:Bad|Sankt|St\.)[ \t])?[A-ZÄÖÜ][a-zäöüß]+(?:-[A-ZÄÖÜ][a-zäöüß]+)*(?:[ \t](?:am|an[ \t]der|im|in[ \t]der)[ \t][A-ZÄÖÜ][a-zäöüß]+)?";

/// What to do with a listing whose posting date cannot be resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnknownDatePolicy {
    #[default]
    AssumeFresh,
    AssumeStale,
}

impl FromStr for UnknownDatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fresh" => Ok(Self::AssumeFresh),
            "stale" => Ok(Self::AssumeStale),
            other => Err(format!("expected `fresh` or `stale`, got {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExtractorConfig {
    /// Listings older than this many calendar days are rejected.
    pub max_age_days: i64,
    pub unknown_date: UnknownDatePolicy,
    pub timezone: Tz,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            max_age_days: 1,
            unknown_date: UnknownDatePolicy::AssumeFresh,
            timezone: chrono_tz::Europe::Berlin,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Listing(Box<Listing>),
    /// Parsed fine but outside the recency window.
    TooOld {
        title: String,
        date_posted: Option<DateTime<Utc>>,
    },
}

#[derive(Debug)]
enum CompiledRule {
    Text(Selector),
    Attr(Selector, &'static str),
    Labeled {
        items: Selector,
        label: &'static str,
        exclude: &'static [&'static str],
    },
    Pattern(Regex),
}

impl CompiledRule {
    fn compile(rule: &Rule) -> Result<Self, ExtractError> {
        Ok(match *rule {
            Rule::Text(sel) => Self::Text(parse_selector(sel)?),
            Rule::Attr(sel, attr) => Self::Attr(parse_selector(sel)?, attr),
            Rule::Labeled {
                items,
                label,
                exclude,
            } => Self::Labeled {
                items: parse_selector(items)?,
                label,
                exclude,
            },
            Rule::Pattern(pattern) => Self::Pattern(Regex::new(pattern)?),
        })
    }
}

fn compile_all(rules: &[Rule]) -> Result<Vec<CompiledRule>, ExtractError> {
    rules.iter().map(CompiledRule::compile).collect()
}

#[derive(Debug)]
struct CompiledRules {
    table: &'static SourceRules,
    cards: Vec<Selector>,
    link: Vec<CompiledRule>,
    id: Vec<CompiledRule>,
    id_from_url: Vec<Regex>,
    title: Vec<CompiledRule>,
    price: Vec<CompiledRule>,
    size: Vec<CompiledRule>,
    rooms: Vec<CompiledRule>,
    location: Vec<CompiledRule>,
    description: Vec<CompiledRule>,
    date: Vec<Selector>,
}

impl CompiledRules {
    fn compile(table: &'static SourceRules) -> Result<Self, ExtractError> {
        Ok(Self {
            table,
            cards: table
                .cards
                .iter()
                .map(|s| parse_selector(s))
                .collect::<Result<_, _>>()?,
            link: compile_all(table.link)?,
            id: compile_all(table.id)?,
            id_from_url: table
                .id_from_url
                .iter()
                .map(|p| Regex::new(p))
                .collect::<Result<_, _>>()?,
            title: compile_all(table.title)?,
            price: compile_all(table.price)?,
            size: compile_all(table.size)?,
            rooms: compile_all(table.rooms)?,
            location: compile_all(table.location)?,
            description: compile_all(table.description)?,
            date: table
                .date
                .iter()
                .map(|s| parse_selector(s))
                .collect::<Result<_, _>>()?,
        })
    }
}

/// One result card or detail page, with its flattened text.
struct Fragment<'a> {
    scope: ElementRef<'a>,
    text: String,
}

impl<'a> Fragment<'a> {
    fn new(scope: ElementRef<'a>) -> Self {
        Self {
            text: element_text(scope),
            scope,
        }
    }

    /// Matching elements, the scope itself first when it matches.
    fn select<'s>(&'s self, sel: &'s Selector) -> impl Iterator<Item = ElementRef<'a>> + 's {
        std::iter::once(self.scope)
            .filter(move |el| sel.matches(el))
            .chain(self.scope.select(sel))
    }
}

/// Rule-table driven field extraction for all supported marketplaces.
#[derive(Debug)]
pub struct Extractor {
    config: ExtractorConfig,
    compiled: BTreeMap<Source, CompiledRules>,
    value_cell: Selector,
    location_fallback: Regex,
}

impl Extractor {
    pub fn new(config: ExtractorConfig) -> Result<Self, ExtractError> {
        let compiled = Source::ALL
            .into_iter()
            .map(|source| CompiledRules::compile(rules_for(source)).map(|rules| (source, rules)))
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(Self {
            config,
            compiled,
            value_cell: parse_selector("[class*='value']")?,
            location_fallback: Regex::new(LOCATION_FALLBACK)?,
        })
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    fn rules(&self, source: Source) -> &CompiledRules {
        // every Source is compiled in `new`
        &self.compiled[&source]
    }

    /// Split a search result page into cards and extract each one.
    pub fn extract_result_set(
        &self,
        source: Source,
        html: &str,
        search_url: &str,
        now: DateTime<Utc>,
    ) -> Vec<Result<Extraction, ExtractError>> {
        let document = Html::parse_document(html);
        let rules = self.rules(source);
        let cards = rules
            .cards
            .iter()
            .map(|sel| document.select(sel).collect::<Vec<_>>())
            .find(|cards| !cards.is_empty())
            .unwrap_or_default();
        debug!(source = %source, cards = cards.len(), "split result page");

        cards
            .into_iter()
            .map(|card| self.extract_card(source, card, search_url, now))
            .collect()
    }

    /// Extract one result card; relative links resolve against `search_url`.
    pub fn extract_card(
        &self,
        source: Source,
        card: ElementRef<'_>,
        search_url: &str,
        now: DateTime<Utc>,
    ) -> Result<Extraction, ExtractError> {
        let rules = self.rules(source);
        let fragment = Fragment::new(card);
        let url = self
            .first_value(&rules.link, &fragment, |href| {
                normalize_listing_url(search_url, href, rules.table.strip_query)
            })
            .ok_or(ExtractError::MissingLink)?;
        self.build(source, &fragment, url, now)
    }

    /// Extract a whole detail page whose own address is `url`.
    pub fn extract_document(
        &self,
        source: Source,
        html: &str,
        url: &str,
        now: DateTime<Utc>,
    ) -> Result<Extraction, ExtractError> {
        let rules = self.rules(source);
        let url = normalize_listing_url(url, url, rules.table.strip_query)
            .ok_or_else(|| ExtractError::InvalidUrl(url.to_string()))?;
        let document = Html::parse_document(html);
        let fragment = Fragment::new(document.root_element());
        self.build(source, &fragment, url, now)
    }

    fn build(
        &self,
        source: Source,
        fragment: &Fragment<'_>,
        url: String,
        now: DateTime<Utc>,
    ) -> Result<Extraction, ExtractError> {
        let rules = self.rules(source);
        let title = self
            .first_value(&rules.title, fragment, |t| Some(truncate_chars(t, TITLE_MAX_CHARS)))
            .unwrap_or_else(|| TITLE_PLACEHOLDER.to_string());

        let resolver = DateResolver::new(self.config.timezone, now);
        let date_texts: Vec<String> = rules
            .date
            .iter()
            .flat_map(|sel| fragment.select(sel).map(element_text).collect::<Vec<_>>())
            .filter(|t| !t.is_empty())
            .collect();
        let date_posted = match resolver.resolve(&date_texts, &fragment.text) {
            Some(resolved) if resolver.is_recent(resolved.day, self.config.max_age_days) => {
                Some(resolved.posted_at)
            }
            Some(resolved) => {
                return Ok(Extraction::TooOld {
                    title,
                    date_posted: Some(resolved.posted_at),
                })
            }
            None => match self.config.unknown_date {
                UnknownDatePolicy::AssumeFresh => None,
                UnknownDatePolicy::AssumeStale => {
                    return Ok(Extraction::TooOld {
                        title,
                        date_posted: None,
                    })
                }
            },
        };

        let price = self.first_value(&rules.price, fragment, parse_price);
        let size = self.first_value(&rules.size, fragment, parse_size);
        let rooms = self.first_value(&rules.rooms, fragment, parse_rooms);
        let location = self
            .first_value(&rules.location, fragment, |l| Some(l.to_string()))
            .or_else(|| {
                self.location_fallback
                    .find(&fragment.text)
                    .map(|m| m.as_str().trim().to_string())
                    .filter(|l| !l.is_empty())
            })
            .map(|l| truncate_chars(&l, LOCATION_MAX_CHARS));
        let description = self
            .first_value(&rules.description, fragment, |d| {
                Some(truncate_chars(d, DESCRIPTION_MAX_CHARS))
            })
            .unwrap_or_default();

        let attr_id = self.first_value(&rules.id, fragment, |id| Some(id.to_string()));
        let external_id = external_id(
            attr_id.as_deref(),
            &url,
            &rules.id_from_url,
            rules.table.id_prefix,
        );
        let content_hash = content_hash(source, &title, price, location.as_deref());

        Ok(Extraction::Listing(Box::new(Listing {
            source,
            external_id,
            content_hash,
            title,
            price,
            size,
            rooms,
            location,
            description,
            url,
            date_posted,
            date_found: now,
        })))
    }

    /// Try rules in order; the first one whose raw value also survives `parse` wins.
    fn first_value<T>(
        &self,
        rules: &[CompiledRule],
        fragment: &Fragment<'_>,
        parse: impl Fn(&str) -> Option<T>,
    ) -> Option<T> {
        rules
            .iter()
            .filter_map(|rule| self.raw_value(rule, fragment))
            .find_map(|raw| parse(&raw))
    }

    fn raw_value(&self, rule: &CompiledRule, fragment: &Fragment<'_>) -> Option<String> {
        let value = match rule {
            CompiledRule::Text(sel) => fragment.select(sel).map(element_text).find(|t| !t.is_empty()),
            CompiledRule::Attr(sel, attr) => fragment
                .select(sel)
                .filter_map(|el| el.value().attr(attr))
                .map(|v| v.trim().to_string())
                .find(|v| !v.is_empty()),
            CompiledRule::Labeled {
                items,
                label,
                exclude,
            } => fragment
                .scope
                .select(items)
                .find(|item| {
                    let lower = element_text(*item).to_lowercase();
                    lower.contains(label) && !exclude.iter().any(|e| lower.contains(e))
                })
                .map(|item| self.labeled_value(item)),
            CompiledRule::Pattern(re) => re.captures(&fragment.text).and_then(|caps| {
                caps.get(1)
                    .or_else(|| caps.get(0))
                    .map(|m| m.as_str().to_string())
            }),
        };
        value.filter(|v| !v.trim().is_empty())
    }

    /// `dt` rows take the following `dd`; other rows their value cell or their own text.
    fn labeled_value(&self, item: ElementRef<'_>) -> String {
        if item.value().name() == "dt" {
            if let Some(dd) = item.next_siblings().filter_map(ElementRef::wrap).next() {
                return element_text(dd);
            }
        }
        item.select(&self.value_cell)
            .next()
            .map(element_text)
            .unwrap_or_else(|| element_text(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 10, 0, 0).unwrap()
    }

    fn extractor(unknown_date: UnknownDatePolicy) -> Extractor {
        Extractor::new(ExtractorConfig {
            unknown_date,
            ..ExtractorConfig::default()
        })
        .expect("rule tables compile")
    }

    const CARD_PAGE: &str = r#"
        <html><body><ul>
        <li><article class="aditem" data-adid="2891000001">
            <div class="aditem-main--top--left">64289 Darmstadt</div>
            <div class="aditem-main--top--right">18.10.2026</div>
            <h2><a href="/s-anzeige/wohnung/2891000001-203-4888">Wohnung am Park</a></h2>
            <p class="aditem-main--middle--price-shipping--price">VB</p>
        </article></li>
        <li><article class="aditem">
            <h2>Ohne Link</h2>
        </article></li>
        </ul></body></html>
    "#;

    #[test]
    fn card_attribute_id_and_missing_link() {
        let out = extractor(UnknownDatePolicy::AssumeFresh).extract_result_set(
            Source::Kleinanzeigen,
            CARD_PAGE,
            "https://www.kleinanzeigen.de/s-wohnung-mieten/darmstadt/c203l4888",
            now(),
        );
        assert_eq!(out.len(), 2);
        let Ok(Extraction::Listing(listing)) = &out[0] else {
            panic!("expected listing, got {:?}", out[0]);
        };
        assert_eq!(listing.external_id, "2891000001");
        assert_eq!(listing.price, None);
        assert_eq!(listing.location.as_deref(), Some("64289 Darmstadt"));
        assert_eq!(
            listing.url,
            "https://www.kleinanzeigen.de/s-anzeige/wohnung/2891000001-203-4888"
        );
        assert!(matches!(out[1], Err(ExtractError::MissingLink)));
    }

    #[test]
    fn unknown_date_follows_policy() {
        let html = r#"<html><body><h1>Zimmer frei</h1><p>Kaltmiete 420 €</p></body></html>"#;
        let url = "https://www.kleinanzeigen.de/s-anzeige/zimmer-frei/2891000002-199-4888";

        let fresh = extractor(UnknownDatePolicy::AssumeFresh)
            .extract_document(Source::Kleinanzeigen, html, url, now())
            .unwrap();
        let Extraction::Listing(listing) = fresh else {
            panic!("expected listing");
        };
        assert_eq!(listing.title, "Zimmer frei");
        assert_eq!(listing.price, Some(420));
        assert_eq!(listing.external_id, "2891000002");
        assert!(listing.date_posted.is_none());

        let stale = extractor(UnknownDatePolicy::AssumeStale)
            .extract_document(Source::Kleinanzeigen, html, url, now())
            .unwrap();
        assert!(matches!(stale, Extraction::TooOld { date_posted: None, .. }));
    }

    #[test]
    fn title_falls_back_to_placeholder() {
        let html = r#"<html><body><div>Nur Text, 3 Zimmer</div></body></html>"#;
        let out = extractor(UnknownDatePolicy::AssumeFresh)
            .extract_document(
                Source::Immoscout,
                html,
                "https://www.immobilienscout24.de/expose/150000001",
                now(),
            )
            .unwrap();
        let Extraction::Listing(listing) = out else {
            panic!("expected listing");
        };
        assert_eq!(listing.title, TITLE_PLACEHOLDER);
        assert_eq!(listing.rooms.as_deref(), Some("3"));
        assert_eq!(listing.external_id, "immoscout_150000001");
    }

    #[test]
    fn location_fallback_stops_after_the_town() {
        let extractor = extractor(UnknownDatePolicy::AssumeFresh);
        let location = |text: &str| {
            let html = format!("<html><body><h1>Altbau mit Balkon</h1><div>{text}</div></body></html>");
            let out = extractor
                .extract_document(
                    Source::Immoscout,
                    &html,
                    "https://www.immobilienscout24.de/expose/150000002",
                    now(),
                )
                .unwrap();
            let Extraction::Listing(listing) = out else {
                panic!("expected listing");
            };
            listing.location
        };

        assert_eq!(
            location("Kaltmiete 980 € 64283 Darmstadt Bessungen ruhige Lage Ab sofort frei").as_deref(),
            Some("64283 Darmstadt")
        );
        assert_eq!(
            location("60311 Frankfurt am Main Altstadt").as_deref(),
            Some("60311 Frankfurt am Main")
        );
        assert_eq!(
            location("Lage: 64546 Mörfelden-Walldorf Nähe S-Bahn").as_deref(),
            Some("64546 Mörfelden-Walldorf")
        );
        assert_eq!(location("61118 Bad Vilbel Zentrum").as_deref(), Some("61118 Bad Vilbel"));
        assert_eq!(location("Lage auf Anfrage"), None);
    }

    #[test]
    fn unknown_date_policy_parses() {
        assert_eq!("Fresh".parse(), Ok(UnknownDatePolicy::AssumeFresh));
        assert_eq!("stale".parse(), Ok(UnknownDatePolicy::AssumeStale));
        assert!("maybe".parse::<UnknownDatePolicy>().is_err());
    }
}
