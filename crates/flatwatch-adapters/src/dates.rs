//! Posting-date resolution and the recency window.

use std::sync::OnceLock;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;

/// Words that mark a relative day keyword as the publication date.
const PUBLICATION_WORDS: &[&str] = &[
    "eingestellt",
    "online",
    "veröffentlicht",
    "erstellt",
    "published",
    "posted",
];

/// Oldest and newest age (in days) a date found by scanning free text may have.
const SCAN_MIN_AGE: i64 = -1;
const SCAN_MAX_AGE: i64 = 30;

fn absolute_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\d{1,2})\.(\d{1,2})\.(\d{4})\b").expect("valid regex"))
}

fn relative_with_time_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(heute|today|gestern|yesterday)\s*,?\s*(?:um\s+)?(\d{1,2}):(\d{2})")
            .expect("valid regex")
    })
}

fn days_ago_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bvor\s+(\d{1,3})\s+tag").expect("valid regex"))
}

fn relative_word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(heute|today|gestern|yesterday)\b").expect("valid regex"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateEvidence {
    Absolute,
    Relative,
    TextScan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedDate {
    /// Local calendar day in the reference timezone.
    pub day: NaiveDate,
    pub posted_at: DateTime<Utc>,
    pub evidence: DateEvidence,
}

/// Resolves posting dates relative to `now`, in calendar days of `tz`.
#[derive(Debug, Clone, Copy)]
pub struct DateResolver {
    tz: Tz,
    now: DateTime<Utc>,
}

impl DateResolver {
    pub fn new(tz: Tz, now: DateTime<Utc>) -> Self {
        Self { tz, now }
    }

    pub fn today(&self) -> NaiveDate {
        self.now.with_timezone(&self.tz).date_naive()
    }

    /// Age in whole calendar days; negative for dates in the future.
    pub fn age_days(&self, day: NaiveDate) -> i64 {
        (self.today() - day).num_days()
    }

    /// `date_texts` come from the source's date selectors, in rule order; `fragment_text` is
    /// the whole text of the card or page and is only scanned when they yield nothing.
    pub fn resolve(&self, date_texts: &[String], fragment_text: &str) -> Option<ResolvedDate> {
        date_texts
            .iter()
            .find_map(|text| self.absolute_in(text))
            .or_else(|| date_texts.iter().find_map(|text| self.relative_in(text)))
            .or_else(|| self.scan(fragment_text))
    }

    fn local(&self, at: NaiveDateTime) -> DateTime<Utc> {
        self.tz
            .from_local_datetime(&at)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&at))
    }

    fn at_day(&self, day: NaiveDate, evidence: DateEvidence) -> ResolvedDate {
        ResolvedDate {
            day,
            posted_at: self.local(day.and_time(NaiveTime::MIN)),
            evidence,
        }
    }

    fn absolute_dates<'a>(&'a self, text: &'a str) -> impl Iterator<Item = NaiveDate> + 'a {
        absolute_date_re().captures_iter(text).filter_map(|caps| {
            let day = caps[1].parse().ok()?;
            let month = caps[2].parse().ok()?;
            let year = caps[3].parse().ok()?;
            NaiveDate::from_ymd_opt(year, month, day)
        })
    }

    fn absolute_in(&self, text: &str) -> Option<ResolvedDate> {
        self.absolute_dates(text)
            .next()
            .map(|day| self.at_day(day, DateEvidence::Absolute))
    }

    fn relative_in(&self, text: &str) -> Option<ResolvedDate> {
        let today = self.today();
        let day_for = |word: &str| {
            let word = word.to_lowercase();
            if word == "heute" || word == "today" {
                today
            } else {
                today - Duration::days(1)
            }
        };

        if let Some(caps) = relative_with_time_re().captures(text) {
            let day = day_for(&caps[1]);
            let time = caps[2]
                .parse()
                .ok()
                .zip(caps[3].parse().ok())
                .and_then(|(h, m)| NaiveTime::from_hms_opt(h, m, 0))
                .unwrap_or(NaiveTime::MIN);
            return Some(ResolvedDate {
                day,
                posted_at: self.local(day.and_time(time)),
                evidence: DateEvidence::Relative,
            });
        }

        if let Some(caps) = days_ago_re().captures(text) {
            let days: i64 = caps[1].parse().ok()?;
            return Some(self.at_day(today - Duration::days(days), DateEvidence::Relative));
        }

        let lower = text.to_lowercase();
        let qualified = PUBLICATION_WORDS.iter().any(|w| lower.contains(w));
        if qualified {
            if let Some(caps) = relative_word_re().captures(text) {
                let day = day_for(&caps[1]);
                let posted_at = if day == today {
                    self.now
                } else {
                    self.now - Duration::days(1)
                };
                return Some(ResolvedDate {
                    day,
                    posted_at,
                    evidence: DateEvidence::Relative,
                });
            }
        }
        None
    }

    /// Most recent plausible absolute date anywhere in the text.
    fn scan(&self, text: &str) -> Option<ResolvedDate> {
        self.absolute_dates(text)
            .filter(|day| (SCAN_MIN_AGE..=SCAN_MAX_AGE).contains(&self.age_days(*day)))
            .max()
            .map(|day| self.at_day(day, DateEvidence::TextScan))
    }

    /// One day of clock skew is tolerated; anything older than `max_age_days` is rejected.
    pub fn is_recent(&self, day: NaiveDate, max_age_days: i64) -> bool {
        (-1..=max_age_days).contains(&self.age_days(day))
    }
}
