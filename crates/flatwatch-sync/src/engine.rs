//! The cycle orchestrator: fetch every target once, store new listings, fan them out.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use flatwatch_adapters::{Extraction, Extractor};
use flatwatch_core::{DeliveryRecord, Listing, Recipient, Source};
use flatwatch_storage::{
    FetchError, FetchedPage, HealthDetector, InsertOutcome, PageFetcher, RetryPolicy, Store,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::access::{has_access, trial_expired_message, trial_notice_due, AccessCommand};
use crate::config::SyncConfig;
use crate::dispatch::{Dispatcher, MessagingChannel};
use crate::filter;
use crate::rate_limit::DailyBudget;
use crate::registry;
use crate::schedule::{is_due, next_aligned_tick, DUE_GRACE_SECS};
use crate::SyncError;

/// Dispatch failures are escalated once at least this many sends were attempted.
pub const DISPATCH_ALERT_MIN_ATTEMPTS: u32 = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleCounts {
    pub found: u32,
    pub inserted: u32,
    pub known: u32,
    pub sent: u32,
    pub filtered: u32,
    pub deduplicated: u32,
    pub rate_limited: u32,
    pub too_old: u32,
    pub extraction_failed: u32,
    pub dispatch_failed: u32,
    pub fetch_failed: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoTargets,
    NoAccess,
    NotDue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecipientReport {
    pub recipient_id: String,
    pub skipped: Option<SkipReason>,
    pub counts: CycleCounts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    TargetFailed { url: String, reason: String },
    DispatchFailures { failed: u32, attempted: u32 },
    UnknownSource { url: String },
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusEvent::TargetFailed { url, reason } => write!(f, "search target failed: {url} ({reason})"),
            StatusEvent::DispatchFailures { failed, attempted } => {
                write!(f, "{failed} of {attempted} notifications failed this cycle")
            }
            StatusEvent::UnknownSource { url } => write!(f, "no marketplace matches {url}"),
        }
    }
}

/// Aggregate of one cycle. Target-level counts (found, inserted, known, too old, extraction
/// failures) are per distinct URL in `totals` and per subscribed target in each recipient entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub totals: CycleCounts,
    pub recipients: Vec<RecipientReport>,
    pub events: Vec<StatusEvent>,
}

impl CycleReport {
    fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            totals: CycleCounts::default(),
            recipients: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn recipient(&self, id: &str) -> Option<&RecipientReport> {
        self.recipients.iter().find(|r| r.recipient_id == id)
    }

    /// Plain-text diagnostic for the operator chat.
    pub fn summary(&self) -> String {
        let t = &self.totals;
        let mut lines = vec![format!(
            "cycle {}: found {} (new {}), sent {}, filtered {}, deduplicated {}, rate limited {}, too old {}, failed targets {}",
            self.run_id, t.found, t.inserted, t.sent, t.filtered, t.deduplicated, t.rate_limited, t.too_old, t.fetch_failed
        )];
        for r in &self.recipients {
            let c = &r.counts;
            lines.push(match r.skipped {
                Some(reason) => format!("{}: skipped ({reason:?})", r.recipient_id),
                None => format!(
                    "{}: found {}, sent {}, filtered {}, deduplicated {}, rate limited {}, send failures {}",
                    r.recipient_id, c.found, c.sent, c.filtered, c.deduplicated, c.rate_limited, c.dispatch_failed
                ),
            });
        }
        lines.join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// Another cycle held the guard.
    SkippedBusy,
    OutsideWindow,
}

#[derive(Debug, Clone, Copy, Default)]
struct TargetStats {
    too_old: u32,
    extraction_failed: u32,
}

#[derive(Debug, Clone)]
struct TargetBatch {
    listings: Arc<Vec<Listing>>,
    stats: TargetStats,
}

struct CycleContext {
    now: DateTime<Utc>,
    report: CycleReport,
    /// Keyed by target URL. `None` marks a target that failed this cycle.
    targets: HashMap<String, Option<TargetBatch>>,
    attempted: u32,
    failed: u32,
}

impl CycleContext {
    fn raise(&mut self, event: StatusEvent) {
        warn!(event = %event, "status event");
        self.report.events.push(event);
    }
}

pub struct CycleEngine {
    config: SyncConfig,
    store: Arc<dyn Store>,
    fetcher: Arc<dyn PageFetcher>,
    dispatcher: Dispatcher,
    extractor: Extractor,
    health: HealthDetector,
    retry: RetryPolicy,
    guard: Mutex<()>,
}

impl CycleEngine {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn Store>,
        fetcher: Arc<dyn PageFetcher>,
        channel: Arc<dyn MessagingChannel>,
    ) -> Result<Self, SyncError> {
        let extractor = Extractor::new(config.extractor_config())?;
        Ok(Self {
            health: HealthDetector::new(config.min_body_bytes),
            retry: config.retry_policy(),
            dispatcher: Dispatcher::new(channel),
            extractor,
            store,
            fetcher,
            config,
            guard: Mutex::new(()),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// One periodic tick over every recipient. Skipped outside the active window unless
    /// `window_override`, and skipped outright while another cycle runs.
    pub async fn run_cycle(&self, now: DateTime<Utc>, window_override: bool) -> Result<CycleOutcome, SyncError> {
        if !window_override && !self.config.window.contains_instant(now, self.config.timezone) {
            debug!(%now, "tick outside active window");
            return Ok(CycleOutcome::OutsideWindow);
        }
        let Ok(_running) = self.guard.try_lock() else {
            warn!("previous cycle still running; tick skipped");
            return Ok(CycleOutcome::SkippedBusy);
        };
        let recipients = self.store.recipients().await?;
        let report = self.run_recipients(recipients, now, true).await?;
        Ok(CycleOutcome::Completed(report))
    }

    /// Process one recipient now regardless of its cadence. Waits for a running cycle.
    pub async fn run_for_recipient(
        &self,
        recipient_id: &str,
        now: DateTime<Utc>,
        ignore_window: bool,
    ) -> Result<CycleOutcome, SyncError> {
        if !ignore_window && !self.config.window.contains_instant(now, self.config.timezone) {
            return Ok(CycleOutcome::OutsideWindow);
        }
        let _running = self.guard.lock().await;
        let recipient = self
            .store
            .recipient(recipient_id)
            .await?
            .ok_or_else(|| SyncError::UnknownRecipient(recipient_id.to_string()))?;
        let report = self.run_recipients(vec![recipient], now, false).await?;
        Ok(CycleOutcome::Completed(report))
    }

    /// Apply an access command without racing a running cycle.
    pub async fn apply_access(
        &self,
        recipient_id: &str,
        command: AccessCommand,
        now: DateTime<Utc>,
    ) -> Result<Recipient, SyncError> {
        let _running = self.guard.lock().await;
        registry::apply_access(self.store.as_ref(), recipient_id, command, now).await
    }

    /// Wait until no cycle is running.
    pub async fn wait_idle(&self) {
        drop(self.guard.lock().await);
    }

    async fn run_recipients(
        &self,
        recipients: Vec<Recipient>,
        now: DateTime<Utc>,
        respect_cadence: bool,
    ) -> Result<CycleReport, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("cycle", %run_id);
        async move {
            let mut ctx = CycleContext {
                now,
                report: CycleReport::new(run_id, now),
                targets: HashMap::new(),
                attempted: 0,
                failed: 0,
            };
            info!(recipients = recipients.len(), "cycle started");

            for mut recipient in recipients {
                let entry = self.process_recipient(&mut ctx, &mut recipient, respect_cadence).await?;
                let totals = &mut ctx.report.totals;
                totals.sent += entry.counts.sent;
                totals.filtered += entry.counts.filtered;
                totals.deduplicated += entry.counts.deduplicated;
                totals.rate_limited += entry.counts.rate_limited;
                totals.dispatch_failed += entry.counts.dispatch_failed;
                ctx.report.recipients.push(entry);
            }

            if ctx.attempted >= DISPATCH_ALERT_MIN_ATTEMPTS && ctx.failed * 2 >= ctx.attempted {
                ctx.raise(StatusEvent::DispatchFailures {
                    failed: ctx.failed,
                    attempted: ctx.attempted,
                });
            }

            let report = ctx.report;
            for event in &report.events {
                self.notify_operator(&event.to_string()).await;
            }
            if self.config.debug_stats {
                self.notify_operator(&report.summary()).await;
            }

            let t = &report.totals;
            info!(
                found = t.found,
                inserted = t.inserted,
                sent = t.sent,
                filtered = t.filtered,
                deduplicated = t.deduplicated,
                rate_limited = t.rate_limited,
                too_old = t.too_old,
                fetch_failed = t.fetch_failed,
                events = report.events.len(),
                "cycle finished"
            );
            Ok::<_, SyncError>(report)
        }
        .instrument(span)
        .await
    }

    async fn process_recipient(
        &self,
        ctx: &mut CycleContext,
        recipient: &mut Recipient,
        respect_cadence: bool,
    ) -> Result<RecipientReport, SyncError> {
        let now = ctx.now;
        let mut entry = RecipientReport {
            recipient_id: recipient.id.clone(),
            skipped: None,
            counts: CycleCounts::default(),
        };

        if recipient.targets.is_empty() {
            entry.skipped = Some(SkipReason::NoTargets);
            return Ok(entry);
        }

        if !has_access(&recipient.access, now) {
            if trial_notice_due(&recipient.access, now) {
                let notice = trial_expired_message(&self.config.support_contact);
                if self.dispatcher.send_text(&recipient.id, &notice).await.is_some() {
                    recipient.access.trial_expired_notified = true;
                    self.store.save_recipient(recipient).await?;
                    info!(recipient_id = %recipient.id, "trial expiry notice sent");
                }
            }
            debug!(recipient_id = %recipient.id, "no access");
            entry.skipped = Some(SkipReason::NoAccess);
            return Ok(entry);
        }

        if respect_cadence && !is_due(recipient, now) {
            entry.skipped = Some(SkipReason::NotDue);
            return Ok(entry);
        }

        let mut budget = DailyBudget::load(
            self.store.as_ref(),
            recipient,
            now,
            self.config.timezone,
            self.config.daily_limit,
        )
        .await?;
        let counts = &mut entry.counts;

        for target in &recipient.targets {
            let Some(batch) = self.target_batch(ctx, &target.url).await? else {
                counts.fetch_failed += 1;
                continue;
            };
            counts.too_old += batch.stats.too_old;
            counts.extraction_failed += batch.stats.extraction_failed;

            for listing in batch.listings.iter() {
                counts.found += 1;
                if !filter::accepts(target, listing) {
                    counts.filtered += 1;
                    continue;
                }
                let key = listing.listing_key();
                if self.store.was_delivered(&recipient.id, key).await? {
                    counts.deduplicated += 1;
                    continue;
                }
                if !budget.can_notify() {
                    counts.rate_limited += 1;
                    continue;
                }

                ctx.attempted += 1;
                match self.dispatcher.dispatch(&recipient.id, listing).await {
                    Some(channel_outcome) => {
                        self.store
                            .record_delivery(&DeliveryRecord {
                                recipient_id: recipient.id.clone(),
                                listing_key: key.to_string(),
                                sent_at: now,
                                channel_outcome,
                            })
                            .await?;
                        budget.consume();
                        counts.sent += 1;
                    }
                    None => {
                        ctx.failed += 1;
                        counts.dispatch_failed += 1;
                    }
                }
            }
        }

        let access = &mut recipient.access;
        access.last_cycle_at = Some(now);
        access.next_due_at = Some(next_aligned_tick(
            now + Duration::seconds(DUE_GRACE_SECS),
            self.config.notify_interval_minutes,
            self.config.timezone,
        ));
        access.daily_notification_count = budget.used;
        self.store.save_recipient(recipient).await?;

        info!(
            recipient_id = %recipient.id,
            found = counts.found,
            sent = counts.sent,
            filtered = counts.filtered,
            deduplicated = counts.deduplicated,
            rate_limited = counts.rate_limited,
            "recipient processed"
        );
        Ok(entry)
    }

    /// Listings of one target URL, fetched and stored at most once per cycle.
    async fn target_batch(&self, ctx: &mut CycleContext, url: &str) -> Result<Option<TargetBatch>, SyncError> {
        if let Some(cached) = ctx.targets.get(url) {
            return Ok(cached.clone());
        }
        let batch = self.load_target(ctx, url).await?;
        ctx.targets.insert(url.to_string(), batch.clone());
        Ok(batch)
    }

    async fn load_target(&self, ctx: &mut CycleContext, url: &str) -> Result<Option<TargetBatch>, SyncError> {
        let Some(source) = Source::from_url(url) else {
            ctx.raise(StatusEvent::UnknownSource { url: url.to_string() });
            ctx.report.totals.fetch_failed += 1;
            return Ok(None);
        };

        let span = info_span!("fetch_target", url, %source);
        let page = match self.fetch_healthy(url).instrument(span.clone()).await {
            Ok(page) => page,
            Err(err) => {
                ctx.raise(StatusEvent::TargetFailed {
                    url: url.to_string(),
                    reason: err.to_string(),
                });
                ctx.report.totals.fetch_failed += 1;
                return Ok(None);
            }
        };

        let mut stats = TargetStats::default();
        let mut listings = Vec::new();
        let base = if page.final_url.is_empty() { url } else { page.final_url.as_str() };
        let now = ctx.now;
        let outcomes = span.in_scope(|| self.extractor.extract_result_set(source, &page.body, base, now));
        for outcome in outcomes {
            match outcome {
                Ok(Extraction::Listing(listing)) => listings.push(*listing),
                Ok(Extraction::TooOld { title, date_posted }) => {
                    stats.too_old += 1;
                    debug!(url, %title, ?date_posted, "listing too old");
                }
                Err(err) => {
                    stats.extraction_failed += 1;
                    debug!(url, error = %err, "result card skipped");
                }
            }
        }

        let totals = &mut ctx.report.totals;
        for listing in &listings {
            match self.store.insert_if_absent(listing).await? {
                InsertOutcome::Inserted => totals.inserted += 1,
                InsertOutcome::AlreadyPresent => totals.known += 1,
            }
        }
        totals.found += listings.len() as u32;
        totals.too_old += stats.too_old;
        totals.extraction_failed += stats.extraction_failed;
        span.in_scope(|| {
            info!(
                found = listings.len(),
                too_old = stats.too_old,
                extraction_failed = stats.extraction_failed,
                "target extracted"
            )
        });

        Ok(Some(TargetBatch {
            listings: Arc::new(listings),
            stats,
        }))
    }

    /// Fetch until a 2xx, healthy page arrives or the retries run out.
    async fn fetch_healthy(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let mut attempt = 0;
        loop {
            let result = match self.fetcher.fetch(url).await {
                Ok(page) if !page.status_ok() => Err(FetchError::HttpStatus {
                    status: page.status,
                    url: url.to_string(),
                }),
                Ok(page) => self.health.check(&page.body).into_result(url).map(|()| page),
                Err(err) => Err(err),
            };
            match result {
                Ok(page) => return Ok(page),
                Err(err @ (FetchError::LimiterClosed | FetchError::Unsupported { .. })) => return Err(err),
                Err(err) => match self.retry.delay_before_retry(attempt) {
                    Some(delay) => {
                        warn!(attempt, ?delay, error = %err, "fetch failed; retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => return Err(err),
                },
            }
        }
    }

    async fn notify_operator(&self, text: &str) {
        if let Some(chat_id) = &self.config.admin_chat_id {
            self.dispatcher.send_text(chat_id, text).await;
        }
    }
}
