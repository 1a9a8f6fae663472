//! Cadence grid, active window and the per-recipient due state.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, LocalResult, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use flatwatch_core::Recipient;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::engine::{CycleEngine, CycleOutcome};
use crate::SyncError;

/// Ticks may fire slightly early; a recipient due within this margin is processed.
pub const DUE_GRACE_SECS: i64 = 30;

/// Daily window in reference-timezone wall-clock time, both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Default for ActiveWindow {
    fn default() -> Self {
        Self {
            start: NaiveTime::from_hms_opt(6, 0, 0).unwrap_or_default(),
            end: NaiveTime::from_hms_opt(23, 30, 0).unwrap_or_default(),
        }
    }
}

impl ActiveWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Compared at minute granularity. A window whose start is after its end spans midnight.
    pub fn contains(&self, local: NaiveTime) -> bool {
        let local = NaiveTime::from_hms_opt(local.hour(), local.minute(), 0).unwrap_or(local);
        if self.start <= self.end {
            self.start <= local && local <= self.end
        } else {
            local >= self.start || local <= self.end
        }
    }

    pub fn contains_instant(&self, now: DateTime<Utc>, tz: Tz) -> bool {
        self.contains(now.with_timezone(&tz).time())
    }
}

/// Where a recipient sits in the cadence state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    NoTargets,
    PendingFirstRun,
    Steady { next_due_at: DateTime<Utc> },
}

pub fn cadence(recipient: &Recipient) -> Cadence {
    if recipient.targets.is_empty() {
        return Cadence::NoTargets;
    }
    match recipient.access.next_due_at {
        None => Cadence::PendingFirstRun,
        Some(next_due_at) => Cadence::Steady { next_due_at },
    }
}

pub fn is_due(recipient: &Recipient, now: DateTime<Utc>) -> bool {
    match cadence(recipient) {
        Cadence::NoTargets => false,
        Cadence::PendingFirstRun => true,
        Cadence::Steady { next_due_at } => now + Duration::seconds(DUE_GRACE_SECS) >= next_due_at,
    }
}

/// First grid point strictly after `now`. The grid starts at local midnight and repeats
/// every `interval_minutes`.
pub fn next_aligned_tick(now: DateTime<Utc>, interval_minutes: u32, tz: Tz) -> DateTime<Utc> {
    let interval = i64::from(interval_minutes.max(1));
    let local = now.with_timezone(&tz).naive_local();
    let midnight = local.date().and_time(NaiveTime::MIN);
    let elapsed = i64::from(local.time().num_seconds_from_midnight()) / 60;
    let mut candidate = midnight + Duration::minutes((elapsed / interval + 1) * interval);

    // a grid point swallowed by a DST gap moves to the next one
    loop {
        match tz.from_local_datetime(&candidate) {
            LocalResult::Single(at) => return at.with_timezone(&Utc),
            LocalResult::Ambiguous(earliest, _) => return earliest.with_timezone(&Utc),
            LocalResult::None => candidate += Duration::minutes(interval),
        }
    }
}

/// Six-field cron expression firing on the interval grid. The interval must divide an hour.
pub fn cron_for_interval(interval_minutes: u32) -> Result<String, SyncError> {
    match interval_minutes {
        60 => Ok("0 0 * * * *".to_string()),
        1 => Ok("0 * * * * *".to_string()),
        m if m > 1 && m < 60 && 60 % m == 0 => Ok(format!("0 */{m} * * * *")),
        other => Err(SyncError::Config(format!(
            "notify interval must divide 60 minutes, got {other}"
        ))),
    }
}

/// Scheduler firing `run_cycle` on every grid tick. Ticks outside the active window and ticks
/// landing on a running cycle are skipped by the engine.
pub async fn build_scheduler(engine: Arc<CycleEngine>, interval_minutes: u32) -> Result<JobScheduler> {
    let cron = cron_for_interval(interval_minutes)?;
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let engine = Arc::clone(&engine);
        Box::pin(async move {
            match engine.run_cycle(Utc::now(), false).await {
                Ok(CycleOutcome::Completed(report)) => {
                    info!(sent = report.totals.sent, found = report.totals.found, "scheduled cycle finished")
                }
                Ok(outcome) => info!(?outcome, "scheduled tick skipped"),
                Err(err) => error!(error = %err, "scheduled cycle failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
