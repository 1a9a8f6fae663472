use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use flatwatch_core::Recipient;
use flatwatch_storage::{Store, StoreError};

/// UTC bounds `[start, end)` of the calendar day containing `now` in `tz`.
pub fn calendar_day_bounds(now: DateTime<Utc>, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
    let day = now.with_timezone(&tz).date_naive();
    let start = local_midnight(day, tz);
    let end = day
        .succ_opt()
        .map(|next| local_midnight(next, tz))
        .unwrap_or(start + Duration::days(1));
    (start, end)
}

fn local_midnight(day: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let naive = day.and_time(NaiveTime::MIN);
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(at) | LocalResult::Ambiguous(at, _) => at.with_timezone(&Utc),
        // midnight inside a DST gap: the day starts an hour later
        LocalResult::None => tz
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .map(|at| at.with_timezone(&Utc))
            .unwrap_or_else(|| naive.and_utc()),
    }
}

/// Remaining sends for one recipient on the current calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyBudget {
    pub cap: u32,
    pub used: u32,
}

impl DailyBudget {
    /// Count today's delivery records for `recipient`; the cap is the recipient's own or `default_cap`.
    pub async fn load(
        store: &dyn Store,
        recipient: &Recipient,
        now: DateTime<Utc>,
        tz: Tz,
        default_cap: u32,
    ) -> Result<Self, StoreError> {
        let (start, end) = calendar_day_bounds(now, tz);
        let used = store.count_deliveries_between(&recipient.id, start, end).await?;
        Ok(Self {
            cap: recipient.access.daily_cap.unwrap_or(default_cap),
            used,
        })
    }

    pub fn can_notify(&self) -> bool {
        self.used < self.cap
    }

    pub fn consume(&mut self) {
        self.used = self.used.saturating_add(1);
    }
}
