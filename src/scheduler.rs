//! Weekly digest trigger.
//!
//! A single background task sleeps until the next trigger, runs the weekly
//! dispatch to completion, then computes the following trigger. A run that
//! overruns simply pushes the next computation back.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, LocalResult, NaiveDate, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::dispatcher::DigestDispatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeeklySchedule {
    pub weekday: Weekday,
    pub hour: u32,
    pub minute: u32,
    pub timezone: Tz,
}

impl WeeklySchedule {
    /// Mondays at 09:00 in `timezone`.
    pub fn monday_morning(timezone: Tz) -> Self {
        Self {
            weekday: Weekday::Mon,
            hour: 9,
            minute: 0,
            timezone,
        }
    }

    /// Next trigger strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.with_timezone(&self.timezone).date_naive();
        (0..=14)
            .map(|offset| today + ChronoDuration::days(offset))
            .filter(|date| date.weekday() == self.weekday)
            .filter_map(|date| self.resolve(date))
            .find(|candidate| *candidate > now)
            .unwrap_or_else(|| now + ChronoDuration::weeks(1))
    }

    /// Local trigger time on `date`; a time skipped by a DST jump moves forward an hour.
    fn resolve(&self, date: NaiveDate) -> Option<DateTime<Utc>> {
        let naive = date.and_hms_opt(self.hour, self.minute, 0)?;
        let local = match self.timezone.from_local_datetime(&naive) {
            LocalResult::Single(dt) => dt,
            LocalResult::Ambiguous(dt, _) => dt,
            LocalResult::None => self
                .timezone
                .from_local_datetime(&(naive + ChronoDuration::hours(1)))
                .earliest()?,
        };
        Some(local.with_timezone(&Utc))
    }
}

pub struct SchedulerHandle {
    sender: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stops the loop. A run already in progress is awaited first.
    pub async fn shutdown(self) {
        let _ = self.sender.send(()).await;
        if let Err(err) = self.task.await {
            tracing::warn!("weekly scheduler task ended abnormally: {err}");
        }
    }
}

pub fn spawn_weekly(dispatcher: Arc<DigestDispatcher>, schedule: WeeklySchedule) -> SchedulerHandle {
    let (sender, mut receiver) = mpsc::channel(1);

    let task = tokio::spawn(async move {
        loop {
            let next = schedule.next_after(Utc::now());
            tracing::info!(next = %next, "next weekly digest scheduled");
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    match dispatcher.run_weekly_dispatch().await {
                        Ok(report) => tracing::debug!(?report, "weekly digest job complete"),
                        Err(err) => tracing::error!("error in weekly digest job: {err}"),
                    }
                }
                _ = receiver.recv() => {
                    tracing::info!("weekly scheduler stopped");
                    break;
                }
            }
        }
    });

    SchedulerHandle { sender, task }
}
