//! Logical-date arithmetic and the daily trigger.
//!
//! A run's logical date is the calendar day (UTC) on which it is triggered;
//! the data it loads always belongs to the day before.

use crate::pipeline::{Pipeline, RunReport, RunState};
use crate::PipelineError;
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use std::collections::BTreeSet;
use tracing::{error, info, warn};

/// The day whose market data a run for `logical_date` loads.
pub fn target_date(logical_date: NaiveDate) -> NaiveDate {
    logical_date - Duration::days(1)
}

/// Formats a date the way the CoinGecko history endpoint expects (`DD-MM-YYYY`).
pub fn api_date(date: NaiveDate) -> String {
    date.format("%d-%m-%Y").to_string()
}

/// Most recent logical date whose trigger time has passed at `now`.
pub fn latest_due_logical_date(now: NaiveDateTime, run_at: NaiveTime) -> NaiveDate {
    if now.time() >= run_at {
        now.date()
    } else {
        now.date() - Duration::days(1)
    }
}

/// First trigger instant strictly after `now`.
pub fn next_trigger_after(now: NaiveDateTime, run_at: NaiveTime) -> NaiveDateTime {
    let today = now.date().and_time(run_at);
    if today > now {
        today
    } else {
        today + Duration::days(1)
    }
}

/// Logical dates that should run at `now`, oldest first.
///
/// With catchup every date between `start` and the latest due date that has
/// not completed is returned; without it only the latest due date is.
pub fn due_logical_dates(
    start: NaiveDate,
    now: NaiveDateTime,
    run_at: NaiveTime,
    catchup: bool,
    completed: &BTreeSet<NaiveDate>,
) -> Vec<NaiveDate> {
    let latest = latest_due_logical_date(now, run_at);
    if latest < start {
        return Vec::new();
    }

    if !catchup {
        return if completed.contains(&latest) {
            Vec::new()
        } else {
            vec![latest]
        };
    }

    start
        .iter_days()
        .take_while(|date| *date <= latest)
        .filter(|date| !completed.contains(date))
        .collect()
}

/// Whether a successful run for `logical_date` should be followed by training.
pub fn is_retrain_day(start: NaiveDate, logical_date: NaiveDate, every_days: Option<u32>) -> bool {
    match every_days {
        Some(every) if every > 0 => {
            let offset = (logical_date - start).num_days();
            offset >= 0 && offset % i64::from(every) == 0
        }
        _ => false,
    }
}

/// Drives a [`Pipeline`] on its daily trigger.
///
/// Due dates are executed strictly one at a time, so at most one run is ever
/// active. On its first tick the scheduler fails any run a previous process
/// left in `running`, so a crash never blocks later dates.
pub struct Scheduler {
    pipeline: Pipeline,
    started: bool,
}

impl Scheduler {
    pub fn new(pipeline: Pipeline) -> Self {
        Scheduler {
            pipeline,
            started: false,
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Runs every currently due logical date and returns their reports.
    ///
    /// A date that cannot be run (e.g. claimed by another run) is logged and
    /// skipped; the remaining dates still run.
    pub async fn tick(&mut self, now: NaiveDateTime) -> Result<Vec<RunReport>, PipelineError> {
        if !self.started {
            self.pipeline.reclaim_interrupted_runs()?;
            self.started = true;
        }

        let config = self.pipeline.config().clone();
        let run_at = config.run_at()?;
        let completed = self.pipeline.warehouse().completed_runs()?;
        let due = due_logical_dates(
            config.schedule.start_date,
            now,
            run_at,
            config.schedule.catchup,
            &completed,
        );

        if !due.is_empty() {
            info!(
                due_runs = due.len(),
                first = %due[0],
                last = %due[due.len() - 1],
                "Scheduler: logical dates due"
            );
        }

        let mut reports = Vec::with_capacity(due.len());
        for logical_date in due {
            let report = match self.pipeline.run(logical_date, false).await {
                Ok(report) => report,
                Err(e) => {
                    error!(logical_date = %logical_date, error = %e, "Scheduler: run not started, skipping date");
                    continue;
                }
            };
            if report.state == RunState::Failed {
                warn!(logical_date = %logical_date, "Scheduler: run failed, continuing with next date");
            }
            let succeeded = report.state == RunState::Success;
            reports.push(report);

            if succeeded
                && is_retrain_day(
                    config.schedule.start_date,
                    logical_date,
                    config.training.retrain_every_days,
                )
            {
                if let Err(e) = self.pipeline.train().await {
                    warn!(logical_date = %logical_date, error = %e, "Scheduler: retraining failed");
                }
            }
        }

        Ok(reports)
    }

    /// Loops forever: run due dates, then sleep until the next trigger.
    pub async fn run_forever(&mut self) -> Result<(), PipelineError> {
        let run_at = self.pipeline.config().run_at()?;
        loop {
            let now = Utc::now().naive_utc();
            if let Err(e) = self.tick(now).await {
                error!(error = %e, "Scheduler: tick failed, retrying at next trigger");
            }

            let now = Utc::now().naive_utc();
            let next = next_trigger_after(now, run_at);
            let wait = (next - now).to_std().unwrap_or_default();
            info!(next_trigger = %next, "Scheduler: sleeping until next trigger");
            tokio::time::sleep(wait).await;
        }
    }
}
