//! Periodic job definitions and their TOML table.
//!
//! ```toml
//! [[job]]
//! name = "nightly-report"
//! task = "process_data"
//! cron = "30 2 * * *"
//! kwargs = { data = [1, 2, 3] }
//!
//! [[job]]
//! name = "heartbeat"
//! task = "add_numbers"
//! every = 30
//! args = [1, 1]
//! queue = "low"
//! ```

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::model::{DEFAULT_QUEUE, NewTask};

/// When a job fires.
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Every fixed period, starting one period after the scheduler starts.
    Interval(Duration),
    /// On a cron expression, evaluated in UTC.
    Cron(Box<cron::Schedule>),
}

impl Schedule {
    /// Parse a cron expression. Five-field expressions get a leading
    /// seconds field of `0`.
    pub fn cron(expression: &str) -> Result<Self> {
        let expression = expression.trim();
        let normalized = if expression.split_whitespace().count() == 5 {
            format!("0 {expression}")
        } else {
            expression.to_string()
        };
        let schedule = cron::Schedule::from_str(&normalized)
            .map_err(|e| Error::Schedule(format!("invalid cron `{expression}`: {e}")))?;
        Ok(Schedule::Cron(Box::new(schedule)))
    }

    pub fn every(period: Duration) -> Result<Self> {
        if period.is_zero() {
            return Err(Error::Schedule("interval must be positive".into()));
        }
        Ok(Schedule::Interval(period))
    }

    /// First due time for a job picked up at `now`.
    pub fn first_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Interval(period) => chrono::Duration::from_std(*period)
                .ok()
                .and_then(|p| now.checked_add_signed(p)),
            Schedule::Cron(schedule) => schedule.after(&now).next(),
        }
    }

    /// Next due time once the job fired for `due` and the clock reads `now`.
    ///
    /// Intervals step by whole periods past `now`, so missed firings are
    /// skipped rather than replayed in a burst.
    pub fn next_after(&self, due: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Interval(period) => {
                let period = chrono::Duration::from_std(*period).ok()?;
                let next = due.checked_add_signed(period)?;
                if next > now {
                    return Some(next);
                }
                let skipped = (now - next)
                    .num_nanoseconds()
                    .zip(period.num_nanoseconds())
                    .and_then(|(behind, step)| {
                        let step = step.max(1);
                        (behind / step + 1).checked_mul(step)
                    });
                match skipped {
                    Some(nanos) => next.checked_add_signed(chrono::Duration::nanoseconds(nanos)),
                    // Too far behind to count periods; restart from now.
                    None => now.checked_add_signed(period),
                }
            }
            Schedule::Cron(schedule) => schedule.after(&now).next(),
        }
    }
}

/// A job the scheduler submits on its schedule.
#[derive(Debug, Clone)]
pub struct PeriodicJob {
    pub name: String,
    pub task_name: String,
    pub schedule: Schedule,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub queue: String,
}

impl PeriodicJob {
    pub fn new(name: impl Into<String>, task_name: impl Into<String>, schedule: Schedule) -> Self {
        Self {
            name: name.into(),
            task_name: task_name.into(),
            schedule,
            args: Vec::new(),
            kwargs: Map::new(),
            queue: DEFAULT_QUEUE.to_string(),
        }
    }

    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// A fresh submission from the job's template.
    pub fn new_task(&self) -> NewTask {
        NewTask::new(self.task_name.clone())
            .args(self.args.clone())
            .kwargs(self.kwargs.clone())
            .queue(self.queue.clone())
    }
}

#[derive(Debug, Deserialize)]
struct RawTable {
    #[serde(default)]
    job: Vec<RawJob>,
}

#[derive(Debug, Deserialize)]
struct RawJob {
    name: String,
    task: String,
    every: Option<f64>,
    cron: Option<String>,
    #[serde(default)]
    args: Vec<Value>,
    #[serde(default)]
    kwargs: Map<String, Value>,
    queue: Option<String>,
}

impl RawJob {
    fn into_job(self) -> Result<PeriodicJob> {
        let schedule = match (self.every, self.cron.as_deref()) {
            (Some(seconds), None) => {
                if !seconds.is_finite() || seconds <= 0.0 {
                    return Err(Error::Schedule(format!(
                        "job `{}`: `every` must be a positive number of seconds",
                        self.name
                    )));
                }
                let period = Duration::try_from_secs_f64(seconds)
                    .map_err(|e| Error::Schedule(format!("job `{}`: `every`: {e}", self.name)))?;
                Schedule::every(period)?
            }
            (None, Some(expression)) => Schedule::cron(expression)
                .map_err(|e| Error::Schedule(format!("job `{}`: {e}", self.name)))?,
            _ => {
                return Err(Error::Schedule(format!(
                    "job `{}`: set exactly one of `every` or `cron`",
                    self.name
                )));
            }
        };
        let job = PeriodicJob::new(self.name, self.task, schedule)
            .args(self.args)
            .kwargs(self.kwargs);
        Ok(match self.queue {
            Some(queue) => job.queue(queue),
            None => job,
        })
    }
}

/// The static set of periodic jobs.
#[derive(Debug, Clone, Default)]
pub struct ScheduleTable {
    jobs: Vec<PeriodicJob>,
}

impl ScheduleTable {
    pub fn new(jobs: Vec<PeriodicJob>) -> Result<Self> {
        let mut names: Vec<&str> = jobs.iter().map(|j| j.name.as_str()).collect();
        names.sort_unstable();
        if let Some(pair) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(Error::Schedule(format!("duplicate job name `{}`", pair[0])));
        }
        Ok(Self { jobs })
    }

    pub fn from_toml_str(source: &str) -> Result<Self> {
        let raw: RawTable =
            toml::from_str(source).map_err(|e| Error::Schedule(format!("bad schedule file: {e}")))?;
        let jobs = raw
            .job
            .into_iter()
            .map(RawJob::into_job)
            .collect::<Result<Vec<_>>>()?;
        Self::new(jobs)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    pub fn jobs(&self) -> &[PeriodicJob] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_interval_and_cron_jobs() {
        let table = ScheduleTable::from_toml_str(
            r#"
            [[job]]
            name = "heartbeat"
            task = "add_numbers"
            every = 30
            args = [1, 1]
            queue = "low"

            [[job]]
            name = "nightly"
            task = "process_data"
            cron = "30 2 * * *"
            kwargs = { data = [1, 2, 3] }
            "#,
        )
        .unwrap();

        assert_eq!(table.len(), 2);
        let heartbeat = &table.jobs()[0];
        assert!(matches!(heartbeat.schedule, Schedule::Interval(d) if d == Duration::from_secs(30)));
        assert_eq!(heartbeat.queue, "low");
        assert_eq!(heartbeat.args, vec![Value::from(1), Value::from(1)]);

        let nightly = &table.jobs()[1];
        assert_eq!(nightly.queue, DEFAULT_QUEUE);
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(
            nightly.schedule.first_after(now),
            Some(Utc.with_ymd_and_hms(2024, 1, 2, 2, 30, 0).unwrap())
        );
    }

    #[test]
    fn rejects_ambiguous_and_duplicate_jobs() {
        let both = r#"
            [[job]]
            name = "x"
            task = "t"
            every = 1
            cron = "* * * * *"
        "#;
        assert!(matches!(ScheduleTable::from_toml_str(both), Err(Error::Schedule(_))));

        let dup = r#"
            [[job]]
            name = "x"
            task = "t"
            every = 1

            [[job]]
            name = "x"
            task = "u"
            every = 2
        "#;
        assert!(matches!(ScheduleTable::from_toml_str(dup), Err(Error::Schedule(_))));
        assert!(Schedule::cron("not a cron").is_err());
    }

    #[test]
    fn interval_skips_missed_firings() {
        let schedule = Schedule::every(Duration::from_secs(10)).unwrap();
        let due = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let on_time = due + chrono::Duration::seconds(1);
        assert_eq!(
            schedule.next_after(due, on_time),
            Some(due + chrono::Duration::seconds(10))
        );

        let late = due + chrono::Duration::seconds(35);
        assert_eq!(
            schedule.next_after(due, late),
            Some(due + chrono::Duration::seconds(40))
        );
    }

    #[test]
    fn short_interval_far_behind_lands_just_after_now() {
        let schedule = Schedule::every(Duration::from_millis(1)).unwrap();
        let due = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let now = due + chrono::Duration::days(25) + chrono::Duration::microseconds(500);

        assert_eq!(
            schedule.next_after(due, now),
            Some(due + chrono::Duration::days(25) + chrono::Duration::milliseconds(1))
        );
    }

    #[test]
    fn oversized_every_is_rejected() {
        let table = r#"
            [[job]]
            name = "forever"
            task = "t"
            every = 1e30
        "#;
        assert!(matches!(ScheduleTable::from_toml_str(table), Err(Error::Schedule(_))));
    }
}
