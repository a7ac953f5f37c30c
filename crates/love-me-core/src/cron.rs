//! Cron expression parsing and the minute-boundary Ticker (C3).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Datelike, Timelike, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::ValidationError;

/// One parsed cron field: the set of concrete values it matches, plus
/// whether the source atom was `*` (unconstrained).
#[derive(Debug, Clone, PartialEq)]
struct CronField {
    values: HashSet<u32>,
    unconstrained: bool,
}

impl CronField {
    fn parse(raw: &str, min: u32, max: u32, expression: &str) -> Result<Self, ValidationError> {
        if raw == "*" {
            return Ok(Self {
                values: (min..=max).collect(),
                unconstrained: true,
            });
        }

        let invalid = |message: String| ValidationError::InvalidCron {
            expression: expression.to_string(),
            message,
        };

        if let Some(step_part) = raw.strip_prefix("*/") {
            let step: u32 = step_part
                .parse()
                .map_err(|_| invalid(format!("invalid step in '{raw}'")))?;
            if step == 0 {
                return Err(invalid("step must be positive".to_string()));
            }
            let values = (min..=max).step_by(step as usize).collect();
            return Ok(Self {
                values,
                unconstrained: false,
            });
        }

        let mut values = HashSet::new();
        for atom in raw.split(',') {
            if let Some((lo, hi)) = atom.split_once('-') {
                let lo: u32 = lo
                    .parse()
                    .map_err(|_| invalid(format!("invalid range start in '{atom}'")))?;
                let hi: u32 = hi
                    .parse()
                    .map_err(|_| invalid(format!("invalid range end in '{atom}'")))?;
                if lo > hi {
                    return Err(invalid(format!("range '{atom}' is backwards")));
                }
                values.extend(lo..=hi);
            } else {
                let value: u32 = atom
                    .parse()
                    .map_err(|_| invalid(format!("invalid value '{atom}'")))?;
                values.insert(value);
            }
        }

        if values.is_empty() {
            return Err(invalid(format!("field '{raw}' has no values")));
        }
        for value in &values {
            if *value < min || *value > max {
                return Err(invalid(format!(
                    "value {value} outside range {min}-{max}"
                )));
            }
        }

        Ok(Self {
            values,
            unconstrained: false,
        })
    }

    fn matches(&self, value: u32) -> bool {
        self.values.contains(&value)
    }
}

/// A parsed 5-field cron expression: minute, hour, day-of-month, month,
/// day-of-week. Day-of-month and day-of-week combine with union semantics
/// when both are constrained, matching cron convention.
#[derive(Debug, Clone)]
pub struct CronExpression {
    source: String,
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl CronExpression {
    /// Parse a 5-field expression. Day-of-week is `0-6` (Sunday = 0).
    pub fn parse(expression: &str) -> Result<Self, ValidationError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ValidationError::InvalidCron {
                expression: expression.to_string(),
                message: format!("expected 5 fields, found {}", fields.len()),
            });
        }

        Ok(Self {
            source: expression.to_string(),
            minute: CronField::parse(fields[0], 0, 59, expression)?,
            hour: CronField::parse(fields[1], 0, 23, expression)?,
            day_of_month: CronField::parse(fields[2], 1, 31, expression)?,
            month: CronField::parse(fields[3], 1, 12, expression)?,
            day_of_week: CronField::parse(fields[4], 0, 6, expression)?,
        })
    }

    /// The original expression text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// `true` if this expression fires at the given instant's minute.
    pub fn matches(&self, instant: DateTime<Utc>) -> bool {
        if !self.minute.matches(instant.minute()) || !self.hour.matches(instant.hour()) {
            return false;
        }
        if !self.month.matches(instant.month()) {
            return false;
        }

        let dom_matches = self.day_of_month.matches(instant.day());
        // chrono: Sunday = 0 per `num_days_from_sunday`.
        let dow_matches = self
            .day_of_week
            .matches(instant.weekday().num_days_from_sunday());

        match (self.day_of_month.unconstrained, self.day_of_week.unconstrained) {
            (true, true) => true,
            (true, false) => dow_matches,
            (false, true) => dom_matches,
            (false, false) => dom_matches || dow_matches,
        }
    }
}

/// Minute-resolution key used to forbid firing the same workflow twice
/// within one calendar minute.
fn minute_bucket(instant: DateTime<Utc>) -> i64 {
    instant.timestamp() / 60
}

/// A single scheduling agent that fires registered workflows once their
/// cron expression matches the current minute. Firing hands off to the
/// caller's `on_fire` callback and continues without waiting for it.
pub struct CronTicker {
    registrations: Mutex<HashMap<String, CronExpression>>,
    last_fired: Mutex<HashMap<String, i64>>,
}

impl Default for CronTicker {
    fn default() -> Self {
        Self::new()
    }
}

impl CronTicker {
    /// An empty ticker with no registered workflows.
    pub fn new() -> Self {
        Self {
            registrations: Mutex::new(HashMap::new()),
            last_fired: Mutex::new(HashMap::new()),
        }
    }

    /// Register (or replace) a workflow's cron expression. Replacing an
    /// existing registration clears its fired-this-minute tracking.
    pub async fn register(&self, workflow_id: impl Into<String>, expression: CronExpression) {
        let workflow_id = workflow_id.into();
        self.registrations
            .lock()
            .await
            .insert(workflow_id.clone(), expression);
        self.last_fired.lock().await.remove(&workflow_id);
    }

    /// Remove a workflow's registration, if any.
    pub async fn unregister(&self, workflow_id: &str) {
        self.registrations.lock().await.remove(workflow_id);
        self.last_fired.lock().await.remove(workflow_id);
    }

    /// Evaluate every registration against `instant`, returning the ids
    /// that should fire and have not already fired in this minute.
    async fn due_workflows(&self, instant: DateTime<Utc>) -> Vec<String> {
        let registrations = self.registrations.lock().await;
        let mut last_fired = self.last_fired.lock().await;
        let bucket = minute_bucket(instant);

        let mut due = Vec::new();
        for (workflow_id, expr) in registrations.iter() {
            if !expr.matches(instant) {
                continue;
            }
            if last_fired.get(workflow_id) == Some(&bucket) {
                continue;
            }
            last_fired.insert(workflow_id.clone(), bucket);
            due.push(workflow_id.clone());
        }
        due
    }

    /// Run the ticker loop until `cancel` fires. Sleeps until the next
    /// minute boundary (jitter of a couple seconds is tolerated per spec),
    /// evaluates due workflows, and invokes `on_fire` for each without
    /// waiting for it to complete. Missed minutes while stopped are never
    /// caught up.
    pub async fn run<F>(&self, cancel: CancellationToken, on_fire: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        let on_fire = Arc::new(on_fire);
        loop {
            let sleep_duration = time_until_next_minute(Utc::now());
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("cron ticker stopping");
                    return;
                }
                _ = tokio::time::sleep(sleep_duration) => {}
            }

            let now = Utc::now();
            for workflow_id in self.due_workflows(now).await {
                tracing::debug!(workflow_id = %workflow_id, "cron fired");
                let on_fire = on_fire.clone();
                tokio::spawn(async move { on_fire(workflow_id) });
            }
        }
    }
}

fn time_until_next_minute(now: DateTime<Utc>) -> std::time::Duration {
    let seconds_into_minute = now.second() as u64;
    let millis_into_second = now.timestamp_subsec_millis() as u64;
    let remaining_ms = 60_000u64.saturating_sub(seconds_into_minute * 1000 + millis_into_second);
    std::time::Duration::from_millis(remaining_ms.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn rejects_wrong_field_count() {
        let err = CronExpression::parse("*/5 * * *").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidCron { .. }));
    }

    #[test]
    fn star_matches_every_minute() {
        let expr = CronExpression::parse("* * * * *").unwrap();
        assert!(expr.matches(dt(2026, 7, 27, 13, 0)));
        assert!(expr.matches(dt(2026, 7, 27, 23, 59)));
    }

    #[test]
    fn step_field_fires_on_multiples() {
        let expr = CronExpression::parse("*/5 * * * *").unwrap();
        assert!(expr.matches(dt(2026, 7, 27, 10, 5)));
        assert!(expr.matches(dt(2026, 7, 27, 10, 55)));
        assert!(!expr.matches(dt(2026, 7, 27, 10, 6)));
    }

    #[test]
    fn list_and_range_atoms() {
        let expr = CronExpression::parse("0 9-11,17 * * *").unwrap();
        assert!(expr.matches(dt(2026, 7, 27, 9, 0)));
        assert!(expr.matches(dt(2026, 7, 27, 10, 0)));
        assert!(expr.matches(dt(2026, 7, 27, 17, 0)));
        assert!(!expr.matches(dt(2026, 7, 27, 12, 0)));
    }

    #[test]
    fn day_fields_union_when_both_constrained() {
        // 2026-07-27 is a Monday (day_of_week = 1).
        let expr = CronExpression::parse("0 0 1 * 3").unwrap();
        // Matches because day-of-month == 1.
        assert!(expr.matches(dt(2026, 8, 1, 0, 0)));
        // Matches because day-of-week == 3 (Wednesday), even though dom != 1.
        assert!(expr.matches(dt(2026, 7, 29, 0, 0)));
        // Matches neither.
        assert!(!expr.matches(dt(2026, 7, 27, 0, 0)));
    }

    #[test]
    fn day_of_month_only_constrained_matches_exactly() {
        let expr = CronExpression::parse("0 0 15 * *").unwrap();
        assert!(expr.matches(dt(2026, 7, 15, 0, 0)));
        assert!(!expr.matches(dt(2026, 7, 16, 0, 0)));
    }

    #[test]
    fn invalid_value_out_of_range_is_rejected() {
        let err = CronExpression::parse("60 * * * *").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidCron { .. }));
    }

    #[tokio::test]
    async fn due_workflows_fires_once_per_minute() {
        let ticker = CronTicker::new();
        ticker
            .register("wf1", CronExpression::parse("* * * * *").unwrap())
            .await;

        let now = Utc::now();
        let first = ticker.due_workflows(now).await;
        assert_eq!(first, vec!["wf1".to_string()]);

        let still_same_minute = ticker.due_workflows(now).await;
        assert!(still_same_minute.is_empty());
    }

    #[tokio::test]
    async fn unregister_stops_future_firing() {
        let ticker = CronTicker::new();
        ticker
            .register("wf1", CronExpression::parse("* * * * *").unwrap())
            .await;
        ticker.unregister("wf1").await;

        let due = ticker.due_workflows(Utc::now()).await;
        assert!(due.is_empty());
    }

    #[tokio::test]
    async fn re_registering_resets_last_fired() {
        let ticker = CronTicker::new();
        let now = Utc::now();
        ticker
            .register("wf1", CronExpression::parse("* * * * *").unwrap())
            .await;
        ticker.due_workflows(now).await;

        ticker
            .register("wf1", CronExpression::parse("* * * * *").unwrap())
            .await;
        let due = ticker.due_workflows(now).await;
        assert_eq!(due, vec!["wf1".to_string()]);
    }
}
