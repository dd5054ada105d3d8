use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use kairos_core::{Error, Result};

use crate::clock::saturating_add;

/// A pure `(now) -> next fire time` function, for calendars the built-in
/// triggers cannot express or for tests.
pub trait FireSchedule: Send + Sync {
    /// First instant strictly after `now`, or `None` when exhausted.
    fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>>;

    fn describe(&self) -> String {
        "custom".to_string()
    }
}

/// A parsed cron expression.
#[derive(Clone)]
pub struct CronExpr {
    expr: String,
    schedule: Schedule,
}

impl CronExpr {
    /// Parse a cron expression, auto-prepending "0 " for 5-field expressions.
    ///
    /// The `cron` crate requires 6 fields (sec min hr dom mon dow), but users
    /// typically write 5-field cron (min hr dom mon dow).
    pub fn parse(expr: &str) -> Result<Self> {
        let trimmed = expr.trim();
        let parsed = if trimmed.split_whitespace().count() == 5 {
            Schedule::from_str(&format!("0 {trimmed}"))
        } else {
            Schedule::from_str(trimmed)
        };
        let schedule = parsed.map_err(|e| {
            Error::invalid_config(format!("invalid cron expression '{trimmed}': {e}"))
        })?;
        Ok(Self {
            expr: trimmed.to_string(),
            schedule,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.expr
    }

    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&now).next()
    }
}

impl fmt::Debug for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronExpr").field(&self.expr).finish()
    }
}

/// When a job fires.
#[derive(Clone)]
pub enum Trigger {
    /// Every `d`, measured from the previous firing.
    Interval(Duration),
    Cron(CronExpr),
    Custom(Arc<dyn FireSchedule>),
}

impl Trigger {
    pub fn interval(every: Duration) -> Result<Self> {
        let trigger = Self::Interval(every);
        trigger.validate()?;
        Ok(trigger)
    }

    pub fn cron(expr: &str) -> Result<Self> {
        CronExpr::parse(expr).map(Self::Cron)
    }

    pub fn custom(schedule: impl FireSchedule + 'static) -> Self {
        Self::Custom(Arc::new(schedule))
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Interval(every) if every.is_zero() => {
                Err(Error::invalid_config("interval must be greater than zero"))
            }
            _ => Ok(()),
        }
    }

    /// Next fire time strictly after `now`. `None` leaves the job dormant.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let next = match self {
            Self::Interval(every) => Some(saturating_add(now, *every)),
            Self::Cron(expr) => expr.next_after(now),
            Self::Custom(schedule) => schedule.next_after(now),
        };
        next.filter(|at| *at > now)
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Interval(every) => format!("every {every:?}"),
            Self::Cron(expr) => format!("cron '{}'", expr.as_str()),
            Self::Custom(schedule) => schedule.describe(),
        }
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}
