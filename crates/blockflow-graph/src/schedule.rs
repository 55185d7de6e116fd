use std::str::FromStr;

use chrono::{DateTime, Utc};

use blockflow_core::error::{BlockflowError, Result};

/// A validated cron schedule hint. Scheduling itself happens elsewhere.
#[derive(Debug, Clone)]
pub struct ScheduleHint {
    expression: String,
    schedule: cron::Schedule,
}

impl ScheduleHint {
    /// Parse a cron expression. Five-field crontab expressions get a
    /// leading seconds field of `0`.
    pub fn parse(expression: &str) -> Result<Self> {
        let normalized = if expression.split_whitespace().count() == 5 {
            format!("0 {}", expression)
        } else {
            expression.to_string()
        };
        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| {
            BlockflowError::Graph(format!("invalid schedule '{}': {}", expression, e))
        })?;
        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First time the node is due strictly after `instant`.
    pub fn next_due_after(&self, instant: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(instant).next()
    }
}
