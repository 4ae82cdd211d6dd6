// Trigger Filters
// Ordered glob lists for refs and paths, and 5-field cron schedules

use chrono::{DateTime, Duration, Timelike, Utc};
use cron::Schedule;
use globset::{GlobBuilder, GlobMatcher};

use std::str::FromStr;

/// An ordered list of glob patterns where `!pattern` re-excludes.
///
/// `*` stops at `/`, `**` crosses it. The last pattern that matches decides.
#[derive(Debug, Clone)]
pub struct PatternList {
    patterns: Vec<(bool, GlobMatcher)>,
}

impl PatternList {
    pub fn new(patterns: &[String]) -> Result<Self, String> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for raw in patterns {
            let (negated, pattern) = match raw.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, raw.as_str()),
            };
            let glob = GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .map_err(|e| format!("invalid pattern '{}': {}", raw, e))?;
            compiled.push((negated, glob.compile_matcher()));
        }
        Ok(Self { patterns: compiled })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, candidate: &str) -> bool {
        let mut matched = false;
        for (negated, glob) in &self.patterns {
            if glob.is_match(candidate) {
                matched = !negated;
            }
        }
        matched
    }

    /// True when at least one candidate is selected
    pub fn matches_any<'a>(&self, mut candidates: impl Iterator<Item = &'a String>) -> bool {
        candidates.any(|c| self.matches(c))
    }
}

/// A 5-field cron expression (minute hour day-of-month month day-of-week).
///
/// When both day fields are restricted a day matches if either one does.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedules: Vec<Schedule>,
}

const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, String> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(format!(
                "cron '{}' must have 5 fields, found {}",
                expression,
                fields.len()
            ));
        }

        let day_of_week = translate_weekdays(fields[4])
            .ok_or_else(|| format!("cron '{}' has an invalid day-of-week", expression))?;

        // The cron crate ANDs the day fields, so split into one schedule per field
        let day_fields = if is_restricted(fields[2]) && is_restricted(fields[4]) {
            vec![(fields[2], "*"), ("*", day_of_week.as_str())]
        } else {
            vec![(fields[2], day_of_week.as_str())]
        };

        let schedules = day_fields
            .into_iter()
            .map(|(day_of_month, day_of_week)| {
                // The cron crate wants seconds first and counts weekdays from 1
                let full = format!(
                    "0 {} {} {} {} {}",
                    fields[0], fields[1], day_of_month, fields[3], day_of_week
                );
                Schedule::from_str(&full)
                    .map_err(|e| format!("invalid cron '{}': {}", expression, e))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            expression: fields.join(" "),
            schedules,
        })
    }

    /// Normalized expression (single spaces)
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Whether the schedule fires in the minute containing `at`.
    pub fn fires_at(&self, at: DateTime<Utc>) -> bool {
        let minute = match at.with_second(0).and_then(|t| t.with_nanosecond(0)) {
            Some(minute) => minute,
            None => return false,
        };
        let just_before = minute - Duration::seconds(1);
        self.schedules
            .iter()
            .any(|schedule| schedule.after(&just_before).next() == Some(minute))
    }
}

/// A day field starting with `*` leaves the other day field in charge
fn is_restricted(field: &str) -> bool {
    !(field.starts_with('*') || field == "?")
}

/// Rewrite numeric weekdays (0-7, Sunday = 0 or 7) as names so they mean
/// the same thing to the cron crate.
fn translate_weekdays(field: &str) -> Option<String> {
    let mut out = String::with_capacity(field.len());
    let mut number = String::new();
    let mut after_slash = false;

    let flush = |number: &mut String, out: &mut String, after_slash: bool| -> Option<()> {
        if number.is_empty() {
            return Some(());
        }
        if after_slash {
            out.push_str(number);
        } else {
            let n: usize = number.parse().ok()?;
            out.push_str(WEEKDAYS.get(n % 7).filter(|_| n <= 7)?);
        }
        number.clear();
        Some(())
    };

    for c in field.chars() {
        if c.is_ascii_digit() {
            number.push(c);
            continue;
        }
        flush(&mut number, &mut out, after_slash)?;
        match c {
            '/' => after_slash = true,
            ',' => after_slash = false,
            _ => {}
        }
        out.push(c);
    }
    flush(&mut number, &mut out, after_slash)?;
    Some(out)
}
