use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Hours between two scheduled publications on a channel.
pub const PUBLISH_INTERVAL_HOURS: i64 = 12;

/// Hour of day used when a lapsed schedule is moved forward.
pub const DAILY_SLOT_HOUR: u32 = 12;

fn daily_slot_time() -> NaiveTime {
    NaiveTime::from_hms_opt(DAILY_SLOT_HOUR, 0, 0).unwrap_or(NaiveTime::MIN)
}

/// Base timestamp used when the caller does not supply `--base-date`.
pub fn default_base() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 9, 11)
        .unwrap_or(NaiveDate::MIN)
        .and_time(daily_slot_time())
}

pub fn parse_date(text: &str) -> Result<NaiveDateTime> {
    let date = NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
        .with_context(|| format!("Invalid date (expected YYYY-MM-DD): {}", text))?;
    Ok(date.and_time(NaiveTime::MIN))
}

/// The first daily slot strictly after `now`.
pub fn next_daily_boundary(now: NaiveDateTime) -> NaiveDateTime {
    let today = now.date().and_time(daily_slot_time());
    if today > now {
        today
    } else {
        today + Duration::days(1)
    }
}

/// Next free publish slot for a channel with `prior_uploads` finished uploads.
///
/// A channel with no history publishes immediately. Otherwise the cadence
/// continues from `base`, and a slot that already lies in the past is moved
/// forward to the next daily boundary.
pub fn next_publish_slot(
    base: NaiveDateTime,
    prior_uploads: usize,
    now: NaiveDateTime,
) -> NaiveDateTime {
    if prior_uploads == 0 {
        return now;
    }

    let slot = base + Duration::hours(PUBLISH_INTERVAL_HOURS * prior_uploads as i64);
    if slot < now {
        next_daily_boundary(now)
    } else {
        slot
    }
}

pub fn format_publish_at(at: NaiveDateTime) -> String {
    at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Hands out publish slots in the order uploads actually happen.
#[derive(Debug)]
pub struct PublishSchedule {
    start: NaiveDateTime,
    claimed: AtomicUsize,
}

impl PublishSchedule {
    pub fn new(start: NaiveDateTime) -> Self {
        Self {
            start,
            claimed: AtomicUsize::new(0),
        }
    }

    pub fn start(&self) -> NaiveDateTime {
        self.start
    }

    pub fn claim(&self) -> NaiveDateTime {
        let n = self.claimed.fetch_add(1, Ordering::SeqCst);
        self.start + Duration::hours(PUBLISH_INTERVAL_HOURS * n as i64)
    }

    pub fn claimed(&self) -> usize {
        self.claimed.load(Ordering::SeqCst)
    }
}
