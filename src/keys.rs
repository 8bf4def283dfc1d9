//! Volatile-store key grammar.
//!
//! Every key the service writes is produced here, so the grammar is the single
//! source of truth for what lives in Redis:
//!
//! ```text
//! <prefix>v1:site:<site_id>:<metric>:all
//! <prefix>v1:site:<site_id>:<metric>:day:<YYYY-MM-DD>
//! <prefix>v1:site:<site_id>:online:win:<window_index>
//! <prefix>v1:dirty
//! <prefix>v1:lock:flush
//! ```
//!
//! Dirty-set members are either `<site_id>`, meaning "reconcile the day that
//! just completed", or `<site_id>:<YYYY-MM-DD>` for a specific day whose
//! reconciliation failed and is still pending.
//!
//! Site ids are integers and dates have a fixed width, so distinct
//! (site, metric, scope) triples never render to the same string.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, TimeZone, Utc};
use std::fmt;

/// Bumped whenever the grammar changes shape.
pub const KEY_VERSION: &str = "v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    Hits,
    Visits,
    Online,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Hits => "hits",
            Metric::Visits => "visits",
            Metric::Online => "online",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    AllTime,
    Day(NaiveDate),
    OnlineWindow(i64),
}

/// A parsed dirty-set member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirtyMember {
    /// The site has hits on the day the next flush reconciles.
    Site(i64),
    /// A day of the site that a previous flush failed to make durable.
    Pending(i64, NaiveDate),
}

impl DirtyMember {
    pub fn parse(member: &str) -> Option<Self> {
        let (site, date) = match member.split_once(':') {
            Some((site, date)) => (site, Some(date)),
            None => (member, None),
        };
        let site_id = site.parse::<i64>().ok().filter(|id| *id > 0)?;
        match date {
            None => Some(DirtyMember::Site(site_id)),
            Some(date) => NaiveDate::parse_from_str(date, "%Y-%m-%d")
                .ok()
                .map(|date| DirtyMember::Pending(site_id, date)),
        }
    }

    pub fn site_id(&self) -> i64 {
        match self {
            DirtyMember::Site(id) | DirtyMember::Pending(id, _) => *id,
        }
    }
}

impl fmt::Display for DirtyMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirtyMember::Site(id) => write!(f, "{}", id),
            DirtyMember::Pending(id, date) => write!(f, "{}:{}", id, date.format("%Y-%m-%d")),
        }
    }
}

/// Pure mapping from counter coordinates to key strings, plus the time
/// bucketing rules that go with them.
#[derive(Debug, Clone)]
pub struct KeyScheme {
    prefix: String,
    offset: FixedOffset,
    online_window_secs: i64,
}

impl KeyScheme {
    pub fn new(prefix: impl Into<String>, offset: FixedOffset, online_window_secs: u64) -> Self {
        Self {
            prefix: prefix.into(),
            offset,
            online_window_secs: online_window_secs.max(1) as i64,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn online_window_secs(&self) -> i64 {
        self.online_window_secs
    }

    pub fn key_for(&self, site_id: i64, metric: Metric, scope: Scope) -> String {
        let base = format!("{}{}:site:{}:{}", self.prefix, KEY_VERSION, site_id, metric);
        match scope {
            Scope::AllTime => format!("{}:all", base),
            Scope::Day(date) => format!("{}:day:{}", base, date.format("%Y-%m-%d")),
            Scope::OnlineWindow(window) => format!("{}:win:{}", base, window),
        }
    }

    pub fn dirty_set_key(&self) -> String {
        format!("{}{}:dirty", self.prefix, KEY_VERSION)
    }

    pub fn flush_lock_key(&self) -> String {
        format!("{}{}:lock:flush", self.prefix, KEY_VERSION)
    }

    /// Calendar date of `at` in the configured offset.
    pub fn day_of(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.offset).date_naive()
    }

    /// The day a flush at `now` reconciles: the local day that just completed.
    pub fn completed_day(&self, now: DateTime<Utc>) -> NaiveDate {
        self.day_of(now - Duration::days(1))
    }

    /// Unix timestamp of the local midnight that ends `date`.
    pub fn end_of_day(&self, date: NaiveDate) -> i64 {
        let next = date.succ_opt().unwrap_or(date);
        next.and_hms_opt(0, 0, 0)
            .and_then(|midnight| self.offset.from_local_datetime(&midnight).single())
            .map(|dt| dt.timestamp())
            .unwrap_or(i64::MAX)
    }

    pub fn window_of(&self, unix_ts: i64) -> i64 {
        unix_ts.div_euclid(self.online_window_secs)
    }

    /// Unix timestamp at which `window` closes.
    pub fn window_end(&self, window: i64) -> i64 {
        (window + 1) * self.online_window_secs
    }
}
