use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

use crate::models::SessionPhase;

/// Session anchor: local market-open time in an IANA timezone, plus the
/// windows around it that define each phase.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub timezone: Tz,
    pub open_time: NaiveTime,
    pub pre_open_minutes: i64,
    pub open_window_minutes: i64,
    pub session_minutes: i64, // From open until the session is considered closed
    pub trade_weekends: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::America::New_York,
            open_time: NaiveTime::from_hms_opt(9, 30, 0).unwrap_or_default(),
            pre_open_minutes: 30,
            open_window_minutes: 30,
            session_minutes: 390, // 09:30 -> 16:00 local
            trade_weekends: false,
        }
    }
}

impl SessionConfig {
    /// Classify `now` and return the local trading date it belongs to
    pub fn phase_at(&self, now: DateTime<Utc>) -> (SessionPhase, NaiveDate) {
        let local = now.with_timezone(&self.timezone);
        let date = local.date_naive();

        if !self.trade_weekends && matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return (SessionPhase::Closed, date);
        }

        let Some(open) = self.open_at(date) else {
            // Open time falls in a DST gap on this date
            return (SessionPhase::Closed, date);
        };

        let pre_open = open - Duration::minutes(self.pre_open_minutes);
        let window_end = open + Duration::minutes(self.open_window_minutes);
        let session_end = open + Duration::minutes(self.session_minutes);

        let phase = if now < pre_open {
            SessionPhase::Closed
        } else if now < open {
            SessionPhase::PreOpen
        } else if now < window_end {
            SessionPhase::OpenWindow
        } else if now < session_end {
            SessionPhase::Regular
        } else {
            SessionPhase::Closed
        };

        (phase, date)
    }

    /// UTC instant of the market open on a local date
    pub fn open_at(&self, date: NaiveDate) -> Option<DateTime<Utc>> {
        self.timezone
            .from_local_datetime(&date.and_time(self.open_time))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
    }
}
