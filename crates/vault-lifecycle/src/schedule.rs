//! Daily wall-clock window in a civil timezone.
//!
//! Boundaries are computed fresh from `{timezone, hour, minute}` relative to
//! "now" each time they are needed; nothing depends on process uptime.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use vault_core::config::HeistConfig;

use crate::error::{LifecycleError, Result};

/// Where an instant falls relative to its civil day's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPhase {
    BeforeOpen,
    Open,
    AfterClose,
}

/// A same-day `[open, close)` window evaluated in `tz`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyWindow {
    tz: Tz,
    open: NaiveTime,
    close: NaiveTime,
}

impl DailyWindow {
    pub fn new(tz: Tz, open: NaiveTime, close: NaiveTime) -> Result<Self> {
        if close <= open {
            return Err(LifecycleError::InvalidInput(format!(
                "window closes at {close} before it opens at {open}"
            )));
        }
        Ok(Self { tz, open, close })
    }

    pub fn from_config(cfg: &HeistConfig) -> Result<Self> {
        let tz = cfg.tz()?;
        let open = hm(cfg.open_hour, cfg.open_minute)?;
        let close = hm(cfg.close_hour, cfg.close_minute)?;
        Self::new(tz, open, close)
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    /// Calendar date of `at` in the window's timezone.
    pub fn civil_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.tz).date_naive()
    }

    /// UTC instants of the opening and closing boundary on `date`.
    pub fn window_on(&self, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.instant_on(date, self.open), self.instant_on(date, self.close))
    }

    pub fn open_on(&self, date: NaiveDate) -> DateTime<Utc> {
        self.instant_on(date, self.open)
    }

    pub fn close_on(&self, date: NaiveDate) -> DateTime<Utc> {
        self.instant_on(date, self.close)
    }

    pub fn phase_at(&self, at: DateTime<Utc>) -> WindowPhase {
        let (open, close) = self.window_on(self.civil_date(at));
        if at < open {
            WindowPhase::BeforeOpen
        } else if at < close {
            WindowPhase::Open
        } else {
            WindowPhase::AfterClose
        }
    }

    /// First opening boundary strictly after `from`.
    pub fn next_open_after(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        self.next_daily(self.open, from)
    }

    /// First closing boundary strictly after `from`.
    pub fn next_close_after(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        self.next_daily(self.close, from)
    }

    fn next_daily(&self, time: NaiveTime, from: DateTime<Utc>) -> DateTime<Utc> {
        let today = self.civil_date(from);
        let candidate = self.instant_on(today, time);
        if candidate > from {
            candidate
        } else {
            // Today's boundary has passed; advance one civil day.
            self.instant_on(today.succ_opt().unwrap_or(NaiveDate::MAX), time)
        }
    }

    /// Resolve a civil date and time to UTC. Ambiguous times (clocks going
    /// back) take the earlier instant; skipped times (clocks going forward)
    /// move one hour later.
    fn instant_on(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        let naive = date.and_time(time);
        self.tz
            .from_local_datetime(&naive)
            .earliest()
            .or_else(|| self.tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
            .map(|local| local.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
    }
}

fn hm(hour: u8, minute: u8) -> Result<NaiveTime> {
    NaiveTime::from_hms_opt(hour.into(), minute.into(), 0)
        .ok_or_else(|| LifecycleError::InvalidInput(format!("invalid time {hour:02}:{minute:02}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(tz: Tz, open: (u32, u32), close: (u32, u32)) -> DailyWindow {
        DailyWindow::new(
            tz,
            NaiveTime::from_hms_opt(open.0, open.1, 0).unwrap(),
            NaiveTime::from_hms_opt(close.0, close.1, 0).unwrap(),
        )
        .unwrap()
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn phases_in_utc() {
        let w = window(chrono_tz::UTC, (20, 0), (22, 0));
        assert_eq!(w.phase_at(utc(2024, 5, 1, 19, 59)), WindowPhase::BeforeOpen);
        assert_eq!(w.phase_at(utc(2024, 5, 1, 20, 0)), WindowPhase::Open);
        assert_eq!(w.phase_at(utc(2024, 5, 1, 22, 0)), WindowPhase::AfterClose);
    }

    #[test]
    fn civil_date_follows_timezone() {
        let w = window(chrono_tz::Asia::Tokyo, (20, 0), (22, 0));
        // 16:00 UTC is 01:00 the next day in Tokyo.
        let at = utc(2024, 5, 1, 16, 0);
        assert_eq!(w.civil_date(at), NaiveDate::from_ymd_opt(2024, 5, 2).unwrap());
        assert_eq!(w.phase_at(at), WindowPhase::BeforeOpen);
        assert_eq!(w.next_open_after(at), utc(2024, 5, 2, 11, 0));
    }

    #[test]
    fn next_boundary_rolls_to_tomorrow() {
        let w = window(chrono_tz::UTC, (20, 0), (22, 0));
        assert_eq!(w.next_open_after(utc(2024, 5, 1, 20, 0)), utc(2024, 5, 2, 20, 0));
        assert_eq!(w.next_close_after(utc(2024, 5, 1, 21, 0)), utc(2024, 5, 1, 22, 0));
    }

    #[test]
    fn window_honours_daylight_saving() {
        let w = window(chrono_tz::America::New_York, (20, 0), (22, 0));
        // EST (UTC-5) in January, EDT (UTC-4) in July.
        let jan = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let jul = NaiveDate::from_ymd_opt(2024, 7, 15).unwrap();
        assert_eq!(w.open_on(jan), utc(2024, 1, 16, 1, 0));
        assert_eq!(w.open_on(jul), utc(2024, 7, 16, 0, 0));
    }

    #[test]
    fn skipped_local_time_moves_forward() {
        let w = window(chrono_tz::America::New_York, (2, 30), (4, 0));
        // 02:30 does not exist on 2024-03-10; 03:30 EDT is 07:30 UTC.
        let date = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        assert_eq!(w.open_on(date), utc(2024, 3, 10, 7, 30));
    }

    #[test]
    fn rejects_inverted_window() {
        let t = |h| NaiveTime::from_hms_opt(h, 0, 0).unwrap();
        assert!(DailyWindow::new(chrono_tz::UTC, t(22), t(20)).is_err());
        assert!(DailyWindow::new(chrono_tz::UTC, t(20), t(20)).is_err());
    }
}
