//! Trading-calendar helper: is the US equity market open right now.
//!
//! Holidays are not sourced from a live calendar feed — this tracks the
//! fixed-date NYSE holidays plus the standard 9:30-16:00 Eastern window,
//! which is sufficient for gating snapshot writes and does not need to be
//! exact to the minute for days the exchange closes early.

use chrono::{Datelike, NaiveDate, TimeZone, Utc, Weekday};
use chrono_tz::America::New_York;

const FIXED_HOLIDAYS_MD: &[(u32, u32)] = &[(1, 1), (6, 19), (7, 4), (12, 25)];

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

fn is_fixed_holiday(date: NaiveDate) -> bool {
    FIXED_HOLIDAYS_MD.contains(&(date.month(), date.day()))
}

/// Whether `date` is a trading day: not a weekend, not a fixed NYSE holiday.
pub fn is_trading_day(date: NaiveDate) -> bool {
    !is_weekend(date) && !is_fixed_holiday(date)
}

/// Whether the market is open at `now`, in the 9:30-16:00 America/New_York
/// window on a trading day.
pub fn is_market_open(now: chrono::DateTime<Utc>) -> bool {
    let eastern = now.with_timezone(&New_York);
    let date = eastern.date_naive();
    if !is_trading_day(date) {
        return false;
    }
    let open = New_York.with_ymd_and_hms(date.year(), date.month(), date.day(), 9, 30, 0).unwrap();
    let close = New_York.with_ymd_and_hms(date.year(), date.month(), date.day(), 16, 0, 0).unwrap();
    eastern >= open && eastern < close
}

/// Whether `now` is on or after the 16:00 America/New_York close on a
/// trading day — gates the once-per-day EOD snapshot write.
pub fn is_after_close(now: chrono::DateTime<Utc>) -> bool {
    let eastern = now.with_timezone(&New_York);
    let date = eastern.date_naive();
    if !is_trading_day(date) {
        return false;
    }
    let close = New_York.with_ymd_and_hms(date.year(), date.month(), date.day(), 16, 0, 0).unwrap();
    eastern >= close
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn weekday_during_session_is_open() {
        let ts = New_York.with_ymd_and_hms(2026, 7, 29, 10, 0, 0).unwrap().with_timezone(&Utc);
        assert!(is_market_open(ts));
    }

    #[test]
    fn before_open_is_closed() {
        let ts = New_York.with_ymd_and_hms(2026, 7, 29, 9, 0, 0).unwrap().with_timezone(&Utc);
        assert!(!is_market_open(ts));
    }

    #[test]
    fn weekend_is_closed() {
        let ts = New_York.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap().with_timezone(&Utc);
        assert!(!is_market_open(ts));
    }

    #[test]
    fn fixed_holiday_is_closed() {
        let ts = New_York.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap().with_timezone(&Utc);
        assert!(!is_market_open(ts));
    }

    #[test]
    fn after_close_on_a_weekday_is_true() {
        let ts = New_York.with_ymd_and_hms(2026, 7, 29, 16, 5, 0).unwrap().with_timezone(&Utc);
        assert!(is_after_close(ts));
    }

    #[test]
    fn before_close_is_not_after_close() {
        let ts = New_York.with_ymd_and_hms(2026, 7, 29, 10, 0, 0).unwrap().with_timezone(&Utc);
        assert!(!is_after_close(ts));
    }

    #[test]
    fn weekend_is_never_after_close() {
        let ts = New_York.with_ymd_and_hms(2026, 8, 1, 20, 0, 0).unwrap().with_timezone(&Utc);
        assert!(!is_after_close(ts));
    }
}
