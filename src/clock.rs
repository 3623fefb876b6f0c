// =============================================================================
// Clock & Calendar — NY session phases, NYSE holidays, poll cadence
// =============================================================================
//
// All day-boundary and session decisions happen in America/New_York via an
// IANA zone (DST-safe); everything stored or logged is UTC. The calendar
// covers weekends plus NYSE full-closure holidays, including Good Friday via
// the Gregorian computus.
// =============================================================================

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::America::New_York;
use chrono_tz::Tz;
use std::time::Duration;
use tracing::warn;

use crate::types::MarketPhase;

fn et(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap_or_default()
}

/// Regular-session open in NY local time (09:30 ET).
pub fn market_open_time() -> NaiveTime {
    et(9, 30)
}

/// Regular-session close in NY local time (16:00 ET).
pub fn market_close_time() -> NaiveTime {
    et(16, 0)
}

// ---------------------------------------------------------------------------
// NY time helpers
// ---------------------------------------------------------------------------

/// The given UTC instant in New York local time.
pub fn ny_now(now_utc: DateTime<Utc>) -> DateTime<Tz> {
    now_utc.with_timezone(&New_York)
}

/// The NY calendar date at the given UTC instant. All per-day artifacts are
/// keyed by this date.
pub fn ny_date(now_utc: DateTime<Utc>) -> NaiveDate {
    ny_now(now_utc).date_naive()
}

/// Regular-session open (09:30 ET) of `date`, as a UTC instant.
pub fn market_open_utc(date: NaiveDate) -> DateTime<Utc> {
    New_York
        .from_local_datetime(&date.and_time(market_open_time()))
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        // 09:30 never falls inside a DST transition, but stay total anyway.
        .unwrap_or_else(|| Utc.from_utc_datetime(&date.and_time(market_open_time())))
}

// ---------------------------------------------------------------------------
// Session phase
// ---------------------------------------------------------------------------

/// Classify the UTC instant into a session phase.
pub fn market_phase(now_utc: DateTime<Utc>) -> MarketPhase {
    let local = ny_now(now_utc);
    let date = local.date_naive();

    if !is_trading_day(date) {
        return MarketPhase::Holiday;
    }

    let t = local.time();
    if t < market_open_time() {
        MarketPhase::Pre
    } else if t < et(9, 45) {
        MarketPhase::OpenNoise
    } else if t < et(10, 30) {
        MarketPhase::EarlyTrend
    } else if t < et(15, 30) {
        MarketPhase::Normal
    } else if t < market_close_time() {
        MarketPhase::CloseProtect
    } else {
        MarketPhase::Post
    }
}

/// Weekday and not a NYSE full-closure holiday.
pub fn is_trading_day(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !is_nyse_holiday(date)
}

// ---------------------------------------------------------------------------
// NYSE holiday calendar
// ---------------------------------------------------------------------------

/// Whether `date` is a NYSE full-closure holiday (early-close days trade).
pub fn is_nyse_holiday(date: NaiveDate) -> bool {
    nyse_holidays(date.year()).contains(&date)
}

/// All NYSE full-closure holidays for `year`, with weekend observation shifts
/// applied (Saturday -> Friday, Sunday -> Monday). New Year's falling on a
/// Saturday is not observed, per exchange practice.
fn nyse_holidays(year: i32) -> Vec<NaiveDate> {
    let mut days = Vec::with_capacity(10);

    // New Year's Day.
    if let Some(d) = NaiveDate::from_ymd_opt(year, 1, 1) {
        match d.weekday() {
            Weekday::Sat => {}
            Weekday::Sun => days.push(d + chrono::Days::new(1)),
            _ => days.push(d),
        }
    }

    // MLK Day: third Monday of January.
    days.extend(nth_weekday(year, 1, Weekday::Mon, 3));
    // Washington's Birthday: third Monday of February.
    days.extend(nth_weekday(year, 2, Weekday::Mon, 3));
    // Good Friday: two days before Easter Sunday.
    days.extend(easter_sunday(year).map(|e| e - chrono::Days::new(2)));
    // Memorial Day: last Monday of May.
    days.extend(last_weekday(year, 5, Weekday::Mon));
    // Juneteenth and Independence Day, observed.
    days.extend(observed(year, 6, 19));
    days.extend(observed(year, 7, 4));
    // Labor Day: first Monday of September.
    days.extend(nth_weekday(year, 9, Weekday::Mon, 1));
    // Thanksgiving: fourth Thursday of November.
    days.extend(nth_weekday(year, 11, Weekday::Thu, 4));
    // Christmas, observed.
    days.extend(observed(year, 12, 25));

    days
}

/// Fixed-date holiday with Saturday -> Friday / Sunday -> Monday observation.
fn observed(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    let d = NaiveDate::from_ymd_opt(year, month, day)?;
    Some(match d.weekday() {
        Weekday::Sat => d - chrono::Days::new(1),
        Weekday::Sun => d + chrono::Days::new(1),
        _ => d,
    })
}

/// The n-th `weekday` of `month` (n is 1-based).
fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u32) -> Option<NaiveDate> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let offset = (7 + weekday.num_days_from_monday() - first.weekday().num_days_from_monday()) % 7;
    first.checked_add_days(chrono::Days::new(u64::from(offset + (n - 1) * 7)))
}

/// The last `weekday` of `month`.
fn last_weekday(year: i32, month: u32, weekday: Weekday) -> Option<NaiveDate> {
    let next_month = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    let last = next_month.pred_opt()?;
    let offset = (7 + last.weekday().num_days_from_monday() - weekday.num_days_from_monday()) % 7;
    last.checked_sub_days(chrono::Days::new(u64::from(offset)))
}

/// Easter Sunday by the anonymous Gregorian computus.
fn easter_sunday(year: i32) -> Option<NaiveDate> {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = ((h + l - 7 * m + 114) % 31) + 1;
    NaiveDate::from_ymd_opt(year, month as u32, day as u32)
}

// ---------------------------------------------------------------------------
// Poll cadence
// ---------------------------------------------------------------------------

/// Poll-interval policy: a tight interval inside a configurable ET window
/// around the open, a market interval while the session is open, and a base
/// interval otherwise.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub base: Duration,
    pub market: Duration,
    pub tight: Duration,
    pub tight_start: NaiveTime,
    pub tight_end: NaiveTime,
}

pub const DEFAULT_POLL_BASE_SECS: u64 = 300;
pub const DEFAULT_POLL_TIGHT_SECS: u64 = 15;

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(DEFAULT_POLL_BASE_SECS),
            market: Duration::from_secs(DEFAULT_POLL_BASE_SECS.min(60)),
            tight: Duration::from_secs(DEFAULT_POLL_TIGHT_SECS),
            tight_start: et(9, 30),
            tight_end: et(10, 5),
        }
    }
}

impl PollPolicy {
    /// Build a policy from raw env strings. Any unparseable value falls back
    /// to its default with a single warning (this runs once at startup).
    pub fn from_raw(
        base_secs: Option<&str>,
        market_secs: Option<&str>,
        tight_secs: Option<&str>,
        tight_start: Option<&str>,
        tight_end: Option<&str>,
    ) -> Self {
        let defaults = Self::default();

        let base = parse_secs(base_secs, DEFAULT_POLL_BASE_SECS, "EXECUTION_POLL_SECONDS");
        let market = parse_secs(
            market_secs,
            base.min(60),
            "EXECUTION_POLL_MARKET_SECONDS",
        );
        let tight = parse_secs(
            tight_secs,
            DEFAULT_POLL_TIGHT_SECS,
            "EXECUTION_POLL_TIGHT_SECONDS",
        );
        let start = parse_et(tight_start, defaults.tight_start, "EXECUTION_POLL_TIGHT_START_ET");
        let end = parse_et(tight_end, defaults.tight_end, "EXECUTION_POLL_TIGHT_END_ET");

        Self {
            base: Duration::from_secs(base),
            market: Duration::from_secs(market),
            tight: Duration::from_secs(tight),
            tight_start: start,
            tight_end: end,
        }
    }

    /// Interval until the next cycle given the current UTC instant.
    pub fn poll_interval(&self, now_utc: DateTime<Utc>) -> Duration {
        let phase = market_phase(now_utc);
        if !phase.market_open() {
            return self.base;
        }
        let t = ny_now(now_utc).time();
        if t >= self.tight_start && t < self.tight_end {
            self.tight
        } else {
            self.market
        }
    }
}

fn parse_secs(raw: Option<&str>, default: u64, name: &str) -> u64 {
    match raw {
        None => default,
        Some(s) => match s.trim().parse::<u64>() {
            Ok(v) if v > 0 => v,
            _ => {
                warn!(var = name, value = s, default, "invalid poll seconds — using default");
                default
            }
        },
    }
}

fn parse_et(raw: Option<&str>, default: NaiveTime, name: &str) -> NaiveTime {
    match raw {
        None => default,
        Some(s) => match NaiveTime::parse_from_str(s.trim(), "%H:%M") {
            Ok(t) => t,
            Err(_) => {
                warn!(var = name, value = s, "invalid ET time — using default");
                default
            }
        },
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(date: &str, time: &str) -> DateTime<Utc> {
        let d = NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap();
        let t = NaiveTime::parse_from_str(time, "%H:%M:%S").unwrap();
        New_York
            .from_local_datetime(&d.and_time(t))
            .single()
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn phase_boundaries_on_a_trading_day() {
        // 2025-06-02 is a Monday, no holiday.
        assert_eq!(market_phase(utc("2025-06-02", "09:29:59")), MarketPhase::Pre);
        assert_eq!(market_phase(utc("2025-06-02", "09:30:00")), MarketPhase::OpenNoise);
        assert_eq!(market_phase(utc("2025-06-02", "09:44:59")), MarketPhase::OpenNoise);
        assert_eq!(market_phase(utc("2025-06-02", "09:45:00")), MarketPhase::EarlyTrend);
        assert_eq!(market_phase(utc("2025-06-02", "10:30:00")), MarketPhase::Normal);
        assert_eq!(market_phase(utc("2025-06-02", "15:29:59")), MarketPhase::Normal);
        assert_eq!(market_phase(utc("2025-06-02", "15:30:00")), MarketPhase::CloseProtect);
        assert_eq!(market_phase(utc("2025-06-02", "16:00:00")), MarketPhase::Post);
    }

    #[test]
    fn weekend_is_holiday_phase() {
        assert_eq!(market_phase(utc("2025-06-01", "12:00:00")), MarketPhase::Holiday);
    }

    #[test]
    fn dst_safe_phase_classification() {
        // 14:00 UTC is 09:00 EST in January (Pre) but 10:00 EDT in July
        // (EarlyTrend).
        let jan = DateTime::parse_from_rfc3339("2025-01-14T14:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let jul = DateTime::parse_from_rfc3339("2025-07-15T14:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(market_phase(jan), MarketPhase::Pre);
        assert_eq!(market_phase(jul), MarketPhase::EarlyTrend);
    }

    #[test]
    fn known_holidays_2025() {
        let holidays = [
            "2025-01-01", // New Year's
            "2025-01-20", // MLK
            "2025-02-17", // Washington's Birthday
            "2025-04-18", // Good Friday
            "2025-05-26", // Memorial Day
            "2025-06-19", // Juneteenth
            "2025-07-04", // Independence Day
            "2025-09-01", // Labor Day
            "2025-11-27", // Thanksgiving
            "2025-12-25", // Christmas
        ];
        for h in holidays {
            let d = NaiveDate::parse_from_str(h, "%Y-%m-%d").unwrap();
            assert!(is_nyse_holiday(d), "{h} should be a holiday");
            assert!(!is_trading_day(d));
        }
        let ordinary = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
        assert!(is_trading_day(ordinary));
    }

    #[test]
    fn observed_shifts() {
        // 2026-07-04 is a Saturday: observed Friday 2026-07-03.
        assert!(is_nyse_holiday(NaiveDate::from_ymd_opt(2026, 7, 3).unwrap()));
        assert!(!is_nyse_holiday(NaiveDate::from_ymd_opt(2026, 7, 6).unwrap()));
        // 2027-12-25 is a Saturday: observed Friday 2027-12-24.
        assert!(is_nyse_holiday(NaiveDate::from_ymd_opt(2027, 12, 24).unwrap()));
    }

    #[test]
    fn poll_interval_windows() {
        let policy = PollPolicy::default();

        // Inside the tight window.
        assert_eq!(
            policy.poll_interval(utc("2025-06-02", "09:35:00")),
            Duration::from_secs(15)
        );
        // Open but past the tight window.
        assert_eq!(
            policy.poll_interval(utc("2025-06-02", "11:00:00")),
            Duration::from_secs(60)
        );
        // Closed.
        assert_eq!(
            policy.poll_interval(utc("2025-06-02", "18:00:00")),
            Duration::from_secs(DEFAULT_POLL_BASE_SECS)
        );
    }

    #[test]
    fn poll_policy_falls_back_on_garbage() {
        let policy = PollPolicy::from_raw(
            Some("not-a-number"),
            None,
            Some("0"),
            Some("25:99"),
            None,
        );
        assert_eq!(policy.base, Duration::from_secs(DEFAULT_POLL_BASE_SECS));
        assert_eq!(policy.tight, Duration::from_secs(DEFAULT_POLL_TIGHT_SECS));
        assert_eq!(policy.tight_start, NaiveTime::from_hms_opt(9, 30, 0).unwrap());
    }

    #[test]
    fn open_instant_matches_ny_clock() {
        let d = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
        let open = market_open_utc(d);
        assert_eq!(ny_now(open).time(), market_open_time());
        assert_eq!(ny_date(open), d);
    }
}
