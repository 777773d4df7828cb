//! Japan Standard Time helpers.
//!
//! Every calendar-facing date in the system is bucketed in JST, a fixed
//! UTC+09:00 offset with no DST. `Asia/Tokyo` carries exactly that
//! offset, so the named zone doubles as the display zone.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// The calendar zone. Fixed +09:00, no DST transitions.
pub const JST: Tz = chrono_tz::Asia::Tokyo;

/// Convert a UTC instant to JST wall time.
pub fn to_jst(t: DateTime<Utc>) -> DateTime<Tz> {
    t.with_timezone(&JST)
}

/// The JST civil date an instant falls on.
pub fn civil_date(t: DateTime<Utc>) -> NaiveDate {
    to_jst(t).date_naive()
}

/// UTC instant of JST midnight starting the given civil date.
pub fn day_start_utc(date: NaiveDate) -> DateTime<Utc> {
    JST.from_local_datetime(&date.and_time(NaiveTime::MIN))
        .single()
        .expect("fixed-offset zone has no gaps")
        .with_timezone(&Utc)
}

/// UTC instant of a JST wall-clock time on the given civil date.
pub fn at_jst(date: NaiveDate, hour: u32, minute: u32) -> DateTime<Utc> {
    day_start_utc(date) + Duration::minutes((hour * 60 + minute) as i64)
}

/// Exclusive end of a JST civil date, as a UTC instant.
pub fn day_end_utc(date: NaiveDate) -> DateTime<Utc> {
    day_start_utc(date) + Duration::days(1)
}
