use chrono::{DateTime, Datelike, Timelike, Utc};

/// Current UTC timestamp.
pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

/// Align a timestamp down to the nearest 5-minute boundary, matching the
/// `pmacct_traffic_records` snapshot cadence (spec §3).
pub fn floor_to_5min(ts: DateTime<Utc>) -> DateTime<Utc> {
    let minute = (ts.minute() / 5) * 5;
    ts.with_minute(minute)
        .unwrap()
        .with_second(0)
        .unwrap()
        .with_nanosecond(0)
        .unwrap()
}

/// (year, month, day, hour) components used as the hourly rollup key.
pub fn hour_key(ts: DateTime<Utc>) -> (i32, u32, u32, u32) {
    (ts.year(), ts.month(), ts.day(), ts.hour())
}

/// Daily rollup key: `(year, month, day, hour=0)`, per spec §3.
pub fn day_key(ts: DateTime<Utc>) -> (i32, u32, u32, u32) {
    (ts.year(), ts.month(), ts.day(), 0)
}

/// Monthly rollup key: `(year, month, day=0, hour=0)`, per spec §3.
pub fn month_key(ts: DateTime<Utc>) -> (i32, u32, u32, u32) {
    (ts.year(), ts.month(), 0, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn floor_to_5min_rounds_down() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 10, 3, 57, 42).unwrap();
        let floored = floor_to_5min(ts);
        assert_eq!(floored.minute(), 55);
        assert_eq!(floored.second(), 0);
    }

    #[test]
    fn floor_to_5min_is_idempotent_on_boundary() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 10, 4, 0, 0).unwrap();
        assert_eq!(floor_to_5min(ts), ts);
    }

    #[test]
    fn month_key_zeroes_day_and_hour() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 10, 4, 0, 0).unwrap();
        assert_eq!(month_key(ts), (2024, 5, 0, 0));
    }

    #[test]
    fn day_key_keeps_day_zeroes_hour() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 10, 4, 30, 0).unwrap();
        assert_eq!(day_key(ts), (2024, 5, 10, 0));
    }
}
