//! BCD clock records as kept by the Thermochron registers.
//!
//! The full form is seven bytes (second, minute, hour, weekday, day, month,
//! year) with bit 7 of the month byte flagging the 2000s. The mission stamp
//! is five bytes (minute, hour, day, month, year) without a century; it is
//! placed within 50 years of a reference year.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};

use crate::error::errno::*;
use crate::utils::Result;

/// Hour tens, indexed by the high nibble of the hour register. Values 4-7
/// are the 12 hour encodings.
const HOUR_TENS: [u32; 8] = [0, 10, 20, 30, 0, 10, 12, 22];

const CENTURY: u8 = 0x80;

fn from_bcd(b: u8) -> u32 {
    (b & 0x0F) as u32 + 10 * (b >> 4) as u32
}

fn to_bcd(v: u32) -> u8 {
    (v + 6 * (v / 10)) as u8
}

fn hour(b: u8) -> u32 {
    (b & 0x0F) as u32 + HOUR_TENS[((b >> 4) & 0x07) as usize]
}

fn month(b: u8) -> u32 {
    (b & 0x0F) as u32 + 10 * ((b & 0x10) >> 4) as u32
}

fn assemble(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Result<DateTime<Utc>> {
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, min, sec))
        .map(|t| Utc.from_utc_datetime(&t))
        .ok_or(EINVAL.into())
}

/// Decode the 7-byte clock form.
pub fn decode(data: &[u8; 7]) -> Result<DateTime<Utc>> {
    let century = if data[5] & CENTURY != 0 { 2000 } else { 2100 };
    assemble(
        century + from_bcd(data[6]) as i32,
        month(data[5]),
        from_bcd(data[4]),
        hour(data[2]),
        from_bcd(data[1]),
        from_bcd(data[0]),
    )
}

/// Encode into the 7-byte clock form, 24 hour mode.
pub fn encode(t: &DateTime<Utc>) -> Result<[u8; 7]> {
    if !(2000..2200).contains(&t.year()) {
        return Err(ERANGE.into());
    }
    let year = (t.year() % 100) as u32;
    let mut month = to_bcd(t.month());
    if t.year() < 2100 {
        month |= CENTURY;
    }
    Ok([
        to_bcd(t.second()),
        to_bcd(t.minute()),
        to_bcd(t.hour()),
        t.weekday().number_from_sunday() as u8,
        to_bcd(t.day()),
        month,
        to_bcd(year),
    ])
}

/// Decode the 5-byte mission stamp relative to `reference_year`.
pub fn decode_short(data: &[u8; 5], reference_year: i32) -> Result<DateTime<Utc>> {
    let mut year = 1900 + from_bcd(data[4]) as i32;
    while year + 50 < reference_year {
        year += 100;
    }
    assemble(year, month(data[3]), from_bcd(data[2]), hour(data[1]), from_bcd(data[0]), 0)
}

/// Encode the 5-byte mission stamp; seconds and century are dropped.
pub fn encode_short(t: &DateTime<Utc>) -> [u8; 5] {
    [
        to_bcd(t.minute()),
        to_bcd(t.hour()),
        to_bcd(t.day()),
        to_bcd(t.month()),
        to_bcd(t.year().rem_euclid(100) as u32),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn clock_round_trip_across_window() {
        for t in [
            at(2000, 1, 1, 0, 0, 0),
            at(2024, 2, 29, 23, 59, 58),
            at(2099, 12, 31, 12, 30, 15),
            at(2100, 3, 1, 7, 5, 9),
            at(2199, 6, 15, 19, 45, 0),
        ] {
            assert_eq!(decode(&encode(&t).unwrap()).unwrap(), t);
        }
    }

    #[test]
    fn clock_bytes() {
        let raw = encode(&at(2023, 11, 5, 21, 7, 42)).unwrap();
        // Sunday is weekday 1
        assert_eq!(raw, [0x42, 0x07, 0x21, 0x01, 0x05, 0x91, 0x23]);
    }

    #[test]
    fn outside_window_is_range_error() {
        assert_eq!(encode(&at(1999, 12, 31, 0, 0, 0)).unwrap_err().errno(), ERANGE);
    }

    #[test]
    fn twelve_hour_nibbles() {
        // high nibble 6 adds 12, 7 adds 22
        let mut raw = encode(&at(2020, 1, 1, 0, 0, 0)).unwrap();
        raw[2] = 0x61;
        assert_eq!(decode(&raw).unwrap().hour(), 13);
        raw[2] = 0x71;
        assert_eq!(decode(&raw).unwrap().hour(), 23);
        raw[2] = 0x45;
        assert_eq!(decode(&raw).unwrap().hour(), 5);
    }

    #[test]
    fn garbage_is_invalid() {
        let raw = [0x00, 0x00, 0x00, 0x01, 0x32, 0x82, 0x23];
        assert_eq!(decode(&raw).unwrap_err().errno(), EINVAL);
    }

    #[test]
    fn short_form_picks_nearest_century() {
        let t = at(2021, 7, 4, 18, 30, 0);
        let raw = encode_short(&t);
        assert_eq!(decode_short(&raw, 2026).unwrap(), t);

        for reference in [1980, 2000, 2026, 2060, 2150] {
            let year = decode_short(&raw, reference).unwrap().year();
            assert!((year - reference).abs() <= 50, "{} vs {}", year, reference);
            assert_eq!(year % 100, 21);
        }
    }
}
