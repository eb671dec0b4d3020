//! NTP-epoch time conversions shared by the WebRTC stack and the gamepad event frames.
//!
//! NTP time is a 64-bit fixed-point value: the high 32 bits are whole seconds since
//! 1900-01-01 UTC, the low 32 bits are a fractional second in units of 1/2^32.

use chrono::{DateTime, Duration, TimeZone, Utc};
use once_cell::sync::Lazy;

pub static NTP_EPOCH: Lazy<DateTime<Utc>> = Lazy::new(|| Utc.with_ymd_and_hms(1900, 1, 1, 0, 0, 0).unwrap());

/// Current wall-clock time.
pub fn current_datetime() -> DateTime<Utc> {
    Utc::now()
}

/// Milliseconds elapsed since the NTP epoch (1900-01-01 UTC). Always non-negative for
/// any real wall clock.
pub fn current_ms() -> i64 {
    let delta = current_datetime() - *NTP_EPOCH;
    delta.num_milliseconds()
}

/// Current time as a 32.32 fixed-point NTP timestamp.
pub fn current_ntp_time() -> u64 {
    datetime_to_ntp(current_datetime())
}

/// Convert an NTP timestamp back to a UTC datetime.
pub fn datetime_from_ntp(ntp: u64) -> DateTime<Utc> {
    let seconds = (ntp >> 32) as i64;
    let frac = (ntp & 0xFFFF_FFFF) as f64;
    let micros = (frac * 1_000_000.0 / (1u64 << 32) as f64).round() as i64;
    *NTP_EPOCH + Duration::seconds(seconds) + Duration::microseconds(micros)
}

/// Convert a UTC datetime into a 32.32 fixed-point NTP timestamp.
pub fn datetime_to_ntp(dt: DateTime<Utc>) -> u64 {
    let delta = dt - *NTP_EPOCH;
    let high = delta.num_seconds();
    let sub_second_micros = (delta - Duration::seconds(high)).num_microseconds().unwrap_or(0);
    let low = ((sub_second_micros as u64) * (1u64 << 32)) / 1_000_000;
    ((high as u64) << 32) | low
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_roundtrips_to_zero() {
        assert_eq!(datetime_to_ntp(*NTP_EPOCH), 0);
    }

    #[test]
    fn current_ms_is_nonnegative() {
        assert!(current_ms() >= 0);
    }

    #[test]
    fn roundtrip_truncated_to_microseconds() {
        let d = Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 45).unwrap() + Duration::microseconds(123_456);
        let ntp = datetime_to_ntp(d);
        let back = datetime_from_ntp(ntp);
        let diff = (back - d).num_microseconds().unwrap().abs();
        assert!(diff <= 1, "roundtrip drift {diff}us exceeds one microsecond");
    }
}
