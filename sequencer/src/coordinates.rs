//! Equatorial coordinates, sexagesimal parsing/formatting and the small amount
//! of spherical astronomy the session needs (sidereal time, precession, altitude).

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Julian day of the J2000.0 epoch
pub const J2000: f64 = 2451545.0;

/// A pointing in hours of RA and degrees of Dec.
///
/// RA is always held in [0,24), Dec in [-90,90].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquatorialCoordinate {
    pub ra_hours: f64,
    pub dec_degrees: f64,
}

impl EquatorialCoordinate {
    /// Build a coordinate, wrapping RA into [0,24). Returns `None` for
    /// non-finite values or a declination outside [-90,90].
    pub fn new(ra_hours: f64, dec_degrees: f64) -> Option<Self> {
        if !ra_hours.is_finite() || !dec_degrees.is_finite() {
            return None;
        }
        if !(-90.0..=90.0).contains(&dec_degrees) {
            return None;
        }
        Some(Self {
            ra_hours: wrap_ra_hours(ra_hours),
            dec_degrees,
        })
    }

    /// Same declination, RA shifted by `hours` and re-wrapped
    pub fn offset_ra(&self, hours: f64) -> Self {
        Self {
            ra_hours: wrap_ra_hours(self.ra_hours + hours),
            dec_degrees: self.dec_degrees,
        }
    }
}

impl fmt::Display for EquatorialCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RA {} Dec {}",
            format_hms(self.ra_hours),
            format_dms(self.dec_degrees)
        )
    }
}

fn wrap_ra_hours(ra: f64) -> f64 {
    let wrapped = ra.rem_euclid(24.0);
    // rem_euclid can round up to exactly 24.0 for tiny negative inputs
    if wrapped >= 24.0 {
        0.0
    } else {
        wrapped
    }
}

/// Wrap an RA difference into [-12,12] hours
pub fn normalize_ra_delta_hours(diff: f64) -> f64 {
    let mut wrapped = diff % 24.0;
    if wrapped > 12.0 {
        wrapped -= 24.0;
    } else if wrapped < -12.0 {
        wrapped += 24.0;
    }
    wrapped
}

// =============================================================================
// SEXAGESIMAL
// =============================================================================

/// Parse "5:35:17", "05 35 17.3", "5h35m17s", "-5:23:24", "-05°23'24\"" or a
/// plain decimal number into decimal units.
pub fn parse_sexagesimal(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(v) = trimmed.parse::<f64>() {
        return v.is_finite().then_some(v);
    }

    let negative = trimmed.starts_with('-');
    let body = trimmed.trim_start_matches(['-', '+']);
    let mut total = 0.0;
    let mut scale = 1.0;
    let mut count = 0;
    for part in body
        .split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .filter(|p| !p.is_empty())
    {
        let value: f64 = part.parse().ok()?;
        if count > 0 && value >= 60.0 {
            return None;
        }
        total += value / scale;
        scale *= 60.0;
        count += 1;
        if count > 3 {
            return None;
        }
    }
    if count == 0 {
        return None;
    }
    Some(if negative { -total } else { total })
}

/// Parse an "RA DEC" pair such as "5:35:17 -5:23:24"
pub fn parse_coordinate_pair(input: &str) -> Option<EquatorialCoordinate> {
    let mut parts = input.split_whitespace();
    let ra = parse_sexagesimal(parts.next()?)?;
    let dec = parse_sexagesimal(parts.next()?)?;
    if parts.next().is_some() {
        return None;
    }
    EquatorialCoordinate::new(ra, dec)
}

fn split_sexagesimal(value: f64, second_decimals: usize) -> (bool, u32, u32, f64) {
    let negative = value < 0.0;
    let factor = 10f64.powi(second_decimals as i32);
    // Round once at the finest unit so 59.95s never renders as 60.0
    let total_secs = (value.abs() * 3600.0 * factor).round() / factor;
    let units = (total_secs / 3600.0).floor();
    let minutes = ((total_secs - units * 3600.0) / 60.0).floor();
    let seconds = total_secs - units * 3600.0 - minutes * 60.0;
    (negative, units as u32, minutes as u32, seconds)
}

/// Hours as "HH:MM:SS.s"
pub fn format_hms(hours: f64) -> String {
    let (negative, h, m, s) = split_sexagesimal(hours, 1);
    format!("{}{:02}:{:02}:{:04.1}", if negative { "-" } else { "" }, h, m, s)
}

/// Degrees as "±DD:MM:SS"
pub fn format_dms(degrees: f64) -> String {
    let (negative, d, m, s) = split_sexagesimal(degrees, 0);
    format!("{}{:02}:{:02}:{:02.0}", if negative { '-' } else { '+' }, d, m, s)
}

/// Seconds as "HH:MM:SS" (used for the time-to-flip countdown)
pub fn format_duration_hms(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

// =============================================================================
// TIME
// =============================================================================

/// Calculate Julian Day from a chrono DateTime
pub fn julian_day(dt: &DateTime<Utc>) -> f64 {
    let year = dt.year();
    let month = dt.month();
    let (y, m) = if month <= 2 {
        (year - 1, month + 12)
    } else {
        (year, month)
    };

    let a = y.div_euclid(100);
    let b = 2 - a + a.div_euclid(4);

    let jd = (365.25 * (y as f64 + 4716.0)).floor()
        + (30.6001 * (m as f64 + 1.0)).floor()
        + dt.day() as f64
        + b as f64
        - 1524.5;

    let time_fraction = (dt.hour() as f64
        + dt.minute() as f64 / 60.0
        + (dt.second() as f64 + dt.nanosecond() as f64 / 1e9) / 3600.0)
        / 24.0;

    jd + time_fraction
}

/// Local mean sidereal time in hours for a longitude in degrees (east positive)
pub fn local_sidereal_time(jd: f64, longitude: f64) -> f64 {
    let t = (jd - J2000) / 36525.0;

    // Greenwich Mean Sidereal Time in degrees
    let gmst = 280.46061837 + 360.98564736629 * (jd - J2000) + 0.000387933 * t * t
        - t * t * t / 38710000.0;

    (gmst + longitude).rem_euclid(360.0) / 15.0
}

// =============================================================================
// PRECESSION AND ALTITUDE
// =============================================================================

/// Precess a J2000 coordinate to the mean equator and equinox of `jd`
/// (IAU 1976 rotation angles).
pub fn precess_j2000_to_date(coord: &EquatorialCoordinate, jd: f64) -> EquatorialCoordinate {
    let t = (jd - J2000) / 36525.0;
    let arcsec = |v: f64| (v / 3600.0).to_radians();
    let zeta = arcsec(2306.2181 * t + 0.30188 * t * t + 0.017998 * t * t * t);
    let z = arcsec(2306.2181 * t + 1.09468 * t * t + 0.018203 * t * t * t);
    let theta = arcsec(2004.3109 * t - 0.42665 * t * t - 0.041833 * t * t * t);

    let ra0 = (coord.ra_hours * 15.0).to_radians();
    let dec0 = coord.dec_degrees.to_radians();

    let a = dec0.cos() * (ra0 + zeta).sin();
    let b = theta.cos() * dec0.cos() * (ra0 + zeta).cos() - theta.sin() * dec0.sin();
    let c = theta.sin() * dec0.cos() * (ra0 + zeta).cos() + theta.cos() * dec0.sin();

    let ra = a.atan2(b) + z;
    let dec = if c.abs() > 0.9 {
        // asin loses precision near the poles
        a.hypot(b).acos().copysign(c)
    } else {
        c.asin()
    };

    EquatorialCoordinate {
        ra_hours: wrap_ra_hours(ra.to_degrees() / 15.0),
        dec_degrees: dec.to_degrees().clamp(-90.0, 90.0),
    }
}

/// Altitude in degrees for an hour angle (hours), declination and site latitude
pub fn altitude_degrees(ha_hours: f64, dec_degrees: f64, latitude: f64) -> f64 {
    let ha = (ha_hours * 15.0).to_radians();
    let dec = dec_degrees.to_radians();
    let lat = latitude.to_radians();
    let sin_alt = lat.sin() * dec.sin() + lat.cos() * dec.cos() * ha.cos();
    sin_alt.clamp(-1.0, 1.0).asin().to_degrees()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use chrono::TimeZone;

    #[test]
    fn test_coordinate_validation() {
        assert!(EquatorialCoordinate::new(5.5, -5.0).is_some());
        assert!(EquatorialCoordinate::new(5.5, 91.0).is_none());
        assert!(EquatorialCoordinate::new(f64::NAN, 0.0).is_none());

        let wrapped = EquatorialCoordinate::new(25.0, 10.0).unwrap();
        assert_abs_diff_eq!(wrapped.ra_hours, 1.0, epsilon = 1e-12);
        let wrapped = EquatorialCoordinate::new(-1.0, 10.0).unwrap();
        assert_abs_diff_eq!(wrapped.ra_hours, 23.0, epsilon = 1e-12);
    }

    #[test]
    fn test_offset_ra_wraps() {
        let c = EquatorialCoordinate::new(23.0, 20.0).unwrap();
        let shifted = c.offset_ra(3.0);
        assert_abs_diff_eq!(shifted.ra_hours, 2.0, epsilon = 1e-12);
        assert_eq!(shifted.dec_degrees, 20.0);
    }

    #[test]
    fn test_normalize_ra_delta() {
        assert_abs_diff_eq!(normalize_ra_delta_hours(23.9), -0.1, epsilon = 1e-9);
        assert_abs_diff_eq!(normalize_ra_delta_hours(-23.9), 0.1, epsilon = 1e-9);
        assert_abs_diff_eq!(normalize_ra_delta_hours(1.5), 1.5, epsilon = 1e-9);
    }

    #[test]
    fn test_parse_sexagesimal_forms() {
        assert_abs_diff_eq!(parse_sexagesimal("5:35:17").unwrap(), 5.588055, epsilon = 1e-5);
        assert_abs_diff_eq!(parse_sexagesimal("5h35m17s").unwrap(), 5.588055, epsilon = 1e-5);
        assert_abs_diff_eq!(parse_sexagesimal("-5:23:24").unwrap(), -5.39, epsilon = 1e-9);
        assert_abs_diff_eq!(parse_sexagesimal("-05°23'24\"").unwrap(), -5.39, epsilon = 1e-9);
        assert_abs_diff_eq!(parse_sexagesimal("-0:30").unwrap(), -0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(parse_sexagesimal("83.82").unwrap(), 83.82, epsilon = 1e-12);
        assert!(parse_sexagesimal("5:75:00").is_none());
        assert!(parse_sexagesimal("abc").is_none());
        assert!(parse_sexagesimal("").is_none());
    }

    #[test]
    fn test_parse_coordinate_pair() {
        let c = parse_coordinate_pair("5:35:17 -5:23:24").unwrap();
        assert_abs_diff_eq!(c.dec_degrees, -5.39, epsilon = 1e-9);
        assert!(parse_coordinate_pair("5:35:17").is_none());
        assert!(parse_coordinate_pair("5:35:17 -95:00:00").is_none());
    }

    #[test]
    fn test_formatting() {
        assert_eq!(format_hms(5.5), "05:30:00.0");
        assert_eq!(format_dms(-5.39), "-05:23:24");
        assert_eq!(format_dms(41.269), "+41:16:08");
        assert_eq!(format_hms(0.99999999), "01:00:00.0");
        assert_eq!(format_duration_hms(3725.0), "01:02:05");
        assert_eq!(format_duration_hms(-5.0), "00:00:00");
    }

    #[test]
    fn test_julian_day_j2000() {
        let dt = Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).unwrap();
        assert_abs_diff_eq!(julian_day(&dt), J2000, epsilon = 1e-9);
    }

    #[test]
    fn test_sidereal_time_at_j2000() {
        // GMST at J2000.0 is 18h41m50.5s
        let lst = local_sidereal_time(J2000, 0.0);
        assert_abs_diff_eq!(lst, 18.697374558, epsilon = 1e-6);
        let lst_east = local_sidereal_time(J2000, 15.0);
        assert_abs_diff_eq!(lst_east, 19.697374558, epsilon = 1e-6);
    }

    #[test]
    fn test_precession_identity_at_j2000() {
        let c = EquatorialCoordinate::new(5.5, -5.0).unwrap();
        let p = precess_j2000_to_date(&c, J2000);
        assert_abs_diff_eq!(p.ra_hours, 5.5, epsilon = 1e-9);
        assert_abs_diff_eq!(p.dec_degrees, -5.0, epsilon = 1e-9);
    }

    #[test]
    fn test_precession_rate_on_equinox() {
        // At RA 0 Dec 0 annual precession is ~3.07s in RA and ~20.0" in Dec
        let c = EquatorialCoordinate::new(0.0, 0.0).unwrap();
        let p = precess_j2000_to_date(&c, J2000 + 25.0 * 365.25);
        assert_abs_diff_eq!(p.ra_hours * 3600.0, 25.0 * 3.0749, epsilon = 0.5);
        assert_abs_diff_eq!(p.dec_degrees * 3600.0, 25.0 * 20.043, epsilon = 1.0);
    }

    #[test]
    fn test_altitude() {
        // Object on the meridian at the zenith
        assert_abs_diff_eq!(altitude_degrees(0.0, 50.0, 50.0), 90.0, epsilon = 1e-9);
        // Celestial equator on the meridian from latitude 50
        assert_abs_diff_eq!(altitude_degrees(0.0, 0.0, 50.0), 40.0, epsilon = 1e-9);
        // Six hours from the meridian on the equator is the horizon
        assert_abs_diff_eq!(altitude_degrees(6.0, 0.0, 50.0), 0.0, epsilon = 1e-9);
    }
}
