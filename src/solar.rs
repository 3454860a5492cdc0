//! # Clear-sky irradiance
//!
//! Solar geometry plus a simple clear-sky model, used to turn PV power into a
//! dimensionless "fraction of clear-sky plane-of-array irradiance" and back.
//!
//! The model is deliberately cheap: Haurwitz global horizontal irradiance,
//! a Meinel-style beam transmittance on a Kasten–Young air mass, and
//! isotropic-sky transposition onto the panel plane.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::PvSite;

/// Solar constant (energy at top of atmosphere), W/m²
const SOLAR_CONSTANT: f64 = 1367.0;
const GROUND_ALBEDO: f64 = 0.25;

/// Sun position as seen from a site
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolarPosition {
    pub zenith_deg: f64,
    /// Angle above the horizon (90 - zenith)
    pub elevation_deg: f64,
    /// Clockwise from north: 90 = east, 180 = south
    pub azimuth_deg: f64,
}

/// Clear-sky components in W/m²
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ClearSky {
    pub ghi: f64,
    pub dni: f64,
    pub dhi: f64,
}

fn fractional_year(ts: DateTime<Utc>) -> f64 {
    let hour = ts.hour() as f64 + ts.minute() as f64 / 60.0 + ts.second() as f64 / 3600.0;
    2.0 * std::f64::consts::PI / 365.0 * (ts.ordinal() as f64 - 1.0 + (hour - 12.0) / 24.0)
}

/// Solar position (NOAA general solar position equations, UTC)
pub fn solar_position(latitude_deg: f64, longitude_deg: f64, ts: DateTime<Utc>) -> SolarPosition {
    let g = fractional_year(ts);

    // Equation of time (minutes) and declination (radians)
    let eqtime = 229.18
        * (0.000075 + 0.001868 * g.cos()
            - 0.032077 * g.sin()
            - 0.014615 * (2.0 * g).cos()
            - 0.040849 * (2.0 * g).sin());
    let decl = 0.006918 - 0.399912 * g.cos() + 0.070257 * g.sin()
        - 0.006758 * (2.0 * g).cos()
        + 0.000907 * (2.0 * g).sin()
        - 0.002697 * (3.0 * g).cos()
        + 0.00148 * (3.0 * g).sin();

    let minutes = ts.hour() as f64 * 60.0 + ts.minute() as f64 + ts.second() as f64 / 60.0;
    let true_solar_time = minutes + eqtime + 4.0 * longitude_deg;
    let hour_angle = (true_solar_time / 4.0 - 180.0).to_radians();

    let lat = latitude_deg.to_radians();
    let cos_zenith = (lat.sin() * decl.sin() + lat.cos() * decl.cos() * hour_angle.cos())
        .clamp(-1.0, 1.0);
    let zenith_deg = cos_zenith.acos().to_degrees();

    let azimuth_deg = (hour_angle
        .sin()
        .atan2(hour_angle.cos() * lat.sin() - decl.tan() * lat.cos())
        .to_degrees()
        + 180.0)
        .rem_euclid(360.0);

    SolarPosition {
        zenith_deg,
        elevation_deg: 90.0 - zenith_deg,
        azimuth_deg,
    }
}

/// Clear-sky irradiance for a given sun position
pub fn clear_sky(ts: DateTime<Utc>, position: &SolarPosition) -> ClearSky {
    let cos_z = position.zenith_deg.to_radians().cos();
    if cos_z <= 0.0 {
        return ClearSky::default();
    }

    let ghi = 1098.0 * cos_z * (-0.059 / cos_z).exp();

    // Eccentricity-corrected extraterrestrial normal irradiance
    let doy = ts.ordinal() as f64;
    let extra = SOLAR_CONSTANT * (1.0 + 0.033 * (2.0 * std::f64::consts::PI * doy / 365.0).cos());

    let air_mass = 1.0 / (cos_z + 0.50572 * (96.07995 - position.zenith_deg).powf(-1.6364));
    let mut dni = extra * 0.7_f64.powf(air_mass.powf(0.678));

    // Beam can never exceed the global total
    if dni * cos_z > ghi {
        dni = ghi / cos_z;
    }
    let dhi = (ghi - dni * cos_z).max(0.0);

    ClearSky { ghi, dni, dhi }
}

/// Plane-of-array irradiance from horizontal components (isotropic sky)
pub fn transpose(
    components: &ClearSky,
    position: &SolarPosition,
    tilt_deg: f64,
    orientation_deg: f64,
) -> f64 {
    let tilt = tilt_deg.to_radians();
    let zenith = position.zenith_deg.to_radians();
    let cos_aoi = zenith.cos() * tilt.cos()
        + zenith.sin() * tilt.sin() * (position.azimuth_deg - orientation_deg).to_radians().cos();

    let beam = components.dni * cos_aoi.max(0.0);
    let sky = components.dhi * (1.0 + tilt.cos()) / 2.0;
    let ground = components.ghi * GROUND_ALBEDO * (1.0 - tilt.cos()) / 2.0;
    (beam + sky + ground).max(0.0)
}

/// Clear-sky plane-of-array irradiance (W/m²) for a site at a time
pub fn poa_global(site: &PvSite, ts: DateTime<Utc>) -> f64 {
    let position = solar_position(site.latitude, site.longitude, ts);
    let components = clear_sky(ts, &position);
    transpose(&components, &position, site.tilt, site.orientation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use chrono::TimeZone;

    #[test]
    fn test_sun_is_south_at_noon_in_northern_hemisphere() {
        // ~solar noon at Greenwich around the equinox
        let ts = Utc.with_ymd_and_hms(2024, 3, 20, 12, 7, 0).unwrap();
        let pos = solar_position(51.5, 0.0, ts);
        assert_abs_diff_eq!(pos.azimuth_deg, 180.0, epsilon = 3.0);
        // Zenith close to the latitude at equinox
        assert_abs_diff_eq!(pos.zenith_deg, 51.5, epsilon = 1.5);
    }

    #[test]
    fn test_morning_sun_is_in_the_east() {
        let ts = Utc.with_ymd_and_hms(2024, 6, 21, 7, 0, 0).unwrap();
        let pos = solar_position(51.5, 0.0, ts);
        assert!(pos.elevation_deg > 0.0);
        assert!(pos.azimuth_deg > 45.0 && pos.azimuth_deg < 135.0);
    }

    #[test]
    fn test_night_has_no_irradiance() {
        let site = PvSite::new(51.5, 0.0, 1.0);
        let ts = Utc.with_ymd_and_hms(2024, 1, 10, 1, 0, 0).unwrap();
        assert_eq!(poa_global(&site, ts), 0.0);
    }

    #[test]
    fn test_clear_sky_components_are_consistent() {
        let ts = Utc.with_ymd_and_hms(2024, 6, 21, 12, 0, 0).unwrap();
        let pos = solar_position(45.0, 0.0, ts);
        let cs = clear_sky(ts, &pos);
        let cos_z = pos.zenith_deg.to_radians().cos();
        assert!(cs.ghi > 800.0 && cs.ghi < 1100.0);
        assert!(cs.dhi >= 0.0);
        assert_abs_diff_eq!(cs.dni * cos_z + cs.dhi, cs.ghi, epsilon = 1e-9);
    }

    #[test]
    fn test_flat_panel_sees_ghi() {
        let ts = Utc.with_ymd_and_hms(2024, 6, 21, 11, 0, 0).unwrap();
        let pos = solar_position(51.5, -1.0, ts);
        let cs = clear_sky(ts, &pos);
        assert_abs_diff_eq!(transpose(&cs, &pos, 0.0, 180.0), cs.ghi, epsilon = 1e-9);
    }

    #[test]
    fn test_south_facing_beats_north_facing_in_winter() {
        let ts = Utc.with_ymd_and_hms(2024, 12, 21, 12, 0, 0).unwrap();
        let south = PvSite::new(51.5, 0.0, 1.0).with_panel(35.0, 180.0);
        let north = PvSite::new(51.5, 0.0, 1.0).with_panel(35.0, 0.0);
        assert!(poa_global(&south, ts) > 2.0 * poa_global(&north, ts));
    }
}
