//! House cusps, angles and sidereal time.
//!
//! All angles are in degrees. Cusps are stored in house order, cusp 1 being
//! the Ascendant, and every value is normalised into [0, 360).

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::temporal::julian_centuries;
use crate::{ChartError, House, HouseSystem, JulianDay, Location, Result};

const J2000: JulianDay = 2_451_545.0;

const PLACIDUS_TOLERANCE: f64 = 1e-9;
const PLACIDUS_MAX_ITERATIONS: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HouseCusps {
    pub system: HouseSystem,
    pub cusps: [f64; 12],
    pub ascendant: f64,
    pub midheaven: f64,
    /// Local sidereal time expressed as right ascension of the meridian.
    pub armc: f64,
    pub obliquity: f64,
}

impl HouseCusps {
    pub fn cusp(&self, house: House) -> f64 {
        self.cusps[house.number() as usize - 1]
    }

    /// House containing the ecliptic longitude. A cusp belongs to the house it opens.
    pub fn house_of(&self, longitude: f64) -> House {
        house_of(longitude, &self.cusps)
    }
}

// ---------------------------
// ## Angle helpers
// ---------------------------

/// Maps any finite angle into [0, 360).
pub fn normalize_degrees(degrees: f64) -> f64 {
    let normalized = degrees.rem_euclid(360.0);
    // rem_euclid can return exactly 360.0 for tiny negative inputs
    if normalized >= 360.0 {
        0.0
    } else {
        normalized
    }
}

/// Shortest signed arc from `from` to `to`, in (-180, 180].
pub fn signed_difference(to: f64, from: f64) -> f64 {
    let diff = normalize_degrees(to - from);
    if diff > 180.0 {
        diff - 360.0
    } else {
        diff
    }
}

/// Unsigned shortest arc between two longitudes, in [0, 180].
pub fn angular_separation(a: f64, b: f64) -> f64 {
    signed_difference(a, b).abs()
}

/// Forward arc along the zodiac from `from` to `to`, in [0, 360).
pub fn arc_distance(from: f64, to: f64) -> f64 {
    normalize_degrees(to - from)
}

// ---------------------------
// ## Sidereal time and obliquity
// ---------------------------

/// Greenwich mean sidereal time in degrees (Meeus 12.4).
pub fn greenwich_sidereal_time(jd: JulianDay) -> f64 {
    let t = julian_centuries(jd);
    normalize_degrees(
        280.460_618_37 + 360.985_647_366_29 * (jd - J2000) + 0.000_387_933 * t * t
            - t * t * t / 38_710_000.0,
    )
}

/// Right ascension of the local meridian for an east-positive longitude.
pub fn local_sidereal_time(jd: JulianDay, longitude: f64) -> f64 {
    normalize_degrees(greenwich_sidereal_time(jd) + longitude)
}

/// Mean obliquity of the ecliptic (Meeus 22.2).
pub fn mean_obliquity(jd: JulianDay) -> f64 {
    let t = julian_centuries(jd);
    let seconds = 21.448 - 46.815_0 * t - 0.000_59 * t * t + 0.001_813 * t * t * t;
    23.0 + 26.0 / 60.0 + seconds / 3600.0
}

pub fn midheaven(armc: f64, obliquity: f64) -> f64 {
    let ramc = armc.to_radians();
    normalize_degrees(
        ramc.sin()
            .atan2(ramc.cos() * obliquity.to_radians().cos())
            .to_degrees(),
    )
}

pub fn ascendant(armc: f64, obliquity: f64, latitude: f64) -> f64 {
    let ramc = armc.to_radians();
    let eps = obliquity.to_radians();
    let y = ramc.cos();
    let x = -(ramc.sin() * eps.cos() + latitude.to_radians().tan() * eps.sin());
    normalize_degrees(y.atan2(x).to_degrees())
}

/// Ecliptic longitude of the point with the given right ascension.
fn longitude_from_right_ascension(right_ascension: f64, obliquity: f64) -> f64 {
    let ra = right_ascension.to_radians();
    normalize_degrees(
        ra.sin()
            .atan2(ra.cos() * obliquity.to_radians().cos())
            .to_degrees(),
    )
}

fn declination(longitude: f64, obliquity: f64) -> f64 {
    (obliquity.to_radians().sin() * longitude.to_radians().sin()).asin()
}

// ---------------------------
// ## House systems
// ---------------------------

/// Computes the twelve cusps plus Ascendant and Midheaven.
///
/// Placidus fails with `HouseSystemUndefined` inside the polar circles; the
/// caller decides whether to retry with another system.
pub fn calculate(jd: JulianDay, location: &Location, system: HouseSystem) -> Result<HouseCusps> {
    let location = location.validate()?;
    let armc = local_sidereal_time(jd, location.longitude);
    let obliquity = mean_obliquity(jd);
    let mc = midheaven(armc, obliquity);
    let mut asc = ascendant(armc, obliquity, location.latitude);
    // inside the polar circles the computed point can set instead of rise
    if arc_distance(mc, asc) > 180.0 {
        asc = normalize_degrees(asc + 180.0);
    }

    let cusps = match system {
        HouseSystem::Placidus => placidus(armc, obliquity, location.latitude, asc, mc)?,
        HouseSystem::Porphyry => porphyry(asc, mc),
        HouseSystem::Equal => equal(asc),
        HouseSystem::WholeSign => whole_sign(asc),
    };

    debug!(
        %system,
        code = %system.code(),
        armc,
        ascendant = asc,
        midheaven = mc,
        "house cusps computed"
    );
    Ok(HouseCusps {
        system,
        cusps,
        ascendant: asc,
        midheaven: mc,
        armc,
        obliquity,
    })
}

fn equal(asc: f64) -> [f64; 12] {
    let mut cusps = [0.0; 12];
    for (i, cusp) in cusps.iter_mut().enumerate() {
        *cusp = normalize_degrees(asc + 30.0 * i as f64);
    }
    cusps
}

fn whole_sign(asc: f64) -> [f64; 12] {
    equal((asc / 30.0).floor() * 30.0)
}

fn porphyry(asc: f64, mc: f64) -> [f64; 12] {
    let ic = normalize_degrees(mc + 180.0);
    let eastern = arc_distance(mc, asc);
    let lower = arc_distance(asc, ic);
    opposed([
        mc,
        mc + eastern / 3.0,
        mc + 2.0 * eastern / 3.0,
        asc,
        asc + lower / 3.0,
        asc + 2.0 * lower / 3.0,
    ])
}

#[derive(Clone, Copy)]
enum SemiArc {
    Diurnal,
    Nocturnal,
}

fn placidus(armc: f64, obliquity: f64, latitude: f64, asc: f64, mc: f64) -> Result<[f64; 12]> {
    let undefined = || ChartError::HouseSystemUndefined {
        system: HouseSystem::Placidus,
        latitude,
    };
    if latitude.abs() >= 90.0 - obliquity {
        return Err(undefined());
    }

    let cusp = |fraction: f64, arc: SemiArc, start: f64| {
        placidus_cusp(armc, obliquity, latitude, fraction, arc, start).ok_or_else(undefined)
    };

    Ok(opposed([
        mc,
        cusp(1.0 / 3.0, SemiArc::Diurnal, 30.0)?,
        cusp(2.0 / 3.0, SemiArc::Diurnal, 60.0)?,
        asc,
        cusp(2.0 / 3.0, SemiArc::Nocturnal, 120.0)?,
        cusp(1.0 / 3.0, SemiArc::Nocturnal, 150.0)?,
    ]))
}

/// Iterates the ecliptic point whose hour angle is the given fraction of
/// its semi-arc. Returns `None` when the semi-arc does not exist or the
/// iteration does not settle.
fn placidus_cusp(
    armc: f64,
    obliquity: f64,
    latitude: f64,
    fraction: f64,
    arc: SemiArc,
    start: f64,
) -> Option<f64> {
    let tan_lat = latitude.to_radians().tan();
    let mut longitude = longitude_from_right_ascension(armc + start, obliquity);

    for _ in 0..PLACIDUS_MAX_ITERATIONS {
        let x = -tan_lat * declination(longitude, obliquity).tan();
        if !(-1.0..=1.0).contains(&x) {
            return None;
        }
        let diurnal = x.acos().to_degrees();
        let right_ascension = match arc {
            SemiArc::Diurnal => armc + fraction * diurnal,
            SemiArc::Nocturnal => armc + 180.0 - fraction * (180.0 - diurnal),
        };
        let next = longitude_from_right_ascension(right_ascension, obliquity);
        let step = signed_difference(next, longitude);
        longitude = next;
        if step.abs() < PLACIDUS_TOLERANCE {
            return Some(longitude);
        }
    }
    None
}

/// Expands cusps 10, 11, 12, 1, 2, 3 into all twelve, in house order.
fn opposed(upper: [f64; 6]) -> [f64; 12] {
    let [tenth, eleventh, twelfth, first, second, third] = upper.map(normalize_degrees);
    let eastern = [first, second, third];
    let southern = [tenth, eleventh, twelfth];
    let mut cusps = [0.0; 12];
    for i in 0..3 {
        cusps[i] = eastern[i];
        cusps[i + 3] = normalize_degrees(southern[i] + 180.0);
        cusps[i + 6] = normalize_degrees(eastern[i] + 180.0);
        cusps[i + 9] = southern[i];
    }
    cusps
}

/// House containing `longitude` for a cusp set in house order.
pub fn house_of(longitude: f64, cusps: &[f64; 12]) -> House {
    let longitude = normalize_degrees(longitude);
    (0..12)
        .find(|&i| {
            let span = arc_distance(cusps[i], cusps[(i + 1) % 12]);
            arc_distance(cusps[i], longitude) < span
        })
        .and_then(|i| House::from_index(i + 1))
        .unwrap_or(House::First)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    // 1879-03-14T10:30Z
    const REFERENCE_JD: JulianDay = 2_407_422.937_5;

    fn assert_ordered(cusps: &[f64; 12]) {
        let total: f64 = (0..12)
            .map(|i| arc_distance(cusps[i], cusps[(i + 1) % 12]))
            .sum();
        assert_abs_diff_eq!(total, 360.0, epsilon = 1e-6);
    }

    #[test]
    fn normalization_wraps_into_range() {
        assert_eq!(normalize_degrees(360.0), 0.0);
        assert_eq!(normalize_degrees(-6.5), 353.5);
        assert_eq!(normalize_degrees(725.0), 5.0);
        assert_eq!(normalize_degrees(-1e-18), 0.0);
        assert_eq!(signed_difference(1.0, 359.0), 2.0);
        assert_eq!(signed_difference(359.0, 1.0), -2.0);
        assert_eq!(angular_separation(10.0, 190.0), 180.0);
        assert_eq!(angular_separation(350.0, 20.0), 30.0);
    }

    #[test]
    fn sidereal_time_at_j2000() {
        assert_abs_diff_eq!(greenwich_sidereal_time(J2000), 280.460_618_37, epsilon = 1e-9);
        assert_abs_diff_eq!(mean_obliquity(J2000), 23.439_291, epsilon = 1e-6);
    }

    #[test]
    fn angles_for_reference_case() {
        let cusps = calculate(REFERENCE_JD, &Location::new(48.4, 9.99), HouseSystem::Placidus)
            .unwrap();
        assert_abs_diff_eq!(cusps.armc, 339.156, epsilon = 0.01);
        assert_abs_diff_eq!(cusps.midheaven, 337.46, epsilon = 0.01);
        assert_abs_diff_eq!(cusps.ascendant, 97.43, epsilon = 0.01);
        assert_eq!(cusps.cusp(House::First), cusps.ascendant);
        assert_eq!(cusps.cusp(House::Tenth), cusps.midheaven);
    }

    #[test]
    fn equator_with_aries_midheaven_rises_cancer() {
        assert_abs_diff_eq!(midheaven(90.0, 23.44), 90.0, epsilon = 1e-9);
        assert_abs_diff_eq!(ascendant(90.0, 23.44, 0.0), 180.0, epsilon = 1e-9);
    }

    #[test]
    fn placidus_at_mid_latitude_gives_twelve_distinct_cusps() {
        let cusps = calculate(REFERENCE_JD, &Location::new(45.0, 0.0), HouseSystem::Placidus)
            .unwrap();
        for i in 0..12 {
            assert!((0.0..360.0).contains(&cusps.cusps[i]));
            for j in (i + 1)..12 {
                assert!((cusps.cusps[i] - cusps.cusps[j]).abs() > 1e-6);
            }
        }
        assert_ordered(&cusps.cusps);
        for i in 0..6 {
            assert_abs_diff_eq!(
                arc_distance(cusps.cusps[i], cusps.cusps[i + 6]),
                180.0,
                epsilon = 1e-9
            );
        }
    }

    #[test]
    fn placidus_is_undefined_near_the_pole() {
        for latitude in [89.0, -89.0, 70.0, 90.0] {
            let err = calculate(REFERENCE_JD, &Location::new(latitude, 0.0), HouseSystem::Placidus)
                .unwrap_err();
            assert_eq!(
                err,
                ChartError::HouseSystemUndefined {
                    system: HouseSystem::Placidus,
                    latitude
                }
            );
        }
    }

    #[test]
    fn placidus_works_in_the_southern_hemisphere() {
        let cusps = calculate(REFERENCE_JD, &Location::new(-33.9, 18.4), HouseSystem::Placidus)
            .unwrap();
        assert_ordered(&cusps.cusps);
    }

    #[test]
    fn placidus_at_equator_divides_right_ascension_evenly() {
        let cusps = calculate(J2000, &Location::new(0.0, 0.0), HouseSystem::Placidus).unwrap();
        let eleventh = longitude_from_right_ascension(cusps.armc + 30.0, cusps.obliquity);
        assert_abs_diff_eq!(cusps.cusp(House::Eleventh), eleventh, epsilon = 1e-9);
    }

    #[test]
    fn other_systems_stay_defined_at_high_latitude() {
        let location = Location::new(89.0, 0.0);
        for system in [HouseSystem::Porphyry, HouseSystem::Equal, HouseSystem::WholeSign] {
            let cusps = calculate(REFERENCE_JD, &location, system).unwrap();
            assert_ordered(&cusps.cusps);
        }
    }

    #[test]
    fn ascendant_stays_in_the_eastern_half_above_the_polar_circle() {
        let cusps = calculate(REFERENCE_JD, &Location::new(89.0, 0.0), HouseSystem::Equal).unwrap();
        assert!(arc_distance(cusps.midheaven, cusps.ascendant) <= 180.0);
    }

    #[test]
    fn equal_and_whole_sign_step_thirty_degrees() {
        let equal = calculate(REFERENCE_JD, &Location::new(48.4, 9.99), HouseSystem::Equal)
            .unwrap();
        assert_abs_diff_eq!(equal.cusps[3], normalize_degrees(equal.ascendant + 90.0));

        let whole = calculate(REFERENCE_JD, &Location::new(48.4, 9.99), HouseSystem::WholeSign)
            .unwrap();
        assert_eq!(whole.cusps[0], 90.0);
        assert_eq!(whole.cusps[11], 60.0);
    }

    #[test]
    fn porphyry_trisects_quadrants() {
        let cusps = porphyry(100.0, 10.0);
        assert_abs_diff_eq!(cusps[10], 40.0, epsilon = 1e-9);
        assert_abs_diff_eq!(cusps[11], 70.0, epsilon = 1e-9);
        assert_abs_diff_eq!(cusps[1], 130.0, epsilon = 1e-9);
        assert_abs_diff_eq!(cusps[3], 190.0, epsilon = 1e-9);
    }

    #[test]
    fn house_lookup_handles_wraparound() {
        let cusps = equal(350.0);
        assert_eq!(house_of(355.0, &cusps), House::First);
        assert_eq!(house_of(350.0, &cusps), House::First);
        assert_eq!(house_of(19.9, &cusps), House::First);
        assert_eq!(house_of(20.0, &cusps), House::Second);
        assert_eq!(house_of(345.0, &cusps), House::Twelfth);
    }

    #[test]
    fn invalid_location_is_rejected() {
        let err = calculate(J2000, &Location::new(95.0, 0.0), HouseSystem::Equal).unwrap_err();
        assert!(matches!(err, ChartError::InvalidLocation { .. }));
    }
}
