//! Pure-Rust ephemeris built on mean orbital elements.
//!
//! Positions come from Keplerian elements with secular rates (epoch
//! 1999-12-31T00:00Z), the largest lunar, Jovian, Saturnian and Uranian
//! perturbation terms, a periodic series for Pluto and the mean lunar node.
//! The element set and perturbation terms follow Paul Schlyter's "Computing
//! planetary positions", the node follows Meeus. The Pluto series is only
//! fitted from the late 19th century to 2099 and the outer planets drift
//! away from the JPL approximate elements outside 1850-2100, so that is the
//! default window. Within it positions agree with observed transits,
//! eclipses and conjunctions to a few tenths of a degree; it is not a
//! replacement for a numerically integrated ephemeris.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::ephemeris::{
    EclipticPosition, EphemerisProvider, JulianDayWindow, ProviderError, Readiness,
};
use crate::houses::{normalize_degrees, signed_difference};
use crate::temporal::julian_centuries;
use crate::{CelestialBody, JulianDay};

/// Julian Day at which the element day count is zero.
const ELEMENT_EPOCH: JulianDay = 2_451_543.5;

/// Mean equatorial Earth radius in astronomical units.
const EARTH_RADIUS_AU: f64 = 4.263_52e-5;

/// Mean Earth-Moon distance, used for the lunar nodes.
const MEAN_LUNAR_DISTANCE_AU: f64 = 0.002_569_555;

/// Half-width of the central difference used for daily motion, in days.
const MOTION_HALF_STEP: f64 = 0.5;

const KEPLER_TOLERANCE: f64 = 1e-12;
const KEPLER_MAX_ITERATIONS: usize = 50;

/// Julian Day of 1850-01-01T00:00Z.
pub const DEFAULT_WINDOW_START: JulianDay = 2_396_758.5;
/// Julian Day of 2100-01-01T00:00Z.
pub const DEFAULT_WINDOW_END: JulianDay = 2_488_069.5;

/// An element value at the epoch and its rate per day.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Secular(pub f64, pub f64);

impl Secular {
    fn at(&self, d: f64) -> f64 {
        self.0 + self.1 * d
    }
}

/// Keplerian elements of one orbit, angles in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrbitalElements {
    pub ascending_node: Secular,
    pub inclination: Secular,
    pub perihelion: Secular,
    /// AU for planets, Earth radii for the Moon.
    pub semi_major_axis: Secular,
    pub eccentricity: Secular,
    pub mean_anomaly: Secular,
}

#[derive(Debug, Clone, Copy)]
struct Orbit {
    node: f64,
    inclination: f64,
    perihelion: f64,
    semi_major_axis: f64,
    eccentricity: f64,
    mean_anomaly: f64,
}

impl OrbitalElements {
    const fn new(n: Secular, i: Secular, w: Secular, a: Secular, e: Secular, m: Secular) -> Self {
        OrbitalElements {
            ascending_node: n,
            inclination: i,
            perihelion: w,
            semi_major_axis: a,
            eccentricity: e,
            mean_anomaly: m,
        }
    }

    fn at(&self, d: f64) -> Orbit {
        Orbit {
            node: self.ascending_node.at(d),
            inclination: self.inclination.at(d),
            perihelion: self.perihelion.at(d),
            semi_major_axis: self.semi_major_axis.at(d),
            eccentricity: self.eccentricity.at(d),
            mean_anomaly: normalize_degrees(self.mean_anomaly.at(d)),
        }
    }
}

/// Element set for every body the provider computes from orbits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementTable {
    pub sun: OrbitalElements,
    pub moon: OrbitalElements,
    pub mercury: OrbitalElements,
    pub venus: OrbitalElements,
    pub mars: OrbitalElements,
    pub jupiter: OrbitalElements,
    pub saturn: OrbitalElements,
    pub uranus: OrbitalElements,
    pub neptune: OrbitalElements,
}

impl Default for ElementTable {
    fn default() -> Self {
        ElementTable {
            sun: OrbitalElements::new(
                Secular(0.0, 0.0),
                Secular(0.0, 0.0),
                Secular(282.9404, 4.709_35e-5),
                Secular(1.0, 0.0),
                Secular(0.016_709, -1.151e-9),
                Secular(356.0470, 0.985_600_258_5),
            ),
            moon: OrbitalElements::new(
                Secular(125.1228, -0.052_953_808_3),
                Secular(5.1454, 0.0),
                Secular(318.0634, 0.164_357_322_3),
                Secular(60.2666, 0.0),
                Secular(0.054_900, 0.0),
                Secular(115.3654, 13.064_992_950_9),
            ),
            mercury: OrbitalElements::new(
                Secular(48.3313, 3.245_87e-5),
                Secular(7.0047, 5.00e-8),
                Secular(29.1241, 1.014_44e-5),
                Secular(0.387_098, 0.0),
                Secular(0.205_635, 5.59e-10),
                Secular(168.6562, 4.092_334_436_8),
            ),
            venus: OrbitalElements::new(
                Secular(76.6799, 2.465_90e-5),
                Secular(3.3946, 2.75e-8),
                Secular(54.8910, 1.383_74e-5),
                Secular(0.723_330, 0.0),
                Secular(0.006_773, -1.302e-9),
                Secular(48.0052, 1.602_130_224_4),
            ),
            mars: OrbitalElements::new(
                Secular(49.5574, 2.110_81e-5),
                Secular(1.8497, -1.78e-8),
                Secular(286.5016, 2.929_61e-5),
                Secular(1.523_688, 0.0),
                Secular(0.093_405, 2.516e-9),
                Secular(18.6021, 0.524_020_776_6),
            ),
            jupiter: OrbitalElements::new(
                Secular(100.4542, 2.768_54e-5),
                Secular(1.3030, -1.557e-7),
                Secular(273.8777, 1.645_05e-5),
                Secular(5.202_56, 0.0),
                Secular(0.048_498, 4.469e-9),
                Secular(19.8950, 0.083_085_300_1),
            ),
            saturn: OrbitalElements::new(
                Secular(113.6634, 2.389_80e-5),
                Secular(2.4886, -1.081e-7),
                Secular(339.3939, 2.976_61e-5),
                Secular(9.554_75, 0.0),
                Secular(0.055_546, -9.499e-9),
                Secular(316.9670, 0.033_444_228_2),
            ),
            uranus: OrbitalElements::new(
                Secular(74.0005, 1.3978e-5),
                Secular(0.7733, 1.9e-8),
                Secular(96.6612, 3.0565e-5),
                Secular(19.181_71, -1.55e-8),
                Secular(0.047_318, 7.45e-9),
                Secular(142.5905, 0.011_725_806),
            ),
            neptune: OrbitalElements::new(
                Secular(131.7806, 3.0173e-5),
                Secular(1.7700, -2.55e-7),
                Secular(272.8461, -6.027e-6),
                Secular(30.058_26, 3.313e-8),
                Secular(0.008_606, 2.15e-9),
                Secular(260.2471, 0.005_995_147),
            ),
        }
    }
}

/// Construction-time configuration. No process-wide state is involved.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    /// JSON file with an [`ElementTable`]; the built-in table is used when absent.
    pub elements_path: Option<PathBuf>,
    pub window: JulianDayWindow,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig {
            elements_path: None,
            window: JulianDayWindow::new(DEFAULT_WINDOW_START, DEFAULT_WINDOW_END),
        }
    }
}

pub struct AnalyticEphemeris {
    elements: ElementTable,
    window: JulianDayWindow,
    readiness: Readiness,
}

impl AnalyticEphemeris {
    /// Loads the element table once. A load failure leaves the provider in
    /// [`Readiness::Failed`]; every position request then fails.
    pub fn new(config: ProviderConfig) -> Self {
        let (elements, readiness) = match &config.elements_path {
            None => (ElementTable::default(), Readiness::Ready),
            Some(path) => match load_elements(path) {
                Ok(table) => {
                    info!(path = %path.display(), "loaded orbital element table");
                    (table, Readiness::Ready)
                }
                Err(reason) => {
                    warn!(path = %path.display(), %reason, "orbital element table unavailable");
                    (ElementTable::default(), Readiness::Failed(reason))
                }
            },
        };

        AnalyticEphemeris {
            elements,
            window: config.window,
            readiness,
        }
    }

    pub fn with_window(window: JulianDayWindow) -> Self {
        AnalyticEphemeris::new(ProviderConfig {
            elements_path: None,
            window,
        })
    }

    fn position_at(&self, body: CelestialBody, d: f64) -> Vector {
        match body {
            CelestialBody::Sun => self.sun(d).geocentric(),
            CelestialBody::Moon => self.moon(d),
            CelestialBody::Pluto => self.pluto(d).to_geocentric(&self.sun(d)),
            CelestialBody::NorthNode => mean_node(d),
            CelestialBody::SouthNode => {
                let node = Spherical::from(mean_node(d));
                Spherical::new(node.longitude + 180.0, 0.0, node.distance).into()
            }
            planet => self.planet(planet, d).to_geocentric(&self.sun(d)),
        }
    }

    fn sun(&self, d: f64) -> SunPosition {
        let orbit = self.elements.sun.at(d);
        let (v, r) = true_anomaly_and_radius(&orbit);
        SunPosition {
            longitude: normalize_degrees(v + orbit.perihelion),
            distance: r,
        }
    }

    fn moon(&self, d: f64) -> Vector {
        let orbit = self.elements.moon.at(d);
        let base = Spherical::from(heliocentric(&orbit));

        let ms = self.elements.sun.at(d).mean_anomaly;
        let mm = orbit.mean_anomaly;
        let ls = ms + self.elements.sun.perihelion.at(d);
        let lm = mm + orbit.perihelion + orbit.node;
        let elongation = lm - ls;
        let f = lm - orbit.node;

        let longitude = base.longitude - 1.274 * sin_deg(mm - 2.0 * elongation)
            + 0.658 * sin_deg(2.0 * elongation)
            - 0.186 * sin_deg(ms)
            - 0.059 * sin_deg(2.0 * mm - 2.0 * elongation)
            - 0.057 * sin_deg(mm - 2.0 * elongation + ms)
            + 0.053 * sin_deg(mm + 2.0 * elongation)
            + 0.046 * sin_deg(2.0 * elongation - ms)
            + 0.041 * sin_deg(mm - ms)
            - 0.035 * sin_deg(elongation)
            - 0.031 * sin_deg(mm + ms)
            - 0.015 * sin_deg(2.0 * f - 2.0 * elongation)
            + 0.011 * sin_deg(mm - 4.0 * elongation);
        let latitude = base.latitude
            - 0.173 * sin_deg(f - 2.0 * elongation)
            - 0.055 * sin_deg(mm - f - 2.0 * elongation)
            - 0.046 * sin_deg(mm + f - 2.0 * elongation)
            + 0.033 * sin_deg(f + 2.0 * elongation)
            + 0.017 * sin_deg(2.0 * mm + f);
        let radius = base.distance
            - 0.58 * cos_deg(mm - 2.0 * elongation)
            - 0.46 * cos_deg(2.0 * elongation);

        Spherical::new(longitude, latitude, radius * EARTH_RADIUS_AU).into()
    }

    fn planet(&self, body: CelestialBody, d: f64) -> Spherical {
        let elements = match body {
            CelestialBody::Mercury => &self.elements.mercury,
            CelestialBody::Venus => &self.elements.venus,
            CelestialBody::Mars => &self.elements.mars,
            CelestialBody::Jupiter => &self.elements.jupiter,
            CelestialBody::Saturn => &self.elements.saturn,
            CelestialBody::Uranus => &self.elements.uranus,
            _ => &self.elements.neptune,
        };
        let mut position = Spherical::from(heliocentric(&elements.at(d)));

        let mj = self.elements.jupiter.at(d).mean_anomaly;
        let msat = self.elements.saturn.at(d).mean_anomaly;
        let mu = self.elements.uranus.at(d).mean_anomaly;
        match body {
            CelestialBody::Jupiter => {
                position.longitude += -0.332 * sin_deg(2.0 * mj - 5.0 * msat - 67.6)
                    - 0.056 * sin_deg(2.0 * mj - 2.0 * msat + 21.0)
                    + 0.042 * sin_deg(3.0 * mj - 5.0 * msat + 21.0)
                    - 0.036 * sin_deg(mj - 2.0 * msat)
                    + 0.022 * cos_deg(mj - msat)
                    + 0.023 * sin_deg(2.0 * mj - 3.0 * msat + 52.0)
                    - 0.016 * sin_deg(mj - 5.0 * msat - 69.0);
            }
            CelestialBody::Saturn => {
                position.longitude += 0.812 * sin_deg(2.0 * mj - 5.0 * msat - 67.6)
                    - 0.229 * cos_deg(2.0 * mj - 4.0 * msat - 2.0)
                    + 0.119 * sin_deg(mj - 2.0 * msat - 3.0)
                    + 0.046 * sin_deg(2.0 * mj - 6.0 * msat - 69.0)
                    + 0.014 * sin_deg(mj - 3.0 * msat + 32.0);
                position.latitude += -0.020 * cos_deg(2.0 * mj - 4.0 * msat - 2.0)
                    + 0.018 * sin_deg(2.0 * mj - 6.0 * msat - 49.0);
            }
            CelestialBody::Uranus => {
                position.longitude += 0.040 * sin_deg(msat - 2.0 * mu + 6.0)
                    + 0.035 * sin_deg(msat - 3.0 * mu + 33.0)
                    - 0.015 * sin_deg(mj - mu + 20.0);
            }
            _ => {}
        }
        position
    }

    fn pluto(&self, d: f64) -> Spherical {
        let s = 50.03 + 0.033_459_652 * d;
        let p = 238.95 + 0.003_968_789 * d;

        let longitude = 238.9508 + 0.004_007_03 * d - 19.799 * sin_deg(p)
            + 19.848 * cos_deg(p)
            + 0.897 * sin_deg(2.0 * p)
            - 4.956 * cos_deg(2.0 * p)
            + 0.610 * sin_deg(3.0 * p)
            + 1.211 * cos_deg(3.0 * p)
            - 0.341 * sin_deg(4.0 * p)
            - 0.190 * cos_deg(4.0 * p)
            + 0.128 * sin_deg(5.0 * p)
            - 0.034 * cos_deg(5.0 * p)
            - 0.038 * sin_deg(6.0 * p)
            + 0.031 * cos_deg(6.0 * p)
            + 0.020 * sin_deg(s - p)
            - 0.010 * cos_deg(s - p);
        let latitude = -3.9082 - 5.453 * sin_deg(p) - 14.975 * cos_deg(p)
            + 3.527 * sin_deg(2.0 * p)
            + 1.673 * cos_deg(2.0 * p)
            - 1.051 * sin_deg(3.0 * p)
            + 0.328 * cos_deg(3.0 * p)
            + 0.179 * sin_deg(4.0 * p)
            - 0.292 * cos_deg(4.0 * p)
            + 0.019 * sin_deg(5.0 * p)
            + 0.100 * cos_deg(5.0 * p)
            - 0.031 * sin_deg(6.0 * p)
            - 0.026 * cos_deg(6.0 * p)
            + 0.011 * cos_deg(s - p);
        let radius = 40.72 + 6.68 * sin_deg(p) + 6.90 * cos_deg(p) - 1.18 * sin_deg(2.0 * p)
            - 0.03 * cos_deg(2.0 * p)
            + 0.15 * sin_deg(3.0 * p)
            - 0.14 * cos_deg(3.0 * p);

        Spherical::new(longitude, latitude, radius)
    }
}

impl EphemerisProvider for AnalyticEphemeris {
    fn name(&self) -> &'static str {
        "analytic-elements"
    }

    fn readiness(&self) -> Readiness {
        self.readiness.clone()
    }

    fn valid_window(&self) -> JulianDayWindow {
        self.window
    }

    fn supports(&self, _body: CelestialBody) -> bool {
        true
    }

    fn position_of(
        &self,
        body: CelestialBody,
        julian_day: JulianDay,
    ) -> Result<EclipticPosition, ProviderError> {
        if let Readiness::Failed(reason) = &self.readiness {
            return Err(ProviderError::NotReady(reason.clone()));
        }
        if !self.window.contains(julian_day) {
            return Err(ProviderError::OutOfRange {
                jd: julian_day,
                start: self.window.start,
                end: self.window.end,
            });
        }

        let d = julian_day - ELEMENT_EPOCH;
        let now = Spherical::from(self.position_at(body, d));
        let before = Spherical::from(self.position_at(body, d - MOTION_HALF_STEP));
        let after = Spherical::from(self.position_at(body, d + MOTION_HALF_STEP));
        let daily_motion =
            signed_difference(after.longitude, before.longitude) / (2.0 * MOTION_HALF_STEP);

        let position = EclipticPosition {
            longitude: normalize_degrees(now.longitude),
            latitude: now.latitude,
            distance: now.distance,
            daily_motion,
        };
        if position.is_finite() {
            Ok(position)
        } else {
            Err(ProviderError::Numeric(format!(
                "non-finite position for {} at JD {}",
                body, julian_day
            )))
        }
    }
}

fn load_elements(path: &Path) -> Result<ElementTable, String> {
    let raw = fs::read_to_string(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    serde_json::from_str(&raw).map_err(|e| format!("{}: {}", path.display(), e))
}

// ---------------------------
// ## Orbit geometry
// ---------------------------

#[derive(Debug, Clone, Copy)]
struct Vector {
    x: f64,
    y: f64,
    z: f64,
}

#[derive(Debug, Clone, Copy)]
struct Spherical {
    longitude: f64,
    latitude: f64,
    distance: f64,
}

struct SunPosition {
    longitude: f64,
    distance: f64,
}

impl Spherical {
    fn new(longitude: f64, latitude: f64, distance: f64) -> Self {
        Spherical {
            longitude,
            latitude,
            distance,
        }
    }

    /// Shifts a heliocentric position to the geocentric frame.
    fn to_geocentric(self, sun: &SunPosition) -> Vector {
        let helio = Vector::from(self);
        let earth_to_sun = sun.geocentric();
        Vector {
            x: helio.x + earth_to_sun.x,
            y: helio.y + earth_to_sun.y,
            z: helio.z + earth_to_sun.z,
        }
    }
}

impl SunPosition {
    fn geocentric(&self) -> Vector {
        Spherical::new(self.longitude, 0.0, self.distance).into()
    }
}

impl From<Spherical> for Vector {
    fn from(s: Spherical) -> Self {
        let (lon, lat) = (s.longitude.to_radians(), s.latitude.to_radians());
        Vector {
            x: s.distance * lat.cos() * lon.cos(),
            y: s.distance * lat.cos() * lon.sin(),
            z: s.distance * lat.sin(),
        }
    }
}

impl From<Vector> for Spherical {
    fn from(v: Vector) -> Self {
        let horizontal = v.x.hypot(v.y);
        Spherical {
            longitude: normalize_degrees(v.y.atan2(v.x).to_degrees()),
            latitude: v.z.atan2(horizontal).to_degrees(),
            distance: horizontal.hypot(v.z),
        }
    }
}

fn eccentric_anomaly(mean_anomaly: f64, eccentricity: f64) -> f64 {
    let m = mean_anomaly;
    let e = eccentricity;
    let mut anomaly = m + e * m.sin() * (1.0 + e * m.cos());
    for _ in 0..KEPLER_MAX_ITERATIONS {
        let delta = (anomaly - e * anomaly.sin() - m) / (1.0 - e * anomaly.cos());
        anomaly -= delta;
        if delta.abs() < KEPLER_TOLERANCE {
            break;
        }
    }
    anomaly
}

/// True anomaly in degrees and radius vector in orbit units.
fn true_anomaly_and_radius(orbit: &Orbit) -> (f64, f64) {
    let e = orbit.eccentricity;
    let anomaly = eccentric_anomaly(orbit.mean_anomaly.to_radians(), e);
    let xv = orbit.semi_major_axis * (anomaly.cos() - e);
    let yv = orbit.semi_major_axis * (1.0 - e * e).sqrt() * anomaly.sin();
    (yv.atan2(xv).to_degrees(), xv.hypot(yv))
}

/// Position relative to the orbit's focus in the ecliptic frame of date.
fn heliocentric(orbit: &Orbit) -> Vector {
    let (v, r) = true_anomaly_and_radius(orbit);
    let node = orbit.node.to_radians();
    let argument = (v + orbit.perihelion).to_radians();
    let inclination = orbit.inclination.to_radians();
    Vector {
        x: r * (node.cos() * argument.cos() - node.sin() * argument.sin() * inclination.cos()),
        y: r * (node.sin() * argument.cos() + node.cos() * argument.sin() * inclination.cos()),
        z: r * argument.sin() * inclination.sin(),
    }
}

/// Mean ascending node of the lunar orbit (Meeus 47.7).
fn mean_node(d: f64) -> Vector {
    let t = julian_centuries(d + ELEMENT_EPOCH);
    let longitude = 125.044_547_9 - 1_934.136_289_1 * t + 0.002_075_4 * t * t
        + t * t * t / 467_441.0
        - t * t * t * t / 60_616_000.0;
    Spherical::new(longitude, 0.0, MEAN_LUNAR_DISTANCE_AU).into()
}

fn sin_deg(degrees: f64) -> f64 {
    (degrees * PI / 180.0).sin()
}

fn cos_deg(degrees: f64) -> f64 {
    (degrees * PI / 180.0).cos()
}
