use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{CelestialBody, ChartError, JulianDay, Result};

/// Version of [`REQUIRED_BODIES`]. Bump when the list changes.
pub const BODY_SET_VERSION: u32 = 1;

/// Bodies every chart must carry, in chart order.
pub const REQUIRED_BODIES: [CelestialBody; 12] = [
    CelestialBody::Sun,
    CelestialBody::Moon,
    CelestialBody::Mercury,
    CelestialBody::Venus,
    CelestialBody::Mars,
    CelestialBody::Jupiter,
    CelestialBody::Saturn,
    CelestialBody::Uranus,
    CelestialBody::Neptune,
    CelestialBody::Pluto,
    CelestialBody::NorthNode,
    CelestialBody::SouthNode,
];

/// Geocentric ecliptic position of a body for the equinox of date.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EclipticPosition {
    /// Degrees, normalised into [0, 360).
    pub longitude: f64,
    pub latitude: f64,
    /// Astronomical units.
    pub distance: f64,
    /// Degrees per day along the ecliptic; negative while retrograde.
    pub daily_motion: f64,
}

impl EclipticPosition {
    pub fn is_finite(&self) -> bool {
        self.longitude.is_finite()
            && self.latitude.is_finite()
            && self.distance.is_finite()
            && self.daily_motion.is_finite()
    }
}

/// Inclusive Julian Day range a provider can answer for.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JulianDayWindow {
    pub start: JulianDay,
    pub end: JulianDay,
}

impl JulianDayWindow {
    pub fn new(start: JulianDay, end: JulianDay) -> Self {
        JulianDayWindow { start, end }
    }

    pub fn contains(&self, jd: JulianDay) -> bool {
        jd.is_finite() && jd >= self.start && jd <= self.end
    }

    pub fn is_empty(&self) -> bool {
        !(self.start.is_finite() && self.end.is_finite() && self.start < self.end)
    }
}

/// Initialization state of a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum Readiness {
    Ready,
    Failed(String),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("provider is not ready: {0}")]
    NotReady(String),

    #[error("body {0} is not supported")]
    UnsupportedBody(CelestialBody),

    #[error("Julian Day {jd} is outside the ephemeris window {start}..={end}")]
    OutOfRange {
        jd: JulianDay,
        start: JulianDay,
        end: JulianDay,
    },

    #[error("numeric failure: {0}")]
    Numeric(String),
}

/// Numeric oracle for body positions.
///
/// Implementations must be deterministic: the same body and Julian Day always
/// produce the same position.
#[cfg_attr(test, mockall::automock)]
pub trait EphemerisProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn readiness(&self) -> Readiness;

    fn valid_window(&self) -> JulianDayWindow;

    fn supports(&self, body: CelestialBody) -> bool;

    fn position_of(
        &self,
        body: CelestialBody,
        julian_day: JulianDay,
    ) -> std::result::Result<EclipticPosition, ProviderError>;
}

/// Startup check: the provider is initialised, has a usable window and
/// answers for every required body.
pub fn validate_provider(provider: &dyn EphemerisProvider) -> Result<()> {
    if let Readiness::Failed(reason) = provider.readiness() {
        warn!(provider = provider.name(), %reason, "ephemeris provider failed to initialize");
        return Err(ChartError::ephemeris(None, format!("provider not ready: {}", reason)));
    }

    let window = provider.valid_window();
    if window.is_empty() {
        return Err(ChartError::ephemeris(
            None,
            format!("empty ephemeris window {}..={}", window.start, window.end),
        ));
    }

    if let Some(missing) = REQUIRED_BODIES.iter().find(|body| !provider.supports(**body)) {
        return Err(ChartError::ephemeris(
            Some(*missing),
            format!("provider {} does not support a required body", provider.name()),
        ));
    }

    debug!(
        provider = provider.name(),
        window_start = window.start,
        window_end = window.end,
        body_set_version = BODY_SET_VERSION,
        "ephemeris provider validated"
    );
    Ok(())
}

/// Fetches one body, converting every provider failure into `EphemerisUnavailable`.
pub fn fetch_position(
    provider: &dyn EphemerisProvider,
    body: CelestialBody,
    julian_day: JulianDay,
) -> Result<EclipticPosition> {
    let position = provider
        .position_of(body, julian_day)
        .map_err(|err| ChartError::ephemeris(Some(body), err.to_string()))?;

    if !position.is_finite() {
        return Err(ChartError::ephemeris(
            Some(body),
            format!("provider {} returned a non-finite position", provider.name()),
        ));
    }

    Ok(EclipticPosition {
        longitude: crate::houses::normalize_degrees(position.longitude),
        ..position
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_provider() -> MockEphemerisProvider {
        let mut provider = MockEphemerisProvider::new();
        provider.expect_name().return_const("mock");
        provider.expect_readiness().returning(|| Readiness::Ready);
        provider
            .expect_valid_window()
            .returning(|| JulianDayWindow::new(2_305_447.5, 2_634_166.5));
        provider
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let window = JulianDayWindow::new(10.0, 20.0);
        assert!(window.contains(10.0));
        assert!(window.contains(20.0));
        assert!(!window.contains(20.000_001));
        assert!(!window.contains(f64::NAN));
        assert!(JulianDayWindow::new(5.0, 5.0).is_empty());
        assert!(!window.is_empty());
    }

    #[test]
    fn provider_supporting_all_bodies_validates() {
        let mut provider = ready_provider();
        provider.expect_supports().returning(|_| true);
        assert!(validate_provider(&provider).is_ok());
    }

    #[test]
    fn provider_missing_a_body_fails_validation() {
        let mut provider = ready_provider();
        provider
            .expect_supports()
            .returning(|body| body != CelestialBody::Pluto);
        let err = validate_provider(&provider).unwrap_err();
        assert!(matches!(
            err,
            ChartError::EphemerisUnavailable {
                body: Some(CelestialBody::Pluto),
                ..
            }
        ));
    }

    #[test]
    fn failed_provider_is_rejected_at_startup() {
        let mut provider = MockEphemerisProvider::new();
        provider.expect_name().return_const("mock");
        provider
            .expect_readiness()
            .returning(|| Readiness::Failed("elements file unreadable".into()));
        let err = validate_provider(&provider).unwrap_err();
        assert!(err.to_string().contains("elements file unreadable"));
    }

    #[test]
    fn fetch_normalizes_longitude_and_rejects_nan() {
        let mut provider = ready_provider();
        provider
            .expect_position_of()
            .returning(|body, _| match body {
                CelestialBody::Sun => Ok(EclipticPosition {
                    longitude: -6.5,
                    latitude: 0.0,
                    distance: 0.99,
                    daily_motion: 1.0,
                }),
                _ => Ok(EclipticPosition {
                    longitude: f64::NAN,
                    latitude: 0.0,
                    distance: 1.0,
                    daily_motion: 0.1,
                }),
            });

        let sun = fetch_position(&provider, CelestialBody::Sun, 2_451_545.0).unwrap();
        assert_eq!(sun.longitude, 353.5);

        let err = fetch_position(&provider, CelestialBody::Mars, 2_451_545.0).unwrap_err();
        assert!(matches!(
            err,
            ChartError::EphemerisUnavailable {
                body: Some(CelestialBody::Mars),
                ..
            }
        ));
    }

    #[test]
    fn provider_errors_become_ephemeris_unavailable() {
        let mut provider = ready_provider();
        provider
            .expect_position_of()
            .returning(|body, _| Err(ProviderError::UnsupportedBody(body)));
        let err = fetch_position(&provider, CelestialBody::Moon, 2_451_545.0).unwrap_err();
        assert_eq!(
            err,
            ChartError::ephemeris(Some(CelestialBody::Moon), "body Moon is not supported")
        );
    }
}
