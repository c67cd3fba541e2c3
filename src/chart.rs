use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::ephemeris::{
    fetch_position, validate_provider, EclipticPosition, EphemerisProvider, BODY_SET_VERSION,
    REQUIRED_BODIES,
};
use crate::houses::{self, HouseCusps};
use crate::temporal::{self, BirthMoment};
use crate::{
    CelestialBody, ChartError, House, HouseSystem, JulianDay, Location, Result, ZodiacSign,
};

/// Tolerance when re-deriving a stored chart's Julian Day from its instant.
const JULIAN_DAY_TOLERANCE: f64 = 1e-6;

/// Tolerance when re-deriving a stored degree within its sign.
const DEGREE_TOLERANCE: f64 = 1e-9;

fn degree_in_sign(longitude: f64) -> f64 {
    longitude.rem_euclid(30.0)
}

/// Whole arc minutes past the whole degree, truncated like a printed ephemeris.
fn arc_minutes(degree_in_sign: f64) -> u8 {
    ((degree_in_sign.fract() * 60.0).floor() as u8).min(59)
}

fn sign_fields_consistent(longitude: f64, sign: ZodiacSign, degree: f64, minutes: u8) -> bool {
    longitude.is_finite()
        && degree.is_finite()
        && (0.0..360.0).contains(&longitude)
        && (0.0..30.0).contains(&degree)
        && (degree - degree_in_sign(longitude)).abs() <= DEGREE_TOLERANCE
        && sign == ZodiacSign::from_longitude(longitude)
        && minutes == arc_minutes(degree)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChartRequest {
    pub owner_id: String,
    pub birth: BirthMoment,
    pub location: Location,
    pub house_system: HouseSystem,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BodyPosition {
    pub body: CelestialBody,
    pub longitude: f64,
    pub latitude: f64,
    pub distance: f64,
    pub daily_motion: f64,
    pub is_retrograde: bool,
    pub sign: ZodiacSign,
    pub degree_in_sign: f64,
    pub minutes: u8,
    pub house: House,
}

impl BodyPosition {
    fn place(body: CelestialBody, position: EclipticPosition, houses: &HouseCusps) -> Self {
        let longitude = position.longitude;
        let degree = degree_in_sign(longitude);
        BodyPosition {
            body,
            longitude,
            latitude: position.latitude,
            distance: position.distance,
            daily_motion: position.daily_motion,
            is_retrograde: position.daily_motion < 0.0,
            sign: ZodiacSign::from_longitude(longitude),
            degree_in_sign: degree,
            minutes: arc_minutes(degree),
            house: houses.house_of(longitude),
        }
    }

    fn is_consistent(&self, houses: &HouseCusps) -> bool {
        [self.latitude, self.distance, self.daily_motion]
            .iter()
            .all(|v| v.is_finite())
            && sign_fields_consistent(self.longitude, self.sign, self.degree_in_sign, self.minutes)
            && self.is_retrograde == (self.daily_motion < 0.0)
            && self.house == houses.house_of(self.longitude)
    }
}

/// Sign, degree and arc minute of an ecliptic longitude.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    pub longitude: f64,
    pub sign: ZodiacSign,
    pub degree_in_sign: f64,
    pub minutes: u8,
}

impl Placement {
    pub fn of(longitude: f64) -> Self {
        let degree = degree_in_sign(longitude);
        Placement {
            longitude,
            sign: ZodiacSign::from_longitude(longitude),
            degree_in_sign: degree,
            minutes: arc_minutes(degree),
        }
    }

    fn matches(&self, longitude: f64) -> bool {
        self.longitude == longitude
            && sign_fields_consistent(self.longitude, self.sign, self.degree_in_sign, self.minutes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HousePlacement {
    pub house: House,
    pub cusp: Placement,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Angles {
    pub ascendant: Placement,
    pub midheaven: Placement,
}

fn house_placements(houses: &HouseCusps) -> Vec<HousePlacement> {
    House::all()
        .map(|house| HousePlacement {
            house,
            cusp: Placement::of(houses.cusp(house)),
        })
        .collect()
}

fn angles(houses: &HouseCusps) -> Angles {
    Angles {
        ascendant: Placement::of(houses.ascendant),
        midheaven: Placement::of(houses.midheaven),
    }
}

/// Computed natal chart. Only [`ChartEngine::compute`] and validated
/// deserialisation construct one, so every instance is internally consistent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "ChartRecord")]
pub struct NatalChart {
    owner_id: String,
    birth_input: BirthMoment,
    birth_instant_utc: DateTime<Utc>,
    birth_location: Location,
    julian_day: JulianDay,
    time_estimated: bool,
    house_system: HouseSystem,
    bodies: Vec<BodyPosition>,
    houses: HouseCusps,
    house_placements: Vec<HousePlacement>,
    angles: Angles,
    provider: String,
    body_set_version: u32,
    computed_at: DateTime<Utc>,
}

impl NatalChart {
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Local birth data as submitted; `time` is `None` when noon was assumed.
    pub fn birth_input(&self) -> &BirthMoment {
        &self.birth_input
    }

    pub fn birth_instant_utc(&self) -> DateTime<Utc> {
        self.birth_instant_utc
    }

    pub fn birth_location(&self) -> Location {
        self.birth_location
    }

    pub fn julian_day(&self) -> JulianDay {
        self.julian_day
    }

    /// True when no birth time was supplied and local noon was assumed.
    pub fn time_estimated(&self) -> bool {
        self.time_estimated
    }

    pub fn house_system(&self) -> HouseSystem {
        self.house_system
    }

    /// Positions in [`REQUIRED_BODIES`] order.
    pub fn bodies(&self) -> &[BodyPosition] {
        &self.bodies
    }

    pub fn body(&self, body: CelestialBody) -> Option<&BodyPosition> {
        self.bodies.iter().find(|p| p.body == body)
    }

    pub fn houses(&self) -> &HouseCusps {
        &self.houses
    }

    /// One entry per house, first to twelfth.
    pub fn house_placements(&self) -> &[HousePlacement] {
        &self.house_placements
    }

    pub fn angles(&self) -> &Angles {
        &self.angles
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn body_set_version(&self) -> u32 {
        self.body_set_version
    }

    pub fn computed_at(&self) -> DateTime<Utc> {
        self.computed_at
    }
}

/// Wire form of [`NatalChart`]; checked before it becomes a chart.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartRecord {
    owner_id: String,
    birth_input: BirthMoment,
    birth_instant_utc: DateTime<Utc>,
    birth_location: Location,
    julian_day: JulianDay,
    time_estimated: bool,
    house_system: HouseSystem,
    bodies: Vec<BodyPosition>,
    houses: HouseCusps,
    house_placements: Vec<HousePlacement>,
    angles: Angles,
    provider: String,
    body_set_version: u32,
    computed_at: DateTime<Utc>,
}

impl TryFrom<ChartRecord> for NatalChart {
    type Error = ChartError;

    fn try_from(record: ChartRecord) -> Result<Self> {
        let corrupt = |what: &str| {
            ChartError::StoreFailure(format!(
                "corrupt chart record for owner '{}': {}",
                record.owner_id, what
            ))
        };

        if record.owner_id.is_empty() {
            return Err(ChartError::MissingOwner);
        }
        record.birth_location.validate()?;

        let instant = temporal::resolve(&record.birth_input)
            .map_err(|_| corrupt("birth input no longer resolves"))?;
        let instant_matches = instant.utc == record.birth_instant_utc
            && instant.time_estimated == record.time_estimated;
        if !instant_matches {
            return Err(corrupt("birth instant does not match birth input"));
        }

        let expected = temporal::date_to_julian_day(record.birth_instant_utc);
        if (expected - record.julian_day).abs() > JULIAN_DAY_TOLERANCE {
            return Err(corrupt("julian day does not match birth instant"));
        }
        if record.body_set_version != BODY_SET_VERSION {
            return Err(corrupt("unknown body set version"));
        }
        let listed: Vec<CelestialBody> = record.bodies.iter().map(|p| p.body).collect();
        if listed != REQUIRED_BODIES {
            return Err(corrupt("body list differs from the required bodies"));
        }
        let angles_ok = record
            .houses
            .cusps
            .iter()
            .chain([record.houses.ascendant, record.houses.midheaven].iter())
            .all(|v| v.is_finite() && (0.0..360.0).contains(v));
        if !angles_ok || record.houses.system != record.house_system {
            return Err(corrupt("house cusps out of range"));
        }
        if !record.bodies.iter().all(|p| p.is_consistent(&record.houses)) {
            return Err(corrupt("body position out of range"));
        }
        let placements_ok = record.house_placements.len() == 12
            && record
                .house_placements
                .iter()
                .zip(House::all())
                .all(|(p, house)| p.house == house && p.cusp.matches(record.houses.cusp(house)));
        if !placements_ok {
            return Err(corrupt("house placements differ from the cusps"));
        }
        if !record.angles.ascendant.matches(record.houses.ascendant)
            || !record.angles.midheaven.matches(record.houses.midheaven)
        {
            return Err(corrupt("angles differ from the cusps"));
        }

        Ok(NatalChart {
            owner_id: record.owner_id,
            birth_input: record.birth_input,
            birth_instant_utc: record.birth_instant_utc,
            birth_location: record.birth_location,
            julian_day: record.julian_day,
            time_estimated: record.time_estimated,
            house_system: record.house_system,
            bodies: record.bodies,
            houses: record.houses,
            house_placements: record.house_placements,
            angles: record.angles,
            provider: record.provider,
            body_set_version: record.body_set_version,
            computed_at: record.computed_at,
        })
    }
}

// ---------------------------
// ## Chart assembly
// ---------------------------

/// Runs the resolve, positions and houses stages for a request. Holds no
/// mutable state; share it freely across threads.
#[derive(Clone)]
pub struct ChartEngine {
    provider: Arc<dyn EphemerisProvider>,
}

impl ChartEngine {
    /// Validates the provider once; a provider that cannot serve every
    /// required body is refused here rather than on the first request.
    pub fn new(provider: Arc<dyn EphemerisProvider>) -> Result<Self> {
        validate_provider(provider.as_ref())?;
        info!(provider = provider.name(), "chart engine ready");
        Ok(ChartEngine { provider })
    }

    pub fn provider(&self) -> &dyn EphemerisProvider {
        self.provider.as_ref()
    }

    /// Computes a chart. The first failing stage's error is returned as is
    /// and no partial chart is produced.
    #[instrument(skip_all, fields(owner = %request.owner_id, system = %request.house_system))]
    pub fn compute(&self, request: &ChartRequest) -> Result<NatalChart> {
        if request.owner_id.trim().is_empty() {
            return Err(ChartError::MissingOwner);
        }

        let instant = temporal::resolve(&request.birth)?;
        let location = request.location.validate()?;
        let jd = instant.julian_day;

        let window = self.provider.valid_window();
        if !window.contains(jd) {
            return Err(ChartError::ephemeris(
                None,
                format!(
                    "Julian Day {} is outside the ephemeris window {}..={}",
                    jd, window.start, window.end
                ),
            ));
        }

        let positions = REQUIRED_BODIES
            .iter()
            .map(|&body| fetch_position(self.provider.as_ref(), body, jd).map(|p| (body, p)))
            .collect::<Result<Vec<_>>>()?;
        debug!(jd, bodies = positions.len(), "positions computed");

        let houses = houses::calculate(jd, &location, request.house_system)?;

        let bodies = positions
            .into_iter()
            .map(|(body, position)| BodyPosition::place(body, position, &houses))
            .collect();

        Ok(NatalChart {
            owner_id: request.owner_id.clone(),
            birth_input: request.birth.clone(),
            birth_instant_utc: instant.utc,
            birth_location: location,
            julian_day: jd,
            time_estimated: instant.time_estimated,
            house_system: request.house_system,
            bodies,
            house_placements: house_placements(&houses),
            angles: angles(&houses),
            houses,
            provider: self.provider.name().to_string(),
            body_set_version: BODY_SET_VERSION,
            computed_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ephemeris::{JulianDayWindow, MockEphemerisProvider, ProviderError, Readiness};
    use crate::temporal::BirthZone;
    use approx::assert_abs_diff_eq;
    use chrono::{NaiveDate, NaiveTime};

    fn provider_with<F>(position_of: F) -> MockEphemerisProvider
    where
        F: Fn(CelestialBody, JulianDay) -> std::result::Result<EclipticPosition, ProviderError>
            + Send
            + Sync
            + 'static,
    {
        let mut provider = MockEphemerisProvider::new();
        provider.expect_name().return_const("mock");
        provider.expect_readiness().returning(|| Readiness::Ready);
        provider
            .expect_valid_window()
            .returning(|| JulianDayWindow::new(2_305_447.5, 2_634_166.5));
        provider.expect_supports().returning(|_| true);
        provider.expect_position_of().returning(position_of);
        provider
    }

    fn fixed_position(body: CelestialBody, _jd: JulianDay) -> std::result::Result<EclipticPosition, ProviderError> {
        let index = REQUIRED_BODIES.iter().position(|b| *b == body).unwrap_or(0) as f64;
        Ok(EclipticPosition {
            longitude: 15.0 + index * 29.5,
            latitude: 0.5,
            distance: 1.0 + index,
            daily_motion: if body == CelestialBody::Saturn { -0.02 } else { 0.5 },
        })
    }

    fn engine() -> ChartEngine {
        ChartEngine::new(Arc::new(provider_with(fixed_position))).unwrap()
    }

    fn request() -> ChartRequest {
        ChartRequest {
            owner_id: "user-1".into(),
            birth: BirthMoment::utc(
                NaiveDate::from_ymd_opt(1879, 3, 14).unwrap(),
                NaiveTime::from_hms_opt(10, 30, 0).unwrap(),
            ),
            location: Location::new(48.4, 9.99),
            house_system: HouseSystem::Placidus,
        }
    }

    #[test]
    fn compute_places_every_required_body() {
        let chart = engine().compute(&request()).unwrap();
        let bodies: Vec<CelestialBody> = chart.bodies().iter().map(|p| p.body).collect();
        assert_eq!(bodies, REQUIRED_BODIES.to_vec());
        assert_eq!(chart.owner_id(), "user-1");
        assert_eq!(chart.provider(), "mock");
        assert_abs_diff_eq!(chart.julian_day(), 2_407_422.937_5, epsilon = 1e-9);
        assert!(!chart.time_estimated());

        let moon = chart.body(CelestialBody::Moon).unwrap();
        assert_eq!(moon.longitude, 44.5);
        assert_eq!(moon.sign, ZodiacSign::Taurus);
        assert_abs_diff_eq!(moon.degree_in_sign, 14.5);
        assert_eq!(moon.house, chart.houses().house_of(44.5));

        assert!(chart.body(CelestialBody::Saturn).unwrap().is_retrograde);
        assert!(!chart.body(CelestialBody::Sun).unwrap().is_retrograde);
    }

    #[test]
    fn compute_is_idempotent_apart_from_timestamp() {
        let engine = engine();
        let first = engine.compute(&request()).unwrap();
        let second = engine.compute(&request()).unwrap();
        assert_eq!(first.bodies(), second.bodies());
        assert_eq!(first.houses(), second.houses());
        assert_eq!(first.julian_day(), second.julian_day());
    }

    #[test]
    fn provider_failure_names_the_body_and_yields_no_chart() {
        let provider = provider_with(|body, jd| {
            if body == CelestialBody::Mars {
                Err(ProviderError::Numeric("diverged".into()))
            } else {
                fixed_position(body, jd)
            }
        });
        let engine = ChartEngine::new(Arc::new(provider)).unwrap();
        let err = engine.compute(&request()).unwrap_err();
        assert_eq!(
            err,
            ChartError::ephemeris(Some(CelestialBody::Mars), "numeric failure: diverged")
        );
    }

    #[test]
    fn instant_outside_window_is_ephemeris_unavailable() {
        let mut req = request();
        req.birth.date = NaiveDate::from_ymd_opt(1200, 1, 1).unwrap();
        let err = engine().compute(&req).unwrap_err();
        assert!(matches!(err, ChartError::EphemerisUnavailable { body: None, .. }));
    }

    #[test]
    fn temporal_errors_come_before_location_errors() {
        let mut req = request();
        req.birth.zone = BirthZone::Offset { minutes: 900 };
        req.location = Location::new(123.0, 0.0);
        assert!(matches!(
            engine().compute(&req),
            Err(ChartError::InvalidTemporalInput(_))
        ));

        req.birth.zone = BirthZone::Offset { minutes: 60 };
        assert!(matches!(
            engine().compute(&req),
            Err(ChartError::InvalidLocation { .. })
        ));
    }

    #[test]
    fn polar_placidus_fails_but_whole_sign_succeeds() {
        let mut req = request();
        req.location = Location::new(89.0, 9.99);
        assert!(matches!(
            engine().compute(&req),
            Err(ChartError::HouseSystemUndefined { .. })
        ));
        req.house_system = HouseSystem::WholeSign;
        assert!(engine().compute(&req).is_ok());
    }

    #[test]
    fn blank_owner_is_rejected() {
        let mut req = request();
        req.owner_id = "  ".into();
        assert_eq!(engine().compute(&req).unwrap_err(), ChartError::MissingOwner);
    }

    #[test]
    fn engine_refuses_a_failed_provider() {
        let mut provider = MockEphemerisProvider::new();
        provider.expect_name().return_const("mock");
        provider
            .expect_readiness()
            .returning(|| Readiness::Failed("no data".into()));
        assert!(ChartEngine::new(Arc::new(provider)).is_err());
    }

    #[test]
    fn arc_minutes_truncate_within_the_degree() {
        assert_eq!(arc_minutes(14.5), 30);
        assert_eq!(arc_minutes(0.25), 15);
        assert_eq!(arc_minutes(7.0), 0);
        assert_eq!(arc_minutes(14.999_9), 59);
        assert_eq!(arc_minutes(29.999_999_999_99), 59);
    }

    #[test]
    fn cusps_and_angles_carry_sign_degree_and_minutes() {
        let chart = engine().compute(&request()).unwrap();
        let moon = chart.body(CelestialBody::Moon).unwrap();
        assert_eq!(moon.minutes, 30);
        assert_eq!(chart.body(CelestialBody::Sun).unwrap().minutes, 0);

        let placements = chart.house_placements();
        assert_eq!(placements.len(), 12);
        for (placement, house) in placements.iter().zip(House::all()) {
            let cusp = chart.houses().cusp(house);
            assert_eq!(placement.house, house);
            assert_eq!(placement.cusp, Placement::of(cusp));
            assert_eq!(placement.cusp.sign, ZodiacSign::from_longitude(cusp));
            assert!(placement.cusp.minutes < 60);
        }

        let angles = chart.angles();
        assert_eq!(angles.ascendant.longitude, chart.houses().ascendant);
        assert_eq!(angles.midheaven.longitude, chart.houses().midheaven);
        assert_abs_diff_eq!(
            angles.ascendant.degree_in_sign,
            chart.houses().ascendant.rem_euclid(30.0)
        );
    }

    #[test]
    fn submitted_birth_input_is_echoed() {
        let mut req = request();
        req.birth = BirthMoment {
            date: NaiveDate::from_ymd_opt(1990, 6, 1).unwrap(),
            time: None,
            zone: BirthZone::Named("Europe/Berlin".into()),
        };
        let chart = engine().compute(&req).unwrap();
        assert_eq!(chart.birth_input(), &req.birth);
        assert!(chart.time_estimated());
        assert_eq!(chart.birth_instant_utc().to_rfc3339(), "1990-06-01T10:00:00+00:00");

        let json = serde_json::to_value(&chart).unwrap();
        assert_eq!(json["birthInput"]["date"], "1990-06-01");
        assert!(json["birthInput"]["time"].is_null());
        let restored: NatalChart = serde_json::from_value(json).unwrap();
        assert_eq!(restored.birth_input(), &req.birth);
    }

    #[test]
    fn derived_placements_are_revalidated() {
        let chart = engine().compute(&request()).unwrap();
        let json = serde_json::to_value(&chart).unwrap();
        let rejects = |edit: &dyn Fn(&mut serde_json::Value)| {
            let mut tampered = json.clone();
            edit(&mut tampered);
            serde_json::from_value::<NatalChart>(tampered).is_err()
        };
        let bump_minutes = |v: &mut serde_json::Value| {
            let minutes = v.as_u64().unwrap();
            *v = serde_json::json!((minutes + 1) % 60);
        };

        assert!(rejects(&|j| bump_minutes(&mut j["bodies"][1]["minutes"])));
        assert!(rejects(&|j| bump_minutes(&mut j["housePlacements"][3]["cusp"]["minutes"])));
        assert!(rejects(&|j| {
            let cusp = j["angles"]["midheaven"]["longitude"].as_f64().unwrap();
            j["angles"]["midheaven"]["longitude"] = serde_json::json!((cusp + 1.0) % 360.0);
        }));
        assert!(rejects(&|j| {
            j["housePlacements"].as_array_mut().unwrap().swap(0, 1);
        }));
        assert!(rejects(&|j| j["birthInput"]["date"] = serde_json::json!("1879-03-15")));
        assert!(rejects(&|j| j["timeEstimated"] = serde_json::json!(true)));
        assert!(rejects(&|j| {
            let other = if j["bodies"][2]["house"] == "First" { "Second" } else { "First" };
            j["bodies"][2]["house"] = serde_json::json!(other);
        }));
    }

    #[test]
    fn stored_record_is_revalidated() {
        let chart = engine().compute(&request()).unwrap();
        let json = serde_json::to_value(&chart).unwrap();
        assert!(json.get("birthInstantUtc").is_some());
        assert!(json["bodies"][0].get("degreeInSign").is_some());

        let restored: NatalChart = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(restored, chart);

        let mut tampered = json.clone();
        tampered["julianDay"] = serde_json::json!(2_451_545.0);
        assert!(serde_json::from_value::<NatalChart>(tampered).is_err());

        let mut truncated = json;
        truncated["bodies"].as_array_mut().unwrap().pop();
        assert!(serde_json::from_value::<NatalChart>(truncated).is_err());
    }
}
