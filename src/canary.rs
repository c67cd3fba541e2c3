//! Synthetic end-to-end check of the chart pipeline against a fixed
//! historical birth whose Sun position is well known.

use chrono::{NaiveDate, NaiveTime};
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tracing::{debug, error, info, instrument};

use crate::chart::{ChartEngine, ChartRequest, NatalChart};
use crate::ephemeris::{EphemerisProvider, REQUIRED_BODIES};
use crate::temporal::BirthMoment;
use crate::{CelestialBody, ChartError, HouseSystem, Location, Result};

pub const CANARY_OWNER_ID: &str = "canary-synthetic-owner";

/// 1879-03-14 10:30 UTC at 48.4 N, 9.99 E.
pub fn reference_request() -> Result<ChartRequest> {
    let date = NaiveDate::from_ymd_opt(1879, 3, 14)
        .ok_or_else(|| ChartError::CanaryCheckFailed("invalid reference date".into()))?;
    let time = NaiveTime::from_hms_opt(10, 30, 0)
        .ok_or_else(|| ChartError::CanaryCheckFailed("invalid reference time".into()))?;
    Ok(ChartRequest {
        owner_id: CANARY_OWNER_ID.to_string(),
        birth: BirthMoment::utc(date, time),
        location: Location::new(48.4, 9.99),
        house_system: HouseSystem::Placidus,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanaryLabels {
    pub environment: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CanaryReport {
    pub house_count: usize,
    pub sun_longitude: f64,
    pub first_cusp: f64,
    pub ascendant: f64,
    pub midheaven: f64,
    pub elapsed: Duration,
}

/// Receives one observation per canary run.
pub trait HealthSink: Send + Sync {
    fn record(&self, labels: &CanaryLabels, healthy: bool, elapsed: Duration);
}

/// Publishes canary observations through the `metrics` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsHealthSink;

impl HealthSink for MetricsHealthSink {
    fn record(&self, labels: &CanaryLabels, healthy: bool, elapsed: Duration) {
        metrics::gauge!(
            "natal_canary_health",
            "environment" => labels.environment.clone(),
            "canary" => labels.name.clone()
        )
        .set(if healthy { 1.0 } else { 0.0 });

        metrics::histogram!(
            "natal_canary_duration_seconds",
            "environment" => labels.environment.clone(),
            "canary" => labels.name.clone()
        )
        .record(elapsed.as_secs_f64());
    }
}

/// Writes rendered metrics for a node-exporter textfile collector. The file
/// is replaced atomically so the collector never reads a partial scrape.
pub fn export_textfile(path: &Path, rendered: &str) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(rendered.as_bytes())?;
    file.flush()?;
    file.persist(path).map_err(|err| ChartError::from(err.error))?;
    debug!(path = %path.display(), "exported canary metrics");
    Ok(())
}

/// Builds its engine on every run, so a provider that fails validation is
/// reported like any other failure.
pub struct Canary {
    provider: Arc<dyn EphemerisProvider>,
    labels: CanaryLabels,
    sink: Arc<dyn HealthSink>,
}

impl Canary {
    pub fn new(
        provider: Arc<dyn EphemerisProvider>,
        labels: CanaryLabels,
        sink: Arc<dyn HealthSink>,
    ) -> Self {
        Canary {
            provider,
            labels,
            sink,
        }
    }

    pub fn labels(&self) -> &CanaryLabels {
        &self.labels
    }

    /// Validates the provider and runs the reference case through a fresh
    /// engine without touching any store. Health and elapsed time are
    /// recorded on every run, including a provider that fails validation; a
    /// failure is also returned to the caller.
    #[instrument(skip(self), fields(canary = %self.labels.name, environment = %self.labels.environment))]
    pub fn run(&self) -> Result<CanaryReport> {
        let started = Instant::now();
        let outcome = ChartEngine::new(self.provider.clone())
            .and_then(|engine| reference_request().and_then(|request| engine.compute(&request)))
            .and_then(|chart| inspect(&chart));
        let elapsed = started.elapsed();

        match outcome {
            Ok(mut report) => {
                report.elapsed = elapsed;
                self.sink.record(&self.labels, true, elapsed);
                info!(
                    sun_longitude = report.sun_longitude,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "canary passed"
                );
                Ok(report)
            }
            Err(err) => {
                self.sink.record(&self.labels, false, elapsed);
                error!(error = %err, elapsed_ms = elapsed.as_millis() as u64, "canary failed");
                Err(err)
            }
        }
    }
}

fn in_range(value: f64) -> bool {
    value.is_finite() && (0.0..360.0).contains(&value)
}

/// Sun of the reference case lies between late Aquarius and early Taurus.
fn sun_plausible(longitude: f64) -> bool {
    longitude >= 330.0 || longitude <= 30.0
}

fn inspect(chart: &NatalChart) -> Result<CanaryReport> {
    let failed = |msg: String| Err(ChartError::CanaryCheckFailed(msg));
    let houses = chart.houses();

    if let Some((i, cusp)) = houses.cusps.iter().enumerate().find(|(_, c)| !in_range(**c)) {
        return failed(format!("house cusp {} out of range: {}", i + 1, cusp));
    }
    if !houses.ascendant.is_finite() || !houses.midheaven.is_finite() {
        return failed("ascendant or midheaven is not finite".into());
    }
    if let Some(missing) = REQUIRED_BODIES.iter().find(|b| chart.body(**b).is_none()) {
        return failed(format!("{} missing from chart", missing));
    }

    let sun = match chart.body(CelestialBody::Sun) {
        Some(sun) => sun.longitude,
        None => return failed("Sun missing from chart".into()),
    };
    if !in_range(sun) || !sun_plausible(sun) {
        return failed(format!("Sun longitude {} outside the expected band", sun));
    }

    Ok(CanaryReport {
        house_count: houses.cusps.len(),
        sun_longitude: sun,
        first_cusp: houses.cusps[0],
        ascendant: houses.ascendant,
        midheaven: houses.midheaven,
        elapsed: Duration::ZERO,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytic::{AnalyticEphemeris, ProviderConfig};
    use crate::ephemeris::{
        EclipticPosition, JulianDayWindow, MockEphemerisProvider, ProviderError, Readiness,
    };
    use crate::ZodiacSign;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        observations: Mutex<Vec<(CanaryLabels, bool, Duration)>>,
    }

    impl HealthSink for RecordingSink {
        fn record(&self, labels: &CanaryLabels, healthy: bool, elapsed: Duration) {
            self.observations
                .lock()
                .unwrap()
                .push((labels.clone(), healthy, elapsed));
        }
    }

    fn labels() -> CanaryLabels {
        CanaryLabels {
            environment: "test".into(),
            name: "reference-1879".into(),
        }
    }

    fn mock_provider(sun_longitude: f64, fail_moon: bool) -> MockEphemerisProvider {
        let mut provider = MockEphemerisProvider::new();
        provider.expect_name().return_const("mock");
        provider.expect_readiness().returning(|| Readiness::Ready);
        provider
            .expect_valid_window()
            .returning(|| JulianDayWindow::new(2_305_447.5, 2_634_166.5));
        provider.expect_supports().returning(|_| true);
        provider.expect_position_of().returning(move |body, _| match body {
            CelestialBody::Moon if fail_moon => Err(ProviderError::NotReady("data gone".into())),
            CelestialBody::Sun => Ok(EclipticPosition {
                longitude: sun_longitude,
                latitude: 0.0,
                distance: 1.0,
                daily_motion: 1.0,
            }),
            _ => Ok(EclipticPosition {
                longitude: 200.0,
                latitude: 0.0,
                distance: 2.0,
                daily_motion: 0.3,
            }),
        });
        provider
    }

    fn canary_with(provider: MockEphemerisProvider, sink: Arc<RecordingSink>) -> Canary {
        Canary::new(Arc::new(provider), labels(), sink)
    }

    #[test]
    fn reference_case_passes_with_analytic_provider() {
        let sink = Arc::new(RecordingSink::default());
        let provider = Arc::new(AnalyticEphemeris::new(ProviderConfig::default()));
        let canary = Canary::new(provider, labels(), sink.clone());

        let report = canary.run().unwrap();
        assert_eq!(report.house_count, 12);
        assert_eq!(ZodiacSign::from_longitude(report.sun_longitude), ZodiacSign::Pisces);
        assert_eq!(ZodiacSign::from_longitude(report.ascendant), ZodiacSign::Cancer);

        let observations = sink.observations.lock().unwrap();
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].0, labels());
        assert!(observations[0].1);
        assert_eq!(observations[0].2, report.elapsed);
    }

    #[test]
    fn broken_provider_reports_unhealthy_and_propagates() {
        let sink = Arc::new(RecordingSink::default());
        let canary = canary_with(mock_provider(353.5, true), sink.clone());

        let err = canary.run().unwrap_err();
        assert!(matches!(
            err,
            ChartError::EphemerisUnavailable {
                body: Some(CelestialBody::Moon),
                ..
            }
        ));
        let observations = sink.observations.lock().unwrap();
        assert_eq!(observations.len(), 1);
        assert!(!observations[0].1);
    }

    #[test]
    fn implausible_sun_fails_the_check() {
        let sink = Arc::new(RecordingSink::default());
        let canary = canary_with(mock_provider(120.0, false), sink.clone());
        assert!(matches!(canary.run(), Err(ChartError::CanaryCheckFailed(_))));
        assert!(!sink.observations.lock().unwrap()[0].1);
    }

    #[test]
    fn sun_band_wraps_through_aries() {
        assert!(sun_plausible(330.0));
        assert!(sun_plausible(359.9));
        assert!(sun_plausible(0.0));
        assert!(sun_plausible(30.0));
        assert!(!sun_plausible(30.1));
        assert!(!sun_plausible(329.9));
    }

    #[test]
    fn provider_failing_validation_is_recorded_unhealthy() {
        let mut provider = MockEphemerisProvider::new();
        provider.expect_name().return_const("mock");
        provider
            .expect_readiness()
            .returning(|| Readiness::Failed("elements missing".into()));
        provider.expect_position_of().never();
        let sink = Arc::new(RecordingSink::default());
        let canary = canary_with(provider, sink.clone());

        let err = canary.run().unwrap_err();
        assert!(matches!(err, ChartError::EphemerisUnavailable { body: None, .. }));
        let observations = sink.observations.lock().unwrap();
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].0, labels());
        assert!(!observations[0].1);
    }

    #[test]
    fn metrics_sink_publishes_health_and_duration() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        metrics::with_local_recorder(&recorder, || {
            MetricsHealthSink.record(&labels(), true, Duration::from_millis(12));
            MetricsHealthSink.record(&labels(), false, Duration::from_millis(40));
        });

        let mut health = None;
        let mut durations = Vec::new();
        for (key, _, _, value) in snapshotter.snapshot().into_vec() {
            let key = key.key();
            let tags: Vec<(String, String)> = key
                .labels()
                .map(|l| (l.key().to_string(), l.value().to_string()))
                .collect();
            assert!(tags.contains(&("environment".into(), "test".into())));
            assert!(tags.contains(&("canary".into(), "reference-1879".into())));
            match (key.name(), value) {
                ("natal_canary_health", DebugValue::Gauge(v)) => health = Some(v.into_inner()),
                ("natal_canary_duration_seconds", DebugValue::Histogram(vs)) => {
                    durations = vs.into_iter().map(|v| v.into_inner()).collect()
                }
                (name, value) => panic!("unexpected metric {} = {:?}", name, value),
            }
        }
        assert_eq!(health, Some(0.0));
        assert_eq!(durations, vec![0.012, 0.040]);
    }

    #[test]
    fn metrics_sink_reports_recovery() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        metrics::with_local_recorder(&recorder, || {
            MetricsHealthSink.record(&labels(), false, Duration::from_millis(5));
            MetricsHealthSink.record(&labels(), true, Duration::from_millis(5));
        });
        let gauge = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .find_map(|(key, _, _, value)| match value {
                DebugValue::Gauge(v) if key.key().name() == "natal_canary_health" => {
                    Some(v.into_inner())
                }
                _ => None,
            });
        assert_eq!(gauge, Some(1.0));
    }

    #[test]
    fn textfile_export_replaces_previous_scrape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("natal_canary.prom");
        export_textfile(&path, "natal_canary_health 0\n").unwrap();
        export_textfile(&path, "natal_canary_health 1\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "natal_canary_health 1\n");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
