//! Write trigger: turns a birth-data event into a stored chart.

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::chart::{ChartEngine, ChartRequest, NatalChart};
use crate::store::ChartGateway;
use crate::temporal::{BirthMoment, BirthZone};
use crate::{ChartError, HouseSystem, Location, Result};

/// Birth data submitted after a profile is saved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeChartEvent {
    #[serde(default)]
    pub user_id: String,
    /// `YYYY-MM-DD`
    #[serde(default)]
    pub birth_date: String,
    /// `HH:MM` or `HH:MM:SS`; local noon is assumed when absent.
    #[serde(default)]
    pub birth_time: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub iana_time_zone: Option<String>,
    #[serde(default)]
    pub utc_offset_minutes: Option<i32>,
    #[serde(default)]
    pub house_system: Option<String>,
}

impl ComputeChartEvent {
    pub fn from_json(payload: &str) -> Result<Self> {
        serde_json::from_str(payload).map_err(|err| ChartError::InvalidEvent(err.to_string()))
    }

    /// Validates the event. An IANA zone takes precedence over a raw offset.
    pub fn to_request(&self, default_house_system: HouseSystem) -> Result<ChartRequest> {
        let owner_id = self.user_id.trim();
        if owner_id.is_empty() {
            return Err(ChartError::MissingOwner);
        }

        let date = NaiveDate::parse_from_str(self.birth_date.trim(), "%Y-%m-%d").map_err(|_| {
            ChartError::InvalidTemporalInput(format!("invalid birth date '{}'", self.birth_date))
        })?;

        let time = match self.birth_time.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(
                NaiveTime::parse_from_str(raw, "%H:%M")
                    .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
                    .map_err(|_| {
                        ChartError::InvalidTemporalInput(format!("invalid birth time '{}'", raw))
                    })?,
            ),
        };

        let zone = match (self.iana_time_zone.as_deref().map(str::trim), self.utc_offset_minutes) {
            (Some(name), _) if !name.is_empty() => BirthZone::Named(name.to_string()),
            (_, Some(minutes)) => BirthZone::Offset { minutes },
            _ => {
                return Err(ChartError::InvalidTemporalInput(
                    "missing time zone or UTC offset".into(),
                ))
            }
        };

        let house_system = match self.house_system.as_deref() {
            None => default_house_system,
            Some(raw) => raw.parse().map_err(ChartError::InvalidEvent)?,
        };

        Ok(ChartRequest {
            owner_id: owner_id.to_string(),
            birth: BirthMoment { date, time, zone },
            location: Location::new(self.latitude, self.longitude),
            house_system,
        })
    }
}

#[derive(Clone)]
pub struct ChartService {
    engine: ChartEngine,
    gateway: ChartGateway,
    default_house_system: HouseSystem,
    deadline: Duration,
}

impl ChartService {
    pub fn new(
        engine: ChartEngine,
        gateway: ChartGateway,
        default_house_system: HouseSystem,
        deadline: Duration,
    ) -> Self {
        ChartService {
            engine,
            gateway,
            default_house_system,
            deadline,
        }
    }

    pub fn engine(&self) -> &ChartEngine {
        &self.engine
    }

    pub fn gateway(&self) -> &ChartGateway {
        &self.gateway
    }

    /// Computes and stores the owner's chart. Nothing is written when any
    /// stage fails, and failures are not retried here.
    #[instrument(skip_all, fields(owner = %event.user_id))]
    pub async fn handle_event(&self, event: ComputeChartEvent) -> Result<NatalChart> {
        let request = event.to_request(self.default_house_system)?;
        let chart = self.compute(request).await?;
        self.gateway.put(chart.clone()).await?;
        info!(
            time_estimated = chart.time_estimated(),
            system = %chart.house_system(),
            "natal chart generated"
        );
        Ok(chart)
    }

    pub async fn handle_json(&self, payload: &str) -> Result<NatalChart> {
        self.handle_event(ComputeChartEvent::from_json(payload)?).await
    }

    /// Runs the engine on the blocking pool under the configured deadline.
    /// An expired deadline is reported as `EphemerisUnavailable`.
    pub async fn compute(&self, request: ChartRequest) -> Result<NatalChart> {
        let engine = self.engine.clone();
        let task = tokio::task::spawn_blocking(move || engine.compute(&request));
        match tokio::time::timeout(self.deadline, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => Err(ChartError::ephemeris(
                None,
                format!("chart computation aborted: {}", err),
            )),
            Err(_) => {
                warn!(deadline_ms = self.deadline.as_millis() as u64, "chart computation timed out");
                Err(ChartError::ephemeris(
                    None,
                    format!("chart computation exceeded {:?}", self.deadline),
                ))
            }
        }
    }
}
