//! Natal chart computation and validation engine.
//!
//! Birth data flows through the temporal resolver, an [`EphemerisProvider`],
//! and the house calculator into an immutable [`NatalChart`], which the
//! [`ChartGateway`] persists per owner. The [`Canary`] replays the same
//! pipeline against a fixed historical case and reports health.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod analytic;
pub mod api;
pub mod canary;
pub mod chart;
pub mod config;
pub mod ephemeris;
pub mod error;
pub mod houses;
pub mod logging;
pub mod service;
pub mod store;
pub mod temporal;

pub use analytic::AnalyticEphemeris;
pub use canary::{Canary, CanaryLabels, CanaryReport, HealthSink, MetricsHealthSink};
pub use chart::{
    Angles, BodyPosition, ChartEngine, ChartRequest, HousePlacement, NatalChart, Placement,
};
pub use ephemeris::{
    EclipticPosition, EphemerisProvider, JulianDayWindow, ProviderError, Readiness,
    BODY_SET_VERSION, REQUIRED_BODIES,
};
pub use error::{ChartError, Result};
pub use houses::HouseCusps;
pub use service::{ChartService, ComputeChartEvent};
pub use store::{ChartGateway, ChartStore, FileChartStore, InMemoryChartStore};
pub use temporal::{BirthMoment, BirthZone, ResolvedInstant};

/// Fractional day count on the Julian Day axis (UT).
pub type JulianDay = f64;

// ---------------------------
// ## Enumerations
// ---------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CelestialBody {
    Sun,
    Moon,
    Mercury,
    Venus,
    Mars,
    Jupiter,
    Saturn,
    Uranus,
    Neptune,
    Pluto,
    /// Mean ascending lunar node.
    NorthNode,
    /// Point opposite the mean ascending node.
    SouthNode,
}

impl CelestialBody {
    pub fn iter() -> impl Iterator<Item = CelestialBody> {
        [
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
        ]
        .iter()
        .copied()
    }

    pub fn name(&self) -> &'static str {
        match self {
            CelestialBody::Sun => "Sun",
            CelestialBody::Moon => "Moon",
            CelestialBody::Mercury => "Mercury",
            CelestialBody::Venus => "Venus",
            CelestialBody::Mars => "Mars",
            CelestialBody::Jupiter => "Jupiter",
            CelestialBody::Saturn => "Saturn",
            CelestialBody::Uranus => "Uranus",
            CelestialBody::Neptune => "Neptune",
            CelestialBody::Pluto => "Pluto",
            CelestialBody::NorthNode => "North Node",
            CelestialBody::SouthNode => "South Node",
        }
    }
}

impl fmt::Display for CelestialBody {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum House {
    First = 1,
    Second,
    Third,
    Fourth,
    Fifth,
    Sixth,
    Seventh,
    Eighth,
    Ninth,
    Tenth,
    Eleventh,
    Twelfth,
}

impl House {
    pub fn from_index(index: usize) -> Option<House> {
        match index {
            1 => Some(House::First),
            2 => Some(House::Second),
            3 => Some(House::Third),
            4 => Some(House::Fourth),
            5 => Some(House::Fifth),
            6 => Some(House::Sixth),
            7 => Some(House::Seventh),
            8 => Some(House::Eighth),
            9 => Some(House::Ninth),
            10 => Some(House::Tenth),
            11 => Some(House::Eleventh),
            12 => Some(House::Twelfth),
            _ => None,
        }
    }

    pub fn all() -> impl Iterator<Item = House> {
        (1..=12).filter_map(House::from_index)
    }

    /// House number, 1 to 12.
    pub fn number(&self) -> u8 {
        *self as u8
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZodiacSign {
    Aries = 0,
    Taurus,
    Gemini,
    Cancer,
    Leo,
    Virgo,
    Libra,
    Scorpio,
    Sagittarius,
    Capricorn,
    Aquarius,
    Pisces,
}

impl ZodiacSign {
    pub fn from_longitude(longitude: f64) -> Self {
        let normalized_longitude = longitude.rem_euclid(360.0);
        let sign_index = (normalized_longitude / 30.0).floor() as usize;
        match sign_index {
            0 => ZodiacSign::Aries,
            1 => ZodiacSign::Taurus,
            2 => ZodiacSign::Gemini,
            3 => ZodiacSign::Cancer,
            4 => ZodiacSign::Leo,
            5 => ZodiacSign::Virgo,
            6 => ZodiacSign::Libra,
            7 => ZodiacSign::Scorpio,
            8 => ZodiacSign::Sagittarius,
            9 => ZodiacSign::Capricorn,
            10 => ZodiacSign::Aquarius,
            // rem_euclid can round up to exactly 360.0 for tiny negatives
            _ => ZodiacSign::Pisces,
        }
    }
}

impl fmt::Display for ZodiacSign {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let sign_str = match self {
            ZodiacSign::Aries => "Aries",
            ZodiacSign::Taurus => "Taurus",
            ZodiacSign::Gemini => "Gemini",
            ZodiacSign::Cancer => "Cancer",
            ZodiacSign::Leo => "Leo",
            ZodiacSign::Virgo => "Virgo",
            ZodiacSign::Libra => "Libra",
            ZodiacSign::Scorpio => "Scorpio",
            ZodiacSign::Sagittarius => "Sagittarius",
            ZodiacSign::Capricorn => "Capricorn",
            ZodiacSign::Aquarius => "Aquarius",
            ZodiacSign::Pisces => "Pisces",
        };
        write!(f, "{}", sign_str)
    }
}

/// House division method. Placidus is the default.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HouseSystem {
    #[default]
    Placidus,
    Porphyry,
    Equal,
    WholeSign,
}

impl HouseSystem {
    pub const ALL: [HouseSystem; 4] = [
        HouseSystem::Placidus,
        HouseSystem::Porphyry,
        HouseSystem::Equal,
        HouseSystem::WholeSign,
    ];

    /// Single-letter code used by most astrology software ('P', 'O', 'E', 'W').
    pub fn code(&self) -> char {
        match self {
            HouseSystem::Placidus => 'P',
            HouseSystem::Porphyry => 'O',
            HouseSystem::Equal => 'E',
            HouseSystem::WholeSign => 'W',
        }
    }
}

impl fmt::Display for HouseSystem {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            HouseSystem::Placidus => "Placidus",
            HouseSystem::Porphyry => "Porphyry",
            HouseSystem::Equal => "Equal",
            HouseSystem::WholeSign => "Whole Sign",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for HouseSystem {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let mut chars = normalized.chars();
        if let (Some(letter), None) = (chars.next(), chars.next()) {
            return HouseSystem::ALL
                .into_iter()
                .find(|system| system.code().eq_ignore_ascii_case(&letter))
                .ok_or_else(|| format!("unknown house system code '{}'", letter));
        }
        match normalized.as_str() {
            "placidus" => Ok(HouseSystem::Placidus),
            "porphyry" => Ok(HouseSystem::Porphyry),
            "equal" => Ok(HouseSystem::Equal),
            "whole_sign" | "wholesign" | "whole sign" => Ok(HouseSystem::WholeSign),
            other => Err(format!("unknown house system '{}'", other)),
        }
    }
}

// ---------------------------
// ## Structures
// ---------------------------

/// Geographic position in decimal degrees; east longitude and north latitude positive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Location { latitude, longitude }
    }

    /// Builds a location, rejecting non-finite or out-of-range coordinates.
    pub fn checked(latitude: f64, longitude: f64) -> Result<Self> {
        Location::new(latitude, longitude).validate()
    }

    pub fn validate(self) -> Result<Self> {
        let latitude_ok = self.latitude.is_finite() && (-90.0..=90.0).contains(&self.latitude);
        let longitude_ok =
            self.longitude.is_finite() && (-180.0..=180.0).contains(&self.longitude);
        if latitude_ok && longitude_ok {
            Ok(self)
        } else {
            Err(ChartError::InvalidLocation {
                latitude: self.latitude,
                longitude: self.longitude,
            })
        }
    }
}
