use thiserror::Error;

use crate::{CelestialBody, HouseSystem};

// ---------------------------
// ## Error Handling
// ---------------------------

/// Exit status for failures a retry of the same input may clear (EX_TEMPFAIL).
pub const EXIT_RETRYABLE: u8 = 75;
/// Exit status for input that will never produce a chart (EX_DATAERR).
pub const EXIT_BAD_INPUT: u8 = 65;
/// Exit status for an unusable configuration (EX_CONFIG).
pub const EXIT_CONFIG: u8 = 78;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChartError {
    /// Birth date, time, offset or zone cannot be resolved to a supported UTC instant.
    #[error("invalid temporal input: {0}")]
    InvalidTemporalInput(String),

    #[error("invalid location: latitude {latitude}, longitude {longitude}")]
    InvalidLocation { latitude: f64, longitude: f64 },

    /// Provider failure, unsupported body or a Julian Day outside the ephemeris window.
    #[error("ephemeris unavailable{}: {reason}", .body.map(|b| format!(" for {}", b)).unwrap_or_default())]
    EphemerisUnavailable {
        body: Option<CelestialBody>,
        reason: String,
    },

    #[error("{system} houses are undefined at latitude {latitude}")]
    HouseSystemUndefined { system: HouseSystem, latitude: f64 },

    #[error("forbidden")]
    Forbidden,

    #[error("natal chart not found")]
    NotFound,

    #[error("missing owner identifier")]
    MissingOwner,

    #[error("store failure: {0}")]
    StoreFailure(String),

    #[error("canary check failed: {0}")]
    CanaryCheckFailed(String),

    /// Malformed write-trigger payload.
    #[error("invalid chart event: {0}")]
    InvalidEvent(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ChartError {
    pub fn ephemeris(body: Option<CelestialBody>, reason: impl Into<String>) -> Self {
        ChartError::EphemerisUnavailable {
            body,
            reason: reason.into(),
        }
    }

    /// Whether repeating the same request may succeed without changing its inputs.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChartError::EphemerisUnavailable { .. } | ChartError::StoreFailure(_)
        )
    }

    /// Process exit status for a failed one-shot command. Job runners
    /// re-queue on [`EXIT_RETRYABLE`] and drop the event otherwise.
    pub fn exit_code(&self) -> u8 {
        match self {
            _ if self.is_retryable() => EXIT_RETRYABLE,
            ChartError::InvalidConfig(_) => EXIT_CONFIG,
            _ => EXIT_BAD_INPUT,
        }
    }
}

impl From<std::io::Error> for ChartError {
    fn from(err: std::io::Error) -> Self {
        ChartError::StoreFailure(err.to_string())
    }
}

impl From<serde_json::Error> for ChartError {
    fn from(err: serde_json::Error) -> Self {
        ChartError::StoreFailure(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChartError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_taxonomy() {
        assert!(ChartError::ephemeris(None, "window").is_retryable());
        assert!(ChartError::StoreFailure("disk".into()).is_retryable());
        assert!(!ChartError::InvalidTemporalInput("offset".into()).is_retryable());
        assert!(!ChartError::HouseSystemUndefined {
            system: HouseSystem::Placidus,
            latitude: 89.0
        }
        .is_retryable());
        assert!(!ChartError::Forbidden.is_retryable());
        assert!(!ChartError::NotFound.is_retryable());
        assert!(!ChartError::InvalidConfig("log level".into()).is_retryable());
    }

    #[test]
    fn exit_codes_separate_retryable_failures() {
        assert_eq!(ChartError::ephemeris(None, "not ready").exit_code(), EXIT_RETRYABLE);
        assert_eq!(ChartError::StoreFailure("disk".into()).exit_code(), EXIT_RETRYABLE);
        assert_eq!(ChartError::InvalidEvent("userId".into()).exit_code(), EXIT_BAD_INPUT);
        assert_eq!(
            ChartError::InvalidTemporalInput("gap".into()).exit_code(),
            EXIT_BAD_INPUT
        );
        assert_eq!(ChartError::MissingOwner.exit_code(), EXIT_BAD_INPUT);
        assert_eq!(ChartError::InvalidConfig("window".into()).exit_code(), EXIT_CONFIG);
    }

    #[test]
    fn ephemeris_error_names_the_body() {
        let err = ChartError::ephemeris(Some(CelestialBody::Pluto), "unsupported body");
        assert_eq!(
            err.to_string(),
            "ephemeris unavailable for Pluto: unsupported body"
        );
        let err = ChartError::ephemeris(None, "provider not ready");
        assert_eq!(err.to_string(), "ephemeris unavailable: provider not ready");
    }
}
