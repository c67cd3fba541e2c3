use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{ChartError, Result};

/// Installs the global subscriber. `RUST_LOG` directives are honoured and
/// `level` is added on top of them.
pub fn init(level: &str, json: bool) -> Result<()> {
    let level = level
        .parse::<tracing::Level>()
        .map_err(|_| ChartError::InvalidConfig(format!("invalid log level '{}'", level)))?;
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let installed = if json {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .with(filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true),
            )
            .with(filter)
            .try_init()
    };
    installed.map_err(|err| ChartError::InvalidConfig(err.to_string()))?;

    info!("logging initialized at level {}", level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_level_is_rejected() {
        assert!(matches!(
            init("chatty", false),
            Err(ChartError::InvalidConfig(_))
        ));
    }
}
