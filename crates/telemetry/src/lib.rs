//! Tracing subscriber bootstrap.

use libris_kernel::settings::{LogFormat, TelemetrySettings};
use tracing_subscriber::EnvFilter;

/// Build the log filter: `RUST_LOG` wins over the configured directive.
pub fn filter(settings: &TelemetrySettings) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Returns `false` when one was already set.
pub fn init(settings: &TelemetrySettings) -> bool {
    let builder = tracing_subscriber::fmt().with_env_filter(filter(settings));

    let installed = match settings.log_format {
        LogFormat::Pretty => builder.try_init().is_ok(),
        LogFormat::Json => builder.json().flatten_event(true).try_init().is_ok(),
    };

    if installed {
        tracing::info!(
            target: "libris-telemetry",
            format = ?settings.log_format,
            filter = %settings.filter,
            "telemetry initialized"
        );
    }

    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_directive_falls_back() {
        let settings = TelemetrySettings {
            log_format: LogFormat::Pretty,
            filter: "[[not a filter".to_string(),
        };
        // Must not panic regardless of RUST_LOG in the test environment.
        let _ = filter(&settings);
    }

    #[test]
    fn second_init_is_tolerated() {
        let settings = TelemetrySettings::default();
        let _ = init(&settings);
        assert!(!init(&settings));
    }
}
