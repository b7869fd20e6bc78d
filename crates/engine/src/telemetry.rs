//! Tracing subscriber setup for hosts embedding the engine

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "planguard_engine=info,planguard_shared=info";

/// Log output settings
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
    /// Filter directive used when `RUST_LOG` is unset
    pub default_filter: Option<String>,
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        Self {
            json: std::env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
            default_filter: None,
        }
    }
}

/// Install the global subscriber.
///
/// Returns `false` when a subscriber was already installed (tests, or a host that
/// configured its own), which is not treated as an error.
pub fn init_tracing(config: &TelemetryConfig) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(config.default_filter.as_deref().unwrap_or(DEFAULT_FILTER))
    });

    let result = if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_current_span(true))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init()
    };

    result.is_ok()
}
