//! Project-wide utility for initializing the tracing subscriber.
use serde::Deserialize;
use snafu::ResultExt;
use std::env;
use tracing::Subscriber;
use tracing_subscriber::{filter::LevelFilter, fmt, layer::SubscriberExt, EnvFilter, Registry};

const DEFAULT_TRACING_FILTER_DIRECTIVE: LevelFilter = LevelFilter::INFO;

const TRACING_FILTER_DIRECTIVE_ENV_VAR: &str = "TRACING_FILTER_DIRECTIVE";
const LOGGING_FORMATTER_ENV_VAR: &str = "LOGGING_FORMATTER";
const LOGGING_ANSI_ENABLED_ENV_VAR: &str = "LOGGING_ANSI_ENABLED";

/// The message format for logging tracing events.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    /// Human-readable, single-line logs for each event.
    Full,
    /// A variant of the default formatter optimized for short line lengths.
    Compact,
    #[default]
    /// Pretty-formatted multi-line logs optimized for human readability.
    Pretty,
    /// Newline-delimited JSON logs.
    Json,
}

impl MessageFormat {
    fn try_from_env() -> Result<Self> {
        env::var(LOGGING_FORMATTER_ENV_VAR)
            .ok()
            .map(|formatter| {
                serde_plain::from_str(&formatter).context(error::LogFormatterEnvSnafu {
                    env_value: formatter,
                })
            })
            .unwrap_or(Ok(Default::default()))
    }

    fn add_format_layer<S>(self, event_subscriber: S, ansi: bool) -> Box<dyn Subscriber + Send + Sync>
    where
        S: SubscriberExt + Send + Sync + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        // The layers are all different types, so each arm boxes its own subscriber.
        match self {
            MessageFormat::Full => Box::new(event_subscriber.with(fmt::layer().with_ansi(ansi))),
            MessageFormat::Compact => {
                Box::new(event_subscriber.with(fmt::layer().compact().with_ansi(ansi)))
            }
            MessageFormat::Pretty => {
                Box::new(event_subscriber.with(fmt::layer().pretty().with_ansi(ansi)))
            }
            MessageFormat::Json => {
                Box::new(event_subscriber.with(fmt::layer().json().with_ansi(ansi)))
            }
        }
    }
}

fn ansi_enabled_from_env() -> Result<bool> {
    env::var(LOGGING_ANSI_ENABLED_ENV_VAR)
        .ok()
        .map(|ansi_enabled_str| {
            ansi_enabled_str
                .to_lowercase()
                .parse()
                .context(error::LogAnsiEnvSnafu {
                    env_value: ansi_enabled_str.to_string(),
                })
        })
        .unwrap_or(Ok(false))
}

/// Installs the global tracing subscriber, configured from the environment.
pub fn init_telemetry_from_env() -> Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(DEFAULT_TRACING_FILTER_DIRECTIVE.into())
        .with_env_var(TRACING_FILTER_DIRECTIVE_ENV_VAR)
        .from_env_lossy();

    let subscriber = Registry::default().with(env_filter);
    let subscriber =
        MessageFormat::try_from_env()?.add_format_layer(subscriber, ansi_enabled_from_env()?);

    tracing::subscriber::set_global_default(subscriber)
        .context(error::TracingConfigurationSnafu)?;

    Ok(())
}

pub mod error {
    use super::*;
    use snafu::Snafu;
    use std::str::ParseBoolError;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum TelemetryConfigError {
        #[snafu(display("Error configuring tracing: '{}'", source))]
        TracingConfiguration {
            source: tracing::subscriber::SetGlobalDefaultError,
        },

        #[snafu(display(
            "Could not parse formatter from environment variable '{}={}': '{}'",
            LOGGING_FORMATTER_ENV_VAR,
            env_value,
            source
        ))]
        LogFormatterEnv {
            source: serde_plain::Error,
            env_value: String,
        },

        #[snafu(display(
            "Could not parse ANSI enablement from environment variable '{}={}': '{}'",
            LOGGING_ANSI_ENABLED_ENV_VAR,
            env_value,
            source
        ))]
        LogAnsiEnv {
            source: ParseBoolError,
            env_value: String,
        },
    }
}

type Result<T> = std::result::Result<T, TelemetryConfigError>;
pub use error::TelemetryConfigError;
