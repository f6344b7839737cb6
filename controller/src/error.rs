use models::profile::ProfileStoreError;
use models::telemetry::TelemetryConfigError;

use snafu::Snafu;

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Startup errors. All of these are fatal: the process exits non-zero.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to create client: '{}'", source))]
    ClientCreate { source: kube::Error },

    #[snafu(display("Error configuring tracing: '{}'", source))]
    TelemetryConfiguration { source: TelemetryConfigError },

    #[snafu(display("Unable to load configuration: '{}'", source))]
    ConfigLoad { source: crate::config::error::Error },

    #[snafu(display("Unable to open profile store: '{}'", source))]
    ProfileStoreOpen { source: ProfileStoreError },

    #[snafu(display("Unable to install signal handler: '{}'", source))]
    SignalHandler { source: std::io::Error },
}
