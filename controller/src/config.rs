//! Controller configuration, read from the environment at startup.

use models::constants::DEFAULT_POD_QUOTA_NAME;

use snafu::ResultExt;
use std::env;
use std::time::Duration;

use error::Result;

const PROFILE_STORE_PATH_ENV_VAR: &str = "PROFILE_STORE_PATH";
const IN_FLIGHT_TIMEOUT_ENV_VAR: &str = "IN_FLIGHT_TIMEOUT_SECONDS";
const PRINT_REPEAT_ENV_VAR: &str = "PRINT_REPEAT_SECONDS";
const POD_QUOTA_NAME_ENV_VAR: &str = "POD_QUOTA_NAME";
const STREAM_IDLE_TIMEOUT_ENV_VAR: &str = "STREAM_IDLE_TIMEOUT_SECONDS";

const DEFAULT_PROFILE_STORE_PATH: &str = "trace_store.db";
// Planning and execution are not synchronous with the next observation of a
// pending pod; re-observations inside this window are dropped.
const DEFAULT_IN_FLIGHT_TIMEOUT_SECONDS: u64 = 5;
const DEFAULT_PRINT_REPEAT_SECONDS: u64 = 5;
// Bounded watch timeout so the stop signal is observed promptly.
const DEFAULT_STREAM_IDLE_TIMEOUT_SECONDS: u32 = 30;

#[derive(Clone, Debug)]
pub struct Config {
    /// Path to the profiler-owned SQLite store.
    pub profile_store_path: String,
    /// Per-pod cool-down between planning attempts.
    pub in_flight_timeout: Duration,
    /// Log rate-limit window for repeated pending-pod observations.
    pub print_repeat: Duration,
    /// Name of the per-namespace ResourceQuota object gating pod counts.
    pub pod_quota_name: String,
    /// Idle timeout applied to watch streams, in seconds.
    pub stream_idle_timeout_seconds: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            profile_store_path: env::var(PROFILE_STORE_PATH_ENV_VAR)
                .unwrap_or_else(|_| DEFAULT_PROFILE_STORE_PATH.to_string()),
            in_flight_timeout: Duration::from_secs(seconds_from_env(
                IN_FLIGHT_TIMEOUT_ENV_VAR,
                DEFAULT_IN_FLIGHT_TIMEOUT_SECONDS,
            )?),
            print_repeat: Duration::from_secs(seconds_from_env(
                PRINT_REPEAT_ENV_VAR,
                DEFAULT_PRINT_REPEAT_SECONDS,
            )?),
            pod_quota_name: env::var(POD_QUOTA_NAME_ENV_VAR)
                .unwrap_or_else(|_| DEFAULT_POD_QUOTA_NAME.to_string()),
            stream_idle_timeout_seconds: seconds_from_env(
                STREAM_IDLE_TIMEOUT_ENV_VAR,
                u64::from(DEFAULT_STREAM_IDLE_TIMEOUT_SECONDS),
            )? as u32,
        })
    }
}

fn seconds_from_env(env_var: &'static str, default: u64) -> Result<u64> {
    match env::var(env_var) {
        Ok(value) => value
            .parse()
            .context(error::ParseSecondsSnafu { env_var, value }),
        Err(_) => Ok(default),
    }
}

pub mod error {
    use snafu::Snafu;

    pub type Result<T> = std::result::Result<T, Error>;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display(
            "Unable to parse environment variable '{}={}' as seconds: '{}'",
            env_var,
            value,
            source
        ))]
        ParseSeconds {
            source: std::num::ParseIntError,
            env_var: &'static str,
            value: String,
        },
    }
}
