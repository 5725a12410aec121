//! Runtime settings, read from `RQTAP_*` environment variables.
//!
//! rqtap takes no command-line arguments. Every setting has a default that
//! matches a stock kernel, so running with an empty environment is the
//! normal case.

use config::{Config, ConfigError, Environment};
use rqtap_common::DEFAULT_HOOK;
use serde::Deserialize;

const ENV_PREFIX: &str = "RQTAP";
const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    /// Kernel function the kprobe attaches to
    pub hook: String,
    /// Byte offset of `nr_running` inside `struct rq`. When unset it is
    /// read from kernel BTF.
    pub nr_running_offset: Option<u32>,
    /// Log filter used when `RUST_LOG` is not set
    pub log: String,
    pub skip_preflight: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            hook: DEFAULT_HOOK.to_string(),
            nr_running_offset: None,
            log: DEFAULT_LOG_FILTER.to_string(),
            skip_preflight: false,
        }
    }
}

impl Settings {
    /// Load settings from the process environment
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_environment(Self::environment())
    }

    fn environment() -> Environment {
        // No setting is nested, so `RQTAP_NR_RUNNING_OFFSET` maps straight to
        // `nr_running_offset`.
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .try_parsing(true)
    }

    fn from_environment(environment: Environment) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(environment)
            .build()?
            .try_deserialize()
    }
}
