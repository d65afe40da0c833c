//! Endpoint configuration.
//!
//! The library receives configuration as a value; parsing CLI arguments
//! or files into it is the application's business. A TOML dump of the
//! effective configuration is written into the recording directory when
//! recording is enabled.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use magnetite_core::CloneSettings;
use magnetite_types::Timespan;

/// Paths to TLS certificate material, required unless SSL is disabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsFiles {
    /// Certificate chain (PEM).
    pub cert: PathBuf,
    /// Private key (PEM).
    pub key: PathBuf,
    /// CA bundle for verifying peers (PEM).
    pub ca: PathBuf,
}

/// Default intervals applied when attaching clones.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreDefaults {
    /// Seconds between master lookups while disconnected.
    pub resync_interval: f64,
    /// Seconds of master silence before a clone flags itself stale.
    pub stale_interval: f64,
    /// Seconds bootstrap-buffered mutations stay relevant.
    pub mutation_buffer_interval: f64,
}

impl Default for StoreDefaults {
    fn default() -> Self {
        Self {
            resync_interval: 10.0,
            stale_interval: 10.0,
            mutation_buffer_interval: 120.0,
        }
    }
}

impl StoreDefaults {
    pub(crate) fn clone_settings(self) -> CloneSettings {
        CloneSettings {
            resync_interval: secs(self.resync_interval),
            stale_interval: secs(self.stale_interval),
            mutation_buffer_interval: secs(self.mutation_buffer_interval),
        }
    }
}

fn secs(seconds: f64) -> Timespan {
    Timespan::from_nanos((seconds * 1_000_000_000.0) as i64)
}

/// Endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// When non-empty: wipe, recreate, and fill this directory with a
    /// configuration dump and a recording of every routed message.
    pub recording_directory: PathBuf,
    /// Clock mode. `false` gives a virtual clock driven by
    /// [`Endpoint::advance_time`](crate::Endpoint::advance_time).
    pub use_real_time: bool,
    /// Allow plaintext TCP between endpoints. When `false` (the default),
    /// constructing an endpoint without [`Config::tls`] fails.
    pub disable_ssl: bool,
    /// Forward messages received from one peer on to other matching
    /// peers. Local publishes always fan out.
    pub forward: bool,
    /// Maximum number of endpoints a message may traverse.
    pub ttl: usize,
    /// Wait for store actors to drain before shutting down.
    pub await_stores_on_shutdown: bool,
    /// TLS certificate material.
    pub tls: Option<TlsFiles>,
    /// Clone attachment defaults.
    pub store: StoreDefaults,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            recording_directory: PathBuf::new(),
            use_real_time: true,
            disable_ssl: false,
            forward: true,
            ttl: 20,
            await_stores_on_shutdown: false,
            tls: None,
            store: StoreDefaults::default(),
        }
    }
}

impl Config {
    /// Renders the effective configuration for the recording-directory
    /// dump.
    pub(crate) fn dump(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_else(|err| format!("# dump failed: {err}\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documentation() {
        let config = Config::default();
        assert!(config.use_real_time);
        assert!(!config.disable_ssl);
        assert!(config.forward);
        assert_eq!(config.ttl, 20);
        assert!(config.recording_directory.as_os_str().is_empty());
    }

    #[test]
    fn store_defaults_convert_to_clone_settings() {
        let settings = StoreDefaults {
            resync_interval: 0.5,
            stale_interval: 2.0,
            mutation_buffer_interval: 120.0,
        }
        .clone_settings();
        assert_eq!(settings.resync_interval, Timespan::from_millis(500));
        assert_eq!(settings.stale_interval, Timespan::from_secs(2));
        assert_eq!(
            settings.mutation_buffer_interval,
            Timespan::from_secs(120)
        );
    }

    #[test]
    fn dump_is_parseable_toml() {
        let dump = Config::default().dump();
        let parsed: Config = toml::from_str(&dump).expect("round trip");
        assert_eq!(parsed.ttl, 20);
    }
}
