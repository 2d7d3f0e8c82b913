//! Configuration
//!
//! Responsible for setting default config, reading configs and setting.
//!
//! The following config items can be set:
//!  - ConnectTimeout: Milliseconds to wait for the TCP connection. Defaults to 5000.
//!  - HandshakeTimeout: Milliseconds to wait for the protocol handshake to complete.
//!    Defaults to 5000.
//!  - SyncCallTimeout: Milliseconds a blocking call waits for its response. Defaults to
//!    10000.
//!  - MaxStringLength: Number of characters of a string value the VM should send before
//!    truncating it. Defaults to 10000.
//!  - BacktraceFrames: Number of frames requested for a backtrace. Defaults to 100.

use std::collections::HashMap;
use std::time::Duration;

use log::warn;

lazy_static! {
    static ref DEFAULTS: HashMap<&'static str, i64> = {
        let mut m = HashMap::new();
        m.insert("ConnectTimeout", 5000);
        m.insert("HandshakeTimeout", 5000);
        m.insert("SyncCallTimeout", 10000);
        m.insert("MaxStringLength", 10000);
        m.insert("BacktraceFrames", 100);
        m
    };
}

/// Settings owned by one debug session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    items: HashMap<&'static str, i64>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            items: DEFAULTS.clone(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }

    /// Get a config items value
    pub fn get_config(&self, cfg: &str) -> Option<i64> {
        self.items.get(cfg).copied()
    }

    /// Set a config items value to an integer, returns false when the item doesn't exist
    pub fn set_config(&mut self, cfg: &str, value: i64) -> bool {
        match self.items.get_mut(cfg) {
            Some(s) => {
                *s = value;
                true
            }
            None => {
                warn!("Couldn't set unfound config item: {}", cfg);
                false
            }
        }
    }

    /// Get a config item holding milliseconds as a `Duration`
    pub fn duration(&self, cfg: &str) -> Duration {
        let millis = self
            .get_config(cfg)
            .or_else(|| DEFAULTS.get(cfg).copied())
            .unwrap_or(0);
        Duration::from_millis(millis.max(0) as u64)
    }

    pub fn connect_timeout(&self) -> Duration {
        self.duration("ConnectTimeout")
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.duration("HandshakeTimeout")
    }

    pub fn sync_call_timeout(&self) -> Duration {
        self.duration("SyncCallTimeout")
    }

    pub fn max_string_length(&self) -> i64 {
        self.get_config("MaxStringLength").unwrap_or(10000)
    }

    pub fn backtrace_frames(&self) -> i64 {
        self.get_config("BacktraceFrames").unwrap_or(100)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Config;

    #[test]
    fn check_set_and_get_config_item() {
        let mut config = Config::new();
        assert_eq!(config.get_config("MaxStringLength"), Some(10000));
        assert!(config.set_config("MaxStringLength", 80));
        assert_eq!(config.get_config("MaxStringLength"), Some(80));
        assert_eq!(config.max_string_length(), 80);
    }

    #[test]
    fn check_get_non_existent_config_item() {
        let mut config = Config::new();
        assert_eq!(config.get_config("NotExists"), None);
        assert!(!config.set_config("NotExists", 1));
    }

    #[test]
    fn check_configs_are_independent() {
        let mut first = Config::new();
        let second = Config::new();
        first.set_config("ConnectTimeout", 250);
        assert_eq!(first.connect_timeout(), Duration::from_millis(250));
        assert_eq!(second.connect_timeout(), Duration::from_millis(5000));
    }
}
