//! Daemon configuration, loaded from `$XDG_CONFIG_HOME/yktouch/config.toml`.
//!
//! Every debounce and timeout below is a heuristic tuned against real
//! hardware timing; the defaults are the values that shipped, not values
//! anyone proved optimal.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub detect: DetectConfig,
    #[serde(default)]
    pub timing: TimingConfig,
}

/// Per-backend detector toggles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectConfig {
    #[serde(default = "enabled")]
    pub gpg: bool,
    #[serde(default = "enabled")]
    pub ssh: bool,
    #[serde(default = "enabled")]
    pub u2f: bool,
    #[serde(default = "enabled")]
    pub hmac: bool,
    /// Proxy the gpg-agent socket itself, triggering on decrypt operations.
    /// Off by default — the key-file watcher already covers the common case.
    #[serde(default)]
    pub gpg_agent_proxy: bool,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            gpg: true,
            ssh: true,
            u2f: true,
            hmac: true,
            gpg_agent_proxy: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Grace period after a device node appears before its metadata is
    /// queryable.
    #[serde(default = "default_device_settle_ms")]
    pub device_settle_ms: u64,
    /// Quiet period after a device removal before publishing the new
    /// aggregate presence state.
    #[serde(default = "default_hmac_remove_debounce_ms")]
    pub hmac_remove_debounce_ms: u64,
    /// U2F OFF window while the last published state was OFF.
    #[serde(default = "default_u2f_idle_off_ms")]
    pub u2f_idle_off_ms: u64,
    /// U2F OFF window while the last published state was ON; must bridge
    /// the gap between consecutive keep-alives during one touch wait.
    #[serde(default = "default_u2f_active_off_ms")]
    pub u2f_active_off_ms: u64,
    /// Delay between a check trigger and the agent probe, giving the
    /// backend time to start talking to the token.
    #[serde(default = "default_gpg_check_delay_ms")]
    pub gpg_check_delay_ms: u64,
    /// How long the agent probe may run before we conclude the agent is
    /// blocked waiting on a touch.
    #[serde(default = "default_gpg_probe_timeout_ms")]
    pub gpg_probe_timeout_ms: u64,
    /// Cool-down before re-establishing a watch after the watched file was
    /// deleted or atomically replaced.
    #[serde(default = "default_watch_rearm_delay_ms")]
    pub watch_rearm_delay_ms: u64,
}

impl TimingConfig {
    pub fn device_settle(&self) -> Duration {
        Duration::from_millis(self.device_settle_ms)
    }

    pub fn hmac_remove_debounce(&self) -> Duration {
        Duration::from_millis(self.hmac_remove_debounce_ms)
    }

    pub fn u2f_idle_off(&self) -> Duration {
        Duration::from_millis(self.u2f_idle_off_ms)
    }

    pub fn u2f_active_off(&self) -> Duration {
        Duration::from_millis(self.u2f_active_off_ms)
    }

    pub fn gpg_check_delay(&self) -> Duration {
        Duration::from_millis(self.gpg_check_delay_ms)
    }

    pub fn gpg_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.gpg_probe_timeout_ms)
    }

    pub fn watch_rearm_delay(&self) -> Duration {
        Duration::from_millis(self.watch_rearm_delay_ms)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            device_settle_ms: default_device_settle_ms(),
            hmac_remove_debounce_ms: default_hmac_remove_debounce_ms(),
            u2f_idle_off_ms: default_u2f_idle_off_ms(),
            u2f_active_off_ms: default_u2f_active_off_ms(),
            gpg_check_delay_ms: default_gpg_check_delay_ms(),
            gpg_probe_timeout_ms: default_gpg_probe_timeout_ms(),
            watch_rearm_delay_ms: default_watch_rearm_delay_ms(),
        }
    }
}

fn enabled() -> bool {
    true
}

fn default_device_settle_ms() -> u64 {
    1000
}

fn default_hmac_remove_debounce_ms() -> u64 {
    1000
}

fn default_u2f_idle_off_ms() -> u64 {
    200
}

fn default_u2f_active_off_ms() -> u64 {
    2000
}

fn default_gpg_check_delay_ms() -> u64 {
    50
}

fn default_gpg_probe_timeout_ms() -> u64 {
    400
}

fn default_watch_rearm_delay_ms() -> u64 {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("").expect("empty config parses");
        assert!(config.detect.gpg);
        assert!(config.detect.ssh);
        assert!(!config.detect.gpg_agent_proxy);
        assert_eq!(config.timing.u2f_idle_off(), Duration::from_millis(200));
        assert_eq!(config.timing.u2f_active_off(), Duration::from_millis(2000));
        assert_eq!(config.timing.gpg_probe_timeout(), Duration::from_millis(400));
    }

    #[test]
    fn partial_override_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [detect]
            ssh = false

            [timing]
            hmac_remove_debounce_ms = 250
            "#,
        )
        .expect("config parses");
        assert!(!config.detect.ssh);
        assert!(config.detect.hmac);
        assert_eq!(
            config.timing.hmac_remove_debounce(),
            Duration::from_millis(250)
        );
        assert_eq!(config.timing.device_settle(), Duration::from_millis(1000));
    }
}
