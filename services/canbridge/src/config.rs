//! Service configuration
//!
//! Layered with figment, lowest priority first:
//! built-in defaults, the YAML file, `CANBRIDGE_` environment variables
//! (`__` separates nested keys, e.g. `CANBRIDGE_LIFT__RATE_HZ=50`).
//! Command-line overrides are applied by the binary on top.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::bridge::BridgeTiming;
use crate::can::CanId;
use crate::error::{BridgeError, Result};
use crate::lift::{LiftTransmitter, DEFAULT_LIFT_ID, LIFT_FRAME_RATE_HZ};

/// Config file used when `--config` is not given
pub const DEFAULT_CONFIG_PATH: &str = "config/canbridge.yaml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "CANBRIDGE_";

/// Complete service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub interfaces: InterfacesConfig,
    pub bridge: BridgeLoopConfig,
    pub lift: LiftConfig,
    pub control: ControlConfig,
    pub filter: FilterConfig,
    pub logging: LoggingConfig,
}

/// Bridged interfaces and their link settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfacesConfig {
    pub side_a: String,
    pub side_b: String,
    pub bitrate: u32,
    pub txqueuelen: u32,
    /// Bring interfaces up/down with `ip link`
    pub manage: bool,
    pub use_sudo: bool,
}

impl Default for InterfacesConfig {
    fn default() -> Self {
        Self {
            side_a: "can0".to_string(),
            side_b: "can1".to_string(),
            bitrate: 250_000,
            txqueuelen: 10_000,
            manage: true,
            use_sudo: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeLoopConfig {
    pub pause_throttle_ms: u64,
    pub idle_poll_ms: u64,
}

impl Default for BridgeLoopConfig {
    fn default() -> Self {
        Self {
            pause_throttle_ms: 10,
            idle_poll_ms: 1,
        }
    }
}

impl BridgeLoopConfig {
    pub fn timing(&self) -> BridgeTiming {
        BridgeTiming {
            pause_throttle: Duration::from_millis(self.pause_throttle_ms),
            idle_poll: Duration::from_millis(self.idle_poll_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiftConfig {
    pub arbitration_id: CanId,
    /// Interface the lift frames are written to
    pub interface: String,
    pub rate_hz: f64,
    /// How long the lift id stays blocked after `LIFT_UP`/`LIFT_DOWN`
    pub block_window_ms: u64,
}

impl Default for LiftConfig {
    fn default() -> Self {
        Self {
            arbitration_id: DEFAULT_LIFT_ID,
            interface: "can0".to_string(),
            rate_hz: LIFT_FRAME_RATE_HZ,
            block_window_ms: 0,
        }
    }
}

impl LiftConfig {
    pub fn block_window(&self) -> Duration {
        Duration::from_millis(self.block_window_ms)
    }

    /// Emission period for `rate_hz`; errors when the rate is out of range
    pub fn period(&self) -> Result<Duration> {
        LiftTransmitter::period_for_rate(self.rate_hz)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Accept control connections over TCP
    pub enabled: bool,
    pub listen: SocketAddr,
    /// Read commands from stdin
    pub interactive: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: SocketAddr::from(([127, 0, 0, 1], 7878)),
            interactive: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Identifiers blocked at startup
    pub blocked: Vec<CanId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Directory for daily-rolling log files; console only when unset
    pub dir: Option<PathBuf>,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            json: false,
        }
    }
}

impl BridgeConfig {
    /// Build the layered figment.
    ///
    /// An explicit `path` must exist; the default path is optional.
    pub fn figment(path: Option<&Path>) -> Result<Figment> {
        let file = match path {
            Some(p) if !p.exists() => {
                return Err(BridgeError::ConfigError(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            },
            Some(p) => p.to_path_buf(),
            None => PathBuf::from(DEFAULT_CONFIG_PATH),
        };

        Ok(Figment::new()
            .merge(Serialized::defaults(BridgeConfig::default()))
            .merge(Yaml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Load and validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: BridgeConfig = Self::figment(path)?.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let ifaces = &self.interfaces;
        if ifaces.side_a.is_empty() || ifaces.side_b.is_empty() {
            return Err(BridgeError::ConfigError(
                "Interface names cannot be empty".to_string(),
            ));
        }
        if ifaces.side_a == ifaces.side_b {
            return Err(BridgeError::ConfigError(format!(
                "side_a and side_b must differ (both are {})",
                ifaces.side_a
            )));
        }
        if ifaces.bitrate == 0 {
            return Err(BridgeError::ConfigError("Bitrate must be > 0".to_string()));
        }

        if self.bridge.pause_throttle_ms == 0 || self.bridge.idle_poll_ms == 0 {
            return Err(BridgeError::ConfigError(
                "Bridge intervals must be > 0 ms".to_string(),
            ));
        }

        self.lift.period()?;
        if self.lift.interface.is_empty() {
            return Err(BridgeError::ConfigError(
                "Lift interface cannot be empty".to_string(),
            ));
        }

        if self.logging.level.trim().is_empty() {
            return Err(BridgeError::ConfigError(
                "Log level cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}
