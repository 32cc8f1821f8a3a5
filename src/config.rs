//! Application settings.
//!
//! Settings are layered with figment: compiled-in defaults, then an optional
//! TOML file, then `SCOPE_DAQ_`-prefixed environment variables (nested keys
//! separated by `__`, e.g. `SCOPE_DAQ_CAMERA__POLL_INTERVAL=2ms`).
//!
//! ```toml
//! [camera]
//! channel_id = "camera1"
//! poll_interval = "5ms"
//! fault_threshold = 10
//! stop_timeout = "1s"
//!
//! [focus]
//! poll_interval = "20ms"
//! lock_gain = -1.75
//! z_center_um = 50.0
//! sum_threshold = 50.0
//!
//! [storage]
//! default_path = "./data"
//! ```

use crate::error::AppResult;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Camera acquisition loop settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CameraSettings {
    /// Channel identifier stamped on every frame.
    pub channel_id: String,
    /// Polling cadence of the acquisition loop, idle and active.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Consecutive poll failures tolerated before the loop gives up.
    pub fault_threshold: u32,
    /// How long `stop()` waits for the loop to acknowledge before erroring.
    #[serde(with = "humantime_serde")]
    pub stop_timeout: Duration,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            channel_id: "camera1".to_string(),
            poll_interval: Duration::from_millis(5),
            fault_threshold: 10,
            stop_timeout: Duration::from_secs(1),
        }
    }
}

/// Focus-lock loop settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FocusSettings {
    /// QPD sampling cadence.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Linear lock gain mapping QPD offset to a Z correction.
    pub lock_gain: f64,
    /// Objective Z position the lock corrects around, in micrometers.
    pub z_center_um: f64,
    /// Minimum QPD sum signal required to apply corrections.
    pub sum_threshold: f64,
    /// Consecutive read failures tolerated before the loop gives up.
    pub fault_threshold: u32,
    /// How long `stop_lock()` waits for acknowledgement before erroring.
    #[serde(with = "humantime_serde")]
    pub stop_timeout: Duration,
}

impl Default for FocusSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(20),
            lock_gain: -1.75,
            z_center_um: 50.0,
            sum_threshold: 50.0,
            fault_threshold: 10,
            stop_timeout: Duration::from_secs(1),
        }
    }
}

/// Film storage settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Directory films are written to when no explicit path is given.
    pub default_path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            default_path: PathBuf::from("./data"),
        }
    }
}

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Camera acquisition loop settings.
    pub camera: CameraSettings,
    /// Focus-lock loop settings.
    pub focus: FocusSettings,
    /// Film storage settings.
    pub storage: StorageSettings,
}

impl Settings {
    /// Loads settings from defaults, an optional TOML file and the
    /// environment, in increasing precedence.
    pub fn new(path: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let settings = figment
            .merge(Env::prefixed("SCOPE_DAQ_").split("__"))
            .extract()?;
        Ok(settings)
    }
}
