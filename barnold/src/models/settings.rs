use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};
use tracing::warn;

const SETTINGS_PATH: &str = "Barnold/";
const SETTINGS_FILE_NAME: &str = "SessionSettings.json";

/// User-tunable knobs for an interactive preview session, persisted as
/// JSON in the user's config directory. Missing or unreadable files fall
/// back to the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSetting {
    /// How long `stop()` waits for the worker before force-terminating it.
    pub join_timeout_ms: u64,
    /// First level of the progressive refinement ramp.
    pub initial_sampling_level: i32,
    /// Default final sampling quality; the options delta can retune it.
    pub aa_samples: i32,
}

impl Default for SessionSetting {
    fn default() -> Self {
        SessionSetting {
            join_timeout_ms: 5000,
            initial_sampling_level: -3,
            aa_samples: 4,
        }
    }
}

impl SessionSetting {
    fn get_config_path() -> Option<PathBuf> {
        let path = dirs::config_dir()?.join(SETTINGS_PATH);
        if let Err(e) = fs::create_dir_all(&path) {
            warn!("Unable to create config directory: {e}");
            return None;
        }
        Some(path.join(SETTINGS_FILE_NAME))
    }

    /// Save the configuration to the user's config directory.
    pub fn save(&self) {
        let Some(path) = Self::get_config_path() else {
            return;
        };
        match serde_json::to_string(self) {
            Ok(data) => {
                if let Err(e) = fs::write(path, data) {
                    warn!("Unable to write session settings: {e}");
                }
            }
            Err(e) => warn!("Unable to serialize session settings: {e}"),
        }
    }

    /// Load the configuration, creating a default file on first run.
    pub fn load() -> SessionSetting {
        let Some(path) = Self::get_config_path() else {
            return SessionSetting::default();
        };
        match fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str(&data) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!("Unable to parse session settings, using defaults: {e}");
                    SessionSetting::default()
                }
            },
            Err(_) => {
                let data = SessionSetting::default();
                data.save();
                data
            }
        }
    }
}
