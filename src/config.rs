//! Application-level configuration: team palette, timing intervals and scoring defaults.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::{info, warn};

use crate::state::game::TeamColor;

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "LIVE_QUIZ_CONFIG_PATH";
/// Fallback color returned when the palette is exhausted.
const DEFAULT_COLOR: TeamColor = TeamColor {
    h: 0.0,
    s: 0.0,
    v: 1.0,
};

/// Intervals driving the authority's background tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Period of `timer:tick` broadcasts while a countdown runs.
    pub tick_interval: Duration,
    /// Interval at which team devices are expected to heartbeat.
    pub heartbeat_interval: Duration,
    /// Silence after which a team is reported offline.
    pub presence_timeout: Duration,
    /// Silence after which a device binding is released.
    pub idle_binding_timeout: Duration,
    /// Upper bound on a persisted write.
    pub command_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(5),
            presence_timeout: Duration::from_secs(15),
            idle_binding_timeout: Duration::from_secs(300),
            command_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    colors: Vec<TeamColor>,
    /// Background task intervals.
    pub timing: Timing,
    /// Points credited for a correct answer when the operator gives none.
    pub default_points: i32,
}

impl AppConfig {
    /// Load the application configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<RawConfig>(&contents) {
                Ok(raw) => {
                    let app_config: Self = raw.into();
                    info!(
                        path = %path.display(),
                        colors = app_config.colors.len(),
                        default_points = app_config.default_points,
                        "loaded configuration"
                    );
                    app_config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Return the first palette color not already listed in `used`.
    ///
    /// Once every entry is taken a neutral white is returned so callers always
    /// receive a value.
    pub fn first_unused_color(&self, used: &[TeamColor]) -> TeamColor {
        self.colors
            .iter()
            .find(|candidate| used.iter().all(|existing| existing != *candidate))
            .cloned()
            .unwrap_or(DEFAULT_COLOR)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            colors: default_colors(),
            timing: Timing::default(),
            default_points: DEFAULT_POINTS,
        }
    }
}

const DEFAULT_POINTS: i32 = 10;

#[derive(Debug, Deserialize)]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    #[serde(default)]
    colors: Option<Vec<RawColor>>,
    #[serde(default)]
    timing: RawTiming,
    #[serde(default)]
    default_points: Option<i32>,
}

/// Millisecond overrides of [`Timing`].
#[derive(Debug, Default, Deserialize)]
struct RawTiming {
    tick_interval_ms: Option<u64>,
    heartbeat_interval_ms: Option<u64>,
    presence_timeout_ms: Option<u64>,
    idle_binding_timeout_ms: Option<u64>,
    command_timeout_ms: Option<u64>,
}

impl From<RawTiming> for Timing {
    fn from(value: RawTiming) -> Self {
        let defaults = Timing::default();
        let pick = |raw: Option<u64>, fallback: Duration| {
            raw.filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };
        Self {
            tick_interval: pick(value.tick_interval_ms, defaults.tick_interval),
            heartbeat_interval: pick(value.heartbeat_interval_ms, defaults.heartbeat_interval),
            presence_timeout: pick(value.presence_timeout_ms, defaults.presence_timeout),
            idle_binding_timeout: pick(value.idle_binding_timeout_ms, defaults.idle_binding_timeout),
            command_timeout: pick(value.command_timeout_ms, defaults.command_timeout),
        }
    }
}

impl From<RawConfig> for AppConfig {
    fn from(value: RawConfig) -> Self {
        let colors = match value.colors {
            Some(colors) if !colors.is_empty() => colors.into_iter().map(Into::into).collect(),
            _ => default_colors(),
        };
        Self {
            colors,
            timing: value.timing.into(),
            default_points: value.default_points.unwrap_or(DEFAULT_POINTS),
        }
    }
}

#[derive(Debug, Deserialize)]
/// JSON representation of a single HSV entry inside the configuration file.
struct RawColor {
    hue: f32,
    saturation: f32,
    value: f32,
}

impl From<RawColor> for TeamColor {
    fn from(value: RawColor) -> Self {
        Self {
            h: value.hue,
            s: value.saturation,
            v: value.value,
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Hue and saturation of the built-in palette; the second round is paler.
const DEFAULT_PALETTE: [(f32, f32); 16] = [
    (0.0, 1.0),
    (120.0, 1.0),
    (240.0, 1.0),
    (45.0, 1.0),
    (180.0, 1.0),
    (300.0, 1.0),
    (90.0, 1.0),
    (210.0, 1.0),
    (20.0, 0.6),
    (140.0, 0.6),
    (260.0, 0.6),
    (60.0, 0.6),
    (190.0, 0.6),
    (320.0, 0.6),
    (100.0, 0.6),
    (230.0, 0.6),
];

fn default_colors() -> Vec<TeamColor> {
    DEFAULT_PALETTE
        .iter()
        .map(|&(h, s)| TeamColor { h, s, v: 1.0 })
        .collect()
}
