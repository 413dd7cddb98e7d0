//! User configuration and the validated settings snapshot
//!
//! The `[fix]` table can live in its own file or next to the `[[profile]]`
//! entries in `widefix.toml`. Anything missing or out of range falls back to a
//! sane default with a warning instead of failing the whole fix.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::transform::Resolution;

/// Resolution used when neither the config nor the display provides one.
pub const FALLBACK_RESOLUTION: (u32, u32) = (
    Resolution::FALLBACK.width(),
    Resolution::FALLBACK.height(),
);

/// Raw configuration as written by the user
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixConfig {
    pub fix: FixSection,
}

/// The `[fix]` table
///
/// Numbers are kept wide and signed so that out-of-range values can be
/// reported and replaced rather than rejected by the parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixSection {
    pub enabled: bool,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub fov_factor: Option<f64>,
}

impl Default for FixSection {
    fn default() -> Self {
        Self {
            enabled: true,
            width: None,
            height: None,
            fov_factor: None,
        }
    }
}

/// Values that take precedence over the file (command line, environment)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConfigOverrides {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fov_factor: Option<f32>,
}

impl FixConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from a TOML file
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load configuration, using defaults when the file doesn't exist
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        match Self::load_from_path(&path) {
            Ok(config) => Ok(config),
            Err(e) if e.is_not_found() => {
                warn!(
                    "Config file {} not found, using defaults",
                    path.as_ref().display()
                );
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(width) = overrides.width {
            self.fix.width = Some(width as i64);
        }
        if let Some(height) = overrides.height {
            self.fix.height = Some(height as i64);
        }
        if let Some(factor) = overrides.fov_factor {
            self.fix.fov_factor = Some(factor as f64);
        }
    }

    /// Validate into a [`Settings`] snapshot, filling gaps from `display`.
    pub fn resolve(&self, display: &dyn DisplayInfo) -> Settings {
        let section = &self.fix;

        let configured = match (section.width, section.height) {
            (Some(w), Some(h)) => match (positive_u32(w), positive_u32(h)) {
                (Some(w), Some(h)) => Some((w, h)),
                _ => {
                    warn!("Invalid resolution {}x{} in config, ignoring", w, h);
                    None
                }
            },
            (None, None) => None,
            _ => {
                warn!("Config sets only one of width/height, ignoring both");
                None
            }
        };

        let (width, height) = match configured {
            Some(size) => size,
            None => match display.primary_resolution() {
                Some((w, h)) if w > 0 && h > 0 => {
                    warn!("No resolution configured, using display resolution {}x{}", w, h);
                    (w, h)
                }
                _ => {
                    warn!(
                        "No resolution configured and display unavailable, using {}x{}",
                        FALLBACK_RESOLUTION.0, FALLBACK_RESOLUTION.1
                    );
                    FALLBACK_RESOLUTION
                }
            },
        };

        let fov_factor = match section.fov_factor {
            None => 1.0,
            Some(f) if f.is_finite() && f > 0.0 => f as f32,
            Some(f) => {
                warn!("Invalid fov_factor {} in config, using 1.0", f);
                1.0
            }
        };

        // Both dimensions are non-zero on every path above.
        let resolution = Resolution::new(width, height).unwrap_or(Resolution::FALLBACK);
        let settings = Settings {
            enabled: section.enabled,
            resolution,
            fov_factor,
        };
        info!(
            "Settings: {}x{} (aspect {:.6}), fov factor {}",
            width,
            height,
            settings.aspect_ratio(),
            fov_factor
        );
        settings
    }
}

fn positive_u32(value: i64) -> Option<u32> {
    u32::try_from(value).ok().filter(|v| *v > 0)
}

/// Immutable values every fix and hook callback reads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Settings {
    pub enabled: bool,
    pub resolution: Resolution,
    pub fov_factor: f32,
}

impl Settings {
    pub fn new(width: u32, height: u32, fov_factor: f32) -> Result<Self> {
        if !(fov_factor.is_finite() && fov_factor > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "fov_factor must be positive, got {}",
                fov_factor
            )));
        }
        Ok(Self {
            enabled: true,
            resolution: Resolution::new(width, height)?,
            fov_factor,
        })
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.resolution.aspect_ratio()
    }
}

/// Source of the primary display's resolution.
pub trait DisplayInfo {
    fn primary_resolution(&self) -> Option<(u32, u32)>;
}

/// No display available (file mode, headless tests).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDisplay;

impl DisplayInfo for NoDisplay {
    fn primary_resolution(&self) -> Option<(u32, u32)> {
        None
    }
}

/// Primary monitor via `GetSystemMetrics`.
#[cfg(target_os = "windows")]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDisplay;

#[cfg(target_os = "windows")]
impl DisplayInfo for SystemDisplay {
    fn primary_resolution(&self) -> Option<(u32, u32)> {
        use windows::Win32::UI::WindowsAndMessaging::{GetSystemMetrics, SM_CXSCREEN, SM_CYSCREEN};

        // SAFETY: GetSystemMetrics has no preconditions.
        let (w, h) = unsafe { (GetSystemMetrics(SM_CXSCREEN), GetSystemMetrics(SM_CYSCREEN)) };
        Some((positive_u32(w as i64)?, positive_u32(h as i64)?))
    }
}

/// Display provider for the current platform.
pub fn system_display() -> Box<dyn DisplayInfo + Send + Sync> {
    #[cfg(target_os = "windows")]
    {
        Box::new(SystemDisplay)
    }
    #[cfg(not(target_os = "windows"))]
    {
        Box::new(NoDisplay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    struct FixedDisplay(u32, u32);

    impl DisplayInfo for FixedDisplay {
        fn primary_resolution(&self) -> Option<(u32, u32)> {
            Some((self.0, self.1))
        }
    }

    #[test]
    fn test_full_config() {
        let config = FixConfig::from_toml_str(
            r#"
            [fix]
            enabled = true
            width = 2560
            height = 1080
            fov_factor = 1.1
            "#,
        )
        .unwrap();

        let settings = config.resolve(&NoDisplay);
        assert_eq!(settings.resolution, Resolution::new(2560, 1080).unwrap());
        assert!((settings.fov_factor - 1.1).abs() < 1e-6);
        assert!(settings.enabled);
    }

    #[test]
    fn test_missing_resolution_uses_display() {
        let config = FixConfig::from_toml_str("[fix]\nfov_factor = 1.0\n").unwrap();
        let settings = config.resolve(&FixedDisplay(3440, 1440));
        assert_eq!(settings.resolution.width(), 3440);
        assert_eq!(settings.resolution.height(), 1440);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = FixConfig::from_toml_str(
            r#"
            [fix]
            width = -1
            height = 1080
            fov_factor = 0.0
            "#,
        )
        .unwrap();

        let settings = config.resolve(&NoDisplay);
        assert_eq!(
            (settings.resolution.width(), settings.resolution.height()),
            FALLBACK_RESOLUTION
        );
        assert_eq!(settings.fov_factor, 1.0);
    }

    #[test]
    fn test_empty_config_is_enabled() {
        let config = FixConfig::from_toml_str("").unwrap();
        assert!(config.fix.enabled);
        assert_eq!(config.resolve(&NoDisplay).fov_factor, 1.0);
    }

    #[test]
    fn test_overrides_win() {
        let mut config = FixConfig::from_toml_str("[fix]\nwidth = 800\nheight = 600\n").unwrap();
        config.apply_overrides(&ConfigOverrides {
            width: Some(1600),
            height: Some(900),
            fov_factor: None,
        });
        let settings = config.resolve(&NoDisplay);
        assert_eq!(settings.resolution, Resolution::new(1600, 900).unwrap());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[fix]\nenabled = false\nwidth = 1280\nheight = 720").unwrap();

        let config = FixConfig::load_from_path(file.path()).unwrap();
        assert!(!config.fix.enabled);
        assert_eq!(config.fix.width, Some(1280));
    }

    #[test]
    fn test_missing_file_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = FixConfig::load_or_default(dir.path().join("widefix.toml")).unwrap();
        assert_eq!(config, FixConfig::default());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[fix\nwidth = ").unwrap();
        assert!(matches!(
            FixConfig::load_or_default(file.path()),
            Err(Error::Toml(_))
        ));
    }

    #[test]
    fn test_settings_validation() {
        assert!(Settings::new(1920, 1080, 0.0).is_err());
        assert!(Settings::new(0, 1080, 1.0).is_err());
        assert!(Settings::new(1920, 1080, 1.2).is_ok());
    }
}
