// ============================================================================
// COMPOSITOR SETTINGS — persisted as simple key=value lines
// ============================================================================

use std::path::{Path, PathBuf};

use crate::canvas::ResampleFilter;

/// User-tunable compositing options.
#[derive(Clone, Debug, PartialEq)]
pub struct CompositorSettings {
    /// Edge length in pixels of one checkerboard square.
    pub checker_size: u32,
    /// Checker color at (0, 0), as B,G,R.
    pub checker_light: [u8; 3],
    pub checker_dark: [u8; 3],
    /// Checkerboard brightness multiplier (1.0 = default, 0.5 = darker, 1.5 = lighter)
    pub checkerboard_brightness: f32,
    /// Filter used when a layer's buffer does not match the canvas size.
    pub resample_filter: ResampleFilter,
}

impl Default for CompositorSettings {
    fn default() -> Self {
        Self {
            checker_size: 20,
            checker_light: [255, 255, 255],
            checker_dark: [204, 204, 204],
            checkerboard_brightness: 1.0,
            resample_filter: ResampleFilter::Bicubic,
        }
    }
}

impl CompositorSettings {
    /// Checker colors with the brightness multiplier applied.
    pub fn checker_colors(&self) -> ([u8; 3], [u8; 3]) {
        let k = if self.checkerboard_brightness.is_finite() {
            self.checkerboard_brightness.max(0.0)
        } else {
            1.0
        };
        let scale = |c: [u8; 3]| c.map(|v| (v as f32 * k).round().clamp(0.0, 255.0) as u8);
        (scale(self.checker_light), scale(self.checker_dark))
    }

    /// Serialize to config string
    pub fn to_config_string(&self) -> String {
        format!(
            "checker_size={}\n\
             checker_light={}\n\
             checker_dark={}\n\
             checkerboard_brightness={}\n\
             resample_filter={}\n",
            self.checker_size,
            Self::color_to_str(self.checker_light),
            Self::color_to_str(self.checker_dark),
            self.checkerboard_brightness,
            self.resample_filter.name(),
        )
    }

    /// Deserialize from config string. Unknown keys are ignored and
    /// unparseable values keep their defaults.
    pub fn from_config_string(s: &str) -> Self {
        let mut settings = Self::default();
        for line in s.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, val)) = line.split_once('=') else {
                continue;
            };
            let val = val.trim();
            match key.trim() {
                "checker_size" => {
                    if let Ok(v) = val.parse::<u32>()
                        && v > 0
                    {
                        settings.checker_size = v;
                    }
                }
                "checker_light" => {
                    if let Some(c) = Self::str_to_color(val) { settings.checker_light = c; }
                }
                "checker_dark" => {
                    if let Some(c) = Self::str_to_color(val) { settings.checker_dark = c; }
                }
                "checkerboard_brightness" => {
                    settings.checkerboard_brightness = val.parse().unwrap_or(1.0);
                }
                "resample_filter" => {
                    if let Some(f) = ResampleFilter::from_name(val) {
                        settings.resample_filter = f;
                    }
                }
                _ => {}
            }
        }
        settings
    }

    /// Settings file location:
    ///   Windows:  `%APPDATA%\LayerFE\layerfe_settings.cfg`
    ///   macOS:    `~/Library/Application Support/LayerFE/layerfe_settings.cfg`
    ///   Linux:    `~/.config/layerfe/layerfe_settings.cfg`  (XDG_CONFIG_HOME respected)
    pub fn settings_path() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            let appdata = std::env::var("APPDATA").ok()?;
            return Some(PathBuf::from(appdata).join("LayerFE").join("layerfe_settings.cfg"));
        }
        #[cfg(target_os = "macos")]
        {
            let home = std::env::var("HOME").ok()?;
            return Some(
                PathBuf::from(home)
                    .join("Library")
                    .join("Application Support")
                    .join("LayerFE")
                    .join("layerfe_settings.cfg"),
            );
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        {
            let config_dir = std::env::var("XDG_CONFIG_HOME")
                .map(PathBuf::from)
                .or_else(|_| std::env::var("HOME").map(|home| PathBuf::from(home).join(".config")))
                .ok()?;
            Some(config_dir.join("layerfe").join("layerfe_settings.cfg"))
        }
    }

    /// Load settings from the default location, falling back to defaults.
    pub fn load() -> Self {
        match Self::settings_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load from an explicit file; a missing or unreadable file yields defaults.
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(s) => Self::from_config_string(&s),
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    crate::log_warn!("Could not read settings {}: {}", path.display(), e);
                }
                Self::default()
            }
        }
    }

    pub fn save(&self) -> std::io::Result<()> {
        match Self::settings_path() {
            Some(path) => self.save_to(&path),
            None => Ok(()),
        }
    }

    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_config_string())
    }

    fn color_to_str(c: [u8; 3]) -> String {
        format!("{},{},{}", c[0], c[1], c[2])
    }

    fn str_to_color(s: &str) -> Option<[u8; 3]> {
        let mut parts = s.split(',').map(|p| p.trim().parse::<u8>());
        let c = [parts.next()?.ok()?, parts.next()?.ok()?, parts.next()?.ok()?];
        if parts.next().is_some() {
            return None;
        }
        Some(c)
    }
}
