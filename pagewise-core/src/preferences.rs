use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::engine::ThemeParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
    Sepia,
}

impl Theme {
    pub fn next(self) -> Self {
        match self {
            Theme::Light => Theme::Dark,
            Theme::Dark => Theme::Sepia,
            Theme::Sepia => Theme::Light,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewMode {
    #[default]
    Single,
    Spread,
}

impl ViewMode {
    pub fn toggled(self) -> Self {
        match self {
            ViewMode::Single => ViewMode::Spread,
            ViewMode::Spread => ViewMode::Single,
        }
    }
}

/// Display preferences. Local only, no server copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderPreferences {
    pub theme: Theme,
    pub font_scale: f32,
    pub zoom: f32,
    pub view_mode: ViewMode,
}

impl Default for ReaderPreferences {
    fn default() -> Self {
        Self {
            theme: Theme::Light,
            font_scale: 1.0,
            zoom: 1.0,
            view_mode: ViewMode::Single,
        }
    }
}

impl ReaderPreferences {
    pub const MIN_ZOOM: f32 = 0.25;
    pub const MAX_ZOOM: f32 = 4.0;

    pub fn theme_params(&self) -> ThemeParams {
        ThemeParams {
            theme: self.theme,
            font_scale: self.font_scale,
        }
    }

    pub fn set_zoom(&mut self, zoom: f32) -> bool {
        let zoom = if zoom.is_finite() { zoom } else { 1.0 };
        let zoom = zoom.clamp(Self::MIN_ZOOM, Self::MAX_ZOOM);
        if (self.zoom - zoom).abs() > f32::EPSILON {
            self.zoom = zoom;
            true
        } else {
            false
        }
    }
}

pub trait PreferencesStore: Send + Sync {
    fn load(&self) -> Result<Option<ReaderPreferences>>;
    fn save(&self, preferences: &ReaderPreferences) -> Result<()>;
}

pub struct FilePreferencesStore {
    path: PathBuf,
}

impl FilePreferencesStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create preferences directory {:?}", parent))?;
        }
        Ok(Self { path })
    }
}

impl PreferencesStore for FilePreferencesStore {
    fn load(&self) -> Result<Option<ReaderPreferences>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read preferences {:?}", self.path))?;
        let preferences = serde_json::from_str(&raw)
            .with_context(|| format!("failed to decode preferences {:?}", self.path))?;
        Ok(Some(preferences))
    }

    fn save(&self, preferences: &ReaderPreferences) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let payload = serde_json::to_string_pretty(preferences)?;
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to open temp preferences file {:?}", tmp))?;
        file.write_all(payload.as_bytes())?;
        file.flush()?;
        fs::rename(tmp, &self.path)?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryPreferencesStore {
    inner: Mutex<Option<ReaderPreferences>>,
}

impl MemoryPreferencesStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferencesStore for MemoryPreferencesStore {
    fn load(&self) -> Result<Option<ReaderPreferences>> {
        Ok(self.inner.lock().clone())
    }

    fn save(&self, preferences: &ReaderPreferences) -> Result<()> {
        *self.inner.lock() = Some(preferences.clone());
        Ok(())
    }
}
