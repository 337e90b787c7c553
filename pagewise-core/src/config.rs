use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::sync::RetryPolicy;

// ---------------------------------------------------------------------------
// ConfigFile: deserialized from TOML, every field optional
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub nav_timeout_ms: Option<u64>,
    pub engine_timeout_ms: Option<u64>,
    pub render_timeout_ms: Option<u64>,
    pub save_attempts: Option<u32>,
    pub save_backoff_ms: Option<u64>,
    pub autosave_secs: Option<u64>,
    pub unload_flush_ms: Option<u64>,
    pub reconcile_tolerance: Option<u32>,
    pub excerpt_limit: Option<usize>,
    pub min_selection_px: Option<f64>,
    pub swipe_min_distance: Option<f64>,
    pub swipe_max_ms: Option<u64>,
    pub blank_ratio: Option<f64>,
}

// ---------------------------------------------------------------------------
// ReaderConfig: resolved, every field concrete
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Upper bound for a whole page turn, fallback included.
    pub nav_timeout: Duration,
    /// Race window for a single reflowable engine call.
    pub engine_timeout: Duration,
    /// Race window for a fixed-layout render.
    pub render_timeout: Duration,
    pub save_attempts: u32,
    pub save_backoff: Duration,
    pub autosave_interval: Duration,
    pub unload_flush: Duration,
    /// Pages of divergence tolerated before reconciliation corrects a side.
    pub reconcile_tolerance: u32,
    pub excerpt_limit: usize,
    pub min_selection_px: f64,
    pub swipe_min_distance: f64,
    pub swipe_max_duration: Duration,
    pub blank_ratio: f64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        ConfigFile::default().resolve()
    }
}

impl ReaderConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.save_attempts,
            backoff: self.save_backoff,
        }
    }
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        let file = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {:?}", path))?;
        debug!(path = %path.display(), "config: loaded");
        Ok(file)
    }

    /// Loads the file when it exists, otherwise starts from defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) if path.exists() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }

    /// Merge CLI values (overwrites non-None fields).
    pub fn merge_cli(&mut self, autosave_secs: Option<u64>, reconcile_tolerance: Option<u32>) {
        if let Some(v) = autosave_secs {
            debug!("config: CLI override autosave_secs={v}");
            self.autosave_secs = Some(v);
        }
        if let Some(v) = reconcile_tolerance {
            debug!("config: CLI override reconcile_tolerance={v}");
            self.reconcile_tolerance = Some(v);
        }
    }

    /// Fills in defaults. The engine timeout is capped at a third of the
    /// navigation timeout, since a stalled reflowable turn spends up to two
    /// engine timeouts before its fallback can land.
    pub fn resolve(self) -> ReaderConfig {
        let nav_timeout = Duration::from_millis(self.nav_timeout_ms.unwrap_or(8_000));
        let mut engine_timeout = Duration::from_millis(self.engine_timeout_ms.unwrap_or(3_000));
        if engine_timeout * 2 >= nav_timeout {
            let capped = nav_timeout / 3;
            warn!(
                engine_timeout_ms = engine_timeout.as_millis() as u64,
                capped_ms = capped.as_millis() as u64,
                "config: engine timeout leaves no room for the fallback, capping"
            );
            engine_timeout = capped;
        }
        let config = ReaderConfig {
            nav_timeout,
            engine_timeout,
            render_timeout: Duration::from_millis(self.render_timeout_ms.unwrap_or(5_000)),
            save_attempts: self.save_attempts.unwrap_or(3).max(1),
            save_backoff: Duration::from_millis(self.save_backoff_ms.unwrap_or(1_000)),
            autosave_interval: Duration::from_secs(self.autosave_secs.unwrap_or(20).max(1)),
            unload_flush: Duration::from_millis(self.unload_flush_ms.unwrap_or(1_500)),
            reconcile_tolerance: self.reconcile_tolerance.unwrap_or(1),
            excerpt_limit: self.excerpt_limit.unwrap_or(400).max(1),
            min_selection_px: self.min_selection_px.unwrap_or(2.0),
            swipe_min_distance: self.swipe_min_distance.unwrap_or(50.0),
            swipe_max_duration: Duration::from_millis(self.swipe_max_ms.unwrap_or(600)),
            blank_ratio: self.blank_ratio.unwrap_or(0.995).clamp(0.5, 1.0),
        };
        info!(
            nav_timeout_ms = config.nav_timeout.as_millis() as u64,
            engine_timeout_ms = config.engine_timeout.as_millis() as u64,
            save_attempts = config.save_attempts,
            autosave_secs = config.autosave_interval.as_secs(),
            reconcile_tolerance = config.reconcile_tolerance,
            "config: resolved"
        );
        config
    }
}

/// Default location of `config.toml` for the current platform.
pub fn config_path() -> Option<PathBuf> {
    ProjectDirs::from("net", "pagewise", "pagewise").map(|dirs| dirs.config_dir().join("config.toml"))
}
