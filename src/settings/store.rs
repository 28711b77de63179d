use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

use crate::pipeline::error::{PipelineError, Result};
use crate::settings::types::CaptureSettings;

/// Capture settings backed by a JSON file.
pub struct SettingsStore {
    path: PathBuf,
    data: Mutex<CaptureSettings>,
}

fn settings_err(path: &Path, e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Settings(format!("{}: {e}", path.display()))
}

impl SettingsStore {
    /// Open the store at `path`, loading the file if it exists.
    pub fn open(path: PathBuf) -> Result<Self> {
        let data = Self::load(&path)?;
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    /// Load settings from a JSON file, returning defaults on a missing file.
    pub fn load(path: &Path) -> Result<CaptureSettings> {
        if !path.exists() {
            debug!("no settings at {}, using defaults", path.display());
            return Ok(CaptureSettings::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| settings_err(path, e))?;
        serde_json::from_str(&contents).map_err(|e| settings_err(path, e))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A copy of the current settings.
    pub fn get(&self) -> CaptureSettings {
        self.data.lock().clone()
    }

    /// Apply `f` to the in-memory settings. Call `save` to persist.
    pub fn update(&self, f: impl FnOnce(&mut CaptureSettings)) {
        f(&mut self.data.lock());
    }

    /// Save current settings to disk atomically (write .tmp then rename).
    pub fn save(&self) -> Result<()> {
        let data = self.get();
        let json =
            serde_json::to_string_pretty(&data).map_err(|e| settings_err(&self.path, e))?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| settings_err(parent, e))?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &json).map_err(|e| settings_err(&tmp_path, e))?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| settings_err(&self.path, e))?;
        debug!("saved settings to {}", self.path.display());
        Ok(())
    }
}
