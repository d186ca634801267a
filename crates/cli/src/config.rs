use anyhow::{Context, Result};
use detect::{DetectorConfig, MergeConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub merge: MergeConfig,
    pub detector: Option<DetectorSection>,
    /// `name,id` class table used to print and parse class names.
    pub class_table: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorSection {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    /// Detector class id to annotation class id.
    #[serde(default)]
    pub class_map: BTreeMap<i64, i64>,
}

fn default_confidence() -> f32 { DetectorConfig::default().confidence }

impl DetectorSection {
    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig { model: self.model.clone(), confidence: self.confidence, class_map: self.class_map.clone() }
    }
}

pub fn default_path() -> Option<PathBuf> { dirs::config_dir().map(|d| d.join("trackmark").join("config.json")) }

impl AppConfig {
    /// Loads `explicit` if given, else the per-user config file if there is
    /// one, else the defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        match default_path() {
            Some(path) if path.is_file() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        let config = serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?;
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }
}
