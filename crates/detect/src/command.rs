use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use crate::{Detection, Detector, DetectorConfig, DetectorError, RawDetection};

/// Runs an external detector program once per image.
///
/// The program is called as `<program> [args..] --model <model> --confidence
/// <threshold> <image>` and must print a JSON array of
/// `{"box": [x1, y1, x2, y2], "class": <model class>, "confidence": <score>}`
/// on stdout.
#[derive(Debug, Clone)]
pub struct CommandDetector {
    program: PathBuf,
    args: Vec<String>,
    config: DetectorConfig,
}

impl CommandDetector {
    /// Resolves `program` on `PATH` (or as a path). Fails with
    /// [`DetectorError::Unavailable`] when it cannot be found or the config
    /// maps no classes at all.
    pub fn locate(program: &str, args: Vec<String>, config: DetectorConfig) -> Result<Self, DetectorError> {
        let program = which::which(program).map_err(|e| DetectorError::Unavailable(format!("{program}: {e}")))?;
        if config.class_map.is_empty() {
            return Err(DetectorError::Unavailable("detector class map is empty".into()));
        }
        Ok(Self { program, args, config })
    }

    pub fn program(&self) -> &Path { &self.program }

    pub fn config(&self) -> &DetectorConfig { &self.config }
}

impl Detector for CommandDetector {
    fn detect(&self, image: &Path) -> Result<Vec<Detection>, DetectorError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg("--model")
            .arg(&self.config.model)
            .arg("--confidence")
            .arg(self.config.confidence.to_string())
            .arg(image)
            .output()
            .map_err(|e| DetectorError::Failed(format!("{}: {e}", self.program.display())))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DetectorError::Failed(format!("{} ({})", stderr.trim(), output.status)));
        }
        let raw: Vec<RawDetection> = serde_json::from_slice(&output.stdout)?;
        debug!(image = %image.display(), raw = raw.len(), "detector finished");
        Ok(self.config.remap(raw))
    }
}
