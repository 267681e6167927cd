use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bands::BandTable;
use crate::geofence::AlertConfig;
use crate::window::WindowConfig;
use crate::RmError;

/// Everything tunable in the pipeline. Missing sections fall back to defaults.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub window: WindowConfig,
    pub bands: BandTable,
    pub alerts: AlertConfig,
}

impl PipelineConfig {
    pub fn from_json_str(text: &str) -> Result<Self, RmError> {
        let config: PipelineConfig =
            serde_json::from_str(text).map_err(|e| RmError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, RmError> {
        let text = fs::read_to_string(path)
            .map_err(|e| RmError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config = Self::from_json_str(&text)
            .map_err(|e| RmError::Config(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), bands = config.bands.iter().count(), "configuration loaded");
        Ok(config)
    }

    /// Load `path` when given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, RmError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), RmError> {
        self.window.validate()?;
        self.bands.validate()?;
        self.alerts.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_documents_keep_defaults() {
        let config = PipelineConfig::from_json_str(
            r#"{ "window": { "micMax": 60.0 }, "alerts": { "cooldownMs": 30000 } }"#,
        )
        .unwrap();
        assert_eq!(config.window.mic_max, 60.0);
        assert_eq!(config.window.mic_min, 0.0);
        assert_eq!(config.alerts.cooldown_ms, 30_000);
        assert_eq!(config.alerts.batch_delay_ms, 100);
        assert_eq!(config.bands, BandTable::default());
    }

    #[test]
    fn invalid_sections_are_rejected() {
        assert!(matches!(
            PipelineConfig::from_json_str(r#"{ "window": { "micMin": 10, "micMax": 10 } }"#),
            Err(RmError::Config(_))
        ));
        assert!(matches!(
            PipelineConfig::from_json_str(r#"{ "bands": [{ "name": "x", "above": 3, "upTo": 1 }] }"#),
            Err(RmError::Config(_))
        ));
        assert!(PipelineConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{ "alerts": {{ "defaultRadiusM": 25.0 }} }}"#).unwrap();
        let config = PipelineConfig::load_or_default(Some(file.path())).unwrap();
        assert_eq!(config.alerts.default_radius_m, 25.0);
        assert_eq!(
            PipelineConfig::load_or_default(None).unwrap(),
            PipelineConfig::default()
        );
        assert!(PipelineConfig::load(Path::new("/nonexistent/ride_map.json")).is_err());
    }
}
