use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::model::{normalize_name, Coordinates, Target};
use crate::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub location_id: String,
    pub name: String,
    /// Overrides the slug derived from `name` when the source spells it differently.
    pub normalized_name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl TargetConfig {
    #[must_use]
    pub fn to_target(&self) -> Target {
        Target {
            location_id: self.location_id.trim().to_string(),
            display_name: self.name.trim().to_string(),
            normalized_name: self
                .normalized_name
                .clone()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| normalize_name(&self.name)),
            coordinates: match (self.latitude, self.longitude) {
                (Some(lat), Some(lon)) => Some(Coordinates::new(lat, lon)),
                _ => None,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TargetsFile {
    pub targets: Vec<TargetConfig>,
}

/// Load and validate the target list from a YAML file.
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed, or fails validation.
pub fn load_targets(path: &Path) -> Result<Vec<Target>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::TargetsFileIo {
        path: path.display().to_string(),
        source: e,
    })?;
    parse_targets(&content)
}

/// Parse and validate a target list from YAML text.
///
/// # Errors
///
/// Returns `ConfigError` if the text does not parse or fails validation.
pub fn parse_targets(content: &str) -> Result<Vec<Target>, ConfigError> {
    let targets_file: TargetsFile =
        serde_yaml::from_str(content).map_err(ConfigError::TargetsFileParse)?;

    validate_targets(&targets_file)?;

    Ok(targets_file
        .targets
        .iter()
        .map(TargetConfig::to_target)
        .collect())
}

fn validate_targets(targets_file: &TargetsFile) -> Result<(), ConfigError> {
    let mut seen_ids = HashSet::new();

    for target in &targets_file.targets {
        let id = target.location_id.trim();
        if id.is_empty() {
            return Err(ConfigError::Validation(format!(
                "target '{}' has an empty location_id",
                target.name
            )));
        }

        if target.name.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "target {id} has an empty name"
            )));
        }

        if !seen_ids.insert(id.to_string()) {
            return Err(ConfigError::Validation(format!(
                "duplicate location_id: '{id}'"
            )));
        }

        match (target.latitude, target.longitude) {
            (Some(lat), Some(lon)) => {
                if !Coordinates::new(lat, lon).is_valid() {
                    return Err(ConfigError::Validation(format!(
                        "target {id} has out-of-range coordinates ({lat}, {lon})"
                    )));
                }
            }
            (None, None) => {}
            _ => {
                return Err(ConfigError::Validation(format!(
                    "target {id} must set both latitude and longitude or neither"
                )));
            }
        }
    }

    Ok(())
}
