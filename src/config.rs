//! Run configuration and per-stage overrides.
//!
//! Everything a component needs arrives through these values; there is no
//! ambient or class-level state anywhere in the crate.

use std::collections::BTreeMap;
use std::{fs, io, path::Path, path::PathBuf};

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

pub const ALLOWED_STAGES: &[&str] = &["PROD", "STAG", "DEV", "DEV-1", "DEV-2", "DEV-3"];

/// Stages that get production hardening (load balancer access logging;
/// CloudTrail sits on its own `PROD` check).
pub const PRODLIKE_STAGES: &[&str] = &["PROD", "STAG"];

pub const DEFAULT_DOMAIN: &str = "psyclone.pro";

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("File {0} not found")]
    FileNotFound(String),

    #[error("Parsing error: {0}")]
    ParsingError(String),

    #[error("Validation errors: {0}")]
    ValidationError(String),

    #[error("Region is required to deploy a load balancer")]
    MissingRegion,

    #[error("Unknown error occurred: {0}")]
    Unknown(String),
}

/// One run of the template composer, handed to [`crate::update::UpdateRun`].
#[derive(Debug, Clone, Validate)]
pub struct RunConfig {
    pub templates_path: PathBuf,
    pub policies_path: PathBuf,
    pub output_path: PathBuf,

    #[validate(custom = "validate_stage")]
    pub stage_name: String,

    #[validate(custom = "validate_label")]
    pub project_name: String,

    pub region: Option<String>,
    pub domain: String,
    pub load_balancer: bool,
}

impl RunConfig {
    /// Checks the field-level rules plus the cross-field one: a load
    /// balancer cannot be placed without knowing the region.
    pub fn validated(self) -> Result<Self, Error> {
        match self.validate() {
            Ok(_) => (),
            Err(error) => return Err(Error::ValidationError(error.to_string())),
        }
        if self.load_balancer && self.region.is_none() {
            return Err(Error::MissingRegion);
        }
        return Ok(self);
    }

    pub fn is_prod(&self) -> bool {
        self.stage_name.contains("PROD")
    }
}

fn validate_stage(stage_name: &str) -> Result<(), ValidationError> {
    if stage_name.trim().is_empty() {
        return Err(ValidationError::new("stage name must not be blank"));
    }
    if !ALLOWED_STAGES.contains(&stage_name) {
        return Err(ValidationError::new("stage name is not an allowed stage"));
    }
    return Ok(());
}

/// Labels end up in bucket and resource names, which reject most separators.
fn validate_label(label: &str) -> Result<(), ValidationError> {
    if label.trim().is_empty() {
        return Err(ValidationError::new("label must not be blank"));
    }
    if !label
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Err(ValidationError::new("label contains disallowed characters"));
    }
    return Ok(());
}

/// Instance sizing knobs a stage may pin, applied by the update run instead
/// of the old pattern of mutating shared class state before instantiation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct StageOverrides {
    #[validate(length(min = 1))]
    pub worker_instance_type: Option<String>,

    #[validate(length(min = 1))]
    pub rds_instance_type: Option<String>,

    #[validate(length(min = 1))]
    pub max_spot_price: Option<String>,
}

type StageOverridesFile = BTreeMap<String, StageOverrides>;

/// Parses a stage-name -> overrides YAML file and returns the entry for the
/// given stage, defaulting to no overrides when the stage has none.
pub fn parse_stage_overrides(path: &Path, stage_name: &str) -> Result<StageOverrides, Error> {
    let contents = match fs::read_to_string(path) {
        Ok(raw_contents) => Ok(raw_contents),
        Err(error) => match error.kind() {
            io::ErrorKind::NotFound => Err(Error::FileNotFound(path.display().to_string())),
            _ => Err(Error::Unknown(error.to_string())),
        },
    }?;

    let mut parsed: StageOverridesFile = match serde_yaml::from_str(&contents) {
        Ok(data) => Ok(data),
        Err(error) => Err(Error::ParsingError(error.to_string())),
    }?;

    for overrides in parsed.values() {
        match overrides.validate() {
            Ok(_) => (),
            Err(error) => return Err(Error::ValidationError(error.to_string())),
        }
    }

    return Ok(parsed.remove(stage_name).unwrap_or_default());
}
