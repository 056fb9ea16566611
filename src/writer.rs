//! Serializes the mutated templates back to disk and optionally submits
//! each one to the CloudFormation validation endpoint.

use std::fs;
use std::path::{Path, PathBuf};

use aws_config::meta::region::RegionProviderChain;
use aws_sdk_cloudformation::Region;
use tracing::{info, warn};

use crate::document;
use crate::loader::{LogicalTemplate, TemplateSet};

/// The validation service rejects bodies of 51200 bytes or more, so those
/// are skipped instead of submitted.
pub const VALIDATION_SIZE_LIMIT: usize = 51200;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Failed to write {path}: {message}")]
    Io { path: String, message: String },

    #[error(transparent)]
    SerializationError(#[from] document::Error),

    #[error("Template `{name}` failed validation: {message}")]
    InvalidTemplate { name: String, message: String },

    #[error("Unknown error ocurred: {0}.")]
    UnknownError(String),
}

/// One serialized template, kept around so validation reuses the exact bytes
/// written to disk.
pub struct WrittenTemplate {
    pub template: LogicalTemplate,
    pub path: PathBuf,
    pub body: String,
}

/// Writes every logical template to `<output>/turbine-<name>.template`.
pub fn save_templates(
    templates: &TemplateSet,
    output_path: &Path,
) -> Result<Vec<WrittenTemplate>, Error> {
    let mut written = Vec::with_capacity(LogicalTemplate::ALL.len());
    for (template, document) in templates.iter() {
        let body = document.to_yaml_string()?;
        let path = output_path.join(template.file_name());
        fs::write(&path, &body).map_err(|error| Error::Io {
            path: path.display().to_string(),
            message: error.to_string(),
        })?;
        info!(template = %template, path = %path.display(), "wrote template");
        written.push(WrittenTemplate {
            template,
            path,
            body,
        });
    }
    return Ok(written);
}

/// Whether a serialized body is small enough for the remote validation call.
pub fn within_validation_limit(body_len: usize) -> bool {
    body_len < VALIDATION_SIZE_LIMIT
}

pub struct Validator {
    client: aws_sdk_cloudformation::Client,
}

impl Validator {
    pub async fn new(region: Option<String>) -> Self {
        let region = match region {
            Some(provided_region) => Some(Region::new(provided_region)),
            None => RegionProviderChain::default_provider().region().await,
        };

        let sdk_config = aws_config::from_env().region(region).load().await;
        let client = aws_sdk_cloudformation::Client::new(&sdk_config);
        return Self { client };
    }

    /// Validates one serialized body, skipping (with a warning) anything the
    /// service would reject on size alone. Invalid templates propagate.
    pub async fn validate(&self, name: &str, body: &str) -> Result<(), Error> {
        if !within_validation_limit(body.len()) {
            warn!(
                template = name,
                size = body.len(),
                limit = VALIDATION_SIZE_LIMIT,
                "template too large for remote validation, skipping"
            );
            return Ok(());
        }

        let result = self
            .client
            .validate_template()
            .template_body(body)
            .send()
            .await;

        match result {
            Ok(_) => {
                info!(template = name, "template validated");
                Ok(())
            }
            Err(aws_sdk_cloudformation::types::SdkError::ServiceError { err, .. }) => {
                Err(Error::InvalidTemplate {
                    name: name.to_string(),
                    message: err.to_string(),
                })
            }
            Err(err) => Err(Error::UnknownError(err.to_string())),
        }
    }
}
