//! Merges an additional template into the master document as a nested stack.
//!
//! The merge is structurally flat: the additional template's parameters land
//! directly on the master, so any name collision (outside an explicit
//! allow-list) is rejected before the master is touched.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use serde_yaml::Value;
use tracing::info;

use crate::document;
use crate::document::{join, mapping, reference, sub, TemplateDocument};

/// Parameters the master and additional templates are allowed to both
/// declare: the packaging bucket coordinates every nested stack shares.
pub const SHARED_PARAMETERS: &[&str] = &["QSS3BucketName", "QSS3KeyPrefix"];

const S3_TEMPLATE_PREFIX: &str = "templates/additional_templates/";

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Template file {0} not found")]
    FileNotFound(String),

    #[error("Failed to read {path}: {message}")]
    Io { path: String, message: String },

    #[error("Failed to parse {path}: {message}")]
    ParsingError { path: String, message: String },

    #[error(
        "There is an overlap in parameters between the additional template and the master template: {0:?}"
    )]
    ParameterOverlap(Vec<String>),

    #[error("The template declares no input parameters, cannot pass in override values")]
    OverridesWithoutParameters,

    #[error("Template path {0} has no usable file name")]
    BadTemplatePath(String),

    #[error(transparent)]
    StructuralError(#[from] document::Error),
}

/// Fixed values substituted for some of the additional template's parameters
/// instead of lifting them onto the master.
pub type ParameterOverrides = BTreeMap<String, Value>;

/// Converts a hyphen-delimited file stem into the nested stack's logical
/// name: `loadbalancer-and-routing-stack` -> `LoadbalancerAndRoutingStack`.
pub fn to_pascal_case(file_stem: &str) -> String {
    file_stem
        .split('-')
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect()
}

/// Reads the additional template, lifts its non-overridden parameters onto
/// the master and inserts the nested-stack resource. Returns the computed
/// logical name.
pub fn stitch_nested_stack(
    master: &mut TemplateDocument,
    additional_template_path: &Path,
    overrides: &ParameterOverrides,
    allowed_overlap: &[&str],
) -> Result<String, Error> {
    let additional = load_template(additional_template_path)?;

    let declared = additional.parameter_names();
    if declared.is_empty() && !overrides.is_empty() {
        return Err(Error::OverridesWithoutParameters);
    }

    // Collision check runs before any mutation of the master.
    let existing = master.parameters()?;
    let overlapped: Vec<String> = declared
        .iter()
        .filter(|name| existing.contains_key(name.as_str()))
        .filter(|name| !allowed_overlap.contains(&name.as_str()))
        .cloned()
        .collect();
    if !overlapped.is_empty() {
        return Err(Error::ParameterOverlap(overlapped));
    }

    let file_name = additional_template_path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            Error::BadTemplatePath(additional_template_path.display().to_string())
        })?;
    let file_stem = file_name.rsplit_once('.').map_or(file_name, |(stem, _)| stem);
    let stack_name = to_pascal_case(file_stem);

    // Parameters of the nested-stack resource: a Ref for everything carried
    // through, the fixed value for everything overridden.
    let mut resource_params: Vec<(&str, Value)> = Vec::new();
    for name in &declared {
        if !overrides.contains_key(name) {
            resource_params.push((name.as_str(), reference(name)));
        }
    }
    for (name, value) in overrides {
        resource_params.push((name.as_str(), value.clone()));
    }

    let carried: Vec<String> = declared
        .iter()
        .filter(|name| !overrides.contains_key(*name))
        .cloned()
        .collect();
    if !carried.is_empty() {
        let definitions = additional.parameters()?.clone();
        let master_params = master.parameters_mut()?;
        for name in &carried {
            if allowed_overlap.contains(&name.as_str()) && master_params.contains_key(name.as_str())
            {
                continue;
            }
            if let Some(definition) = definitions.get(name.as_str()) {
                master_params.insert(Value::from(name.as_str()), definition.clone());
            }
        }
    }

    let template_url = join(
        "",
        vec![
            sub("https://${QSS3BucketName}.s3.amazonaws.com/"),
            reference("QSS3KeyPrefix"),
            Value::from(format!("{}{}", S3_TEMPLATE_PREFIX, file_name)),
        ],
    );

    let mut properties = vec![("TemplateURL", template_url)];
    if !resource_params.is_empty() {
        properties.push(("Parameters", mapping(resource_params)));
    }
    let resource = mapping(vec![
        ("Type", Value::from("AWS::CloudFormation::Stack")),
        ("Properties", mapping(properties)),
    ]);
    master.resources_mut()?.insert(Value::from(stack_name.as_str()), resource);

    info!(stack = %stack_name, template = %file_name, "stitched nested stack into master");
    return Ok(stack_name);
}

fn load_template(path: &Path) -> Result<TemplateDocument, Error> {
    let contents = match fs::read_to_string(path) {
        Ok(raw_contents) => Ok(raw_contents),
        Err(error) => match error.kind() {
            io::ErrorKind::NotFound => Err(Error::FileNotFound(path.display().to_string())),
            _ => Err(Error::Io {
                path: path.display().to_string(),
                message: error.to_string(),
            }),
        },
    }?;

    match TemplateDocument::from_yaml_str(&contents) {
        Ok(document) => Ok(document),
        Err(error) => Err(Error::ParsingError {
            path: path.display().to_string(),
            message: error.to_string(),
        }),
    }
}
