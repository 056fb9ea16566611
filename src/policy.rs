//! Merges externally authored IAM policy documents into the loaded templates.
//!
//! For every logical template, `<policies_base>/<name>/*.json` is appended to
//! that template's `IamRole` policies and an optional `managed_policies.txt`
//! extends its managed policy ARNs. Discovery order is a lexical sort of the
//! file names, so append order is stable across platforms.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_yaml::Value;
use tracing::info;

use crate::document;
use crate::document::{mapping, sub};
use crate::loader::{LogicalTemplate, TemplateSet};

const POLICIES_PATH: [&str; 4] = ["Resources", "IamRole", "Properties", "Policies"];
const MANAGED_ARNS_PATH: [&str; 4] = ["Resources", "IamRole", "Properties", "ManagedPolicyArns"];
const MANAGED_POLICIES_FILE: &str = "managed_policies.txt";

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Failed to read {path}: {message}")]
    Io { path: String, message: String },

    #[error("Failed to parse policy {path}: {message}")]
    ParsingError { path: String, message: String },

    #[error("Malformed policy {path}: {detail}")]
    MalformedPolicy { path: String, detail: String },

    #[error("Template `{template}` declares policies but has no usable IamRole: {source}")]
    StructuralError {
        template: LogicalTemplate,
        source: document::Error,
    },
}

/// Appends every discovered policy document and managed-policy ARN to its
/// logical template. Existing entries are never touched.
pub fn merge_policies(
    templates: &mut TemplateSet,
    policies_base: &Path,
    stage_name: &str,
) -> Result<(), Error> {
    for template in LogicalTemplate::ALL {
        let template_dir = policies_base.join(template.as_str());
        for policy_path in discover_policy_files(&template_dir)? {
            let policy = load_policy(&policy_path)?;
            let entry = policy_entry(&policy_path, policy, stage_name, template)?;
            templates
                .get_mut(template)
                .sequence_mut(&POLICIES_PATH)
                .map_err(|source| Error::StructuralError { template, source })?
                .push(entry);
            info!(template = %template, policy = %policy_path.display(), "appended policy");
        }

        let managed_path = template_dir.join(MANAGED_POLICIES_FILE);
        if managed_path.is_file() {
            append_managed_arns(templates, template, &managed_path)?;
        }
    }

    return Ok(());
}

/// Lexically sorted `*.json` files under one template's policy directory. A
/// missing directory just means no policies for that template.
fn discover_policy_files(template_dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let entries = match fs::read_dir(template_dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => {
            return Err(Error::Io {
                path: template_dir.display().to_string(),
                message: error.to_string(),
            })
        }
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|error| Error::Io {
            path: template_dir.display().to_string(),
            message: error.to_string(),
        })?;
        let path = entry.path();
        if path.extension().map_or(false, |ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    return Ok(files);
}

fn load_policy(path: &Path) -> Result<Value, Error> {
    let contents = fs::read_to_string(path).map_err(|error| Error::Io {
        path: path.display().to_string(),
        message: error.to_string(),
    })?;
    match serde_yaml::from_str(&contents) {
        Ok(policy) => Ok(policy),
        Err(error) => Err(Error::ParsingError {
            path: path.display().to_string(),
            message: error.to_string(),
        }),
    }
}

/// Builds the `{PolicyName, PolicyDocument}` entry: every statement resource
/// is wrapped in `Fn::Sub` so embedded placeholders resolve at deploy time,
/// and the policy name is `<file-stem>-<stage>-<template>`.
fn policy_entry(
    path: &Path,
    mut policy: Value,
    stage_name: &str,
    template: LogicalTemplate,
) -> Result<Value, Error> {
    let malformed = |detail: &str| Error::MalformedPolicy {
        path: path.display().to_string(),
        detail: detail.to_string(),
    };

    let statements = policy
        .get_mut("Statement")
        .ok_or_else(|| malformed("no `Statement` list"))?
        .as_sequence_mut()
        .ok_or_else(|| malformed("`Statement` is not a list"))?;

    for statement in statements {
        let resources = statement
            .get_mut("Resource")
            .ok_or_else(|| malformed("statement has no `Resource` list"))?
            .as_sequence_mut()
            .ok_or_else(|| malformed("statement `Resource` is not a list"))?;
        for resource in resources.iter_mut() {
            let arn = resource
                .as_str()
                .ok_or_else(|| malformed("statement `Resource` entry is not a string"))?;
            *resource = sub(arn);
        }
    }

    let policy_name = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .ok_or_else(|| malformed("file name is not valid UTF-8"))?;

    return Ok(mapping(vec![
        (
            "PolicyName",
            sub(format!("{}-{}-{}", policy_name, stage_name, template)),
        ),
        ("PolicyDocument", policy),
    ]));
}

fn append_managed_arns(
    templates: &mut TemplateSet,
    template: LogicalTemplate,
    managed_path: &Path,
) -> Result<(), Error> {
    let contents = fs::read_to_string(managed_path).map_err(|error| Error::Io {
        path: managed_path.display().to_string(),
        message: error.to_string(),
    })?;

    let arns: Vec<Value> = contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(sub)
        .collect();
    if arns.is_empty() {
        return Ok(());
    }

    templates
        .get_mut(template)
        .sequence_mut(&MANAGED_ARNS_PATH)
        .map_err(|source| Error::StructuralError { template, source })?
        .extend(arns);
    info!(template = %template, file = %managed_path.display(), "appended managed policy ARNs");
    return Ok(());
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;
    use crate::loader;
    use crate::loader::TemplateSet;

    const ROLE_TEMPLATE: &str = r#"
Parameters: {}
Resources:
  IamRole:
    Type: AWS::IAM::Role
    Properties:
      Policies:
        - PolicyName: preexisting
          PolicyDocument:
            Statement: []
      ManagedPolicyArns:
        - arn:aws:iam::aws:policy/ReadOnlyAccess
Outputs: {}
"#;

    const POLICY: &str = r#"{
  "Version": "2012-10-17",
  "Statement": [
    {
      "Effect": "Allow",
      "Action": ["s3:GetObject"],
      "Resource": ["arn:aws:s3:::${QSS3BucketName}/*"]
    }
  ]
}"#;

    fn set_with_role(dir: &std::path::Path) -> TemplateSet {
        loader::write_minimal_set(dir);
        fs::write(dir.join("turbine-scheduler.template"), ROLE_TEMPLATE).unwrap();
        TemplateSet::load(dir).unwrap()
    }

    fn scheduler_policies(templates: &mut TemplateSet) -> Vec<serde_yaml::Value> {
        templates
            .scheduler
            .sequence_mut(&POLICIES_PATH)
            .unwrap()
            .clone()
    }

    #[test]
    fn merging_two_policies_appends_exactly_two_entries() {
        let templates_dir = tempdir().unwrap();
        let policies_dir = tempdir().unwrap();
        let mut templates = set_with_role(templates_dir.path());

        let scheduler_dir = policies_dir.path().join("scheduler");
        fs::create_dir_all(&scheduler_dir).unwrap();
        fs::write(scheduler_dir.join("read.json"), POLICY).unwrap();
        fs::write(scheduler_dir.join("write.json"), POLICY).unwrap();

        merge_policies(&mut templates, policies_dir.path(), "DEV").unwrap();

        let policies = scheduler_policies(&mut templates);
        assert_eq!(3, policies.len());
        // Pre-existing entry is untouched and still first.
        assert_eq!(
            Some("preexisting"),
            policies[0].get("PolicyName").and_then(|name| name.as_str())
        );
    }

    #[test]
    fn policy_names_carry_stage_and_template() {
        let templates_dir = tempdir().unwrap();
        let policies_dir = tempdir().unwrap();
        let mut templates = set_with_role(templates_dir.path());

        let scheduler_dir = policies_dir.path().join("scheduler");
        fs::create_dir_all(&scheduler_dir).unwrap();
        fs::write(scheduler_dir.join("s3-access.json"), POLICY).unwrap();

        merge_policies(&mut templates, policies_dir.path(), "PROD").unwrap();

        let policies = scheduler_policies(&mut templates);
        let name = policies[1]
            .get("PolicyName")
            .and_then(|name| name.get("Fn::Sub"))
            .and_then(|sub| sub.as_str());
        assert_eq!(Some("s3-access-PROD-scheduler"), name);
    }

    #[test]
    fn statement_resources_are_wrapped_in_sub() {
        let templates_dir = tempdir().unwrap();
        let policies_dir = tempdir().unwrap();
        let mut templates = set_with_role(templates_dir.path());

        let scheduler_dir = policies_dir.path().join("scheduler");
        fs::create_dir_all(&scheduler_dir).unwrap();
        fs::write(scheduler_dir.join("s3-access.json"), POLICY).unwrap();

        merge_policies(&mut templates, policies_dir.path(), "DEV").unwrap();

        let policies = scheduler_policies(&mut templates);
        let resource = policies[1]
            .get("PolicyDocument")
            .and_then(|doc| doc.get("Statement"))
            .and_then(|statements| statements.get(0))
            .and_then(|statement| statement.get("Resource"))
            .and_then(|resources| resources.get(0))
            .and_then(|entry| entry.get("Fn::Sub"))
            .and_then(|sub| sub.as_str());
        assert_eq!(Some("arn:aws:s3:::${QSS3BucketName}/*"), resource);
    }

    #[test]
    fn discovery_order_is_lexical() {
        let templates_dir = tempdir().unwrap();
        let policies_dir = tempdir().unwrap();
        let mut templates = set_with_role(templates_dir.path());

        let scheduler_dir = policies_dir.path().join("scheduler");
        fs::create_dir_all(&scheduler_dir).unwrap();
        fs::write(scheduler_dir.join("zz-last.json"), POLICY).unwrap();
        fs::write(scheduler_dir.join("aa-first.json"), POLICY).unwrap();

        merge_policies(&mut templates, policies_dir.path(), "DEV").unwrap();

        let policies = scheduler_policies(&mut templates);
        let name_at = |index: usize| {
            policies[index]
                .get("PolicyName")
                .and_then(|name| name.get("Fn::Sub"))
                .and_then(|sub| sub.as_str())
                .unwrap()
                .to_string()
        };
        assert_eq!("aa-first-DEV-scheduler", name_at(1));
        assert_eq!("zz-last-DEV-scheduler", name_at(2));
    }

    #[test]
    fn managed_policy_arns_are_appended() {
        let templates_dir = tempdir().unwrap();
        let policies_dir = tempdir().unwrap();
        let mut templates = set_with_role(templates_dir.path());

        let scheduler_dir = policies_dir.path().join("scheduler");
        fs::create_dir_all(&scheduler_dir).unwrap();
        fs::write(
            scheduler_dir.join("managed_policies.txt"),
            "arn:aws:iam::aws:policy/AmazonS3ReadOnlyAccess\n\narn:aws:iam::${AWS::AccountId}:policy/custom\n",
        )
        .unwrap();

        merge_policies(&mut templates, policies_dir.path(), "DEV").unwrap();

        let arns = templates
            .scheduler
            .sequence_mut(&MANAGED_ARNS_PATH)
            .unwrap()
            .clone();
        assert_eq!(3, arns.len());
        assert_eq!(
            Some("arn:aws:iam::${AWS::AccountId}:policy/custom"),
            arns[2].get("Fn::Sub").and_then(|sub| sub.as_str())
        );
    }

    #[test]
    fn malformed_policy_json_aborts_the_run() {
        let templates_dir = tempdir().unwrap();
        let policies_dir = tempdir().unwrap();
        let mut templates = set_with_role(templates_dir.path());

        let scheduler_dir = policies_dir.path().join("scheduler");
        fs::create_dir_all(&scheduler_dir).unwrap();
        fs::write(scheduler_dir.join("broken.json"), "{ nope").unwrap();

        let result = merge_policies(&mut templates, policies_dir.path(), "DEV");
        match result.err().unwrap() {
            Error::ParsingError { path, .. } => assert!(path.contains("broken.json")),
            other => panic!("Expected `ParsingError`, got {other:?}"),
        }
    }

    #[test]
    fn missing_iam_role_is_a_structural_error() {
        let templates_dir = tempdir().unwrap();
        let policies_dir = tempdir().unwrap();
        loader::write_minimal_set(templates_dir.path());
        let mut templates = TemplateSet::load(templates_dir.path()).unwrap();

        let master_dir = policies_dir.path().join("master");
        fs::create_dir_all(&master_dir).unwrap();
        fs::write(master_dir.join("s3-access.json"), POLICY).unwrap();

        let result = merge_policies(&mut templates, policies_dir.path(), "DEV");
        match result.err().unwrap() {
            Error::StructuralError { template, .. } => {
                assert_eq!(crate::loader::LogicalTemplate::Master, template)
            }
            other => panic!("Expected `StructuralError`, got {other:?}"),
        }
    }

    #[test]
    fn templates_without_policy_directories_are_untouched() {
        let templates_dir = tempdir().unwrap();
        let policies_dir = tempdir().unwrap();
        let mut templates = set_with_role(templates_dir.path());

        merge_policies(&mut templates, policies_dir.path(), "DEV").unwrap();

        assert_eq!(1, scheduler_policies(&mut templates).len());
    }
}
