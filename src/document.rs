//! Typed wrapper around a CloudFormation template document.
//!
//! Templates are ordered mappings with a handful of well-known top-level
//! sections (`Parameters`, `Resources`, `Outputs`). All section and resource
//! lookups go through accessors on [`TemplateDocument`] so that a missing key
//! surfaces as a structural [`Error`] naming the key, not a panic somewhere
//! deep in a merge step.

use serde_yaml::{Mapping, Value};

pub const PARAMETERS: &str = "Parameters";
pub const RESOURCES: &str = "Resources";
pub const OUTPUTS: &str = "Outputs";

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Parsing error: {0}")]
    ParsingError(String),

    #[error("Document root is not a mapping")]
    NotAMapping,

    #[error("Document has no `{0}` section")]
    MissingSection(&'static str),

    #[error("Section `{0}` is not a mapping")]
    MalformedSection(&'static str),

    #[error("Document has no resource `{0}`")]
    MissingResource(String),

    #[error("Missing key `{key}` under `{path}`")]
    MissingKey { path: String, key: String },

    #[error("Expected `{path}` to be a {expected}")]
    WrongShape { path: String, expected: &'static str },

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// A single CloudFormation document, mutated in place during a run and
/// serialized exactly once at the end.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateDocument {
    root: Mapping,
}

impl TemplateDocument {
    pub fn new(description: &str) -> Self {
        let mut root = Mapping::new();
        root.insert(
            Value::from("Description"),
            Value::from(description),
        );
        return Self { root };
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, Error> {
        let value: Value = match serde_yaml::from_str(contents) {
            Ok(value) => value,
            Err(error) => return Err(Error::ParsingError(error.to_string())),
        };

        match value {
            Value::Mapping(root) => Ok(Self { root }),
            _ => Err(Error::NotAMapping),
        }
    }

    pub fn to_yaml_string(&self) -> Result<String, Error> {
        match serde_yaml::to_string(&self.root) {
            Ok(text) => Ok(text),
            Err(error) => Err(Error::SerializationError(error.to_string())),
        }
    }

    pub fn to_json_string(&self) -> Result<String, Error> {
        let json: serde_json::Value = match serde_json::to_value(&self.root) {
            Ok(json) => json,
            Err(error) => return Err(Error::SerializationError(error.to_string())),
        };
        match serde_json::to_string_pretty(&json) {
            Ok(text) => Ok(text),
            Err(error) => Err(Error::SerializationError(error.to_string())),
        }
    }

    fn section(&self, name: &'static str) -> Result<&Mapping, Error> {
        let value = self
            .root
            .get(name)
            .ok_or(Error::MissingSection(name))?;
        value.as_mapping().ok_or(Error::MalformedSection(name))
    }

    fn section_mut(&mut self, name: &'static str) -> Result<&mut Mapping, Error> {
        let value = self
            .root
            .get_mut(name)
            .ok_or(Error::MissingSection(name))?;
        value.as_mapping_mut().ok_or(Error::MalformedSection(name))
    }

    /// Section accessor that creates an empty mapping when the section is
    /// absent, for documents built up from scratch.
    fn ensure_section_mut(&mut self, name: &'static str) -> Result<&mut Mapping, Error> {
        if !self.root.contains_key(name) {
            self.root
                .insert(Value::from(name), Value::Mapping(Mapping::new()));
        }
        return self.section_mut(name);
    }

    pub fn parameters(&self) -> Result<&Mapping, Error> {
        self.section(PARAMETERS)
    }

    pub fn parameters_mut(&mut self) -> Result<&mut Mapping, Error> {
        self.section_mut(PARAMETERS)
    }

    /// Declared parameter names, empty when the document declares none.
    pub fn parameter_names(&self) -> Vec<String> {
        match self.section(PARAMETERS) {
            Ok(parameters) => parameters
                .keys()
                .filter_map(|key| key.as_str().map(str::to_string))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn resources(&self) -> Result<&Mapping, Error> {
        self.section(RESOURCES)
    }

    pub fn resources_mut(&mut self) -> Result<&mut Mapping, Error> {
        self.section_mut(RESOURCES)
    }

    pub fn outputs_mut(&mut self) -> Result<&mut Mapping, Error> {
        self.section_mut(OUTPUTS)
    }

    pub fn resource_mut(&mut self, name: &str) -> Result<&mut Mapping, Error> {
        let resources = self.section_mut(RESOURCES)?;
        let resource = resources
            .get_mut(name)
            .ok_or_else(|| Error::MissingResource(name.to_string()))?;
        resource.as_mapping_mut().ok_or(Error::WrongShape {
            path: format!("{}.{}", RESOURCES, name),
            expected: "mapping",
        })
    }

    pub fn add_parameter(&mut self, name: &str, definition: Value) -> Result<(), Error> {
        self.ensure_section_mut(PARAMETERS)?
            .insert(Value::from(name), definition);
        return Ok(());
    }

    pub fn add_resource(&mut self, name: &str, resource: Value) -> Result<(), Error> {
        self.ensure_section_mut(RESOURCES)?
            .insert(Value::from(name), resource);
        return Ok(());
    }

    pub fn add_output(&mut self, name: &str, output: Value) -> Result<(), Error> {
        self.ensure_section_mut(OUTPUTS)?
            .insert(Value::from(name), output);
        return Ok(());
    }

    /// Walks a `.`-free path of mapping keys from the document root and
    /// returns the value at the end of it. The error names both the missing
    /// key and the path walked so far.
    pub fn path_mut(&mut self, path: &[&str]) -> Result<&mut Value, Error> {
        let mut walked = String::new();
        let mut current: &mut Mapping = &mut self.root;
        let (last, intermediate) = path.split_last().ok_or(Error::WrongShape {
            path: String::new(),
            expected: "non-empty path",
        })?;

        for key in intermediate {
            let value = current.get_mut(*key).ok_or_else(|| Error::MissingKey {
                path: walked.clone(),
                key: (*key).to_string(),
            })?;
            push_segment(&mut walked, key);
            current = value.as_mapping_mut().ok_or_else(|| Error::WrongShape {
                path: walked.clone(),
                expected: "mapping",
            })?;
        }

        let value = current.get_mut(*last).ok_or_else(|| Error::MissingKey {
            path: walked.clone(),
            key: (*last).to_string(),
        })?;
        return Ok(value);
    }

    /// Same walk as [`path_mut`], requiring the final value to be a sequence.
    pub fn sequence_mut(&mut self, path: &[&str]) -> Result<&mut Vec<Value>, Error> {
        let joined = path.join(".");
        let value = self.path_mut(path)?;
        value.as_sequence_mut().ok_or(Error::WrongShape {
            path: joined,
            expected: "sequence",
        })
    }
}

fn push_segment(walked: &mut String, key: &str) {
    if !walked.is_empty() {
        walked.push('.');
    }
    walked.push_str(key);
}

/// `{"Fn::Sub": expr}`, resolved by CloudFormation at deploy time, never by
/// this tool.
pub fn sub(expr: impl Into<String>) -> Value {
    mapping(vec![("Fn::Sub", Value::from(expr.into()))])
}

/// `{"Ref": name}`
pub fn reference(name: &str) -> Value {
    mapping(vec![("Ref", Value::from(name))])
}

/// `{"Fn::GetAtt": [logical, attribute]}`
pub fn get_att(logical: &str, attribute: &str) -> Value {
    mapping(vec![(
        "Fn::GetAtt",
        Value::Sequence(vec![Value::from(logical), Value::from(attribute)]),
    )])
}

/// `{"Fn::Split": [separator, value]}`
pub fn split(separator: &str, value: Value) -> Value {
    mapping(vec![(
        "Fn::Split",
        Value::Sequence(vec![Value::from(separator), value]),
    )])
}

/// `{"Fn::Join": [separator, parts]}`
pub fn join(separator: &str, parts: Vec<Value>) -> Value {
    mapping(vec![(
        "Fn::Join",
        Value::Sequence(vec![Value::from(separator), Value::Sequence(parts)]),
    )])
}

/// Builds an ordered mapping value from key/value pairs.
pub fn mapping(entries: Vec<(&str, Value)>) -> Value {
    let mut map = Mapping::new();
    for (key, value) in entries {
        map.insert(Value::from(key), value);
    }
    return Value::Mapping(map);
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = r#"
Description: test stack
Parameters:
  Foo:
    Type: String
Resources:
  IamRole:
    Type: AWS::IAM::Role
    Properties:
      Policies: []
"#;

    #[test]
    fn parses_a_mapping_document() {
        let document = TemplateDocument::from_yaml_str(DOCUMENT).unwrap();
        assert_eq!(vec!["Foo".to_string()], document.parameter_names());
    }

    #[test]
    fn rejects_non_mapping_documents() {
        let result = TemplateDocument::from_yaml_str("- just\n- a\n- list\n");
        assert_eq!(Err(Error::NotAMapping), result);
    }

    #[test]
    fn missing_section_is_a_structural_error() {
        let mut document = TemplateDocument::from_yaml_str("Description: empty").unwrap();
        assert_eq!(Err(Error::MissingSection(RESOURCES)), document.resources_mut().map(|_| ()));
    }

    #[test]
    fn missing_resource_names_the_key() {
        let mut document = TemplateDocument::from_yaml_str(DOCUMENT).unwrap();
        let result = document.resource_mut("NoSuchRole").map(|_| ());
        assert_eq!(Err(Error::MissingResource("NoSuchRole".to_string())), result);
    }

    #[test]
    fn path_walk_reports_the_missing_key() {
        let mut document = TemplateDocument::from_yaml_str(DOCUMENT).unwrap();
        let result = document
            .path_mut(&["Resources", "IamRole", "Properties", "ManagedPolicyArns"])
            .map(|_| ());
        assert_eq!(
            Err(Error::MissingKey {
                path: "Resources.IamRole.Properties".to_string(),
                key: "ManagedPolicyArns".to_string(),
            }),
            result
        );
    }

    #[test]
    fn sequence_walk_finds_the_policies_list() {
        let mut document = TemplateDocument::from_yaml_str(DOCUMENT).unwrap();
        let policies = document
            .sequence_mut(&["Resources", "IamRole", "Properties", "Policies"])
            .unwrap();
        assert_eq!(0, policies.len());
    }

    #[test]
    fn intrinsics_serialize_to_the_expected_shape() {
        let url = join(
            "",
            vec![
                sub("https://${QSS3BucketName}.s3.amazonaws.com/"),
                reference("QSS3KeyPrefix"),
                Value::from("templates/additional_templates/extra.template"),
            ],
        );
        let text = serde_yaml::to_string(&url).unwrap();
        assert!(text.contains("Fn::Join"));
        assert!(text.contains("Fn::Sub"));
        assert!(text.contains("Ref"));
    }

    #[test]
    fn get_att_builds_a_two_element_list() {
        let att = get_att("VPCStack", "Outputs.VPCID");
        let expected = mapping(vec![(
            "Fn::GetAtt",
            Value::Sequence(vec![Value::from("VPCStack"), Value::from("Outputs.VPCID")]),
        )]);
        assert_eq!(expected, att);
    }
}
