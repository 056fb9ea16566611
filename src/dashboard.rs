//! Generates the CloudWatch dashboard fragment for one stage.
//!
//! The dashboard body is an opaque JSON document owned by whoever authored
//! it; this module only picks the right source file, guarantees the warning
//! widget is present exactly once, and wraps the body in the CloudFormation
//! resources around it. `${...}` placeholders inside the body are left for
//! the enclosing stack to resolve at deploy time.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tracing::info;

/// Marker text identifying the warning widget; its presence anywhere in the
/// body makes appending a second one a no-op.
pub const WARNING_MARKER: &str = "This dashboard is automatically deployed by CloudFormation";

const WARNING_WIDGET_FILE: &str = "warning-widget.json";
const GENERIC_DASHBOARD_FILE: &str = "dashboard-template.json";

/// Output keys the generated fragment expects the master stack to expose.
pub const EXPECTED_BINDINGS: [&str; 5] = [
    "SQSTaskQueueName",
    "TurbineStackName",
    "EC2AutoScalingGroupName",
    "EC2AutoScalingGroupNameWebserver",
    "EC2AutoScalingGroupNameWorker",
];

/// Autoscaling-group parameter and the logical name of its instance-count
/// alarm.
const MONITORED_GROUPS: [(&str, &str); 3] = [
    ("EC2AutoScalingGroupName", "SchedulerInstanceCountAlarm"),
    ("EC2AutoScalingGroupNameWebserver", "WebserverInstanceCountAlarm"),
    ("EC2AutoScalingGroupNameWorker", "WorkerInstanceCountAlarm"),
];

/// Well-known output key -> intrinsic reference into the master stack,
/// produced by the update run and consumed here.
pub type OutputBindings = BTreeMap<String, serde_yaml::Value>;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Dashboard source {0} not found")]
    FileNotFound(String),

    #[error("Failed to read {path}: {message}")]
    Io { path: String, message: String },

    #[error("Failed to parse {path}: {message}")]
    ParsingError { path: String, message: String },

    #[error("Dashboard body has no `widgets` list")]
    MissingWidgets,

    #[error("Widget {index} is missing `{field}`")]
    MalformedWidget { index: usize, field: &'static str },

    #[error("Output bindings are missing keys: {0:?}")]
    MissingBindings(Vec<String>),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

pub struct DashboardTemplate {
    project: String,
    dash_project: String,
    output_dir: PathBuf,
    warning_widget_path: PathBuf,
    source_file: PathBuf,
    body: Value,
    random_suffix: String,
    with_alarms: bool,
    /// Whether the stage-unique body was found, for downstream diagnostics.
    pub unique_dashboard: bool,
}

impl DashboardTemplate {
    /// Picks the stage-unique dashboard body when present, otherwise the
    /// generic template. Neither existing is fatal.
    pub fn new(
        project_name: &str,
        stage_name: &str,
        source_dir: &Path,
        output_dir: &Path,
        random_suffix: &str,
        with_alarms: bool,
    ) -> Result<Self, Error> {
        // Dashboard names cannot carry underscores.
        let dash_project = project_name.replace('_', "-");

        let unique = source_dir.join(format!("dashboard-{}.json", stage_name));
        let generic = source_dir.join(GENERIC_DASHBOARD_FILE);
        let (source_file, unique_dashboard) = if unique.is_file() {
            (unique, true)
        } else if generic.is_file() {
            (generic, false)
        } else {
            return Err(Error::FileNotFound(unique.display().to_string()));
        };
        info!(source = %source_file.display(), unique = unique_dashboard, "using dashboard body");

        let body = load_json(&source_file)?;

        return Ok(Self {
            project: project_name.to_string(),
            dash_project,
            output_dir: output_dir.to_path_buf(),
            warning_widget_path: source_dir.join(WARNING_WIDGET_FILE),
            source_file,
            body,
            random_suffix: random_suffix.to_string(),
            with_alarms,
            unique_dashboard,
        });
    }

    /// Builds the fragment and writes `<project>_dashboard.json` into the
    /// output directory, returning the written path.
    pub fn generate(mut self, bindings: &OutputBindings) -> Result<PathBuf, Error> {
        let missing: Vec<String> = EXPECTED_BINDINGS
            .iter()
            .filter(|key| !bindings.contains_key(**key))
            .map(|key| key.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(Error::MissingBindings(missing));
        }

        self.append_warning_widget()?;

        let body_text = match serde_json::to_string(&self.body) {
            Ok(text) => text,
            Err(error) => return Err(Error::SerializationError(error.to_string())),
        };

        let mut resources = json!({});
        let dashboard_logical = format!("{}Dashboard", self.project);
        // The enclosing stack resolves ${...} placeholders in the body at
        // deploy time.
        resources[dashboard_logical.as_str()] = json!({
            "Type": "AWS::CloudWatch::Dashboard",
            "Properties": {
                "DashboardName": {
                    "Fn::Join": ["-", [
                        self.dash_project,
                        "dashboard",
                        {"Ref": "DeploymentStage"},
                        {"Ref": "AWS::Region"},
                        self.random_suffix,
                    ]]
                },
                "DashboardBody": {"Fn::Sub": body_text},
            },
        });
        if self.with_alarms {
            attach_instance_count_alarms(&mut resources);
        }

        let fragment = json!({
            "Description": format!(
                "AWS CloudFormation Template: '{}'",
                self.source_file.display()
            ),
            "Parameters": fragment_parameters(),
            "Resources": resources,
        });

        let out_name = format!("{}_dashboard.json", self.project);
        let out_path = self.output_dir.join(out_name);
        let contents = match serde_json::to_string_pretty(&fragment) {
            Ok(contents) => contents,
            Err(error) => return Err(Error::SerializationError(error.to_string())),
        };
        fs::write(&out_path, contents).map_err(|error| Error::Io {
            path: out_path.display().to_string(),
            message: error.to_string(),
        })?;

        info!(path = %out_path.display(), "wrote dashboard fragment");
        return Ok(out_path);
    }

    fn append_warning_widget(&mut self) -> Result<(), Error> {
        // A whole-body text check, so a marker carried inside any widget
        // (however it was authored) suppresses the append.
        let body_text = self.body.to_string();
        if body_text.contains(WARNING_MARKER) {
            return Ok(());
        }

        let mut widget = load_json(&self.warning_widget_path)?;
        let bottom = find_dashboard_bottom(widgets(&self.body)?)?;
        widget["y"] = json!(bottom);

        let widgets = self
            .body
            .get_mut("widgets")
            .and_then(Value::as_array_mut)
            .ok_or(Error::MissingWidgets)?;
        widgets.push(widget);
        return Ok(());
    }
}

fn widgets(body: &Value) -> Result<&Vec<Value>, Error> {
    body.get("widgets")
        .and_then(Value::as_array)
        .ok_or(Error::MissingWidgets)
}

/// The y-coordinate just below the lowest widget: `max(y + height)` over the
/// list, 0 when the list is empty.
pub fn find_dashboard_bottom(widgets: &[Value]) -> Result<i64, Error> {
    let mut ypos = 0;
    for (index, widget) in widgets.iter().enumerate() {
        let y = widget
            .get("y")
            .and_then(Value::as_i64)
            .ok_or(Error::MalformedWidget { index, field: "y" })?;
        let height = widget
            .get("height")
            .and_then(Value::as_i64)
            .ok_or(Error::MalformedWidget { index, field: "height" })?;
        if y + height > ypos {
            ypos = y + height;
        }
    }
    return Ok(ypos);
}

fn fragment_parameters() -> Value {
    json!({
        "DeploymentStage": {
            "Description": "Name of deployment stage required",
            "Type": "String",
        },
        "SQSTaskQueueName": {
            "Description": "Name of task SQS queue required",
            "Type": "String",
        },
        "TurbineStackName": {
            "Description": "Name of Turbine stack required",
            "Type": "String",
        },
        "EC2AutoScalingGroupName": {
            "Description": "Name of scheduler stack Auto Scaling group required",
            "Type": "String",
        },
        "EC2AutoScalingGroupNameWebserver": {
            "Description": "Name of webserver stack Auto Scaling group required",
            "Type": "String",
        },
        "EC2AutoScalingGroupNameWorker": {
            "Description": "Name of worker stack Auto Scaling group required",
            "Type": "String",
        },
    })
}

/// One alarm per monitored autoscaling group, firing when the in-service
/// instance count drops below one. Missing data counts as a breach so a
/// group that stops reporting still alerts.
fn attach_instance_count_alarms(resources: &mut Value) {
    resources["AlarmTopic"] = json!({
        "Type": "AWS::SNS::Topic",
        "Properties": {
            "TopicName": {
                "Fn::Join": ["-", [
                    "turbine-cluster-alarms",
                    {"Ref": "DeploymentStage"},
                ]]
            },
        },
    });

    for (parameter, alarm_name) in MONITORED_GROUPS {
        resources[alarm_name] = json!({
            "Type": "AWS::CloudWatch::Alarm",
            "Properties": {
                "AlarmDescription": format!("No in-service instances in ${{{}}}", parameter),
                "Namespace": "AWS/AutoScaling",
                "MetricName": "GroupInServiceInstances",
                "Dimensions": [
                    {"Name": "AutoScalingGroupName", "Value": {"Ref": parameter}},
                ],
                "Statistic": "Minimum",
                "Period": 60,
                "EvaluationPeriods": 1,
                "Threshold": 1,
                "ComparisonOperator": "LessThanThreshold",
                "TreatMissingData": "breaching",
                "AlarmActions": [{"Ref": "AlarmTopic"}],
                "OKActions": [{"Ref": "AlarmTopic"}],
            },
        });
    }
}

fn load_json(path: &Path) -> Result<Value, Error> {
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

    match serde_json::from_str(&contents) {
        Ok(value) => Ok(value),
        Err(error) => Err(Error::ParsingError {
            path: path.display().to_string(),
            message: error.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;
    use crate::document::get_att;

    const BODY: &str = r#"{
        "widgets": [
            {"type": "metric", "x": 0, "y": 0, "width": 12, "height": 6, "properties": {}},
            {"type": "metric", "x": 0, "y": 6, "width": 12, "height": 9, "properties": {}}
        ]
    }"#;

    const WARNING_WIDGET: &str = r#"{
        "type": "text",
        "x": 0,
        "y": 0,
        "width": 24,
        "height": 2,
        "properties": {
            "markdown": "This dashboard is automatically deployed by CloudFormation. Edits will be overwritten."
        }
    }"#;

    fn bindings() -> OutputBindings {
        EXPECTED_BINDINGS
            .iter()
            .map(|key| (key.to_string(), get_att("TurbineCluster", &format!("Outputs.{key}"))))
            .collect()
    }

    fn write_sources(dir: &Path, stage_body: Option<&str>) {
        if let Some(body) = stage_body {
            fs::write(dir.join("dashboard-DEV.json"), body).unwrap();
        }
        fs::write(dir.join("dashboard-template.json"), BODY).unwrap();
        fs::write(dir.join("warning-widget.json"), WARNING_WIDGET).unwrap();
    }

    fn generate(source: &Path, output: &Path) -> Value {
        let dashboard =
            DashboardTemplate::new("psyclone", "DEV", source, output, "Abc", true).unwrap();
        let path = dashboard.generate(&bindings()).unwrap();
        serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
    }

    #[test]
    fn bottom_is_max_of_y_plus_height() {
        let body: Value = serde_json::from_str(BODY).unwrap();
        let widgets = body["widgets"].as_array().unwrap();
        assert_eq!(15, find_dashboard_bottom(widgets).unwrap());
    }

    #[test]
    fn bottom_of_an_empty_widget_list_is_zero() {
        assert_eq!(0, find_dashboard_bottom(&[]).unwrap());
    }

    #[test]
    fn widget_without_height_is_a_structural_error() {
        let widgets = vec![json!({"y": 3})];
        assert_eq!(
            Err(Error::MalformedWidget { index: 0, field: "height" }),
            find_dashboard_bottom(&widgets)
        );
    }

    #[test]
    fn prefers_the_stage_unique_body() {
        let source = tempdir().unwrap();
        write_sources(source.path(), Some(BODY));

        let dashboard = DashboardTemplate::new(
            "psyclone",
            "DEV",
            source.path(),
            source.path(),
            "Abc",
            false,
        )
        .unwrap();
        assert!(dashboard.unique_dashboard);
    }

    #[test]
    fn falls_back_to_the_generic_body() {
        let source = tempdir().unwrap();
        write_sources(source.path(), None);

        let dashboard = DashboardTemplate::new(
            "psyclone",
            "DEV",
            source.path(),
            source.path(),
            "Abc",
            false,
        )
        .unwrap();
        assert!(!dashboard.unique_dashboard);
    }

    #[test]
    fn no_source_at_all_is_fatal() {
        let source = tempdir().unwrap();
        let result = DashboardTemplate::new(
            "psyclone",
            "DEV",
            source.path(),
            source.path(),
            "Abc",
            false,
        );
        match result.err().unwrap() {
            Error::FileNotFound(path) => assert!(path.contains("dashboard-DEV.json")),
            other => panic!("Expected `FileNotFound`, got {other:?}"),
        }
    }

    #[test]
    fn warning_widget_lands_at_the_computed_bottom() {
        let source = tempdir().unwrap();
        let output = tempdir().unwrap();
        write_sources(source.path(), None);

        let fragment = generate(source.path(), output.path());
        let body: Value = serde_json::from_str(
            fragment["Resources"]["psycloneDashboard"]["Properties"]["DashboardBody"]["Fn::Sub"]
                .as_str()
                .unwrap(),
        )
        .unwrap();
        let widgets = body["widgets"].as_array().unwrap();
        assert_eq!(3, widgets.len());
        assert_eq!(15, widgets[2]["y"].as_i64().unwrap());
    }

    #[test]
    fn generating_twice_never_duplicates_the_warning_widget() {
        let source = tempdir().unwrap();
        let output = tempdir().unwrap();
        write_sources(source.path(), None);

        let first = generate(source.path(), output.path());
        let first_body = first["Resources"]["psycloneDashboard"]["Properties"]["DashboardBody"]
            ["Fn::Sub"]
            .as_str()
            .unwrap()
            .to_string();

        // Second run consumes the previous output as its source, the way a
        // re-deploy over a captured dashboard would.
        fs::write(source.path().join("dashboard-template.json"), &first_body).unwrap();
        let second = generate(source.path(), output.path());
        let second_body = second["Resources"]["psycloneDashboard"]["Properties"]["DashboardBody"]
            ["Fn::Sub"]
            .as_str()
            .unwrap();

        let body: Value = serde_json::from_str(second_body).unwrap();
        let markers = body["widgets"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|widget| widget.to_string().contains(WARNING_MARKER))
            .count();
        assert_eq!(1, markers);
    }

    #[test]
    fn dashboard_name_joins_stage_region_and_suffix() {
        let source = tempdir().unwrap();
        let output = tempdir().unwrap();
        write_sources(source.path(), None);

        let fragment = generate(source.path(), output.path());
        let name =
            &fragment["Resources"]["psycloneDashboard"]["Properties"]["DashboardName"]["Fn::Join"];
        assert_eq!("-", name[0].as_str().unwrap());
        let parts = name[1].as_array().unwrap();
        assert_eq!(json!({"Ref": "DeploymentStage"}), parts[2]);
        assert_eq!(json!({"Ref": "AWS::Region"}), parts[3]);
        assert_eq!("Abc", parts[4].as_str().unwrap());
    }

    #[test]
    fn alarms_cover_every_monitored_group() {
        let source = tempdir().unwrap();
        let output = tempdir().unwrap();
        write_sources(source.path(), None);

        let fragment = generate(source.path(), output.path());
        let resources = &fragment["Resources"];
        assert!(resources.get("AlarmTopic").is_some());
        for (_, alarm_name) in MONITORED_GROUPS {
            let alarm = &resources[alarm_name]["Properties"];
            assert_eq!("breaching", alarm["TreatMissingData"].as_str().unwrap());
            assert_eq!(1, alarm["Threshold"].as_i64().unwrap());
            assert_eq!(60, alarm["Period"].as_i64().unwrap());
            assert_eq!("LessThanThreshold", alarm["ComparisonOperator"].as_str().unwrap());
        }
    }

    #[test]
    fn missing_bindings_are_named() {
        let source = tempdir().unwrap();
        let output = tempdir().unwrap();
        write_sources(source.path(), None);

        let dashboard = DashboardTemplate::new(
            "psyclone",
            "DEV",
            source.path(),
            output.path(),
            "Abc",
            false,
        )
        .unwrap();
        let mut partial = bindings();
        partial.remove("TurbineStackName");

        let result = dashboard.generate(&partial);
        assert_eq!(
            Err(Error::MissingBindings(vec!["TurbineStackName".to_string()])),
            result.map(|_| ())
        );
    }
}
