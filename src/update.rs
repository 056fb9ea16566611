//! Orchestrates one template-composition run.
//!
//! [`UpdateRun`] owns the loaded [`TemplateSet`] exclusively from load until
//! the caller takes it back for writing, so no two merge steps ever alias
//! the same document from different places.

use std::fs;
use std::path::{Path, PathBuf};

use rand::Rng;
use serde_yaml::Value;
use tracing::info;

use crate::config::{RunConfig, StageOverrides, PRODLIKE_STAGES};
use crate::dashboard::OutputBindings;
use crate::document;
use crate::document::{get_att, join, mapping, reference};
use crate::loader::{LogicalTemplate, TemplateSet};
use crate::loadbalancer::{
    LoadBalancerTemplate, SUBNET_IDS, TARGET_GROUP_FOR_AUTOSCALING, VPC_ID, VPC_S3_ENDPOINT_ID,
};
use crate::policy;
use crate::stitch;
use crate::stitch::{ParameterOverrides, SHARED_PARAMETERS};
use crate::{loadbalancer, loader};

pub const CLUSTER_RESOURCE: &str = "TurbineCluster";
const CLOUDTRAIL_POLICY_FILE: &str = "cloudtrail/cloudtrail_logs_bucket_policy.json";

/// Cron-driven disk/memory/CPU metric publishing, appended to every
/// autoscaling group's launch-configuration userdata. `\$` keeps the shell
/// variables out of `Fn::Sub`'s hands.
const METRICS_USERDATA: &str = r#"aws configure set default.region ${AWS::Region}
cat <<EOF > /usr/local/bin/metricscript.sh
# !/bin/bash

# Collect region and instanceid from metadata
AWSREGION=\$(curl -ss http://169.254.169.254/latest/dynamic/instance-identity/document | jq -r .region)
AWSINSTANCEID=\$(curl -ss http://169.254.169.254/latest/meta-data/instance-id)
AWSAUTOSCALINGGROUP=\$(aws autoscaling describe-auto-scaling-instances --instance-ids=\$AWSINSTANCEID --region \$AWSREGION | jq .AutoScalingInstances[0].AutoScalingGroupName)

function getMetric {
  # Always return bytes
  if [ "\$1" == "DiskFree" ]; then
    free=\$(df / | awk '/dev/ {print \$4}')
    echo \$(( \$free*1000 ))
  elif [ "\$1" == "MemFree" ]; then
    free -b | awk '/Mem:/ {print \$4}'
  elif [ "\$1" == "CPUUsage" ]; then
    grep 'cpu ' /proc/stat | awk '{usage=(\$2+\$4)*100/(\$2+\$4+\$5)} END {print usage}'
  fi
}

# Disk usage metrics
data=\$( getMetric DiskFree )
aws cloudwatch put-metric-data --value \$data --namespace Deductive/AutoScalingGroup/Instance --unit Bytes --metric-name DiskFree --dimensions AutoScalingGroup=\$AWSAUTOSCALINGGROUP,Instance=\$AWSINSTANCEID --region \$AWSREGION
# Memory usage metrics
data=\$( getMetric MemFree )
aws cloudwatch put-metric-data --value \$data --namespace Deductive/AutoScalingGroup/Instance --unit Bytes --metric-name MemFree --dimensions AutoScalingGroup=\$AWSAUTOSCALINGGROUP,Instance=\$AWSINSTANCEID --region \$AWSREGION
# CPU usage metrics
data=\$( getMetric CPUUsage )
aws cloudwatch put-metric-data --value \$data --namespace Deductive/AutoScalingGroup/Instance --unit Bytes --metric-name CPUUsage --dimensions AutoScalingGroup=\$AWSAUTOSCALINGGROUP,Instance=\$AWSINSTANCEID --region \$AWSREGION
EOF

chmod +x /usr/local/bin/metricscript.sh

cat <<EOF > /etc/cron.d/autoscalinggroupmetrics
*/5 * * * * root /usr/local/bin/metricscript.sh
EOF

# Test metrics script
/usr/local/bin/metricscript.sh

/opt/aws/bin/cfn-signal -e $? \
  --region ${AWS::Region} \
  --stack ${AWS::StackName} \
  --resource LaunchConfiguration
"#;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Loader(#[from] loader::Error),

    #[error(transparent)]
    Policy(#[from] policy::Error),

    #[error(transparent)]
    Stitch(#[from] stitch::Error),

    #[error(transparent)]
    LoadBalancer(#[from] loadbalancer::Error),

    #[error("Structural error in `{template}` template: {source}")]
    Structural {
        template: LogicalTemplate,
        source: document::Error,
    },

    #[error("Failed to read {path}: {message}")]
    Io { path: String, message: String },

    #[error("Failed to parse {path}: {message}")]
    ParsingError { path: String, message: String },
}

/// Three random lowercase letters, title-cased. Generated once per process
/// and reused by every resource named in that invocation; CloudFormation
/// dashboard and target-group names stay unique across stack updates.
pub fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    let mut suffix = String::with_capacity(3);
    for index in 0..3 {
        let letter = rng.gen_range(b'a'..=b'z') as char;
        if index == 0 {
            suffix.extend(letter.to_uppercase());
        } else {
            suffix.push(letter);
        }
    }
    return suffix;
}

pub struct UpdateRun {
    config: RunConfig,
    templates: TemplateSet,
    random_suffix: String,
}

impl UpdateRun {
    /// Loads the full template set (all five or nothing) and applies the
    /// PROD-only CloudTrail resources.
    pub fn new(config: RunConfig, random_suffix: &str) -> Result<Self, Error> {
        let templates = TemplateSet::load(&config.templates_path)?;
        let mut run = Self {
            config,
            templates,
            random_suffix: random_suffix.to_string(),
        };
        if run.config.is_prod() {
            run.add_cloudtrail()?;
        }
        return Ok(run);
    }

    pub fn templates(&self) -> &TemplateSet {
        &self.templates
    }

    /// Hands the mutated set back for serialization; nothing can touch the
    /// documents through this run afterwards.
    pub fn into_templates(self) -> TemplateSet {
        self.templates
    }

    pub fn merge_policies(&mut self) -> Result<(), Error> {
        let base = self.config.policies_path.clone();
        self.merge_policies_from(&base)
    }

    pub fn merge_policies_from(&mut self, policies_base: &Path) -> Result<(), Error> {
        policy::merge_policies(&mut self.templates, policies_base, &self.config.stage_name)?;
        return Ok(());
    }

    pub fn apply_stage_overrides(&mut self, overrides: &StageOverrides) -> Result<(), Error> {
        if let Some(instance_type) = &overrides.worker_instance_type {
            info!(%instance_type, "overriding worker instance type");
            let default = self
                .path_mut(LogicalTemplate::Master, &["Parameters", "WorkerInstanceType"])?;
            if let Some(parameter) = default.as_mapping_mut() {
                parameter.insert(Value::from("Default"), Value::from(instance_type.as_str()));
            }
        }
        if let Some(rds_type) = &overrides.rds_instance_type {
            info!(%rds_type, "overriding RDS instance class");
            let properties = self.path_mut(
                LogicalTemplate::Cluster,
                &["Resources", "DBInstance", "Properties"],
            )?;
            if let Some(properties) = properties.as_mapping_mut() {
                properties.insert(Value::from("DBInstanceClass"), Value::from(rds_type.as_str()));
            }
        }
        if let Some(spot_price) = &overrides.max_spot_price {
            info!(%spot_price, "overriding maximum spot price");
            let properties = self.path_mut(
                LogicalTemplate::Workerset,
                &["Resources", "LaunchConfiguration", "Properties"],
            )?;
            if let Some(properties) = properties.as_mapping_mut() {
                properties.insert(Value::from("SpotPrice"), Value::from(spot_price.as_str()));
            }
        }
        return Ok(());
    }

    /// Builds and writes the load balancer template, stitches it into the
    /// master as a nested stack fed from VPC outputs, and threads the
    /// target group down to the webserver autoscaling group.
    pub fn attach_load_balancer(&mut self) -> Result<PathBuf, Error> {
        // Region presence is enforced by RunConfig::validated.
        let region = self.config.region.clone().unwrap_or_default();
        let builder = LoadBalancerTemplate::new(
            &self.config.stage_name,
            &region,
            &self.config.domain,
            &self.random_suffix,
            &self.config.project_name,
            PRODLIKE_STAGES,
        );
        let template = builder.build()?;
        let written = builder.write_to_file(&self.config.output_path, &template)?;

        let mut overrides = ParameterOverrides::new();
        overrides.insert(
            VPC_ID.to_string(),
            get_att("VPCStack", "Outputs.VPCID"),
        );
        overrides.insert(
            VPC_S3_ENDPOINT_ID.to_string(),
            get_att("VPCStack", "Outputs.S3VPCEndpoint"),
        );
        overrides.insert(
            SUBNET_IDS.to_string(),
            join(
                ",",
                vec![
                    get_att("VPCStack", "Outputs.PublicSubnet1ID"),
                    get_att("VPCStack", "Outputs.PublicSubnet2ID"),
                ],
            ),
        );
        stitch::stitch_nested_stack(&mut self.templates.master, &written, &overrides, &[])?;

        self.update_webserver()?;
        return Ok(written);
    }

    /// Merges a caller-supplied template into the master, resolving its
    /// `VpcId` from the VPC stack the way every nested stack here does.
    pub fn add_additional_template(&mut self, path: &Path) -> Result<String, Error> {
        let mut overrides = ParameterOverrides::new();
        overrides.insert(VPC_ID.to_string(), get_att("VPCStack", "Outputs.VPCID"));
        let stack_name = stitch::stitch_nested_stack(
            &mut self.templates.master,
            path,
            &overrides,
            SHARED_PARAMETERS,
        )?;
        return Ok(stack_name);
    }

    /// Passes the load balancer target group through master -> cluster ->
    /// webserver so the autoscaling group can attach to it.
    fn update_webserver(&mut self) -> Result<(), Error> {
        let target_group_att = get_att(
            "LoadbalancerAndRoutingStack",
            &format!("Outputs.{}", TARGET_GROUP_FOR_AUTOSCALING),
        );
        self.insert_at(
            LogicalTemplate::Master,
            &["Resources", CLUSTER_RESOURCE, "Properties", "Parameters"],
            TARGET_GROUP_FOR_AUTOSCALING,
            target_group_att,
        )?;

        self.insert_at(
            LogicalTemplate::Cluster,
            &["Parameters"],
            TARGET_GROUP_FOR_AUTOSCALING,
            mapping(vec![
                (
                    "Description",
                    Value::from("Load balancer target group to attach to the autoscaling group"),
                ),
                ("Type", Value::from("String")),
            ]),
        )?;
        self.insert_at(
            LogicalTemplate::Cluster,
            &["Resources", "WebserverStack", "Properties", "Parameters"],
            TARGET_GROUP_FOR_AUTOSCALING,
            reference(TARGET_GROUP_FOR_AUTOSCALING),
        )?;

        self.insert_at(
            LogicalTemplate::Webserver,
            &["Parameters"],
            TARGET_GROUP_FOR_AUTOSCALING,
            mapping(vec![
                (
                    "Description",
                    Value::from(
                        "ARNs of any target groups to attach to the autoscaling configuration",
                    ),
                ),
                ("Type", Value::from("String")),
            ]),
        )?;
        self.insert_at(
            LogicalTemplate::Webserver,
            &["Resources", "AutoScalingGroup", "Properties"],
            "TargetGroupARNs",
            Value::Sequence(vec![reference(TARGET_GROUP_FOR_AUTOSCALING)]),
        )?;
        return Ok(());
    }

    /// Adds the dashboard-facing outputs to the nested templates, re-exports
    /// them through the cluster stack, and returns the master-level bindings
    /// the dashboard fragment consumes.
    pub fn wire_dashboard_outputs(&mut self) -> Result<OutputBindings, Error> {
        use LogicalTemplate::{Cluster, Scheduler, Webserver, Workerset};

        self.add_output(
            Cluster,
            "SQSTaskQueueName",
            get_att("TaskQueue", "QueueName"),
        )?;
        self.add_output(Workerset, "TurbineStackName", reference("AWS::StackName"))?;
        for template in [Scheduler, Webserver, Workerset] {
            self.add_output(
                template,
                "EC2AutoScalingGroupName",
                reference("AutoScalingGroup"),
            )?;
        }

        // Pass them through the cluster stack so everything is available at
        // the top level.
        self.add_output(
            Cluster,
            "TurbineStackName",
            get_att("WorkerSetStack", "Outputs.TurbineStackName"),
        )?;
        self.add_output(
            Cluster,
            "EC2AutoScalingGroupName",
            get_att("SchedulerStack", "Outputs.EC2AutoScalingGroupName"),
        )?;
        self.add_output(
            Cluster,
            "EC2AutoScalingGroupNameWebserver",
            get_att("WebserverStack", "Outputs.EC2AutoScalingGroupName"),
        )?;
        self.add_output(
            Cluster,
            "EC2AutoScalingGroupNameWorker",
            get_att("WorkerSetStack", "Outputs.EC2AutoScalingGroupName"),
        )?;

        let mut bindings = OutputBindings::new();
        for key in [
            "SQSTaskQueueName",
            "TurbineStackName",
            "EC2AutoScalingGroupName",
            "EC2AutoScalingGroupNameWebserver",
            "EC2AutoScalingGroupNameWorker",
        ] {
            bindings.insert(
                key.to_string(),
                get_att(CLUSTER_RESOURCE, &format!("Outputs.{}", key)),
            );
        }
        return Ok(bindings);
    }

    /// Appends the metric-publishing script to the userdata of every
    /// instance-carrying template.
    pub fn append_metrics_userdata(&mut self) -> Result<(), Error> {
        use LogicalTemplate::{Scheduler, Webserver, Workerset};
        for template in [Workerset, Webserver, Scheduler] {
            let userdata = self.path_mut(
                template,
                &[
                    "Resources",
                    "LaunchConfiguration",
                    "Properties",
                    "UserData",
                    "Fn::Base64",
                    "Fn::Sub",
                ],
            )?;
            let existing = userdata.as_str().ok_or_else(|| Error::Structural {
                template,
                source: document::Error::WrongShape {
                    path: "UserData.Fn::Base64.Fn::Sub".to_string(),
                    expected: "string",
                },
            })?;
            *userdata = Value::from(format!("{}{}", existing, METRICS_USERDATA));
        }
        return Ok(());
    }

    /// CloudTrail with a retained log bucket, PROD only. The bucket policy
    /// is authored alongside the IAM policies.
    fn add_cloudtrail(&mut self) -> Result<(), Error> {
        let bucket_name = format!(
            "{}-{}-cloudtrail-logs",
            self.config.project_name.to_lowercase(),
            self.config.stage_name.to_lowercase()
        );
        let policy_path = self.config.policies_path.join(CLOUDTRAIL_POLICY_FILE);
        let policy_text = fs::read_to_string(&policy_path).map_err(|error| Error::Io {
            path: policy_path.display().to_string(),
            message: error.to_string(),
        })?;
        let policy: Value =
            serde_yaml::from_str(&policy_text).map_err(|error| Error::ParsingError {
                path: policy_path.display().to_string(),
                message: error.to_string(),
            })?;

        let master = &mut self.templates.master;
        let add = |master: &mut document::TemplateDocument,
                   name: &str,
                   resource: Value|
         -> Result<(), Error> {
            master.add_resource(name, resource).map_err(|source| Error::Structural {
                template: LogicalTemplate::Master,
                source,
            })
        };

        add(
            master,
            "CloudTrailLogsBucket",
            mapping(vec![
                ("Type", Value::from("AWS::S3::Bucket")),
                ("DeletionPolicy", Value::from("Retain")),
                (
                    "Properties",
                    mapping(vec![("BucketName", Value::from(bucket_name))]),
                ),
            ]),
        )?;
        add(
            master,
            "CloudTrailLogsBucketPolicy",
            mapping(vec![
                ("Type", Value::from("AWS::S3::BucketPolicy")),
                (
                    "Properties",
                    mapping(vec![
                        ("Bucket", reference("CloudTrailLogsBucket")),
                        ("PolicyDocument", policy),
                    ]),
                ),
            ]),
        )?;
        add(
            master,
            "CloudTrail",
            mapping(vec![
                ("Type", Value::from("AWS::CloudTrail::Trail")),
                (
                    "DependsOn",
                    Value::Sequence(vec![Value::from("CloudTrailLogsBucketPolicy")]),
                ),
                (
                    "Properties",
                    mapping(vec![
                        ("IsLogging", Value::from(true)),
                        ("S3BucketName", reference("CloudTrailLogsBucket")),
                    ]),
                ),
            ]),
        )?;
        info!("added CloudTrail resources to the master template");
        return Ok(());
    }

    fn path_mut(
        &mut self,
        template: LogicalTemplate,
        path: &[&str],
    ) -> Result<&mut Value, Error> {
        self.templates
            .get_mut(template)
            .path_mut(path)
            .map_err(|source| Error::Structural { template, source })
    }

    fn insert_at(
        &mut self,
        template: LogicalTemplate,
        path: &[&str],
        key: &str,
        value: Value,
    ) -> Result<(), Error> {
        let target = self.path_mut(template, path)?;
        let target = target.as_mapping_mut().ok_or_else(|| Error::Structural {
            template,
            source: document::Error::WrongShape {
                path: path.join("."),
                expected: "mapping",
            },
        })?;
        target.insert(Value::from(key), value);
        return Ok(());
    }

    fn add_output(
        &mut self,
        template: LogicalTemplate,
        name: &str,
        value: Value,
    ) -> Result<(), Error> {
        let outputs = self
            .templates
            .get_mut(template)
            .outputs_mut()
            .map_err(|source| Error::Structural { template, source })?;
        outputs.insert(
            Value::from(name),
            mapping(vec![("Value", value)]),
        );
        return Ok(());
    }
}
