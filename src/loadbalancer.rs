//! Synthesizes the `loadbalancer-and-routing-stack` template.
//!
//! Built from scratch on the document model every run: an internet-facing
//! application load balancer in front of the webserver target group, HTTP to
//! HTTPS redirect, a Route53 CNAME for the stage alias, and (for prod-like
//! stages) an access-log bucket with the delivery-service policy.

use std::fs;
use std::path::{Path, PathBuf};

use serde_yaml::Value;
use tracing::info;

use crate::document;
use crate::document::{get_att, join, mapping, reference, split, TemplateDocument};

pub const STACK_FILE_STEM: &str = "loadbalancer-and-routing-stack";
pub const FILE_EXT: &str = ".template";

pub const SSL_CERT_ARN: &str = "SSLCertArn";
pub const SUBNET_IDS: &str = "SubnetIDs";
pub const VPC_ID: &str = "VpcId";
pub const VPC_S3_ENDPOINT_ID: &str = "VPCS3EndpointID";
pub const TARGET_GROUP_FOR_AUTOSCALING: &str = "TargetGroupNameForAutoscaling";

const LOAD_BALANCER: &str = "LoadBalancer";
const WEBSERVER_TARGET_GROUP: &str = "WebserverTargetGroup";
const LOGS_BUCKET: &str = "LoadbalancerLogsBucket";

// The ELB service account, granted PutObject on the access-log bucket.
const ELB_ACCOUNT_ARN: &str = "arn:aws:iam::127311923021:root";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Failed to write {path}: {message}")]
    Io { path: String, message: String },

    #[error(transparent)]
    StructuralError(#[from] document::Error),
}

/// Stage and region concatenated without separators, each word title-cased:
/// `DEV` in `us-west-2` -> `DevusWest2`. Used in resource names that reject
/// `-` and `_`.
pub fn camel_no_sep(stage_name: &str, region: &str) -> String {
    let joined = format!("{}{}", stage_name, region);
    let mut out = String::with_capacity(joined.len());
    let mut boundary = true;
    for ch in joined.chars() {
        if ch == '-' || ch == '_' {
            boundary = true;
            continue;
        }
        if boundary {
            out.extend(ch.to_uppercase());
        } else {
            out.extend(ch.to_lowercase());
        }
        boundary = !ch.is_alphabetic();
    }
    return out;
}

pub struct LoadBalancerTemplate {
    project_name: String,
    project_alphanum: String,
    stage_name: String,
    domain: String,
    random_suffix: String,
    camel_stage: String,
    alias: String,
    prod_like: bool,
}

impl LoadBalancerTemplate {
    pub fn new(
        stage_name: &str,
        region: &str,
        domain: &str,
        random_suffix: &str,
        project_name: &str,
        prod_like_stages: &[&str],
    ) -> Self {
        let project_alphanum = project_name.replace('-', "").replace('_', "");
        // PROD serves from the bare project subdomain, every other stage
        // gets `<project>-<stage>`.
        let subdomain = if stage_name == "PROD" {
            project_name.to_string()
        } else {
            format!("{}-{}", project_name, stage_name.to_lowercase())
        };

        return Self {
            project_name: project_name.to_string(),
            project_alphanum,
            stage_name: stage_name.to_string(),
            domain: domain.to_string(),
            random_suffix: random_suffix.to_string(),
            camel_stage: camel_no_sep(stage_name, region),
            alias: format!("{}.{}", subdomain, domain),
            prod_like: prod_like_stages.contains(&stage_name),
        };
    }

    pub fn build(&self) -> Result<TemplateDocument, Error> {
        let mut template = TemplateDocument::new(
            "AWS CloudFormation template: Contains the load balancer and appropriate routing to make it work.",
        );

        self.add_parameters(&mut template)?;
        self.add_target_group(&mut template)?;
        self.add_security_group(&mut template)?;
        if self.prod_like {
            self.add_logging_bucket(&mut template)?;
        }
        self.add_load_balancer(&mut template)?;
        self.add_listeners(&mut template)?;
        self.add_record_set(&mut template)?;

        template.add_output(
            TARGET_GROUP_FOR_AUTOSCALING,
            mapping(vec![
                ("Value", reference(WEBSERVER_TARGET_GROUP)),
                (
                    "Description",
                    Value::from("ARN for target group associated with the webserver"),
                ),
            ]),
        )?;

        return Ok(template);
    }

    /// Serializes the built template as YAML next to the other unpackaged
    /// templates, returning the written path.
    pub fn write_to_file(
        &self,
        output_dir: &Path,
        template: &TemplateDocument,
    ) -> Result<PathBuf, Error> {
        let output_path = output_dir.join(format!("{}{}", STACK_FILE_STEM, FILE_EXT));
        let contents = template.to_yaml_string()?;
        info!(path = %output_path.display(), "writing load balancer template");
        fs::write(&output_path, contents).map_err(|error| Error::Io {
            path: output_path.display().to_string(),
            message: error.to_string(),
        })?;
        return Ok(output_path);
    }

    fn add_parameters(&self, template: &mut TemplateDocument) -> Result<(), Error> {
        template.add_parameter(SSL_CERT_ARN, mapping(vec![("Type", Value::from("String"))]))?;
        template.add_parameter(
            SUBNET_IDS,
            parameter_definition("Subnet IDs to use for the load balancer"),
        )?;
        template.add_parameter(
            VPC_ID,
            parameter_definition("VPC ID to be used for the load balancer and target group"),
        )?;
        template.add_parameter(
            VPC_S3_ENDPOINT_ID,
            parameter_definition("VPC S3 endpoint ID for use in the loadbalancer to log to"),
        )?;
        return Ok(());
    }

    fn add_target_group(&self, template: &mut TemplateDocument) -> Result<(), Error> {
        template.add_resource(
            WEBSERVER_TARGET_GROUP,
            mapping(vec![
                ("Type", Value::from("AWS::ElasticLoadBalancingV2::TargetGroup")),
                (
                    "Properties",
                    mapping(vec![
                        ("HealthCheckProtocol", Value::from("HTTP")),
                        ("Protocol", Value::from("HTTP")),
                        // The webserver answers its health check with a
                        // redirect to the login page.
                        ("Matcher", mapping(vec![("HttpCode", Value::from("302"))])),
                        ("Port", Value::from(80)),
                        ("TargetType", Value::from("instance")),
                        (
                            "Name",
                            Value::from(format!(
                                "{}Web{}{}",
                                self.project_alphanum, self.camel_stage, self.random_suffix
                            )),
                        ),
                        ("VpcId", reference(VPC_ID)),
                    ]),
                ),
            ]),
        )?;
        return Ok(());
    }

    fn add_security_group(&self, template: &mut TemplateDocument) -> Result<(), Error> {
        let rules = |direction: &str| {
            Value::Sequence(vec![
                security_group_rule(80, &format!("OpenAll{direction}HTTP")),
                security_group_rule(443, &format!("OpenAll{direction}HTTPS")),
            ])
        };
        template.add_resource(
            "SgOpenAll",
            mapping(vec![
                ("Type", Value::from("AWS::EC2::SecurityGroup")),
                (
                    "Properties",
                    mapping(vec![
                        (
                            "GroupDescription",
                            Value::from(
                                "A security group to hold IP addresses which allow access to the load balancer",
                            ),
                        ),
                        (
                            "GroupName",
                            Value::from(format!(
                                "{}SgOpenAll{}",
                                self.project_alphanum, self.camel_stage
                            )),
                        ),
                        ("SecurityGroupIngress", rules("")),
                        ("SecurityGroupEgress", rules("")),
                        ("VpcId", reference(VPC_ID)),
                    ]),
                ),
            ]),
        )?;
        return Ok(());
    }

    fn bucket_name(&self) -> Value {
        join(
            "-",
            vec![
                Value::from(self.project_name.as_str()),
                Value::from("load-balancer-logging-bucket"),
                reference("AWS::AccountId"),
                Value::from(self.stage_name.to_lowercase()),
            ],
        )
    }

    fn add_logging_bucket(&self, template: &mut TemplateDocument) -> Result<(), Error> {
        template.add_resource(
            LOGS_BUCKET,
            mapping(vec![
                ("Type", Value::from("AWS::S3::Bucket")),
                ("DeletionPolicy", Value::from("Retain")),
                (
                    "Properties",
                    mapping(vec![
                        ("BucketName", self.bucket_name()),
                        ("AccessControl", Value::from("LogDeliveryWrite")),
                    ]),
                ),
            ]),
        )?;

        let bucket_objects = join("/", vec![get_att(LOGS_BUCKET, "Arn"), Value::from("*")]);
        let statements = Value::Sequence(vec![
            policy_statement(
                "AWSConsoleStmt-1592839844977",
                mapping(vec![("AWS", Value::from(ELB_ACCOUNT_ARN))]),
                "s3:PutObject",
                bucket_objects.clone(),
                None,
            ),
            policy_statement(
                "AWSLogDeliveryWrite",
                mapping(vec![("Service", Value::from("delivery.logs.amazonaws.com"))]),
                "s3:PutObject",
                bucket_objects,
                Some(mapping(vec![(
                    "StringEquals",
                    mapping(vec![(
                        "s3:x-amz-acl",
                        Value::from("bucket-owner-full-control"),
                    )]),
                )])),
            ),
            policy_statement(
                "AWSLogDeliveryAclCheck",
                mapping(vec![("Service", Value::from("delivery.logs.amazonaws.com"))]),
                "s3:GetBucketAcl",
                get_att(LOGS_BUCKET, "Arn"),
                None,
            ),
        ]);

        template.add_resource(
            &format!("{}BucketPolicy", LOGS_BUCKET),
            mapping(vec![
                ("Type", Value::from("AWS::S3::BucketPolicy")),
                ("DependsOn", Value::Sequence(vec![Value::from(LOGS_BUCKET)])),
                (
                    "Properties",
                    mapping(vec![
                        ("Bucket", reference(LOGS_BUCKET)),
                        (
                            "PolicyDocument",
                            mapping(vec![
                                ("Version", Value::from("2012-10-17")),
                                ("Id", Value::from("AccessLogsPolicy")),
                                ("Statement", statements),
                            ]),
                        ),
                    ]),
                ),
            ]),
        )?;
        return Ok(());
    }

    fn add_load_balancer(&self, template: &mut TemplateDocument) -> Result<(), Error> {
        let mut properties = vec![
            ("Scheme", Value::from("internet-facing")),
            ("SecurityGroups", Value::Sequence(vec![reference("SgOpenAll")])),
            (
                "Name",
                Value::from(format!(
                    "{}Turbine{}",
                    self.project_alphanum, self.camel_stage
                )),
            ),
            ("Subnets", split(",", reference(SUBNET_IDS))),
            ("Type", Value::from("application")),
        ];
        if self.prod_like {
            let prefix = format!(
                "application-load-balancer-logs/data-ingest-reporting/{}",
                self.stage_name.to_lowercase()
            );
            properties.push((
                "LoadBalancerAttributes",
                Value::Sequence(vec![
                    load_balancer_attribute("access_logs.s3.enabled", Value::from("true")),
                    load_balancer_attribute("access_logs.s3.bucket", self.bucket_name()),
                    load_balancer_attribute("access_logs.s3.prefix", Value::from(prefix)),
                ]),
            ));
        }

        let mut resource = vec![(
            "Type",
            Value::from("AWS::ElasticLoadBalancingV2::LoadBalancer"),
        )];
        if self.prod_like {
            // Logging must be in place before the balancer starts writing.
            resource.push((
                "DependsOn",
                Value::Sequence(vec![
                    Value::from(LOGS_BUCKET),
                    Value::from(format!("{}BucketPolicy", LOGS_BUCKET)),
                ]),
            ));
        }
        resource.push(("Properties", mapping(properties)));

        template.add_resource(LOAD_BALANCER, mapping(resource))?;
        return Ok(());
    }

    fn add_listeners(&self, template: &mut TemplateDocument) -> Result<(), Error> {
        template.add_resource(
            "HTTPRedirectToWebserver",
            mapping(vec![
                ("Type", Value::from("AWS::ElasticLoadBalancingV2::Listener")),
                (
                    "Properties",
                    mapping(vec![
                        ("Port", Value::from("80")),
                        ("Protocol", Value::from("HTTP")),
                        ("LoadBalancerArn", reference(LOAD_BALANCER)),
                        (
                            "DefaultActions",
                            Value::Sequence(vec![mapping(vec![
                                (
                                    "RedirectConfig",
                                    mapping(vec![
                                        ("Port", Value::from("443")),
                                        ("Protocol", Value::from("HTTPS")),
                                        ("StatusCode", Value::from("HTTP_301")),
                                    ]),
                                ),
                                ("Type", Value::from("redirect")),
                            ])]),
                        ),
                    ]),
                ),
            ]),
        )?;

        template.add_resource(
            "HTTPSToWebserver",
            mapping(vec![
                ("Type", Value::from("AWS::ElasticLoadBalancingV2::Listener")),
                (
                    "Properties",
                    mapping(vec![
                        (
                            "Certificates",
                            Value::Sequence(vec![mapping(vec![(
                                "CertificateArn",
                                reference(SSL_CERT_ARN),
                            )])]),
                        ),
                        ("Port", Value::from("443")),
                        ("Protocol", Value::from("HTTPS")),
                        ("LoadBalancerArn", reference(LOAD_BALANCER)),
                        (
                            "DefaultActions",
                            Value::Sequence(vec![mapping(vec![
                                ("TargetGroupArn", reference(WEBSERVER_TARGET_GROUP)),
                                ("Type", Value::from("forward")),
                            ])]),
                        ),
                    ]),
                ),
            ]),
        )?;
        return Ok(());
    }

    fn add_record_set(&self, template: &mut TemplateDocument) -> Result<(), Error> {
        template.add_resource(
            &format!("LoadBalancerAlias{}", self.camel_stage),
            mapping(vec![
                ("Type", Value::from("AWS::Route53::RecordSet")),
                (
                    "Properties",
                    mapping(vec![
                        ("HostedZoneName", Value::from(format!("{}.", self.domain))),
                        (
                            "Comment",
                            Value::from("CNAME redirect to the stage load balancer"),
                        ),
                        ("Name", Value::from(self.alias.as_str())),
                        ("Type", Value::from("CNAME")),
                        ("TTL", Value::from("300")),
                        (
                            "ResourceRecords",
                            Value::Sequence(vec![get_att(LOAD_BALANCER, "DNSName")]),
                        ),
                    ]),
                ),
            ]),
        )?;
        return Ok(());
    }
}

fn parameter_definition(description: &str) -> Value {
    mapping(vec![
        ("Type", Value::from("String")),
        ("Description", Value::from(description)),
    ])
}

fn security_group_rule(port: i64, description: &str) -> Value {
    mapping(vec![
        ("IpProtocol", Value::from("tcp")),
        ("FromPort", Value::from(port)),
        ("ToPort", Value::from(port)),
        ("CidrIp", Value::from("0.0.0.0/0")),
        ("Description", Value::from(description)),
    ])
}

fn load_balancer_attribute(key: &str, value: Value) -> Value {
    mapping(vec![("Key", Value::from(key)), ("Value", value)])
}

fn policy_statement(
    sid: &str,
    principal: Value,
    action: &str,
    resource: Value,
    condition: Option<Value>,
) -> Value {
    let mut entries = vec![
        ("Sid", Value::from(sid)),
        ("Effect", Value::from("Allow")),
        ("Principal", principal),
        ("Action", Value::Sequence(vec![Value::from(action)])),
        ("Resource", Value::Sequence(vec![resource])),
    ];
    if let Some(condition) = condition {
        entries.push(("Condition", condition));
    }
    return mapping(entries);
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::config::PRODLIKE_STAGES;

    fn build(stage: &str) -> TemplateDocument {
        LoadBalancerTemplate::new(
            stage,
            "us-west-2",
            "psyclone.pro",
            "Abc",
            "psyclone",
            PRODLIKE_STAGES,
        )
        .build()
        .unwrap()
    }

    #[test]
    fn camel_no_sep_collapses_stage_and_region() {
        assert_eq!("DevusWest2", camel_no_sep("DEV", "us-west-2"));
        assert_eq!("Dev1UsWest2", camel_no_sep("DEV-1", "us-west-2"));
    }

    #[test]
    fn dev_stage_skips_the_logging_bucket() {
        let mut template = build("DEV");
        assert!(template.resource_mut(LOGS_BUCKET).is_err());
        let lb = template.resource_mut(LOAD_BALANCER).unwrap();
        assert!(lb.get("DependsOn").is_none());
        assert!(lb
            .get("Properties")
            .and_then(|p| p.get("LoadBalancerAttributes"))
            .is_none());
    }

    #[test]
    fn prod_stage_wires_access_logging() {
        let mut template = build("PROD");
        assert!(template.resource_mut(LOGS_BUCKET).is_ok());
        assert!(template
            .resource_mut("LoadbalancerLogsBucketBucketPolicy")
            .is_ok());
        let lb = template.resource_mut(LOAD_BALANCER).unwrap();
        assert!(lb.get("DependsOn").is_some());
        assert!(lb
            .get("Properties")
            .and_then(|p| p.get("LoadBalancerAttributes"))
            .is_some());
    }

    #[test]
    fn prod_alias_drops_the_stage_segment() {
        let prod = LoadBalancerTemplate::new(
            "PROD",
            "us-west-2",
            "psyclone.pro",
            "Abc",
            "psyclone",
            PRODLIKE_STAGES,
        );
        assert_eq!("psyclone.psyclone.pro", prod.alias);

        let dev = LoadBalancerTemplate::new(
            "DEV",
            "us-west-2",
            "psyclone.pro",
            "Abc",
            "psyclone",
            PRODLIKE_STAGES,
        );
        assert_eq!("psyclone-dev.psyclone.pro", dev.alias);
    }

    #[test]
    fn target_group_exports_the_autoscaling_output() {
        let mut template = build("DEV");
        let outputs = template.outputs_mut().unwrap();
        let output = outputs.get(TARGET_GROUP_FOR_AUTOSCALING).unwrap();
        assert_eq!(Some(reference(WEBSERVER_TARGET_GROUP)), output.get("Value").cloned());
    }

    #[test]
    fn writes_the_template_under_the_conventional_name() {
        let dir = tempdir().unwrap();
        let builder = LoadBalancerTemplate::new(
            "DEV",
            "us-west-2",
            "psyclone.pro",
            "Abc",
            "psyclone",
            PRODLIKE_STAGES,
        );
        let template = builder.build().unwrap();

        let path = builder.write_to_file(dir.path(), &template).unwrap();
        assert!(path.ends_with("loadbalancer-and-routing-stack.template"));
        let reloaded =
            TemplateDocument::from_yaml_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(
            vec![SSL_CERT_ARN, SUBNET_IDS, VPC_ID, VPC_S3_ENDPOINT_ID]
                .into_iter()
                .map(str::to_string)
                .collect::<Vec<_>>(),
            reloaded.parameter_names()
        );
    }
}
