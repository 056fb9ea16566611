//! `turbine-templates` - compose and patch the Turbine cluster templates.
//!
//! ## Commands
//!
//! - `update`: load, patch and rewrite the five cluster templates
//! - `dashboard`: generate the CloudWatch dashboard fragment on its own
//! - `load-metric`: evaluate and republish the cluster load metric once

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use turbine_templates::config::{self, RunConfig, DEFAULT_DOMAIN};
use turbine_templates::dashboard::{DashboardTemplate, EXPECTED_BINDINGS};
use turbine_templates::document::get_att;
use turbine_templates::metrics::LoadMetric;
use turbine_templates::update::{random_suffix, UpdateRun, CLUSTER_RESOURCE};
use turbine_templates::writer;

#[derive(Parser)]
#[command(name = "turbine-templates", version, about = "Compose and patch the Turbine cluster CloudFormation templates")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rewrite the cluster templates for one stage
    Update {
        /// Directory holding the turbine-<name>.template sources
        templates_path: PathBuf,

        /// Base directory of per-template IAM policy documents
        policies_path: PathBuf,

        /// Directory the rewritten templates are written to
        output_path: PathBuf,

        /// Deployment stage (PROD, STAG, DEV, DEV-1, DEV-2, DEV-3)
        stage_name: String,

        /// Project name used in resource and bucket names
        project_name: String,

        /// AWS region, required when placing a load balancer
        #[arg(long)]
        region: Option<String>,

        /// Domain the stage alias records live under
        #[arg(long, default_value = DEFAULT_DOMAIN)]
        domain: String,

        /// Generate the load balancer stack and stitch it into the master
        #[arg(long)]
        load_balancer: bool,

        /// Extra template to merge into the master as a nested stack
        #[arg(long)]
        additional_template: Option<PathBuf>,

        /// YAML file of per-stage instance sizing overrides
        #[arg(long)]
        stage_overrides: Option<PathBuf>,

        /// Dashboard body sources; enables dashboard generation
        #[arg(long)]
        dashboard_source: Option<PathBuf>,

        /// Policies merged only when the dashboard is generated
        #[arg(long)]
        dashboard_policies: Option<PathBuf>,

        /// Submit each written template to the validation endpoint
        #[arg(long)]
        validate: bool,
    },

    /// Generate the dashboard fragment without touching the templates
    Dashboard {
        /// Dashboard body sources (dashboard-<stage>.json or the default)
        source_path: PathBuf,

        /// Directory the fragment is written to
        output_path: PathBuf,

        /// Deployment stage
        stage_name: String,

        /// Project name
        project_name: String,

        /// Skip the instance-count alarms and notification topic
        #[arg(long)]
        no_alarms: bool,
    },

    /// Evaluate the cluster load once and republish it
    LoadMetric {
        /// Task queue name
        #[arg(long, env = "QueueName")]
        queue_name: String,

        /// Worker autoscaling group name
        #[arg(long, env = "GroupName")]
        group_name: String,

        /// Stack name dimension for the published metric
        #[arg(long, env = "StackName")]
        stack_name: String,

        #[arg(long)]
        region: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Update {
            templates_path,
            policies_path,
            output_path,
            stage_name,
            project_name,
            region,
            domain,
            load_balancer,
            additional_template,
            stage_overrides,
            dashboard_source,
            dashboard_policies,
            validate,
        } => {
            let run_config = RunConfig {
                templates_path,
                policies_path,
                output_path,
                stage_name,
                project_name,
                region,
                domain,
                load_balancer,
            }
            .validated()?;

            run_update(
                run_config,
                additional_template,
                stage_overrides,
                dashboard_source,
                dashboard_policies,
                validate,
            )
            .await
        }

        Commands::Dashboard {
            source_path,
            output_path,
            stage_name,
            project_name,
            no_alarms,
        } => {
            let dashboard = DashboardTemplate::new(
                &project_name,
                &stage_name,
                &source_path,
                &output_path,
                &random_suffix(),
                !no_alarms,
            )?;

            // Standalone runs bind against the fixed cluster-stack outputs.
            let bindings = EXPECTED_BINDINGS
                .iter()
                .map(|key| {
                    (
                        key.to_string(),
                        get_att(CLUSTER_RESOURCE, &format!("Outputs.{}", key)),
                    )
                })
                .collect();
            let written = dashboard
                .generate(&bindings)
                .context("generating dashboard fragment")?;
            info!(path = %written.display(), "dashboard fragment complete");
            Ok(())
        }

        Commands::LoadMetric {
            queue_name,
            group_name,
            stack_name,
            region,
        } => {
            let metric = LoadMetric::new(queue_name, group_name, stack_name, region).await;
            metric.run_once().await.context("evaluating cluster load")?;
            Ok(())
        }
    }
}

async fn run_update(
    run_config: RunConfig,
    additional_template: Option<PathBuf>,
    stage_overrides: Option<PathBuf>,
    dashboard_source: Option<PathBuf>,
    dashboard_policies: Option<PathBuf>,
    validate: bool,
) -> Result<()> {
    let suffix = random_suffix();
    let region = run_config.region.clone();
    let output_path = run_config.output_path.clone();
    let stage_name = run_config.stage_name.clone();
    let project_name = run_config.project_name.clone();
    let load_balancer = run_config.load_balancer;

    let mut run = UpdateRun::new(run_config, &suffix).context("loading templates")?;

    if let Some(path) = stage_overrides {
        let overrides = config::parse_stage_overrides(&path, &stage_name)
            .context("parsing stage overrides")?;
        run.apply_stage_overrides(&overrides)
            .context("applying stage overrides")?;
    }

    run.merge_policies().context("merging IAM policies")?;

    if load_balancer {
        let written = run
            .attach_load_balancer()
            .context("attaching load balancer stack")?;
        info!(path = %written.display(), "load balancer stack written");
    }

    if let Some(path) = additional_template {
        let stack_name = run
            .add_additional_template(&path)
            .context("merging additional template")?;
        info!(stack = %stack_name, "additional template merged");
    }

    if let Some(source) = dashboard_source {
        if let Some(policies) = dashboard_policies {
            run.merge_policies_from(&policies)
                .context("merging dashboard policies")?;
        }
        let bindings = run
            .wire_dashboard_outputs()
            .context("wiring dashboard outputs")?;
        run.append_metrics_userdata()
            .context("appending instance metrics userdata")?;

        let dashboard = DashboardTemplate::new(
            &project_name,
            &stage_name,
            &source,
            &output_path,
            &suffix,
            true,
        )?;
        let written = dashboard
            .generate(&bindings)
            .context("generating dashboard fragment")?;
        info!(path = %written.display(), "dashboard fragment written");
    }

    let templates = run.into_templates();
    let written = writer::save_templates(&templates, &output_path).context("writing templates")?;

    if validate {
        let validator = writer::Validator::new(region).await;
        for entry in &written {
            validator
                .validate(entry.template.as_str(), &entry.body)
                .await?;
        }
    }

    info!("update complete");
    return Ok(());
}
