//! Deployment-time composition of the Turbine cluster's CloudFormation
//! templates: policy injection, nested-stack stitching, load balancer and
//! dashboard generation, and the cluster-load metric collaborator.

pub mod config;
pub mod dashboard;
pub mod document;
pub mod loadbalancer;
pub mod loader;
pub mod metrics;
pub mod policy;
pub mod stitch;
pub mod update;
pub mod writer;
