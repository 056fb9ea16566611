//! Cluster load metric, republished from queue and autoscaling metrics.
//!
//! The load ratio is `1 - requests / (machines * polling frequency)`. It is
//! deliberately left unclamped: a burst of empty receives can push it below
//! zero and a starved queue above one, and downstream scaling policies were
//! tuned against those raw values.

use std::time::{SystemTime, UNIX_EPOCH};

use aws_config::meta::region::RegionProviderChain;
use aws_sdk_cloudwatch::model::{
    Dimension, Metric, MetricDataQuery, MetricDatum, MetricStat, ScanBy, StandardUnit,
};
use aws_sdk_cloudwatch::types::DateTime;
use aws_sdk_cloudwatch::Region;
use tracing::info;

/// Observed SQS empty-receive rate per worker per minute.
pub const POLLS_PER_MINUTE: f64 = 5.5;

const CUSTOM_NAMESPACE: &str = "Turbine";
const LOAD_METRIC_NAME: &str = "ClusterLoad";

const QUEUE_MESSAGES_ID: &str = "maxANOMV";
const EMPTY_RECEIVES_ID: &str = "sumNOER";
const IN_SERVICE_ID: &str = "avgGISI";

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Service error ocurred: {0}.")]
    ServiceError(String),

    #[error("No datapoint for metric `{0}` at the evaluation timestamp")]
    MissingMetric(String),

    #[error("Unknown error ocurred: {0}.")]
    UnknownError(String),
}

/// The raw load formula. `None` means an idle cluster with nothing queued,
/// where publishing a datapoint would only add noise.
pub fn cluster_load(messages: f64, requests: f64, machines: f64) -> Option<f64> {
    if machines > 0.0 {
        return Some(1.0 - requests / (machines * POLLS_PER_MINUTE));
    }
    if messages > 0.0 {
        return Some(1.0);
    }
    return None;
}

/// Start of the one-minute evaluation window: two minutes back (the source
/// metrics lag that far behind) and truncated to the whole minute.
pub fn evaluation_epoch(now_epoch_secs: i64) -> i64 {
    let shifted = now_epoch_secs - 120;
    return shifted - shifted.rem_euclid(60);
}

pub struct LoadMetric {
    client: aws_sdk_cloudwatch::Client,
    queue_name: String,
    group_name: String,
    stack_name: String,
}

impl LoadMetric {
    pub async fn new(
        queue_name: String,
        group_name: String,
        stack_name: String,
        region: Option<String>,
    ) -> Self {
        let region = match region {
            Some(provided_region) => Some(Region::new(provided_region)),
            None => RegionProviderChain::default_provider().region().await,
        };
        let sdk_config = aws_config::from_env().region(region).load().await;
        let client = aws_sdk_cloudwatch::Client::new(&sdk_config);
        return Self {
            client,
            queue_name,
            group_name,
            stack_name,
        };
    }

    /// One evaluation: read the three source metrics, compute the load and
    /// republish it. No retries; a missing datapoint is an operator problem.
    pub async fn run_once(&self) -> Result<(), Error> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|error| Error::UnknownError(error.to_string()))?
            .as_secs() as i64;
        let timestamp = evaluation_epoch(now);
        info!(timestamp, "evaluating cluster load");

        let (messages, requests, machines) = self.get_metrics(timestamp).await?;
        info!(messages, requests, machines, "source metrics");

        let load = match cluster_load(messages, requests, machines) {
            Some(load) => load,
            None => {
                info!("cluster idle and queue empty, nothing to publish");
                return Ok(());
            }
        };

        info!(load, "publishing cluster load");
        self.put_metric(timestamp, load).await?;
        return Ok(());
    }

    async fn get_metrics(&self, timestamp: i64) -> Result<(f64, f64, f64), Error> {
        let queue_dimension = Dimension::builder()
            .name("QueueName")
            .value(&self.queue_name)
            .build();

        let queries = vec![
            metric_query(
                QUEUE_MESSAGES_ID,
                "AWS/SQS",
                "ApproximateNumberOfMessagesVisible",
                queue_dimension.clone(),
                "Maximum",
                StandardUnit::Count,
            ),
            metric_query(
                EMPTY_RECEIVES_ID,
                "AWS/SQS",
                "NumberOfEmptyReceives",
                queue_dimension,
                "Sum",
                StandardUnit::Count,
            ),
            metric_query(
                IN_SERVICE_ID,
                "AWS/AutoScaling",
                "GroupInServiceInstances",
                Dimension::builder()
                    .name("AutoScalingGroupName")
                    .value(&self.group_name)
                    .build(),
                "Average",
                StandardUnit::None,
            ),
        ];

        let result = self
            .client
            .get_metric_data()
            .start_time(DateTime::from_secs(timestamp))
            .end_time(DateTime::from_secs(timestamp + 60))
            .scan_by(ScanBy::TimestampAscending)
            .set_metric_data_queries(Some(queries))
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(aws_sdk_cloudwatch::types::SdkError::ServiceError { err, .. }) => {
                return Err(Error::ServiceError(err.to_string()));
            }
            Err(err) => return Err(Error::UnknownError(err.to_string())),
        };

        let results = response.metric_data_results().unwrap_or_default();
        let value_of = |id: &str| -> Result<f64, Error> {
            let result = results
                .iter()
                .find(|entry| entry.id() == Some(id))
                .ok_or_else(|| Error::MissingMetric(id.to_string()))?;
            let timestamps = result.timestamps().unwrap_or_default();
            let values = result.values().unwrap_or_default();
            timestamps
                .iter()
                .zip(values)
                .find(|(at, _)| at.secs() == timestamp)
                .map(|(_, value)| *value)
                .ok_or_else(|| Error::MissingMetric(id.to_string()))
        };

        return Ok((
            value_of(QUEUE_MESSAGES_ID)?,
            value_of(EMPTY_RECEIVES_ID)?,
            value_of(IN_SERVICE_ID)?,
        ));
    }

    async fn put_metric(&self, timestamp: i64, value: f64) -> Result<(), Error> {
        let datum = MetricDatum::builder()
            .metric_name(LOAD_METRIC_NAME)
            .dimensions(
                Dimension::builder()
                    .name("StackName")
                    .value(&self.stack_name)
                    .build(),
            )
            .timestamp(DateTime::from_secs(timestamp))
            .value(value)
            .unit(StandardUnit::None)
            .build();

        let result = self
            .client
            .put_metric_data()
            .namespace(CUSTOM_NAMESPACE)
            .metric_data(datum)
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(aws_sdk_cloudwatch::types::SdkError::ServiceError { err, .. }) => {
                Err(Error::ServiceError(err.to_string()))
            }
            Err(err) => Err(Error::UnknownError(err.to_string())),
        }
    }
}

fn metric_query(
    id: &str,
    namespace: &str,
    metric_name: &str,
    dimension: Dimension,
    stat: &str,
    unit: StandardUnit,
) -> MetricDataQuery {
    MetricDataQuery::builder()
        .id(id)
        .metric_stat(
            MetricStat::builder()
                .metric(
                    Metric::builder()
                        .namespace(namespace)
                        .metric_name(metric_name)
                        .dimensions(dimension)
                        .build(),
                )
                .period(60)
                .stat(stat)
                .unit(unit)
                .build(),
        )
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_formula_is_unclamped() {
        // 220 empty receives against 10 machines polling 5.5 times a
        // minute: the ratio goes far negative and stays that way.
        assert_eq!(Some(-3.0), cluster_load(0.0, 220.0, 10.0));
    }

    #[test]
    fn pending_messages_with_no_machines_is_full_load() {
        assert_eq!(Some(1.0), cluster_load(3.0, 0.0, 0.0));
    }

    #[test]
    fn idle_cluster_publishes_nothing() {
        assert_eq!(None, cluster_load(0.0, 0.0, 0.0));
    }

    #[test]
    fn zero_requests_is_full_load() {
        assert_eq!(Some(1.0), cluster_load(0.0, 0.0, 4.0));
    }

    #[test]
    fn evaluation_epoch_truncates_to_the_minute() {
        // 2021-01-01T00:10:45 -> 00:08:00
        let now = 1609459845;
        let expected = 1609459680;
        assert_eq!(expected, evaluation_epoch(now));
        // Already-aligned timestamps just move back two minutes.
        assert_eq!(1609459560, evaluation_epoch(1609459680));
    }
}
