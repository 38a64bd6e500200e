//! Metric sources.
//!
//! A policy's `query` is opaque to the autoscaler: it is handed to a
//! [`MetricSource`] and must come back as one number. The shipped source
//! speaks the Prometheus HTTP query API.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{MetricError, MetricResult};

/// Evaluates a query expression to a single value.
#[async_trait]
pub trait MetricSource: Send + Sync + 'static {
    async fn query(&self, expr: &str) -> MetricResult<f64>;
}

/// Prometheus instant-query client (`GET /api/v1/query`).
///
/// Scalars are returned as is; an instant vector is reduced to its largest
/// sample, so a policy reacts to the hottest series it selects.
#[derive(Debug, Clone)]
pub struct PrometheusSource {
    client: reqwest::Client,
    base: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
enum QueryData {
    Scalar(Sample),
    Vector(Vec<Series>),
    Matrix(serde_json::Value),
    String(serde_json::Value),
}

#[derive(Debug, Deserialize)]
struct Series {
    value: Sample,
}

/// `[<unix seconds>, "<value>"]`
#[derive(Debug, Deserialize)]
struct Sample(f64, String);

impl PrometheusSource {
    pub fn new(base: &str, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl MetricSource for PrometheusSource {
    async fn query(&self, expr: &str) -> MetricResult<f64> {
        let resp = self
            .client
            .get(format!("{}/api/v1/query", self.base))
            .query(&[("query", expr)])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    MetricError::Timeout(self.timeout)
                } else {
                    MetricError::Unavailable(e.to_string())
                }
            })?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(MetricError::Unavailable(format!("prometheus replied {status}")));
        }
        let body: QueryResponse = resp
            .json()
            .await
            .map_err(|e| MetricError::Decode(e.to_string()))?;
        if body.status != "success" {
            return Err(MetricError::Query(
                body.error.unwrap_or_else(|| format!("status {}", body.status)),
            ));
        }

        let value = match body.data {
            Some(QueryData::Scalar(sample)) => parse_sample(&sample)?,
            Some(QueryData::Vector(series)) => {
                let mut max: Option<f64> = None;
                for s in &series {
                    let v = parse_sample(&s.value)?;
                    if v.is_nan() {
                        continue;
                    }
                    max = Some(max.map_or(v, |m| m.max(v)));
                }
                max.ok_or_else(|| MetricError::NoData(expr.to_string()))?
            }
            Some(QueryData::Matrix(_)) | Some(QueryData::String(_)) => {
                return Err(MetricError::Query(
                    "query must return a scalar or an instant vector".to_string(),
                ));
            }
            None => return Err(MetricError::Decode("response has no data".to_string())),
        };
        debug!(query = %expr, value, "metric queried");
        Ok(value)
    }
}

fn parse_sample(sample: &Sample) -> MetricResult<f64> {
    sample
        .1
        .parse::<f64>()
        .map_err(|e| MetricError::Decode(format!("sample {:?}: {e}", sample.1)))
}
