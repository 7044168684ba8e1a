//! Metric evaluation against the Prometheus HTTP API
//!
//! Queries are opaque strings; the evaluator runs them as instant queries and
//! reduces the response to a single `f64`.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvalError {
    #[error("Prometheus HTTP error: {0}")]
    HttpError(String),

    #[error("Failed to parse response: {0}")]
    ParseError(String),

    #[error("No data returned from Prometheus")]
    NoData,

    #[error("Metric value is NaN")]
    NotANumber,

    #[error("Query timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Executes a metric query and returns its scalar value
#[async_trait]
pub trait MetricEvaluator: Send + Sync {
    async fn evaluate(&self, query: &str) -> Result<f64, EvalError>;
}

/// Prometheus instant query response format
#[derive(Debug, Deserialize)]
struct PrometheusResponse {
    status: String,
    #[serde(default)]
    data: Option<PrometheusData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
enum PrometheusData {
    Vector(Vec<PrometheusSample>),
    Scalar((f64, String)),
    // Payloads only need to parse; both shapes are rejected as unsupported
    Matrix(#[allow(dead_code)] serde_json::Value),
    String(#[allow(dead_code)] serde_json::Value),
}

#[derive(Debug, Deserialize)]
struct PrometheusSample {
    value: (f64, String), // [timestamp, value_as_string]
}

/// Parse a Prometheus sample value
///
/// Prometheus encodes special floats as "NaN", "+Inf" and "-Inf". NaN carries
/// no usable signal and is reported as an error; infinities are returned and
/// left to condition evaluation.
fn parse_sample_value(raw: &str) -> Result<f64, EvalError> {
    match raw {
        "NaN" => Err(EvalError::NotANumber),
        "+Inf" | "Inf" => Ok(f64::INFINITY),
        "-Inf" => Ok(f64::NEG_INFINITY),
        _ => {
            let value = raw
                .parse::<f64>()
                .map_err(|e| EvalError::ParseError(format!("Invalid value '{}': {}", raw, e)))?;
            if value.is_nan() {
                return Err(EvalError::NotANumber);
            }
            Ok(value)
        }
    }
}

/// Parse Prometheus instant query response and extract metric value
///
/// Vector results yield the first sample; scalar results yield the scalar.
fn parse_prometheus_instant_query(json_response: &str) -> Result<f64, EvalError> {
    let response: PrometheusResponse = serde_json::from_str(json_response)
        .map_err(|e| EvalError::ParseError(format!("Invalid JSON: {}", e)))?;

    if response.status != "success" {
        return Err(EvalError::HttpError(format!(
            "Prometheus query failed with status: {} ({})",
            response.status,
            response.error.unwrap_or_default()
        )));
    }

    match response.data {
        Some(PrometheusData::Vector(samples)) => {
            let sample = samples.first().ok_or(EvalError::NoData)?;
            parse_sample_value(&sample.value.1)
        }
        Some(PrometheusData::Scalar((_, raw))) => parse_sample_value(&raw),
        Some(PrometheusData::Matrix(_)) | Some(PrometheusData::String(_)) => Err(
            EvalError::ParseError("Query must return a vector or scalar".to_string()),
        ),
        None => Err(EvalError::NoData),
    }
}

/// Evaluator backed by a Prometheus server
#[derive(Clone)]
pub struct PrometheusEvaluator {
    client: reqwest::Client,
    address: String,
}

impl PrometheusEvaluator {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            address: address.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl MetricEvaluator for PrometheusEvaluator {
    async fn evaluate(&self, query: &str) -> Result<f64, EvalError> {
        let url = format!("{}/api/v1/query", self.address);
        debug!(query = %query, url = %url, "Querying Prometheus");

        let response = self
            .client
            .get(&url)
            .query(&[("query", query)])
            .send()
            .await
            .map_err(|e| EvalError::HttpError(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| EvalError::HttpError(e.to_string()))?;

        // Prometheus answers 400/422 with a JSON error body worth surfacing
        if !status.is_success() && !body.trim_start().starts_with('{') {
            return Err(EvalError::HttpError(format!("HTTP {}", status)));
        }

        parse_prometheus_instant_query(&body)
    }
}

/// Scripted evaluator for tests
#[cfg(test)]
#[allow(clippy::expect_used)]
pub struct MockMetricEvaluator {
    responses: std::sync::Mutex<std::collections::HashMap<String, MockResponse>>,
    calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
#[derive(Clone)]
pub enum MockResponse {
    Value(f64),
    Error(EvalError),
    Hang,
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl MockMetricEvaluator {
    pub fn new() -> Self {
        Self {
            responses: std::sync::Mutex::new(std::collections::HashMap::new()),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn set(&self, query: &str, response: MockResponse) {
        self.responses
            .lock()
            .expect("MockMetricEvaluator lock poisoned")
            .insert(query.to_string(), response);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
#[allow(clippy::expect_used)]
impl MetricEvaluator for MockMetricEvaluator {
    async fn evaluate(&self, query: &str) -> Result<f64, EvalError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let response = self
            .responses
            .lock()
            .expect("MockMetricEvaluator lock poisoned")
            .get(query)
            .cloned();
        match response {
            Some(MockResponse::Value(v)) => Ok(v),
            Some(MockResponse::Error(e)) => Err(e),
            Some(MockResponse::Hang) => std::future::pending().await,
            None => Err(EvalError::NoData),
        }
    }
}
