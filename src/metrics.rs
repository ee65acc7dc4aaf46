//! Per-cycle metrics event: `{source, description, score}` POSTed as JSON.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use crate::config::MetricsConfig;
use crate::error::MetricsError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsEvent {
    pub source: String,
    pub description: String,
    pub score: f64,
}

#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record(&self, event: &MetricsEvent) -> Result<(), MetricsError>;
}

pub struct HttpMetrics {
    http: Client,
    endpoint: String,
}

impl HttpMetrics {
    pub fn new(endpoint: &str) -> Result<Self, MetricsError> {
        let http = Client::builder().timeout(Duration::from_secs(5)).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl MetricsSink for HttpMetrics {
    async fn record(&self, event: &MetricsEvent) -> Result<(), MetricsError> {
        let resp = self.http.post(&self.endpoint).json(event).send().await?;
        if !resp.status().is_success() {
            return Err(MetricsError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}

pub struct NoMetrics;

#[async_trait]
impl MetricsSink for NoMetrics {
    async fn record(&self, _event: &MetricsEvent) -> Result<(), MetricsError> {
        Ok(())
    }
}

pub fn from_config(cfg: &MetricsConfig) -> Result<Box<dyn MetricsSink>, MetricsError> {
    match cfg.endpoint.as_deref() {
        Some(endpoint) if cfg.enabled && !endpoint.is_empty() => Ok(Box::new(HttpMetrics::new(endpoint)?)),
        _ => Ok(Box::new(NoMetrics)),
    }
}
