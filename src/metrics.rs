//! Prometheus exposition of the latest drift batch.
//!
//! | Metric | Value |
//! |--------|-------|
//! | `image_version_difference` | major delta `current - desired` |
//! | `image_version_status` | severity level, `0` ok, `1` minor warning, `2` one major behind, `3` critical |
//!
//! Both gauges are labelled with `image`, `namespace`, `pod`, `current`, `desired` and `latest`
//! (empty when no registry tag matched). Every published batch replaces all series, so images
//! that disappeared from the cluster or failed their registry lookup stop being exported.

use crate::sink::ObservabilitySink;
use crate::state::DriftResult;
use async_trait::async_trait;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use thiserror::Error;

const LABELS: &[&str] = &["image", "namespace", "pod", "current", "desired", "latest"];

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),
    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

pub struct DriftMetrics {
    registry: Registry,
    version_difference: GaugeVec,
    version_status: GaugeVec,
}

impl DriftMetrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let version_difference = GaugeVec::new(
            Opts::new(
                "image_version_difference",
                "Difference between current and desired image versions",
            ),
            LABELS,
        )?;
        registry.register(Box::new(version_difference.clone()))?;

        let version_status = GaugeVec::new(
            Opts::new(
                "image_version_status",
                "Status of image version (0=ok, 1, 2=warning, 3=critical)",
            ),
            LABELS,
        )?;
        registry.register(Box::new(version_status.clone()))?;

        Ok(Self {
            registry,
            version_difference,
            version_status,
        })
    }

    /// Text exposition format for scraping.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }

    fn record(&self, result: &DriftResult) {
        let labels = [
            result.image.as_str(),
            result.namespace.as_str(),
            result.pod_name.as_str(),
            result.current_tag.as_str(),
            result.desired_tag.as_str(),
            result.latest_matching_tag.as_deref().unwrap_or(""),
        ];
        self.version_difference
            .with_label_values(&labels[..])
            .set(result.magnitude as f64);
        self.version_status
            .with_label_values(&labels[..])
            .set(f64::from(result.severity.level()));
    }
}

#[async_trait]
impl ObservabilitySink for DriftMetrics {
    async fn publish(&self, batch: Vec<DriftResult>) {
        self.version_difference.reset();
        self.version_status.reset();
        for result in &batch {
            self.record(result);
        }
    }
}
