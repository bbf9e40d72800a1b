use crate::drift::Severity;
use crate::state::DriftResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Receives the complete result batch of every finished cycle.
#[async_trait]
pub trait ObservabilitySink: Send + Sync {
    async fn publish(&self, batch: Vec<DriftResult>);
}

/// Hands every batch to each inner sink in order.
pub struct FanOutSink {
    sinks: Vec<Arc<dyn ObservabilitySink>>,
}

impl FanOutSink {
    pub fn new(sinks: Vec<Arc<dyn ObservabilitySink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl ObservabilitySink for FanOutSink {
    async fn publish(&self, batch: Vec<DriftResult>) {
        for sink in &self.sinks {
            sink.publish(batch.clone()).await;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedBatch {
    pub checked_at: DateTime<Utc>,
    pub results: Vec<DriftResult>,
}

/// Keeps the most recent batch around for the `/results` endpoint.
#[derive(Default)]
pub struct ResultStore {
    latest: RwLock<Option<PublishedBatch>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn latest(&self) -> Option<PublishedBatch> {
        self.latest.read().await.clone()
    }
}

#[async_trait]
impl ObservabilitySink for ResultStore {
    async fn publish(&self, batch: Vec<DriftResult>) {
        for result in &batch {
            match result.severity {
                Severity::Ok => {}
                Severity::MinorWarning | Severity::MajorWarning => info!(
                    "Image {} in pod {}/{} runs {} but {} is desired ({} drift, severity {})",
                    result.image,
                    result.namespace,
                    result.pod_name,
                    result.current_tag,
                    result.desired_tag,
                    result.classification,
                    result.severity.level()
                ),
                Severity::Critical => warn!(
                    "Image {} in pod {}/{} runs {}, {} major versions behind desired {}",
                    result.image,
                    result.namespace,
                    result.pod_name,
                    result.current_tag,
                    -result.magnitude,
                    result.desired_tag
                ),
            }
        }

        *self.latest.write().await = Some(PublishedBatch {
            checked_at: Utc::now(),
            results: batch,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drift::Classification;

    fn result(severity: Severity) -> DriftResult {
        DriftResult {
            image: "quay.io/app".to_string(),
            namespace: "default".to_string(),
            pod_name: "app-0".to_string(),
            container_name: "app".to_string(),
            current_tag: "1.0.0".to_string(),
            desired_tag: "3.0.0".to_string(),
            latest_matching_tag: Some("3.1.0".to_string()),
            classification: Classification::Major,
            magnitude: -2,
            severity,
            latest_satisfies_desired: true,
            current_satisfies_desired: false,
        }
    }

    #[tokio::test]
    async fn test_publish_replaces_latest_batch() {
        let store = ResultStore::new();
        assert!(store.latest().await.is_none());

        store.publish(vec![result(Severity::Critical)]).await;
        store.publish(vec![]).await;

        let latest = store.latest().await.unwrap();
        assert!(latest.results.is_empty());
    }

    #[tokio::test]
    async fn test_fan_out_reaches_every_sink() {
        let first = Arc::new(ResultStore::new());
        let second = Arc::new(ResultStore::new());
        let sink = FanOutSink::new(vec![first.clone(), second.clone()]);

        sink.publish(vec![result(Severity::MajorWarning)]).await;

        assert_eq!(first.latest().await.unwrap().results.len(), 1);
        assert_eq!(second.latest().await.unwrap().results.len(), 1);
    }

    #[test]
    fn test_batch_serializes_camel_case() {
        let json = serde_json::to_value(result(Severity::Critical)).unwrap();
        assert_eq!(json["podName"], "app-0");
        assert_eq!(json["latestMatchingTag"], "3.1.0");
        assert_eq!(json["classification"], "major");
        assert_eq!(json["severity"], "critical");
        assert_eq!(json["magnitude"], -2);
        assert_eq!(json["latestSatisfiesDesired"], true);
    }
}
