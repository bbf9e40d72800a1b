//! Fakes for the external collaborators, shared by the unit tests.

use crate::config::{Config, ConfigStore, Registry};
use crate::inspection::{ClusterInspector, ObservedContainer};
use crate::oci_registry::{RegistryTransport, TransportError};
use crate::sink::ObservabilitySink;
use crate::state::DriftResult;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
pub struct FakeTransport {
    tags: HashMap<(String, String), Vec<String>>,
    failing: Vec<(String, String)>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tags(mut self, registry_host: &str, repository: &str, tags: &[&str]) -> Self {
        self.tags.insert(
            (registry_host.to_string(), repository.to_string()),
            tags.iter().map(|t| t.to_string()).collect(),
        );
        self
    }

    pub fn failing_for(mut self, registry_host: &str, repository: &str) -> Self {
        self.failing
            .push((registry_host.to_string(), repository.to_string()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegistryTransport for FakeTransport {
    async fn list_tags(
        &self,
        repository: &str,
        registry_host: &str,
        _page_limit: usize,
        _registry: Option<&Registry>,
    ) -> Result<Vec<String>, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let key = (registry_host.to_string(), repository.to_string());
        if self.failing.contains(&key) {
            return Err(TransportError::UnexpectedStatus {
                host: registry_host.to_string(),
                status: StatusCode::SERVICE_UNAVAILABLE,
            });
        }
        Ok(self.tags.get(&key).cloned().unwrap_or_default())
    }
}

pub struct FakeInspector {
    containers: Option<Vec<ObservedContainer>>,
}

impl FakeInspector {
    /// `(raw image, pod, namespace)`, container name is derived from the pod.
    pub fn new(images: &[(&str, &str, &str)]) -> Self {
        let containers = images
            .iter()
            .map(|(image, pod, namespace)| ObservedContainer {
                raw_image: image.to_string(),
                container_name: format!("{}-main", pod),
                pod_name: pod.to_string(),
                namespace: namespace.to_string(),
            })
            .collect();
        Self {
            containers: Some(containers),
        }
    }

    pub fn failing() -> Self {
        Self { containers: None }
    }
}

#[async_trait]
impl ClusterInspector for FakeInspector {
    async fn observed_containers(
        &self,
        _namespaces: &[String],
    ) -> anyhow::Result<Vec<ObservedContainer>> {
        self.containers
            .clone()
            .ok_or_else(|| anyhow::anyhow!("cluster unreachable"))
    }
}

#[derive(Default)]
pub struct RecordingSink {
    batches: Mutex<Vec<Vec<DriftResult>>>,
}

impl RecordingSink {
    pub fn batches(&self) -> Vec<Vec<DriftResult>> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObservabilitySink for RecordingSink {
    async fn publish(&self, batch: Vec<DriftResult>) {
        self.batches.lock().unwrap().push(batch);
    }
}

pub fn config_store(yaml: &str) -> Arc<ConfigStore> {
    let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
    Arc::new(ConfigStore::new("/nonexistent/config.yaml", config))
}
