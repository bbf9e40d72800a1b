use crate::config::{Config, ConfigStore};
use crate::drift::{Severity, classify};
use crate::image_reference::{ImageReference, ParseError};
use crate::inspection::{ClusterInspector, ObservedContainer};
use crate::state::DriftResult;
use crate::tag_resolver::{RegistryError, RegistryTagResolver};
use crate::version::ParsedVersion;
use futures::{StreamExt, future, stream};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
enum CheckError {
    #[error("invalid image reference: {0}")]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Registry(#[from] Arc<RegistryError>),
}

/// Runs version checks over every observed container.
pub struct Reconciler {
    inspector: Arc<dyn ClusterInspector>,
    resolver: Arc<RegistryTagResolver>,
    config: Arc<ConfigStore>,
    shutdown: CancellationToken,
}

impl Reconciler {
    pub fn new(
        inspector: Arc<dyn ClusterInspector>,
        resolver: Arc<RegistryTagResolver>,
        config: Arc<ConfigStore>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inspector,
            resolver,
            config,
            shutdown,
        }
    }

    /// One full pass over the cluster.
    ///
    /// Per-container failures only drop that container from the results. Returns `None` when
    /// there is nothing to publish: the cluster could not be inspected, or shutdown was requested
    /// before all checks finished.
    pub async fn run_cycle(&self) -> Option<Vec<DriftResult>> {
        let config = self.config.snapshot().await;
        info!("Starting version check");
        self.resolver.forget_failures().await;

        let containers = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                info!("Shutdown requested, skipping version check");
                return None;
            }
            containers = self.inspector.observed_containers(&config.namespaces) => containers,
        };
        let containers = match containers {
            Ok(containers) => containers,
            Err(e) => {
                error!("Failed to inspect cluster workloads: {:?}", e);
                return None;
            }
        };

        let checks = stream::iter(containers)
            .map(|container| self.check_container(container, &config))
            .buffer_unordered(config.reconciler.workers)
            .filter_map(future::ready)
            .collect::<Vec<_>>();

        let results = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                warn!("Shutdown requested, abandoning version check");
                return None;
            }
            results = checks => results,
        };

        info!("Version check completed with {} results", results.len());
        Some(results)
    }

    async fn check_container(
        &self,
        container: ObservedContainer,
        config: &Config,
    ) -> Option<DriftResult> {
        match self.try_check_container(&container, config).await {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    "Skipping container {} of pod {}/{} with image {}: {}",
                    container.container_name,
                    container.namespace,
                    container.pod_name,
                    container.raw_image,
                    e
                );
                None
            }
        }
    }

    async fn try_check_container(
        &self,
        container: &ObservedContainer,
        config: &Config,
    ) -> Result<Option<DriftResult>, CheckError> {
        let mut image = ImageReference::parse(
            &container.raw_image,
            &container.pod_name,
            &container.namespace,
        )?;
        let full_name = image.full_name();

        if image.tag.is_none() {
            if let Some(digest) = &image.digest {
                image.tag = config
                    .resolve_digest(&full_name, digest)
                    .map(str::to_string);
            }
        }
        let Some(current_tag) = image.tag.as_deref() else {
            debug!(
                "Skipping {} in pod {}/{}, no tag to compare",
                image, image.namespace, image.pod_name
            );
            return Ok(None);
        };
        let Some(image_config) = config.find_image(&full_name) else {
            debug!("Skipping {}, no desired version configured", full_name);
            return Ok(None);
        };

        let latest_matching_tag = self
            .resolver
            .latest_matching_tag(
                &image.repository,
                &image.registry,
                current_tag,
                image_config.pinned_major,
                config.find_registry_for_hostname(&image.registry),
            )
            .await?;

        let current = ParsedVersion::parse(current_tag);
        let desired = ParsedVersion::parse(&image_config.desired_tag);
        let (classification, magnitude) = classify(&current, &desired);
        let comparable = !current.is_unparseable() && !desired.is_unparseable();
        let latest_satisfies_desired = comparable
            && latest_matching_tag
                .as_deref()
                .is_some_and(|latest| ParsedVersion::parse(latest) >= desired);

        debug!(
            "Image {} in pod {}/{}: current {}, desired {}, latest {:?}, {} drift",
            full_name,
            image.namespace,
            image.pod_name,
            current,
            desired,
            latest_matching_tag,
            classification
        );

        Ok(Some(DriftResult {
            image: full_name,
            namespace: image.namespace.clone(),
            pod_name: image.pod_name.clone(),
            container_name: container.container_name.clone(),
            current_tag: current_tag.to_string(),
            desired_tag: image_config.desired_tag.clone(),
            latest_matching_tag,
            classification,
            magnitude,
            severity: Severity::from_drift(classification, magnitude),
            latest_satisfies_desired,
            current_satisfies_desired: comparable && current >= desired,
        }))
    }
}
