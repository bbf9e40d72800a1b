use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client};
use tracing::{debug, info};

/// One running container, as reported by the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedContainer {
    pub raw_image: String,
    pub container_name: String,
    pub pod_name: String,
    pub namespace: String,
}

#[async_trait]
pub trait ClusterInspector: Send + Sync {
    /// Containers running in `namespaces`, or in all namespaces when the slice is empty.
    async fn observed_containers(
        &self,
        namespaces: &[String],
    ) -> anyhow::Result<Vec<ObservedContainer>>;
}

pub async fn create_client() -> anyhow::Result<Client> {
    info!("Initializing K8s client");
    let client = Client::try_default().await?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to Kubernetes API server with version {}.{}, default namespace {}",
        api_server_info.major,
        api_server_info.minor,
        client.default_namespace()
    );
    Ok(client)
}

/// Lists pods through the Kubernetes API.
pub struct KubeInspector {
    client: Client,
}

impl KubeInspector {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn list_pods(&self, namespace: Option<&str>) -> anyhow::Result<Vec<Pod>> {
        let pods: Api<Pod> = match namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        };
        let pod_list = pods.list(&ListParams::default()).await.with_context(|| {
            format!(
                "Failed to list pods in {}",
                namespace.unwrap_or("all namespaces")
            )
        })?;
        Ok(pod_list.items)
    }
}

#[async_trait]
impl ClusterInspector for KubeInspector {
    async fn observed_containers(
        &self,
        namespaces: &[String],
    ) -> anyhow::Result<Vec<ObservedContainer>> {
        let mut pods = Vec::new();
        if namespaces.is_empty() {
            pods.extend(self.list_pods(None).await?);
        } else {
            for namespace in namespaces {
                pods.extend(self.list_pods(Some(namespace.as_str())).await?);
            }
        }

        let containers: Vec<ObservedContainer> = pods.iter().flat_map(pod_containers).collect();
        info!(
            "Observed {} containers in {} pods",
            containers.len(),
            pods.len()
        );
        Ok(containers)
    }
}

fn pod_containers(pod: &Pod) -> Vec<ObservedContainer> {
    let pod_name = pod.metadata.name.clone().unwrap_or_default();
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();

    let Some(spec) = pod.spec.as_ref() else {
        debug!("Skipping pod {} without spec", pod_name);
        return Vec::new();
    };

    spec.containers
        .iter()
        .filter_map(|container| match &container.image {
            Some(image) => Some(ObservedContainer {
                raw_image: image.clone(),
                container_name: container.name.clone(),
                pod_name: pod_name.clone(),
                namespace: namespace.clone(),
            }),
            None => {
                debug!(
                    "Skipping container {} in pod {} without image",
                    container.name, pod_name
                );
                None
            }
        })
        .collect()
}
