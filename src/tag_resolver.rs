use crate::config::Registry;
use crate::matcher::select_latest_matching;
use crate::oci_registry::{RegistryTransport, TransportError};
use crate::version::ParsedVersion;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry {host} unavailable for {repository}: {source}")]
    Unavailable {
        host: String,
        repository: String,
        #[source]
        source: TransportError,
    },
    #[error("registry {host} did not answer for {repository} within {timeout:?}")]
    TimedOut {
        host: String,
        repository: String,
        timeout: Duration,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    repository: String,
    registry_host: String,
}

type TagList = Arc<Vec<String>>;
type FetchOutcome = Result<TagList, Arc<RegistryError>>;

/// Resolves the newest registry tag sharing the format of a running tag.
///
/// Tag lists are cached per `(repository, registry host)` in an LRU of fixed capacity. Each
/// entry is a cell that the first lookup of a cold key fills, concurrent lookups of the same
/// key wait for that fill instead of calling the registry again. A failed fetch is stored as
/// well, every lookup of the key shares that error until [`RegistryTagResolver::forget_failures`]
/// runs at the start of the next cycle.
pub struct RegistryTagResolver {
    transport: Arc<dyn RegistryTransport>,
    cache: Mutex<LruCache<CacheKey, Arc<OnceCell<FetchOutcome>>>>,
    timeout: Duration,
    page_limit: usize,
}

impl RegistryTagResolver {
    pub fn new(
        transport: Arc<dyn RegistryTransport>,
        cache_capacity: NonZeroUsize,
        timeout: Duration,
        page_limit: usize,
    ) -> Self {
        Self {
            transport,
            cache: Mutex::new(LruCache::new(cache_capacity)),
            timeout,
            page_limit,
        }
    }

    /// Newest tag of `repository` in the format of `current_tag`, restricted to the
    /// `pinned_major` line when set.
    pub async fn latest_matching_tag(
        &self,
        repository: &str,
        registry_host: &str,
        current_tag: &str,
        pinned_major: Option<u64>,
        registry: Option<&Registry>,
    ) -> Result<Option<String>, Arc<RegistryError>> {
        let tags = self.tags(repository, registry_host, registry).await?;
        let reference = ParsedVersion::parse(current_tag);
        match pinned_major {
            Some(major) => {
                let pinned: Vec<&str> = tags
                    .iter()
                    .map(String::as_str)
                    .filter(|tag| ParsedVersion::parse(tag).major() == major)
                    .collect();
                Ok(select_latest_matching(&reference, pinned.as_slice()))
            }
            None => Ok(select_latest_matching(&reference, tags.as_slice())),
        }
    }

    /// Drops every cached tag list, e.g. after registry credentials changed.
    pub async fn clear_cache(&self) {
        let mut cache = self.cache.lock().await;
        info!("Clearing {} cached tag lists", cache.len());
        cache.clear();
    }

    /// Drops cached fetch failures so the next cycle asks the registry again. Successful tag
    /// lists stay cached.
    pub async fn forget_failures(&self) {
        let mut cache = self.cache.lock().await;
        let failed: Vec<CacheKey> = cache
            .iter()
            .filter(|(_, cell)| matches!(cell.get(), Some(Err(_))))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &failed {
            cache.pop(key);
        }
        if !failed.is_empty() {
            debug!("Forgot {} failed tag list fetches", failed.len());
        }
    }

    async fn tags(
        &self,
        repository: &str,
        registry_host: &str,
        registry: Option<&Registry>,
    ) -> FetchOutcome {
        let key = CacheKey {
            repository: repository.to_string(),
            registry_host: registry_host.to_string(),
        };
        let cell = {
            let mut cache = self.cache.lock().await;
            match cache.get(&key).cloned() {
                Some(cell) => cell,
                None => {
                    let cell = Arc::new(OnceCell::new());
                    if let Some((evicted, _)) = cache.push(key, Arc::clone(&cell)) {
                        debug!(
                            "Evicted tag list of {}/{} from cache",
                            evicted.registry_host, evicted.repository
                        );
                    }
                    cell
                }
            }
        };

        cell.get_or_init(|| async {
            self.fetch(repository, registry_host, registry)
                .await
                .map_err(Arc::new)
        })
        .await
        .clone()
    }

    async fn fetch(
        &self,
        repository: &str,
        registry_host: &str,
        registry: Option<&Registry>,
    ) -> Result<TagList, RegistryError> {
        debug!("Fetching tag list of {}/{}", registry_host, repository);
        let listing =
            self.transport
                .list_tags(repository, registry_host, self.page_limit, registry);
        match tokio::time::timeout(self.timeout, listing).await {
            Ok(Ok(tags)) => Ok(Arc::new(tags)),
            Ok(Err(source)) => Err(RegistryError::Unavailable {
                host: registry_host.to_string(),
                repository: repository.to_string(),
                source,
            }),
            Err(_) => Err(RegistryError::TimedOut {
                host: registry_host.to_string(),
                repository: repository.to_string(),
                timeout: self.timeout,
            }),
        }
    }
}
