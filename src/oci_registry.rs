use crate::config::{Config, Registry, RegistryAuth};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, LINK, WWW_AUTHENTICATE};
use reqwest::{Certificate, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::fs;
use thiserror::Error;
use tracing::{debug, info};

static DOCKER_HUB_HOST: &str = "docker.io";
static DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";
/// Upper bound on followed `Link: rel="next"` pages per listing.
const MAX_TAG_PAGES: usize = 20;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to registry failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("registry {host} rejected the credentials")]
    Unauthorized { host: String },
    #[error("repository {repository} not found on registry {host}")]
    NotFound { host: String, repository: String },
    #[error("registry {host} returned error status {status}")]
    UnexpectedStatus { host: String, status: StatusCode },
    #[error("invalid registry response: {0}")]
    InvalidResponse(String),
}

/// Tag listing call against a container registry.
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    /// Lists the tags of `repository` on `registry_host`, in registry order.
    ///
    /// `registry` carries the configured access settings for the host, passed through untouched.
    async fn list_tags(
        &self,
        repository: &str,
        registry_host: &str,
        page_limit: usize,
        registry: Option<&Registry>,
    ) -> Result<Vec<String>, TransportError>;
}

pub fn create_client(config: &Config) -> Result<Client> {
    info!("Initializing OCI Registry HTTP client");
    // System certificates are loaded automatically with rustls-tls-native-roots
    let mut client_builder = Client::builder().user_agent(concat!(
        env!("CARGO_PKG_NAME"),
        "/",
        env!("CARGO_PKG_VERSION")
    ));

    for file_path in &config.tls.ca_certificate_paths {
        let file_content = fs::read(file_path)
            .with_context(|| format!("Failed to read file {}", file_path.display()))?;
        let cert = Certificate::from_pem(&file_content).context("Failed to parse certificate")?;
        client_builder = client_builder.add_root_certificate(cert);
    }

    client_builder.build().context("Failed to build HTTP client")
}

/// OCI Distribution API client, `GET /v2/<name>/tags/list`.
pub struct OciRegistryClient {
    client: Client,
}

#[derive(Debug, Deserialize)]
struct TagList {
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

impl OciRegistryClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn get(&self, url: &str, registry: Option<&Registry>, token: Option<&str>) -> RequestBuilder {
        let request = self.client.get(url).header(ACCEPT, "application/json");
        match token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => with_configured_auth(request, registry),
        }
    }

    /// Fetches a page, answering a `WWW-Authenticate: Bearer` challenge once when the
    /// configured credentials are not a bearer token already.
    async fn fetch_page(
        &self,
        url: &str,
        host: &str,
        registry: Option<&Registry>,
        challenge_token: &mut Option<String>,
    ) -> Result<Response, TransportError> {
        debug!("Fetching tag list from URL {}", url);
        let response = self
            .get(url, registry, challenge_token.as_deref())
            .send()
            .await?;

        let configured_bearer = matches!(
            registry.and_then(|r| r.auth.as_ref()),
            Some(RegistryAuth::Bearer { .. })
        );
        if response.status() != StatusCode::UNAUTHORIZED
            || challenge_token.is_some()
            || configured_bearer
        {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_bearer_challenge)
            .ok_or_else(|| TransportError::Unauthorized {
                host: host.to_string(),
            })?;

        let token = self.fetch_challenge_token(&challenge, registry).await?;
        let response = self.get(url, registry, Some(&token)).send().await?;
        *challenge_token = Some(token);
        Ok(response)
    }

    async fn fetch_challenge_token(
        &self,
        challenge: &BearerChallenge,
        registry: Option<&Registry>,
    ) -> Result<String, TransportError> {
        debug!("Requesting registry token from realm {}", challenge.realm);
        let mut query = Vec::new();
        if let Some(service) = &challenge.service {
            query.push(("service", service.as_str()));
        }
        if let Some(scope) = &challenge.scope {
            query.push(("scope", scope.as_str()));
        }

        let request = self.client.get(&challenge.realm).query(&query);
        let response = with_configured_auth(request, registry).send().await?;
        if !response.status().is_success() {
            return Err(TransportError::UnexpectedStatus {
                host: challenge.realm.clone(),
                status: response.status(),
            });
        }

        let token: TokenResponse = response.json().await?;
        token
            .token
            .or(token.access_token)
            .ok_or_else(|| TransportError::InvalidResponse("token response without token".into()))
    }
}

#[async_trait]
impl RegistryTransport for OciRegistryClient {
    async fn list_tags(
        &self,
        repository: &str,
        registry_host: &str,
        page_limit: usize,
        registry: Option<&Registry>,
    ) -> Result<Vec<String>, TransportError> {
        let scheme = match registry {
            Some(r) if r.plain_http => "http",
            _ => "https",
        };
        let (api_host, api_repository) = api_location(registry_host, repository);
        let base_url = format!("{}://{}", scheme, api_host);

        let mut url = format!(
            "{}/v2/{}/tags/list?n={}",
            base_url, api_repository, page_limit
        );
        let mut challenge_token = None;
        let mut tags = Vec::new();

        for _ in 0..MAX_TAG_PAGES {
            let response = self
                .fetch_page(&url, registry_host, registry, &mut challenge_token)
                .await?;

            match response.status() {
                status if status.is_success() => {}
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    return Err(TransportError::Unauthorized {
                        host: registry_host.to_string(),
                    });
                }
                StatusCode::NOT_FOUND => {
                    return Err(TransportError::NotFound {
                        host: registry_host.to_string(),
                        repository: repository.to_string(),
                    });
                }
                status => {
                    return Err(TransportError::UnexpectedStatus {
                        host: registry_host.to_string(),
                        status,
                    });
                }
            }

            let next = response
                .headers()
                .get(LINK)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_next_link);

            let page: TagList = response
                .json()
                .await
                .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
            tags.extend(page.tags.unwrap_or_default());

            match next {
                Some(next) if next.starts_with("http://") || next.starts_with("https://") => {
                    url = next
                }
                Some(next) => url = format!("{}{}", base_url, next),
                None => break,
            }
        }

        debug!(
            "Registry {} lists {} tags for {}",
            registry_host,
            tags.len(),
            repository
        );
        Ok(tags)
    }
}

fn with_configured_auth(request: RequestBuilder, registry: Option<&Registry>) -> RequestBuilder {
    match registry.and_then(|r| r.auth.as_ref()) {
        Some(RegistryAuth::Bearer { token }) => request.header(
            AUTHORIZATION,
            format!("Bearer {}", token.expose_secret()),
        ),
        Some(RegistryAuth::Basic { username, password }) => {
            request.basic_auth(username, Some(password.expose_secret()))
        }
        None => request,
    }
}

/// Docker Hub serves its API from a different host and keeps official images under `library/`.
fn api_location<'a>(registry_host: &'a str, repository: &'a str) -> (&'a str, String) {
    if registry_host == DOCKER_HUB_HOST {
        let repository = if repository.contains('/') {
            repository.to_string()
        } else {
            format!("library/{}", repository)
        };
        (DOCKER_HUB_API_HOST, repository)
    } else {
        (registry_host, repository.to_string())
    }
}

/// Extracts the target of `<...>; rel="next"` from a `Link` header.
fn parse_next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|link| {
        let (target, params) = link.split_once(';')?;
        let is_next = params
            .split(';')
            .any(|p| p.trim().trim_start_matches("rel=").trim_matches('"') == "next");
        if !is_next {
            return None;
        }
        let target = target.trim().strip_prefix('<')?.strip_suffix('>')?;
        Some(target.to_string())
    })
}

fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let params = header.trim().strip_prefix("Bearer ")?;
    let mut realm = None;
    let mut service = None;
    let mut scope = None;

    // values are quoted and may contain commas themselves, e.g. scope="repository:a:pull,push"
    let mut rest = params.trim();
    while !rest.is_empty() {
        let (key, after_key) = rest.split_once('=')?;
        let after_key = after_key.strip_prefix('"')?;
        let (value, after_value) = after_key.split_once('"')?;
        match key.trim() {
            "realm" => realm = Some(value.to_string()),
            "service" => service = Some(value.to_string()),
            "scope" => scope = Some(value.to_string()),
            _ => {}
        }
        rest = after_value.trim_start().trim_start_matches(',').trim_start();
    }

    Some(BearerChallenge {
        realm: realm?,
        service,
        scope,
    })
}
