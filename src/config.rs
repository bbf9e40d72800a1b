use crate::secret_string::SecretString;
use anyhow::{Context, Result, ensure};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{env, fs};
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub webserver: Webserver,
    #[serde(default = "default_schedule")]
    pub schedule: String,
    /// Namespaces to inspect, all namespaces when empty
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default)]
    pub tls: Tls,
    #[serde(default)]
    pub reconciler: ReconcilerSettings,
    #[serde(default)]
    pub registries: Vec<Registry>,
    #[serde(default)]
    pub images: Vec<ImageConfig>,
}

#[derive(Debug, Deserialize)]
pub struct Webserver {
    pub port: u16,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tls {
    #[serde(default)]
    pub ca_certificate_paths: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconcilerSettings {
    pub workers: usize,
    pub registry_timeout_seconds: u64,
    pub tag_page_limit: usize,
    pub cache_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registry {
    pub hostname: String,
    #[serde(default)]
    pub plain_http: bool,
    pub auth: Option<RegistryAuth>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RegistryAuth {
    Bearer {
        token: SecretString,
    },
    Basic {
        username: String,
        password: SecretString,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfig {
    /// `registry/repository`, as produced by `ImageReference::full_name`
    pub name: String,
    pub desired_tag: String,
    pub pinned_major: Option<u64>,
    #[serde(default)]
    pub resolve_sha256: Vec<DigestResolution>,
}

#[derive(Debug, Deserialize)]
pub struct DigestResolution {
    pub tag: String,
    pub hash: String,
}

impl Default for Webserver {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            workers: 8,
            registry_timeout_seconds: 10,
            tag_page_limit: 500,
            cache_capacity: 100,
        }
    }
}

fn default_schedule() -> String {
    "0 0 * * * *".to_string()
}

impl Config {
    pub fn find_registry_for_hostname(&self, hostname: &str) -> Option<&Registry> {
        self.registries.iter().find(|r| r.hostname == hostname)
    }

    pub fn find_image(&self, full_name: &str) -> Option<&ImageConfig> {
        self.images.iter().find(|i| i.name == full_name)
    }

    /// Keys that differ from `previous` but are only read at startup. A reload accepts them
    /// without effect until the process restarts.
    pub fn changed_startup_settings(&self, previous: &Config) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.schedule != previous.schedule {
            changed.push("schedule");
        }
        if self.webserver.port != previous.webserver.port {
            changed.push("webserver.port");
        }
        if self.tls.ca_certificate_paths != previous.tls.ca_certificate_paths {
            changed.push("tls.caCertificatePaths");
        }
        let (current, before) = (&self.reconciler, &previous.reconciler);
        if current.registry_timeout_seconds != before.registry_timeout_seconds {
            changed.push("reconciler.registryTimeoutSeconds");
        }
        if current.tag_page_limit != before.tag_page_limit {
            changed.push("reconciler.tagPageLimit");
        }
        if current.cache_capacity != before.cache_capacity {
            changed.push("reconciler.cacheCapacity");
        }
        changed
    }

    /// Looks up the tag configured for a digest-pinned image.
    pub fn resolve_digest(&self, full_name: &str, digest: &str) -> Option<&str> {
        self.find_image(full_name)?
            .resolve_sha256
            .iter()
            .find(|r| r.hash == digest)
            .map(|r| r.tag.as_str())
    }

    fn validate(&self) -> Result<()> {
        ensure!(self.reconciler.workers > 0, "reconciler.workers must be > 0");
        ensure!(
            self.reconciler.cache_capacity > 0,
            "reconciler.cacheCapacity must be > 0"
        );
        ensure!(
            self.reconciler.tag_page_limit > 0,
            "reconciler.tagPageLimit must be > 0"
        );

        let mut seen = HashSet::new();
        for image in &self.images {
            ensure!(
                seen.insert(image.name.as_str()),
                "Image {} is configured more than once",
                image.name
            );
        }
        Ok(())
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config: Config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;
    config.validate()?;

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming every missing env var.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut missing = Vec::new();
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.push(var_name.to_string());
            String::new()
        })
    });
    ensure!(
        missing.is_empty(),
        "Missing environment variable: {}",
        missing.join(", ")
    );

    Ok(result.into_owned())
}

/// Holds the active config snapshot. Readers keep the `Arc` they got for as long as they need
/// it, a reload only swaps the pointer.
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<Arc<Config>>,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>, config: Config) -> Self {
        Self {
            path: path.into(),
            current: RwLock::new(Arc::new(config)),
        }
    }

    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = load_config(&path)?;
        Ok(Self::new(path, config))
    }

    pub async fn snapshot(&self) -> Arc<Config> {
        Arc::clone(&*self.current.read().await)
    }

    /// Re-reads the config file. On error the previous snapshot stays active.
    pub async fn reload(&self) -> Result<Arc<Config>> {
        let config = Arc::new(load_config(&self.path)?);
        *self.current.write().await = Arc::clone(&config);
        info!(
            "Reloaded config with {} images and {} registries",
            config.images.len(),
            config.registries.len()
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn desired_tag<'a>(config: &'a Config, image: &str) -> Option<&'a str> {
        config.find_image(image).map(|i| i.desired_tag.as_str())
    }

    const CONFIG_YAML: &str = r#"
        webserver:
          port: 9090
        schedule: "0 */5 * * * *"
        namespaces:
          - default
          - monitoring
        reconciler:
          workers: 4
        registries:
          - hostname: quay.io
            auth:
              type: bearer
              token: secret_token
          - hostname: localhost:5000
            plainHttp: true
            auth:
              type: basic
              username: user
              password: secret_password
          - hostname: docker.io
        images:
          - name: quay.io/keycloak/keycloak-operator
            desiredTag: 20.0.1
            pinnedMajor: 20
            resolveSha256:
              - tag: 20.0.0
                hash: sha256:abcd
          - name: docker.io/nginx
            desiredTag: 1.27.0
        "#;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let tmp_file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        fs::write(tmp_file.path(), content).expect("Failed to write to temp file");
        tmp_file
    }

    #[test]
    fn test_expand_env_vars_success() {
        unsafe {
            env::set_var("KVC_TEST_VAR", "value123");
        }
        let input = "This is a test: ${KVC_TEST_VAR}";
        let expanded = expand_env_vars(input).expect("Expansion should succeed");
        assert_eq!(expanded, "This is a test: value123");
        unsafe {
            env::remove_var("KVC_TEST_VAR");
        }
    }

    #[test]
    fn test_expand_env_vars_missing_var() {
        let input = "This will fail: ${KVC_MISSING_VAR}";
        let err = expand_env_vars(input).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing environment variable: KVC_MISSING_VAR"
        );
    }

    #[test]
    fn test_expand_env_vars_multiple_vars() {
        unsafe {
            env::set_var("KVC_VAR1", "foo");
            env::set_var("KVC_VAR2", "bar");
        }
        let input = "${KVC_VAR1} and ${KVC_VAR2}";
        let expanded = expand_env_vars(input).expect("Expansion should succeed");
        assert_eq!(expanded, "foo and bar");
        unsafe {
            env::remove_var("KVC_VAR1");
            env::remove_var("KVC_VAR2");
        }
    }

    #[test]
    fn test_expand_env_vars_no_vars() {
        let input = "No variables here";
        let expanded = expand_env_vars(input).expect("Expansion should succeed");
        assert_eq!(expanded, input);
    }

    #[test]
    fn test_load_config_file() {
        let tmp_file = write_config(CONFIG_YAML);
        let config = load_config(tmp_file.path()).expect("Should load config");

        assert_eq!(config.webserver.port, 9090);
        assert_eq!(config.schedule, "0 */5 * * * *");
        assert_eq!(config.namespaces, vec!["default", "monitoring"]);
        assert_eq!(config.reconciler.workers, 4);
        assert_eq!(config.reconciler.cache_capacity, 100);
        assert_eq!(config.reconciler.tag_page_limit, 500);
        assert_eq!(config.registries.len(), 3);
        assert!(config.tls.ca_certificate_paths.is_empty());

        match &config.registries[0].auth {
            Some(RegistryAuth::Bearer { token }) => {
                assert_eq!(token.expose_secret(), "secret_token")
            }
            other => panic!("unexpected auth {:?}", other),
        }
        let local = config.find_registry_for_hostname("localhost:5000").unwrap();
        assert!(local.plain_http);
        assert!(matches!(
            &local.auth,
            Some(RegistryAuth::Basic { username, .. }) if username == "user"
        ));
        assert!(config.find_registry_for_hostname("docker.io").unwrap().auth.is_none());
        assert!(config.find_registry_for_hostname("ghcr.io").is_none());
    }

    #[test]
    fn test_desired_tag_and_digest_resolution() {
        let tmp_file = write_config(CONFIG_YAML);
        let config = load_config(tmp_file.path()).expect("Should load config");

        assert_eq!(
            desired_tag(&config, "quay.io/keycloak/keycloak-operator"),
            Some("20.0.1")
        );
        assert_eq!(desired_tag(&config, "docker.io/redis"), None);
        assert_eq!(
            config
                .find_image("quay.io/keycloak/keycloak-operator")
                .unwrap()
                .pinned_major,
            Some(20)
        );
        assert_eq!(
            config.resolve_digest("quay.io/keycloak/keycloak-operator", "sha256:abcd"),
            Some("20.0.0")
        );
        assert_eq!(
            config.resolve_digest("quay.io/keycloak/keycloak-operator", "sha256:ffff"),
            None
        );
        assert_eq!(config.resolve_digest("docker.io/nginx", "sha256:abcd"), None);
    }

    #[test]
    fn test_load_config_defaults() {
        let tmp_file = write_config("images: []\n");
        let config = load_config(tmp_file.path()).expect("Should load config");
        assert_eq!(config.webserver.port, 8080);
        assert_eq!(config.schedule, "0 0 * * * *");
        assert!(config.namespaces.is_empty());
        assert_eq!(config.reconciler.workers, 8);
        assert_eq!(config.reconciler.registry_timeout_seconds, 10);
    }

    #[test]
    fn test_load_config_rejects_duplicate_images() {
        let tmp_file = write_config(
            r#"
            images:
              - name: docker.io/nginx
                desiredTag: 1.27.0
              - name: docker.io/nginx
                desiredTag: 1.26.0
            "#,
        );
        let err = load_config(tmp_file.path()).unwrap_err();
        assert!(err.to_string().contains("configured more than once"));
    }

    #[test]
    fn test_load_config_rejects_zero_workers() {
        let tmp_file = write_config("reconciler:\n  workers: 0\n");
        assert!(load_config(tmp_file.path()).is_err());
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous_snapshot() {
        let tmp_file = write_config(CONFIG_YAML);
        let store = ConfigStore::load(tmp_file.path()).expect("Should load config");
        let before = store.snapshot().await;

        fs::write(tmp_file.path(), "images: [this is: not valid").unwrap();
        assert!(store.reload().await.is_err());

        let after = store.snapshot().await;
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.images.len(), 2);
    }

    #[tokio::test]
    async fn test_reload_swaps_snapshot() {
        let tmp_file = write_config(CONFIG_YAML);
        let store = ConfigStore::load(tmp_file.path()).expect("Should load config");
        let before = store.snapshot().await;

        fs::write(
            tmp_file.path(),
            "images:\n  - name: docker.io/nginx\n    desiredTag: 1.28.0\n",
        )
        .unwrap();
        store.reload().await.expect("Reload should succeed");

        let after = store.snapshot().await;
        assert_eq!(desired_tag(&after, "docker.io/nginx"), Some("1.28.0"));
        // work started on the old snapshot still sees it
        assert_eq!(desired_tag(&before, "docker.io/nginx"), Some("1.27.0"));
    }

    #[test]
    fn test_changed_startup_settings() {
        let before: Config = serde_yaml_ng::from_str(
            "schedule: \"0 0 * * * *\"\nreconciler:\n  workers: 4\n  tagPageLimit: 500\n",
        )
        .unwrap();
        let after: Config = serde_yaml_ng::from_str(
            "schedule: \"0 */5 * * * *\"\nreconciler:\n  workers: 16\n  tagPageLimit: 100\n",
        )
        .unwrap();

        assert_eq!(
            after.changed_startup_settings(&before),
            vec!["schedule", "reconciler.tagPageLimit"]
        );
        assert!(before.changed_startup_settings(&before).is_empty());
    }
}
