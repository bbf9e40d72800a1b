use std::fmt;
use thiserror::Error;

/// Registry assumed for references without an explicit registry host, e.g. `nginx:1.27`.
pub static DEFAULT_REGISTRY: &str = "docker.io";

static DIGEST_ALGORITHMS: [&str; 3] = ["sha256", "sha384", "sha512"];

/// One running container image, as observed in a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
    pub pod_name: String,
    pub namespace: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("repository is missing in image {0:?}")]
    MissingRepository(String),
    #[error("invalid repository segment {0:?}")]
    InvalidRepositorySegment(String),
    #[error("empty tag in image {0:?}")]
    EmptyTag(String),
    #[error("unsupported digest {0:?}")]
    InvalidDigest(String),
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl ImageReference {
    /// Parses `[registry/]repository[:tag][@digest]`.
    ///
    /// The leading path segment is only treated as a registry host when it looks like one
    /// (contains a `.` or a `:` port, or is `localhost`), otherwise the reference belongs to
    /// [`DEFAULT_REGISTRY`].
    pub fn parse(raw: &str, pod_name: &str, namespace: &str) -> Result<Self, ParseError> {
        let raw = raw.trim();

        let (name_and_tag, digest) = match raw.split_once('@') {
            Some((left, right)) => (left, Some(parse_digest(right)?)),
            None => (raw, None),
        };

        // A colon only introduces a tag when it comes after the last slash,
        // otherwise it is the port of the registry host.
        let last_slash = name_and_tag.rfind('/');
        let (name, tag) = match name_and_tag.rfind(':') {
            Some(pos) if last_slash.is_none_or(|slash| pos > slash) => {
                let tag = &name_and_tag[pos + 1..];
                if tag.is_empty() {
                    return Err(ParseError::EmptyTag(raw.to_string()));
                }
                (&name_and_tag[..pos], Some(tag.to_string()))
            }
            _ => (name_and_tag, None),
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest)) if is_registry_host(first) => (first, rest),
            _ => (DEFAULT_REGISTRY, name),
        };
        // `nginx` and `docker.io/library/nginx` name the same official image
        let repository = match repository.strip_prefix("library/") {
            Some(official) if registry == DEFAULT_REGISTRY && !official.contains('/') => official,
            _ => repository,
        };

        if repository.is_empty() {
            return Err(ParseError::MissingRepository(raw.to_string()));
        }
        if let Some(segment) = repository.split('/').find(|s| !is_valid_path_segment(s)) {
            return Err(ParseError::InvalidRepositorySegment(segment.to_string()));
        }

        Ok(Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag,
            digest,
            pod_name: pod_name.to_string(),
            namespace: namespace.to_string(),
        })
    }

    /// Join key against the configured desired versions.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }
}

fn is_registry_host(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

fn is_valid_path_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c))
}

fn parse_digest(segment: &str) -> Result<String, ParseError> {
    let (algorithm, hex) = segment
        .split_once(':')
        .ok_or_else(|| ParseError::InvalidDigest(segment.to_string()))?;

    if !DIGEST_ALGORITHMS.contains(&algorithm)
        || hex.is_empty()
        || !hex.chars().all(|c| c.is_ascii_hexdigit())
    {
        return Err(ParseError::InvalidDigest(segment.to_string()));
    }
    Ok(segment.to_string())
}
