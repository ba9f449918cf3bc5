//! Image reference parsing.
//!
//! Splits strings such as `nginx:1.21`, `acme/app` or
//! `ghcr.io/acme/app:v2.0.0@sha256:...` into registry host, namespace,
//! repository and tag.  Parsing never fails: anything that cannot be read
//! as a reference comes back as an "unknown" [`ImageRef`] so callers can
//! skip it instead of erroring out.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Registry assumed when the reference carries no explicit host.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Namespace of top-level ("official") repositories on the default registry.
pub const OFFICIAL_NAMESPACE: &str = "library";

pub const DEFAULT_TAG: &str = "latest";

const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub registry_host: String,
    pub namespace: Option<String>,
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    /// Parses a raw image string.  Never fails; see the module docs.
    pub fn parse(raw: &str) -> ImageRef {
        parse_parts(raw).unwrap_or_else(|| ImageRef::unknown(raw))
    }

    fn unknown(raw: &str) -> ImageRef {
        ImageRef {
            registry_host: UNKNOWN.to_string(),
            namespace: None,
            repository: raw.to_string(),
            tag: UNKNOWN.to_string(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.registry_host == UNKNOWN
    }

    pub fn is_default_registry(&self) -> bool {
        self.registry_host == DEFAULT_REGISTRY
    }

    #[cfg(test)]
    pub fn is_official(&self) -> bool {
        self.is_default_registry() && self.namespace.as_deref() == Some(OFFICIAL_NAMESPACE)
    }

    /// `namespace/repository`, or just the repository when there is no namespace.
    pub fn full_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}", ns, self.repository),
            None => self.repository.clone(),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            return f.write_str(&self.repository);
        }
        write!(f, "{}/{}:{}", self.registry_host, self.full_name(), self.tag)
    }
}

fn parse_parts(raw: &str) -> Option<ImageRef> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with("sha256:") {
        return None;
    }

    let without_digest = strip_digest(trimmed);
    let segments: Vec<&str> = without_digest.split('/').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return None;
    }

    let (registry_host, namespace, last) = if segments.len() > 1 && is_registry_host(segments[0])
    {
        let namespace = match segments.len() {
            2 => None,
            n => Some(segments[1..n - 1].join("/")),
        };
        (segments[0].to_string(), namespace, segments[segments.len() - 1])
    } else {
        let namespace = match segments.len() {
            1 => OFFICIAL_NAMESPACE.to_string(),
            n => segments[..n - 1].join("/"),
        };
        (DEFAULT_REGISTRY.to_string(), Some(namespace), segments[segments.len() - 1])
    };

    let (repository, tag) = match last.rsplit_once(':') {
        Some((name, tag)) => (name, tag),
        None => (last, DEFAULT_TAG),
    };
    if repository.is_empty() || tag.is_empty() || repository.contains(':') {
        return None;
    }

    Some(ImageRef {
        registry_host,
        namespace,
        repository: repository.to_string(),
        tag: tag.to_string(),
    })
}

fn strip_digest(raw: &str) -> &str {
    match raw.split_once('@') {
        Some((image, _digest)) => image,
        None => raw,
    }
}

fn is_registry_host(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

/// Splits a raw reference into the part the runtime pulls by and its tag,
/// e.g. `localhost:5000/app:1.0` into `("localhost:5000/app", Some("1.0"))`.
pub fn split_tag(raw: &str) -> (&str, Option<&str>) {
    let image = strip_digest(raw);
    let last_slash = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[last_slash..].rfind(':') {
        Some(i) => (&image[..last_slash + i], Some(&image[last_slash + i + 1..])),
        None => (image, None),
    }
}

/// Returns `raw` with its tag replaced by `tag` (or added when missing).
/// Any digest is dropped since it would pin the old content.
pub fn with_tag(raw: &str, tag: &str) -> String {
    let (name, _) = split_tag(raw);
    format!("{}:{}", name, tag)
}
