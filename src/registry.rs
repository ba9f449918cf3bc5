//! Registry metadata queries.
//!
//! Only the Docker Hub repository API is understood.  Other registries
//! report [`TagRegistry::supports`] as false and are skipped by the
//! detection engine rather than queried with a guessed API shape.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use reqwest::Client;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::image_ref::ImageRef;

pub const DOCKER_HUB_URL: &str = "https://registry.hub.docker.com";

/// Listing stops following `next` links once this many tags are known.
pub const MAX_TAGS: usize = 100;

#[async_trait]
pub trait TagRegistry: Send + Sync {
    /// Whether this client knows how to query the image's registry.
    fn supports(&self, image: &ImageRef) -> bool;

    /// Last time the image's exact tag was pushed, if the registry says.
    async fn tag_last_updated(&self, image: &ImageRef) -> Result<Option<DateTime<Utc>>>;

    async fn list_tags(&self, image: &ImageRef) -> Result<Vec<String>>;
}

#[derive(Debug, Deserialize)]
struct TagDetail {
    last_updated: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagPage {
    #[serde(default)]
    results: Vec<TagEntry>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

pub struct HubRegistryClient {
    client: Client,
    base_url: String,
}

impl HubRegistryClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::RegistryQuery(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn repository_url(&self, image: &ImageRef) -> String {
        format!("{}/v2/repositories/{}/tags", self.base_url, image.full_name())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::RegistryQuery(format!("{}: {}", url, e)))?;
        response
            .json::<T>()
            .await
            .map_err(|e| Error::RegistryQuery(format!("{}: invalid response: {}", url, e)))
    }
}

#[async_trait]
impl TagRegistry for HubRegistryClient {
    fn supports(&self, image: &ImageRef) -> bool {
        image.is_default_registry() && image.namespace.is_some()
    }

    async fn tag_last_updated(&self, image: &ImageRef) -> Result<Option<DateTime<Utc>>> {
        let url = format!("{}/{}", self.repository_url(image), image.tag);
        let detail: TagDetail = self.get_json(&url).await?;
        parse_timestamp(detail.last_updated.as_deref())
    }

    async fn list_tags(&self, image: &ImageRef) -> Result<Vec<String>> {
        let first = format!("{}/?page_size={}", self.repository_url(image), MAX_TAGS);
        collect_tags(first, |url| async move { self.get_json::<TagPage>(&url).await }).await
    }
}

/// Follows `next` links from `first` until the pages run out or
/// [`MAX_TAGS`] tags are known.
async fn collect_tags<F, Fut>(first: String, mut fetch: F) -> Result<Vec<String>>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<TagPage>>,
{
    let mut url = Some(first);
    let mut tags = Vec::new();
    while let Some(next) = url {
        let page = fetch(next).await?;
        tags.extend(page.results.into_iter().map(|t| t.name));
        if tags.len() >= MAX_TAGS {
            break;
        }
        url = page.next;
    }
    Ok(tags)
}

fn parse_timestamp(raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    match raw.filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| Error::RegistryQuery(format!("bad timestamp {:?}: {}", s, e))),
    }
}
