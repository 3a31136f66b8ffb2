//! Docker Registry HTTP API v2 client.
//!
//! Every query degrades to an empty result on failure: an unreachable
//! registry must read as "nothing published", never as "everything removed".

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::error::{DeployError, Result};

const MANIFEST_ACCEPT: &str =
    "application/vnd.oci.image.manifest.v1+json, application/vnd.docker.distribution.manifest.v2+json";
const DIGEST_HEADER: &str = "Docker-Content-Digest";

/// Read access to the image registry.
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// Repository names in catalog order.
    async fn list_repositories(&self) -> Vec<String>;

    async fn get_tags(&self, repository: &str) -> Vec<String>;

    /// Content digest of `repository:tag`, if the tag exists.
    async fn get_digest(&self, repository: &str, tag: &str) -> Option<String>;

    /// True when the registry answers its API root.
    async fn ping(&self) -> bool;
}

#[derive(Deserialize)]
struct Catalog {
    #[serde(default)]
    repositories: Vec<String>,
}

#[derive(Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// RegistryClient
// ---------------------------------------------------------------------------

pub struct RegistryClient {
    base_url: String,
    http: reqwest::Client,
    ping_timeout: Duration,
}

impl RegistryClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(10))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeployError::Registry(format!("cannot build http client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            ping_timeout: Duration::from_secs(5),
        })
    }

    pub async fn try_list_repositories(&self) -> Result<Vec<String>> {
        let url = format!("{}/v2/_catalog", self.base_url);
        let resp = self.http.get(&url).send().await.map_err(request_error)?;
        let catalog: Catalog = check_status(resp)?.json().await.map_err(request_error)?;
        Ok(catalog.repositories)
    }

    pub async fn try_get_tags(&self, repository: &str) -> Result<Vec<String>> {
        let url = format!("{}/v2/{repository}/tags/list", self.base_url);
        let resp = self.http.get(&url).send().await.map_err(request_error)?;
        let list: TagList = check_status(resp)?.json().await.map_err(request_error)?;
        Ok(list.tags.unwrap_or_default())
    }

    /// `Ok(None)` when the tag does not exist or the registry omits the digest header.
    pub async fn try_get_digest(&self, repository: &str, tag: &str) -> Result<Option<String>> {
        let url = format!("{}/v2/{repository}/manifests/{tag}", self.base_url);
        let resp = self
            .http
            .head(&url)
            .header(reqwest::header::ACCEPT, MANIFEST_ACCEPT)
            .send()
            .await
            .map_err(request_error)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check_status(resp)?;
        Ok(resp
            .headers()
            .get(DIGEST_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string))
    }
}

#[async_trait]
impl ImageRegistry for RegistryClient {
    async fn list_repositories(&self) -> Vec<String> {
        match self.try_list_repositories().await {
            Ok(repos) => repos,
            Err(e) => {
                tracing::error!(error = %e, "failed to list registry repositories");
                Vec::new()
            }
        }
    }

    async fn get_tags(&self, repository: &str) -> Vec<String> {
        match self.try_get_tags(repository).await {
            Ok(tags) => tags,
            Err(e) => {
                tracing::error!(repository, error = %e, "failed to list tags");
                Vec::new()
            }
        }
    }

    async fn get_digest(&self, repository: &str, tag: &str) -> Option<String> {
        match self.try_get_digest(repository, tag).await {
            Ok(digest) => digest,
            Err(e) => {
                tracing::error!(repository, tag, error = %e, "failed to resolve digest");
                None
            }
        }
    }

    async fn ping(&self) -> bool {
        let url = format!("{}/v2/", self.base_url);
        match self.http.get(&url).timeout(self.ping_timeout).send().await {
            Ok(resp) => resp.status() == StatusCode::OK,
            Err(e) => {
                tracing::debug!(error = %e, "registry ping failed");
                false
            }
        }
    }
}

fn request_error(e: reqwest::Error) -> DeployError {
    DeployError::Registry(e.to_string())
}

fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        Err(DeployError::Registry(format!(
            "{} returned {status}",
            resp.url().path()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lists_catalog_repositories_in_order() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v2/_catalog")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"repositories":["orders","billing","api"]}"#)
            .create_async()
            .await;

        let client = RegistryClient::new(server.url()).unwrap();
        let repos = client.list_repositories().await;

        mock.assert_async().await;
        assert_eq!(repos, vec!["orders", "billing", "api"]);
    }

    #[tokio::test]
    async fn catalog_error_status_degrades_to_empty() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v2/_catalog")
            .with_status(503)
            .create_async()
            .await;

        let client = RegistryClient::new(server.url()).unwrap();
        assert!(client.try_list_repositories().await.is_err());
        assert!(client.list_repositories().await.is_empty());
    }

    #[tokio::test]
    async fn unreachable_registry_degrades_to_empty() {
        // Port 9 (discard) on localhost is not expected to serve HTTP.
        let client =
            RegistryClient::with_timeout("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        assert!(client.list_repositories().await.is_empty());
        assert!(client.get_tags("orders").await.is_empty());
        assert!(client.get_digest("orders", "latest").await.is_none());
        assert!(!client.ping().await);
    }

    #[tokio::test]
    async fn lists_tags_and_tolerates_null() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v2/orders/tags/list")
            .with_status(200)
            .with_body(r#"{"name":"orders","tags":["latest","v2"]}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/v2/empty/tags/list")
            .with_status(200)
            .with_body(r#"{"name":"empty","tags":null}"#)
            .create_async()
            .await;

        let client = RegistryClient::new(server.url()).unwrap();
        assert_eq!(client.get_tags("orders").await, vec!["latest", "v2"]);
        assert!(client.get_tags("empty").await.is_empty());
    }

    #[tokio::test]
    async fn digest_comes_from_header_with_manifest_accept() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("HEAD", "/v2/orders/manifests/latest")
            .match_header("accept", MANIFEST_ACCEPT)
            .with_status(200)
            .with_header("Docker-Content-Digest", "sha256:abc123")
            .create_async()
            .await;

        let client = RegistryClient::new(server.url()).unwrap();
        let digest = client.get_digest("orders", "latest").await;

        mock.assert_async().await;
        assert_eq!(digest.as_deref(), Some("sha256:abc123"));
    }

    #[tokio::test]
    async fn missing_tag_has_no_digest() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("HEAD", "/v2/orders/manifests/latest")
            .with_status(404)
            .create_async()
            .await;

        let client = RegistryClient::new(server.url()).unwrap();
        assert_eq!(client.try_get_digest("orders", "latest").await.unwrap(), None);
    }

    #[tokio::test]
    async fn ping_requires_200_from_api_root() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v2/")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let client = RegistryClient::new(format!("{}/", server.url())).unwrap();
        assert!(client.ping().await);
    }
}
