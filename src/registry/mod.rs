//! Client for image registries (Docker Registry HTTP API v2).
//!
//! The tag reconciler asks registries which tags exist for an image and
//! what image id a tag resolves to. Only the two read endpoints are
//! needed: `/v2/<name>/tags/list` and `/v2/<name>/manifests/<ref>`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Registry '{registry}' answered {status}: {body}")]
    Status {
        registry: String,
        status: u16,
        body: String,
    },

    #[error("No registry configured for '{0}'")]
    Unknown(String),
}

/// `GET /v2/<name>/tags/list` answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tags {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ManifestV2 {
    config: ManifestConfig,
}

#[derive(Debug, Deserialize)]
struct ManifestConfig {
    digest: String,
}

/// What a tag resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryImage {
    /// Image id (the config digest).
    pub id: String,
    pub tag: String,
}

/// One configured registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// Hostname the registry is referenced by in image strings; empty for
    /// the default registry.
    #[serde(default)]
    pub name: String,
    /// Base URL, e.g. `https://registry.example.com`.
    pub url: String,
}

/// Client for one registry.
pub struct RegistryClient {
    name: String,
    base_url: String,
    http: reqwest::Client,
}

impl RegistryClient {
    pub fn new(name: &str, base_url: &str) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("Failed to create HTTP client"),
        }
    }

    /// Tags of an image; None when the registry does not know it.
    pub async fn get_tags(&self, image: &str) -> Result<Option<Tags>, RegistryError> {
        let url = format!("{}/v2/{}/tags/list", self.base_url, image);
        let resp = self.http.get(&url).send().await?;
        match resp.status().as_u16() {
            200..=299 => Ok(Some(resp.json().await?)),
            404 => Ok(None),
            status => Err(RegistryError::Status {
                registry: self.name.clone(),
                status,
                body: resp.text().await.unwrap_or_default(),
            }),
        }
    }

    /// Resolve a tag to its image id; None when tag or image is unknown.
    pub async fn get_image(
        &self,
        image: &str,
        tag: &str,
    ) -> Result<Option<RegistryImage>, RegistryError> {
        let url = format!("{}/v2/{}/manifests/{}", self.base_url, image, tag);
        let resp = self
            .http
            .get(&url)
            .header(reqwest::header::ACCEPT, MANIFEST_V2)
            .send()
            .await?;
        match resp.status().as_u16() {
            200..=299 => {
                let manifest: ManifestV2 = resp.json().await?;
                Ok(Some(RegistryImage {
                    id: manifest.config.digest,
                    tag: tag.to_string(),
                }))
            }
            404 => Ok(None),
            status => Err(RegistryError::Status {
                registry: self.name.clone(),
                status,
                body: resp.text().await.unwrap_or_default(),
            }),
        }
    }
}

/// All configured registries, resolved by the hostname part of an image
/// reference.
pub struct RegistryRepository {
    entries: Vec<RegistryEntry>,
    clients: DashMap<String, Arc<RegistryClient>>,
}

impl RegistryRepository {
    pub fn new(entries: Vec<RegistryEntry>) -> Arc<Self> {
        Arc::new(Self {
            entries,
            clients: DashMap::new(),
        })
    }

    /// Names of every configured registry.
    pub fn available_registries(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    /// Client for the registry an image reference points at. The empty
    /// name resolves to the configured default registry.
    pub fn get_registry(&self, name: &str) -> Result<Arc<RegistryClient>, RegistryError> {
        if let Some(client) = self.clients.get(name) {
            return Ok(client.clone());
        }
        let entry = self
            .entries
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| RegistryError::Unknown(name.to_string()))?;
        debug!("Opening registry client for '{}' at {}", name, entry.url);
        let client = Arc::new(RegistryClient::new(&entry.name, &entry.url));
        self.clients.insert(name.to_string(), client.clone());
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_resolution() {
        let repo = RegistryRepository::new(vec![
            RegistryEntry {
                name: String::new(),
                url: "https://registry.example.com".to_string(),
            },
            RegistryEntry {
                name: "quay.io".to_string(),
                url: "https://quay.io".to_string(),
            },
        ]);

        assert!(repo.get_registry("").is_ok());
        assert!(repo.get_registry("quay.io").is_ok());
        assert!(matches!(
            repo.get_registry("ghcr.io"),
            Err(RegistryError::Unknown(_))
        ));
        assert_eq!(repo.available_registries(), vec!["", "quay.io"]);
    }

    #[test]
    fn test_tags_parse() {
        let tags: Tags =
            serde_json::from_str(r#"{"name":"team/app","tags":["1.0","1.1","latest"]}"#).unwrap();
        assert_eq!(tags.tags.len(), 3);
    }

    #[test]
    fn test_manifest_parse() {
        let manifest: ManifestV2 = serde_json::from_str(
            r#"{"schemaVersion":2,"config":{"digest":"sha256:abc","size":1}}"#,
        )
        .unwrap();
        assert_eq!(manifest.config.digest, "sha256:abc");
    }
}
