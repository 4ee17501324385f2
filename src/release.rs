//! Release lookup for the external binary
//!
//! Queries a GitHub-compatible releases API and picks the asset built
//! for this platform. A missing repository, an empty release list or an
//! unknown version is an empty result rather than an error.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::config::ManagerConfig;
use crate::error::{ManagerError, NetworkError, ValidationError};

/// Substring identifying the asset for this platform
pub const PLATFORM_MARKER: &str = "Linux-x86_64";

/// Request timeout for release API calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const USER_AGENT: &str = concat!("edgevpn-manager/", env!("CARGO_PKG_VERSION"));

/// A release together with its platform asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedRelease {
    /// Release name, also the cached version name
    pub name: String,
    pub tag: String,
    pub asset_name: String,
    pub download_url: String,
}

#[derive(Debug, Deserialize)]
struct ApiRelease {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    tag_name: String,
    #[serde(default)]
    assets: Vec<ApiAsset>,
}

impl ApiRelease {
    fn display_name(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => &self.tag_name,
        }
    }

    fn platform_asset(&self) -> Option<&ApiAsset> {
        self.assets.iter().find(|a| a.name.contains(PLATFORM_MARKER))
    }
}

#[derive(Debug, Deserialize)]
struct ApiAsset {
    name: String,
    browser_download_url: String,
}

/// Split an `owner/name` slug
pub fn parse_slug(slug: &str) -> Result<(&str, &str), ValidationError> {
    match slug.split('/').collect::<Vec<_>>().as_slice() {
        [owner, name] if !owner.is_empty() && !name.is_empty() => Ok((*owner, *name)),
        _ => Err(ValidationError::InvalidSlug {
            slug: slug.to_string(),
        }),
    }
}

/// Split `owner/name[@version]`; the version is empty when absent
pub fn parse_target(target: &str) -> (&str, &str) {
    match target.split_once('@') {
        Some((slug, version)) => (slug, version),
        None => (target, ""),
    }
}

/// Client for the releases API
pub struct ReleaseFinder {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl ReleaseFinder {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, NetworkError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| NetworkError::Request {
                url: base_url.to_string(),
                source: e,
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn from_config(config: &ManagerConfig) -> Result<Self, NetworkError> {
        Self::new(&config.release_api, config.github_token.clone())
    }

    /// Names of every published release, newest first
    pub async fn find_all(&self, slug: &str) -> Result<Vec<String>, ManagerError> {
        let (owner, name) = parse_slug(slug)?;
        let releases = self.list_releases(owner, name).await?.unwrap_or_default();
        Ok(releases
            .iter()
            .map(|r| r.display_name().to_string())
            .collect())
    }

    /// Release named `version`, or the newest one when `version` is empty
    pub async fn find(
        &self,
        slug: &str,
        version: &str,
    ) -> Result<Option<ResolvedRelease>, ManagerError> {
        let (owner, name) = parse_slug(slug)?;
        let Some(releases) = self.list_releases(owner, name).await? else {
            return Ok(None);
        };

        let release = if version.is_empty() {
            releases.first()
        } else {
            releases.iter().find(|r| r.display_name() == version)
        };
        let Some(release) = release else {
            tracing::info!("No release found for '{}' '{}'", slug, version);
            return Ok(None);
        };

        let asset = release
            .platform_asset()
            .ok_or_else(|| NetworkError::AssetNotFound {
                slug: slug.to_string(),
                version: release.display_name().to_string(),
            })?;

        tracing::debug!("Found {} at {}", asset.name, asset.browser_download_url);
        Ok(Some(ResolvedRelease {
            name: release.display_name().to_string(),
            tag: release.tag_name.clone(),
            asset_name: asset.name.clone(),
            download_url: asset.browser_download_url.clone(),
        }))
    }

    /// `None` when the API answers 404
    async fn list_releases(
        &self,
        owner: &str,
        name: &str,
    ) -> Result<Option<Vec<ApiRelease>>, NetworkError> {
        let url = format!("{}/repos/{}/{}/releases", self.base_url, owner, name);

        let mut request = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| NetworkError::Request {
            url: url.clone(),
            source: e,
        })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            tracing::info!("Release API returned 404. Repository or release not found");
            return Ok(None);
        }
        if !status.is_success() {
            tracing::error!("Release API returned {} for {}", status, url);
            return Err(NetworkError::Status {
                url,
                status: status.as_u16(),
            });
        }

        let releases = response
            .json::<Vec<ApiRelease>>()
            .await
            .map_err(|e| NetworkError::Request { url, source: e })?;
        Ok(Some(releases))
    }
}
