use std::future::Future;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use url::Url;

/// Server version from `GET /api/server-info/version`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

/// Album summary from `GET /api/albums`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Album {
    pub id: String,
    pub album_name: String,
    pub description: Option<String>,
    pub asset_count: u64,
}

/// A single asset as Immich reports it. Only photos (`type == "IMAGE"`)
/// are ever staged into a timelapse.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub id: String,
    pub original_file_name: String,
    pub file_created_at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub type_: String,
}

impl Asset {
    pub fn is_image(&self) -> bool {
        self.type_ == "IMAGE"
    }
}

/// Body for `POST /api/search/metadata`. Pagination is page-based; the
/// response carries the next page number until exhausted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchFilters {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taken_after: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taken_before: Option<DateTime<Utc>>,
    pub page: u32,
    pub size: u32,
}

impl SearchFilters {
    pub fn images(taken_after: Option<DateTime<Utc>>, taken_before: Option<DateTime<Utc>>) -> Self {
        Self {
            type_: "IMAGE".to_string(),
            taken_after,
            taken_before,
            page: 1,
            size: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct PingResponse {
    res: String,
}

#[derive(Debug, Clone, Deserialize)]
struct AlbumDetail {
    assets: Vec<Asset>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    assets: SearchPage,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchPage {
    items: Vec<Asset>,
    next_page: Option<serde_json::Value>,
}

/// Authenticated Immich REST API client.
#[derive(Debug)]
pub struct ImmichClient {
    base_url: Url,
    api_key: String,
    client: reqwest::Client,
}

impl ImmichClient {
    /// Create a client authenticating via the `x-api-key` header.
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid Immich base URL")?;

        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(api_key).context("invalid API key characters")?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            base_url,
            api_key: api_key.to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("failed to build URL for path: {path}"))
    }

    /// `GET /api/server-info/ping`. Returns true iff the server answers "pong"
    /// with the supplied key accepted.
    pub async fn validate_connection(&self) -> Result<bool> {
        let url = self.url("/api/server-info/ping")?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .context("failed to reach Immich server")?;

        if !resp.status().is_success() {
            return Ok(false);
        }

        let ping: PingResponse = resp
            .json()
            .await
            .context("failed to parse ping response")?;
        Ok(ping.res == "pong")
    }

    /// `GET /api/server-info/version`.
    pub async fn server_version(&self) -> Result<ServerVersion> {
        let url = self.url("/api/server-info/version")?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .context("failed to fetch server version")?;

        if !resp.status().is_success() {
            bail!(
                "Immich /api/server-info/version returned HTTP {}",
                resp.status().as_u16()
            );
        }

        resp.json::<ServerVersion>()
            .await
            .context("failed to parse server version response")
    }

    /// `GET /api/albums`, listing all albums visible to the key.
    pub async fn get_albums(&self) -> Result<Vec<Album>> {
        let url = self.url("/api/albums")?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .context("failed to fetch albums")?;

        if !resp.status().is_success() {
            bail!("Immich /api/albums returned HTTP {}", resp.status().as_u16());
        }

        resp.json::<Vec<Album>>()
            .await
            .context("failed to parse albums response")
    }

    /// `GET /api/albums/{id}`, returning the album's image assets.
    pub async fn get_album_assets(&self, album_id: &str) -> Result<Vec<Asset>> {
        let url = self.url(&format!("/api/albums/{album_id}"))?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to fetch album {album_id}"))?;

        if !resp.status().is_success() {
            bail!(
                "Immich /api/albums/{album_id} returned HTTP {}",
                resp.status().as_u16()
            );
        }

        let detail: AlbumDetail = resp
            .json()
            .await
            .context("failed to parse album response")?;

        Ok(detail
            .assets
            .into_iter()
            .filter(Asset::is_image)
            .collect())
    }

    /// `POST /api/search/metadata`, one page of image assets.
    async fn search_assets(&self, filters: &SearchFilters) -> Result<(Vec<Asset>, bool)> {
        let url = self.url("/api/search/metadata")?;
        let resp = self
            .client
            .post(url)
            .json(filters)
            .send()
            .await
            .context("failed to search assets")?;

        if !resp.status().is_success() {
            bail!(
                "Immich /api/search/metadata returned HTTP {}",
                resp.status().as_u16()
            );
        }

        let search: SearchResponse = resp
            .json()
            .await
            .context("failed to parse search response")?;

        let has_next = search
            .assets
            .next_page
            .as_ref()
            .is_some_and(|v| !v.is_null());
        Ok((search.assets.items, has_next))
    }

    /// All image assets in an optional capture-time window, paginating
    /// the metadata search until exhausted.
    pub async fn get_all_assets(
        &self,
        taken_after: Option<DateTime<Utc>>,
        taken_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Asset>> {
        let mut filters = SearchFilters::images(taken_after, taken_before);
        let mut assets = Vec::new();

        loop {
            let (page, has_next) = self.search_assets(&filters).await?;
            assets.extend(page.into_iter().filter(Asset::is_image));
            if !has_next {
                break;
            }
            filters.page += 1;
        }

        Ok(assets)
    }

    /// `GET /api/assets/{id}/original`. Full-resolution bytes, or None
    /// when the server refuses or no longer has the asset.
    pub async fn get_asset_original(&self, asset_id: &str) -> Result<Option<Vec<u8>>> {
        self.fetch_bytes(&format!("/api/assets/{asset_id}/original"))
            .await
    }

    /// `GET /api/assets/{id}/thumbnail?size=thumbnail`.
    pub async fn get_asset_thumbnail(&self, asset_id: &str) -> Result<Option<Vec<u8>>> {
        self.fetch_bytes(&format!("/api/assets/{asset_id}/thumbnail?size=thumbnail"))
            .await
    }

    async fn fetch_bytes(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let url = self.url(path)?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("request failed for {path}"))?;

        if !resp.status().is_success() {
            tracing::warn!(path, status = resp.status().as_u16(), "asset fetch refused");
            return Ok(None);
        }

        let bytes = resp
            .bytes()
            .await
            .with_context(|| format!("failed to read body for {path}"))?;
        Ok(Some(bytes.to_vec()))
    }
}

/// Source of original asset bytes, injected into the pipeline so tests
/// can run it without a live Immich server.
pub trait AssetSource: Send + Sync {
    fn fetch_original(
        &self,
        asset_id: &str,
    ) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;
}

impl AssetSource for ImmichClient {
    fn fetch_original(
        &self,
        asset_id: &str,
    ) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send {
        self.get_asset_original(asset_id)
    }
}

/// Case-insensitive filename match with a single optional `*` wildcard
/// on either end: `*x*` and a bare `x` match as substring, `x*` as
/// prefix, `*x` as suffix.
pub fn filename_matches(pattern: &str, name: &str) -> bool {
    let pattern = pattern.trim().to_lowercase();
    let name = name.to_lowercase();

    if pattern.is_empty() {
        return true;
    }

    if let Some(rest) = pattern.strip_prefix('*') {
        if let Some(infix) = rest.strip_suffix('*') {
            return name.contains(infix);
        }
        return name.ends_with(rest);
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return name.starts_with(prefix);
    }
    name.contains(pattern.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation_valid_url() {
        let client = ImmichClient::new("http://localhost:2283", "test-api-key");
        assert!(client.is_ok());
        let client = client.unwrap();
        assert_eq!(client.base_url().as_str(), "http://localhost:2283/");
        assert_eq!(client.api_key(), "test-api-key");
    }

    #[test]
    fn test_client_creation_invalid_url() {
        let client = ImmichClient::new("not a url", "key");
        assert!(client.is_err());
        let err = client.unwrap_err().to_string();
        assert!(err.contains("invalid Immich base URL"), "got: {err}");
    }

    #[test]
    fn test_client_url_construction() {
        let client = ImmichClient::new("http://photos:2283", "key").unwrap();
        let url = client.url("/api/server-info/ping").unwrap();
        assert_eq!(url.as_str(), "http://photos:2283/api/server-info/ping");

        let url = client.url("/api/albums/abc123").unwrap();
        assert_eq!(url.as_str(), "http://photos:2283/api/albums/abc123");
    }

    #[test]
    fn test_client_url_with_trailing_slash() {
        let client = ImmichClient::new("http://photos:2283/", "key").unwrap();
        let url = client.url("/api/albums").unwrap();
        assert_eq!(url.as_str(), "http://photos:2283/api/albums");
    }

    #[test]
    fn test_deserialize_server_version() {
        let json = r#"{"major": 1, "minor": 119, "patch": 0}"#;
        let version: ServerVersion = serde_json::from_str(json).unwrap();
        assert_eq!(version.major, 1);
        assert_eq!(version.minor, 119);
        assert_eq!(version.patch, 0);
    }

    #[test]
    fn test_deserialize_album() {
        let json = r#"{
            "id": "a1b2c3",
            "albumName": "Construction Site",
            "description": "Daily shots from the crane cam",
            "assetCount": 412
        }"#;

        let album: Album = serde_json::from_str(json).unwrap();
        assert_eq!(album.id, "a1b2c3");
        assert_eq!(album.album_name, "Construction Site");
        assert_eq!(album.description.as_deref(), Some("Daily shots from the crane cam"));
        assert_eq!(album.asset_count, 412);
    }

    #[test]
    fn test_deserialize_album_no_description() {
        let json = r#"{"id": "a1", "albumName": "Sky", "description": null, "assetCount": 3}"#;
        let album: Album = serde_json::from_str(json).unwrap();
        assert!(album.description.is_none());
    }

    #[test]
    fn test_deserialize_asset() {
        let json = r#"{
            "id": "asset-001",
            "originalFileName": "IMG_0001.jpg",
            "fileCreatedAt": "2024-03-01T08:00:00.000Z",
            "type": "IMAGE"
        }"#;

        let asset: Asset = serde_json::from_str(json).unwrap();
        assert_eq!(asset.id, "asset-001");
        assert_eq!(asset.original_file_name, "IMG_0001.jpg");
        assert!(asset.is_image());
    }

    #[test]
    fn test_asset_video_is_not_image() {
        let json = r#"{
            "id": "asset-002",
            "originalFileName": "clip.mov",
            "fileCreatedAt": "2024-03-01T08:00:00.000Z",
            "type": "VIDEO"
        }"#;

        let asset: Asset = serde_json::from_str(json).unwrap();
        assert!(!asset.is_image());
    }

    #[test]
    fn test_search_filters_serialization() {
        let after = "2024-01-01T00:00:00Z".parse().unwrap();
        let filters = SearchFilters::images(Some(after), None);
        let json = serde_json::to_value(&filters).unwrap();

        assert_eq!(json["type"], "IMAGE");
        assert_eq!(json["page"], 1);
        assert_eq!(json["size"], 500);
        assert!(json["takenAfter"].is_string());
        assert!(json.get("takenBefore").is_none());
    }

    #[test]
    fn test_deserialize_search_response_with_next_page() {
        let json = r#"{
            "assets": {
                "items": [{
                    "id": "asset-001",
                    "originalFileName": "IMG_0001.jpg",
                    "fileCreatedAt": "2024-03-01T08:00:00.000Z",
                    "type": "IMAGE"
                }],
                "nextPage": "2"
            }
        }"#;

        let resp: SearchResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.assets.items.len(), 1);
        assert!(resp.assets.next_page.as_ref().is_some_and(|v| !v.is_null()));
    }

    #[test]
    fn test_deserialize_search_response_last_page() {
        let json = r#"{"assets": {"items": [], "nextPage": null}}"#;
        let resp: SearchResponse = serde_json::from_str(json).unwrap();
        assert!(resp.assets.items.is_empty());
        assert!(resp.assets.next_page.as_ref().is_none_or(|v| v.is_null()));
    }

    #[test]
    fn test_filename_match_substring() {
        assert!(filename_matches("0001", "IMG_0001.jpg"));
        assert!(filename_matches("img", "IMG_0001.jpg"));
        assert!(!filename_matches("png", "IMG_0001.jpg"));
    }

    #[test]
    fn test_filename_match_wildcards() {
        assert!(filename_matches("IMG_*", "img_0001.jpg"));
        assert!(!filename_matches("IMG_*", "photo_img_0001.jpg"));

        assert!(filename_matches("*.jpg", "IMG_0001.JPG"));
        assert!(!filename_matches("*.jpg", "IMG_0001.png"));

        assert!(filename_matches("*0001*", "IMG_0001.jpg"));
        assert!(!filename_matches("*0002*", "IMG_0001.jpg"));
    }

    #[test]
    fn test_filename_match_empty_pattern_matches_all() {
        assert!(filename_matches("", "anything.jpg"));
        assert!(filename_matches("  ", "anything.jpg"));
    }
}
