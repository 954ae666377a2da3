use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use crate::models::ThumbnailAsset;
use crate::pipeline::error::FetchError;
use crate::pipeline::traits::ThumbnailSource;

/// Thumbnail source backed by a hosted scraping actor.
///
/// The actor is run synchronously for one profile and its dataset items carry
/// each video's cover URL, which is then downloaded directly.
pub struct ScraperClient {
    http: Client,
    api_url: String,
    api_token: String,
    actor_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetItem {
    video_meta: Option<VideoMeta>,
    error: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoMeta {
    original_cover_url: Option<String>,
}

impl ScraperClient {
    pub fn new(api_url: &str, api_token: &str, actor_id: &str) -> Result<Self, FetchError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| FetchError::TransientNetwork(e.to_string()))?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_token: api_token.to_string(),
            actor_id: actor_id.to_string(),
        })
    }

    async fn list_cover_urls(&self, username: &str, limit: usize) -> Result<Vec<String>, FetchError> {
        let url = format!(
            "{}/v2/acts/{}/run-sync-get-dataset-items",
            self.api_url, self.actor_id
        );

        let run_input = serde_json::json!({
            "profiles": [username],
            "profileScrapeSections": ["videos"],
            "profileSorting": "latest",
            "resultsPerPage": limit,
            "excludePinnedPosts": false,
            "shouldDownloadVideos": false,
            "shouldDownloadCovers": true,
            "shouldDownloadSubtitles": false,
            "shouldDownloadSlideshowImages": false,
            "shouldDownloadAvatars": false
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&run_input)
            .send()
            .await
            .map_err(transport_error)?;

        let response = check_status(response)?;
        let items: Vec<DatasetItem> = response.json().await.map_err(transport_error)?;

        let urls: Vec<String> = items
            .iter()
            .filter_map(|item| item.video_meta.as_ref()?.original_cover_url.clone())
            .take(limit)
            .collect();

        if urls.is_empty() && items.iter().any(|item| item.error.as_deref().is_some_and(is_missing_profile)) {
            return Err(FetchError::UserNotFound);
        }
        Ok(urls)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, String> {
        let response = self.http.get(url).send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status()));
        }
        let bytes = response.bytes().await.map_err(|e| e.to_string())?;
        image::guess_format(&bytes).map_err(|_| "unrecognised image format".to_string())?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl ThumbnailSource for ScraperClient {
    async fn fetch(&self, username: &str, max_count: usize) -> Result<Vec<ThumbnailAsset>, FetchError> {
        let urls = self.list_cover_urls(username, max_count).await?;

        let mut assets = Vec::with_capacity(urls.len());
        for url in urls {
            let asset = match self.download(&url).await {
                Ok(bytes) => ThumbnailAsset::fetched(url, bytes),
                Err(error) => {
                    tracing::warn!(username = %username, url = %url, error = %error, "Thumbnail download failed");
                    ThumbnailAsset::failed(url, error)
                }
            };
            assets.push(asset);
        }
        Ok(assets)
    }
}

fn is_missing_profile(error: &str) -> bool {
    let error = error.to_lowercase();
    error.contains("not found") || error.contains("does not exist") || error.contains("doesn't exist")
}

fn transport_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::TransientNetwork(e.to_string())
    }
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response, FetchError> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::TOO_MANY_REQUESTS => Err(FetchError::RateLimited {
            retry_after: retry_after(&response),
        }),
        StatusCode::NOT_FOUND => Err(FetchError::UserNotFound),
        status => Err(FetchError::TransientNetwork(format!(
            "scraper returned HTTP {status}"
        ))),
    }
}

/// `Retry-After` in delta-seconds form.
fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_profile_messages() {
        assert!(is_missing_profile("Profile Not Found"));
        assert!(is_missing_profile("user does not exist"));
        assert!(!is_missing_profile("rate limit exceeded"));
    }

    #[test]
    fn test_dataset_item_cover_extraction() {
        let items: Vec<DatasetItem> = serde_json::from_str(
            r#"[
                {"videoMeta": {"originalCoverUrl": "https://cdn.example/1.jpg"}},
                {"videoMeta": {}},
                {"error": "Profile not found"}
            ]"#,
        )
        .unwrap();
        let urls: Vec<_> = items
            .iter()
            .filter_map(|item| item.video_meta.as_ref()?.original_cover_url.clone())
            .collect();
        assert_eq!(urls, vec!["https://cdn.example/1.jpg".to_string()]);
    }
}
