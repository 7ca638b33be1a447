//! reqwest-backed download collaborator.
//!
//! Map extracts come from the Overpass API and transit feeds from the
//! transit.land feed registry. Both are plain streaming GETs written to the
//! workspace directory.

use crate::provision::DataFetcher;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use graphvisor_core::{BoundingBox, MapOptions};
use reqwest::{Client, Url};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub const DEFAULT_OVERPASS_URL: &str = "https://overpass-api.de/api/";
pub const DEFAULT_TRANSITLAND_URL: &str = "https://transit.land/api/v1/";

/// Parallel feed downloads
const FEED_DOWNLOADS: usize = 4;

#[derive(Debug, Deserialize)]
struct FeedListing {
    #[serde(default)]
    feeds: Vec<Feed>,
}

#[derive(Debug, Deserialize)]
struct Feed {
    url: String,
}

/// Downloads map and transit data over HTTP
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    overpass_url: Url,
    transitland_url: Url,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        Self::with_endpoints(DEFAULT_OVERPASS_URL, DEFAULT_TRANSITLAND_URL)
    }

    /// Use other API roots, e.g. a private Overpass instance
    pub fn with_endpoints(overpass_url: &str, transitland_url: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("graphvisor/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            overpass_url: Url::parse(overpass_url).context("Invalid Overpass URL")?,
            transitland_url: Url::parse(transitland_url).context("Invalid transit.land URL")?,
        })
    }

    fn map_url(&self, bbox: &BoundingBox, options: &MapOptions) -> Result<Url> {
        let url = if options.ways_only {
            let query = format!(
                "(way({:.6},{:.6},{:.6},{:.6});>;);out;",
                bbox.bottom, bbox.left, bbox.top, bbox.right
            );
            Url::parse_with_params(self.overpass_url.join("interpreter")?.as_str(), [("data", query)])?
        } else {
            Url::parse_with_params(self.overpass_url.join("map")?.as_str(), [("bbox", bbox.to_query())])?
        };
        Ok(url)
    }

    fn feeds_url(&self, bbox: &BoundingBox) -> Result<Url> {
        Ok(Url::parse_with_params(
            self.transitland_url.join("feeds")?.as_str(),
            [("bbox", bbox.to_query())],
        )?)
    }
}

/// File name for a feed: last URL segment, `untitled` when empty, always `.zip`
fn feed_file_name(url: &str) -> String {
    let last = url.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
    let last = last.split(['?', '#']).next().unwrap_or_default();
    let name = if last.is_empty() || last.contains(':') {
        "untitled"
    } else {
        last
    };
    if name.ends_with(".zip") {
        name.to_string()
    } else {
        format!("{name}.zip")
    }
}

/// Stream a GET response body into `path`, returning the bytes written
pub(crate) async fn save_file(client: &Client, url: &str, path: &Path) -> Result<u64> {
    let mut response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("GET {url}"))?
        .error_for_status()
        .with_context(|| format!("GET {url}"))?;

    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("Failed to create {}", path.display()))?;

    let mut written = 0u64;
    while let Some(chunk) = response.chunk().await.with_context(|| format!("Reading {url}"))? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    debug!(url, path = %path.display(), bytes = written, "Saved download");
    Ok(written)
}

#[async_trait]
impl DataFetcher for HttpFetcher {
    async fn fetch_map(
        &self,
        bbox: &BoundingBox,
        output_dir: &Path,
        options: &MapOptions,
    ) -> Result<PathBuf> {
        let url = self.map_url(bbox, options)?;
        let path = output_dir.join(format!("map-{}.osm", Utc::now().format("%Y-%m-%dT%H-%M-%S")));
        info!(%url, "Downloading map extract");

        let written = save_file(&self.client, url.as_str(), &path).await?;
        if written < options.min_size {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("Failed to remove short map file {}: {}", path.display(), e);
            }
            bail!(
                "map extract is only {written} bytes (minimum {}); the bounding box may be too large",
                options.min_size
            );
        }
        Ok(path)
    }

    async fn fetch_transit(&self, bbox: &BoundingBox, output_dir: &Path) -> Result<usize> {
        let url = self.feeds_url(bbox)?;
        info!(%url, "Querying transit.land for feeds");

        let listing: FeedListing = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()?
            .json()
            .await
            .context("Malformed feed listing")?;

        if listing.feeds.is_empty() {
            bail!("no transit feeds cover this bounding box");
        }
        info!(feeds = listing.feeds.len(), "Downloading transit feeds");

        let permits = Arc::new(Semaphore::new(FEED_DOWNLOADS));
        let mut downloads = JoinSet::new();
        for feed in listing.feeds {
            let client = self.client.clone();
            let permits = permits.clone();
            let path = output_dir.join(feed_file_name(&feed.url));
            downloads.spawn(async move {
                let _permit = permits.acquire_owned().await?;
                save_file(&client, &feed.url, &path)
                    .await
                    .inspect_err(|e| warn!("Feed download failed: {e:#}"))
            });
        }

        let mut saved = 0;
        while let Some(result) = downloads.join_next().await {
            match result {
                Ok(Ok(_)) => saved += 1,
                Ok(Err(_)) => {}
                Err(e) => warn!("Feed download task failed: {}", e),
            }
        }
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox() -> BoundingBox {
        BoundingBox::new(-122.7, 45.4, -122.5, 45.6).unwrap()
    }

    #[test]
    fn test_map_url_full_extract() {
        let fetcher = HttpFetcher::new().unwrap();
        let options = MapOptions {
            ways_only: false,
            ..MapOptions::default()
        };
        let url = fetcher.map_url(&bbox(), &options).unwrap();
        assert_eq!(url.path(), "/api/map");
        let (key, value) = url.query_pairs().next().unwrap();
        assert_eq!(key, "bbox");
        assert_eq!(value, "-122.700000,45.400000,-122.500000,45.600000");
    }

    #[test]
    fn test_map_url_ways_only() {
        let fetcher = HttpFetcher::new().unwrap();
        let url = fetcher.map_url(&bbox(), &MapOptions::default()).unwrap();
        assert_eq!(url.path(), "/api/interpreter");
        let (key, value) = url.query_pairs().next().unwrap();
        assert_eq!(key, "data");
        assert_eq!(value, "(way(45.400000,-122.700000,45.600000,-122.500000);>;);out;");
    }

    #[test]
    fn test_feeds_url() {
        let fetcher = HttpFetcher::new().unwrap();
        let url = fetcher.feeds_url(&bbox()).unwrap();
        assert_eq!(url.path(), "/api/v1/feeds");
    }

    #[test]
    fn test_feed_file_name() {
        assert_eq!(feed_file_name("https://example.com/gtfs/trimet.zip"), "trimet.zip");
        assert_eq!(feed_file_name("https://example.com/feeds/latest"), "latest.zip");
        assert_eq!(feed_file_name("https://example.com/feeds/latest/"), "latest.zip");
        assert_eq!(feed_file_name("https://example.com/gtfs.zip?key=abc"), "gtfs.zip");
    }

    #[test]
    fn test_feed_listing_ignores_extra_fields() {
        let listing: FeedListing = serde_json::from_str(
            r#"{"feeds":[{"onestop_id":"f-c20-trimet","url":"https://example.com/a.zip"}],"meta":{}}"#,
        )
        .unwrap();
        assert_eq!(listing.feeds.len(), 1);
    }
}
