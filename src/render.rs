//! Scrape-API rendering, used when a direct citation fetch returns something
//! that is not BibTeX (consent pages, bot checks).

use crate::error::{PubfillError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Spider crawl endpoint
const SPIDER_API: &str = "https://api.spider.cloud/crawl";

/// Fetches a URL through a third-party renderer.
#[async_trait]
pub trait RenderApi: Send + Sync {
    async fn render(&self, url: &str) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct SpiderItem {
    content: Option<String>,
    error: Option<String>,
    status: Option<u16>,
}

/// spider.cloud client.
pub struct SpiderRender {
    client: Client,
    api_key: String,
}

impl SpiderRender {
    pub fn new(api_key: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PubfillError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, api_key })
    }
}

#[async_trait]
impl RenderApi for SpiderRender {
    async fn render(&self, url: &str) -> Result<String> {
        debug!(url = %url, "Rendering through Spider");
        let body = serde_json::json!({
            "url": url,
            "limit": 1,
            "return_format": "raw"
        });

        let response = self
            .client
            .post(SPIDER_API)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(PubfillError::Api {
                code: status.as_u16() as i32,
                message: format!("Spider error: {}", error_text),
            });
        }

        let items: Vec<SpiderItem> = response.json().await?;
        first_content(items)
    }
}

fn first_content(items: Vec<SpiderItem>) -> Result<String> {
    let item = items
        .into_iter()
        .next()
        .ok_or_else(|| PubfillError::Parse("Spider returned no pages".into()))?;

    if let Some(error) = item.error.filter(|e| !e.is_empty()) {
        return Err(PubfillError::Api {
            code: item.status.map(i32::from).unwrap_or(0),
            message: format!("Spider crawl failed: {}", error),
        });
    }
    match item.status {
        Some(200) | None => {}
        Some(code) => {
            return Err(PubfillError::Api {
                code: i32::from(code),
                message: "Spider crawl returned non-200".into(),
            })
        }
    }

    item.content
        .ok_or_else(|| PubfillError::Parse("Spider page has no content".into()))
}
