//! Semantic Scholar API Client
//!
//! Title search against the Graph API. A matching paper with an abstract is
//! handed to the extractor as ready-made content; one without an abstract
//! becomes a page to load.
//!
//! API Details:
//! - Search endpoint: GET /graph/v1/paper/search
//! - Rate limit: 1 req/s (unauthenticated), higher with API key

use super::{is_same_work, Candidate, MirrorError, MirrorSource};
use crate::browser::{FetchRequest, Marker, TabPool};
use crate::config::Timeouts;
use crate::error::{PubfillError, Result};
use crate::record::RecordSnapshot;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

/// Semantic Scholar API base URL
const SS_API_BASE: &str = "https://api.semanticscholar.org/graph/v1";

/// Results requested per search
const SEARCH_LIMIT: usize = 10;

#[derive(Debug, Deserialize)]
struct SSSearchResponse {
    #[serde(default)]
    data: Vec<SSPaper>,
}

#[derive(Debug, Clone, Deserialize)]
struct SSPaper {
    title: Option<String>,
    #[serde(rename = "abstract")]
    abstract_text: Option<String>,
    #[serde(default)]
    authors: Vec<SSAuthor>,
    url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SSAuthor {
    name: Option<String>,
}

pub struct SemanticScholar {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    timeouts: Timeouts,
}

impl SemanticScholar {
    pub fn new(api_key: Option<String>, timeouts: Timeouts) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeouts.mirror_search)
            .build()
            .map_err(|e| PubfillError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_key,
            base_url: SS_API_BASE.to_string(),
            timeouts,
        })
    }

    async fn search(&self, title: &str) -> std::result::Result<Vec<SSPaper>, MirrorError> {
        let url = format!("{}/paper/search", self.base_url);
        let limit = SEARCH_LIMIT.to_string();
        let mut request = self.client.get(&url).query(&[
            ("query", title),
            ("fields", "title,abstract,authors,url"),
            ("limit", limit.as_str()),
        ]);

        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| MirrorError::Search(e.to_string()))?;
        let status = response.status();

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), error = %error_text, "API error");
            return Err(MirrorError::Search(format!(
                "Semantic Scholar API error: {}",
                status
            )));
        }

        let parsed: SSSearchResponse = response.json().await.map_err(|e| {
            MirrorError::Search(format!("Failed to parse Semantic Scholar response: {}", e))
        })?;
        Ok(parsed.data)
    }

    fn select_candidates(&self, papers: &[SSPaper], record: &RecordSnapshot) -> Vec<Candidate> {
        papers
            .iter()
            .filter(|p| {
                let title = p.title.as_deref().unwrap_or("");
                let first_author = p
                    .authors
                    .first()
                    .and_then(|a| a.name.as_deref())
                    .unwrap_or("");
                is_same_work(record, title, first_author)
            })
            .filter_map(|p| {
                let title = p.title.as_deref().unwrap_or("");
                match (p.abstract_text.as_deref(), p.url.as_deref()) {
                    (Some(text), _) if !text.trim().is_empty() => {
                        Some(Candidate::Content(paper_html(title, text)))
                    }
                    (_, Some(url)) => Some(Candidate::Page(
                        FetchRequest::new(
                            url,
                            self.timeouts.page_settle,
                            self.timeouts.mirror_fetch_budget,
                        )
                        .marker(Marker::Title(title.to_string())),
                    )),
                    _ => None,
                }
            })
            .collect()
    }
}

#[async_trait]
impl MirrorSource for SemanticScholar {
    fn name(&self) -> &str {
        "semanticscholar"
    }

    async fn discover(
        &self,
        record: &RecordSnapshot,
        _tabs: &TabPool,
    ) -> std::result::Result<Vec<Candidate>, MirrorError> {
        let papers = self.search(&record.title).await?;
        let candidates = self.select_candidates(&papers, record);
        debug!(
            task_id = record.task_id,
            found = papers.len(),
            matched = candidates.len(),
            "Semantic Scholar candidates"
        );
        if candidates.is_empty() {
            return Err(MirrorError::NoCandidates);
        }
        Ok(candidates)
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Minimal page wrapping an API record, so every candidate reaches the
/// extractor as HTML.
fn paper_html(title: &str, abstract_text: &str) -> String {
    format!(
        "<html><body><h1>{}</h1><div class=\"abstract\">{}</div></body></html>",
        escape(title),
        escape(abstract_text)
    )
}
