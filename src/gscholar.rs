//! Google Scholar search source.
//!
//! Result pages are fetched over HTTP with a cookie jar seeded from the cookie
//! file and parsed with CSS selectors. The BibTeX export is reached through the citation
//! popup of each result.

use crate::config::ScholarConfig;
use crate::cookies::CookieManager;
use crate::error::{PubfillError, Result};
use crate::record::{QuerySpec, RawRecord, RecordSnapshot};
use async_trait::async_trait;
use regex::Regex;
use reqwest::cookie::Jar;
use scraper::{ElementRef, Html, Selector};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Default Google Scholar URL
pub const DEFAULT_SCHOLAR_URL: &str = "https://scholar.google.com";

/// User agent string for requests
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Results per Scholar page
const PAGE_SIZE: u32 = 10;

/// Paginated search backend plus its citation export.
#[async_trait]
pub trait SourceQuery: Send + Sync {
    /// Raw records of page `page_index` (0-based), at most ten.
    async fn fetch_page(&self, spec: &QuerySpec, page_index: u32) -> Result<Vec<RawRecord>>;

    /// Export link for a record, or `None` when the source has none.
    async fn citation_link(&self, record: &RecordSnapshot) -> Result<Option<String>>;

    /// Body behind an export link.
    async fn fetch_citation(&self, link: &str) -> Result<String>;

    /// Write session state (cookies) back to disk.
    async fn persist_state(&self) -> Result<()> {
        Ok(())
    }
}

/// Scholar over plain HTTP.
pub struct ScholarSource {
    client: reqwest::Client,
    base_url: String,
    jar: Arc<Jar>,
    cookies: CookieManager,
}

impl ScholarSource {
    pub fn new(config: &ScholarConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .as_ref()
            .map(|s| s.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_SCHOLAR_URL.to_string());

        let cookies = CookieManager::from_config(config);
        let jar = Arc::new(Jar::default());
        match cookies.seed(&jar) {
            0 => warn!(path = ?cookies.path(), "No Scholar cookies loaded"),
            n => debug!(count = n, "Seeded Scholar cookie jar"),
        }

        Ok(Self {
            client: build_http_client(config.proxy.as_deref(), Arc::clone(&jar))?,
            base_url,
            jar,
            cookies,
        })
    }

    async fn get(&self, url: &str) -> Result<String> {
        let request = self
            .client
            .get(url)
            .header("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8")
            .header("Accept-Language", "en-US,en;q=0.9")
            .header("Cache-Control", "no-cache")
            .header("Sec-Fetch-Dest", "document")
            .header("Sec-Fetch-Mode", "navigate")
            .header("Upgrade-Insecure-Requests", "1");

        let response = request.send().await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(PubfillError::RateLimited(60));
        }
        if !status.is_success() {
            return Err(PubfillError::Api {
                code: status.as_u16() as i32,
                message: format!("HTTP error: {}", status),
            });
        }

        Ok(response.text().await?)
    }

    fn cite_popup_url(&self, cid: &str) -> String {
        format!(
            "{}/scholar?q=info:{}:scholar.google.com/&output=cite&scirp=0&hl=en",
            self.base_url, cid
        )
    }
}

#[async_trait]
impl SourceQuery for ScholarSource {
    async fn fetch_page(&self, spec: &QuerySpec, page_index: u32) -> Result<Vec<RawRecord>> {
        let url = build_search_url(&self.base_url, spec, page_index * PAGE_SIZE)?;

        if page_index > 0 {
            let delay = rand::random::<u64>() % 1500 + 500;
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        debug!(page = page_index, url = %url, "Fetching Scholar page");
        let html = self.get(url.as_str()).await?;
        if is_captcha_page(&html) {
            warn!(page = page_index, "CAPTCHA detected");
            return Err(PubfillError::Captcha);
        }

        let records = parse_result_items(&html)?;
        info!(page = page_index, count = records.len(), "Parsed Scholar results");
        Ok(records)
    }

    async fn citation_link(&self, record: &RecordSnapshot) -> Result<Option<String>> {
        if let Some(link) = &record.citation_link {
            return Ok(Some(link.clone()));
        }
        let Some(cid) = record.source_id.as_deref() else {
            return Ok(None);
        };

        let popup = self.get(&self.cite_popup_url(cid)).await?;
        if is_captcha_page(&popup) {
            return Err(PubfillError::Captcha);
        }
        Ok(parse_bibtex_link(&popup, &self.base_url))
    }

    async fn fetch_citation(&self, link: &str) -> Result<String> {
        self.get(link).await
    }

    async fn persist_state(&self) -> Result<()> {
        let base = Url::parse(&self.base_url)
            .map_err(|e| PubfillError::Config(format!("Invalid base URL: {}", e)))?;
        let updated = self.cookies.persist(&self.jar, &[base]).await?;
        if updated > 0 {
            info!(updated, "Saved refreshed Scholar cookies");
        }
        Ok(())
    }
}

/// Build HTTP client over `jar` with optional proxy
fn build_http_client(proxy: Option<&str>, jar: Arc<Jar>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(30))
        .cookie_provider(jar);

    if let Some(proxy_url) = proxy {
        let proxy = reqwest::Proxy::all(proxy_url).map_err(|e| {
            PubfillError::Config(format!("Invalid proxy URL '{}': {}", proxy_url, e))
        })?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| PubfillError::Config(format!("Failed to build HTTP client: {}", e)))
}

/// Build Google Scholar search URL
fn build_search_url(base_url: &str, spec: &QuerySpec, start: u32) -> Result<Url> {
    let mut url = Url::parse(&format!("{}/scholar", base_url))
        .map_err(|e| PubfillError::Config(format!("Invalid base URL: {}", e)))?;

    {
        let mut params = url.query_pairs_mut();
        params.append_pair("q", spec.name());
        params.append_pair("hl", "en");
        params.append_pair("as_sdt", "0,5");
        if let Some(year) = spec.year_low() {
            params.append_pair("as_ylo", &year.to_string());
        }
        if let Some(year) = spec.year_high() {
            params.append_pair("as_yhi", &year.to_string());
        }
        if start > 0 {
            params.append_pair("start", &start.to_string());
        }
    }

    Ok(url)
}

fn is_captcha_page(html: &str) -> bool {
    html.contains("Solving the above CAPTCHA")
        || html.contains("unusual traffic")
        || html.contains("id=\"gs_captcha_ccl\"")
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| PubfillError::Parse(e.to_string()))
}

fn text_of(element: ElementRef<'_>) -> String {
    element.text().collect::<String>()
}

/// Author display string: venue-like and numeric fragments dropped.
fn clean_authors(meta: &str) -> String {
    let head = meta.split(" - ").next().unwrap_or("");
    head.split(',')
        .map(|a| a.trim().replace('…', ""))
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .filter(|a| !a.chars().any(|c| c.is_ascii_digit()))
        .filter(|a| {
            !["Proceedings", "Conference", "Journal", "Transactions", "(", ")", "[", "]"]
                .iter()
                .any(|marker| a.contains(marker))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Snippet without ellipses, line breaks or a leading "Abstract" label.
fn clean_snippet(raw: &str) -> String {
    let flat = raw.replace('…', "").replace('\n', " ");
    let trimmed = flat.trim();
    let stripped = match trimmed.get(..8) {
        Some(head) if head.eq_ignore_ascii_case("abstract") => trimmed[8..].trim_start_matches(':'),
        _ => trimmed,
    };
    stripped.trim().to_string()
}

/// Parse a Scholar result page.
pub fn parse_result_items(html: &str) -> Result<Vec<RawRecord>> {
    let document = Html::parse_document(html);

    let item_selector = selector("div.gs_r.gs_or.gs_scl")?;
    let title_selector = selector("h3.gs_rt")?;
    let link_selector = selector("h3.gs_rt a")?;
    let meta_selector = selector("div.gs_a")?;
    let snippet_selector = selector("div.gs_rs")?;
    let cite_selector = selector("div.gs_fl a")?;
    let eprint_selector = selector("div.gs_ggs a")?;

    let year_regex = Regex::new(r"\b(19|20)\d{2}\b").map_err(|e| PubfillError::Parse(e.to_string()))?;
    let cite_regex =
        Regex::new(r"(?:Cited by\s*|被引用\s*)(\d+)").map_err(|e| PubfillError::Parse(e.to_string()))?;
    let tag_regex = Regex::new(r"^\s*(\[[^\]]*\]\s*)+").map_err(|e| PubfillError::Parse(e.to_string()))?;

    let mut results = Vec::new();

    for item in document.select(&item_selector) {
        let mut data = RawRecord {
            source_id: item.value().attr("data-cid").map(str::to_string),
            ..Default::default()
        };

        if let Some(link) = item.select(&link_selector).next() {
            data.title = text_of(link).trim().to_string();
            data.url = link.value().attr("href").unwrap_or("").to_string();
        } else if let Some(title_elem) = item.select(&title_selector).next() {
            data.title = tag_regex.replace(&text_of(title_elem), "").trim().to_string();
        }

        if let Some(meta_elem) = item.select(&meta_selector).next() {
            let meta_text = text_of(meta_elem).replace('\u{a0}', " ");
            data.author = clean_authors(&meta_text);
            if let Some(venue_year) = meta_text.split(" - ").nth(1) {
                data.pub_year = year_regex
                    .find(venue_year)
                    .map(|m| m.as_str().to_string());
            }
        }

        if let Some(snippet_elem) = item.select(&snippet_selector).next() {
            data.snippet = clean_snippet(&text_of(snippet_elem));
        }

        for link in item.select(&cite_selector) {
            let href = link.value().attr("href").unwrap_or("");
            if !href.contains("cites=") {
                continue;
            }
            let text = text_of(link);
            if let Some(count) = cite_regex
                .captures(&text)
                .and_then(|caps| caps.get(1))
                .and_then(|m| m.as_str().parse::<u32>().ok())
            {
                data.num_citations = Some(count);
                break;
            }
        }

        data.eprint_url = item
            .select(&eprint_selector)
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(str::to_string);

        if !data.title.is_empty() {
            results.push(data);
        }
    }

    Ok(results)
}

/// `BibTeX` entry of a citation popup, absolutized against `base_url`.
fn parse_bibtex_link(popup: &str, base_url: &str) -> Option<String> {
    let document = Html::parse_document(popup);
    let anchor_selector = Selector::parse("a.gs_citi").ok()?;
    let href = document
        .select(&anchor_selector)
        .find(|a| text_of(*a).trim().eq_ignore_ascii_case("bibtex"))?
        .value()
        .attr("href")?;

    let base = Url::parse(base_url).ok()?;
    base.join(href).ok().map(|u| u.to_string())
}
