//! ResearchGate publication search, driven through the browser.

use super::{is_same_work, Candidate, MirrorError, MirrorSource};
use crate::browser::{FetchRequest, Marker, TabPool};
use crate::config::Timeouts;
use crate::record::RecordSnapshot;
use async_trait::async_trait;
use scraper::{Html, Selector};
use tracing::debug;

const SEARCH_URL: &str = "https://www.researchgate.net/search/publication";
const SITE_ROOT: &str = "https://www.researchgate.net/";

/// Text present on every search result page.
const SEARCH_PHRASE: &str = "Discover the world's scientific knowledge";
const SEARCH_CONTAINER: &str = ".search-indent-container";

/// Title words required on a publication page before it is accepted.
const TITLE_MARKER_WORDS: usize = 4;

pub struct ResearchGate {
    timeouts: Timeouts,
}

impl ResearchGate {
    pub fn new(timeouts: Timeouts) -> Self {
        Self { timeouts }
    }

    fn search_request(&self, title: &str) -> FetchRequest {
        let url = format!("{}?q={}", SEARCH_URL, urlencoding::encode(title));
        FetchRequest::new(url, self.timeouts.page_settle, self.timeouts.mirror_search)
            .marker(Marker::Phrase(SEARCH_PHRASE.to_string()))
            .marker(Marker::Selector(SEARCH_CONTAINER.to_string()))
    }

    fn page_request(&self, url: String, title: &str) -> FetchRequest {
        let head: Vec<&str> = title.split_whitespace().take(TITLE_MARKER_WORDS).collect();
        FetchRequest::new(url, self.timeouts.page_settle, self.timeouts.mirror_fetch_budget)
            .marker(Marker::Title(head.join(" ")))
    }
}

#[async_trait]
impl MirrorSource for ResearchGate {
    fn name(&self) -> &str {
        "researchgate"
    }

    async fn discover(
        &self,
        record: &RecordSnapshot,
        tabs: &TabPool,
    ) -> Result<Vec<Candidate>, MirrorError> {
        let html = tabs
            .fetch(&self.search_request(&record.title))
            .await
            .map_err(|e| MirrorError::Search(e.to_string()))?;

        let links = parse_search_results(&html, record);
        debug!(task_id = record.task_id, count = links.len(), "ResearchGate candidates");
        if links.is_empty() {
            return Err(MirrorError::NoCandidates);
        }

        Ok(links
            .into_iter()
            .map(|url| Candidate::Page(self.page_request(url, &record.title)))
            .collect())
    }
}

/// Absolute links of matching results, in page order.
fn parse_search_results(html: &str, record: &RecordSnapshot) -> Vec<String> {
    let (Ok(container_sel), Ok(item_sel), Ok(anchor_sel), Ok(author_sel)) = (
        Selector::parse("div.search-indent-container"),
        Selector::parse("div.nova-legacy-o-stack__item"),
        Selector::parse("a[href]"),
        Selector::parse("span.nova-legacy-v-person-inline-item__fullname"),
    ) else {
        return Vec::new();
    };

    let document = Html::parse_document(html);
    let Some(container) = document.select(&container_sel).next() else {
        return Vec::new();
    };

    let title = record.title.to_lowercase();
    let mut links = Vec::new();

    for item in container.select(&item_sel) {
        let Some(anchor) = item
            .select(&anchor_sel)
            .find(|a| a.text().collect::<String>().to_lowercase().contains(&title))
        else {
            continue;
        };
        let anchor_text = anchor.text().collect::<String>();

        let author_match = item
            .select(&author_sel)
            .map(|s| s.text().collect::<String>())
            .any(|name| is_same_work(record, &anchor_text, name.trim()));
        if !author_match {
            continue;
        }

        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let link = if href.starts_with("http") {
            href.to_string()
        } else {
            format!("{}{}", SITE_ROOT, href.trim_start_matches('/'))
        };
        if !links.contains(&link) {
            links.push(link);
        }
    }

    links
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEARCH_PAGE: &str = r#"<html><body>
<p>Discover the world's scientific knowledge</p>
<div class="search-indent-container">
  <div class="nova-legacy-o-stack__item">
    <a href="publication/317558625_Attention_Is_All_You_Need">Attention Is All You Need</a>
    <span class="nova-legacy-v-person-inline-item__fullname" itemprop="name">Ashish Vaswani</span>
  </div>
  <div class="nova-legacy-o-stack__item">
    <a href="publication/1_Attention_Is_All_You_Need_Review">Attention Is All You Need: a review</a>
    <span class="nova-legacy-v-person-inline-item__fullname" itemprop="name">Jane Doe</span>
  </div>
  <div class="nova-legacy-o-stack__item">
    <a href="https://www.researchgate.net/publication/2_Other">Something else entirely</a>
    <span class="nova-legacy-v-person-inline-item__fullname" itemprop="name">Ashish Vaswani</span>
  </div>
</div></body></html>"#;

    fn record() -> RecordSnapshot {
        RecordSnapshot {
            title: "Attention is all you need".into(),
            author: "A Vaswani, N Shazeer, N Parmar…".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_search_results_matches_title_and_author() {
        let links = parse_search_results(SEARCH_PAGE, &record());
        assert_eq!(
            links,
            vec!["https://www.researchgate.net/publication/317558625_Attention_Is_All_You_Need".to_string()]
        );
    }

    #[test]
    fn test_parse_search_results_without_container() {
        assert!(parse_search_results("<html><body>blocked</body></html>", &record()).is_empty());
    }

    #[test]
    fn test_requests_carry_markers() {
        let rg = ResearchGate::new(Timeouts::default());
        let search = rg.search_request("Attention is all you need");
        assert!(search.url.contains("q=Attention%20is%20all%20you%20need"));
        assert_eq!(search.markers.len(), 2);

        let page = rg.page_request("u".into(), "Attention is all you need");
        assert_eq!(page.markers, vec![Marker::Title("Attention is all you".into())]);
        assert_eq!(page.budget, Timeouts::default().mirror_fetch_budget);
    }
}
