//! Per-record enrichment: abstract acquisition and citation export.
//!
//! The abstract is tried on the record's own page first, then on each mirror
//! in order; within a mirror, candidates are tried in the order the mirror
//! listed them and the first successful extraction wins. The citation export
//! runs alongside. Every failure is absorbed into the record's error list.

use crate::bibtex;
use crate::browser::{FetchError, FetchRequest, Marker, TabPool};
use crate::budget;
use crate::config::AppConfig;
use crate::extractor::{AbstractExtractor, ExtractError};
use crate::gscholar::SourceQuery;
use crate::html;
use crate::ledger::ResultLedger;
use crate::mirrors::{Candidate, MirrorError, MirrorSource};
use crate::record::{Bib, RecordSnapshot};
use crate::render::RenderApi;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Reason attached when no stage produced an abstract.
pub const REASON_NO_ABSTRACT: &str = "abstract unavailable";
/// Reason attached when the citation export could not be obtained.
pub const REASON_NO_BIBTEX: &str = "bibtex unavailable";

/// Enrichment strategy shared by every record of a session.
pub struct FallbackChain {
    source: Arc<dyn SourceQuery>,
    extractor: Arc<dyn AbstractExtractor>,
    mirrors: Vec<Arc<dyn MirrorSource>>,
    render: Option<Arc<dyn RenderApi>>,
    tabs: TabPool,
    bib_permits: Arc<Semaphore>,
    config: Arc<AppConfig>,
}

impl FallbackChain {
    pub fn new(
        source: Arc<dyn SourceQuery>,
        extractor: Arc<dyn AbstractExtractor>,
        mirrors: Vec<Arc<dyn MirrorSource>>,
        render: Option<Arc<dyn RenderApi>>,
        tabs: TabPool,
        config: Arc<AppConfig>,
    ) -> Self {
        let bib_permits = Arc::new(Semaphore::new(config.limits.bibtex_concurrency.max(1)));
        Self {
            source,
            extractor,
            mirrors,
            render,
            tabs,
            bib_permits,
            config,
        }
    }

    /// Enrich one registered record and give it a terminal state.
    pub async fn enrich(&self, record: RecordSnapshot, ledger: &ResultLedger, ignore_bibtex: bool) {
        let task_id = record.task_id;
        ledger.begin_enrichment(task_id);
        debug!(task_id, title = %record.title, "Enrichment started");

        let citation = async {
            if ignore_bibtex {
                None
            } else {
                Some(self.acquire_citation(&record).await)
            }
        };
        let (abstract_result, citation_result) =
            tokio::join!(self.acquire_abstract(&record), citation);

        let mut fatal = Vec::new();

        match abstract_result {
            Ok(text) => ledger.set_abstract(task_id, text),
            Err(reasons) => {
                for reason in reasons {
                    ledger.annotate(task_id, reason);
                }
                fatal.push(REASON_NO_ABSTRACT);
            }
        }

        match citation_result {
            Some(Ok(bib)) => ledger.set_bib(task_id, bib),
            Some(Err(reasons)) => {
                for reason in reasons {
                    ledger.annotate(task_id, reason);
                }
                if self.config.bibtex_required {
                    fatal.push(REASON_NO_BIBTEX);
                } else {
                    ledger.annotate(task_id, REASON_NO_BIBTEX);
                }
            }
            None => {}
        }

        if fatal.is_empty() {
            info!(task_id, "Record enriched");
            ledger.mark_success(task_id);
        } else {
            warn!(task_id, reasons = ?fatal, "Record failed");
            for reason in fatal {
                ledger.mark_failed(task_id, reason);
            }
        }
    }

    /// Abstract text, or every stage's failure reason in encounter order.
    async fn acquire_abstract(&self, record: &RecordSnapshot) -> Result<String, Vec<String>> {
        let mut reasons = Vec::new();

        match self.direct(record).await {
            Ok(text) => return Ok(text),
            Err(reason) => {
                debug!(task_id = record.task_id, reason = %reason, "Direct fetch failed");
                reasons.push(format!("direct: {}", reason));
            }
        }

        for mirror in &self.mirrors {
            match self.from_mirror(mirror.as_ref(), record).await {
                Ok(text) => {
                    debug!(task_id = record.task_id, mirror = mirror.name(), "Abstract from mirror");
                    return Ok(text);
                }
                Err(e) => {
                    debug!(task_id = record.task_id, mirror = mirror.name(), error = %e, "Mirror failed");
                    reasons.push(format!("{}: {}", mirror.name(), e));
                }
            }
        }

        Err(reasons)
    }

    async fn direct(&self, record: &RecordSnapshot) -> Result<String, String> {
        if record.url.is_empty() {
            return Err("record has no page url".into());
        }
        if html::is_pdf_hint(&record.url) {
            return Err(FetchError::IsPdf.to_string());
        }

        let timeouts = &self.config.timeouts;
        let request = FetchRequest::new(record.url.clone(), timeouts.page_settle, timeouts.fetch_budget)
            .marker(Marker::Title(record.title.clone()));
        let page = self.tabs.fetch(&request).await.map_err(|e| e.to_string())?;

        self.extract(&record.snippet, &page)
            .await
            .map_err(|e| e.to_string())
    }

    async fn from_mirror(
        &self,
        mirror: &dyn MirrorSource,
        record: &RecordSnapshot,
    ) -> Result<String, MirrorError> {
        let candidates = mirror.discover(record, &self.tabs).await?;
        if candidates.is_empty() {
            return Err(MirrorError::NoCandidates);
        }

        let mut reasons = Vec::new();
        for candidate in candidates {
            let page = match candidate {
                Candidate::Content(content) => content,
                Candidate::Page(request) => match self.tabs.fetch(&request).await {
                    Ok(page) => page,
                    Err(e) => {
                        reasons.push(e.to_string());
                        continue;
                    }
                },
            };

            match self.extract(&record.snippet, &page).await {
                Ok(text) => return Ok(text),
                Err(e) => reasons.push(e.to_string()),
            }
        }

        Err(MirrorError::Exhausted(reasons))
    }

    async fn extract(&self, snippet: &str, page: &str) -> Result<String, ExtractError> {
        budget::within(self.config.timeouts.llm, self.extractor.extract(snippet, page))
            .await
            .unwrap_or(Err(ExtractError::Timeout))
    }

    /// Validated citation export, or the reasons it could not be had.
    async fn acquire_citation(&self, record: &RecordSnapshot) -> Result<Bib, Vec<String>> {
        let _permit = self
            .bib_permits
            .acquire()
            .await
            .map_err(|_| vec!["bibtex: limiter closed".to_string()])?;

        let link = self
            .resolve_citation_link(record)
            .await
            .map_err(|e| vec![format!("bibtex: {}", e)])?;

        let attempts = self.config.bibtex_attempts();
        let mut reasons = Vec::new();

        match budget::retry(attempts, "bibtex", |_| self.fetch_citation_once(&link)).await {
            Ok(raw) => return Ok(Bib { link: Some(link), raw: Some(raw) }),
            Err(e) => reasons.push(format!("bibtex: {}", e)),
        }

        if let Some(render) = &self.render {
            debug!(task_id = record.task_id, "Falling back to render API for BibTeX");
            let rendered = budget::within(self.config.timeouts.bibtex, render.render(&link))
                .await
                .map_err(|_| "render timed out".to_string())
                .and_then(|r| r.map_err(|e| e.to_string()))
                .and_then(validate_bibtex);
            match rendered {
                Ok(raw) => return Ok(Bib { link: Some(link), raw: Some(raw) }),
                Err(e) => reasons.push(format!("bibtex render: {}", e)),
            }
        }

        Err(reasons)
    }

    async fn resolve_citation_link(&self, record: &RecordSnapshot) -> Result<String, String> {
        if let Some(link) = &record.citation_link {
            return Ok(link.clone());
        }
        budget::within(self.config.timeouts.bibtex, self.source.citation_link(record))
            .await
            .map_err(|_| "citation link lookup timed out".to_string())?
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "no citation export link".to_string())
    }

    async fn fetch_citation_once(&self, link: &str) -> Result<String, String> {
        budget::within(self.config.timeouts.bibtex, self.source.fetch_citation(link))
            .await
            .map_err(|_| "fetch timed out".to_string())?
            .map_err(|e| e.to_string())
            .and_then(validate_bibtex)
    }
}

fn validate_bibtex(text: String) -> Result<String, String> {
    bibtex::parse_entry(&text)
        .map(|_| text.trim().to_string())
        .map_err(|e| e.to_string())
}
