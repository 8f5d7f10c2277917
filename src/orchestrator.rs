//! Page-by-page discovery and bounded-concurrency enrichment.
//!
//! Every record of a page is registered before any of them is filtered or
//! enriched. Enrichment tasks live in one `JoinSet` owned by [`run`]; no task
//! outlives it, whether it returns normally, fails, or is cancelled.
//!
//! [`run`]: EnrichmentOrchestrator::run

use crate::error::{PubfillError, Result};
use crate::fallback::FallbackChain;
use crate::gscholar::SourceQuery;
use crate::ledger::{ResultLedger, REASON_BELOW_THRESHOLD, REASON_NO_CITATIONS};
use crate::record::QuerySpec;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct EnrichmentOrchestrator {
    source: Arc<dyn SourceQuery>,
    chain: Arc<FallbackChain>,
    ledger: Arc<ResultLedger>,
    records_per_page: usize,
}

impl EnrichmentOrchestrator {
    pub fn new(
        source: Arc<dyn SourceQuery>,
        chain: Arc<FallbackChain>,
        ledger: Arc<ResultLedger>,
        records_per_page: usize,
    ) -> Self {
        Self {
            source,
            chain,
            ledger,
            records_per_page,
        }
    }

    pub fn ledger(&self) -> &Arc<ResultLedger> {
        &self.ledger
    }

    /// Discover and enrich until every page is consumed and every task is done.
    ///
    /// Fails with `SourceUnavailable` only when nothing was ever registered,
    /// and with `Cancelled` once `cancel` fires and all tasks are gone.
    pub async fn run(&self, spec: &QuerySpec, cancel: CancellationToken) -> Result<()> {
        info!(query = %spec.name(), pages = spec.pages(), "Starting enrichment run");
        let mut tasks = JoinSet::new();

        for page in 0..spec.pages() {
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.source.fetch_page(spec, page) => Some(result),
            };
            let Some(fetched) = fetched else {
                return Self::unwind(tasks).await;
            };

            let raws = match fetched {
                Ok(raws) => raws,
                Err(e) if self.ledger.is_empty() => {
                    error!(page, error = %e, "Search source unavailable");
                    return Err(PubfillError::SourceUnavailable(e.to_string()));
                }
                Err(e) => {
                    self.ledger
                        .warn(format!("page {} unavailable: {}", page + 1, e));
                    break;
                }
            };

            if raws.is_empty() {
                debug!(page, "No more results");
                break;
            }

            let ids: Vec<usize> = raws
                .into_iter()
                .take(self.records_per_page)
                .map(|raw| self.ledger.register(raw))
                .collect();

            for task_id in ids {
                if self.filter(spec, task_id) {
                    continue;
                }
                self.spawn(&mut tasks, task_id, spec.ignore_bibtex());
            }
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                joined = tasks.join_next() => Some(joined),
            };
            match next {
                None => return Self::unwind(tasks).await,
                Some(None) => break,
                Some(Some(Ok(()))) => {}
                Some(Some(Err(e))) => warn!(error = %e, "Enrichment task ended abnormally"),
            }
        }

        let counts = self.ledger.counts();
        info!(
            registered = counts.registered,
            filtered = counts.filtered,
            success = counts.success,
            failed = counts.failed,
            "Enrichment run complete"
        );
        Ok(())
    }

    /// Apply the citation filter; true when the record was filtered out.
    fn filter(&self, spec: &QuerySpec, task_id: usize) -> bool {
        let Some(threshold) = spec.citation_threshold() else {
            return false;
        };
        match self.ledger.num_citations(task_id) {
            None => {
                self.ledger.mark_filtered(task_id, REASON_NO_CITATIONS);
                true
            }
            Some(count) if count < threshold => {
                self.ledger.mark_filtered(task_id, REASON_BELOW_THRESHOLD);
                true
            }
            Some(_) => false,
        }
    }

    fn spawn(&self, tasks: &mut JoinSet<()>, task_id: usize, ignore_bibtex: bool) {
        let Some(snapshot) = self.ledger.snapshot(task_id) else {
            return;
        };
        let chain = Arc::clone(&self.chain);
        let ledger = Arc::clone(&self.ledger);

        tasks.spawn(async move {
            let outcome = AssertUnwindSafe(chain.enrich(snapshot, &ledger, ignore_bibtex))
                .catch_unwind()
                .await;
            if let Err(panic) = outcome {
                let message = panic_message(panic.as_ref());
                error!(task_id, panic = %message, "Enrichment task panicked");
                ledger.mark_failed(task_id, &format!("unexpected error: {}", message));
            }
        });
    }

    /// Abort and await every task, then report cancellation.
    async fn unwind(mut tasks: JoinSet<()>) -> Result<()> {
        info!(in_flight = tasks.len(), "Cancelling enrichment tasks");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        Err(PubfillError::Cancelled)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{FetchError, FetchRequest, PageFetcher, TabPool};
    use crate::config::AppConfig;
    use crate::extractor::{AbstractExtractor, ExtractError};
    use crate::record::{RawRecord, RecordSnapshot, RecordState};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    const BIB: &str = "@article{k,\n  title={T}\n}";

    struct PagedSource {
        pages: Vec<Result<Vec<RawRecord>>>,
    }

    impl PagedSource {
        fn new(pages: Vec<Result<Vec<RawRecord>>>) -> Self {
            Self { pages }
        }
    }

    #[async_trait]
    impl SourceQuery for PagedSource {
        async fn fetch_page(&self, _spec: &QuerySpec, page: u32) -> Result<Vec<RawRecord>> {
            match self.pages.get(page as usize) {
                Some(Ok(records)) => Ok(records.clone()),
                Some(Err(e)) => Err(PubfillError::Api {
                    code: 503,
                    message: e.to_string(),
                }),
                None => Ok(Vec::new()),
            }
        }

        async fn citation_link(&self, _record: &RecordSnapshot) -> Result<Option<String>> {
            Ok(Some("https://example.org/cite.bib".into()))
        }

        async fn fetch_citation(&self, _link: &str) -> Result<String> {
            Ok(BIB.to_string())
        }
    }

    /// Counts fetches per URL; URLs containing "broken" time out.
    struct CountingFetcher {
        urls: Mutex<Vec<String>>,
        active: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl CountingFetcher {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                urls: Mutex::new(Vec::new()),
                active: Arc::new(AtomicUsize::new(0)),
                delay,
            })
        }

        fn fetched(&self) -> Vec<String> {
            self.urls.lock().map(|u| u.clone()).unwrap_or_default()
        }
    }

    struct ActiveGuard(Arc<AtomicUsize>);

    impl Drop for ActiveGuard {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl PageFetcher for CountingFetcher {
        async fn fetch(&self, request: &FetchRequest) -> std::result::Result<String, FetchError> {
            if let Ok(mut urls) = self.urls.lock() {
                urls.push(request.url.clone());
            }
            self.active.fetch_add(1, Ordering::SeqCst);
            let _guard = ActiveGuard(Arc::clone(&self.active));
            tokio::time::sleep(self.delay).await;
            if request.url.contains("broken") {
                Err(FetchError::Timeout)
            } else {
                Ok("<html><body><h1>paper</h1></body></html>".into())
            }
        }

        async fn shutdown(&self) {}
    }

    struct EchoExtractor;

    #[async_trait]
    impl AbstractExtractor for EchoExtractor {
        async fn extract(&self, snippet: &str, _page: &str) -> std::result::Result<String, ExtractError> {
            Ok(format!("{} (complete)", snippet))
        }
    }

    struct PanickingExtractor;

    #[async_trait]
    impl AbstractExtractor for PanickingExtractor {
        async fn extract(&self, _snippet: &str, _page: &str) -> std::result::Result<String, ExtractError> {
            panic!("extractor exploded")
        }
    }

    fn raw(i: usize, citations: Option<u32>) -> RawRecord {
        RawRecord {
            title: format!("paper {}", i),
            author: "A Author".into(),
            url: format!("https://example.org/{}", i),
            snippet: format!("snippet {}", i),
            num_citations: citations,
            ..Default::default()
        }
    }

    fn orchestrator(
        source: PagedSource,
        fetcher: Arc<CountingFetcher>,
        extractor: Arc<dyn AbstractExtractor>,
        pages: u32,
    ) -> EnrichmentOrchestrator {
        let config = Arc::new(AppConfig::default());
        let source: Arc<dyn SourceQuery> = Arc::new(source);
        let chain = FallbackChain::new(
            Arc::clone(&source),
            extractor,
            Vec::new(),
            None,
            TabPool::new(fetcher, config.limits.tab_concurrency),
            Arc::clone(&config),
        );
        let ledger = Arc::new(ResultLedger::new(pages, config.limits.records_per_page));
        EnrichmentOrchestrator::new(source, Arc::new(chain), ledger, config.limits.records_per_page)
    }

    #[tokio::test]
    async fn test_citation_filter_scenario() {
        let records: Vec<RawRecord> = (0..10)
            .map(|i| raw(i, Some(if i % 3 == 0 && i < 9 { 5 } else { 50 })))
            .collect();
        let fetcher = CountingFetcher::new(Duration::ZERO);
        let orch = orchestrator(
            PagedSource::new(vec![Ok(records)]),
            fetcher.clone(),
            Arc::new(EchoExtractor),
            1,
        );
        let spec = QuerySpec::builder("transformer networks")
            .pages(1)
            .min_cite(Some(10))
            .build()
            .expect("valid spec");

        orch.run(&spec, CancellationToken::new()).await.expect("run");

        let counts = orch.ledger().counts();
        assert_eq!(counts.filtered, 3);
        assert_eq!(counts.success, 7);

        let out = orch.ledger().deliver(true);
        assert_eq!(out.len(), 10);
        for i in [0usize, 3, 6] {
            assert!(out[i].abstract_text.is_none());
            assert!(out[i].bib.is_none());
            assert!(out[i].error.contains(&REASON_BELOW_THRESHOLD.to_string()));
        }

        let fetched: HashSet<String> = fetcher.fetched().into_iter().collect();
        assert_eq!(fetched.len(), 7);
        for i in [0usize, 3, 6] {
            assert!(!fetched.contains(&format!("https://example.org/{}", i)));
        }
        assert!((orch.ledger().progress() - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_missing_citation_count_is_filtered() {
        let fetcher = CountingFetcher::new(Duration::ZERO);
        let orch = orchestrator(
            PagedSource::new(vec![Ok(vec![raw(0, None), raw(1, Some(20))])]),
            fetcher.clone(),
            Arc::new(EchoExtractor),
            1,
        );
        let spec = QuerySpec::builder("x").min_cite(Some(10)).build().expect("spec");
        orch.run(&spec, CancellationToken::new()).await.expect("run");

        assert_eq!(orch.ledger().state(0), Some(RecordState::Filtered));
        assert_eq!(orch.ledger().deliver(true)[0].error, vec![REASON_NO_CITATIONS.to_string()]);
        assert_eq!(fetcher.fetched(), vec!["https://example.org/1".to_string()]);
    }

    #[tokio::test]
    async fn test_every_registration_is_delivered() {
        let mut pages = Vec::new();
        let mut n = 0;
        for size in [10, 10, 3] {
            let page: Vec<RawRecord> = (0..size)
                .map(|_| {
                    let mut r = raw(n, Some(100));
                    if n % 5 == 1 {
                        r.url = format!("https://example.org/broken/{}", n);
                    }
                    n += 1;
                    r
                })
                .collect();
            pages.push(Ok(page));
        }
        let orch = orchestrator(
            PagedSource::new(pages),
            CountingFetcher::new(Duration::ZERO),
            Arc::new(EchoExtractor),
            3,
        );
        let spec = QuerySpec::builder("x").pages(3).build().expect("spec");
        orch.run(&spec, CancellationToken::new()).await.expect("run");

        let counts = orch.ledger().counts();
        assert_eq!(counts.registered, 23);
        assert_eq!(counts.filtered, 0);
        assert_eq!(counts.success, 18);
        assert_eq!(counts.failed, 5);
        assert_eq!(orch.ledger().deliver(true).len(), 23);
        assert_eq!(orch.ledger().capacity(), 30);
    }

    #[tokio::test]
    async fn test_page_cap_and_order() {
        let records: Vec<RawRecord> = (0..14).map(|i| raw(i, Some(1))).collect();
        let orch = orchestrator(
            PagedSource::new(vec![Ok(records)]),
            CountingFetcher::new(Duration::ZERO),
            Arc::new(EchoExtractor),
            1,
        );
        let spec = QuerySpec::builder("x").build().expect("spec");
        orch.run(&spec, CancellationToken::new()).await.expect("run");

        let out = orch.ledger().deliver(true);
        assert_eq!(out.len(), 10);
        for (i, record) in out.iter().enumerate() {
            assert_eq!(record.title, format!("paper {}", i));
        }
    }

    #[tokio::test]
    async fn test_source_unavailable_without_records() {
        let orch = orchestrator(
            PagedSource::new(vec![Err(PubfillError::Captcha)]),
            CountingFetcher::new(Duration::ZERO),
            Arc::new(EchoExtractor),
            2,
        );
        let spec = QuerySpec::builder("x").pages(2).build().expect("spec");
        let result = orch.run(&spec, CancellationToken::new()).await;
        assert!(matches!(result, Err(PubfillError::SourceUnavailable(_))));
    }

    #[tokio::test]
    async fn test_later_page_failure_is_a_warning() {
        let orch = orchestrator(
            PagedSource::new(vec![Ok(vec![raw(0, None)]), Err(PubfillError::Captcha)]),
            CountingFetcher::new(Duration::ZERO),
            Arc::new(EchoExtractor),
            2,
        );
        let spec = QuerySpec::builder("x").pages(2).build().expect("spec");
        orch.run(&spec, CancellationToken::new()).await.expect("partial run");
        assert_eq!(orch.ledger().len(), 1);
        assert_eq!(orch.ledger().warnings().len(), 1);
    }

    #[tokio::test]
    async fn test_panic_becomes_record_failure() {
        let orch = orchestrator(
            PagedSource::new(vec![Ok(vec![raw(0, None), raw(1, None)])]),
            CountingFetcher::new(Duration::ZERO),
            Arc::new(PanickingExtractor),
            1,
        );
        let spec = QuerySpec::builder("x").build().expect("spec");
        orch.run(&spec, CancellationToken::new()).await.expect("run");

        let out = orch.ledger().deliver(false);
        assert_eq!(out.len(), 2);
        for record in out {
            assert!(record
                .error
                .iter()
                .any(|e| e.starts_with("unexpected error: extractor exploded")));
        }
        assert_eq!(orch.ledger().counts().failed, 2);
    }

    #[tokio::test]
    async fn test_cancellation_leaves_no_tasks_behind() {
        let fetcher = CountingFetcher::new(Duration::from_secs(3600));
        let active = Arc::clone(&fetcher.active);
        let records: Vec<RawRecord> = (0..10).map(|i| raw(i, None)).collect();
        let orch = orchestrator(
            PagedSource::new(vec![Ok(records)]),
            fetcher,
            Arc::new(EchoExtractor),
            1,
        );
        let spec = QuerySpec::builder("x").build().expect("spec");
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        let watcher = Arc::clone(&active);
        tokio::spawn(async move {
            while watcher.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            trigger.cancel();
        });

        let result = orch.run(&spec, cancel).await;
        assert!(matches!(result, Err(PubfillError::Cancelled)));
        assert_eq!(active.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(active.load(Ordering::SeqCst), 0);
        let counts = orch.ledger().counts();
        assert_eq!(counts.registered, 10);
        assert_eq!(counts.resolved(), 0);
    }
}
