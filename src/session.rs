//! One query session over a message transport.
//!
//! The session reads the opening parameters, acquires a browser, drives the
//! orchestrator with periodic heartbeats and ends with exactly one terminal
//! message (`Result` or `Error`). The browser is released once, after every
//! enrichment task has finished or been cancelled.

use crate::browser::{BrowserLauncher, ChromeLauncher, PageFetcher, TabPool};
use crate::config::AppConfig;
use crate::error::{PubfillError, Result};
use crate::extractor::{AbstractExtractor, LlmExtractor};
use crate::fallback::FallbackChain;
use crate::gscholar::{ScholarSource, SourceQuery};
use crate::ledger::ResultLedger;
use crate::mirrors::researchgate::ResearchGate;
use crate::mirrors::semanticscholar::SemanticScholar;
use crate::mirrors::MirrorSource;
use crate::orchestrator::EnrichmentOrchestrator;
use crate::params;
use crate::record::OutputRecord;
use crate::render::{RenderApi, SpiderRender};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Sent best-effort when the client ends a session early.
pub const ENDED_BY_CLIENT: &str = "session ended by client";

/// Server to client messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    Heartbeat {
        progress: f64,
    },
    Result {
        error: Option<String>,
        data: Vec<OutputRecord>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        warnings: Vec<String>,
    },
    Error {
        error: String,
    },
}

/// What the session cares about from the client side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Text(String),
    Close,
}

/// Bidirectional message channel for one session.
///
/// `recv` must be cancel safe: the session polls it inside `select!`.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, message: &ServerMessage) -> Result<()>;

    /// `None` once the peer is gone.
    async fn recv(&mut self) -> Option<ClientFrame>;

    async fn close(&mut self);
}

/// Collaborators shared by every session of a server.
pub struct Services {
    pub config: Arc<AppConfig>,
    pub source: Arc<dyn SourceQuery>,
    pub extractor: Arc<dyn AbstractExtractor>,
    pub mirrors: Vec<Arc<dyn MirrorSource>>,
    pub render: Option<Arc<dyn RenderApi>>,
    pub launcher: Arc<dyn BrowserLauncher>,
}

impl Services {
    /// Wire up the production implementations.
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let source = ScholarSource::new(&config.scholar)?;
        let extractor = LlmExtractor::new(config.llm.clone(), config.timeouts.llm)?;

        let mirrors: Vec<Arc<dyn MirrorSource>> = vec![
            Arc::new(ResearchGate::new(config.timeouts.clone())),
            Arc::new(SemanticScholar::new(
                config.mirrors.semantic_scholar_key.clone(),
                config.timeouts.clone(),
            )?),
        ];

        let render: Option<Arc<dyn RenderApi>> = match &config.mirrors.spider_api_key {
            Some(key) => Some(Arc::new(SpiderRender::new(key.clone(), config.timeouts.bibtex)?)),
            None => {
                warn!("No Spider API key configured; BibTeX render fallback disabled");
                None
            }
        };

        let launcher = Arc::new(ChromeLauncher::new(config.browser.clone()));

        Ok(Self {
            config: Arc::new(config),
            source: Arc::new(source),
            extractor: Arc::new(extractor),
            mirrors,
            render,
            launcher,
        })
    }

    /// Build an orchestrator over a fresh ledger sized for `pages`.
    pub fn orchestrator(&self, fetcher: Arc<dyn PageFetcher>, pages: u32) -> EnrichmentOrchestrator {
        let limits = &self.config.limits;
        let chain = FallbackChain::new(
            Arc::clone(&self.source),
            Arc::clone(&self.extractor),
            self.mirrors.clone(),
            self.render.clone(),
            TabPool::new(fetcher, limits.tab_concurrency),
            Arc::clone(&self.config),
        );
        let ledger = Arc::new(ResultLedger::new(pages, limits.records_per_page));
        EnrichmentOrchestrator::new(
            Arc::clone(&self.source),
            Arc::new(chain),
            ledger,
            limits.records_per_page,
        )
    }
}

enum Event {
    Finished(Result<()>),
    Tick,
    Client(Option<ClientFrame>),
}

/// Drive one session to its terminal message and close the transport.
pub async fn run_session<T: Transport>(mut transport: T, name: &str, services: Arc<Services>) {
    let first = match transport.recv().await {
        Some(ClientFrame::Text(text)) => text,
        Some(ClientFrame::Close) | None => {
            info!(query = %name, "Client left before sending parameters");
            transport.close().await;
            return;
        }
    };

    let spec = match params::parse(name, &first, &services.config.app_key) {
        Ok(spec) => spec,
        Err(e) => {
            warn!(query = %name, error = %e, "Rejected session parameters");
            fail_setup(&mut transport, e).await;
            return;
        }
    };

    let fetcher = match services.launcher.launch().await {
        Ok(fetcher) => fetcher,
        Err(e) => {
            error!(query = %name, error = %e, "Browser unavailable");
            fail_setup(&mut transport, e).await;
            return;
        }
    };

    let orchestrator = services.orchestrator(Arc::clone(&fetcher), spec.pages());
    let ledger = Arc::clone(orchestrator.ledger());
    let cancel = CancellationToken::new();

    let period = services.config.timeouts.heartbeat;
    let mut heartbeat = interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let run = orchestrator.run(&spec, cancel.clone());
    tokio::pin!(run);

    let outcome = loop {
        let event = tokio::select! {
            result = &mut run => Event::Finished(result),
            _ = heartbeat.tick() => Event::Tick,
            frame = transport.recv() => Event::Client(frame),
        };

        match event {
            Event::Finished(result) => break Some(result),
            Event::Tick => {
                let progress = ledger.progress();
                debug!(query = %name, progress, "Heartbeat");
                if let Err(e) = transport.send(&ServerMessage::Heartbeat { progress }).await {
                    warn!(error = %e, "Heartbeat failed; treating client as gone");
                    break None;
                }
            }
            Event::Client(Some(ClientFrame::Text(text))) if params::is_quit(&text) => {
                info!(query = %name, "Client requested end of session");
                break None;
            }
            Event::Client(Some(ClientFrame::Text(_))) => {
                debug!("Ignoring client message during processing");
            }
            Event::Client(Some(ClientFrame::Close)) | Event::Client(None) => {
                info!(query = %name, "Client disconnected");
                break None;
            }
        }
    };

    let outcome = match outcome {
        Some(result) => Some(result),
        None => {
            cancel.cancel();
            if let Err(e) = run.await {
                debug!(error = %e, "Orchestrator unwound");
            }
            None
        }
    };

    fetcher.shutdown().await;
    if let Err(e) = services.source.persist_state().await {
        warn!(error = %e, "Failed to save source state");
    }

    let message = match outcome {
        Some(result) => ServerMessage::Result {
            error: result.err().map(|e| e.to_string()),
            data: ledger.deliver(!spec.ignore_bibtex()),
            warnings: ledger.warnings(),
        },
        None => ServerMessage::Error {
            error: ENDED_BY_CLIENT.to_string(),
        },
    };
    if let Err(e) = transport.send(&message).await {
        debug!(error = %e, "Terminal message not delivered");
    }
    transport.close().await;

    let counts = ledger.counts();
    info!(
        query = %name,
        registered = counts.registered,
        success = counts.success,
        failed = counts.failed,
        filtered = counts.filtered,
        "Session closed"
    );
}

async fn fail_setup<T: Transport>(transport: &mut T, e: PubfillError) {
    let message = ServerMessage::Error {
        error: e.to_string(),
    };
    if let Err(e) = transport.send(&message).await {
        debug!(error = %e, "Setup error not delivered");
    }
    transport.close().await;
}

/// [`Transport`] over an axum websocket.
pub struct WsTransport {
    socket: WebSocket,
}

impl WsTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, message: &ServerMessage) -> Result<()> {
        let json = serde_json::to_string(message)?;
        self.socket
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| PubfillError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<ClientFrame> {
        loop {
            match self.socket.recv().await? {
                Ok(Message::Text(text)) => return Some(ClientFrame::Text(text.as_str().to_string())),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(ClientFrame::Text(text)),
                    Err(_) => debug!("Ignoring non-UTF-8 binary frame"),
                },
                Ok(Message::Close(_)) => return Some(ClientFrame::Close),
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "Websocket receive failed");
                    return None;
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.socket.send(Message::Close(None)).await {
            debug!(error = %e, "Websocket already closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bibtex;
    use crate::browser::{FetchError, FetchRequest};
    use crate::extractor::ExtractError;
    use crate::record::{RawRecord, RecordSnapshot, QuerySpec};
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const KEY: &str = "k";

    /// Client side is an mpsc channel; everything sent is recorded.
    struct ChannelTransport {
        inbound: mpsc::UnboundedReceiver<ClientFrame>,
        sent: Arc<Mutex<Vec<Value>>>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for ChannelTransport {
        async fn send(&mut self, message: &ServerMessage) -> Result<()> {
            let value = serde_json::to_value(message)?;
            if let Ok(mut sent) = self.sent.lock() {
                sent.push(value);
            }
            Ok(())
        }

        async fn recv(&mut self) -> Option<ClientFrame> {
            self.inbound.recv().await
        }

        async fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Client {
        outbound: mpsc::UnboundedSender<ClientFrame>,
        sent: Arc<Mutex<Vec<Value>>>,
        closed: Arc<AtomicUsize>,
    }

    impl Client {
        fn messages(&self) -> Vec<Value> {
            self.sent.lock().map(|s| s.clone()).unwrap_or_default()
        }

        fn say(&self, text: &str) {
            let _ = self.outbound.send(ClientFrame::Text(text.to_string()));
        }
    }

    fn channel() -> (ChannelTransport, Client) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicUsize::new(0));
        (
            ChannelTransport {
                inbound: rx,
                sent: Arc::clone(&sent),
                closed: Arc::clone(&closed),
            },
            Client {
                outbound: tx,
                sent,
                closed,
            },
        )
    }

    struct ListSource {
        records: Vec<RawRecord>,
        persists: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SourceQuery for ListSource {
        async fn fetch_page(&self, _spec: &QuerySpec, page: u32) -> Result<Vec<RawRecord>> {
            Ok(if page == 0 { self.records.clone() } else { Vec::new() })
        }

        async fn citation_link(&self, _record: &RecordSnapshot) -> Result<Option<String>> {
            Ok(Some("https://example.org/cite".into()))
        }

        async fn fetch_citation(&self, _link: &str) -> Result<String> {
            Ok("@article{a,\n  title={A}\n}".into())
        }

        async fn persist_state(&self) -> Result<()> {
            self.persists.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct SlowFetcher {
        delay: Duration,
        shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PageFetcher for SlowFetcher {
        async fn fetch(&self, _request: &FetchRequest) -> std::result::Result<String, FetchError> {
            tokio::time::sleep(self.delay).await;
            Ok("<html><body>page</body></html>".into())
        }

        async fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeLauncher {
        delay: Duration,
        fail: bool,
        launches: AtomicUsize,
        shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BrowserLauncher for FakeLauncher {
        async fn launch(&self) -> Result<Arc<dyn PageFetcher>> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(PubfillError::Browser("no chrome".into()));
            }
            Ok(Arc::new(SlowFetcher {
                delay: self.delay,
                shutdowns: Arc::clone(&self.shutdowns),
            }))
        }
    }

    struct Echo;

    #[async_trait]
    impl AbstractExtractor for Echo {
        async fn extract(&self, snippet: &str, _page: &str) -> std::result::Result<String, ExtractError> {
            Ok(format!("{}.", snippet))
        }
    }

    fn services(
        fetch_delay: Duration,
        fail_launch: bool,
    ) -> (Arc<Services>, Arc<FakeLauncher>, Arc<AtomicUsize>) {
        let mut config = AppConfig {
            app_key: KEY.into(),
            ..Default::default()
        };
        config.timeouts.heartbeat = Duration::from_millis(20);

        let records = (0..3)
            .map(|i| RawRecord {
                title: format!("t{}", i),
                author: "A B".into(),
                url: format!("https://example.org/{}", i),
                snippet: format!("s{}", i),
                num_citations: Some(7),
                ..Default::default()
            })
            .collect();

        let launcher = Arc::new(FakeLauncher {
            delay: fetch_delay,
            fail: fail_launch,
            launches: AtomicUsize::new(0),
            shutdowns: Arc::new(AtomicUsize::new(0)),
        });
        let persists = Arc::new(AtomicUsize::new(0));
        let services = Services {
            config: Arc::new(config),
            source: Arc::new(ListSource {
                records,
                persists: Arc::clone(&persists),
            }),
            extractor: Arc::new(Echo),
            mirrors: Vec::new(),
            render: None,
            launcher: launcher.clone(),
        };
        (Arc::new(services), launcher, persists)
    }

    fn types(messages: &[Value]) -> VecDeque<String> {
        messages
            .iter()
            .filter_map(|m| m["type"].as_str().map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn test_session_delivers_result() {
        let (services, launcher, persists) = services(Duration::from_millis(60), false);
        let (transport, client) = channel();
        client.say(r#"{"api_key": "k", "pages": 1}"#);

        run_session(transport, "test query", services).await;

        let messages = client.messages();
        let mut kinds = types(&messages);
        assert_eq!(kinds.pop_back().as_deref(), Some("Result"));
        assert!(kinds.iter().all(|k| k == "Heartbeat"));
        assert!(!kinds.is_empty());

        let result = messages.last().expect("terminal message");
        assert!(result["error"].is_null());
        let data = result["data"].as_array().expect("data");
        assert_eq!(data.len(), 3);
        assert_eq!(data[0]["abstract"], "s0.");
        let bib = data[0]["bib"].as_str().expect("bib");
        assert_eq!(bibtex::abstract_of(bib).as_deref(), Some("s0."));
        assert!(result.get("warnings").is_none());

        assert_eq!(launcher.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(persists.load(Ordering::SeqCst), 1);
        assert_eq!(client.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bad_api_key_closes_with_error() {
        let (services, launcher, _) = services(Duration::ZERO, false);
        let (transport, client) = channel();
        client.say(r#"{"api_key": "wrong"}"#);

        run_session(transport, "q", services).await;

        let messages = client.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["type"], "Error");
        assert!(messages[0]["error"].as_str().expect("error").contains("api_key"));
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
        assert_eq!(client.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_browser_failure_is_setup_error() {
        let (services, launcher, _) = services(Duration::ZERO, true);
        let (transport, client) = channel();
        client.say(r#"{"api_key": "k"}"#);

        run_session(transport, "q", services).await;

        let messages = client.messages();
        assert_eq!(types(&messages), VecDeque::from(vec!["Error".to_string()]));
        assert!(messages[0]["error"].as_str().expect("error").contains("no chrome"));
        assert_eq!(launcher.shutdowns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_quit_cancels_and_releases_browser_once() {
        let (services, launcher, _) = services(Duration::from_secs(3600), false);
        let (transport, client) = channel();
        client.say(r#"{"api_key": "k"}"#);

        let outbound = client.outbound.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = outbound.send(ClientFrame::Text("quit".into()));
        });

        tokio::time::timeout(Duration::from_secs(10), run_session(transport, "q", services))
            .await
            .expect("session ends promptly after quit");

        let messages = client.messages();
        let last = messages.last().expect("terminal message");
        assert_eq!(last["type"], "Error");
        assert_eq!(last["error"], ENDED_BY_CLIENT);
        assert_eq!(launcher.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(client.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disconnect_before_parameters() {
        let (services, launcher, _) = services(Duration::ZERO, false);
        let (transport, client) = channel();
        drop(client.outbound);

        run_session(transport, "q", services).await;

        assert!(client.sent.lock().map(|s| s.is_empty()).unwrap_or(false));
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_message_shapes() {
        let hb = serde_json::to_value(ServerMessage::Heartbeat { progress: 0.5 }).expect("json");
        assert_eq!(hb, serde_json::json!({"type": "Heartbeat", "progress": 0.5}));

        let result = serde_json::to_value(ServerMessage::Result {
            error: None,
            data: Vec::new(),
            warnings: vec!["page 2 unavailable".into()],
        })
        .expect("json");
        assert_eq!(result["type"], "Result");
        assert!(result["error"].is_null());
        assert_eq!(result["warnings"][0], "page 2 unavailable");
    }
}
