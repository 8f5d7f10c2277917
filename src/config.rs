//! Service configuration.
//!
//! One immutable [`AppConfig`] is built at start-up (CLI flags with env
//! fallbacks, see `main.rs`) and handed to every collaborator constructor.
//! Nothing reads configuration from global state.

use std::path::PathBuf;
use std::time::Duration;

/// Concurrency limits shared by all records of one session.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Concurrent browser-tab operations per session
    pub tab_concurrency: usize,
    /// Concurrent BibTeX fetches per session
    pub bibtex_concurrency: usize,
    /// Records taken from each result page
    pub records_per_page: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            tab_concurrency: 5,
            bibtex_concurrency: 5,
            records_per_page: 10,
        }
    }
}

/// Per-operation time budgets.
#[derive(Debug, Clone)]
pub struct Timeouts {
    /// Fixed wait after a tab opens, before polling for markers
    pub page_settle: Duration,
    /// Marker + ready-state wait for a direct page fetch
    pub fetch_budget: Duration,
    /// Same, for pages reached through a mirror site (slower, more scripts)
    pub mirror_fetch_budget: Duration,
    /// Mirror search (discovery) request
    pub mirror_search: Duration,
    /// One LLM extraction call
    pub llm: Duration,
    /// One BibTeX fetch attempt
    pub bibtex: Duration,
    /// Heartbeat interval on the session transport
    pub heartbeat: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            page_settle: Duration::from_secs(2),
            fetch_budget: Duration::from_secs(30),
            mirror_fetch_budget: Duration::from_secs(40),
            mirror_search: Duration::from_secs(30),
            llm: Duration::from_secs(60),
            bibtex: Duration::from_secs(60),
            heartbeat: Duration::from_secs(5),
        }
    }
}

/// OpenAI-compatible chat completion endpoint used for abstract extraction.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Visible page text is cut to this many characters before prompting
    pub max_page_chars: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.5,
            max_tokens: 1024,
            max_page_chars: 60_000,
        }
    }
}

/// Google Scholar access.
#[derive(Debug, Clone, Default)]
pub struct ScholarConfig {
    /// Custom base URL for mirror sites
    pub base_url: Option<String>,
    /// Proxy URL (e.g., "http://127.0.0.1:7890")
    pub proxy: Option<String>,
    /// Cookie file; defaults to `~/.gscholar_cookies.json`
    pub cookie_path: Option<PathBuf>,
}

impl ScholarConfig {
    /// Requests go through a throttled proxy, so BibTeX gets a second attempt.
    pub fn is_proxy_throttled(&self) -> bool {
        self.proxy.is_some()
    }
}

/// Keys for the alternate sources.
#[derive(Debug, Clone, Default)]
pub struct MirrorConfig {
    pub semantic_scholar_key: Option<String>,
    pub spider_api_key: Option<String>,
}

/// Headless browser settings.
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_path: None,
        }
    }
}

/// Everything a session needs.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Shared secret clients must present as `api_key`
    pub app_key: String,
    pub limits: Limits,
    pub timeouts: Timeouts,
    pub llm: LlmConfig,
    pub scholar: ScholarConfig,
    pub mirrors: MirrorConfig,
    pub browser: BrowserConfig,
    /// A BibTeX failure marks the record Failed unless the query ignores BibTeX
    pub bibtex_required: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_key: String::new(),
            limits: Limits::default(),
            timeouts: Timeouts::default(),
            llm: LlmConfig::default(),
            scholar: ScholarConfig::default(),
            mirrors: MirrorConfig::default(),
            browser: BrowserConfig::default(),
            bibtex_required: true,
        }
    }
}

impl AppConfig {
    /// Attempts per BibTeX fetch: one, or two behind a throttled proxy.
    pub fn bibtex_attempts(&self) -> u32 {
        if self.scholar.is_proxy_throttled() {
            2
        } else {
            1
        }
    }
}
