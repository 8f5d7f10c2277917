//! rustpubfill - Publication enrichment service
//!
//! Discovers publications on Google Scholar and backfills each one with a full
//! abstract and a BibTeX entry, falling back to mirror sites when the primary
//! page is blocked.
//!
//! ## Usage
//!
//! ### Websocket Server Mode
//! ```bash
//! rustpubfill serve --port 3000 --app-key secret
//! # ws://127.0.0.1:3000/query/transformer%20networks
//! ```
//!
//! ### CLI Mode
//! ```bash
//! rustpubfill search "transformer networks" --pages 2 --min-cite 10
//! ```

use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    response::Response,
    routing::get,
    Router,
};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use rustpubfill::config::{AppConfig, BrowserConfig, LlmConfig, MirrorConfig, ScholarConfig};
use rustpubfill::cookies::{Cookie, CookieManager};
use rustpubfill::record::{OutputRecord, QuerySpec};
use rustpubfill::session::{self, Services, WsTransport};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

// ============================================================================
// CLI Definition
// ============================================================================

/// Publication enrichment service - abstracts and BibTeX for Scholar results
#[derive(Parser)]
#[command(name = "rustpubfill")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as websocket server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "3000", env = "PUBFILL_PORT")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1", env = "PUBFILL_HOST")]
        host: String,

        #[command(flatten)]
        service: ServiceArgs,
    },

    /// Run one query locally and write the results to disk
    Search {
        /// Search keywords
        keyword: String,

        /// Number of result pages (10 records each)
        #[arg(long, default_value = "1")]
        pages: u32,

        /// Earliest publication year
        #[arg(long)]
        year_low: Option<i32>,

        /// Latest publication year
        #[arg(long)]
        year_high: Option<i32>,

        /// Skip records cited fewer times than this
        #[arg(long)]
        min_cite: Option<u32>,

        /// Do not fetch BibTeX
        #[arg(long)]
        ignore_bibtex: bool,

        /// Output directory
        #[arg(short, long, default_value = "./output")]
        output: PathBuf,

        #[command(flatten)]
        service: ServiceArgs,
    },

    /// Manage cookies
    Cookies {
        /// Cookie file (defaults to ~/.gscholar_cookies.json)
        #[arg(long, env = "PUBFILL_COOKIE_FILE", global = true)]
        cookie_file: Option<PathBuf>,

        #[command(subcommand)]
        action: CookieAction,
    },
}

#[derive(Subcommand)]
enum CookieAction {
    /// Clear stored cookies
    Clear,
    /// Show cookie file path
    Path,
    /// Paste cookies exported from a browser (JSON)
    Import,
}

/// Settings shared by `serve` and `search`.
#[derive(Args)]
struct ServiceArgs {
    /// Shared secret clients send as `api_key`
    #[arg(long, env = "PUBFILL_APP_KEY", default_value = "")]
    app_key: String,

    /// Proxy URL (e.g., http://127.0.0.1:7890); enables a second BibTeX attempt
    #[arg(long, env = "PUBFILL_PROXY")]
    proxy: Option<String>,

    /// Scholar mirror site URL
    #[arg(long, env = "PUBFILL_SCHOLAR_MIRROR")]
    mirror: Option<String>,

    /// Cookie file (defaults to ~/.gscholar_cookies.json)
    #[arg(long, env = "PUBFILL_COOKIE_FILE")]
    cookie_file: Option<PathBuf>,

    /// LLM API base URL
    #[arg(long, env = "PUBFILL_LLM_BASE_URL", default_value = "https://api.openai.com/v1")]
    llm_base_url: String,

    /// LLM API key
    #[arg(long, env = "PUBFILL_LLM_KEY", default_value = "")]
    llm_key: String,

    /// LLM model name
    #[arg(long, env = "PUBFILL_LLM_MODEL", default_value = "gpt-4o-mini")]
    llm_model: String,

    /// Semantic Scholar API key
    #[arg(long, env = "PUBFILL_SEMANTIC_SCHOLAR_KEY")]
    semantic_scholar_key: Option<String>,

    /// Spider API key (BibTeX render fallback)
    #[arg(long, env = "PUBFILL_SPIDER_KEY")]
    spider_key: Option<String>,

    /// Chrome/Chromium executable
    #[arg(long, env = "PUBFILL_CHROME")]
    chrome_path: Option<PathBuf>,

    /// Show the browser window
    #[arg(long, env = "PUBFILL_HEADED")]
    headed: bool,

    /// Concurrent browser tabs per session
    #[arg(long, env = "PUBFILL_TABS", default_value = "5")]
    tabs: usize,

    /// Concurrent BibTeX fetches per session
    #[arg(long, env = "PUBFILL_BIBTEX_WORKERS", default_value = "5")]
    bibtex_workers: usize,

    /// A missing BibTeX entry does not fail the record
    #[arg(long, env = "PUBFILL_BIBTEX_OPTIONAL")]
    bibtex_optional: bool,
}

impl ServiceArgs {
    fn into_config(self) -> AppConfig {
        let mut config = AppConfig {
            app_key: self.app_key,
            llm: LlmConfig {
                base_url: self.llm_base_url,
                api_key: self.llm_key,
                model: self.llm_model,
                ..Default::default()
            },
            scholar: ScholarConfig {
                base_url: self.mirror,
                proxy: self.proxy,
                cookie_path: self.cookie_file,
            },
            mirrors: MirrorConfig {
                semantic_scholar_key: self.semantic_scholar_key,
                spider_api_key: self.spider_key,
            },
            browser: BrowserConfig {
                headless: !self.headed,
                chrome_path: self.chrome_path,
            },
            bibtex_required: !self.bibtex_optional,
            ..Default::default()
        };
        config.limits.tab_concurrency = self.tabs.max(1);
        config.limits.bibtex_concurrency = self.bibtex_workers.max(1);
        config
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    if cli.log_json {
        fmt().json().with_env_filter(filter).with_target(true).init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .init();
    }

    match cli.command {
        Commands::Serve {
            port,
            host,
            service,
        } => run_server(host, port, service.into_config()).await,
        Commands::Search {
            keyword,
            pages,
            year_low,
            year_high,
            min_cite,
            ignore_bibtex,
            output,
            service,
        } => {
            let spec = QuerySpec::builder(keyword)
                .pages(pages)
                .year_low(year_low)
                .year_high(year_high)
                .min_cite(min_cite)
                .ignore_bibtex(ignore_bibtex)
                .build()
                .context("Invalid search parameters")?;
            run_search(spec, output, service.into_config()).await
        }
        Commands::Cookies {
            cookie_file,
            action,
        } => handle_cookies(cookie_file, action),
    }
}

// ============================================================================
// Websocket Server
// ============================================================================

async fn run_server(host: String, port: u16, config: AppConfig) -> Result<()> {
    if config.app_key.is_empty() {
        warn!("No app key configured; only clients sending an empty api_key will be accepted");
    }
    if config.llm.api_key.is_empty() {
        warn!("No LLM API key configured; abstract extraction will fail");
    }

    let services = Arc::new(Services::from_config(config).context("Failed to build services")?);

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/query/{name}", get(query_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(Arc::clone(&services));

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .context("Invalid host:port")?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Listening");
    println!("Listening on ws://{}/query/{{name}}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    services
        .source
        .persist_state()
        .await
        .context("Failed to save Scholar cookies")?;
    Ok(())
}

/// Health check endpoint
async fn health_handler() -> &'static str {
    "OK"
}

/// Upgrade `/query/{name}` to a query session for `name`.
async fn query_handler(
    ws: WebSocketUpgrade,
    Path(name): Path<String>,
    State(services): State<Arc<Services>>,
) -> Response {
    info!(query = %name, "Session requested");
    ws.on_upgrade(move |socket| async move {
        session::run_session(WsTransport::new(socket), &name, services).await;
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

// ============================================================================
// Local Search
// ============================================================================

async fn run_search(spec: QuerySpec, output_dir: PathBuf, config: AppConfig) -> Result<()> {
    // Create output folder
    let timestamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
    let safe_keyword: String = spec
        .name()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == ' ' || *c == '-' || *c == '_')
        .collect::<String>()
        .trim()
        .replace(' ', "_");
    let output_folder = output_dir.join(format!("{}_{}", timestamp, safe_keyword));
    std::fs::create_dir_all(&output_folder).context("Failed to create output directory")?;

    println!("Output folder: {}", output_folder.display());

    let services = Services::from_config(config).context("Failed to build services")?;
    let fetcher = services
        .launcher
        .launch()
        .await
        .context("Failed to launch browser")?;
    let orchestrator = services.orchestrator(Arc::clone(&fetcher), spec.pages());

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nInterrupted, cancelling...");
            on_interrupt.cancel();
        }
    });

    println!("Searching \"{}\" ({} page(s))...", spec.name(), spec.pages());
    let outcome = orchestrator.run(&spec, cancel).await;
    fetcher.shutdown().await;
    if let Err(e) = services.source.persist_state().await {
        warn!(error = %e, "Failed to save Scholar cookies");
    }

    let ledger = orchestrator.ledger();
    if let Err(e) = &outcome {
        println!("Run ended early: {}", e);
    }
    for warning in ledger.warnings() {
        println!("Warning: {}", warning);
    }

    let results = ledger.deliver(!spec.ignore_bibtex());
    let counts = ledger.counts();
    println!(
        "Records: {} registered, {} success, {} failed, {} filtered",
        counts.registered, counts.success, counts.failed, counts.filtered
    );

    let json_path = output_folder.join("results.json");
    let json = serde_json::to_string_pretty(&results).context("Failed to encode results")?;
    std::fs::write(&json_path, json).context("Failed to write results.json")?;
    println!("Saved: {:?}", json_path);

    let rows: Vec<CsvRow> = results.iter().map(CsvRow::from).collect();
    save_csv(&output_folder.join("results.csv"), &rows)?;

    println!("\n✓ Search complete. Results in: {}", output_folder.display());
    Ok(())
}

/// Flat CSV view of an output record.
#[derive(Debug, Serialize)]
struct CsvRow {
    title: String,
    author: String,
    pub_year: String,
    pub_url: String,
    num_citations: String,
    eprint_url: String,
    abstract_text: String,
    bib_link: String,
    bib: String,
    error: String,
}

impl From<&OutputRecord> for CsvRow {
    fn from(r: &OutputRecord) -> Self {
        Self {
            title: r.title.clone(),
            author: r.author.clone(),
            pub_year: r.pub_year.clone().unwrap_or_default(),
            pub_url: r.pub_url.clone(),
            num_citations: r.num_citations.map(|n| n.to_string()).unwrap_or_default(),
            eprint_url: r.eprint_url.clone().unwrap_or_default(),
            abstract_text: r.abstract_text.clone().unwrap_or_default(),
            bib_link: r.bib_link.clone().unwrap_or_default(),
            bib: r.bib.clone().unwrap_or_default(),
            error: r.error.join("; "),
        }
    }
}

/// Save data to CSV file
fn save_csv<T: Serialize>(path: &std::path::Path, data: &[T]) -> Result<()> {
    if data.is_empty() {
        println!("No data to save to {:?}", path);
        return Ok(());
    }

    let mut wtr = csv::WriterBuilder::new()
        .has_headers(true)
        .from_path(path)
        .context("Failed to create CSV writer")?;

    for item in data {
        wtr.serialize(item).context("Failed to write CSV record")?;
    }

    wtr.flush().context("Failed to flush CSV")?;
    println!("Saved: {:?}", path);
    Ok(())
}

// ============================================================================
// Cookie Management
// ============================================================================

fn handle_cookies(cookie_file: Option<PathBuf>, action: CookieAction) -> Result<()> {
    let manager = CookieManager::from_config(&ScholarConfig {
        cookie_path: cookie_file,
        ..Default::default()
    });

    match action {
        CookieAction::Clear => {
            manager.clear()?;
            println!("Cookies cleared.");
        }
        CookieAction::Path => {
            println!("Cookie file: {:?}", manager.path());
        }
        CookieAction::Import => import_cookies(&manager)?,
    }

    Ok(())
}

fn import_cookies(manager: &CookieManager) -> Result<()> {
    use std::io::{self, Write};

    println!("1. Open https://scholar.google.com and complete any CAPTCHA");
    println!("2. Export the cookies for scholar.google.com as JSON");
    println!("Format: [{{\"name\":\"NID\",\"value\":\"xxx\",\"domain\":\".google.com\"}},...]");
    println!();
    print!("> ");
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim();

    if input.is_empty() {
        println!("No cookies provided. You can manually create the cookie file at:");
        println!("{:?}", manager.path());
        return Ok(());
    }

    let cookies: Vec<Cookie> =
        serde_json::from_str(input).context("Failed to parse cookies; expected a JSON array")?;
    manager.save(&cookies)?;
    println!("Saved {} cookies to {:?}", cookies.len(), manager.path());
    Ok(())
}
