//! # rustpubfill
//!
//! Publication enrichment service - Google Scholar discovery with abstract and
//! BibTeX backfill, streamed to clients over a websocket.
//!
//! ## Modules
//!
//! - [`session`] - Websocket session: parameters, heartbeats, terminal result
//! - [`orchestrator`] - Page-by-page discovery and bounded enrichment
//! - [`fallback`] - Per-record abstract and citation acquisition
//! - [`ledger`] - Per-session record store and progress
//! - [`gscholar`] - Google Scholar search and citation export
//! - [`mirrors`] - ResearchGate and Semantic Scholar re-discovery
//! - [`browser`] - Headless Chrome page loading
//! - [`extractor`] - LLM abstract extraction
//! - [`error`] - Custom error types
//!
//! ## Usage
//!
//! ```rust,no_run
//! use rustpubfill::config::AppConfig;
//! use rustpubfill::session::Services;
//! use std::sync::Arc;
//!
//! fn main() -> anyhow::Result<()> {
//!     let services = Arc::new(Services::from_config(AppConfig::default())?);
//!     println!("{} mirror sources configured", services.mirrors.len());
//!     Ok(())
//! }
//! ```

pub mod bibtex;
pub mod browser;
pub mod budget;
pub mod config;
pub mod cookies;
pub mod error;
pub mod extractor;
pub mod fallback;
pub mod gscholar;
pub mod html;
pub mod ledger;
pub mod mirrors;
pub mod names;
pub mod orchestrator;
pub mod params;
pub mod prompts;
pub mod record;
pub mod render;
pub mod session;

pub use error::{PubfillError, Result};
