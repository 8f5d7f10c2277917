//! Alternate sources used to re-discover a publication when its primary page
//! is blocked, a PDF, or yields no abstract.

pub mod researchgate;
pub mod semanticscholar;

pub use researchgate::ResearchGate;
pub use semanticscholar::SemanticScholar;

use crate::browser::{FetchRequest, TabPool};
use crate::names;
use crate::record::RecordSnapshot;
use async_trait::async_trait;
use thiserror::Error;

/// Mirror stage failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MirrorError {
    #[error("no matching candidates")]
    NoCandidates,
    #[error("all candidates failed: {}", .0.join("; "))]
    Exhausted(Vec<String>),
    #[error("mirror search failed: {0}")]
    Search(String),
}

/// Something the extractor can be run against.
#[derive(Debug, Clone)]
pub enum Candidate {
    /// Page still to be loaded in a tab
    Page(FetchRequest),
    /// Content already in hand
    Content(String),
}

/// A site that can be searched for a record by title and first author.
#[async_trait]
pub trait MirrorSource: Send + Sync {
    fn name(&self) -> &str;

    /// Candidates in the order the site listed them.
    async fn discover(
        &self,
        record: &RecordSnapshot,
        tabs: &TabPool,
    ) -> Result<Vec<Candidate>, MirrorError>;
}

/// Title substring plus first-author agreement, shared by all mirrors.
pub(crate) fn is_same_work(
    record: &RecordSnapshot,
    candidate_title: &str,
    candidate_first_author: &str,
) -> bool {
    candidate_title
        .to_lowercase()
        .contains(&record.title.to_lowercase())
        && names::match_names(record.first_author(), candidate_first_author)
}
