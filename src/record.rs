//! Publication records and the query that produces them.

use crate::bibtex;
use crate::error::{PubfillError, Result};
use serde::{Deserialize, Serialize};

/// Earliest year accepted in a year filter
pub const YEAR_MIN: i32 = 1900;
/// Latest year accepted in a year filter
pub const YEAR_MAX: i32 = 2024;

/// A validated search request. Fields are read-only after `build()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySpec {
    name: String,
    pages: u32,
    year_low: Option<i32>,
    year_high: Option<i32>,
    min_cite: Option<u32>,
    ignore_bibtex: bool,
}

impl QuerySpec {
    /// Start building a query for `name`.
    pub fn builder(name: impl Into<String>) -> QuerySpecBuilder {
        QuerySpecBuilder {
            name: name.into(),
            pages: 1,
            year_low: None,
            year_high: None,
            min_cite: None,
            ignore_bibtex: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pages(&self) -> u32 {
        self.pages
    }

    pub fn year_low(&self) -> Option<i32> {
        self.year_low
    }

    pub fn year_high(&self) -> Option<i32> {
        self.year_high
    }

    pub fn min_cite(&self) -> Option<u32> {
        self.min_cite
    }

    pub fn ignore_bibtex(&self) -> bool {
        self.ignore_bibtex
    }

    /// The citation filter is active only for a positive threshold.
    pub fn citation_threshold(&self) -> Option<u32> {
        self.min_cite.filter(|&m| m > 0)
    }
}

/// Builder for [`QuerySpec`]; `build()` runs all validation.
#[derive(Debug, Clone)]
pub struct QuerySpecBuilder {
    name: String,
    pages: u32,
    year_low: Option<i32>,
    year_high: Option<i32>,
    min_cite: Option<u32>,
    ignore_bibtex: bool,
}

impl QuerySpecBuilder {
    pub fn pages(mut self, pages: u32) -> Self {
        self.pages = pages;
        self
    }

    pub fn year_low(mut self, year: Option<i32>) -> Self {
        self.year_low = year;
        self
    }

    pub fn year_high(mut self, year: Option<i32>) -> Self {
        self.year_high = year;
        self
    }

    pub fn min_cite(mut self, min_cite: Option<u32>) -> Self {
        self.min_cite = min_cite;
        self
    }

    pub fn ignore_bibtex(mut self, ignore: bool) -> Self {
        self.ignore_bibtex = ignore;
        self
    }

    pub fn build(self) -> Result<QuerySpec> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(PubfillError::Validation("search term is empty".into()));
        }
        if self.pages < 1 {
            return Err(PubfillError::Validation(
                "pages must be bigger than or equal to 1".into(),
            ));
        }
        for (key, year) in [("year_low", self.year_low), ("year_high", self.year_high)] {
            if let Some(y) = year {
                if !(YEAR_MIN..=YEAR_MAX).contains(&y) {
                    return Err(PubfillError::Validation(format!(
                        "{} must be within {}..={}, got {}",
                        key, YEAR_MIN, YEAR_MAX, y
                    )));
                }
            }
        }
        if let (Some(lo), Some(hi)) = (self.year_low, self.year_high) {
            if lo > hi {
                return Err(PubfillError::Validation(format!(
                    "year_low ({}) is after year_high ({})",
                    lo, hi
                )));
            }
        }

        Ok(QuerySpec {
            name,
            pages: self.pages,
            year_low: self.year_low,
            year_high: self.year_high,
            min_cite: self.min_cite,
            ignore_bibtex: self.ignore_bibtex,
        })
    }
}

/// One search hit as the source reports it, before registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawRecord {
    pub title: String,
    /// Display author list, comma separated
    pub author: String,
    /// Primary source page
    pub url: String,
    /// Partial abstract shown in the search result
    pub snippet: String,
    pub pub_year: Option<String>,
    pub num_citations: Option<u32>,
    pub eprint_url: Option<String>,
    /// Source-specific identifier used to resolve the citation export
    pub source_id: Option<String>,
    /// Citation export link, when the source exposes it without a lookup
    pub citation_link: Option<String>,
}

/// Where a record is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Registered,
    Enriching,
    Filtered,
    Success,
    Failed,
}

impl RecordState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RecordState::Filtered | RecordState::Success | RecordState::Failed
        )
    }
}

/// Citation export: where it came from and what it said.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bib {
    pub link: Option<String>,
    pub raw: Option<String>,
}

/// A registered record and everything learned about it.
#[derive(Debug, Clone, Serialize)]
pub struct PublicationRecord {
    pub task_id: usize,
    pub title: String,
    pub author: String,
    pub url: String,
    pub snippet: String,
    pub pub_year: Option<String>,
    pub num_citations: Option<u32>,
    pub eprint_url: Option<String>,
    pub source_id: Option<String>,
    pub abstract_text: Option<String>,
    pub bib: Option<Bib>,
    /// Failure annotations, in the order they happened
    pub error: Vec<String>,
    pub state: RecordState,
    /// Citation link known at discovery time
    #[serde(skip)]
    pub(crate) known_citation_link: Option<String>,
}

impl PublicationRecord {
    pub(crate) fn from_raw(task_id: usize, raw: RawRecord) -> Self {
        Self {
            task_id,
            title: raw.title,
            author: raw.author,
            url: raw.url,
            snippet: raw.snippet,
            pub_year: raw.pub_year,
            num_citations: raw.num_citations,
            eprint_url: raw.eprint_url,
            source_id: raw.source_id,
            abstract_text: None,
            bib: None,
            error: Vec::new(),
            state: RecordState::Registered,
            known_citation_link: raw.citation_link,
        }
    }

    /// The part of a record an enrichment task reads.
    pub fn snapshot(&self) -> RecordSnapshot {
        RecordSnapshot {
            task_id: self.task_id,
            title: self.title.clone(),
            author: self.author.clone(),
            url: self.url.clone(),
            snippet: self.snippet.clone(),
            source_id: self.source_id.clone(),
            citation_link: self.known_citation_link.clone(),
        }
    }
}

/// Owned copy of the fields enrichment needs; tasks never hold the record itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordSnapshot {
    pub task_id: usize,
    pub title: String,
    pub author: String,
    pub url: String,
    pub snippet: String,
    pub source_id: Option<String>,
    pub citation_link: Option<String>,
}

impl RecordSnapshot {
    /// First name in the display author list, without ellipsis.
    pub fn first_author(&self) -> &str {
        self.author
            .split(',')
            .next()
            .unwrap_or("")
            .trim()
            .trim_end_matches('…')
            .trim()
    }
}

/// Public shape of a record in the final payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub title: String,
    pub author: String,
    pub pub_year: Option<String>,
    pub pub_url: String,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    pub eprint_url: Option<String>,
    pub num_citations: Option<u32>,
    pub bib_link: Option<String>,
    pub bib_raw: Option<String>,
    pub bib: Option<String>,
    pub error: Vec<String>,
}

impl OutputRecord {
    /// Map a record to the payload shape.
    ///
    /// With `include_bib` the delivered `bib` carries the record's abstract
    /// (or has any embedded abstract removed), so it never disagrees with
    /// `abstract`. Without it only a link known at discovery time is kept.
    pub fn from_record(record: &PublicationRecord, include_bib: bool) -> Self {
        let (bib_link, bib_raw, bib) = if include_bib {
            let link = record.bib.as_ref().and_then(|b| b.link.clone());
            let raw = record.bib.as_ref().and_then(|b| b.raw.clone());
            let merged = raw.as_deref().and_then(|r| {
                match record.abstract_text.as_deref() {
                    Some(a) => bibtex::merge_abstract(r, a),
                    None => bibtex::strip_abstract(r),
                }
                .ok()
            });
            (link, raw, merged)
        } else {
            (record.known_citation_link.clone(), None, None)
        };

        Self {
            title: record.title.clone(),
            author: record.author.clone(),
            pub_year: record.pub_year.clone(),
            pub_url: record.url.clone(),
            abstract_text: record.abstract_text.clone(),
            eprint_url: record.eprint_url.clone(),
            num_citations: record.num_citations,
            bib_link,
            bib_raw,
            bib,
            error: record.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let spec = QuerySpec::builder("transformer networks")
            .build()
            .expect("valid spec");
        assert_eq!(spec.pages(), 1);
        assert!(!spec.ignore_bibtex());
        assert_eq!(spec.citation_threshold(), None);
    }

    #[test]
    fn test_builder_rejects_bad_years() {
        let err = QuerySpec::builder("x").year_low(Some(1850)).build();
        assert!(matches!(err, Err(PubfillError::Validation(_))));

        let err = QuerySpec::builder("x")
            .year_low(Some(2020))
            .year_high(Some(2010))
            .build();
        assert!(matches!(err, Err(PubfillError::Validation(_))));

        let ok = QuerySpec::builder("x")
            .year_low(Some(2010))
            .year_high(Some(2020))
            .build();
        assert!(ok.is_ok());
    }

    #[test]
    fn test_builder_rejects_zero_pages_and_empty_name() {
        assert!(QuerySpec::builder("x").pages(0).build().is_err());
        assert!(QuerySpec::builder("   ").build().is_err());
    }

    #[test]
    fn test_zero_min_cite_disables_filter() {
        let spec = QuerySpec::builder("x")
            .min_cite(Some(0))
            .build()
            .expect("valid spec");
        assert_eq!(spec.citation_threshold(), None);
    }

    #[test]
    fn test_first_author() {
        let snap = RecordSnapshot {
            author: "A Vaswani, N Shazeer, N Parmar…".into(),
            ..Default::default()
        };
        assert_eq!(snap.first_author(), "A Vaswani");

        let single = RecordSnapshot {
            author: "Y LeCun…".into(),
            ..Default::default()
        };
        assert_eq!(single.first_author(), "Y LeCun");
    }

    #[test]
    fn test_output_without_bib_keeps_known_link_only() {
        let raw = RawRecord {
            title: "T".into(),
            citation_link: Some("https://example.org/cite".into()),
            ..Default::default()
        };
        let mut record = PublicationRecord::from_raw(0, raw);
        record.bib = Some(Bib {
            link: Some("ignored".into()),
            raw: Some("@article{a, title={T}}".into()),
        });

        let out = OutputRecord::from_record(&record, false);
        assert_eq!(out.bib_link.as_deref(), Some("https://example.org/cite"));
        assert!(out.bib_raw.is_none());
        assert!(out.bib.is_none());
    }

    #[test]
    fn test_output_bib_never_contradicts_abstract() {
        let mut record = PublicationRecord::from_raw(0, RawRecord::default());
        record.bib = Some(Bib {
            link: Some("link".into()),
            raw: Some("@article{a,\n  title={T},\n  abstract={stale}\n}".into()),
        });

        let out = OutputRecord::from_record(&record, true);
        let bib = out.bib.expect("bib present");
        assert!(!bib.contains("stale"));
        assert!(!bibtex::has_abstract(&bib));

        record.abstract_text = Some("fresh".into());
        let out = OutputRecord::from_record(&record, true);
        let bib = out.bib.expect("bib present");
        assert_eq!(bibtex::abstract_of(&bib).as_deref(), Some("fresh"));
        assert!(!bib.contains("stale"));
    }
}
