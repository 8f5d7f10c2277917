//! BibTeX helpers: entry validation and the `abstract` field.
//!
//! Citation exports are parsed with `biblatex`. A body only counts as an
//! entry when it starts with `@type{key,` and parses to at least one entry,
//! so HTML that happens to contain `@page{...}` is rejected.

use biblatex::{Bibliography, Chunk, ChunksExt, Entry, Spanned};
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Why a citation body could not be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BibError {
    #[error("response is not a BibTeX entry")]
    NotAnEntry,

    #[error("BibTeX parse failed: {0}")]
    Parse(String),

    #[error("BibTeX serialization failed: {0}")]
    Serialize(String),
}

fn entry_start() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^@\w+\s*\{[^,\s]+,").ok())
        .as_ref()
}

/// First entry of `text`, which must begin with one.
pub fn parse_entry(text: &str) -> Result<Entry, BibError> {
    let trimmed = text.trim();
    if !entry_start().is_some_and(|re| re.is_match(trimmed)) {
        return Err(BibError::NotAnEntry);
    }

    let bibliography =
        Bibliography::parse(trimmed).map_err(|e| BibError::Parse(format!("{:?}", e)))?;
    bibliography.iter().next().cloned().ok_or(BibError::NotAnEntry)
}

/// True when `text` is a bibliographic entry.
pub fn is_bibtex(text: &str) -> bool {
    parse_entry(text).is_ok()
}

/// The entry's abstract, if it has one.
pub fn abstract_of(bib: &str) -> Option<String> {
    let entry = parse_entry(bib).ok()?;
    entry
        .fields
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("abstract"))
        .map(|(_, value)| value.format_verbatim())
}

pub fn has_abstract(bib: &str) -> bool {
    abstract_of(bib).is_some()
}

/// Set the entry's `abstract` to `abstract_text`, replacing any existing one.
pub fn merge_abstract(bib: &str, abstract_text: &str) -> Result<String, BibError> {
    let mut entry = parse_entry(bib)?;
    remove_abstract(&mut entry);
    entry.fields.insert(
        "abstract".to_string(),
        vec![Spanned::zero(Chunk::Normal(sanitize_value(abstract_text)))],
    );
    serialize(&entry)
}

/// Remove every `abstract` field from the entry.
pub fn strip_abstract(bib: &str) -> Result<String, BibError> {
    let mut entry = parse_entry(bib)?;
    remove_abstract(&mut entry);
    serialize(&entry)
}

fn remove_abstract(entry: &mut Entry) {
    entry
        .fields
        .retain(|key, _| !key.eq_ignore_ascii_case("abstract"));
}

fn serialize(entry: &Entry) -> Result<String, BibError> {
    entry
        .to_bibtex_string()
        .map_err(|e| BibError::Serialize(format!("{:?}", e)))
}

/// Abstracts are arbitrary text; keep braces balanced by dropping them.
fn sanitize_value(value: &str) -> String {
    value
        .chars()
        .filter(|c| *c != '{' && *c != '}')
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
