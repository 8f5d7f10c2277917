//! Session intake: the first client message becomes a [`QuerySpec`].
//!
//! Numeric fields accept JSON numbers or numeric strings, since browser
//! clients often send form values verbatim.

use crate::error::{PubfillError, Result};
use crate::record::QuerySpec;
use serde::Deserialize;
use serde_json::Value;

/// Opening message of a query session. Every field is optional here;
/// presence and ranges are checked in [`parse`].
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct QueryRequest {
    api_key: Option<Loose>,
    pages: Option<Loose>,
    year_low: Option<Loose>,
    year_high: Option<Loose>,
    min_cite: Option<Loose>,
    ignore_bibtex: Option<Loose>,
}

/// A field value as the client sent it.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Loose {
    Int(i64),
    Bool(bool),
    Text(String),
    Other(Value),
}

impl Loose {
    fn integer(&self, key: &str) -> Result<i64> {
        match self {
            Loose::Int(n) => Ok(*n),
            Loose::Text(s) => s.trim().parse::<i64>().map_err(|_| {
                PubfillError::Validation(format!("{} must be an integer, got {:?}", key, s))
            }),
            other => Err(PubfillError::Validation(format!(
                "{} must be an integer, got {}",
                key,
                other.describe()
            ))),
        }
    }

    fn describe(&self) -> String {
        match self {
            Loose::Int(n) => n.to_string(),
            Loose::Bool(b) => b.to_string(),
            Loose::Text(s) => format!("{:?}", s),
            Loose::Other(v) => v.to_string(),
        }
    }
}

/// Control frame sent while a query is running.
#[derive(Debug, Deserialize)]
struct ControlMessage {
    #[serde(rename = "type")]
    kind: String,
}

/// Parse and validate the opening message for a query on `name`.
///
/// Authentication is checked before anything else, so an unauthenticated
/// client learns nothing about parameter validity.
pub fn parse(name: &str, first_message: &str, app_key: &str) -> Result<QuerySpec> {
    let value: Value = serde_json::from_str(first_message)
        .map_err(|e| PubfillError::Validation(format!("first message is not valid JSON: {}", e)))?;
    if !value.is_object() {
        return Err(PubfillError::Validation(
            "first message must be a JSON object".into(),
        ));
    }
    let request: QueryRequest = serde_json::from_value(value)
        .map_err(|e| PubfillError::Validation(format!("malformed first message: {}", e)))?;

    match &request.api_key {
        Some(Loose::Text(key)) if key == app_key => {}
        Some(_) => return Err(PubfillError::Auth("invalid api_key".into())),
        None => return Err(PubfillError::Auth("missing api_key".into())),
    }

    let pages = match int_field(&request.pages, "pages")? {
        Some(p) if p >= 1 => u32::try_from(p)
            .map_err(|_| PubfillError::Validation(format!("pages is too large: {}", p)))?,
        Some(_) => {
            return Err(PubfillError::Validation(
                "pages must be bigger than or equal to 1".into(),
            ))
        }
        None => 1,
    };

    let year_low = year_field(&request.year_low, "year_low")?;
    let year_high = year_field(&request.year_high, "year_high")?;

    let min_cite = match int_field(&request.min_cite, "min_cite")? {
        Some(m) => Some(u32::try_from(m).map_err(|_| {
            PubfillError::Validation(format!("min_cite must be a non-negative integer, got {}", m))
        })?),
        None => None,
    };

    let ignore_bibtex = match &request.ignore_bibtex {
        None => false,
        Some(Loose::Bool(b)) => *b,
        Some(other) => {
            return Err(PubfillError::Validation(format!(
                "ignore_bibtex must be a boolean, got {}",
                other.describe()
            )))
        }
    };

    QuerySpec::builder(name)
        .pages(pages)
        .year_low(year_low)
        .year_high(year_high)
        .min_cite(min_cite)
        .ignore_bibtex(ignore_bibtex)
        .build()
}

/// True for a client message asking to end the session.
pub fn is_quit(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("quit") || trimmed.eq_ignore_ascii_case("end") {
        return true;
    }
    serde_json::from_str::<ControlMessage>(trimmed)
        .is_ok_and(|m| m.kind.eq_ignore_ascii_case("quit") || m.kind.eq_ignore_ascii_case("end"))
}

fn int_field(field: &Option<Loose>, key: &str) -> Result<Option<i64>> {
    field.as_ref().map(|v| v.integer(key)).transpose()
}

fn year_field(field: &Option<Loose>, key: &str) -> Result<Option<i32>> {
    int_field(field, key)?
        .map(|y| {
            i32::try_from(y)
                .map_err(|_| PubfillError::Validation(format!("{} is out of range: {}", key, y)))
        })
        .transpose()
}
