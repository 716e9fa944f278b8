//! Core domain model for Yardscout.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "yardscout-core";

/// Canonical persisted inventory record. One row of one yard, one arrival.
///
/// Constructed only by the normalizer; never mutated after insertion except
/// for `completed`, which has its own lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryRecord {
    pub year: u16,
    pub make: String,
    pub model: String,
    pub row: String,
    pub arrival_date: NaiveDate,
    pub yard: String,
    #[serde(default)]
    pub completed: bool,
}

impl InventoryRecord {
    /// The dedup key: two records are the same inventory item iff this tuple
    /// matches. `completed` is deliberately excluded.
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey {
            year: self.year,
            make: self.make.to_lowercase(),
            model: self.model.to_lowercase(),
            row: self.row.clone(),
            yard: self.yard.clone(),
            arrival_date: self.arrival_date,
        }
    }
}

/// Identity tuple of an inventory record with make/model folded to lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    pub year: u16,
    pub make: String,
    pub model: String,
    pub row: String,
    pub yard: String,
    pub arrival_date: NaiveDate,
}

/// Raw handoff contract from adapters into the pipeline. Every field is the
/// source-native string; nothing here is validated yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCandidate {
    pub year: String,
    pub make: String,
    pub model: String,
    pub row: String,
    pub date: String,
    pub yard: String,
}

/// Date dialect of a source feed. Source-native strings never leak past the
/// normalizer; persisted dates are ISO calendar dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceDateFormat {
    /// `MM/DD/YY`
    MonthDayYear2,
    /// `Mon DD, YYYY`
    MonthNameDayYear,
    /// Integer days-at-the-yard, resolved as `today - age`.
    AgeDays,
}

/// User-declared interest in a make/model, optionally bounded by year.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchListEntry {
    pub id: i64,
    pub make: String,
    pub model: String,
    pub min_year: Option<u16>,
    pub max_year: Option<u16>,
    pub part: Option<String>,
}

/// Fields of a watch-list entry as supplied by the user, before storage
/// assigns an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchListDraft {
    pub make: String,
    pub model: String,
    pub min_year: Option<u16>,
    pub max_year: Option<u16>,
    pub part: Option<String>,
}

/// Lookup key for completion updates. Unlike [`IdentityKey`] it carries no
/// arrival date, so it may address several records of the same vehicle tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionKey {
    pub yard: String,
    pub row: String,
    pub make: String,
    pub model: String,
    pub year: u16,
}

impl CompletionKey {
    /// Case-insensitive match on yard/make/model, exact on row/year.
    pub fn matches(&self, record: &InventoryRecord) -> bool {
        self.year == record.year
            && self.row == record.row
            && self.yard.eq_ignore_ascii_case(&record.yard)
            && self.make.eq_ignore_ascii_case(&record.make)
            && self.model.eq_ignore_ascii_case(&record.model)
    }
}

/// Recency narrowing for watch-list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateFilter {
    All,
    LastDays(u32),
}

impl DateFilter {
    /// Parses the query-string form: `"all"` or a positive day count.
    /// Anything else falls back to `All` rather than erroring.
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "" | "all" => DateFilter::All,
            n => match n.parse::<u32>() {
                Ok(days) if days > 0 => DateFilter::LastDays(days),
                _ => DateFilter::All,
            },
        }
    }

    pub fn cutoff(&self, today: NaiveDate) -> Option<NaiveDate> {
        match self {
            DateFilter::All => None,
            DateFilter::LastDays(days) => Some(today - chrono::Duration::days(i64::from(*days))),
        }
    }
}

/// One vehicle entry inside a row group, deduplicated by (make, model, year).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowVehicle {
    pub make: String,
    pub model: String,
    pub year: u16,
    pub completed: bool,
}

/// All matched vehicles parked in one row of a yard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowGroup {
    pub row: String,
    pub vehicles: Vec<RowVehicle>,
}

/// Per-yard view: matched rows plus a count of unique matched vehicles.
/// Derived at query time, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YardSummary {
    pub hot_wheels_count: usize,
    pub rows: Vec<RowGroup>,
}

/// Context shared by one refresh run.
#[derive(Debug, Clone, Copy)]
pub struct RunContext {
    pub run_id: Uuid,
    pub today: NaiveDate,
}

/// Trims and collapses internal whitespace (including literal newlines the
/// sources embed in scraped text) to single spaces.
pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Coerces a raw year field to a 4-digit value. Anything that is not exactly
/// four ASCII digits is a discard signal, not an error.
pub fn parse_year(raw: &str) -> Option<u16> {
    let trimmed = raw.trim();
    if trimmed.len() != 4 || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    trimmed.parse().ok()
}
