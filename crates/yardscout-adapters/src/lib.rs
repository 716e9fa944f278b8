//! Source adapter contract + the three salvage-yard listing parsers.
//!
//! Adapters turn one source's listing HTML into [`RawCandidate`]s. They do no
//! validation beyond structural extraction: dates and years stay in
//! source-native string form and are checked by the pipeline's normalizer.

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use yardscout_core::{collapse_whitespace, RawCandidate, RunContext, SourceDateFormat};
use yardscout_storage::{FetchError, HttpFetcher};

pub const CRATE_NAME: &str = "yardscout-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    /// The source could not be reached; degrade to the remaining sources.
    #[error("source unavailable: {0}")]
    Unavailable(#[from] FetchError),
    /// The listing body was structurally unparsable.
    #[error("unparsable listing: {0}")]
    Parse(String),
}

/// Parse output of one listing: the candidates plus how many listing items
/// carried partial data and were skipped. Per-item problems never abort the
/// listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Harvest {
    pub candidates: Vec<RawCandidate>,
    pub skipped: usize,
}

/// One salvage-yard source. Fetching goes through the shared [`HttpFetcher`]
/// with its bounded timeout; parsing is pure and order-independent — the
/// reconciler never relies on listing order.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn yard_id(&self) -> &'static str;

    fn date_format(&self) -> SourceDateFormat;

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        ctx: &RunContext,
        url: &str,
    ) -> Result<String, AdapterError> {
        Ok(http.fetch_text(ctx.run_id, self.yard_id(), url).await?)
    }

    fn parse_listing(&self, html: &str) -> Result<Harvest, AdapterError>;
}

fn sel(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Parse(e.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = collapse_whitespace(&value);
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn first_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope
        .select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn all_texts(scope: ElementRef<'_>, selector: &Selector) -> Vec<Option<String>> {
    scope
        .select(selector)
        .map(|n| text_or_none(n.text().collect::<String>()))
        .collect()
}

/// Splits a `"YYYY Make Model..."` vehicle name into its three parts. The
/// first token must look like a year and the model may span several tokens.
fn split_vehicle_name(name: &str) -> Option<(String, String, String)> {
    let mut tokens = name.split_whitespace();
    let year = tokens.next()?;
    if year.len() != 4 || !year.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let make = tokens.next()?;
    let model = tokens.collect::<Vec<_>>().join(" ");
    if model.is_empty() {
        return None;
    }
    Some((year.to_string(), make.to_string(), model))
}

/// Row52 search results (yard `PNP`). Listing items are `div.row` blocks with
/// the vehicle name in one anchor and row/date in a right-hand column; dates
/// arrive as `Mon DD, YYYY`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Row52Adapter;

#[async_trait]
impl SourceAdapter for Row52Adapter {
    fn yard_id(&self) -> &'static str {
        "PNP"
    }

    fn date_format(&self) -> SourceDateFormat {
        SourceDateFormat::MonthNameDayYear
    }

    fn parse_listing(&self, html: &str) -> Result<Harvest, AdapterError> {
        let document = Html::parse_document(html);
        let rows = sel("div.row")?;
        let name_sel = sel(r#"a[itemprop="description"] strong"#)?;
        let right_sel = sel("div.list-row-right strong")?;

        let mut harvest = Harvest::default();
        for item in document.select(&rows) {
            let name = first_text(item, &name_sel);
            let right = all_texts(item, &right_sel);
            let row_label = right.first().cloned().flatten();
            let date = right.get(1).cloned().flatten();

            // Bare layout rows carry none of the fields; only partially
            // populated items count as skips.
            if name.is_none() && row_label.is_none() && date.is_none() {
                continue;
            }

            let parsed = name.as_deref().and_then(split_vehicle_name);
            match (parsed, row_label, date) {
                (Some((year, make, model)), Some(row), Some(date)) => {
                    harvest.candidates.push(RawCandidate {
                        year,
                        make,
                        model,
                        row,
                        date,
                        yard: self.yard_id().to_string(),
                    });
                }
                _ => harvest.skipped += 1,
            }
        }
        Ok(harvest)
    }
}

/// UtPap arrivals table (yard `OG PAP`). Plain `<table>` rows with year,
/// make, model in the leading cells, row in cell 7, `MM/DD/YY` date in cell 8.
#[derive(Debug, Clone, Copy, Default)]
pub struct UtPapAdapter;

#[async_trait]
impl SourceAdapter for UtPapAdapter {
    fn yard_id(&self) -> &'static str {
        "OG PAP"
    }

    fn date_format(&self) -> SourceDateFormat {
        SourceDateFormat::MonthDayYear2
    }

    fn parse_listing(&self, html: &str) -> Result<Harvest, AdapterError> {
        let document = Html::parse_document(html);
        let rows = sel("tr.odd, tr.even")?;
        let cell_sel = sel("td")?;

        let mut harvest = Harvest::default();
        for item in document.select(&rows) {
            let cells = all_texts(item, &cell_sel);
            let field = |idx: usize| cells.get(idx).cloned().flatten();
            match (field(0), field(1), field(2), field(6), field(7)) {
                (Some(year), Some(make), Some(model), Some(row), Some(date)) => {
                    harvest.candidates.push(RawCandidate {
                        year,
                        make,
                        model,
                        row,
                        date,
                        yard: self.yard_id().to_string(),
                    });
                }
                _ => harvest.skipped += 1,
            }
        }
        Ok(harvest)
    }
}

/// JunkYard car cards (yard `TAP`). Each `div.carWrapper` holds a stack of
/// `<p>` fields; the date arrives as an integer age-in-days and the yard name
/// is printed on the card itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct JunkYardAdapter;

#[async_trait]
impl SourceAdapter for JunkYardAdapter {
    fn yard_id(&self) -> &'static str {
        "TAP"
    }

    fn date_format(&self) -> SourceDateFormat {
        SourceDateFormat::AgeDays
    }

    fn parse_listing(&self, html: &str) -> Result<Harvest, AdapterError> {
        let document = Html::parse_document(html);
        let cards = sel("div.carWrapper")?;
        let field_sel = sel("p")?;

        let mut harvest = Harvest::default();
        for card in document.select(&cards) {
            let fields = all_texts(card, &field_sel);
            let field = |idx: usize| fields.get(idx).cloned().flatten();
            match (field(0), field(1), field(2), field(4), field(6)) {
                (Some(year), Some(make), Some(model), Some(row), Some(age)) => {
                    harvest.candidates.push(RawCandidate {
                        year,
                        make,
                        model,
                        row,
                        date: age,
                        yard: field(5).unwrap_or_else(|| self.yard_id().to_string()),
                    });
                }
                _ => harvest.skipped += 1,
            }
        }
        Ok(harvest)
    }
}

/// Registry lookup used by the pipeline's yard registry.
pub fn adapter_for_yard(yard_id: &str) -> Option<Box<dyn SourceAdapter>> {
    match yard_id {
        "pnp" => Some(Box::new(Row52Adapter)),
        "ogpap" => Some(Box::new(UtPapAdapter)),
        "tap" => Some(Box::new(JunkYardAdapter)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vehicle_name_splits_year_make_and_multiword_model() {
        assert_eq!(
            split_vehicle_name("2012 Honda Civic"),
            Some(("2012".into(), "Honda".into(), "Civic".into()))
        );
        assert_eq!(
            split_vehicle_name("1999 Land Rover Discovery"),
            Some(("1999".into(), "Land".into(), "Rover Discovery".into()))
        );
    }

    #[test]
    fn vehicle_name_without_leading_year_is_rejected() {
        assert_eq!(split_vehicle_name("Honda Civic"), None);
        assert_eq!(split_vehicle_name("12 Honda Civic"), None);
        assert_eq!(split_vehicle_name("2012 Honda"), None);
        assert_eq!(split_vehicle_name(""), None);
    }

    #[test]
    fn registry_knows_all_three_yards() {
        assert_eq!(adapter_for_yard("pnp").unwrap().yard_id(), "PNP");
        assert_eq!(adapter_for_yard("ogpap").unwrap().yard_id(), "OG PAP");
        assert_eq!(adapter_for_yard("tap").unwrap().yard_id(), "TAP");
        assert!(adapter_for_yard("elsewhere").is_none());
    }
}
