use scraper::{ElementRef, Html, Selector};
use tracing::{debug, error};

use crate::error::ExtractError;
use crate::fetcher::{HtmlDocument, PageId};

/// A label/value pair lifted off a page, with any unit suffix split off the value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawField {
    pub label: String,
    pub value: String,
    pub unit: Option<String>,
}

/// Where a page keeps its label/value rows.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionRule {
    pub container: &'static str,
    pub row: &'static str,
    pub label: &'static str,
    pub value: &'static str,
    /// Whether rows lacking a label or value cell are layout rows to skip. When
    /// false every row is a reading, so an incomplete one is a mismatch.
    pub skip_incomplete: bool,
}

pub const TOTALS_RULE: ExtractionRule = ExtractionRule {
    container: "#total_energy",
    row: "tr",
    label: "th",
    value: "td",
    skip_incomplete: true,
};

pub const CIRCUITS_RULE: ExtractionRule = ExtractionRule {
    container: "#circuit_list",
    row: ".circuit",
    label: ".c_device",
    value: ".c_value",
    skip_incomplete: false,
};

impl ExtractionRule {
    pub fn for_page(page: PageId) -> Option<Self> {
        match page {
            PageId::Totals => Some(TOTALS_RULE),
            PageId::Circuits(_) => Some(CIRCUITS_RULE),
            PageId::Climate | PageId::Home => None,
        }
    }
}

/// Pulls the raw fields out of a fetched page, in document order.
pub fn extract(document: &HtmlDocument) -> Result<Vec<RawField>, ExtractError> {
    let rule = ExtractionRule::for_page(document.page).ok_or_else(|| {
        ExtractError::StructureMismatch {
            page: document.page,
            detail: "page has no row layout".to_string(),
        }
    })?;
    let fields = extract_with(&document.body, document.page, &rule).inspect_err(|err| {
        error!("{err}; the AiSEG2 firmware may have changed its UI");
    })?;
    debug!("Extracted {} fields from {}", fields.len(), document.page);
    Ok(fields)
}

pub fn extract_with(
    html: &str,
    page: PageId,
    rule: &ExtractionRule,
) -> Result<Vec<RawField>, ExtractError> {
    let container_sel = selector(rule.container, page)?;
    let row_sel = selector(rule.row, page)?;
    let label_sel = selector(rule.label, page)?;
    let value_sel = selector(rule.value, page)?;

    let document = Html::parse_document(html);
    let container = document
        .select(&container_sel)
        .next()
        .ok_or_else(|| ExtractError::StructureMismatch {
            page,
            detail: format!("container `{}` not found", rule.container),
        })?;

    let mut fields = Vec::new();
    for (index, row) in container.select(&row_sel).enumerate() {
        let label = row.select(&label_sel).next().map(element_text);
        let value = row.select(&value_sel).next().map(element_text);
        match (label, value) {
            (Some(label), Some(value)) if !label.is_empty() => {
                let (value, unit) = split_unit(&value);
                fields.push(RawField { label, value, unit });
            }
            _ if rule.skip_incomplete => debug!("Skipping incomplete row on {}", page),
            _ => {
                return Err(ExtractError::StructureMismatch {
                    page,
                    detail: format!("row {} lacks `{}` or `{}`", index + 1, rule.label, rule.value),
                })
            }
        }
    }
    Ok(fields)
}

fn selector(css: &str, page: PageId) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::StructureMismatch {
        page,
        detail: format!("bad selector `{css}`: {e:?}"),
    })
}

/// All text under `element`, with whitespace runs collapsed.
fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_number_char(c: char) -> bool {
    c.is_ascii_digit()
        || ('０'..='９').contains(&c)
        || matches!(c, '.' | ',' | '．' | '，' | '-' | '－' | '−' | '+' | '＋')
}

/// Splits `12.3 kWh` into `("12.3", Some("kWh"))`. Text without any digit is returned
/// whole so the normalizer can reject it.
pub fn split_unit(text: &str) -> (String, Option<String>) {
    let text = text.trim();
    let has_digit = text
        .chars()
        .any(|c| c.is_ascii_digit() || ('０'..='９').contains(&c));
    if !has_digit {
        return (text.to_string(), None);
    }
    let split_at = text
        .char_indices()
        .find(|(_, c)| !(is_number_char(*c) || c.is_whitespace()))
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());
    let value = text[..split_at].trim();
    let unit = text[split_at..].trim();
    (
        value.split_whitespace().collect::<String>(),
        (!unit.is_empty()).then(|| unit.to_string()),
    )
}
