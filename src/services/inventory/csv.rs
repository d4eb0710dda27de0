//! Comma separated formats for stocktake sheets and bulk adjustments.
//!
//! Fields are split on bare commas. Quoting is not supported, so titles have
//! their commas stripped on the way out.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ledger::{BulkAdjustRow, SkippedRow};
use crate::entities::MovementReason;
use crate::errors::ServiceError;
use crate::services::money::{parse_number, truncate_to_i32};

pub const STOCKTAKE_HEADER: &str = "variantId,productId,title,systemOnHand,counted";

const STOCKTAKE_MIN_COLUMNS: usize = 5;

/// One row of a stocktake download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StocktakeSheetRow {
    pub variant_id: Uuid,
    pub product_id: Uuid,
    pub title: String,
    pub system_on_hand: i32,
}

/// One row of an uploaded stocktake sheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountedRow {
    pub line: usize,
    pub variant_id: Uuid,
    /// `None` when the cell is blank, negative or not a whole number
    pub counted: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedStocktake {
    pub rows: Vec<CountedRow>,
    pub skipped: Vec<SkippedRow>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedBulkAdjust {
    pub rows: Vec<BulkAdjustRow>,
    pub skipped: Vec<SkippedRow>,
}

fn split_cells(line: &str) -> Vec<&str> {
    line.split(',').map(str::trim).collect()
}

fn strip_bom(text: &str) -> &str {
    text.strip_prefix('\u{feff}').unwrap_or(text)
}

/// Non-blank lines with their 1-based line numbers.
fn numbered_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    strip_bom(text)
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim_end_matches('\r')))
        .filter(|(_, l)| !l.trim().is_empty())
}

/// Renders a stocktake sheet with an empty `counted` column.
pub fn render_stocktake(rows: &[StocktakeSheetRow]) -> String {
    let mut out = String::with_capacity(STOCKTAKE_HEADER.len() + rows.len() * 96);
    out.push_str(STOCKTAKE_HEADER);
    out.push('\n');
    for row in rows {
        let title = row.title.replace(',', " ");
        out.push_str(&format!(
            "{},{},{},{},\n",
            row.variant_id,
            row.product_id,
            title.trim(),
            row.system_on_hand
        ));
    }
    out
}

fn parse_count(cell: &str) -> Option<i32> {
    let value = parse_number(cell)?;
    if value.is_sign_negative() && !value.is_zero() {
        return None;
    }
    if !value.fract().is_zero() {
        return None;
    }
    Some(truncate_to_i32(value))
}

/// Parses an uploaded stocktake sheet.
///
/// The first header cell must be `variantId`. `counted` is read from the last
/// cell of each row, so a title that picked up extra commas does not shift it.
pub fn parse_stocktake(text: &str) -> Result<ParsedStocktake, ServiceError> {
    let mut lines = numbered_lines(text);
    let (_, header) = lines
        .next()
        .ok_or_else(|| ServiceError::ValidationError("Stocktake file is empty".to_string()))?;
    let header_cells = split_cells(header);
    if header_cells.first().copied() != Some("variantId") {
        return Err(ServiceError::ValidationError(
            "Stocktake header must start with variantId".to_string(),
        ));
    }

    let mut parsed = ParsedStocktake::default();
    for (line, raw) in lines {
        let cells = split_cells(raw);
        let variant_id = match cells.first().and_then(|c| Uuid::parse_str(c).ok()) {
            Some(id) => id,
            None => {
                parsed.skipped.push(SkippedRow {
                    line,
                    reason: "invalid variantId".to_string(),
                });
                continue;
            }
        };
        let counted = if cells.len() >= STOCKTAKE_MIN_COLUMNS {
            cells.last().and_then(|c| parse_count(c))
        } else {
            None
        };
        parsed.rows.push(CountedRow {
            line,
            variant_id,
            counted,
        });
    }
    Ok(parsed)
}

struct BulkColumns {
    product_id: usize,
    delta: usize,
    variant_id: Option<usize>,
    reason: Option<usize>,
    note: Option<usize>,
}

impl BulkColumns {
    fn from_header(header: &str) -> Result<Self, ServiceError> {
        let cells = split_cells(header);
        let find = |name: &str| cells.iter().position(|c| c.eq_ignore_ascii_case(name));
        let missing = |name: &str| {
            ServiceError::ValidationError(format!("Bulk adjustment header is missing {}", name))
        };

        Ok(Self {
            product_id: find("productId").ok_or_else(|| missing("productId"))?,
            delta: find("delta").ok_or_else(|| missing("delta"))?,
            variant_id: find("variantId"),
            reason: find("reason"),
            note: find("note"),
        })
    }
}

fn cell<'a>(cells: &[&'a str], index: Option<usize>) -> Option<&'a str> {
    index
        .and_then(|i| cells.get(i).copied())
        .filter(|c| !c.is_empty())
}

/// Parses a bulk adjustment upload.
///
/// Rows without a valid `productId`, or with a delta that is missing, not a
/// number or zero, are skipped and listed in the result.
pub fn parse_bulk_adjust(text: &str) -> Result<ParsedBulkAdjust, ServiceError> {
    let mut lines = numbered_lines(text);
    let (_, header) = lines.next().ok_or_else(|| {
        ServiceError::ValidationError("Bulk adjustment file is empty".to_string())
    })?;
    let columns = BulkColumns::from_header(header)?;

    let mut parsed = ParsedBulkAdjust::default();
    for (line, raw) in lines {
        let cells = split_cells(raw);
        let skip = |reason: &str| SkippedRow {
            line,
            reason: reason.to_string(),
        };

        let Some(product_id) =
            cell(&cells, Some(columns.product_id)).and_then(|c| Uuid::parse_str(c).ok())
        else {
            parsed.skipped.push(skip("invalid productId"));
            continue;
        };

        let delta = match cell(&cells, Some(columns.delta)).and_then(parse_number::<str>) {
            Some(d) if !d.is_zero() => d,
            Some(_) => {
                parsed.skipped.push(skip("delta is zero"));
                continue;
            }
            None => {
                parsed.skipped.push(skip("invalid delta"));
                continue;
            }
        };
        let delta = truncate_to_i32(delta.round_dp(0));
        if delta == 0 {
            parsed.skipped.push(skip("delta is zero"));
            continue;
        }

        let variant_id = match cell(&cells, columns.variant_id) {
            Some(raw_id) => match Uuid::parse_str(raw_id) {
                Ok(id) => Some(id),
                Err(_) => {
                    parsed.skipped.push(skip("invalid variantId"));
                    continue;
                }
            },
            None => None,
        };
        let reason = cell(&cells, columns.reason)
            .and_then(|r| MovementReason::from_str(r).ok())
            .unwrap_or(MovementReason::ManualImport);
        let note = cell(&cells, columns.note).map(str::to_string);

        parsed.rows.push(BulkAdjustRow {
            line,
            product_id,
            variant_id,
            delta,
            reason,
            note,
        });
    }
    Ok(parsed)
}

/// Sum of deltas, for previews.
pub fn net_delta(rows: &[BulkAdjustRow]) -> Decimal {
    rows.iter().map(|r| Decimal::from(r.delta)).sum()
}
