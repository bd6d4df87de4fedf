//! Raw spreadsheet input: a 2-D grid of cell values as handed over by the sheet reader.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum CellValue {
    Number(f64),
    Text(String),
    #[default]
    Empty,
}

static EMPTY: CellValue = CellValue::Empty;

impl CellValue {
    /// Builds a cell from reader text, keeping plain numbers numeric.
    pub fn infer(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return CellValue::Empty;
        }
        match trimmed.parse::<f64>() {
            Ok(n) if n.is_finite() => CellValue::Number(n),
            _ => CellValue::Text(trimmed.to_string()),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(s) => s.trim().is_empty(),
            CellValue::Number(n) => n.is_nan(),
        }
    }

    /// Trimmed text content; blanks and lone dashes count as no content.
    pub fn as_text(&self) -> Option<String> {
        match self {
            CellValue::Empty => None,
            CellValue::Number(n) if n.is_nan() => None,
            CellValue::Number(n) => Some(format_plain_number(*n)),
            CellValue::Text(s) => {
                let s = s.trim();
                if s.is_empty() || is_dash(s) {
                    None
                } else {
                    Some(s.to_string())
                }
            }
        }
    }

    /// Numeric coercion used for statement values.
    ///
    /// Accepts thousands separators, currency symbols and accounting negatives
    /// (`(1,200)`). Anything else, percentages included, is `None` (missing), never zero.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) if n.is_finite() => Some(*n),
            CellValue::Number(_) | CellValue::Empty => None,
            CellValue::Text(s) => parse_numeric_text(s),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Empty => Ok(()),
            CellValue::Number(n) => write!(f, "{}", format_plain_number(*n)),
            CellValue::Text(s) => write!(f, "{}", s.trim()),
        }
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        if value.trim().is_empty() {
            CellValue::Empty
        } else {
            CellValue::Text(value.to_string())
        }
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        CellValue::from(value.as_str())
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Number(value)
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        CellValue::Number(value as f64)
    }
}

impl From<i32> for CellValue {
    fn from(value: i32) -> Self {
        CellValue::Number(value as f64)
    }
}

impl<T: Into<CellValue>> From<Option<T>> for CellValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(CellValue::Empty)
    }
}

fn is_dash(s: &str) -> bool {
    matches!(s, "-" | "--" | "—" | "–")
}

fn format_plain_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

fn parse_numeric_text(raw: &str) -> Option<f64> {
    let mut text = raw.trim();
    if text.is_empty() || is_dash(text) || text.ends_with('%') {
        return None;
    }

    let mut negative = false;
    if text.starts_with('(') && text.ends_with(')') && text.len() > 2 {
        negative = true;
        text = &text[1..text.len() - 1];
    }

    let cleaned: String = text
        .chars()
        .filter(|c| !matches!(c, ',' | '$' | '€' | '£' | '¥' | ' ' | '\u{a0}'))
        .collect();

    let value = cleaned.parse::<f64>().ok().filter(|v| v.is_finite())?;
    Some(if negative { -value } else { value })
}

/// Lowercases and collapses whitespace.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawGrid {
    rows: Vec<Vec<CellValue>>,
}

impl RawGrid {
    pub fn new(rows: Vec<Vec<CellValue>>) -> Self {
        Self { rows }
    }

    /// Builds a grid from textual records (e.g. CSV rows), inferring numeric cells.
    pub fn from_records<I, R, S>(records: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let rows = records
            .into_iter()
            .map(|record| {
                record
                    .into_iter()
                    .map(|cell| CellValue::infer(cell.as_ref()))
                    .collect()
            })
            .collect();
        Self { rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.rows.iter().map(Vec::len).max().unwrap_or(0)
    }

    pub fn rows(&self) -> &[Vec<CellValue>] {
        &self.rows
    }

    /// Out-of-range addresses read as empty cells.
    pub fn cell(&self, row: usize, column: usize) -> &CellValue {
        self.rows
            .get(row)
            .and_then(|r| r.get(column))
            .unwrap_or(&EMPTY)
    }

    /// First row with a cell whose normalized text equals `marker`.
    /// Column 0 is checked across all rows before the wider scan.
    pub fn find_marker_row(&self, marker: &str) -> Option<usize> {
        let marker = normalize_whitespace(marker);
        if marker.is_empty() {
            return None;
        }
        let matches = |cell: &CellValue| {
            cell.as_text()
                .map(|t| normalize_whitespace(&t) == marker)
                .unwrap_or(false)
        };

        (0..self.row_count())
            .find(|&r| matches(self.cell(r, 0)))
            .or_else(|| {
                (0..self.row_count())
                    .find(|&r| (0..self.column_count().min(12)).any(|c| matches(self.cell(r, c))))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sheet {
    pub name: String,
    pub grid: RawGrid,
}

/// All sheets of one uploaded workbook, in workbook order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Workbook {
    pub sheets: Vec<Sheet>,
}

impl Workbook {
    pub fn new(sheets: Vec<Sheet>) -> Self {
        Self { sheets }
    }

    pub fn sheet_names(&self) -> Vec<&str> {
        self.sheets.iter().map(|s| s.name.as_str()).collect()
    }

    /// First sheet whose name contains one of `keywords` (case-insensitive),
    /// falling back to the first sheet.
    pub fn select_income_sheet(&self, keywords: &[String]) -> Option<&Sheet> {
        self.sheets
            .iter()
            .find(|sheet| {
                let name = sheet.name.to_lowercase();
                keywords
                    .iter()
                    .any(|k| !k.trim().is_empty() && name.contains(&k.trim().to_lowercase()))
            })
            .or_else(|| self.sheets.first())
    }
}
