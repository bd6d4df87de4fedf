//! Period header detection.
//!
//! Finds the header row of a statement grid, parses each header cell into a fiscal
//! year or fiscal quarter and orders the resulting columns most recent first.

use crate::config::PeriodSettings;
use crate::error::{ForgeError, Result};
use crate::grid::RawGrid;
use crate::utils::{
    expand_two_digit_year, fiscal_quarter_end, fiscal_quarter_for_date,
    get_fiscal_year_end_for_date, last_day_of_month,
};
use chrono::{Datelike, NaiveDate};
use log::{debug, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PeriodKind {
    FiscalYear { year: i32 },
    Quarter { year: i32, quarter: u32 },
}

impl PeriodKind {
    /// Normalized identifier, e.g. `FY2023` or `Q2-2024`.
    pub fn id(&self) -> String {
        match self {
            PeriodKind::FiscalYear { year } => format!("FY{}", year),
            PeriodKind::Quarter { year, quarter } => format!("Q{}-{}", quarter, year),
        }
    }

    pub fn span_months(&self) -> u32 {
        match self {
            PeriodKind::FiscalYear { .. } => 12,
            PeriodKind::Quarter { .. } => 3,
        }
    }

    /// Same kind of period one fiscal year earlier.
    pub fn prior_year(&self) -> PeriodKind {
        match *self {
            PeriodKind::FiscalYear { year } => PeriodKind::FiscalYear { year: year - 1 },
            PeriodKind::Quarter { year, quarter } => PeriodKind::Quarter {
                year: year - 1,
                quarter,
            },
        }
    }

    pub fn end_date(&self, fiscal_year_end_month: u32) -> Option<NaiveDate> {
        match *self {
            PeriodKind::FiscalYear { year } => last_day_of_month(year, fiscal_year_end_month),
            PeriodKind::Quarter { year, quarter } => {
                fiscal_quarter_end(year, quarter, fiscal_year_end_month)
            }
        }
    }
}

impl fmt::Display for PeriodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeriodColumn {
    pub column_index: usize,
    pub raw_label: String,
    pub id: String,
    pub kind: PeriodKind,
    pub end_date: NaiveDate,
}

impl PeriodColumn {
    /// Chronological key: period end, then span so a fiscal year sorts after the
    /// quarter that closes it.
    pub fn sort_key(&self) -> (NaiveDate, u32) {
        (self.end_date, self.kind.span_months())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkippedColumn {
    pub column_index: usize,
    pub raw_label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DuplicatePeriod {
    pub period_id: String,
    pub column_index: usize,
    pub kept_column_index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeriodDetection {
    pub header_row: usize,
    pub label_column: usize,
    /// Most recent first, identifiers unique.
    pub periods: Vec<PeriodColumn>,
    pub skipped_columns: Vec<SkippedColumn>,
    pub duplicates: Vec<DuplicatePeriod>,
}

impl PeriodDetection {
    pub fn period(&self, id: &str) -> Option<&PeriodColumn> {
        self.periods.iter().find(|p| p.id == id)
    }

    pub fn period_ids(&self) -> Vec<String> {
        self.periods.iter().map(|p| p.id.clone()).collect()
    }

    pub fn first_data_row(&self) -> usize {
        self.header_row + 1
    }
}

/// Header cell contents before dates are bucketed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedHeader {
    Year(i32),
    Quarter { year: i32, quarter: u32 },
    Date {
        date: NaiveDate,
        /// Length hint such as "12 months" / "3 months" carried by the same label.
        months: Option<u32>,
    },
}

struct Patterns {
    quarter_leading: Regex,
    quarter_trailing: Regex,
    quarter_compact: Regex,
    fiscal_year: Regex,
    bare_year: Regex,
    iso_date: Regex,
    us_date: Regex,
    month_first: Regex,
    day_first: Regex,
    months_hint: Regex,
}

const MONTH_NAMES: &str = "jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec";

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let compile = |pattern: &str| Regex::new(pattern).expect("invalid period regex");
        Patterns {
            quarter_leading: compile(r"(?i)\bQ([1-4])[\s\-/']*(?:FY)?[\s']*(\d{4}|\d{2})\b"),
            quarter_trailing: compile(r"(?i)\b(?:FY)?(\d{4})[\s\-/]*Q([1-4])\b"),
            quarter_compact: compile(r"(?i)\b([1-4])Q[\s\-']*(\d{4}|\d{2})\b"),
            fiscal_year: compile(r"(?i)\bFY[\s\-']*(\d{4}|\d{2})\b"),
            bare_year: compile(r"^(\d{4})(?:\.0+)?[AE]?$"),
            iso_date: compile(r"\b(\d{4})-(\d{1,2})-(\d{1,2})\b"),
            us_date: compile(r"\b(\d{1,2})/(\d{1,2})/(\d{4})\b"),
            month_first: compile(&format!(
                r"(?i)\b({})[a-z]*\.?[\s\-]+(\d{{1,2}}),?[\s\-]+(\d{{4}})\b",
                MONTH_NAMES
            )),
            day_first: compile(&format!(
                r"(?i)\b(\d{{1,2}})[\s\-]+({})[a-z]*\.?,?[\s\-]+(\d{{4}})\b",
                MONTH_NAMES
            )),
            months_hint: compile(r"(?i)\b(\d{1,2})\s*months?\b"),
        }
    })
}

fn parse_year(text: &str) -> Option<i32> {
    let value: i32 = text.parse().ok()?;
    let year = if text.len() == 2 {
        expand_two_digit_year(value)
    } else {
        value
    };
    (1900..=2200).contains(&year).then_some(year)
}

fn month_from_name(name: &str) -> Option<u32> {
    let prefix: String = name.chars().take(3).collect::<String>().to_lowercase();
    MONTH_NAMES
        .split('|')
        .position(|m| m == prefix)
        .map(|idx| idx as u32 + 1)
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    let p = patterns();

    if let Some(c) = p.iso_date.captures(text) {
        return NaiveDate::from_ymd_opt(c[1].parse().ok()?, c[2].parse().ok()?, c[3].parse().ok()?);
    }
    if let Some(c) = p.us_date.captures(text) {
        return NaiveDate::from_ymd_opt(c[3].parse().ok()?, c[1].parse().ok()?, c[2].parse().ok()?);
    }
    if let Some(c) = p.month_first.captures(text) {
        return NaiveDate::from_ymd_opt(
            c[3].parse().ok()?,
            month_from_name(&c[1])?,
            c[2].parse().ok()?,
        );
    }
    if let Some(c) = p.day_first.captures(text) {
        return NaiveDate::from_ymd_opt(
            c[3].parse().ok()?,
            month_from_name(&c[2])?,
            c[1].parse().ok()?,
        );
    }
    None
}

/// Parses one header cell. Returns `None` for anything that is not period-like.
pub fn parse_period_label(raw: &str) -> Option<ParsedHeader> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }
    let p = patterns();

    if let Some(c) = p.quarter_leading.captures(text) {
        return Some(ParsedHeader::Quarter {
            quarter: c[1].parse().ok()?,
            year: parse_year(&c[2])?,
        });
    }
    if let Some(c) = p.quarter_trailing.captures(text) {
        return Some(ParsedHeader::Quarter {
            year: parse_year(&c[1])?,
            quarter: c[2].parse().ok()?,
        });
    }
    if let Some(c) = p.quarter_compact.captures(text) {
        return Some(ParsedHeader::Quarter {
            quarter: c[1].parse().ok()?,
            year: parse_year(&c[2])?,
        });
    }
    if let Some(date) = parse_date(text) {
        let months = p
            .months_hint
            .captures(text)
            .and_then(|c| c[1].parse::<u32>().ok());
        return Some(ParsedHeader::Date { date, months });
    }
    if let Some(c) = p.fiscal_year.captures(text) {
        return Some(ParsedHeader::Year(parse_year(&c[1])?));
    }
    if let Some(c) = p.bare_year.captures(text) {
        return Some(ParsedHeader::Year(parse_year(&c[1])?));
    }
    None
}

pub struct PeriodDetector {
    settings: PeriodSettings,
}

impl PeriodDetector {
    pub fn new(settings: PeriodSettings) -> Self {
        Self { settings }
    }

    /// Detects the period columns of `grid`, searching for the header at or below
    /// `start_row` (the row after a statement marker, or 0).
    pub fn detect(&self, grid: &RawGrid, start_row: usize) -> Result<PeriodDetection> {
        let end_row = grid
            .row_count()
            .min(start_row.saturating_add(self.settings.header_scan_rows));

        let parsed_rows: Vec<(usize, Vec<(usize, String, ParsedHeader)>)> = (start_row..end_row)
            .map(|row| (row, self.parse_row(grid, row)))
            .collect();

        let header = parsed_rows
            .iter()
            .find(|(_, cells)| cells.len() >= self.settings.min_header_periods)
            .or_else(|| parsed_rows.iter().find(|(_, cells)| !cells.is_empty()));

        let Some((header_row, parsed)) = header else {
            warn!(
                "No period labels found in rows {}..{} of the grid",
                start_row, end_row
            );
            return Err(ForgeError::NoPeriodsDetected);
        };
        let header_row = *header_row;

        let period_columns: Vec<usize> = parsed.iter().map(|(col, _, _)| *col).collect();
        let label_column = (0..)
            .find(|c| !period_columns.contains(c))
            .unwrap_or(0);

        let mut skipped_columns = Vec::new();
        for column in 0..grid.column_count() {
            if column == label_column || period_columns.contains(&column) {
                continue;
            }
            if let Some(text) = grid.cell(header_row, column).as_text() {
                debug!("Skipping non-period header column {} '{}'", column, text);
                skipped_columns.push(SkippedColumn {
                    column_index: column,
                    raw_label: text,
                });
            }
        }

        let kinds = self.bucket(parsed);
        let (periods, duplicates) = self.order_and_dedupe(parsed, &kinds);

        if periods.is_empty() {
            return Err(ForgeError::NoPeriodsDetected);
        }

        info!(
            "Detected {} periods in header row {} (most recent {})",
            periods.len(),
            header_row,
            periods[0].id
        );

        Ok(PeriodDetection {
            header_row,
            label_column,
            periods,
            skipped_columns,
            duplicates,
        })
    }

    fn parse_row(&self, grid: &RawGrid, row: usize) -> Vec<(usize, String, ParsedHeader)> {
        grid.rows()
            .get(row)
            .map(|cells| {
                cells
                    .iter()
                    .enumerate()
                    .filter_map(|(col, cell)| {
                        let text = cell.as_text()?;
                        parse_period_label(&text).map(|parsed| (col, text, parsed))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Resolves every parsed header to a period kind. Dates become fiscal years when
    /// the other headers are mostly yearly (or, with dates only, when they sit about a
    /// year apart); otherwise fiscal quarters.
    fn bucket(&self, parsed: &[(usize, String, ParsedHeader)]) -> Vec<Option<PeriodKind>> {
        let fiscal_month = self.settings.fiscal_year_end_month;

        let yearly = parsed
            .iter()
            .filter(|(_, _, p)| matches!(p, ParsedHeader::Year(_)))
            .count();
        let quarterly = parsed
            .iter()
            .filter(|(_, _, p)| matches!(p, ParsedHeader::Quarter { .. }))
            .count();

        let dates_are_yearly = if yearly + quarterly > 0 {
            yearly > quarterly
        } else {
            let mut dates: Vec<NaiveDate> = parsed
                .iter()
                .filter_map(|(_, _, p)| match p {
                    ParsedHeader::Date { date, .. } => Some(*date),
                    _ => None,
                })
                .collect();
            dates.sort();
            dates.dedup();
            dates
                .windows(2)
                .all(|w| (w[1] - w[0]).num_days() >= self.settings.yearly_gap_days)
        };

        parsed
            .iter()
            .map(|(_, _, header)| match *header {
                ParsedHeader::Year(year) => Some(PeriodKind::FiscalYear { year }),
                ParsedHeader::Quarter { year, quarter } => {
                    Some(PeriodKind::Quarter { year, quarter })
                }
                ParsedHeader::Date { date, months } => {
                    let yearly = match months {
                        Some(m) if m >= 12 => true,
                        Some(m) if m <= 3 => false,
                        _ => dates_are_yearly,
                    };
                    if yearly {
                        get_fiscal_year_end_for_date(date, fiscal_month)
                            .map(|end| PeriodKind::FiscalYear { year: end.year() })
                    } else {
                        fiscal_quarter_for_date(date, fiscal_month)
                            .map(|(year, quarter)| PeriodKind::Quarter { year, quarter })
                    }
                }
            })
            .collect()
    }

    fn order_and_dedupe(
        &self,
        parsed: &[(usize, String, ParsedHeader)],
        kinds: &[Option<PeriodKind>],
    ) -> (Vec<PeriodColumn>, Vec<DuplicatePeriod>) {
        let fiscal_month = self.settings.fiscal_year_end_month;
        let mut by_id: HashMap<String, PeriodColumn> = HashMap::new();
        let mut duplicates = Vec::new();

        // Left to right, so a later column replaces an earlier one with the same id.
        for ((column_index, raw_label, _), kind) in parsed.iter().zip(kinds) {
            let Some(kind) = kind else { continue };
            let Some(end_date) = kind.end_date(fiscal_month) else {
                continue;
            };
            let column = PeriodColumn {
                column_index: *column_index,
                raw_label: raw_label.clone(),
                id: kind.id(),
                kind: *kind,
                end_date,
            };
            if let Some(previous) = by_id.insert(column.id.clone(), column.clone()) {
                warn!(
                    "Duplicate period {} in columns {} and {}; keeping column {}",
                    column.id, previous.column_index, column.column_index, column.column_index
                );
                for earlier in duplicates
                    .iter_mut()
                    .filter(|d: &&mut DuplicatePeriod| d.period_id == column.id)
                {
                    earlier.kept_column_index = column.column_index;
                }
                duplicates.push(DuplicatePeriod {
                    period_id: column.id.clone(),
                    column_index: previous.column_index,
                    kept_column_index: column.column_index,
                });
            }
        }

        let mut periods: Vec<PeriodColumn> = by_id.into_values().collect();
        periods.sort_by(|a, b| {
            b.sort_key()
                .cmp(&a.sort_key())
                .then(b.column_index.cmp(&a.column_index))
        });
        duplicates.sort_by_key(|d| d.column_index);
        (periods, duplicates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::CellValue;

    fn detector() -> PeriodDetector {
        PeriodDetector::new(PeriodSettings::default())
    }

    #[test]
    fn test_parse_period_labels() {
        assert_eq!(parse_period_label("FY2023"), Some(ParsedHeader::Year(2023)));
        assert_eq!(parse_period_label("FY 23"), Some(ParsedHeader::Year(2023)));
        assert_eq!(parse_period_label("2022"), Some(ParsedHeader::Year(2022)));
        assert_eq!(
            parse_period_label("Q1 2024"),
            Some(ParsedHeader::Quarter {
                year: 2024,
                quarter: 1
            })
        );
        assert_eq!(
            parse_period_label("2024-Q3"),
            Some(ParsedHeader::Quarter {
                year: 2024,
                quarter: 3
            })
        );
        assert_eq!(
            parse_period_label("2Q23"),
            Some(ParsedHeader::Quarter {
                year: 2023,
                quarter: 2
            })
        );
        assert_eq!(parse_period_label("Revenue"), None);
        assert_eq!(parse_period_label("Notes"), None);
        assert_eq!(parse_period_label("1200"), None);
    }

    #[test]
    fn test_parse_embedded_dates() {
        let expected = NaiveDate::from_ymd_opt(2023, 12, 31).unwrap();
        for label in [
            "12 months Dec-31-2023",
            "2023-12-31",
            "12/31/2023",
            "Dec 31, 2023",
            "31-Dec-2023",
        ] {
            match parse_period_label(label) {
                Some(ParsedHeader::Date { date, .. }) => assert_eq!(date, expected, "{}", label),
                other => panic!("'{}' parsed as {:?}", label, other),
            }
        }
        assert_eq!(
            parse_period_label("12 months Dec-31-2023"),
            Some(ParsedHeader::Date {
                date: expected,
                months: Some(12)
            })
        );
    }

    #[test]
    fn test_detect_orders_most_recent_first() {
        let grid = RawGrid::from_records(vec![
            vec!["", "FY2021", "FY2022", "FY2023"],
            vec!["Revenue", "800", "900", "1000"],
        ]);
        let detection = detector().detect(&grid, 0).unwrap();
        assert_eq!(detection.header_row, 0);
        assert_eq!(detection.label_column, 0);
        assert_eq!(detection.period_ids(), vec!["FY2023", "FY2022", "FY2021"]);
        assert_eq!(detection.periods[0].column_index, 3);
    }

    #[test]
    fn test_header_row_below_title_rows() {
        let grid = RawGrid::new(vec![
            vec![CellValue::from("Acme Corp"), CellValue::Empty],
            vec![CellValue::from("Report for 2023"), CellValue::Empty],
            vec![
                CellValue::Empty,
                CellValue::Number(2022.0),
                CellValue::Number(2023.0),
            ],
            vec![
                CellValue::from("Revenue"),
                CellValue::Number(1.0),
                CellValue::Number(2.0),
            ],
        ]);
        let detection = detector().detect(&grid, 0).unwrap();
        assert_eq!(detection.header_row, 2);
        assert_eq!(detection.period_ids(), vec!["FY2023", "FY2022"]);
    }

    #[test]
    fn test_quarter_ordering_and_mixed_years() {
        let grid = RawGrid::from_records(vec![vec![
            "", "Q4 2023", "Q1 2024", "FY2023", "Q2-2024",
        ]]);
        let detection = detector().detect(&grid, 0).unwrap();
        assert_eq!(
            detection.period_ids(),
            vec!["Q2-2024", "Q1-2024", "FY2023", "Q4-2023"]
        );
    }

    #[test]
    fn test_capital_iq_dates_bucket_to_fiscal_years() {
        let grid = RawGrid::from_records(vec![vec![
            "For the Fiscal Period Ending",
            "12 months Dec-31-2021",
            "12 months Dec-31-2022",
            "12 months Dec-31-2023",
        ]]);
        let detection = detector().detect(&grid, 0).unwrap();
        assert_eq!(detection.period_ids(), vec!["FY2023", "FY2022", "FY2021"]);
    }

    #[test]
    fn test_close_dates_bucket_to_quarters() {
        let grid = RawGrid::from_records(vec![vec!["", "2024-03-31", "2024-06-30"]]);
        let detection = detector().detect(&grid, 0).unwrap();
        assert_eq!(detection.period_ids(), vec!["Q2-2024", "Q1-2024"]);
    }

    #[test]
    fn test_fiscal_year_end_month_applied_to_dates() {
        let settings = PeriodSettings {
            fiscal_year_end_month: 6,
            ..PeriodSettings::default()
        };
        let grid = RawGrid::from_records(vec![vec!["", "Jun-30-2023", "Jun-30-2024"]]);
        let detection = PeriodDetector::new(settings).detect(&grid, 0).unwrap();
        assert_eq!(detection.period_ids(), vec!["FY2024", "FY2023"]);
        assert_eq!(
            detection.periods[0].end_date,
            NaiveDate::from_ymd_opt(2024, 6, 30).unwrap()
        );
    }

    #[test]
    fn test_duplicate_period_keeps_rightmost() {
        let grid = RawGrid::from_records(vec![vec!["", "FY2023", "FY2022", "FY2023"]]);
        let detection = detector().detect(&grid, 0).unwrap();
        assert_eq!(detection.period_ids(), vec!["FY2023", "FY2022"]);
        assert_eq!(detection.periods[0].column_index, 3);
        assert_eq!(
            detection.duplicates,
            vec![DuplicatePeriod {
                period_id: "FY2023".to_string(),
                column_index: 1,
                kept_column_index: 3,
            }]
        );
    }

    #[test]
    fn test_skipped_columns_recorded() {
        let grid = RawGrid::from_records(vec![vec!["", "FY2022", "Notes", "FY2023"]]);
        let detection = detector().detect(&grid, 0).unwrap();
        assert_eq!(
            detection.skipped_columns,
            vec![SkippedColumn {
                column_index: 2,
                raw_label: "Notes".to_string()
            }]
        );
    }

    #[test]
    fn test_single_period_fallback() {
        let grid = RawGrid::from_records(vec![
            vec!["Statement", ""],
            vec!["", "FY2023"],
            vec!["Revenue", "10"],
        ]);
        let detection = detector().detect(&grid, 0).unwrap();
        assert_eq!(detection.header_row, 1);
        assert_eq!(detection.period_ids(), vec!["FY2023"]);
    }

    #[test]
    fn test_no_periods() {
        let grid = RawGrid::from_records(vec![vec!["Revenue", "100"], vec!["COGS", "40"]]);
        assert!(matches!(
            detector().detect(&grid, 0),
            Err(ForgeError::NoPeriodsDetected)
        ));
        assert!(matches!(
            detector().detect(&RawGrid::default(), 0),
            Err(ForgeError::NoPeriodsDetected)
        ));
    }

    #[test]
    fn test_prior_year() {
        assert_eq!(
            PeriodKind::Quarter {
                year: 2024,
                quarter: 2
            }
            .prior_year()
            .id(),
            "Q2-2023"
        );
        assert_eq!(PeriodKind::FiscalYear { year: 2023 }.prior_year().id(), "FY2022");
    }
}
