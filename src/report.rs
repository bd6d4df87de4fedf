//! Tabular views over a finished parse, plus display formatting for amounts and ratios.

use crate::metrics::metrics_for_period;
use crate::pipeline::ParseOutcome;
use crate::taxonomy::CanonicalLineItem;
use serde::{Deserialize, Serialize};

/// Placeholder shown for a missing or undefined value.
pub const MISSING: &str = "—";

/// Order line items are listed in when a statement is shown top to bottom.
pub const PRESENTATION_ORDER: [CanonicalLineItem; 10] = [
    CanonicalLineItem::Revenue,
    CanonicalLineItem::CostOfGoodsSold,
    CanonicalLineItem::GrossProfit,
    CanonicalLineItem::OperatingExpenses,
    CanonicalLineItem::OperatingIncome,
    CanonicalLineItem::Ebitda,
    CanonicalLineItem::InterestExpense,
    CanonicalLineItem::PretaxIncome,
    CanonicalLineItem::IncomeTaxExpense,
    CanonicalLineItem::NetIncome,
];

const KEY_FIGURES: [CanonicalLineItem; 4] = [
    CanonicalLineItem::Revenue,
    CanonicalLineItem::GrossProfit,
    CanonicalLineItem::OperatingIncome,
    CanonicalLineItem::NetIncome,
];

/// Compact amount: `1.20B`, `3.40M`, `5.60K`, plain below a thousand.
pub fn format_amount(value: Option<f64>) -> String {
    let Some(v) = value.filter(|v| v.is_finite()) else {
        return MISSING.to_string();
    };
    let abs = v.abs();
    if abs >= 1_000_000_000.0 {
        format!("{:.2}B", v / 1_000_000_000.0)
    } else if abs >= 1_000_000.0 {
        format!("{:.2}M", v / 1_000_000.0)
    } else if abs >= 1_000.0 {
        format!("{:.2}K", v / 1_000.0)
    } else {
        format!("{:.0}", v)
    }
}

pub fn format_ratio(value: Option<f64>) -> String {
    match value.filter(|v| v.is_finite()) {
        Some(v) => format!("{:.1}%", v * 100.0),
        None => MISSING.to_string(),
    }
}

fn format_plain(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TableView {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl TableView {
    pub fn new(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Cell under `column` in row `row`.
    pub fn get(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(idx).map(String::as_str)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_csv(&self) -> String {
        let mut output = String::new();
        output.push_str(&csv_line(&self.columns));
        for row in &self.rows {
            output.push_str(&csv_line(row));
        }
        output
    }

    pub fn to_markdown(&self) -> String {
        let mut output = String::new();
        output.push_str(&format!("| {} |\n", self.columns.join(" | ")));
        output.push_str(&format!(
            "|{}\n",
            self.columns.iter().map(|_| "---|").collect::<String>()
        ));
        for row in &self.rows {
            let cells: Vec<String> = row.iter().map(|c| c.replace('|', "\\|")).collect();
            output.push_str(&format!("| {} |\n", cells.join(" | ")));
        }
        output
    }
}

fn csv_line(cells: &[String]) -> String {
    let escaped: Vec<String> = cells
        .iter()
        .map(|cell| {
            if cell.contains(',') || cell.contains('"') || cell.contains('\n') {
                format!("\"{}\"", cell.replace('"', "\"\""))
            } else {
                cell.clone()
            }
        })
        .collect();
    format!("{}\n", escaped.join(","))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeyFigure {
    pub name: String,
    pub item: CanonicalLineItem,
    pub value: Option<f64>,
    pub display: String,
    /// Bar length relative to the largest figure, 0-100.
    pub bar_pct: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeriesPoint {
    pub period: String,
    pub value: Option<f64>,
    pub display: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineItemSeries {
    pub label: String,
    pub item: Option<CanonicalLineItem>,
    /// Most recent first.
    pub points: Vec<SeriesPoint>,
    pub latest: Option<f64>,
    pub average: Option<f64>,
}

impl ParseOutcome {
    /// Key/value summary of the parse.
    pub fn details_table(&self) -> TableView {
        let unclassified = self.classified.iter().filter(|r| !r.is_classified()).count();
        let mut table = TableView::new(&["field", "value"]);
        let fields = [
            ("sheet_name", self.sheet_name.clone().unwrap_or_default()),
            ("periods", self.period_ids().join(", ")),
            (
                "most_recent_period",
                self.most_recent_period().unwrap_or_default().to_string(),
            ),
            ("period_count", self.detection.periods.len().to_string()),
            ("line_item_count", self.line_item_count().to_string()),
            ("data_points", self.statement.data_points().to_string()),
            ("unclassified_rows", unclassified.to_string()),
            ("anomaly_count", self.anomalies.len().to_string()),
        ];
        for (field, value) in fields {
            table.push_row(vec![field.to_string(), value]);
        }
        table
    }

    /// One row per line item present in `period`, in presentation order.
    pub fn statement_table(&self, period: &str) -> Option<TableView> {
        let values = self.statement.period_values(period)?;
        let mut table = TableView::new(&["line_item", "value", "display", "origin"]);
        for item in PRESENTATION_ORDER {
            if let Some(cell) = values.get(&item) {
                table.push_row(vec![
                    item.display_name().to_string(),
                    cell.value.to_string(),
                    format_amount(Some(cell.value)),
                    cell.origin.to_string(),
                ]);
            }
        }
        Some(table)
    }

    /// Long form: one row per labelled source row and period.
    pub fn raw_table(&self) -> TableView {
        let mut table = TableView::new(&[
            "line_item",
            "period",
            "value",
            "value_numeric",
            "canonical_item",
            "confidence",
        ]);
        for row in &self.rows {
            for raw in &row.values {
                table.push_row(vec![
                    row.raw_label.clone(),
                    raw.period.clone(),
                    raw.text.clone(),
                    format_plain(raw.numeric),
                    row.item.map(|i| i.to_string()).unwrap_or_default(),
                    format!("{:.2}", row.confidence),
                ]);
            }
        }
        table
    }

    /// Metric name → display string, `None` where undefined.
    pub fn metric_displays(&self, period: &str) -> Vec<(String, Option<String>)> {
        metrics_for_period(&self.metrics, period)
            .into_iter()
            .map(|(name, value)| (name.to_string(), value.map(|v| format_ratio(Some(v)))))
            .collect()
    }

    pub fn key_figures(&self, period: &str) -> Vec<KeyFigure> {
        let values: Vec<(CanonicalLineItem, Option<f64>)> = KEY_FIGURES
            .iter()
            .map(|item| (*item, self.statement.value(period, *item)))
            .collect();
        let max_abs = values
            .iter()
            .filter_map(|(_, v)| v.map(f64::abs))
            .fold(0.0_f64, f64::max);

        values
            .into_iter()
            .map(|(item, value)| KeyFigure {
                name: item.display_name().to_string(),
                item,
                value,
                display: format_amount(value),
                bar_pct: match value {
                    Some(v) if max_abs > 0.0 => ((v.abs() / max_abs) * 100.0).round() as u32,
                    _ => 0,
                },
            })
            .collect()
    }

    /// Values of one row across periods. `label` resolves against source row labels,
    /// exact first then case-insensitively, then against canonical item names.
    pub fn line_item_series(&self, label: &str) -> Option<LineItemSeries> {
        let wanted = label.trim();
        let row = self
            .rows
            .iter()
            .find(|r| r.raw_label == wanted)
            .or_else(|| {
                self.rows
                    .iter()
                    .find(|r| r.raw_label.eq_ignore_ascii_case(wanted))
            });

        let (label, item, values): (String, Option<CanonicalLineItem>, Vec<(String, Option<f64>)>) =
            match row {
                Some(row) => (
                    row.raw_label.clone(),
                    row.item,
                    row.values
                        .iter()
                        .map(|v| (v.period.clone(), v.numeric))
                        .collect(),
                ),
                None => {
                    let item = CanonicalLineItem::ALL.into_iter().find(|i| {
                        i.display_name().eq_ignore_ascii_case(wanted)
                            || i.to_string().eq_ignore_ascii_case(wanted)
                    })?;
                    (
                        item.display_name().to_string(),
                        Some(item),
                        self.statement.series(item),
                    )
                }
            };

        let present: Vec<f64> = values.iter().filter_map(|(_, v)| *v).collect();
        let average = if present.is_empty() {
            None
        } else {
            Some(present.iter().sum::<f64>() / present.len() as f64)
        };

        Some(LineItemSeries {
            label,
            item,
            latest: present.first().copied(),
            average,
            points: values
                .into_iter()
                .map(|(period, value)| SeriesPoint {
                    display: format_amount(value),
                    period,
                    value,
                })
                .collect(),
        })
    }
}
