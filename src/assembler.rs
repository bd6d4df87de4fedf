//! Statement assembly: period columns × classified rows → normalized statement.

use crate::classifier::ClassifiedRow;
use crate::config::AssemblySettings;
use crate::error::{ForgeError, Result};
use crate::grid::RawGrid;
use crate::period::PeriodDetection;
use crate::reconciler::SubtotalReconciler;
use crate::taxonomy::{CanonicalLineItem, SignConvention};
use crate::{PeriodValues, StatementCell, ValueOrigin};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Non-fatal findings collected while assembling a statement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Anomaly {
    UnclassifiedRow {
        row_index: usize,
        raw_label: String,
    },
    SkippedColumn {
        column_index: usize,
        raw_label: String,
    },
    DuplicatePeriod {
        period_id: String,
        column_index: usize,
        kept_column_index: usize,
    },
    DuplicateLineItem {
        item: CanonicalLineItem,
        row_index: usize,
        raw_label: String,
        kept_row_index: usize,
    },
    SubtotalMismatch {
        period: String,
        item: CanonicalLineItem,
        reported: f64,
        computed: f64,
        difference: f64,
        tolerance: f64,
    },
}

impl Anomaly {
    pub fn kind(&self) -> &'static str {
        match self {
            Anomaly::UnclassifiedRow { .. } => "unclassified_row",
            Anomaly::SkippedColumn { .. } => "skipped_column",
            Anomaly::DuplicatePeriod { .. } => "duplicate_period",
            Anomaly::DuplicateLineItem { .. } => "duplicate_line_item",
            Anomaly::SubtotalMismatch { .. } => "subtotal_mismatch",
        }
    }
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anomaly::UnclassifiedRow {
                row_index,
                raw_label,
            } => write!(f, "Row {} '{}' did not match any line item", row_index, raw_label),
            Anomaly::SkippedColumn {
                column_index,
                raw_label,
            } => write!(f, "Column {} '{}' is not a period", column_index, raw_label),
            Anomaly::DuplicatePeriod {
                period_id,
                column_index,
                kept_column_index,
            } => write!(
                f,
                "Period {} repeated in column {}; column {} kept",
                period_id, column_index, kept_column_index
            ),
            Anomaly::DuplicateLineItem {
                item,
                row_index,
                raw_label,
                kept_row_index,
            } => write!(
                f,
                "Row {} '{}' also maps to {}; row {} kept",
                row_index, raw_label, item, kept_row_index
            ),
            Anomaly::SubtotalMismatch {
                period,
                item,
                reported,
                computed,
                difference,
                ..
            } => write!(
                f,
                "{} {}: reported {} vs computed {} (off by {})",
                period, item, reported, computed, difference
            ),
        }
    }
}

/// Assembled values keyed by period identifier then line item.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Statement {
    periods: Vec<String>,
    values: BTreeMap<String, PeriodValues>,
}

impl Statement {
    /// `periods` most recent first.
    pub fn new(periods: Vec<String>) -> Self {
        let values = periods
            .iter()
            .map(|p| (p.clone(), PeriodValues::new()))
            .collect();
        Self { periods, values }
    }

    pub fn periods(&self) -> &[String] {
        &self.periods
    }

    pub fn has_period(&self, period: &str) -> bool {
        self.values.contains_key(period)
    }

    pub fn period_values(&self, period: &str) -> Option<&PeriodValues> {
        self.values.get(period)
    }

    pub fn cell(&self, period: &str, item: CanonicalLineItem) -> Option<&StatementCell> {
        self.values.get(period)?.get(&item)
    }

    pub fn value(&self, period: &str, item: CanonicalLineItem) -> Option<f64> {
        self.cell(period, item).map(|c| c.value)
    }

    /// Values for unknown periods are ignored.
    pub fn insert(&mut self, period: &str, item: CanonicalLineItem, cell: StatementCell) {
        if let Some(values) = self.values.get_mut(period) {
            values.insert(item, cell);
        }
    }

    /// `(period, value)` pairs for one item, most recent first.
    pub fn series(&self, item: CanonicalLineItem) -> Vec<(String, Option<f64>)> {
        self.periods
            .iter()
            .map(|p| (p.clone(), self.value(p, item)))
            .collect()
    }

    pub fn items(&self) -> BTreeSet<CanonicalLineItem> {
        self.values
            .values()
            .flat_map(|values| values.keys().copied())
            .collect()
    }

    pub fn data_points(&self) -> usize {
        self.values.values().map(|v| v.len()).sum()
    }
}

/// One raw cell of a labelled row under a period column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawValue {
    pub period: String,
    pub text: String,
    pub numeric: Option<f64>,
}

/// A labelled source row with its classification and raw values, kept for the
/// long-form table and per-row drill-down.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceRow {
    pub row_index: usize,
    pub raw_label: String,
    pub item: Option<CanonicalLineItem>,
    pub confidence: f64,
    /// Ordered like the detected periods, most recent first.
    pub values: Vec<RawValue>,
}

impl SourceRow {
    pub fn has_numeric(&self) -> bool {
        self.values.iter().any(|v| v.numeric.is_some())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssembledStatement {
    pub statement: Statement,
    pub rows: Vec<SourceRow>,
    pub anomalies: Vec<Anomaly>,
}

pub struct StatementAssembler<'a> {
    settings: &'a AssemblySettings,
}

impl<'a> StatementAssembler<'a> {
    pub fn new(settings: &'a AssemblySettings) -> Self {
        Self { settings }
    }

    pub fn assemble(
        &self,
        grid: &RawGrid,
        detection: &PeriodDetection,
        classified: &[ClassifiedRow],
    ) -> Result<AssembledStatement> {
        let mut anomalies = self.detection_anomalies(detection);

        let rows: Vec<SourceRow> = classified
            .iter()
            .map(|row| self.read_row(grid, detection, row))
            .collect();

        for row in rows.iter().filter(|r| r.item.is_none()) {
            anomalies.push(Anomaly::UnclassifiedRow {
                row_index: row.row_index,
                raw_label: row.raw_label.clone(),
            });
        }

        let usable: Vec<&SourceRow> = rows
            .iter()
            .filter(|r| r.item.is_some() && r.has_numeric())
            .collect();
        if usable.is_empty() {
            let classified_count = rows.iter().filter(|r| r.item.is_some()).count();
            warn!(
                "None of {} labelled rows ({} classified) carry numeric values",
                rows.len(),
                classified_count
            );
            return Err(ForgeError::NoUsableRows(format!(
                "{} rows classified, none with numeric values",
                classified_count
            )));
        }

        let (winners, duplicate_anomalies) = self.pick_winners(&usable);
        anomalies.extend(duplicate_anomalies);

        let flips = self.sign_flips(detection, &winners);
        let mut statement = Statement::new(detection.period_ids());

        for (item, row) in &winners {
            for (idx, raw) in row.values.iter().enumerate() {
                let Some(value) = raw.numeric else { continue };
                let flip = flips[idx] && item.sign_convention() == SignConvention::NegativeAsReported;
                let cell = if flip {
                    StatementCell {
                        value: -value,
                        origin: ValueOrigin::SignNormalized,
                        source_row: Some(row.row_index),
                        logic: format!(
                            "Row {} reported {}; expenses in this column are shown negative",
                            row.row_index, value
                        ),
                    }
                } else {
                    StatementCell {
                        value,
                        origin: ValueOrigin::Reported,
                        source_row: Some(row.row_index),
                        logic: format!("Reported in row {} '{}'", row.row_index, row.raw_label),
                    }
                };
                statement.insert(&raw.period, *item, cell);
            }
        }

        let mismatches = SubtotalReconciler::new(self.settings).reconcile(&mut statement);
        anomalies.extend(mismatches);

        info!(
            "Assembled statement: {} periods, {} line items, {} data points, {} anomalies",
            statement.periods().len(),
            statement.items().len(),
            statement.data_points(),
            anomalies.len()
        );

        Ok(AssembledStatement {
            statement,
            rows,
            anomalies,
        })
    }

    fn detection_anomalies(&self, detection: &PeriodDetection) -> Vec<Anomaly> {
        let skipped = detection.skipped_columns.iter().map(|s| Anomaly::SkippedColumn {
            column_index: s.column_index,
            raw_label: s.raw_label.clone(),
        });
        let duplicates = detection.duplicates.iter().map(|d| Anomaly::DuplicatePeriod {
            period_id: d.period_id.clone(),
            column_index: d.column_index,
            kept_column_index: d.kept_column_index,
        });
        skipped.chain(duplicates).collect()
    }

    fn read_row(&self, grid: &RawGrid, detection: &PeriodDetection, row: &ClassifiedRow) -> SourceRow {
        let values = detection
            .periods
            .iter()
            .map(|period| {
                let cell = grid.cell(row.row_index, period.column_index);
                RawValue {
                    period: period.id.clone(),
                    text: cell.to_string(),
                    numeric: cell.as_number(),
                }
            })
            .collect();

        SourceRow {
            row_index: row.row_index,
            raw_label: row.raw_label.clone(),
            item: row.item(),
            confidence: row.confidence(),
            values,
        }
    }

    /// Highest confidence wins; equal confidence goes to the topmost row.
    fn pick_winners<'r>(
        &self,
        usable: &[&'r SourceRow],
    ) -> (BTreeMap<CanonicalLineItem, &'r SourceRow>, Vec<Anomaly>) {
        let mut by_item: BTreeMap<CanonicalLineItem, Vec<&'r SourceRow>> = BTreeMap::new();
        for row in usable {
            if let Some(item) = row.item {
                by_item.entry(item).or_default().push(row);
            }
        }

        let mut winners = BTreeMap::new();
        let mut anomalies = Vec::new();

        for (item, mut candidates) in by_item {
            candidates.sort_by(|a, b| {
                b.confidence
                    .total_cmp(&a.confidence)
                    .then(a.row_index.cmp(&b.row_index))
            });
            let winner = candidates[0];
            for loser in &candidates[1..] {
                debug!(
                    "Row {} '{}' loses {} to row {}",
                    loser.row_index, loser.raw_label, item, winner.row_index
                );
                anomalies.push(Anomaly::DuplicateLineItem {
                    item,
                    row_index: loser.row_index,
                    raw_label: loser.raw_label.clone(),
                    kept_row_index: winner.row_index,
                });
            }
            winners.insert(item, winner);
        }

        (winners, anomalies)
    }

    /// One decision per period column: flip expense cells when most of them are
    /// negative. An even split keeps the sheet's signs.
    fn sign_flips(
        &self,
        detection: &PeriodDetection,
        winners: &BTreeMap<CanonicalLineItem, &SourceRow>,
    ) -> Vec<bool> {
        (0..detection.periods.len())
            .map(|idx| {
                let (negative, positive) = winners
                    .iter()
                    .filter(|(item, _)| item.sign_convention() == SignConvention::NegativeAsReported)
                    .filter_map(|(_, row)| row.values.get(idx).and_then(|v| v.numeric))
                    .fold((0usize, 0usize), |(neg, pos), value| {
                        if value < 0.0 {
                            (neg + 1, pos)
                        } else if value > 0.0 {
                            (neg, pos + 1)
                        } else {
                            (neg, pos)
                        }
                    });
                let flip = negative > positive;
                if flip {
                    debug!(
                        "Column for {} reports expenses negative ({} of {}); normalizing",
                        detection.periods[idx].id,
                        negative,
                        negative + positive
                    );
                }
                flip
            })
            .collect()
    }
}
