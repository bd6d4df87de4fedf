//! # Financial Analysis Forge
//!
//! Turns an uploaded income statement spreadsheet (a loosely structured grid of labelled
//! rows and period columns) into a normalized, queryable statement.
//!
//! ## Core Concepts
//!
//! - **Periods**: header cells such as `FY2023`, `Q1 2024` or `12 months Dec-31-2023`
//!   are recognized and ordered most recent first
//! - **Line Items**: free-text row labels are matched to a fixed taxonomy
//!   (`Revenue`, `GrossProfit`, `NetIncome`, ...) with a confidence score
//! - **Statement**: period × line item values with expenses sign-normalized and
//!   subtotals reconciled against their components
//! - **Metrics**: margins and year-over-year growth, undefined rather than zero when an
//!   input is missing
//! - **Jobs**: [`ParseJobCoordinator`] runs a parse as a background job per session and
//!   streams ordered progress events
//!
//! ## Example
//!
//! ```rust,ignore
//! use financial_analysis_forge::*;
//!
//! let grid = RawGrid::from_records(vec![
//!     vec!["", "FY2023", "FY2022"],
//!     vec!["Revenue", "1000", "900"],
//!     vec!["Cost of Goods Sold", "400", "380"],
//!     vec!["Gross Profit", "600", "520"],
//! ]);
//!
//! let outcome = process_income_statement(&grid, &ForgeConfig::default()).unwrap();
//! assert_eq!(outcome.period_ids(), vec!["FY2023", "FY2022"]);
//! ```

pub mod assembler;
pub mod classifier;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod grid;
pub mod metrics;
pub mod period;
pub mod pipeline;
pub mod progress;
pub mod reconciler;
pub mod report;
pub mod taxonomy;
pub mod utils;

pub use assembler::{Anomaly, AssembledStatement, SourceRow, Statement, StatementAssembler};
pub use classifier::{normalize_label, Classification, ClassifiedRow, LineItemClassifier, MatchTier};
pub use config::ForgeConfig;
pub use coordinator::{JobSnapshot, JobState, ParseJobCoordinator, ProgressSubscription, SessionId};
pub use error::{ForgeError, Result};
pub use grid::{CellValue, RawGrid, Sheet, Workbook};
pub use metrics::{Metric, MetricFormula, MetricName, MetricsEngine};
pub use period::{PeriodColumn, PeriodDetection, PeriodDetector, PeriodKind};
pub use pipeline::{ParseOutcome, ParsePipeline};
pub use progress::{is_completion_line, ParseStage, ProgressEvent};
pub use reconciler::SubtotalReconciler;
pub use report::{format_amount, format_ratio, TableView};
pub use taxonomy::{AliasEntry, AliasTable, CanonicalLineItem, SignConvention};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueOrigin {
    /// Taken from the sheet as is
    Reported,
    /// Taken from the sheet with its sign flipped to the taxonomy's convention
    SignNormalized,
    /// Derived from other line items through a subtotal formula
    Computed,
}

impl fmt::Display for ValueOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ValueOrigin::Reported => "reported",
            ValueOrigin::SignNormalized => "sign-normalized",
            ValueOrigin::Computed => "computed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementCell {
    pub value: f64,
    pub origin: ValueOrigin,
    /// Grid row the value was read from (`None` when computed)
    pub source_row: Option<usize>,
    /// Human readable explanation (e.g. "Computed as GrossProfit = Revenue - CostOfGoodsSold")
    pub logic: String,
}

pub type PeriodValues = BTreeMap<CanonicalLineItem, StatementCell>;

pub struct IncomeStatementProcessor;

impl IncomeStatementProcessor {
    pub fn process(grid: &RawGrid, config: &ForgeConfig) -> Result<ParseOutcome> {
        config.validate()?;

        info!(
            "Processing income statement grid: {} rows x {} columns",
            grid.row_count(),
            grid.column_count()
        );

        let outcome = ParsePipeline::new(config.clone()).run(grid, None)?;

        for anomaly in &outcome.anomalies {
            debug!("Anomaly: {}", anomaly);
        }

        Ok(outcome)
    }

    pub fn process_workbook(workbook: &Workbook, config: &ForgeConfig) -> Result<ParseOutcome> {
        config.validate()?;
        info!("Processing workbook with sheets: {:?}", workbook.sheet_names());
        ParsePipeline::new(config.clone()).run_workbook(workbook, None)
    }
}

pub fn process_income_statement(grid: &RawGrid, config: &ForgeConfig) -> Result<ParseOutcome> {
    IncomeStatementProcessor::process(grid, config)
}

pub fn process_workbook(workbook: &Workbook, config: &ForgeConfig) -> Result<ParseOutcome> {
    IncomeStatementProcessor::process_workbook(workbook, config)
}
