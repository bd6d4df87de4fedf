//! The four parse stages wired together.
//!
//! [`ParsePipeline::run`] drives them synchronously for library callers; the job
//! coordinator steps through the same [`ParsePipeline::run_stage`] calls so both paths
//! produce identical results.

use crate::assembler::{Anomaly, AssembledStatement, SourceRow, Statement, StatementAssembler};
use crate::classifier::{ClassifiedRow, LineItemClassifier};
use crate::config::ForgeConfig;
use crate::error::{ForgeError, Result};
use crate::grid::{RawGrid, Workbook};
use crate::metrics::{Metric, MetricsEngine};
use crate::period::{PeriodDetection, PeriodDetector};
use crate::progress::{ParseStage, ProgressEvent};
use crate::taxonomy::AliasTable;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

/// Everything a finished parse produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParseOutcome {
    pub sheet_name: Option<String>,
    pub detection: PeriodDetection,
    pub classified: Vec<ClassifiedRow>,
    pub statement: Statement,
    pub rows: Vec<SourceRow>,
    pub metrics: Vec<Metric>,
    pub anomalies: Vec<Anomaly>,
}

impl ParseOutcome {
    pub fn period_ids(&self) -> Vec<String> {
        self.detection.period_ids()
    }

    pub fn most_recent_period(&self) -> Option<&str> {
        self.detection.periods.first().map(|p| p.id.as_str())
    }

    pub fn has_period(&self, period: &str) -> bool {
        self.statement.has_period(period)
    }

    pub fn line_item_count(&self) -> usize {
        self.statement.items().len()
    }
}

/// Intermediate results carried from one stage to the next.
#[derive(Debug, Default)]
pub struct PartialParse {
    detection: Option<PeriodDetection>,
    classified: Option<Vec<ClassifiedRow>>,
    assembled: Option<AssembledStatement>,
    metrics: Option<Vec<Metric>>,
}

impl PartialParse {
    pub fn finish(self, sheet_name: Option<String>) -> Result<ParseOutcome> {
        let (Some(detection), Some(classified), Some(assembled), Some(metrics)) =
            (self.detection, self.classified, self.assembled, self.metrics)
        else {
            return Err(ForgeError::JobFailed(
                "parse finished before every stage ran".to_string(),
            ));
        };

        Ok(ParseOutcome {
            sheet_name,
            detection,
            classified,
            statement: assembled.statement,
            rows: assembled.rows,
            metrics,
            anomalies: assembled.anomalies,
        })
    }
}

fn missing(stage: ParseStage, needs: ParseStage) -> ForgeError {
    ForgeError::JobFailed(format!("{} requires {} to run first", stage, needs))
}

pub struct ParsePipeline {
    config: ForgeConfig,
    classifier: LineItemClassifier,
    metrics: MetricsEngine,
}

impl Default for ParsePipeline {
    fn default() -> Self {
        Self::new(ForgeConfig::default())
    }
}

impl ParsePipeline {
    pub fn new(config: ForgeConfig) -> Self {
        Self::with_aliases(config, &AliasTable::default())
    }

    pub fn with_aliases(config: ForgeConfig, aliases: &AliasTable) -> Self {
        let classifier = LineItemClassifier::new(aliases, config.classification.clone());
        Self {
            config,
            classifier,
            metrics: MetricsEngine::default(),
        }
    }

    pub fn config(&self) -> &ForgeConfig {
        &self.config
    }

    /// Header search starts below the statement marker row when the sheet has one.
    pub fn detect_periods(&self, grid: &RawGrid) -> Result<PeriodDetection> {
        let start_row = grid
            .find_marker_row(&self.config.workbook.statement_marker)
            .map(|row| row + 1)
            .unwrap_or(0);
        if start_row > 0 {
            debug!("Statement marker found, scanning for headers from row {}", start_row);
        }
        PeriodDetector::new(self.config.periods.clone()).detect(grid, start_row)
    }

    pub fn classify_rows(&self, grid: &RawGrid, detection: &PeriodDetection) -> Vec<ClassifiedRow> {
        self.classifier.classify_grid_rows(
            grid,
            detection.first_data_row(),
            detection.label_column,
            &self.config.assembly.metadata_row_labels,
        )
    }

    pub fn assemble(
        &self,
        grid: &RawGrid,
        detection: &PeriodDetection,
        classified: &[ClassifiedRow],
    ) -> Result<AssembledStatement> {
        StatementAssembler::new(&self.config.assembly).assemble(grid, detection, classified)
    }

    pub fn compute_metrics(&self, statement: &Statement, detection: &PeriodDetection) -> Vec<Metric> {
        self.metrics.compute(statement, &detection.periods)
    }

    /// Runs one stage against `state` and returns a short human-readable summary.
    pub fn run_stage(&self, stage: ParseStage, grid: &RawGrid, state: &mut PartialParse) -> Result<String> {
        match stage {
            ParseStage::DetectingPeriods => {
                let detection = self.detect_periods(grid)?;
                let detail = format!(
                    "{} periods ({})",
                    detection.periods.len(),
                    detection.period_ids().join(", ")
                );
                state.detection = Some(detection);
                Ok(detail)
            }
            ParseStage::ClassifyingRows => {
                let detection = state
                    .detection
                    .as_ref()
                    .ok_or_else(|| missing(stage, ParseStage::DetectingPeriods))?;
                let classified = self.classify_rows(grid, detection);
                let matched = classified.iter().filter(|r| r.is_classified()).count();
                let detail = format!("{} of {} rows classified", matched, classified.len());
                state.classified = Some(classified);
                Ok(detail)
            }
            ParseStage::Assembling => {
                let detection = state
                    .detection
                    .as_ref()
                    .ok_or_else(|| missing(stage, ParseStage::DetectingPeriods))?;
                let classified = state
                    .classified
                    .as_ref()
                    .ok_or_else(|| missing(stage, ParseStage::ClassifyingRows))?;
                let assembled = self.assemble(grid, detection, classified)?;
                let detail = format!(
                    "{} line items, {} data points, {} anomalies",
                    assembled.statement.items().len(),
                    assembled.statement.data_points(),
                    assembled.anomalies.len()
                );
                state.assembled = Some(assembled);
                Ok(detail)
            }
            ParseStage::ComputingMetrics => {
                let detection = state
                    .detection
                    .as_ref()
                    .ok_or_else(|| missing(stage, ParseStage::DetectingPeriods))?;
                let assembled = state
                    .assembled
                    .as_ref()
                    .ok_or_else(|| missing(stage, ParseStage::Assembling))?;
                let metrics = self.compute_metrics(&assembled.statement, detection);
                let detail = format!("{} metrics", metrics.len());
                state.metrics = Some(metrics);
                Ok(detail)
            }
        }
    }

    pub fn run(
        &self,
        grid: &RawGrid,
        progress: Option<&UnboundedSender<ProgressEvent>>,
    ) -> Result<ParseOutcome> {
        self.run_named(grid, None, progress)
    }

    /// Parses the income statement sheet of `workbook`.
    pub fn run_workbook(
        &self,
        workbook: &Workbook,
        progress: Option<&UnboundedSender<ProgressEvent>>,
    ) -> Result<ParseOutcome> {
        let sheet = workbook
            .select_income_sheet(&self.config.workbook.income_sheet_keywords)
            .ok_or(ForgeError::EmptyWorkbook)?;
        info!("Parsing sheet '{}'", sheet.name);
        self.run_named(&sheet.grid, Some(sheet.name.clone()), progress)
    }

    fn run_named(
        &self,
        grid: &RawGrid,
        sheet_name: Option<String>,
        progress: Option<&UnboundedSender<ProgressEvent>>,
    ) -> Result<ParseOutcome> {
        let mut state = PartialParse::default();

        for stage in ParseStage::ALL {
            match self.run_stage(stage, grid, &mut state) {
                Ok(detail) => send_event(progress, ProgressEvent::StageCompleted { stage, detail }),
                Err(e) => {
                    send_event(
                        progress,
                        ProgressEvent::Failed {
                            code: e.code().to_string(),
                            reason: e.to_string(),
                        },
                    );
                    return Err(e);
                }
            }
        }

        let outcome = state.finish(sheet_name)?;
        send_event(
            progress,
            ProgressEvent::Completed {
                periods: outcome.detection.periods.len(),
                line_items: outcome.line_item_count(),
                anomalies: outcome.anomalies.len(),
            },
        );
        Ok(outcome)
    }
}

fn send_event(sender: Option<&UnboundedSender<ProgressEvent>>, event: ProgressEvent) {
    if let Some(tx) = sender {
        let _ = tx.send(event);
    }
}
