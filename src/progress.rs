use serde::{Deserialize, Serialize};
use std::fmt;

/// Substrings every successful terminal line carries. Watchers that predate the
/// structured events look for these literally.
pub const PARSE_COMPLETE_MARKER: &str = "parse complete";
pub const PARSING_DONE_MARKER: &str = "income statement parsing done";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ParseStage {
    DetectingPeriods,
    ClassifyingRows,
    Assembling,
    ComputingMetrics,
}

impl ParseStage {
    pub const ALL: [ParseStage; 4] = [
        ParseStage::DetectingPeriods,
        ParseStage::ClassifyingRows,
        ParseStage::Assembling,
        ParseStage::ComputingMetrics,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            ParseStage::DetectingPeriods => "detecting periods",
            ParseStage::ClassifyingRows => "classifying rows",
            ParseStage::Assembling => "assembling statement",
            ParseStage::ComputingMetrics => "computing metrics",
        }
    }
}

impl fmt::Display for ParseStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started {
        job_id: String,
    },
    StageCompleted {
        stage: ParseStage,
        detail: String,
    },
    Completed {
        periods: usize,
        line_items: usize,
        anomalies: usize,
    },
    Failed {
        code: String,
        reason: String,
    },
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Completed { .. } | ProgressEvent::Failed { .. }
        )
    }

    /// Plain-text rendering for line-oriented progress consumers.
    pub fn to_line(&self) -> String {
        match self {
            ProgressEvent::Started { job_id } => format!("Parse job {} started.", job_id),
            ProgressEvent::StageCompleted { stage, detail } if detail.is_empty() => {
                format!("Finished {}.", stage)
            }
            ProgressEvent::StageCompleted { stage, detail } => {
                format!("Finished {}: {}.", stage, detail)
            }
            ProgressEvent::Completed {
                periods,
                line_items,
                anomalies,
            } => format!(
                "Parse complete: {} periods, {} line items, {} anomalies. Income Statement parsing done.",
                periods, line_items, anomalies
            ),
            ProgressEvent::Failed { code, reason } => {
                format!("Parse failed ({}): {}", code, reason)
            }
        }
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

/// True for the success line of a finished parse.
pub fn is_completion_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    lower.contains(PARSE_COMPLETE_MARKER) && lower.contains(PARSING_DONE_MARKER)
}
