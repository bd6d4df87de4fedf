use crate::error::{ForgeError, Result};
use crate::utils::validate_fiscal_year_end_month;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Tunables for the extraction pipeline.
///
/// Every field has a default, so a partial JSON document only overrides the keys it
/// names and the rest keep their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(default)]
pub struct ForgeConfig {
    #[schemars(description = "Settings for period detection and header scanning")]
    pub periods: PeriodSettings,

    #[schemars(description = "Thresholds for matching row labels to canonical line items")]
    pub classification: ClassificationSettings,

    #[schemars(description = "Sign normalization and subtotal reconciliation settings")]
    pub assembly: AssemblySettings,

    #[schemars(description = "Workbook level preferences such as which sheet to parse")]
    pub workbook: WorkbookSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(default)]
pub struct PeriodSettings {
    #[schemars(description = "Month the fiscal year ends in (1 = January, 12 = December)")]
    pub fiscal_year_end_month: u32,

    #[schemars(description = "A row qualifies as the header row once it holds this many period labels")]
    pub min_header_periods: usize,

    #[schemars(description = "Maximum number of rows scanned when looking for the header row")]
    pub header_scan_rows: usize,

    #[schemars(description = "Dates at least this many days apart are treated as yearly periods")]
    pub yearly_gap_days: i64,
}

impl Default for PeriodSettings {
    fn default() -> Self {
        Self {
            fiscal_year_end_month: 12,
            min_header_periods: 2,
            header_scan_rows: 50,
            yearly_gap_days: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(default)]
pub struct ClassificationSettings {
    #[schemars(description = "Minimum token overlap score (0-1) for the second matching tier")]
    pub token_overlap_threshold: f64,

    #[schemars(description = "Minimum edit distance similarity (0-1) for the third matching tier")]
    pub edit_similarity_threshold: f64,

    #[schemars(description = "Minimum length of a label token treated as an abbreviation")]
    pub min_abbreviation_len: usize,
}

impl Default for ClassificationSettings {
    fn default() -> Self {
        Self {
            token_overlap_threshold: 0.6,
            edit_similarity_threshold: 0.75,
            min_abbreviation_len: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(default)]
pub struct AssemblySettings {
    #[schemars(description = "Relative subtotal tolerance as a fraction of the larger magnitude")]
    pub relative_tolerance: f64,

    #[schemars(description = "Absolute floor on the subtotal tolerance, avoids false positives near zero")]
    pub absolute_tolerance: f64,

    #[schemars(description = "Fill a missing subtotal with the value computed from its components")]
    pub fill_missing_subtotals: bool,

    #[schemars(description = "Row labels (normalized) that carry sheet metadata rather than line items")]
    pub metadata_row_labels: Vec<String>,
}

impl Default for AssemblySettings {
    fn default() -> Self {
        Self {
            relative_tolerance: 0.01,
            absolute_tolerance: 0.5,
            fill_missing_subtotals: false,
            metadata_row_labels: vec![
                "for the fiscal period ending".to_string(),
                "currency".to_string(),
                "income statement".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(default)]
pub struct WorkbookSettings {
    #[schemars(description = "Sheet name keywords (case-insensitive) preferred for the income statement")]
    pub income_sheet_keywords: Vec<String>,

    #[schemars(description = "Label of a marker row that precedes the statement header, if present")]
    pub statement_marker: String,
}

impl Default for WorkbookSettings {
    fn default() -> Self {
        Self {
            income_sheet_keywords: vec!["income".to_string()],
            statement_marker: "income statement".to_string(),
        }
    }
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            periods: PeriodSettings::default(),
            classification: ClassificationSettings::default(),
            assembly: AssemblySettings::default(),
            workbook: WorkbookSettings::default(),
        }
    }
}

impl ForgeConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ForgeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        let schema = schemars::schema_for!(ForgeConfig);
        serde_json::to_string_pretty(&schema)
    }

    pub fn validate(&self) -> Result<()> {
        validate_fiscal_year_end_month(self.periods.fiscal_year_end_month)?;

        if self.periods.min_header_periods == 0 {
            return Err(ForgeError::InvalidConfig(
                "periods.min_header_periods must be at least 1".to_string(),
            ));
        }

        for (name, value) in [
            (
                "classification.token_overlap_threshold",
                self.classification.token_overlap_threshold,
            ),
            (
                "classification.edit_similarity_threshold",
                self.classification.edit_similarity_threshold,
            ),
            ("assembly.relative_tolerance", self.assembly.relative_tolerance),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ForgeError::InvalidConfig(format!(
                    "{} must be between 0.0 and 1.0, got {}",
                    name, value
                )));
            }
        }

        if self.assembly.absolute_tolerance < 0.0 {
            return Err(ForgeError::InvalidConfig(format!(
                "assembly.absolute_tolerance must not be negative, got {}",
                self.assembly.absolute_tolerance
            )));
        }

        Ok(())
    }
}
