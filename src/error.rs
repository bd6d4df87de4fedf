use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForgeError {
    #[error("No period columns detected in the header rows")]
    NoPeriodsDetected,

    #[error("No usable line item rows: {0}")]
    NoUsableRows(String),

    #[error("Workbook has no sheets")]
    EmptyWorkbook,

    #[error("A parse job is already running for session '{0}'")]
    JobAlreadyRunning(String),

    #[error("No Tokio runtime is available to run the parse job")]
    NoRuntime,

    #[error("Parse job was cancelled")]
    Cancelled,

    #[error("Unknown period '{0}'")]
    UnknownPeriod(String),

    #[error("Parse job failed: {0}")]
    JobFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid alias table entry '{alias}': {details}")]
    InvalidAlias { alias: String, details: String },

    #[error("Invalid fiscal year end month {0}: must be between 1 and 12")]
    InvalidFiscalYearEndMonth(u32),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ForgeError {
    /// Short machine-readable reason, safe to show to callers.
    pub fn code(&self) -> &'static str {
        match self {
            ForgeError::NoPeriodsDetected => "no_periods_detected",
            ForgeError::NoUsableRows(_) => "no_usable_rows",
            ForgeError::EmptyWorkbook => "empty_workbook",
            ForgeError::JobAlreadyRunning(_) => "job_already_running",
            ForgeError::Cancelled => "cancelled",
            ForgeError::NoRuntime => "no_runtime",
            ForgeError::UnknownPeriod(_) => "unknown_period",
            ForgeError::JobFailed(_) => "job_failed",
            ForgeError::InvalidConfig(_) => "invalid_config",
            ForgeError::InvalidAlias { .. } => "invalid_alias",
            ForgeError::InvalidFiscalYearEndMonth(_) => "invalid_fiscal_year_end_month",
            ForgeError::SerializationError(_) => "serialization_error",
            ForgeError::IoError(_) => "io_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, ForgeError>;
