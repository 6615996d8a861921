// Typed validation errors for boundary checks
// Lower-level lookups (normalizer, taxonomy) represent absence as None and
// never surface errors; only structural invariant violations produce a
// ValidationError, and always before any mutation happens.

use thiserror::Error;

/// Validation failure for a single operation.
///
/// Each variant maps to one machine-readable reason code so callers can
/// surface a structured rejection instead of a generic exception.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Estimate item with start_month > end_month or a month below 1
    #[error("invalid month range: start {start_month} end {end_month}")]
    InvalidMonthRange { start_month: u32, end_month: u32 },

    /// Baseline resolved to zero estimate items (both storage shapes empty)
    #[error("baseline {baseline_id} has no estimate items")]
    EmptyBaseline { baseline_id: String },

    /// Change request with duration_months == 0
    #[error("change request duration must be at least 1 month, got {duration_months}")]
    InvalidDuration { duration_months: u32 },

    /// Change window extends past the baseline's total duration
    #[error(
        "change window out of range: start {start_month_index} + duration {duration_months} exceeds project duration {project_months}"
    )]
    ChangeWindowOutOfRange {
        start_month_index: u32,
        duration_months: u32,
        project_months: u32,
    },

    /// Change request names no affected category and no new-category request
    #[error("change request has no affected canonical ids and no new category request")]
    MissingChangeTarget,
}

impl ValidationError {
    /// Stable machine-readable reason code for API consumers.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ValidationError::InvalidMonthRange { .. } => "INVALID_MONTH_RANGE",
            ValidationError::EmptyBaseline { .. } => "EMPTY_BASELINE",
            ValidationError::InvalidDuration { .. } => "INVALID_DURATION",
            ValidationError::ChangeWindowOutOfRange { .. } => "CHANGE_WINDOW_OUT_OF_RANGE",
            ValidationError::MissingChangeTarget => "MISSING_CHANGE_TARGET",
        }
    }
}
