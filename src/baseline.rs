// 📋 Baseline estimate items + ingestion shim
// A baseline is an approved snapshot of planned costs: labor line items
// (rate × hours × FTE) and non-labor line items (one-time or recurring),
// each active over an inclusive 1-based month range.

use crate::error::ValidationError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ============================================================================
// ESTIMATE ITEMS
// ============================================================================

/// One labor line item from a PMO baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaborEstimate {
    /// Freeform role label as the PMO typed it (e.g. "Ingeniero Delivery")
    pub role: String,

    /// Seniority level, sometimes needed to disambiguate the role
    #[serde(default)]
    pub level: String,

    pub hourly_rate: f64,
    pub hours_per_month: f64,
    pub fte_count: f64,

    /// Employer on-costs as a percentage on top of the raw rate
    #[serde(default)]
    pub on_cost_percentage: f64,

    /// Precomputed total for the whole engagement; when present together
    /// with `duration_months` it takes priority over the rate formula
    #[serde(default)]
    pub total_cost: Option<f64>,
    #[serde(default)]
    pub duration_months: Option<u32>,

    pub start_month: u32,
    pub end_month: u32,
}

/// One non-labor line item (infrastructure, licenses, services, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NonLaborEstimate {
    pub description: String,

    #[serde(default)]
    pub category: String,

    pub amount: f64,

    /// true: flat monthly charge repeated every month in range.
    /// false: one-time cost landing entirely on `start_month`.
    pub recurring: bool,

    pub start_month: u32,
    pub end_month: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BaselineEstimateItem {
    Labor(LaborEstimate),
    NonLabor(NonLaborEstimate),
}

impl BaselineEstimateItem {
    pub fn start_month(&self) -> u32 {
        match self {
            BaselineEstimateItem::Labor(l) => l.start_month,
            BaselineEstimateItem::NonLabor(n) => n.start_month,
        }
    }

    pub fn end_month(&self) -> u32 {
        match self {
            BaselineEstimateItem::Labor(l) => l.end_month,
            BaselineEstimateItem::NonLabor(n) => n.end_month,
        }
    }

    /// The label shown in diagnostics for this item.
    pub fn label(&self) -> &str {
        match self {
            BaselineEstimateItem::Labor(l) => &l.role,
            BaselineEstimateItem::NonLabor(n) => &n.description,
        }
    }

    /// Month-range invariant: `1 <= start_month <= end_month`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let (start, end) = (self.start_month(), self.end_month());
        if start < 1 || end < start {
            return Err(ValidationError::InvalidMonthRange {
                start_month: start,
                end_month: end,
            });
        }
        Ok(())
    }
}

// ============================================================================
// PROJECT METADATA
// ============================================================================

/// Project-level context the expander and matcher need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectMetadata {
    pub project_id: String,
    pub baseline_id: String,

    /// Calendar date of project month 1
    pub start_date: NaiveDate,

    /// Total baseline duration; month indexes beyond this are out of window
    pub duration_months: u32,
}

// ============================================================================
// BASELINE DOCUMENT (two-shape compatibility shim)
// ============================================================================

/// Raw baseline as it comes out of storage.
///
/// COMPATIBILITY SHIM: a data-migration artifact left the same logical
/// baseline reachable through two records - a metadata-scoped one embedding
/// its own estimate list, and the baseline's own top-level list - and the
/// two payloads can disagree. The rule lives here at the ingestion boundary,
/// not in the expander: prefer the metadata-scoped estimates, fall back to
/// the top-level list when the scoped list is absent or empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineDocument {
    pub metadata: ProjectMetadata,

    /// Estimates embedded in the metadata-scoped storage record
    #[serde(default)]
    pub metadata_estimates: Option<Vec<BaselineEstimateItem>>,

    /// The baseline record's own top-level estimates
    #[serde(default)]
    pub estimates: Vec<BaselineEstimateItem>,
}

impl BaselineDocument {
    /// Apply the two-step fallback and validate every surviving item.
    pub fn effective_estimates(&self) -> Result<&[BaselineEstimateItem], ValidationError> {
        let items: &[BaselineEstimateItem] = match &self.metadata_estimates {
            Some(scoped) if !scoped.is_empty() => scoped,
            _ => &self.estimates,
        };

        if items.is_empty() {
            return Err(ValidationError::EmptyBaseline {
                baseline_id: self.metadata.baseline_id.clone(),
            });
        }

        for item in items {
            item.validate()?;
        }

        Ok(items)
    }
}

// ============================================================================
// TESTS
// ============================================================================
