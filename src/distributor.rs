// ⚖️ Change/Adjustment Distributor - fans budget changes across months
// A change request carries an impact amount, a start month, a duration and a
// distribution mode. OneTime lands the full amount on the start month;
// SpreadEvenly divides it across the range with the rounding remainder folded
// into the last month, so the applied deltas always sum to the impact amount
// to the cent.

use crate::baseline::ProjectMetadata;
use crate::error::ValidationError;
use crate::expander::round2;
use crate::normalize::normalize;
use crate::store::AllocationRecord;
use serde::{Deserialize, Serialize};

fn new_change_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ============================================================================
// CHANGE REQUEST
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationMode {
    OneTime,
    SpreadEvenly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    #[default]
    Pending,
    Applied,
}

/// Request to open a cost line the baseline never had.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCategoryRequest {
    pub canonical_id: String,
    pub display_name: String,
}

/// Budget adjustment against existing allocations. Consumed once on
/// approval; re-approving an applied request is a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRequest {
    #[serde(default = "new_change_id")]
    pub change_id: String,

    pub impact_amount: f64,
    pub start_month_index: u32,
    pub duration_months: u32,
    pub allocation_mode: AllocationMode,

    #[serde(default)]
    pub affected_canonical_ids: Vec<String>,

    #[serde(default)]
    pub new_category_request: Option<NewCategoryRequest>,

    #[serde(default)]
    pub status: ChangeStatus,
}

impl ChangeRequest {
    /// Structural validation, always run before any cell is touched.
    pub fn validate(&self, project_months: u32) -> Result<(), ValidationError> {
        if self.duration_months < 1 {
            return Err(ValidationError::InvalidDuration {
                duration_months: self.duration_months,
            });
        }
        // Widened arithmetic: degenerate requests must come back as a
        // structured rejection, not an integer overflow
        let last_month =
            self.start_month_index as u64 + self.duration_months as u64 - 1;
        if self.start_month_index < 1 || last_month > project_months as u64 {
            return Err(ValidationError::ChangeWindowOutOfRange {
                start_month_index: self.start_month_index,
                duration_months: self.duration_months,
                project_months,
            });
        }
        if self.affected_canonical_ids.is_empty() && self.new_category_request.is_none() {
            return Err(ValidationError::MissingChangeTarget);
        }
        Ok(())
    }
}

// ============================================================================
// DISTRIBUTION
// ============================================================================

/// Per-month forecast deltas for one target category.
///
/// SpreadEvenly: each month gets `round2(impact / n)`, except the last, which
/// absorbs the rounding remainder so the series sums to exactly the impact.
fn month_deltas(change: &ChangeRequest) -> Vec<(u32, f64)> {
    match change.allocation_mode {
        AllocationMode::OneTime => vec![(change.start_month_index, round2(change.impact_amount))],
        AllocationMode::SpreadEvenly => {
            let n = change.duration_months;
            let per_month = round2(change.impact_amount / n as f64);
            let mut deltas = Vec::with_capacity(n as usize);
            for offset in 0..n {
                let month = change.start_month_index + offset;
                let delta = if offset == n - 1 {
                    round2(change.impact_amount - per_month * (n - 1) as f64)
                } else {
                    per_month
                };
                deltas.push((month, delta));
            }
            deltas
        }
    }
}

/// Apply a change request to the allocation cells, returning only the
/// mutated subset. Validates first; nothing is touched on rejection.
///
/// A cell missing for a target (always the case for a new-category request,
/// occasionally for sparse baselines) is created synthetically with zero
/// planned amount, so the forecast delta is never silently dropped.
pub fn distribute(
    change: &ChangeRequest,
    cells: &mut Vec<AllocationRecord>,
    metadata: &ProjectMetadata,
) -> Result<Vec<AllocationRecord>, ValidationError> {
    change.validate(metadata.duration_months)?;

    let mut target_ids: Vec<String> = change.affected_canonical_ids.clone();
    if let Some(new_cat) = &change.new_category_request {
        target_ids.push(new_cat.canonical_id.clone());
    }

    let deltas = month_deltas(change);
    let mut mutated_keys: Vec<String> = Vec::new();

    for target in &target_ids {
        for (month, delta) in &deltas {
            let existing = cells
                .iter_mut()
                .find(|c| &c.canonical_rubro_id == target && c.month_index == *month);

            match existing {
                Some(cell) => {
                    cell.forecast_amount = round2(cell.forecast_amount + delta);
                    mutated_keys.push(cell.store_key());
                }
                None => {
                    let cell = synthetic_cell(change, metadata, target, *month, *delta);
                    mutated_keys.push(cell.store_key());
                    cells.push(cell);
                }
            }
        }
    }

    let mutated = cells
        .iter()
        .filter(|c| mutated_keys.contains(&c.store_key()))
        .cloned()
        .collect();
    Ok(mutated)
}

/// Consume-once wrapper: applies a pending request and marks it, returning
/// an empty mutated subset when the request was already applied.
pub fn approve(
    change: &mut ChangeRequest,
    cells: &mut Vec<AllocationRecord>,
    metadata: &ProjectMetadata,
) -> Result<Vec<AllocationRecord>, ValidationError> {
    if change.status == ChangeStatus::Applied {
        return Ok(Vec::new());
    }
    let mutated = distribute(change, cells, metadata)?;
    change.status = ChangeStatus::Applied;
    Ok(mutated)
}

fn synthetic_cell(
    change: &ChangeRequest,
    metadata: &ProjectMetadata,
    canonical_id: &str,
    month: u32,
    delta: f64,
) -> AllocationRecord {
    let mut matching_ids = vec![normalize(canonical_id)];
    if let Some(new_cat) = &change.new_category_request {
        if new_cat.canonical_id == canonical_id {
            matching_ids.push(normalize(&new_cat.display_name));
        }
    }
    matching_ids.dedup();

    AllocationRecord {
        project_id: metadata.project_id.clone(),
        baseline_id: metadata.baseline_id.clone(),
        canonical_rubro_id: canonical_id.to_string(),
        month_index: month,
        planned_amount: 0.0,
        forecast_amount: delta,
        actual_amount: None,
        source_item_ref: None,
        matching_ids,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn metadata(duration: u32) -> ProjectMetadata {
        ProjectMetadata {
            project_id: "PROJ-001".to_string(),
            baseline_id: "BL-001".to_string(),
            start_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            duration_months: duration,
        }
    }

    fn cells_for(rubro: &str, months: std::ops::RangeInclusive<u32>, forecast: f64) -> Vec<AllocationRecord> {
        months
            .map(|month| AllocationRecord {
                project_id: "PROJ-001".to_string(),
                baseline_id: "BL-001".to_string(),
                canonical_rubro_id: rubro.to_string(),
                month_index: month,
                planned_amount: forecast,
                forecast_amount: forecast,
                actual_amount: None,
                source_item_ref: None,
                matching_ids: vec![rubro.to_lowercase()],
            })
            .collect()
    }

    fn spread(impact: f64, start: u32, duration: u32) -> ChangeRequest {
        ChangeRequest {
            change_id: "CR-1".to_string(),
            impact_amount: impact,
            start_month_index: start,
            duration_months: duration,
            allocation_mode: AllocationMode::SpreadEvenly,
            affected_canonical_ids: vec!["MOD-LEAD".to_string()],
            new_category_request: None,
            status: ChangeStatus::Pending,
        }
    }

    #[test]
    fn test_spread_evenly_remainder_on_last_month() {
        // 100000 over months 5..=7: 33333.33 + 33333.33 + 33333.34
        let mut cells = cells_for("MOD-LEAD", 1..=12, 0.0);
        let mutated = distribute(&spread(100000.0, 5, 3), &mut cells, &metadata(12)).unwrap();

        assert_eq!(mutated.len(), 3);
        let by_month: Vec<f64> = (5..=7)
            .map(|m| {
                cells
                    .iter()
                    .find(|c| c.month_index == m)
                    .unwrap()
                    .forecast_amount
            })
            .collect();
        assert_eq!(by_month, vec![33333.33, 33333.33, 33333.34]);

        let total: f64 = by_month.iter().sum();
        assert_eq!(round2(total), 100000.00);
    }

    #[test]
    fn test_spread_conservation_tiny_amounts() {
        // 0.01 over 3 months: per-month rounds to 0.00, last month takes it all
        let mut cells = cells_for("MOD-LEAD", 1..=3, 0.0);
        distribute(&spread(0.01, 1, 3), &mut cells, &metadata(3)).unwrap();

        let total: f64 = cells.iter().map(|c| c.forecast_amount).sum();
        assert_eq!(round2(total), 0.01);
        assert_eq!(cells[2].forecast_amount, 0.01);
    }

    #[test]
    fn test_one_time_applies_full_amount_once() {
        let mut cells = cells_for("MOD-LEAD", 1..=12, 1000.0);
        let mut change = spread(5000.0, 4, 1);
        change.allocation_mode = AllocationMode::OneTime;

        let mutated = distribute(&change, &mut cells, &metadata(12)).unwrap();
        assert_eq!(mutated.len(), 1);
        assert_eq!(mutated[0].month_index, 4);
        assert_eq!(mutated[0].forecast_amount, 6000.00);

        // Planned amounts never move; only forecasts do
        assert!(cells.iter().all(|c| c.planned_amount == 1000.0));
        assert_eq!(cells.iter().filter(|c| c.forecast_amount != 1000.0).count(), 1);
    }

    #[test]
    fn test_window_validation_fails_before_mutating() {
        let mut cells = cells_for("MOD-LEAD", 1..=12, 1000.0);
        // start 11 + duration 3 ends at month 13 > 12
        let err = distribute(&spread(9000.0, 11, 3), &mut cells, &metadata(12)).unwrap_err();
        assert_eq!(err.reason_code(), "CHANGE_WINDOW_OUT_OF_RANGE");
        assert!(cells.iter().all(|c| c.forecast_amount == 1000.0));
    }

    #[test]
    fn test_extreme_window_rejected_without_overflow() {
        // start + duration near u32::MAX must reject cleanly, never wrap
        let mut cells = cells_for("MOD-LEAD", 1..=12, 1000.0);
        for (start, duration) in [(u32::MAX, 2), (u32::MAX, u32::MAX), (2, u32::MAX)] {
            let err = distribute(&spread(100.0, start, duration), &mut cells, &metadata(12))
                .unwrap_err();
            assert_eq!(err.reason_code(), "CHANGE_WINDOW_OUT_OF_RANGE");
        }
        assert!(cells.iter().all(|c| c.forecast_amount == 1000.0));
    }

    #[test]
    fn test_zero_duration_rejected() {
        let mut cells = cells_for("MOD-LEAD", 1..=12, 0.0);
        let err = distribute(&spread(100.0, 1, 0), &mut cells, &metadata(12)).unwrap_err();
        assert_eq!(err.reason_code(), "INVALID_DURATION");
    }

    #[test]
    fn test_missing_target_rejected() {
        let mut cells = cells_for("MOD-LEAD", 1..=12, 0.0);
        let mut change = spread(100.0, 1, 2);
        change.affected_canonical_ids.clear();

        let err = distribute(&change, &mut cells, &metadata(12)).unwrap_err();
        assert_eq!(err.reason_code(), "MISSING_CHANGE_TARGET");
    }

    #[test]
    fn test_new_category_creates_synthetic_cells() {
        let mut cells: Vec<AllocationRecord> = Vec::new();
        let mut change = spread(3000.0, 2, 3);
        change.affected_canonical_ids.clear();
        change.new_category_request = Some(NewCategoryRequest {
            canonical_id: "SVC-SEC".to_string(),
            display_name: "Security Audit".to_string(),
        });

        let mutated = distribute(&change, &mut cells, &metadata(12)).unwrap();
        assert_eq!(mutated.len(), 3);
        assert_eq!(cells.len(), 3);
        for cell in &cells {
            assert_eq!(cell.canonical_rubro_id, "SVC-SEC");
            assert_eq!(cell.planned_amount, 0.0);
            assert_eq!(cell.forecast_amount, 1000.00);
            assert!(cell.matching_ids.contains(&"security-audit".to_string()));
        }
    }

    #[test]
    fn test_multiple_affected_categories() {
        let mut cells = cells_for("MOD-LEAD", 1..=6, 100.0);
        cells.extend(cells_for("QA-ENG", 1..=6, 100.0));

        let mut change = spread(600.0, 1, 6);
        change.affected_canonical_ids = vec!["MOD-LEAD".to_string(), "QA-ENG".to_string()];

        let mutated = distribute(&change, &mut cells, &metadata(6)).unwrap();
        // Each category receives the full spread
        assert_eq!(mutated.len(), 12);
        assert!(cells.iter().all(|c| c.forecast_amount == 200.00));
    }

    #[test]
    fn test_reapproval_is_noop() {
        let mut cells = cells_for("MOD-LEAD", 1..=12, 0.0);
        let mut change = spread(1200.0, 1, 12);

        let first = approve(&mut change, &mut cells, &metadata(12)).unwrap();
        assert_eq!(first.len(), 12);
        assert_eq!(change.status, ChangeStatus::Applied);
        let total_after_first: f64 = cells.iter().map(|c| c.forecast_amount).sum();

        let second = approve(&mut change, &mut cells, &metadata(12)).unwrap();
        assert!(second.is_empty());
        let total_after_second: f64 = cells.iter().map(|c| c.forecast_amount).sum();
        assert_eq!(total_after_first, total_after_second);
    }

    #[test]
    fn test_distribute_returns_only_mutated_subset() {
        let mut cells = cells_for("MOD-LEAD", 1..=12, 50.0);
        let mutated = distribute(&spread(300.0, 3, 3), &mut cells, &metadata(12)).unwrap();

        assert_eq!(mutated.len(), 3);
        let months: Vec<u32> = mutated.iter().map(|c| c.month_index).collect();
        assert_eq!(months, vec![3, 4, 5]);
    }
}
