// 📆 Baseline Expander - materializes estimates into monthly allocations
// Pure fan-out: one AllocationRecord per (estimate item × active month),
// each tagged with its canonical cost category. No I/O in here; persistence
// is the store writer's job.

use crate::baseline::{BaselineDocument, BaselineEstimateItem, LaborEstimate, NonLaborEstimate, ProjectMetadata};
use crate::error::ValidationError;
use crate::normalize::normalize;
use crate::store::AllocationRecord;
use crate::taxonomy::TaxonomyIndex;
use sha2::{Digest, Sha256};
use tracing::warn;

/// Month horizon beyond which an estimate is flagged as a data-quality
/// warning. Not a rejection: multi-year baselines are supported.
const LONG_HORIZON_MONTHS: u32 = 60;

/// Round a currency value to 2 decimals, half-up, at the point of
/// computation. Downstream code never re-rounds (avoids cumulative drift).
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ============================================================================
// EXPANSION REPORT
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct ExpansionReport {
    pub records: Vec<AllocationRecord>,

    /// Items whose label resolved to the UNMAPPED sentinel. Surfaced as an
    /// operator diagnostic, never a failure.
    pub unmapped_items: usize,

    /// Items extending past the 60-month horizon
    pub long_horizon_items: usize,
}

// ============================================================================
// MATERIALIZATION
// ============================================================================

/// Expand a baseline document: apply the two-shape ingestion fallback,
/// validate month ranges, then fan out.
pub fn materialize(
    doc: &BaselineDocument,
    taxonomy: &TaxonomyIndex,
) -> Result<ExpansionReport, ValidationError> {
    let items = doc.effective_estimates()?;
    Ok(expand_items(items, &doc.metadata, taxonomy))
}

/// Fan validated estimate items out into one record per active month.
///
/// Degenerate inputs (zero rate, zero FTE) still emit zero-amount records:
/// the absence of a record means something different from a zero-cost month,
/// and downstream month-completeness assumptions depend on the distinction.
pub fn expand_items(
    items: &[BaselineEstimateItem],
    metadata: &ProjectMetadata,
    taxonomy: &TaxonomyIndex,
) -> ExpansionReport {
    let mut report = ExpansionReport::default();

    for item in items {
        if item.end_month() > LONG_HORIZON_MONTHS {
            warn!(
                label = %item.label(),
                end_month = item.end_month(),
                "estimate extends past the 60-month horizon"
            );
            report.long_horizon_items += 1;
        }

        match item {
            BaselineEstimateItem::Labor(labor) => {
                expand_labor(labor, item, metadata, taxonomy, &mut report)
            }
            BaselineEstimateItem::NonLabor(non_labor) => {
                expand_non_labor(non_labor, item, metadata, taxonomy, &mut report)
            }
        }
    }

    report
}

fn expand_labor(
    labor: &LaborEstimate,
    item: &BaselineEstimateItem,
    metadata: &ProjectMetadata,
    taxonomy: &TaxonomyIndex,
    report: &mut ExpansionReport,
) {
    // Resolution chain: role alone, then level-qualified role, then sentinel
    let category = match taxonomy.resolve(&labor.role) {
        Some(res) => res.category.clone(),
        None => {
            let qualified = format!("{} {}", labor.level, labor.role);
            match taxonomy.resolve(&qualified) {
                Some(res) => res.category.clone(),
                None => {
                    report.unmapped_items += 1;
                    taxonomy.resolve_or_unmapped(&labor.role).clone()
                }
            }
        }
    };

    let monthly = monthly_labor_amount(labor);
    let fingerprint = source_fingerprint(item);

    for month in labor.start_month..=labor.end_month {
        report.records.push(build_record(
            metadata,
            &category.canonical_id,
            &labor.role,
            month,
            monthly,
            &fingerprint,
        ));
    }
}

/// Monthly labor amount, in priority order:
/// (a) precomputed total spread over an explicit duration;
/// (b) rate × hours × FTE, grossed up by on-costs.
fn monthly_labor_amount(labor: &LaborEstimate) -> f64 {
    if let (Some(total), Some(duration)) = (labor.total_cost, labor.duration_months) {
        if duration > 0 {
            return round2(total / duration as f64);
        }
    }

    if labor.hourly_rate <= 0.0 || labor.fte_count <= 0.0 {
        return 0.0;
    }

    round2(
        labor.hourly_rate
            * labor.hours_per_month
            * labor.fte_count
            * (1.0 + labor.on_cost_percentage / 100.0),
    )
}

fn expand_non_labor(
    non_labor: &NonLaborEstimate,
    item: &BaselineEstimateItem,
    metadata: &ProjectMetadata,
    taxonomy: &TaxonomyIndex,
    report: &mut ExpansionReport,
) {
    let category = match taxonomy.resolve(&non_labor.description) {
        Some(res) => res.category.clone(),
        None => match taxonomy.resolve(&non_labor.category) {
            Some(res) => res.category.clone(),
            None => {
                report.unmapped_items += 1;
                taxonomy.resolve_or_unmapped(&non_labor.description).clone()
            }
        },
    };

    let amount = round2(non_labor.amount);
    let fingerprint = source_fingerprint(item);

    if non_labor.recurring {
        // Flat monthly charge: the full amount repeats, it is never divided
        for month in non_labor.start_month..=non_labor.end_month {
            report.records.push(build_record(
                metadata,
                &category.canonical_id,
                &non_labor.description,
                month,
                amount,
                &fingerprint,
            ));
        }
    } else {
        // One-time cost lands entirely on the start month
        report.records.push(build_record(
            metadata,
            &category.canonical_id,
            &non_labor.description,
            non_labor.start_month,
            amount,
            &fingerprint,
        ));
    }
}

fn build_record(
    metadata: &ProjectMetadata,
    canonical_id: &str,
    source_label: &str,
    month: u32,
    amount: f64,
    fingerprint: &str,
) -> AllocationRecord {
    let mut record = AllocationRecord {
        project_id: metadata.project_id.clone(),
        baseline_id: metadata.baseline_id.clone(),
        canonical_rubro_id: canonical_id.to_string(),
        month_index: month,
        planned_amount: amount,
        forecast_amount: amount,
        actual_amount: None,
        source_item_ref: Some(fingerprint.to_string()),
        matching_ids: Vec::new(),
    };

    // Every synonym the invoice matcher may see for this cell's identity:
    // the normalized source label, the canonical id, and the synthetic
    // store key itself.
    let mut matching_ids = vec![normalize(source_label), normalize(canonical_id)];
    matching_ids.push(normalize(&record.store_key()));
    matching_ids.dedup();
    record.matching_ids = matching_ids;

    record
}

/// Stable fingerprint of the originating estimate item. Diagnostics only.
fn source_fingerprint(item: &BaselineEstimateItem) -> String {
    let kind = match item {
        BaselineEstimateItem::Labor(_) => "labor",
        BaselineEstimateItem::NonLabor(_) => "non_labor",
    };
    let mut hasher = Sha256::new();
    hasher.update(format!(
        "{}|{}|{}|{}",
        kind,
        item.label(),
        item.start_month(),
        item.end_month()
    ));
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// TESTS
// ============================================================================
