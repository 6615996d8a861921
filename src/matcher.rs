// 🧾 Invoice-to-Forecast Matcher - reconciles vendor invoices into cells
// Each invoice is resolved against the materialized allocation cells through
// four strategies in strict precedence order, stopping at the first hit:
//   1. ExactIdentifier - any identifier field vs the cell's canonical id
//   2. AliasSet        - the cell's precomputed matching_ids synonym set
//   3. Canonical       - taxonomy resolution of the identifier
//   4. Description     - normalized free-text equality/substring, last resort
// Matching never crosses project boundaries, and month alignment is always
// required. Unmatched invoices are diagnostics, not errors.

use crate::normalize::normalize;
use crate::store::AllocationRecord;
use crate::taxonomy::TaxonomyIndex;
use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

// ============================================================================
// INVOICE RECORD
// ============================================================================

fn new_invoice_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// External vendor invoice line. Immutable after upload; the matcher only
/// reads it. Legacy uploads populate any of four identifier fields for
/// "the same" concept, so access goes through `identifier_candidates()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRecord {
    #[serde(default = "new_invoice_id")]
    pub invoice_id: String,

    pub project_id: String,

    #[serde(default)]
    pub line_item_id: Option<String>,
    #[serde(default)]
    pub rubro_id: Option<String>,
    #[serde(default)]
    pub linea_codigo: Option<String>,
    #[serde(default)]
    pub linea_id: Option<String>,

    #[serde(default)]
    pub description: String,

    pub amount: f64,

    /// Raw month as uploaded: "YYYY-MM", "YYYY-MM-DD", ISO datetime, or "M<n>"
    pub invoice_month: String,

    #[serde(default)]
    pub vendor: String,
}

impl InvoiceRecord {
    /// Identifier field variants in precedence order, skipping blanks.
    /// This ordered list IS the matching contract for strategies 1-3.
    pub fn identifier_candidates(&self) -> Vec<&str> {
        [
            self.line_item_id.as_deref(),
            self.rubro_id.as_deref(),
            self.linea_codigo.as_deref(),
            self.linea_id.as_deref(),
        ]
        .into_iter()
        .flatten()
        .filter(|s| !s.trim().is_empty())
        .collect()
    }
}

/// Load invoices from a CSV upload.
pub fn load_invoices_csv(path: &Path) -> Result<Vec<InvoiceRecord>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("opening invoice file {}", path.display()))?;
    let mut invoices = Vec::new();
    for row in reader.deserialize() {
        let invoice: InvoiceRecord = row.context("parsing invoice row")?;
        invoices.push(invoice);
    }
    Ok(invoices)
}

// ============================================================================
// INVOICE MONTH
// ============================================================================

/// Parsed invoice month. Calendar months need the project start date to be
/// converted into a project-relative index; "M<n>" is already relative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceMonth {
    Calendar { year: i32, month: u32 },
    ProjectRelative(u32),
}

/// Parse the supported month formats: `YYYY-MM`, `YYYY-MM-DD`, ISO datetime,
/// and `M<n>`. Returns None for anything else.
pub fn parse_invoice_month(raw: &str) -> Option<InvoiceMonth> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    // M<n>: project-relative month index
    if let Some(rest) = raw.strip_prefix('M').or_else(|| raw.strip_prefix('m')) {
        if let Ok(n) = rest.parse::<u32>() {
            if n >= 1 {
                return Some(InvoiceMonth::ProjectRelative(n));
            }
        }
        return None;
    }

    // YYYY-MM-DD / ISO datetime
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(InvoiceMonth::Calendar {
            year: date.year(),
            month: date.month(),
        });
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(InvoiceMonth::Calendar {
            year: dt.year(),
            month: dt.month(),
        });
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(InvoiceMonth::Calendar {
            year: dt.year(),
            month: dt.month(),
        });
    }

    // YYYY-MM
    if let Some((y, m)) = raw.split_once('-') {
        if let (Ok(year), Ok(month)) = (y.parse::<i32>(), m.parse::<u32>()) {
            if (1..=12).contains(&month) && y.len() == 4 {
                return Some(InvoiceMonth::Calendar { year, month });
            }
        }
    }

    None
}

// ============================================================================
// MATCH CONTEXT + REPORT
// ============================================================================

/// Per-project matching context.
///
/// With `start_date` present, calendar invoice months are converted to
/// project-relative indexes and window-checked. Without it the matcher falls
/// back to comparing calendar months 1-12 - a deliberate, labeled fallback
/// that is only sound for single-year baselines.
#[derive(Debug, Clone)]
pub struct MatchContext {
    pub project_id: String,
    pub start_date: Option<NaiveDate>,

    /// Project window for month validation; 0 disables the window check
    pub duration_months: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrategy {
    ExactIdentifier,
    AliasSet,
    Canonical,
    Description,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchedPair {
    pub invoice_id: String,
    pub store_key: String,
    pub canonical_rubro_id: String,
    pub month_index: u32,
    pub amount: f64,
    pub strategy: MatchStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmatchedReason {
    ProjectMismatch,
    UnparseableMonth,
    MonthOutOfWindow,
    NoCellMatch,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnmatchedInvoice {
    pub invoice_id: String,
    pub reason: UnmatchedReason,
    pub detail: String,
}

#[derive(Debug, Clone, Default)]
pub struct MatchReport {
    pub matched: Vec<MatchedPair>,
    pub unmatched: Vec<UnmatchedInvoice>,
}

impl MatchReport {
    pub fn total_matched_amount(&self) -> f64 {
        self.matched.iter().map(|m| m.amount).sum()
    }

    /// Distinct store keys touched by the matched pairs, in first-match
    /// order. Several invoices may land on one cell; persisting by these
    /// keys writes each mutated cell once.
    pub fn touched_store_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::new();
        for pair in &self.matched {
            if !keys.contains(&pair.store_key.as_str()) {
                keys.push(pair.store_key.as_str());
            }
        }
        keys
    }
}

// ============================================================================
// MATCHING
// ============================================================================

/// How the invoice's month is compared against cells.
#[derive(Debug, Clone, Copy)]
enum MonthTarget {
    Relative(u32),
    /// Calendar-only fallback: compare against the cell's calendar month
    CalendarOnly(u32),
}

impl MonthTarget {
    fn matches(&self, cell: &AllocationRecord) -> bool {
        match self {
            MonthTarget::Relative(n) => cell.month_index == *n,
            MonthTarget::CalendarOnly(m) => ((cell.month_index - 1) % 12) + 1 == *m,
        }
    }
}

/// Match invoices against allocation cells, accumulating actual spend.
///
/// A matched cell's `actual_amount` sums across invoices (several invoices
/// may land on the same category and month). Unmatched invoices come back
/// with a reason for manual reconciliation.
pub fn match_invoices(
    invoices: &[InvoiceRecord],
    cells: &mut [AllocationRecord],
    taxonomy: &TaxonomyIndex,
    ctx: &MatchContext,
) -> MatchReport {
    let mut report = MatchReport::default();

    for invoice in invoices {
        // Hard guard: invoices never cross project boundaries
        if invoice.project_id != ctx.project_id {
            report.unmatched.push(UnmatchedInvoice {
                invoice_id: invoice.invoice_id.clone(),
                reason: UnmatchedReason::ProjectMismatch,
                detail: format!(
                    "invoice project {} vs context {}",
                    invoice.project_id, ctx.project_id
                ),
            });
            continue;
        }

        let Some(month) = parse_invoice_month(&invoice.invoice_month) else {
            report.unmatched.push(UnmatchedInvoice {
                invoice_id: invoice.invoice_id.clone(),
                reason: UnmatchedReason::UnparseableMonth,
                detail: format!("unparseable invoice month {:?}", invoice.invoice_month),
            });
            continue;
        };

        let target = match resolve_month_target(month, ctx) {
            Ok(target) => target,
            Err(detail) => {
                report.unmatched.push(UnmatchedInvoice {
                    invoice_id: invoice.invoice_id.clone(),
                    reason: UnmatchedReason::MonthOutOfWindow,
                    detail,
                });
                continue;
            }
        };

        match find_cell(invoice, cells, taxonomy, target) {
            Some((idx, strategy)) => {
                let cell = &mut cells[idx];
                cell.actual_amount = Some(cell.actual_amount.unwrap_or(0.0) + invoice.amount);
                debug!(
                    invoice = %invoice.invoice_id,
                    cell = %cell.store_key(),
                    strategy = ?strategy,
                    "invoice matched"
                );
                report.matched.push(MatchedPair {
                    invoice_id: invoice.invoice_id.clone(),
                    store_key: cell.store_key(),
                    canonical_rubro_id: cell.canonical_rubro_id.clone(),
                    month_index: cell.month_index,
                    amount: invoice.amount,
                    strategy,
                });
            }
            None => {
                report.unmatched.push(UnmatchedInvoice {
                    invoice_id: invoice.invoice_id.clone(),
                    reason: UnmatchedReason::NoCellMatch,
                    detail: format!(
                        "no cell for ids {:?} / {:?}",
                        invoice.identifier_candidates(),
                        invoice.description
                    ),
                });
            }
        }
    }

    report
}

fn resolve_month_target(month: InvoiceMonth, ctx: &MatchContext) -> std::result::Result<MonthTarget, String> {
    let in_window = |index: i64| -> bool {
        index >= 1 && (ctx.duration_months == 0 || index <= ctx.duration_months as i64)
    };

    match month {
        InvoiceMonth::ProjectRelative(n) => {
            if in_window(n as i64) {
                Ok(MonthTarget::Relative(n))
            } else {
                Err(format!(
                    "relative month M{} outside project window of {} months",
                    n, ctx.duration_months
                ))
            }
        }
        InvoiceMonth::Calendar { year, month } => match ctx.start_date {
            Some(start) => {
                let index = (year as i64 - start.year() as i64) * 12 + month as i64
                    - start.month() as i64
                    + 1;
                if in_window(index) {
                    Ok(MonthTarget::Relative(index as u32))
                } else {
                    Err(format!(
                        "calendar month {year}-{month:02} maps to project month {index}, outside window of {} months",
                        ctx.duration_months
                    ))
                }
            }
            // Single-year fallback: no start date, compare calendar months
            None => Ok(MonthTarget::CalendarOnly(month)),
        },
    }
}

/// Apply the four matching strategies in precedence order. Each strategy
/// scans every month-aligned cell before the next, lower-confidence one runs.
fn find_cell(
    invoice: &InvoiceRecord,
    cells: &[AllocationRecord],
    taxonomy: &TaxonomyIndex,
    target: MonthTarget,
) -> Option<(usize, MatchStrategy)> {
    let candidates: Vec<String> = invoice
        .identifier_candidates()
        .iter()
        .map(|c| normalize(c))
        .filter(|c| !c.is_empty())
        .collect();

    // 1. Exact identifier vs the cell's canonical id
    for (i, cell) in cells.iter().enumerate() {
        if !target.matches(cell) {
            continue;
        }
        let cell_id = normalize(&cell.canonical_rubro_id);
        if candidates.iter().any(|c| *c == cell_id) {
            return Some((i, MatchStrategy::ExactIdentifier));
        }
    }

    // 2. Precomputed matching_ids alias set
    for (i, cell) in cells.iter().enumerate() {
        if !target.matches(cell) {
            continue;
        }
        if candidates.iter().any(|c| cell.matching_ids.contains(c)) {
            return Some((i, MatchStrategy::AliasSet));
        }
    }

    // 3. Canonical taxonomy resolution of the identifier
    for candidate in invoice.identifier_candidates() {
        if let Some(res) = taxonomy.resolve(candidate) {
            for (i, cell) in cells.iter().enumerate() {
                if target.matches(cell) && cell.canonical_rubro_id == res.category.canonical_id {
                    return Some((i, MatchStrategy::Canonical));
                }
            }
        }
    }

    // 4. Normalized description equality/substring, lowest confidence.
    // Short descriptions are too ambiguous to trust here.
    let desc = normalize(&invoice.description);
    if desc.len() >= 4 {
        for (i, cell) in cells.iter().enumerate() {
            if !target.matches(cell) {
                continue;
            }
            let hit = cell
                .matching_ids
                .iter()
                .any(|id| id == &desc || id.contains(&desc) || desc.contains(id.as_str()));
            if hit {
                return Some((i, MatchStrategy::Description));
            }
        }
    }

    None
}

// ============================================================================
// TESTS
// ============================================================================
