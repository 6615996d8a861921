// Finz Baseline - Core Library
// Baseline materialization and canonical cost-taxonomy resolution:
// takes a PMO cost baseline (freeform labor/non-labor line items),
// expands it into dated monthly allocation records keyed by a stable
// canonical category, then reconciles vendor invoices and budget
// changes against those allocations.

pub mod normalize;   // Key Normalizer - single point of truth for folding
pub mod error;       // Typed validation errors with reason codes
pub mod taxonomy;    // Canonical Taxonomy Index + TTL cache
pub mod baseline;    // Estimate items + two-shape ingestion shim
pub mod expander;    // Baseline Expander (materializer)
pub mod store;       // Allocation store + idempotent upsert writer
pub mod matcher;     // Invoice-to-Forecast Matcher
pub mod distributor; // Change/Adjustment Distributor

// Re-export commonly used types
pub use normalize::normalize;
pub use error::ValidationError;
pub use taxonomy::{
    load_catalog, AliasEntry, CanonicalCostCategory, CostType, MatchConfidence, Resolution,
    TaxonomyCache, TaxonomyIndex, UNMAPPED_ID,
};
pub use baseline::{
    BaselineDocument, BaselineEstimateItem, LaborEstimate, NonLaborEstimate, ProjectMetadata,
};
pub use expander::{expand_items, materialize, round2, ExpansionReport};
pub use store::{
    upsert_allocations, AllocationRecord, AllocationStore, MemoryStore, SqliteStore, UpsertError,
    UpsertOptions, UpsertSummary,
};
pub use matcher::{
    load_invoices_csv, match_invoices, parse_invoice_month, InvoiceMonth, InvoiceRecord,
    MatchContext, MatchReport, MatchStrategy, MatchedPair, UnmatchedInvoice, UnmatchedReason,
};
pub use distributor::{
    approve, distribute, AllocationMode, ChangeRequest, ChangeStatus, NewCategoryRequest,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
