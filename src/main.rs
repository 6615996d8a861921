// Finz Baseline CLI - materialize baselines, reconcile invoices, apply changes
// Thin shell over the library: loads value objects from JSON/CSV, talks to a
// SQLite-backed allocation store, prints operation summaries.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;

use finz_baseline::{
    approve, load_catalog, load_invoices_csv, match_invoices, materialize, upsert_allocations,
    AllocationStore, BaselineDocument, ChangeRequest, MatchContext, SqliteStore, TaxonomyIndex,
    UpsertOptions,
};

#[derive(Parser)]
#[command(name = "finz-baseline", version, about = "Baseline materialization and reconciliation")]
struct Cli {
    /// SQLite allocation store path
    #[arg(long, global = true, default_value = "allocations.db")]
    db: PathBuf,

    /// Optional catalog JSON (categories + aliases); built-in seed otherwise
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Expand a baseline into monthly allocation records and upsert them
    Materialize {
        /// Baseline document (JSON)
        #[arg(long)]
        baseline: PathBuf,

        /// Rewrite cells whose stored value is exactly zero (partial-failure recovery)
        #[arg(long)]
        force_rewrite_zeros: bool,

        /// Delete the baseline's stored records first (explicit re-materialization)
        #[arg(long)]
        reset: bool,
    },

    /// Match uploaded invoices against stored allocations and record actuals
    MatchInvoices {
        /// Baseline document (JSON), for project metadata
        #[arg(long)]
        baseline: PathBuf,

        /// Invoice upload (CSV)
        #[arg(long)]
        invoices: PathBuf,
    },

    /// Apply an approved change request to stored allocations
    Distribute {
        /// Baseline document (JSON), for project metadata
        #[arg(long)]
        baseline: PathBuf,

        /// Change request (JSON)
        #[arg(long)]
        change: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let taxonomy = match &cli.catalog {
        Some(path) => {
            let (categories, aliases) = load_catalog(path)?;
            info!(
                categories = categories.len(),
                aliases = aliases.len(),
                "catalog loaded"
            );
            TaxonomyIndex::build(categories, aliases)
        }
        None => TaxonomyIndex::with_defaults(),
    };

    let store = SqliteStore::open(&cli.db)?;

    match cli.command {
        Command::Materialize {
            baseline,
            force_rewrite_zeros,
            reset,
        } => run_materialize(&store, &taxonomy, &baseline, force_rewrite_zeros, reset),
        Command::MatchInvoices { baseline, invoices } => {
            run_match(&store, &taxonomy, &baseline, &invoices)
        }
        Command::Distribute { baseline, change } => {
            run_distribute(&store, &baseline, &change)
        }
    }
}

fn load_baseline(path: &Path) -> Result<BaselineDocument> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading baseline {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing baseline {}", path.display()))
}

fn run_materialize(
    store: &SqliteStore,
    taxonomy: &TaxonomyIndex,
    baseline_path: &Path,
    force_rewrite_zeros: bool,
    reset: bool,
) -> Result<()> {
    let doc = load_baseline(baseline_path)?;
    println!(
        "📆 Materializing baseline {} ({} months)",
        doc.metadata.baseline_id, doc.metadata.duration_months
    );

    if reset {
        let deleted = store.delete_baseline(&doc.metadata.baseline_id)?;
        println!("✓ Cleared {} stored records", deleted);
    }

    let report = materialize(&doc, taxonomy)
        .map_err(|e| anyhow::anyhow!("baseline rejected [{}]: {e}", e.reason_code()))?;
    println!("✓ Expanded {} allocation records", report.records.len());
    if report.unmapped_items > 0 {
        println!("⚠ {} items resolved to UNMAPPED", report.unmapped_items);
    }
    if report.long_horizon_items > 0 {
        println!("⚠ {} items extend past 60 months", report.long_horizon_items);
    }

    let summary = upsert_allocations(
        store,
        &report.records,
        UpsertOptions { force_rewrite_zeros },
    );
    println!(
        "✓ Upsert: {} attempted, {} written, {} skipped",
        summary.attempted, summary.written, summary.skipped
    );
    for err in &summary.errors {
        eprintln!("✗ {}: {}", err.store_key, err.message);
    }
    if !summary.errors.is_empty() {
        anyhow::bail!("{} records failed to write (retry is safe)", summary.errors.len());
    }
    Ok(())
}

fn run_match(
    store: &SqliteStore,
    taxonomy: &TaxonomyIndex,
    baseline_path: &Path,
    invoices_path: &Path,
) -> Result<()> {
    let doc = load_baseline(baseline_path)?;
    let invoices = load_invoices_csv(invoices_path)?;
    let mut cells = store.list_baseline(&doc.metadata.baseline_id)?;
    println!(
        "🧾 Matching {} invoices against {} cells",
        invoices.len(),
        cells.len()
    );

    let ctx = MatchContext {
        project_id: doc.metadata.project_id.clone(),
        start_date: Some(doc.metadata.start_date),
        duration_months: doc.metadata.duration_months,
    };
    let report = match_invoices(&invoices, &mut cells, taxonomy, &ctx);

    // Persist accumulated actuals, one write per touched cell
    for key in report.touched_store_keys() {
        if let Some(cell) = cells.iter().find(|c| c.store_key() == key) {
            store.put(cell)?;
        }
    }

    println!(
        "✓ Matched {} invoices (${:.2} actual spend)",
        report.matched.len(),
        report.total_matched_amount()
    );
    if !report.unmatched.is_empty() {
        println!("⚠ {} unmatched invoices for manual reconciliation:", report.unmatched.len());
        for u in &report.unmatched {
            println!("  - {} [{:?}]: {}", u.invoice_id, u.reason, u.detail);
        }
    }
    Ok(())
}

fn run_distribute(store: &SqliteStore, baseline_path: &Path, change_path: &Path) -> Result<()> {
    let doc = load_baseline(baseline_path)?;
    let raw = std::fs::read_to_string(change_path)
        .with_context(|| format!("reading change request {}", change_path.display()))?;
    let mut change: ChangeRequest = serde_json::from_str(&raw)
        .with_context(|| format!("parsing change request {}", change_path.display()))?;

    let mut cells = store.list_baseline(&doc.metadata.baseline_id)?;
    println!(
        "⚖ Applying change {} (${:.2} over {} months)",
        change.change_id, change.impact_amount, change.duration_months
    );

    let mutated = approve(&mut change, &mut cells, &doc.metadata)
        .map_err(|e| anyhow::anyhow!("change rejected [{}]: {e}", e.reason_code()))?;

    for cell in &mutated {
        store.put(cell)?;
    }

    if mutated.is_empty() {
        println!("✓ Change already applied, nothing to do");
    } else {
        println!("✓ Updated {} allocation cells", mutated.len());
    }
    Ok(())
}
