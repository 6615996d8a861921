// 🏷️ Canonical Taxonomy Index - Alias resolution for cost categories
// Builds an O(1) lookup from normalized alias strings to a single canonical
// cost category, so a PMO line item labeled "Ingeniero Delivery", a legacy id
// "ING-DEL" and the canonical "MOD-LEAD" all land on the same category.
//
// Resolution is layered (highest confidence first):
//   1. Exact match on the normalized key
//   2. Composite keys ("PROJ#MOD-LEAD"): retry on the segment after the last '#'
//   3. Tolerant substring scan, guarded by a length ratio so short keys
//      like "PM" can never latch onto unrelated long entries

use crate::normalize::normalize;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Sentinel canonical id for keys no catalog entry or alias covers.
/// Unmapped lookups are expected (legacy data) and never halt processing.
pub const UNMAPPED_ID: &str = "UNMAPPED";

/// Minimum shorter/longer length ratio for the substring fallback.
const SUBSTRING_MIN_RATIO: f64 = 0.70;

// ============================================================================
// CATALOG TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CostType {
    Capex,
    Opex,
}

impl CostType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CostType::Capex => "CAPEX",
            CostType::Opex => "OPEX",
        }
    }
}

/// Immutable catalog entry. Seeded once, read-only at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalCostCategory {
    /// Stable identifier (e.g. "MOD-LEAD") - never changes
    pub canonical_id: String,

    /// Human-facing name (e.g. "Lead Engineer")
    pub display_name: String,

    /// Grouping for reports (e.g. "Direct Labor", "Infrastructure")
    pub category_group: String,

    pub cost_type: CostType,
}

impl CanonicalCostCategory {
    pub fn new(canonical_id: &str, display_name: &str, category_group: &str, cost_type: CostType) -> Self {
        CanonicalCostCategory {
            canonical_id: canonical_id.to_string(),
            display_name: display_name.to_string(),
            category_group: category_group.to_string(),
            cost_type,
        }
    }

    /// The sentinel category returned for unresolvable keys.
    pub fn unmapped() -> Self {
        CanonicalCostCategory::new(UNMAPPED_ID, "Unmapped", "Unmapped", CostType::Opex)
    }

    pub fn is_unmapped(&self) -> bool {
        self.canonical_id == UNMAPPED_ID
    }
}

/// Maps one free-text or legacy string to a canonical id. Many aliases may
/// point at one category; aliases never win over canonical identities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliasEntry {
    pub alias: String,
    pub canonical_id: String,
}

impl AliasEntry {
    pub fn new(alias: &str, canonical_id: &str) -> Self {
        AliasEntry {
            alias: alias.to_string(),
            canonical_id: canonical_id.to_string(),
        }
    }
}

// ============================================================================
// RESOLUTION RESULT
// ============================================================================

/// Which lookup layer produced a match. The substring path carries its
/// length ratio so the heuristic stays measurable and tunable.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchConfidence {
    Exact,
    DelimiterTail,
    Substring(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution<'a> {
    pub category: &'a CanonicalCostCategory,
    pub confidence: MatchConfidence,
}

// ============================================================================
// TAXONOMY INDEX
// ============================================================================

/// In-memory lookup from normalized keys to canonical cost categories.
///
/// Built once from the catalog; categories are indexed under their own
/// normalized `canonical_id` and `display_name` first, then aliases fill in
/// the remaining keys (first-writer-wins, so canonical identities can never
/// be shadowed by an alias).
pub struct TaxonomyIndex {
    categories: Vec<CanonicalCostCategory>,
    index: HashMap<String, usize>,
    unmapped: CanonicalCostCategory,

    /// Unmapped keys already warned about, so legacy data with thousands of
    /// occurrences of the same bad key logs once per index lifetime.
    warned_unmapped: Mutex<HashSet<String>>,
}

impl TaxonomyIndex {
    /// Build the index from a catalog plus its alias table.
    ///
    /// Two different aliases colliding on the same normalized key while
    /// pointing at different categories is a data-quality defect: logged,
    /// first writer kept.
    pub fn build(categories: Vec<CanonicalCostCategory>, aliases: Vec<AliasEntry>) -> Self {
        let mut index: HashMap<String, usize> = HashMap::new();

        // Pass 1: canonical identities
        for (i, cat) in categories.iter().enumerate() {
            for key in [normalize(&cat.canonical_id), normalize(&cat.display_name)] {
                if key.is_empty() {
                    continue;
                }
                if let Some(&existing) = index.get(&key) {
                    if categories[existing].canonical_id != cat.canonical_id {
                        warn!(
                            key = %key,
                            kept = %categories[existing].canonical_id,
                            dropped = %cat.canonical_id,
                            "duplicate canonical key in catalog, keeping first"
                        );
                    }
                    continue;
                }
                index.insert(key, i);
            }
        }

        // Pass 2: aliases, only where no key exists yet
        for alias in &aliases {
            let key = normalize(&alias.alias);
            if key.is_empty() {
                continue;
            }
            let Some(target) = categories.iter().position(|c| c.canonical_id == alias.canonical_id)
            else {
                warn!(
                    alias = %alias.alias,
                    canonical_id = %alias.canonical_id,
                    "alias points at unknown canonical id, skipping"
                );
                continue;
            };
            if let Some(&existing) = index.get(&key) {
                if categories[existing].canonical_id != alias.canonical_id {
                    warn!(
                        key = %key,
                        kept = %categories[existing].canonical_id,
                        dropped = %alias.canonical_id,
                        "alias collision, keeping first"
                    );
                }
                continue;
            }
            index.insert(key, target);
        }

        TaxonomyIndex {
            categories,
            index,
            unmapped: CanonicalCostCategory::unmapped(),
            warned_unmapped: Mutex::new(HashSet::new()),
        }
    }

    /// Resolve a raw key to a canonical category, or None if nothing
    /// qualifies. Never fails: callers fall back to the UNMAPPED sentinel.
    pub fn resolve(&self, raw_key: &str) -> Option<Resolution<'_>> {
        let key = normalize(raw_key);
        if key.is_empty() {
            return None;
        }

        // Layer 1: exact
        if let Some(&i) = self.index.get(&key) {
            return Some(Resolution {
                category: &self.categories[i],
                confidence: MatchConfidence::Exact,
            });
        }

        // Layer 2: composite keys, e.g. DynamoDB-style "PROJ-001#MOD-LEAD"
        if raw_key.contains('#') {
            if let Some(tail) = raw_key.rsplit('#').next() {
                let tail_key = normalize(tail);
                if !tail_key.is_empty() && tail_key != key {
                    if let Some(&i) = self.index.get(&tail_key) {
                        return Some(Resolution {
                            category: &self.categories[i],
                            confidence: MatchConfidence::DelimiterTail,
                        });
                    }
                }
            }
        }

        // Layer 3: tolerant substring scan. Containment alone is not enough:
        // the shorter key must cover at least 70% of the longer one, which is
        // what keeps "pm" from matching every key that happens to contain it.
        let mut best: Option<(&str, usize, f64)> = None;
        for (cand, &i) in &self.index {
            let (shorter, longer) = if cand.len() <= key.len() {
                (cand.as_str(), key.as_str())
            } else {
                (key.as_str(), cand.as_str())
            };
            if shorter.is_empty() || !longer.contains(shorter) {
                continue;
            }
            let ratio = shorter.len() as f64 / longer.len() as f64;
            if ratio < SUBSTRING_MIN_RATIO {
                continue;
            }
            // Deterministic tie-break: best ratio, then lexicographic key
            let better = match best {
                None => true,
                Some((best_key, _, best_ratio)) => {
                    ratio > best_ratio || (ratio == best_ratio && cand.as_str() < best_key)
                }
            };
            if better {
                best = Some((cand.as_str(), i, ratio));
            }
        }

        if let Some((matched_key, i, ratio)) = best {
            debug!(
                query = %key,
                matched = %matched_key,
                ratio = format!("{:.2}", ratio),
                "substring fallback match"
            );
            return Some(Resolution {
                category: &self.categories[i],
                confidence: MatchConfidence::Substring(ratio),
            });
        }

        None
    }

    /// Resolve with the UNMAPPED sentinel as fallback, warning once per
    /// distinct unmapped key.
    pub fn resolve_or_unmapped(&self, raw_key: &str) -> &CanonicalCostCategory {
        match self.resolve(raw_key) {
            Some(res) => res.category,
            None => {
                let key = normalize(raw_key);
                let mut warned = self.warned_unmapped.lock().unwrap();
                if warned.insert(key.clone()) {
                    warn!(raw = %raw_key, normalized = %key, "unmapped cost key");
                }
                &self.unmapped
            }
        }
    }

    /// Count of distinct unmapped keys seen via `resolve_or_unmapped`.
    pub fn unmapped_key_count(&self) -> usize {
        self.warned_unmapped.lock().unwrap().len()
    }

    pub fn categories(&self) -> &[CanonicalCostCategory] {
        &self.categories
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Default catalog seed used when no external catalog is supplied.
    pub fn with_defaults() -> Self {
        let categories = vec![
            CanonicalCostCategory::new("MOD-LEAD", "Lead Engineer", "Direct Labor", CostType::Opex),
            CanonicalCostCategory::new("MOD-SENIOR", "Senior Engineer", "Direct Labor", CostType::Opex),
            CanonicalCostCategory::new("MOD-ENG", "Engineer", "Direct Labor", CostType::Opex),
            CanonicalCostCategory::new("PM-DEL", "Delivery Manager", "Direct Labor", CostType::Opex),
            CanonicalCostCategory::new("QA-ENG", "QA Engineer", "Direct Labor", CostType::Opex),
            CanonicalCostCategory::new("ARCH-SOL", "Solution Architect", "Direct Labor", CostType::Opex),
            CanonicalCostCategory::new("INF-CLOUD", "Cloud Hosting", "Infrastructure", CostType::Opex),
            CanonicalCostCategory::new("INF-LIC", "Software Licenses", "Infrastructure", CostType::Capex),
            CanonicalCostCategory::new("SVC-TRAVEL", "Travel & Expenses", "Services", CostType::Opex),
            CanonicalCostCategory::new("SVC-TRAIN", "Training", "Services", CostType::Opex),
        ];

        let aliases = vec![
            AliasEntry::new("Ingeniero Delivery", "MOD-LEAD"),
            AliasEntry::new("Delivery Engineer", "MOD-LEAD"),
            AliasEntry::new("Tech Lead", "MOD-LEAD"),
            AliasEntry::new("ING-DEL", "MOD-LEAD"),
            AliasEntry::new("Ingeniero Senior", "MOD-SENIOR"),
            AliasEntry::new("Senior Developer", "MOD-SENIOR"),
            AliasEntry::new("Ingeniero", "MOD-ENG"),
            AliasEntry::new("Developer", "MOD-ENG"),
            AliasEntry::new("Project Manager", "PM-DEL"),
            AliasEntry::new("Gerente de Proyecto", "PM-DEL"),
            AliasEntry::new("SDM", "PM-DEL"),
            AliasEntry::new("Analista QA", "QA-ENG"),
            AliasEntry::new("Tester", "QA-ENG"),
            AliasEntry::new("Arquitecto de Soluciones", "ARCH-SOL"),
            AliasEntry::new("Servicios Cloud", "INF-CLOUD"),
            AliasEntry::new("Servicios Cloud / Hosting", "INF-CLOUD"),
            AliasEntry::new("Hosting", "INF-CLOUD"),
            AliasEntry::new("Licencias", "INF-LIC"),
            AliasEntry::new("Licenciamiento", "INF-LIC"),
            AliasEntry::new("Viajes", "SVC-TRAVEL"),
            AliasEntry::new("Viáticos", "SVC-TRAVEL"),
            AliasEntry::new("Capacitación", "SVC-TRAIN"),
        ];

        TaxonomyIndex::build(categories, aliases)
    }
}

// ============================================================================
// CATALOG LOADING
// ============================================================================

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    categories: Vec<CanonicalCostCategory>,
    #[serde(default)]
    aliases: Vec<AliasEntry>,
}

/// Load a catalog + alias table from a JSON file (the catalog provider's
/// export shape).
pub fn load_catalog(path: &Path) -> Result<(Vec<CanonicalCostCategory>, Vec<AliasEntry>)> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading catalog file {}", path.display()))?;
    let file: CatalogFile = serde_json::from_str(&raw)
        .with_context(|| format!("parsing catalog file {}", path.display()))?;
    Ok((file.categories, file.aliases))
}

// ============================================================================
// TAXONOMY CACHE
// ============================================================================

/// Explicit, lazily-initialized taxonomy holder with TTL-based rebuild.
///
/// The catalog is treated as append-only during a process's lifetime; the TTL
/// (default 5 minutes) is how refreshed catalog exports become visible
/// without a restart.
pub struct TaxonomyCache {
    ttl: Duration,
    built_at: Option<Instant>,
    index: Option<TaxonomyIndex>,
}

impl TaxonomyCache {
    pub fn new() -> Self {
        TaxonomyCache::with_ttl(Duration::from_secs(300))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        TaxonomyCache {
            ttl,
            built_at: None,
            index: None,
        }
    }

    /// Return the cached index, rebuilding it via `loader` when missing or
    /// older than the TTL. A loader failure leaves any existing index in
    /// place untouched.
    pub fn get_or_build<F>(&mut self, loader: F) -> Result<&TaxonomyIndex>
    where
        F: FnOnce() -> Result<(Vec<CanonicalCostCategory>, Vec<AliasEntry>)>,
    {
        let stale = match (&self.built_at, &self.index) {
            (Some(built), Some(_)) => built.elapsed() >= self.ttl,
            _ => true,
        };

        if stale {
            let (categories, aliases) = loader()?;
            self.index = Some(TaxonomyIndex::build(categories, aliases));
            self.built_at = Some(Instant::now());
        }

        Ok(self.index.as_ref().expect("taxonomy index built above"))
    }
}

impl Default for TaxonomyCache {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn small_index() -> TaxonomyIndex {
        let categories = vec![
            CanonicalCostCategory::new("MOD-LEAD", "Lead Engineer", "Direct Labor", CostType::Opex),
            CanonicalCostCategory::new("INF-CLOUD", "Cloud Hosting", "Infrastructure", CostType::Opex),
        ];
        let aliases = vec![
            AliasEntry::new("Ingeniero Delivery", "MOD-LEAD"),
            AliasEntry::new("Servicios Cloud", "INF-CLOUD"),
        ];
        TaxonomyIndex::build(categories, aliases)
    }

    #[test]
    fn test_exact_canonical_id() {
        let index = small_index();
        let res = index.resolve("MOD-LEAD").unwrap();
        assert_eq!(res.category.canonical_id, "MOD-LEAD");
        assert_eq!(res.confidence, MatchConfidence::Exact);
    }

    #[test]
    fn test_exact_display_name_and_alias() {
        let index = small_index();
        assert_eq!(
            index.resolve("lead engineer").unwrap().category.canonical_id,
            "MOD-LEAD"
        );
        assert_eq!(
            index.resolve("Ingeniero Delivery").unwrap().category.canonical_id,
            "MOD-LEAD"
        );
    }

    #[test]
    fn test_alias_diacritic_insensitive() {
        let index = TaxonomyIndex::with_defaults();
        // Catalog stores "Viáticos"; lookup works without the accent
        assert_eq!(
            index.resolve("viaticos").unwrap().category.canonical_id,
            "SVC-TRAVEL"
        );
    }

    #[test]
    fn test_canonical_precedence_over_alias() {
        // An alias string colliding with an existing canonical id must lose
        let categories = vec![
            CanonicalCostCategory::new("MOD-LEAD", "Lead Engineer", "Direct Labor", CostType::Opex),
            CanonicalCostCategory::new("QA-ENG", "QA Engineer", "Direct Labor", CostType::Opex),
        ];
        let aliases = vec![AliasEntry::new("MOD-LEAD", "QA-ENG")];
        let index = TaxonomyIndex::build(categories, aliases);

        assert_eq!(
            index.resolve("MOD-LEAD").unwrap().category.canonical_id,
            "MOD-LEAD"
        );
    }

    #[test]
    fn test_alias_collision_first_writer_wins() {
        let categories = vec![
            CanonicalCostCategory::new("A-1", "Alpha", "G", CostType::Opex),
            CanonicalCostCategory::new("B-2", "Beta", "G", CostType::Opex),
        ];
        let aliases = vec![
            AliasEntry::new("shared name", "A-1"),
            AliasEntry::new("Shared Name", "B-2"), // same normalized key
        ];
        let index = TaxonomyIndex::build(categories, aliases);
        assert_eq!(
            index.resolve("shared-name").unwrap().category.canonical_id,
            "A-1"
        );
    }

    #[test]
    fn test_delimiter_tail_retry() {
        let index = small_index();
        let res = index.resolve("PROJ-001#MOD-LEAD").unwrap();
        assert_eq!(res.category.canonical_id, "MOD-LEAD");
        assert_eq!(res.confidence, MatchConfidence::DelimiterTail);
    }

    #[test]
    fn test_substring_fallback_accepts_close_lengths() {
        let index = small_index();
        // "servicios-cloud-x" (17) contains "servicios-cloud" (15): ratio 0.88
        let res = index.resolve("Servicios Cloud X").unwrap();
        assert_eq!(res.category.canonical_id, "INF-CLOUD");
        match res.confidence {
            MatchConfidence::Substring(ratio) => assert!(ratio >= 0.70),
            other => panic!("expected substring match, got {:?}", other),
        }
    }

    #[test]
    fn test_substring_fallback_rejects_short_keys() {
        let index = small_index();
        // "lead" is contained in "mod-lead" and "lead-engineer" but the
        // length ratio is below 70% in both directions
        assert!(index.resolve("lead").is_none());
        assert!(index.resolve("pm").is_none());
    }

    #[test]
    fn test_unknown_key_returns_none_not_error() {
        let index = small_index();
        assert!(index.resolve("completely unrelated thing").is_none());
        assert!(index.resolve("").is_none());
        assert!(index.resolve("###").is_none());
    }

    #[test]
    fn test_resolve_or_unmapped_sentinel_and_throttle() {
        let index = small_index();
        let cat = index.resolve_or_unmapped("mystery role");
        assert!(cat.is_unmapped());
        assert_eq!(cat.canonical_id, UNMAPPED_ID);

        // Same key again: still sentinel, counted once
        index.resolve_or_unmapped("mystery role");
        index.resolve_or_unmapped("Mystery Role");
        assert_eq!(index.unmapped_key_count(), 1);

        index.resolve_or_unmapped("another mystery");
        assert_eq!(index.unmapped_key_count(), 2);
    }

    #[test]
    fn test_alias_to_unknown_canonical_is_skipped() {
        let categories = vec![CanonicalCostCategory::new("A-1", "Alpha", "G", CostType::Opex)];
        let aliases = vec![AliasEntry::new("ghost", "NOPE")];
        let index = TaxonomyIndex::build(categories, aliases);
        assert!(index.resolve("ghost").is_none());
    }

    #[test]
    fn test_default_catalog_scenario_keys() {
        let index = TaxonomyIndex::with_defaults();
        assert_eq!(
            index.resolve("Ingeniero Delivery").unwrap().category.canonical_id,
            "MOD-LEAD"
        );
        assert_eq!(
            index
                .resolve("Servicios Cloud / hosting")
                .unwrap()
                .category
                .canonical_id,
            "INF-CLOUD"
        );
    }

    #[test]
    fn test_cache_builds_once_within_ttl() {
        let mut cache = TaxonomyCache::with_ttl(Duration::from_secs(3600));
        let mut builds = 0;

        for _ in 0..3 {
            let index = cache
                .get_or_build(|| {
                    builds += 1;
                    Ok((
                        vec![CanonicalCostCategory::new("A-1", "Alpha", "G", CostType::Opex)],
                        vec![],
                    ))
                })
                .unwrap();
            assert!(index.resolve("A-1").is_some());
        }

        assert_eq!(builds, 1);
    }

    #[test]
    fn test_cache_zero_ttl_rebuilds() {
        let mut cache = TaxonomyCache::with_ttl(Duration::from_secs(0));
        let mut builds = 0;
        for _ in 0..2 {
            cache
                .get_or_build(|| {
                    builds += 1;
                    Ok((vec![], vec![]))
                })
                .unwrap();
        }
        assert_eq!(builds, 2);
    }
}
