// 🔤 Key Normalizer - Single point of truth for string folding
// Every lookup in the system goes through normalize(). No other module
// re-implements its own case/diacritic folding, so alias matching can
// never drift between subsystems.

use unicode_normalization::UnicodeNormalization;

/// Normalize a raw key for lookup.
///
/// Steps, in order:
/// 1. Trim surrounding whitespace
/// 2. Lowercase
/// 3. NFKD decomposition, dropping combining diacritical marks (U+0300–U+036F)
/// 4. Collapse every run of non `[a-z0-9]` characters into a single hyphen
/// 5. Trim leading/trailing hyphens
///
/// Pure and total: never fails, and `normalize(normalize(s)) == normalize(s)`.
///
/// Examples:
/// - "María José"            → "maria-jose"
/// - "  Ingeniero  Delivery" → "ingeniero-delivery"
/// - "MOD#LEAD"              → "mod-lead"
pub fn normalize(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();

    let mut out = String::with_capacity(lowered.len());
    let mut pending_hyphen = false;

    for c in lowered.nfkd() {
        // Combining diacritical marks block
        if ('\u{0300}'..='\u{036F}').contains(&c) {
            continue;
        }

        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(c);
        } else {
            pending_hyphen = true;
        }
    }

    out
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_folding() {
        assert_eq!(normalize("  Hello World  "), "hello-world");
        assert_eq!(normalize("MOD-LEAD"), "mod-lead");
    }

    #[test]
    fn test_diacritics_stripped() {
        assert_eq!(normalize("María José"), "maria-jose");
        assert_eq!(normalize("Ingeniería"), "ingenieria");
        assert_eq!(normalize("Señor Façade"), "senor-facade");
    }

    #[test]
    fn test_punctuation_collapses_to_single_hyphen() {
        assert_eq!(normalize("Servicios Cloud / hosting"), "servicios-cloud-hosting");
        assert_eq!(normalize("a -- b__c"), "a-b-c");
        assert_eq!(normalize("MOD#LEAD"), "mod-lead");
    }

    #[test]
    fn test_edge_hyphens_trimmed() {
        assert_eq!(normalize("--lead--"), "lead");
        assert_eq!(normalize("  (lead)  "), "lead");
    }

    #[test]
    fn test_empty_and_symbol_only() {
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("   "), "");
        assert_eq!(normalize("###"), "");
    }

    #[test]
    fn test_idempotent() {
        let samples = [
            "María José",
            "  Ingeniero  Delivery ",
            "MOD#LEAD",
            "Servicios Cloud / hosting",
            "",
            "ya-normalizado-123",
        ];
        for s in samples {
            let once = normalize(s);
            assert_eq!(normalize(&once), once, "normalize not idempotent for {:?}", s);
        }
    }
}
