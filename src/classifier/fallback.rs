use lazy_static::lazy_static;
use tracing::info;

use super::{Category, ClassificationResult, Entities, Location, Severity};
use crate::TARGET_WORKER;

/// Deterministic keyword classifications are low-trust by construction.
pub const FALLBACK_CONFIDENCE: f64 = 0.3;
/// Provenance marker distinguishing keyword results from provider results.
pub const FALLBACK_PROVIDER: &str = "fallback";

lazy_static! {
    /// Category cues, matched against lowercased title + content. Order is
    /// the tie-break iteration order, not a ranking.
    static ref CATEGORY_KEYWORDS: Vec<(Category, &'static [&'static str])> = vec![
        (
            Category::Racial,
            &[
                "racial", "race", "ethnic", "ethnicity", "black", "african american",
                "hispanic", "latino", "asian american", "minority", "people of color",
            ][..],
        ),
        (
            Category::Religious,
            &[
                "religious", "religion", "muslim", "islam", "christian", "jewish",
                "hindu", "sikh", "faith", "hijab",
            ][..],
        ),
        (
            Category::Disability,
            &[
                "disability", "disabled", "accessibility", "blind", "deaf",
                "wheelchair", "ada compliance", "screen reader", "impairment",
            ][..],
        ),
        (
            Category::GeneralAi,
            &[
                "algorithmic bias", "ai bias", "machine learning bias",
                "automated decision", "ai ethics", "algorithmic fairness",
                "biased algorithm",
            ][..],
        ),
    ];

    static ref MICHIGAN_TERMS: Vec<&'static str> = vec![
        "michigan", "detroit", "lansing", "grand rapids", "ann arbor", "flint",
        "dearborn",
    ];

    static ref INTERNATIONAL_TERMS: Vec<&'static str> = vec![
        "international", "global", "worldwide", "europe", "european union",
        "united kingdom", "china", "india", "canada",
    ];

    static ref HIGH_SEVERITY_TERMS: Vec<&'static str> = vec![
        "lawsuit", "legal action", "settlement", "court", "wrongful arrest",
        "class action", "federal charges",
    ];

    static ref MEDIUM_SEVERITY_TERMS: Vec<&'static str> = vec![
        "complaint", "investigation", "violation", "audit", "regulator",
    ];

    /// Matched case-sensitively against the original text so names keep
    /// their casing in extracted entities.
    static ref KNOWN_ORGANIZATIONS: Vec<&'static str> = vec![
        "Microsoft", "Google", "Amazon", "Meta", "OpenAI", "IBM", "Anthropic",
        "ACLU", "EEOC", "Clearview AI",
    ];

    static ref KNOWN_LOCATIONS: Vec<&'static str> = vec![
        "Michigan", "Detroit", "Lansing", "Grand Rapids", "Ann Arbor",
        "United States", "Europe", "China", "United Kingdom",
    ];

    static ref KEYWORD_PATTERNS: Vec<&'static str> = vec![
        "facial recognition", "machine learning", "artificial intelligence",
        "algorithm", "hiring", "lending", "surveillance", "bias",
        "discrimination", "chatbot",
    ];
}

/// Keyword classification used when every configured provider has been
/// exhausted. Always succeeds; the result carries [`FALLBACK_PROVIDER`]
/// and [`FALLBACK_CONFIDENCE`] so downstream consumers can tell it apart
/// from a provider classification.
pub fn fallback_classification(title: &str, content: &str) -> ClassificationResult {
    let original = format!("{} {}", title, content);
    let text = original.to_lowercase();

    let category = detect_category(&text);
    let severity = detect_severity(&text);
    let location = detect_location(&text);

    info!(
        target: TARGET_WORKER,
        "Fallback classification: {} / {} / {}",
        category.as_str(),
        severity.as_str(),
        location.as_str()
    );

    ClassificationResult {
        category,
        severity,
        location,
        confidence: FALLBACK_CONFIDENCE,
        entities: extract_entities(&original),
        keywords: extract_keywords(&text),
        reasoning: "Fallback keyword-based classification; no provider was available".to_string(),
        provider: FALLBACK_PROVIDER.to_string(),
        processing_ms: 0,
    }
}

/// Best-matching category by cue count. Two or more categories tied at
/// the maximum collapse to `Multiple`; no cues at all default to
/// `GeneralAi` since every queued article is AI-related by selection.
fn detect_category(text: &str) -> Category {
    let mut best = Category::GeneralAi;
    let mut best_count = 0usize;
    let mut tied = 0usize;

    for (category, cues) in CATEGORY_KEYWORDS.iter() {
        let count = cues.iter().filter(|cue| text.contains(*cue)).count();
        if count > best_count {
            best = *category;
            best_count = count;
            tied = 1;
        } else if count == best_count && count > 0 {
            tied += 1;
        }
    }

    if best_count == 0 {
        Category::GeneralAi
    } else if tied > 1 {
        Category::Multiple
    } else {
        best
    }
}

fn detect_severity(text: &str) -> Severity {
    if HIGH_SEVERITY_TERMS.iter().any(|term| text.contains(term)) {
        Severity::High
    } else if MEDIUM_SEVERITY_TERMS.iter().any(|term| text.contains(term)) {
        Severity::Medium
    } else {
        Severity::Low
    }
}

fn detect_location(text: &str) -> Location {
    if MICHIGAN_TERMS.iter().any(|term| text.contains(term)) {
        Location::Michigan
    } else if INTERNATIONAL_TERMS.iter().any(|term| text.contains(term)) {
        Location::International
    } else {
        Location::National
    }
}

fn extract_entities(original: &str) -> Entities {
    Entities {
        locations: KNOWN_LOCATIONS
            .iter()
            .filter(|name| original.contains(*name))
            .map(|name| name.to_string())
            .collect(),
        people: Vec::new(),
        organizations: KNOWN_ORGANIZATIONS
            .iter()
            .filter(|name| original.contains(*name))
            .map(|name| name.to_string())
            .collect(),
    }
}

fn extract_keywords(text: &str) -> Vec<String> {
    KEYWORD_PATTERNS
        .iter()
        .filter(|pattern| text.contains(*pattern))
        .map(|pattern| pattern.to_string())
        .collect()
}
