use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use super::{Category, Entities, Location, Severity};

/// The structured portion of a model response, before provenance and
/// timing are attached.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedClassification {
    pub category: Category,
    pub severity: Severity,
    pub location: Location,
    pub confidence: f64,
    pub entities: Entities,
    pub keywords: Vec<String>,
    pub reasoning: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawClassification {
    discrimination_type: Option<String>,
    severity: Option<String>,
    location: Option<String>,
    confidence_score: Option<f64>,
    #[serde(default)]
    entities: Entities,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    reasoning: String,
}

/// Parse a model response into a classification. Models wrap the JSON in
/// prose more often than not, so the first balanced JSON object is
/// extracted before deserializing. Missing or unknown category, severity,
/// or location values are errors; a missing confidence defaults to 0.5
/// and is clamped into [0.0, 1.0].
pub fn parse_classification_response(response: &str) -> Result<ParsedClassification> {
    let block = extract_json_block(response)
        .ok_or_else(|| anyhow!("response contains no JSON object"))?;
    let raw: RawClassification =
        serde_json::from_str(block).context("response JSON did not match expected shape")?;

    let category = required_field(raw.discrimination_type, "discriminationType", Category::parse)?;
    let severity = required_field(raw.severity, "severity", Severity::parse)?;
    let location = required_field(raw.location, "location", Location::parse)?;

    Ok(ParsedClassification {
        category,
        severity,
        location,
        confidence: raw.confidence_score.unwrap_or(0.5).clamp(0.0, 1.0),
        entities: raw.entities,
        keywords: raw.keywords,
        reasoning: raw.reasoning,
    })
}

fn required_field<T>(
    value: Option<String>,
    field: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T> {
    let value = value.ok_or_else(|| anyhow!("response is missing {}", field))?;
    parse(&value).ok_or_else(|| anyhow!("unknown {} value '{}'", field, value))
}

/// First balanced `{ ... }` region, tracking string literals and escapes
/// so braces inside values don't close the block early.
fn extract_json_block(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}
