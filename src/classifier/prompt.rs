use crate::db::article::Article;

pub const SYSTEM_PROMPT: &str = "You are an expert in AI ethics and discrimination analysis. \
     Classify news articles about AI discrimination incidents.";

/// Character budget for article content in a prompt, a rough proxy for the
/// smallest provider input budget.
pub const MAX_CONTENT_CHARS: usize = 12_000;

pub fn classification_prompt(article: &Article, max_content_chars: usize) -> String {
    let content = truncate_chars(&article.content, max_content_chars);
    format!(
        r#"Analyze this article about AI discrimination and provide a JSON response with the following structure:

{{
  "location": "MICHIGAN" | "NATIONAL" | "INTERNATIONAL",
  "discriminationType": "RACIAL" | "RELIGIOUS" | "DISABILITY" | "GENERAL_AI" | "MULTIPLE",
  "severity": "LOW" | "MEDIUM" | "HIGH",
  "confidenceScore": 0.0-1.0,
  "reasoning": "Brief explanation of classification",
  "entities": {{
    "locations": ["location1", "location2"],
    "people": ["person1", "person2"],
    "organizations": ["org1", "org2"]
  }},
  "keywords": ["keyword1", "keyword2", "keyword3"]
}}

Classification Guidelines:

LOCATION:
- MICHIGAN: Incidents specifically in Michigan, mentions Michigan organizations, Michigan-specific laws/policies
- NATIONAL: US-wide incidents, federal policies, national organizations
- INTERNATIONAL: Global incidents, international organizations, non-US locations

DISCRIMINATION TYPE:
- RACIAL: AI systems showing bias against racial/ethnic groups
- RELIGIOUS: AI systems discriminating based on religious beliefs or practices
- DISABILITY: AI systems creating barriers for people with disabilities
- GENERAL_AI: Broad AI ethics concerns, algorithmic bias in general
- MULTIPLE: Multiple types of discrimination mentioned

SEVERITY:
- HIGH: Legal action, major incidents, policy changes, widespread impact
- MEDIUM: Reported discrimination, company responses, research findings
- LOW: General discussions, minor incidents, educational content

Article to analyze:
Title: {title}
Content: {content}
Source: {source}

Provide only valid JSON response:"#,
        title = article.title,
        content = content,
        source = article.source.as_deref().unwrap_or("unknown"),
    )
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((offset, _)) => &text[..offset],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_truncates_long_content() {
        let article = Article {
            id: 1,
            title: "Title".to_string(),
            content: "x".repeat(50_000),
            source: None,
            url: None,
        };
        let prompt = classification_prompt(&article, MAX_CONTENT_CHARS);
        assert!(prompt.len() < 20_000);
        assert!(prompt.contains("Title: Title"));
        assert!(prompt.contains("Source: unknown"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("ab", 10), "ab");
    }
}
