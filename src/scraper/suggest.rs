//! Long-tail keyword discovery through the marketplace's search-box
//! suggestions.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeSet;

/// Source filters the search box sends along with every suggestion query.
pub const SUGGESTION_SOURCES: &str = "126,131,130,129";

/// Marketplace id the suggestion endpoint expects for a domain suffix.
pub fn marketplace_id(tld: &str) -> Option<u32> {
    match tld {
        "com" => Some(1),
        "co.uk" => Some(3),
        "fr" => Some(4),
        "de" => Some(5),
        "es" => Some(7),
        "it" => Some(8),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct SuggestionReply {
    #[serde(default)]
    suggestions: Vec<Suggestion>,
}

#[derive(Debug, Deserialize)]
struct Suggestion {
    value: Option<String>,
}

pub fn parse_suggestions(body: &str) -> Result<Vec<String>> {
    let reply: SuggestionReply =
        serde_json::from_str(body).context("suggestion reply is not JSON, requests may be blocked")?;
    Ok(reply
        .suggestions
        .into_iter()
        .filter_map(|s| s.value)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect())
}

/// Base keywords of an expansion input. `#` lines are comments.
pub fn base_keywords(text: &str) -> Vec<String> {
    let unique: BTreeSet<String> = text
        .lines()
        .filter(|line| !line.starts_with('#'))
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    unique.into_iter().collect()
}

/// Union of the base keywords and every suggestion, sorted and unique.
pub fn merge_keywords(base: &[String], found: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut all: BTreeSet<String> = base.iter().cloned().collect();
    all.extend(found);
    all.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suggestion_values_are_collected() {
        let body = r#"{"alias":"aps","prefix":"souris","suggestions":[
            {"suggType":"KeywordSuggestion","type":"KEYWORD","value":"souris sans fil"},
            {"type":"KEYWORD","value":"souris gamer "},
            {"type":"WIDGET"}
        ]}"#;
        assert_eq!(parse_suggestions(body).unwrap(), vec!["souris sans fil", "souris gamer"]);
        assert!(parse_suggestions(r#"{"prefix":"x"}"#).unwrap().is_empty());
        assert!(parse_suggestions("<html>blocked</html>").is_err());
    }

    #[test]
    fn comments_and_duplicates_are_dropped() {
        let text = "# kitchen\nblender\n\n  blender \nair fryer\n";
        assert_eq!(base_keywords(text), vec!["air fryer", "blender"]);
    }

    #[test]
    fn expansion_keeps_the_base_list() {
        let base = vec!["blender".to_string(), "air fryer".to_string()];
        let merged = merge_keywords(&base, vec!["blender portable".to_string(), "air fryer".to_string()]);
        assert_eq!(merged, vec!["air fryer", "blender", "blender portable"]);
    }

    #[test]
    fn known_marketplaces() {
        assert_eq!(marketplace_id("fr"), Some(4));
        assert_eq!(marketplace_id("co.uk"), Some(3));
        assert_eq!(marketplace_id("co.jp"), None);
    }
}
