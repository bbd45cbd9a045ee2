//! Pulls script source out of a model reply.
//!
//! Replies come in three shapes: a JSON object with a `code` field, that
//! object inside a fenced block, or a fenced Python block.

use std::sync::LazyLock;

use regex::Regex;

static JSON_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("json fence regex is valid")
});

static PYTHON_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:python|py)\s*\n(.*?)```").expect("python fence regex is valid")
});

fn code_field(json: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(json).ok()?;
    value.get("code")?.as_str().map(str::to_string)
}

/// Script source carried by `reply`, or `None` when there is none.
pub fn extract_source(reply: &str) -> Option<String> {
    let reply = reply.trim();
    let source = code_field(reply)
        .or_else(|| {
            JSON_FENCE
                .captures(reply)
                .and_then(|caps| code_field(caps.get(1)?.as_str()))
        })
        .or_else(|| {
            PYTHON_FENCE
                .captures(reply)
                .and_then(|caps| Some(caps.get(1)?.as_str().to_string()))
        })
        .or_else(|| reply.contains("def scrape").then(|| reply.to_string()))?;

    let source = source.trim_matches('\n').to_string();
    if source.trim().is_empty() {
        None
    } else {
        Some(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_json_reply() {
        let reply = r#"{"code": "def scrape(url):\n    return []", "imports": [], "explanation": "x"}"#;
        assert_eq!(
            extract_source(reply).as_deref(),
            Some("def scrape(url):\n    return []")
        );
    }

    #[test]
    fn test_fenced_json_reply() {
        let reply = "Here you go:\n```json\n{\"code\": \"def scrape(url):\\n    return [1]\"}\n```\n";
        assert_eq!(
            extract_source(reply).as_deref(),
            Some("def scrape(url):\n    return [1]")
        );
    }

    #[test]
    fn test_python_fence_reply() {
        let reply = "Fixed selector.\n```python\nimport requests\n\ndef scrape(url):\n    return []\n```";
        let source = extract_source(reply).unwrap();
        assert!(source.starts_with("import requests"));
        assert!(source.ends_with("return []"));
    }

    #[test]
    fn test_bare_source_and_garbage() {
        assert!(extract_source("def scrape(url):\n    return []").is_some());
        assert!(extract_source("I cannot help with that.").is_none());
        assert!(extract_source("```python\n\n```").is_none());
    }
}
