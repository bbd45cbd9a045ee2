//! Standalone export of a session's final scraper.
//!
//! The exported script carries an inline dependency block (PEP 723), so
//! `uv run scraper.py <url>` installs what it needs and prints the records.

use serde::{Deserialize, Serialize};

use crate::domain::{RevisionId, SessionHistory};
use crate::sandbox::imported_modules;

const REQUIRES_PYTHON: &str = ">=3.10";

/// Top-level modules that ship with CPython.
const STDLIB_MODULES: &[&str] = &[
    "__future__", "abc", "argparse", "array", "ast", "asyncio", "base64", "bisect", "calendar",
    "collections", "contextlib", "copy", "csv", "dataclasses", "datetime", "decimal", "difflib",
    "enum", "fractions", "functools", "gzip", "hashlib", "heapq", "hmac", "html", "http", "io",
    "itertools", "json", "logging", "math", "operator", "os", "pathlib", "pprint", "random", "re",
    "statistics", "string", "struct", "sys", "textwrap", "time", "typing", "unicodedata", "urllib",
    "uuid", "warnings", "xml", "zlib",
];

/// Import name to distribution name, where they differ.
const DISTRIBUTIONS: &[(&str, &str)] = &[
    ("bs4", "beautifulsoup4"),
    ("dateutil", "python-dateutil"),
    ("yaml", "pyyaml"),
    ("PIL", "pillow"),
    ("sklearn", "scikit-learn"),
];

/// Exported script for the latest successful revision of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportBundle {
    pub revision_id: RevisionId,
    pub final_source_text: String,
    /// Third-party distributions the script imports, sorted.
    pub dependency_manifest: Vec<String>,
    /// Self-contained script: dependency block, source, entry point.
    pub script: String,
}

/// Distributions to install for `source`.
pub fn dependency_manifest(source: &str) -> Vec<String> {
    let mut deps: Vec<String> = imported_modules(source)
        .into_iter()
        .filter(|module| !STDLIB_MODULES.contains(&module.as_str()))
        .map(|module| {
            DISTRIBUTIONS
                .iter()
                .find(|(import, _)| *import == module)
                .map(|(_, dist)| dist.to_string())
                .unwrap_or(module)
        })
        .collect();
    deps.sort();
    deps.dedup();
    deps
}

/// Wrap `source` into a runnable script with an inline dependency block.
pub fn render_script(source: &str, dependencies: &[String]) -> String {
    let mut out = String::new();
    if !source.trim_start().starts_with("# /// script") {
        out.push_str("# /// script\n");
        out.push_str(&format!("# requires-python = \"{REQUIRES_PYTHON}\"\n"));
        if dependencies.is_empty() {
            out.push_str("# dependencies = []\n");
        } else {
            out.push_str("# dependencies = [\n");
            for dep in dependencies {
                out.push_str(&format!("#     \"{dep}\",\n"));
            }
            out.push_str("# ]\n");
        }
        out.push_str("# ///\n\n");
    }

    out.push_str(source.trim_end());
    out.push('\n');

    if !source.contains("__name__ == \"__main__\"") && !source.contains("__name__ == '__main__'") {
        out.push_str(
            "\n\nif __name__ == \"__main__\":\n    import json\n    import sys\n\n    \
             print(json.dumps(scrape(sys.argv[1]), ensure_ascii=False, indent=2, default=str))\n",
        );
    }
    out
}

/// Bundle for the most recent `Succeeded` revision; `None` if there is none.
pub fn export_from_history(history: &SessionHistory) -> Option<ExportBundle> {
    let (revision, _) = history.last_success()?;
    let source = revision.source_text();
    let dependency_manifest = dependency_manifest(source);
    Some(ExportBundle {
        revision_id: revision.id(),
        final_source_text: source.to_string(),
        script: render_script(source, &dependency_manifest),
        dependency_manifest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        ExecutionOutcome, ExecutionStatus, RevisionOrigin, ScriptRevision, SessionRecord,
    };
    use serde_json::json;

    const SCRAPER: &str = "import json\nimport requests\nfrom bs4 import BeautifulSoup\n\n\
def scrape(url):\n    soup = BeautifulSoup(requests.get(url).text, 'html.parser')\n    \
return [{'title': h.text} for h in soup.select('h2')]\n";

    #[test]
    fn test_manifest_maps_and_skips_stdlib() {
        assert_eq!(dependency_manifest(SCRAPER), vec!["beautifulsoup4", "requests"]);
        assert!(dependency_manifest("import re\nimport json\n").is_empty());
    }

    #[test]
    fn test_render_adds_header_and_entry_point() {
        let deps = dependency_manifest(SCRAPER);
        let script = render_script(SCRAPER, &deps);
        assert!(script.starts_with("# /// script\n# requires-python = \">=3.10\"\n"));
        assert!(script.contains("#     \"beautifulsoup4\",\n"));
        assert!(script.contains("def scrape(url):"));
        assert!(script.contains("if __name__ == \"__main__\":"));
    }

    #[test]
    fn test_render_keeps_existing_entry_point() {
        let source = format!("{SCRAPER}\nif __name__ == '__main__':\n    print(scrape('x'))\n");
        let script = render_script(&source, &[]);
        assert_eq!(script.matches("__main__").count(), 1);
        assert!(script.contains("# dependencies = []"));
    }

    #[test]
    fn test_export_picks_latest_success() {
        let mut history = SessionHistory::new(SessionRecord::new("https://example.com", "titles", 3));
        let first = ScriptRevision::root(SCRAPER, RevisionOrigin::Initial);
        let second = ScriptRevision::child_of(&first, "import socket\n", RevisionOrigin::Repaired);

        let mut ok = ExecutionOutcome::runtime_failure(first.id(), "", None, 5);
        ok.status = ExecutionStatus::Succeeded;
        ok.error_message = None;
        ok.extracted_records = vec![json!({"title": "a"})];
        let bad = ExecutionOutcome::runtime_failure(second.id(), "boom", None, 5);

        history.revisions = vec![first.clone(), second];
        history.outcomes = vec![ok, bad];

        let bundle = export_from_history(&history).unwrap();
        assert_eq!(bundle.revision_id, first.id());
        assert_eq!(bundle.final_source_text, SCRAPER);
    }

    #[test]
    fn test_export_without_success() {
        let history = SessionHistory::new(SessionRecord::new("u", "g", 3));
        assert!(export_from_history(&history).is_none());
    }
}
