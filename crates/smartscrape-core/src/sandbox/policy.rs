//! The import allow-list / callable block-list applied to generated scripts.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Process-wide static policy for generated scripts.
///
/// Loaded once at start-up and shared behind an `Arc`; nothing mutates it
/// afterwards.
///
/// `blocked_callables` holds two kinds of entries:
/// - bare names (`eval`, `os`) match every identifier with that text,
///   including attribute components (`x.eval`), unless the name is listed in
///   `attribute_exemptions` and appears in attribute position;
/// - dotted names (`os.system`) match any attribute chain that contains those
///   segments contiguously once import aliases are resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WhitelistPolicy {
    pub allowed_modules: BTreeSet<String>,
    /// Root module -> full dotted paths that may be imported below it. Roots
    /// without an entry allow any submodule.
    pub allowed_submodules: BTreeMap<String, BTreeSet<String>>,
    pub blocked_callables: BTreeSet<String>,
    /// Bare blocked names that are fine as an attribute of another object
    /// (`re.compile` while `compile(...)` stays blocked).
    pub attribute_exemptions: BTreeSet<String>,
    /// Reject `obj.__dunder__` access outside `safe_dunders`.
    pub block_dunder_access: bool,
    /// Reject `obj._private` access and `from m import _private` outside
    /// `safe_dunders`. Stdlib modules keep `os` and `sys` under such names
    /// (`random._os`, `collections._sys`).
    pub block_private_access: bool,
    pub safe_dunders: BTreeSet<String>,
    pub allow_relative_imports: bool,
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for WhitelistPolicy {
    /// The scraping policy: requests + BeautifulSoup plus the pure stdlib
    /// helpers generated scrapers reach for.
    fn default() -> Self {
        let mut allowed_submodules = BTreeMap::new();
        allowed_submodules.insert(
            "urllib".to_string(),
            set(&["urllib.parse", "urllib.error"]),
        );

        Self {
            allowed_modules: set(&[
                "requests",
                "bs4",
                "json",
                "re",
                "datetime",
                "time",
                "typing",
                "collections",
                "urllib",
                "math",
                "random",
                "html",
                "itertools",
                "functools",
                "string",
                "decimal",
                "dataclasses",
            ]),
            allowed_submodules,
            blocked_callables: set(&[
                // dynamic evaluation
                "eval",
                "exec",
                "compile",
                "__import__",
                "__builtins__",
                "__loader__",
                "__spec__",
                "globals",
                "locals",
                "vars",
                "getattr",
                "setattr",
                "delattr",
                // interactive / process control
                "input",
                "breakpoint",
                "exit",
                "quit",
                "help",
                // raw file access
                "open",
                // modules that must never be reached, even through a re-export
                "os",
                "sys",
                "subprocess",
                "socket",
                "shutil",
                "importlib",
                "builtins",
                "ctypes",
                "pickle",
                "marshal",
                "multiprocessing",
                "threading",
                "pty",
                "signal",
                "types",
                "gc",
                "inspect",
                // qualified entries for re-exported helpers
                "codecs.open",
                "io.open",
                "pathlib.Path",
            ]),
            attribute_exemptions: set(&["compile", "open"]),
            block_dunder_access: true,
            block_private_access: true,
            safe_dunders: set(&["__init__", "__name__", "__doc__", "__len__", "__str__", "__repr__"]),
            allow_relative_imports: false,
        }
    }
}

impl WhitelistPolicy {
    /// Root module of a dotted path (`urllib.parse` -> `urllib`).
    pub fn root_of(path: &str) -> &str {
        path.split('.').next().unwrap_or(path)
    }

    /// Whether importing the full dotted `path` is permitted.
    pub fn permits_import(&self, path: &str) -> bool {
        let root = Self::root_of(path);
        if !self.allowed_modules.contains(root) {
            return false;
        }
        if path == root {
            return true;
        }
        match self.allowed_submodules.get(root) {
            Some(allowed) => allowed.contains(path),
            None => true,
        }
    }

    /// Bare blocked names (no dots), handed to the runtime harness as the
    /// builtins to strip.
    pub fn blocked_names(&self) -> impl Iterator<Item = &str> {
        self.blocked_callables
            .iter()
            .filter(|entry| !entry.contains('.'))
            .map(String::as_str)
    }

    /// Dotted blocked entries split into segments.
    pub fn blocked_paths(&self) -> Vec<Vec<&str>> {
        self.blocked_callables
            .iter()
            .filter(|entry| entry.contains('.'))
            .map(|entry| entry.split('.').collect())
            .collect()
    }

    pub fn is_blocked_name(&self, name: &str, attribute_position: bool) -> bool {
        if !self.blocked_callables.contains(name) {
            return false;
        }
        !(attribute_position && self.attribute_exemptions.contains(name))
    }

    pub fn is_forbidden_dunder(&self, name: &str) -> bool {
        self.block_dunder_access
            && name.len() > 4
            && name.starts_with("__")
            && name.ends_with("__")
            && !self.safe_dunders.contains(name)
    }

    pub fn is_forbidden_private(&self, name: &str) -> bool {
        self.block_private_access && name.starts_with('_') && !self.safe_dunders.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_allows_scraping_stack() {
        let policy = WhitelistPolicy::default();
        assert!(policy.permits_import("requests"));
        assert!(policy.permits_import("bs4"));
        assert!(policy.permits_import("urllib.parse"));
        assert!(!policy.permits_import("urllib.request"));
        assert!(!policy.permits_import("subprocess"));
        assert!(!policy.permits_import("os.path"));
    }

    #[test]
    fn test_unrestricted_root_allows_any_submodule() {
        let policy = WhitelistPolicy::default();
        assert!(policy.permits_import("bs4.element"));
        assert!(policy.permits_import("collections.abc"));
    }

    #[test]
    fn test_attribute_exemption() {
        let policy = WhitelistPolicy::default();
        assert!(policy.is_blocked_name("compile", false));
        assert!(!policy.is_blocked_name("compile", true));
        assert!(policy.is_blocked_name("eval", true));
        assert!(!policy.is_blocked_name("find_all", false));
    }

    #[test]
    fn test_dunder_rules() {
        let policy = WhitelistPolicy::default();
        assert!(policy.is_forbidden_dunder("__subclasses__"));
        assert!(policy.is_forbidden_dunder("__class__"));
        assert!(!policy.is_forbidden_dunder("__init__"));
        assert!(!policy.is_forbidden_dunder("____"));
        assert!(!policy.is_forbidden_dunder("_private"));
    }

    #[test]
    fn test_private_rules() {
        let mut policy = WhitelistPolicy::default();
        assert!(policy.is_forbidden_private("_os"));
        assert!(policy.is_forbidden_private("__class__"));
        assert!(!policy.is_forbidden_private("__name__"));
        assert!(!policy.is_forbidden_private("select_one"));
        assert!(policy.blocked_names().any(|n| n == "inspect"));

        policy.block_private_access = false;
        assert!(!policy.is_forbidden_private("_os"));
    }

    #[test]
    fn test_blocked_entries_split() {
        let policy = WhitelistPolicy::default();
        assert!(policy.blocked_names().any(|n| n == "eval"));
        assert!(policy.blocked_names().all(|n| !n.contains('.')));
        assert!(policy.blocked_paths().contains(&vec!["codecs", "open"]));
    }

    #[test]
    fn test_policy_toml_partial_uses_defaults() {
        let policy: WhitelistPolicy =
            toml::from_str("allowed_modules = [\"json\"]\nblock_dunder_access = false\n").unwrap();
        assert_eq!(policy.allowed_modules.len(), 1);
        assert!(!policy.block_dunder_access);
        assert!(policy.blocked_callables.contains("eval"));
    }
}
