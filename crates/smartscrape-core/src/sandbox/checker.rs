//! Static policy check over the tree-sitter Python syntax tree.
//!
//! The checker never executes candidate source. It parses it, refuses
//! anything with syntax errors, then walks the tree in source order and
//! reports the first import or name reference the policy does not allow.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tree_sitter::{Node, Parser, Tree};

use super::policy::WhitelistPolicy;
use super::verdict::PolicyResult;
use crate::domain::SourceLocation;

thread_local! {
    static PYTHON_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        // A failed language load surfaces as a `None` tree at parse time.
        let _ = p.set_language(&tree_sitter_python::LANGUAGE.into());
        p
    });
}

fn parse(source: &str) -> Option<Tree> {
    PYTHON_PARSER.with(|p| p.borrow_mut().parse(source, None))
}

fn text<'s>(node: Node<'_>, source: &'s str) -> &'s str {
    source.get(node.byte_range()).unwrap_or("")
}

fn location_of(node: Node<'_>) -> SourceLocation {
    let point = node.start_position();
    SourceLocation::new(point.row + 1, point.column + 1)
}

/// `os . path` and `os.path` name the same module.
fn dotted(node: Node<'_>, source: &str) -> String {
    text(node, source)
        .split('.')
        .map(str::trim)
        .collect::<Vec<_>>()
        .join(".")
}

fn children<'t>(node: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.children(&mut cursor).collect()
}

fn field_children<'t>(node: Node<'t>, field: &str) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.children_by_field_name(field, &mut cursor).collect()
}

/// Checks candidate scripts against a shared [`WhitelistPolicy`].
#[derive(Debug, Clone)]
pub struct PolicyChecker {
    policy: Arc<WhitelistPolicy>,
}

impl PolicyChecker {
    pub fn new(policy: Arc<WhitelistPolicy>) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &Arc<WhitelistPolicy> {
        &self.policy
    }

    /// Check `source`. Deterministic: the same source and policy always give
    /// the same verdict.
    pub fn check(&self, source: &str) -> PolicyResult {
        let Some(tree) = parse(source) else {
            return PolicyResult::ParseError {
                message: "python grammar unavailable".to_string(),
                location: SourceLocation::new(1, 1),
            };
        };
        let root = tree.root_node();
        if root.has_error() {
            return first_syntax_error(root, source);
        }

        let walker = Walker {
            policy: &self.policy,
            source,
            aliases: collect_aliases(root, source),
            blocked_paths: self.policy.blocked_paths(),
        };
        match walker.walk(root) {
            Ok(()) => PolicyResult::Approved,
            Err(rejection) => rejection,
        }
    }
}

fn first_syntax_error(root: Node<'_>, source: &str) -> PolicyResult {
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if node.is_missing() {
            return PolicyResult::ParseError {
                message: format!("missing '{}'", node.kind()),
                location: location_of(node),
            };
        }
        if node.is_error() {
            let near: String = text(node, source)
                .lines()
                .next()
                .unwrap_or("")
                .chars()
                .take(40)
                .collect();
            return PolicyResult::ParseError {
                message: format!("invalid syntax near '{}'", near.trim()),
                location: location_of(node),
            };
        }
        if node.has_error() {
            stack.extend(children(node).into_iter().rev());
        }
    }
    PolicyResult::ParseError {
        message: "invalid syntax".to_string(),
        location: location_of(root),
    }
}

/// Local name -> dotted path it was bound to by an import statement.
fn collect_aliases(root: Node<'_>, source: &str) -> HashMap<String, String> {
    let mut aliases = HashMap::new();
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        match node.kind() {
            "import_statement" => {
                for name in field_children(node, "name") {
                    if name.kind() == "aliased_import" {
                        if let (Some(path), Some(alias)) = (
                            name.child_by_field_name("name"),
                            name.child_by_field_name("alias"),
                        ) {
                            aliases.insert(text(alias, source).to_string(), dotted(path, source));
                        }
                    }
                }
            }
            "import_from_statement" => {
                let Some(module) = node.child_by_field_name("module_name") else {
                    continue;
                };
                if module.kind() == "relative_import" {
                    continue;
                }
                let module = dotted(module, source);
                for name in field_children(node, "name") {
                    let (path, local) = match name.kind() {
                        "aliased_import" => match (
                            name.child_by_field_name("name"),
                            name.child_by_field_name("alias"),
                        ) {
                            (Some(path), Some(alias)) => {
                                (dotted(path, source), text(alias, source).to_string())
                            }
                            _ => continue,
                        },
                        _ => {
                            let path = dotted(name, source);
                            (path.clone(), path)
                        }
                    };
                    aliases.insert(local, format!("{module}.{path}"));
                }
            }
            _ => stack.extend(children(node)),
        }
    }
    aliases
}

/// `a.b.c` as segments when the chain is made only of names.
fn attribute_chain<'s>(node: Node<'_>, source: &'s str) -> Option<Vec<&'s str>> {
    match node.kind() {
        "identifier" => Some(vec![text(node, source)]),
        "attribute" => {
            let mut chain = attribute_chain(node.child_by_field_name("object")?, source)?;
            chain.push(text(node.child_by_field_name("attribute")?, source));
            Some(chain)
        }
        _ => None,
    }
}

fn contains_window(haystack: &[&str], needle: &[&str]) -> bool {
    !needle.is_empty()
        && haystack.len() >= needle.len()
        && haystack.windows(needle.len()).any(|w| w == needle)
}

fn in_attribute_position(node: Node<'_>) -> bool {
    node.parent()
        .filter(|p| p.kind() == "attribute")
        .and_then(|p| p.child_by_field_name("attribute"))
        .is_some_and(|attr| attr.id() == node.id())
}

struct Walker<'a> {
    policy: &'a WhitelistPolicy,
    source: &'a str,
    aliases: HashMap<String, String>,
    blocked_paths: Vec<Vec<&'a str>>,
}

type Check = Result<(), PolicyResult>;

impl<'a> Walker<'a> {
    fn walk(&self, root: Node<'_>) -> Check {
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            match node.kind() {
                "import_statement" => {
                    self.check_import(node)?;
                    continue;
                }
                "import_from_statement" => {
                    self.check_from_import(node)?;
                    continue;
                }
                "future_import_statement" => {
                    self.check_module_path("__future__", node)?;
                    continue;
                }
                "exec_statement" => self.check_name("exec", node, false)?,
                "identifier" => self.check_identifier(node)?,
                "attribute" => {
                    if let Some(chain) = attribute_chain(node, self.source) {
                        self.check_resolved(&chain, node)?;
                    }
                }
                _ => {}
            }
            stack.extend(children(node).into_iter().rev());
        }
        Ok(())
    }

    fn violation(&self, reason: String, symbol: &str, node: Node<'_>) -> PolicyResult {
        PolicyResult::Violation {
            reason,
            offending_symbol: symbol.to_string(),
            location: location_of(node),
        }
    }

    fn check_module_path(&self, path: &str, node: Node<'_>) -> Check {
        if self.policy.permits_import(path) {
            Ok(())
        } else {
            Err(self.violation(format!("import of '{path}' is not permitted"), path, node))
        }
    }

    fn check_import(&self, node: Node<'_>) -> Check {
        for name in field_children(node, "name") {
            let path_node = if name.kind() == "aliased_import" {
                name.child_by_field_name("name").unwrap_or(name)
            } else {
                name
            };
            self.check_module_path(&dotted(path_node, self.source), path_node)?;
        }
        Ok(())
    }

    fn check_from_import(&self, node: Node<'_>) -> Check {
        let Some(module_node) = node.child_by_field_name("module_name") else {
            return Ok(());
        };
        if module_node.kind() == "relative_import" {
            if self.policy.allow_relative_imports {
                return Ok(());
            }
            let module = text(module_node, self.source);
            return Err(self.violation(
                format!("relative import '{module}' is not permitted"),
                module,
                module_node,
            ));
        }

        let module = dotted(module_node, self.source);
        self.check_module_path(&module, module_node)?;

        for name in field_children(node, "name") {
            let name_node = if name.kind() == "aliased_import" {
                name.child_by_field_name("name").unwrap_or(name)
            } else {
                name
            };
            self.check_private(&dotted(name_node, self.source), name_node)?;
        }

        // `from urllib import request` names a submodule of a restricted root.
        let root = WhitelistPolicy::root_of(&module);
        if module != root || !self.policy.allowed_submodules.contains_key(root) {
            return Ok(());
        }
        for name in field_children(node, "name") {
            let name_node = if name.kind() == "aliased_import" {
                name.child_by_field_name("name").unwrap_or(name)
            } else {
                name
            };
            let path = format!("{module}.{}", dotted(name_node, self.source));
            self.check_module_path(&path, name_node)?;
        }
        Ok(())
    }

    fn check_name(&self, name: &str, node: Node<'_>, attribute_position: bool) -> Check {
        if self.policy.is_blocked_name(name, attribute_position) {
            return Err(self.violation(format!("use of blocked name '{name}'"), name, node));
        }
        Ok(())
    }

    fn check_identifier(&self, node: Node<'_>) -> Check {
        let name = text(node, self.source);
        let attribute_position = in_attribute_position(node);
        self.check_name(name, node, attribute_position)?;

        if attribute_position {
            if self.policy.is_forbidden_dunder(name) {
                return Err(self.violation(
                    format!("access to dunder attribute '{name}' is not permitted"),
                    name,
                    node,
                ));
            }
            self.check_private(name, node)?;
        } else if self.aliases.contains_key(name) {
            self.check_resolved(&[name], node)?;
        }
        Ok(())
    }

    fn check_private(&self, name: &str, node: Node<'_>) -> Check {
        if self.policy.is_forbidden_private(name) {
            return Err(self.violation(
                format!("access to private attribute '{name}' is not permitted"),
                name,
                node,
            ));
        }
        Ok(())
    }

    /// Match dotted block-list entries against a chain with its import alias
    /// expanded (`o.system` after `import os as o` is `os.system`).
    fn check_resolved(&self, chain: &[&str], node: Node<'_>) -> Check {
        if self.blocked_paths.is_empty() {
            return Ok(());
        }
        let Some((base, rest)) = chain.split_first() else {
            return Ok(());
        };
        let mut resolved: Vec<&str> = match self.aliases.get(*base) {
            Some(path) => path.split('.').collect(),
            None => vec![*base],
        };
        resolved.extend_from_slice(rest);

        for blocked in &self.blocked_paths {
            if contains_window(&resolved, blocked) {
                let symbol = blocked.join(".");
                return Err(self.violation(
                    format!("use of blocked callable '{symbol}'"),
                    &symbol,
                    node,
                ));
            }
        }
        Ok(())
    }
}

/// Root modules imported by `source` (absolute imports only). Empty when the
/// source does not parse.
pub fn imported_modules(source: &str) -> BTreeSet<String> {
    let mut modules = BTreeSet::new();
    let Some(tree) = parse(source) else {
        return modules;
    };
    let mut stack = vec![tree.root_node()];
    while let Some(node) = stack.pop() {
        match node.kind() {
            "import_statement" => {
                for name in field_children(node, "name") {
                    let path_node = name.child_by_field_name("name").unwrap_or(name);
                    let path = dotted(path_node, source);
                    modules.insert(WhitelistPolicy::root_of(&path).to_string());
                }
            }
            "import_from_statement" => {
                if let Some(module) = node
                    .child_by_field_name("module_name")
                    .filter(|m| m.kind() != "relative_import")
                {
                    let path = dotted(module, source);
                    modules.insert(WhitelistPolicy::root_of(&path).to_string());
                }
            }
            _ => stack.extend(children(node)),
        }
    }
    modules
}
