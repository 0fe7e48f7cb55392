//! Python import table
//!
//! Maps the local names an import statement binds to the qualified names they
//! stand for, so call sites and base classes can be qualified before they are
//! handed to the resolver.

use super::module_path::{resolve_relative_import, ModulePath};
use super::queries::import_query;
use crate::syntax::{find_capture_node, line_of, node_text};
use std::collections::HashMap;
use streaming_iterator::StreamingIterator;
use tree_sitter::{Node, QueryCursor};

/// One imported qualified name and the line that imports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedName {
    pub target: String,
    pub line: usize,
}

/// Local name -> qualified name bindings of one file
#[derive(Debug, Default)]
pub struct ImportMap {
    mappings: HashMap<String, String>,
    imports: Vec<ImportedName>,
}

impl ImportMap {
    fn add(&mut self, local_name: &str, target: String, line: usize) {
        self.mappings.insert(local_name.to_string(), target.clone());
        if !self.imports.iter().any(|i| i.target == target) {
            self.imports.push(ImportedName { target, line });
        }
    }

    /// Qualified name bound to `local_name`, if imported
    pub fn resolve(&self, local_name: &str) -> Option<&str> {
        self.mappings.get(local_name).map(String::as_str)
    }

    /// Every imported qualified name, in source order
    pub fn imports(&self) -> &[ImportedName] {
        &self.imports
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

/// Parse every import statement under `root`
///
/// Absolute imports keep their dotted names as written; relative imports are
/// resolved against `module`. Wildcard imports bind nothing.
pub fn parse_imports(root: Node, source: &str, module: &ModulePath) -> ImportMap {
    let mut import_map = ImportMap::default();
    let Some(query) = import_query() else {
        return import_map;
    };

    let mut cursor = QueryCursor::new();
    let mut matches = cursor.matches(query, root, source.as_bytes());

    while let Some(query_match) = matches.next() {
        let capture = |name: &str| find_capture_node(query_match, query, name);
        let text = |node: Node| node_text(node, source);

        // from module import name
        if let (Some(m), Some(n)) = (capture("module"), capture("name")) {
            let name = text(n);
            import_map.add(name, format!("{}.{name}", text(m)), line_of(n));
        }

        // from module import name as alias
        if let (Some(m), Some(n), Some(a)) = (
            capture("from_module"),
            capture("aliased_name"),
            capture("alias"),
        ) {
            import_map.add(text(a), format!("{}.{}", text(m), text(n)), line_of(n));
        }

        // from .module import name
        if let (Some(r), Some(n)) = (capture("relative_module"), capture("rel_name")) {
            let name = text(n);
            let target = resolve_relative_import(module, text(r), Some(name));
            import_map.add(name, target, line_of(n));
        }

        // from .module import name as alias
        if let (Some(r), Some(n), Some(a)) = (
            capture("rel_from_module"),
            capture("rel_aliased_name"),
            capture("rel_alias"),
        ) {
            let target = resolve_relative_import(module, text(r), Some(text(n)));
            import_map.add(text(a), target, line_of(n));
        }

        // import pkg.module binds `pkg`
        if let Some(n) = capture("import_name") {
            let dotted = text(n);
            let local = dotted.split('.').next().unwrap_or(dotted);
            import_map.mappings.insert(local.to_string(), local.to_string());
            if !import_map.imports.iter().any(|i| i.target == dotted) {
                import_map.imports.push(ImportedName {
                    target: dotted.to_string(),
                    line: line_of(n),
                });
            }
        }

        // import pkg.module as alias
        if let (Some(n), Some(a)) = (capture("import_aliased_name"), capture("import_alias")) {
            import_map.add(text(a), text(n).to_string(), line_of(n));
        }
    }

    import_map
}
