//! Tree-sitter queries for Python reference extraction
//!
//! Queries are compiled once per process and cached.

use std::sync::OnceLock;
use tree_sitter::Query;

/// Import statements, absolute and relative, with and without aliases
pub const IMPORT_QUERY_SOURCE: &str = r#"
    ; from module import name
    (import_from_statement
      module_name: (dotted_name) @module
      name: (dotted_name) @name)

    ; from module import name as alias
    (import_from_statement
      module_name: (dotted_name) @from_module
      (aliased_import
        name: (dotted_name) @aliased_name
        alias: (identifier) @alias))

    ; from . import name / from .module import name
    (import_from_statement
      module_name: (relative_import) @relative_module
      name: (dotted_name) @rel_name)

    ; from .module import name as alias
    (import_from_statement
      module_name: (relative_import) @rel_from_module
      (aliased_import
        name: (dotted_name) @rel_aliased_name
        alias: (identifier) @rel_alias))

    ; import module
    (import_statement
      name: (dotted_name) @import_name)

    ; import module as alias
    (import_statement
      (aliased_import
        name: (dotted_name) @import_aliased_name
        alias: (identifier) @import_alias))
"#;

/// Call sites whose callee is a name or an attribute chain
pub const CALL_QUERY_SOURCE: &str = r#"
    (call
      function: [(identifier) (attribute)] @callee) @call
"#;

/// Type names used in annotations
pub const TYPE_REF_QUERY_SOURCE: &str = r#"
    (type (identifier) @type_ref)
    (type (attribute) @type_ref)
"#;

static IMPORT_QUERY: OnceLock<Option<Query>> = OnceLock::new();
static CALL_QUERY: OnceLock<Option<Query>> = OnceLock::new();
static TYPE_REF_QUERY: OnceLock<Option<Query>> = OnceLock::new();

fn compile(source: &str) -> Option<Query> {
    let language = tree_sitter_python::LANGUAGE.into();
    match Query::new(&language, source) {
        Ok(query) => Some(query),
        Err(e) => {
            tracing::error!(error = %e, "Failed to compile Python query");
            None
        }
    }
}

pub fn import_query() -> Option<&'static Query> {
    IMPORT_QUERY.get_or_init(|| compile(IMPORT_QUERY_SOURCE)).as_ref()
}

pub fn call_query() -> Option<&'static Query> {
    CALL_QUERY.get_or_init(|| compile(CALL_QUERY_SOURCE)).as_ref()
}

pub fn type_ref_query() -> Option<&'static Query> {
    TYPE_REF_QUERY
        .get_or_init(|| compile(TYPE_REF_QUERY_SOURCE))
        .as_ref()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queries_compile() {
        assert!(import_query().is_some());
        assert!(call_query().is_some());
        assert!(type_ref_query().is_some());
    }
}
