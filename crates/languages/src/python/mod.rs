//! Python language extractor
//!
//! Produces one module entity per file, plus classes, functions, methods and
//! module-level variables. Containment edges are emitted directly. Imports,
//! calls, base classes and annotated types become relations when their target
//! is defined in the same file and unresolved references otherwise.

mod imports;
pub mod module_path;
mod queries;

use crate::syntax::{
    decode_source, find_capture_node, line_of, node_span, node_text, owning_ancestor,
};
use async_trait::async_trait;
use codeweave_core::{
    file_id_for, CodeEntity, CodeEntityBuilder, CodeRelation, EntityKind, Error, ExtractionResult,
    Extractor, Language, RelationKind, Result, UnresolvedReference, Visibility,
};
use imports::{parse_imports, ImportMap};
use module_path::{derive_module_path, ModulePath};
use queries::{call_query, type_ref_query};
use std::collections::{HashMap, HashSet};
use streaming_iterator::StreamingIterator;
use tracing::debug;
use tree_sitter::{Node, Parser, QueryCursor};

/// Builtins never worth a reference
const SKIP_NAMES: &[&str] = &[
    "print", "len", "str", "int", "float", "bool", "bytes", "list", "dict", "set", "tuple",
    "range", "enumerate", "zip", "map", "filter", "sorted", "reversed", "min", "max", "sum", "any",
    "all", "abs", "round", "isinstance", "issubclass", "hasattr", "getattr", "setattr", "delattr",
    "type", "id", "repr", "hash", "super", "next", "iter", "open", "input", "object", "None",
    "Exception", "ValueError", "TypeError", "KeyError", "RuntimeError",
];

/// Tree-sitter based extractor for `.py` and `.pyi` files
#[derive(Debug, Default, Clone, Copy)]
pub struct PythonExtractor;

impl PythonExtractor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Extractor for PythonExtractor {
    fn supports(&self, language: Language) -> bool {
        language == Language::Python
    }

    async fn extract(
        &self,
        path: &str,
        bytes: &[u8],
        repository_id: &str,
    ) -> Result<ExtractionResult> {
        let source = decode_source(path, bytes)?;

        let mut parser = Parser::new();
        parser
            .set_language(&tree_sitter_python::LANGUAGE.into())
            .map_err(|e| Error::extraction(path, format!("Failed to load grammar: {e}"), false))?;
        let tree = parser
            .parse(source, None)
            .ok_or_else(|| Error::extraction(path, "Parser produced no tree", true))?;
        let root = tree.root_node();
        if root.has_error() {
            debug!(path, "Python file has syntax errors, extracting what parsed");
        }

        let module = derive_module_path(path);
        let mut builder = FileExtraction::new(path, repository_id, source, module);
        builder.extract_definitions(root)?;
        let imports = parse_imports(root, source, &builder.module);
        builder.link_imports(&imports);
        builder.link_bases(&imports);
        builder.link_calls(root, &imports);
        builder.link_type_refs(root, &imports);

        debug!(
            path,
            entities = builder.result.entities.len(),
            relations = builder.result.relations.len(),
            unresolved = builder.result.unresolved.len(),
            "Extracted Python file"
        );
        Ok(builder.result)
    }
}

/// Working state while extracting one file
struct FileExtraction<'a> {
    path: &'a str,
    repository_id: &'a str,
    file_id: String,
    source: &'a str,
    module: ModulePath,
    result: ExtractionResult,
    /// tree-sitter node id -> index of the entity extracted from it
    owners: HashMap<usize, usize>,
    by_qualified_name: HashMap<String, usize>,
    /// Module-level names defined in this file -> qualified name
    locals: HashMap<String, String>,
    /// Base class expressions per class entity index
    bases: Vec<(usize, String, usize)>,
    linked: HashSet<(usize, String, RelationKind)>,
}

impl<'a> FileExtraction<'a> {
    fn new(path: &'a str, repository_id: &'a str, source: &'a str, module: ModulePath) -> Self {
        Self {
            path,
            repository_id,
            file_id: file_id_for(repository_id, path),
            source,
            module,
            result: ExtractionResult::default(),
            owners: HashMap::new(),
            by_qualified_name: HashMap::new(),
            locals: HashMap::new(),
            bases: Vec::new(),
            linked: HashSet::new(),
        }
    }

    fn text(&self, node: Node) -> &'a str {
        node_text(node, self.source)
    }

    fn push_entity(
        &mut self,
        node: Node,
        qualified_name: String,
        kind: EntityKind,
        signature: Option<String>,
        docstring: Option<String>,
        parent: Option<usize>,
    ) -> Result<usize> {
        let simple_name = qualified_name
            .rsplit('.')
            .next()
            .unwrap_or(&qualified_name)
            .to_string();
        let entity: CodeEntity = CodeEntityBuilder::default()
            .repository_id(self.repository_id)
            .file_id(self.file_id.clone())
            .qualified_name(qualified_name.clone())
            .simple_name(simple_name.clone())
            .kind(kind)
            .language(Language::Python)
            .span(node_span(node))
            .signature(signature)
            .docstring(docstring)
            .source_text(Some(self.text(node).to_string()))
            .visibility(visibility_of(&simple_name))
            .build()
            .map_err(|e| Error::extraction(self.path, format!("Invalid entity: {e}"), false))?;

        let index = self.result.entities.len();
        if let Some(parent) = parent {
            let relation = CodeRelation::new(
                self.result.entities[parent].id.clone(),
                entity.id.clone(),
                RelationKind::Contains,
                self.repository_id,
            )
            .with_line(Some(line_of(node)));
            self.result.relations.push(relation);
        }
        self.owners.insert(node.id(), index);
        self.by_qualified_name.entry(qualified_name).or_insert(index);
        self.result.entities.push(entity);
        Ok(index)
    }

    fn extract_definitions(&mut self, root: Node) -> Result<()> {
        let docstring = block_docstring(root, self.source);
        let module_name = self.module.name.clone();
        let module = self.push_entity(root, module_name, EntityKind::Module, None, docstring, None)?;
        self.walk_block(root, module, true)
    }

    /// Extract definitions directly inside `block`
    ///
    /// `top_level` is true for the module body, where names become importable
    /// locals and plain assignments become variables.
    fn walk_block(&mut self, block: Node, parent: usize, top_level: bool) -> Result<()> {
        let mut cursor = block.walk();
        let children: Vec<Node> = block.named_children(&mut cursor).collect();
        for child in children {
            let (outer, definition) = match child.kind() {
                "decorated_definition" => match child.child_by_field_name("definition") {
                    Some(definition) => (child, definition),
                    None => continue,
                },
                _ => (child, child),
            };
            match definition.kind() {
                "function_definition" => self.extract_function(outer, definition, parent, top_level)?,
                "class_definition" => self.extract_class(outer, definition, parent, top_level)?,
                "expression_statement" if top_level => self.extract_assignment(child, parent)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn extract_function(
        &mut self,
        outer: Node,
        node: Node,
        parent: usize,
        top_level: bool,
    ) -> Result<()> {
        let Some(name_node) = node.child_by_field_name("name") else {
            return Ok(());
        };
        let name = self.text(name_node);
        let parent_entity = &self.result.entities[parent];
        let kind = if parent_entity.kind == EntityKind::Class {
            EntityKind::Method
        } else {
            EntityKind::Function
        };
        let qualified_name = format!("{}.{name}", parent_entity.qualified_name);

        let params = node
            .child_by_field_name("parameters")
            .map(|p| self.text(p))
            .unwrap_or("()");
        let is_async = self.text(node).starts_with("async");
        let mut signature = format!("{}def {name}{params}", if is_async { "async " } else { "" });
        if let Some(return_type) = node.child_by_field_name("return_type") {
            signature.push_str(" -> ");
            signature.push_str(self.text(return_type));
        }
        let docstring = node
            .child_by_field_name("body")
            .and_then(|body| block_docstring(body, self.source));

        if top_level {
            self.locals.insert(name.to_string(), qualified_name.clone());
        }
        let index = self.push_entity(
            outer,
            qualified_name,
            kind,
            Some(signature),
            docstring,
            Some(parent),
        )?;
        // Calls anywhere in the definition, decorators included, belong to it
        self.owners.insert(node.id(), index);
        Ok(())
    }

    fn extract_class(&mut self, outer: Node, node: Node, parent: usize, top_level: bool) -> Result<()> {
        let Some(name_node) = node.child_by_field_name("name") else {
            return Ok(());
        };
        let name = self.text(name_node);
        let qualified_name = format!("{}.{name}", self.result.entities[parent].qualified_name);
        let superclasses = node.child_by_field_name("superclasses");
        let signature = format!(
            "class {name}{}",
            superclasses.map(|s| self.text(s)).unwrap_or("")
        );
        let body = node.child_by_field_name("body");
        let docstring = body.and_then(|b| block_docstring(b, self.source));

        if top_level {
            self.locals.insert(name.to_string(), qualified_name.clone());
        }
        let index = self.push_entity(
            outer,
            qualified_name,
            EntityKind::Class,
            Some(signature),
            docstring,
            Some(parent),
        )?;
        self.owners.insert(node.id(), index);

        if let Some(arguments) = superclasses {
            let mut cursor = arguments.walk();
            for base in arguments.named_children(&mut cursor) {
                if matches!(base.kind(), "identifier" | "attribute") {
                    self.bases
                        .push((index, self.text(base).to_string(), line_of(base)));
                }
            }
        }

        if let Some(body) = body {
            self.walk_block(body, index, false)?;
        }
        Ok(())
    }

    /// Module-level `NAME = ...` / `name: T = ...`
    fn extract_assignment(&mut self, statement: Node, parent: usize) -> Result<()> {
        let Some(assignment) = statement.named_child(0) else {
            return Ok(());
        };
        if assignment.kind() != "assignment" {
            return Ok(());
        }
        let Some(left) = assignment.child_by_field_name("left") else {
            return Ok(());
        };
        if left.kind() != "identifier" {
            return Ok(());
        }
        let name = self.text(left);
        if name == "__all__" {
            return Ok(());
        }
        let kind = if name.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_') {
            EntityKind::Constant
        } else {
            EntityKind::Variable
        };
        let qualified_name = format!("{}.{name}", self.module.name);
        self.locals.insert(name.to_string(), qualified_name.clone());
        self.push_entity(statement, qualified_name, kind, None, None, Some(parent))?;
        Ok(())
    }

    /// Qualify a dotted expression as written at a reference site
    ///
    /// Returns the target qualified name and, for method calls on unknown
    /// receivers, the receiver expression.
    fn qualify(
        &self,
        dotted: &str,
        class_scope: Option<&str>,
        imports: &ImportMap,
    ) -> Option<(String, Option<String>)> {
        let parts: Vec<&str> = dotted.split('.').collect();
        if parts.iter().any(|p| !is_identifier(p)) {
            return None;
        }
        let (head, rest) = parts.split_first()?;

        if matches!(*head, "self" | "cls") {
            let class = class_scope?;
            return match rest {
                [method] => Some((format!("{class}.{method}"), None)),
                [.., receiver, method] => Some((method.to_string(), Some(receiver.to_string()))),
                [] => None,
            };
        }

        let base = imports
            .resolve(head)
            .map(str::to_string)
            .or_else(|| self.locals.get(*head).cloned());
        if let Some(base) = base {
            let mut target = base;
            for part in rest {
                target.push('.');
                target.push_str(part);
            }
            return Some((target, None));
        }

        match rest {
            [] => {
                if SKIP_NAMES.contains(head) {
                    None
                } else {
                    Some((head.to_string(), None))
                }
            }
            [.., method] => {
                let receiver = parts[..parts.len() - 1].join(".");
                Some((method.to_string(), Some(receiver)))
            }
        }
    }

    /// Record a reference from entity `source` to `target`
    fn link(
        &mut self,
        source: usize,
        target: String,
        kind: RelationKind,
        line: usize,
        receiver_expr: Option<String>,
    ) {
        if !self.linked.insert((source, target.clone(), kind)) {
            return;
        }
        let source_entity = &self.result.entities[source];
        match self.by_qualified_name.get(&target) {
            Some(&target_index) => {
                let relation = CodeRelation::new(
                    source_entity.id.clone(),
                    self.result.entities[target_index].id.clone(),
                    kind,
                    self.repository_id,
                )
                .with_line(Some(line));
                self.result.relations.push(relation);
            }
            None => {
                let reference = UnresolvedReference {
                    source_entity_id: source_entity.id.clone(),
                    source_qualified_name: source_entity.qualified_name.clone(),
                    target_qualified_name: target,
                    kind,
                    line_number: Some(line),
                    receiver_expr,
                };
                self.result.unresolved.push(reference);
            }
        }
    }

    fn link_imports(&mut self, imports: &ImportMap) {
        for imported in imports.imports() {
            self.link(0, imported.target.clone(), RelationKind::Imports, imported.line, None);
        }
    }

    fn link_bases(&mut self, imports: &ImportMap) {
        let bases = std::mem::take(&mut self.bases);
        for (class, base, line) in bases {
            if let Some((target, _)) = self.qualify(&base, None, imports) {
                self.link(class, target, RelationKind::Extends, line, None);
            }
        }
    }

    /// Class a reference inside entity `owner` resolves `self` against
    fn class_scope(&self, owner: usize) -> Option<String> {
        let entity = &self.result.entities[owner];
        match entity.kind {
            EntityKind::Class => Some(entity.qualified_name.clone()),
            EntityKind::Method => entity
                .qualified_name
                .rsplit_once('.')
                .map(|(class, _)| class.to_string()),
            _ => None,
        }
    }

    fn link_calls(&mut self, root: Node, imports: &ImportMap) {
        let Some(query) = call_query() else {
            return;
        };
        let source = self.source;
        let mut sites = Vec::new();
        {
            let mut cursor = QueryCursor::new();
            let mut matches = cursor.matches(query, root, source.as_bytes());
            while let Some(query_match) = matches.next() {
                let call = find_capture_node(query_match, query, "call");
                let callee = find_capture_node(query_match, query, "callee");
                if let (Some(call), Some(callee)) = (call, callee) {
                    let owner = owning_ancestor(call, &self.owners).unwrap_or(0);
                    sites.push((owner, node_text(callee, source), line_of(call)));
                }
            }
        }

        for (owner, callee, line) in sites {
            let class_scope = self.class_scope(owner);
            let Some((target, receiver)) = self.qualify(callee, class_scope.as_deref(), imports)
            else {
                continue;
            };
            let simple = target.rsplit('.').next().unwrap_or(&target);
            let kind = if simple.starts_with(|c: char| c.is_ascii_uppercase()) {
                RelationKind::Instantiates
            } else {
                RelationKind::Calls
            };
            self.link(owner, target, kind, line, receiver);
        }
    }

    fn link_type_refs(&mut self, root: Node, imports: &ImportMap) {
        let Some(query) = type_ref_query() else {
            return;
        };
        let source = self.source;
        let mut sites = Vec::new();
        {
            let mut cursor = QueryCursor::new();
            let mut matches = cursor.matches(query, root, source.as_bytes());
            while let Some(query_match) = matches.next() {
                if let Some(type_ref) = find_capture_node(query_match, query, "type_ref") {
                    let owner = owning_ancestor(type_ref, &self.owners).unwrap_or(0);
                    sites.push((owner, node_text(type_ref, source), line_of(type_ref)));
                }
            }
        }

        for (owner, type_name, line) in sites {
            let Some((target, _)) = self.qualify(type_name, None, imports) else {
                continue;
            };
            // Bare builtin types (`str`, `int`) are dropped by `qualify`
            self.link(owner, target, RelationKind::UsesType, line, None);
        }
    }
}

fn is_identifier(part: &str) -> bool {
    !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_')
        && !part.starts_with(|c: char| c.is_ascii_digit())
}

fn visibility_of(simple_name: &str) -> Visibility {
    if simple_name.starts_with("__") && simple_name.ends_with("__") {
        Visibility::Public
    } else if simple_name.starts_with("__") {
        Visibility::Private
    } else if simple_name.starts_with('_') {
        Visibility::Protected
    } else {
        Visibility::Public
    }
}

/// Docstring of a module or definition body: a leading string statement
fn block_docstring(block: Node, source: &str) -> Option<String> {
    let first = block.named_child(0)?;
    if first.kind() != "expression_statement" {
        return None;
    }
    let string = first.named_child(0)?;
    if string.kind() != "string" {
        return None;
    }
    let cleaned = clean_docstring(node_text(string, source));
    (!cleaned.is_empty()).then_some(cleaned)
}

fn clean_docstring(raw: &str) -> String {
    let unprefixed = raw.trim_start_matches(['r', 'R', 'u', 'U', 'b', 'B']);
    for quote in ["\"\"\"", "'''", "\"", "'"] {
        if let Some(inner) = unprefixed
            .strip_prefix(quote)
            .and_then(|s| s.strip_suffix(quote))
        {
            return inner.trim().to_string();
        }
    }
    unprefixed.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn extract(path: &str, source: &str) -> ExtractionResult {
        PythonExtractor::new()
            .extract(path, source.as_bytes(), "repo-1")
            .await
            .unwrap()
    }

    fn names(result: &ExtractionResult) -> Vec<(String, EntityKind)> {
        result
            .entities
            .iter()
            .map(|e| (e.qualified_name.clone(), e.kind))
            .collect()
    }

    fn targets(result: &ExtractionResult, kind: RelationKind) -> Vec<String> {
        result
            .unresolved
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| r.target_qualified_name.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_definitions_and_containment() {
        let source = r#""""Payments."""

RETRIES = 3

class Client(Base):
    """Talks to the gateway."""

    def send(self, payload: dict) -> bool:
        return self.encode(payload)

    def encode(self, payload):
        return payload

def helper():
    pass
"#;
        let result = extract("billing/client.py", source).await;
        assert_eq!(
            names(&result),
            vec![
                ("billing.client".to_string(), EntityKind::Module),
                ("billing.client.RETRIES".to_string(), EntityKind::Constant),
                ("billing.client.Client".to_string(), EntityKind::Class),
                ("billing.client.Client.send".to_string(), EntityKind::Method),
                ("billing.client.Client.encode".to_string(), EntityKind::Method),
                ("billing.client.helper".to_string(), EntityKind::Function),
            ]
        );

        let module = &result.entities[0];
        assert_eq!(module.docstring.as_deref(), Some("Payments."));
        let class = &result.entities[2];
        assert_eq!(class.docstring.as_deref(), Some("Talks to the gateway."));
        assert_eq!(class.signature.as_deref(), Some("class Client(Base)"));
        let send = &result.entities[3];
        assert_eq!(
            send.signature.as_deref(),
            Some("def send(self, payload: dict) -> bool")
        );
        assert!(result
            .entities
            .iter()
            .all(|e| e.file_id == file_id_for("repo-1", "billing/client.py")));

        let contains = result
            .relations
            .iter()
            .filter(|r| r.kind == RelationKind::Contains)
            .count();
        assert_eq!(contains, 5);
    }

    #[tokio::test]
    async fn test_self_calls_bind_within_the_file() {
        let source = "class Client:\n    def send(self):\n        self.encode()\n\n    def encode(self):\n        pass\n";
        let result = extract("client.py", source).await;
        let send = result
            .entities
            .iter()
            .find(|e| e.qualified_name == "client.Client.send")
            .unwrap();
        let encode = result
            .entities
            .iter()
            .find(|e| e.qualified_name == "client.Client.encode")
            .unwrap();
        assert!(result.relations.iter().any(|r| r.kind == RelationKind::Calls
            && r.source_id == send.id
            && r.target_id == encode.id));
        assert!(result.unresolved.is_empty());
    }

    #[tokio::test]
    async fn test_imported_call_from_module_level() {
        let result = extract("b.py", "from a import foo\nfoo()\n").await;
        assert_eq!(names(&result), vec![("b".to_string(), EntityKind::Module)]);
        assert_eq!(targets(&result, RelationKind::Imports), vec!["a.foo"]);
        assert_eq!(targets(&result, RelationKind::Calls), vec!["a.foo"]);
        assert!(result
            .unresolved
            .iter()
            .all(|r| r.source_qualified_name == "b"));
    }

    #[tokio::test]
    async fn test_receiver_calls_and_instantiation() {
        let source = "from svc import Engine\n\ndef run(client):\n    engine = Engine()\n    client.send_batch()\n    print(engine)\n";
        let result = extract("main.py", source).await;
        assert_eq!(targets(&result, RelationKind::Instantiates), vec!["svc.Engine"]);

        let call = result
            .unresolved
            .iter()
            .find(|r| r.kind == RelationKind::Calls)
            .unwrap();
        assert_eq!(call.target_qualified_name, "send_batch");
        assert_eq!(call.receiver_expr.as_deref(), Some("client"));
        assert_eq!(call.source_qualified_name, "main.run");
    }

    #[tokio::test]
    async fn test_bases_and_type_annotations() {
        let source = "from models import Record\n\nclass Base:\n    pass\n\nclass Child(Base, Record):\n    def load(self, r: Record) -> str:\n        pass\n";
        let result = extract("types.py", source).await;
        let extends_local = result.relations.iter().any(|r| r.kind == RelationKind::Extends);
        assert!(extends_local);
        assert_eq!(targets(&result, RelationKind::Extends), vec!["models.Record"]);
        assert_eq!(targets(&result, RelationKind::UsesType), vec!["models.Record"]);
    }

    #[tokio::test]
    async fn test_repeated_calls_are_deduplicated() {
        let result = extract("loop.py", "def go():\n    tick()\n    tick()\n").await;
        assert_eq!(targets(&result, RelationKind::Calls), vec!["tick"]);
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_not_recoverable() {
        let err = PythonExtractor::new()
            .extract("bad.py", &[0xff, 0xfe, 0x00], "repo-1")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Extraction {
                recoverable: false,
                ..
            }
        ));
    }

    #[test]
    fn test_visibility_follows_naming() {
        assert_eq!(visibility_of("__init__"), Visibility::Public);
        assert_eq!(visibility_of("__secret"), Visibility::Private);
        assert_eq!(visibility_of("_internal"), Visibility::Protected);
        assert_eq!(visibility_of("run"), Visibility::Public);
    }
}
