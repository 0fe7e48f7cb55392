//! Integration tests for Python language support

use codeweave_core::{
    CodeEntity, EntityKind, ExtractionResult, Extractor, Language, RelationKind, Visibility,
};
use codeweave_languages::ExtractorRegistry;

async fn extract(path: &str, source: &str) -> ExtractionResult {
    ExtractorRegistry::with_defaults()
        .extract(path, source.as_bytes(), "test-repo")
        .await
        .expect("Failed to extract entities")
}

/// Helper to filter entities by kind
fn filter_by_kind(entities: &[CodeEntity], kind: EntityKind) -> Vec<&CodeEntity> {
    entities.iter().filter(|e| e.kind == kind).collect()
}

fn unresolved_targets(result: &ExtractionResult, kind: RelationKind) -> Vec<&str> {
    result
        .unresolved
        .iter()
        .filter(|r| r.kind == kind)
        .map(|r| r.target_qualified_name.as_str())
        .collect()
}

#[tokio::test]
async fn test_extract_simple_function() {
    let source = r#"
def greet(name):
    """Say hello."""
    return f"Hello, {name}!"
"#;
    let result = extract("test.py", source).await;

    let functions = filter_by_kind(&result.entities, EntityKind::Function);
    assert_eq!(functions.len(), 1);
    let entity = functions[0];
    assert_eq!(entity.qualified_name, "test.greet");
    assert_eq!(entity.simple_name, "greet");
    assert_eq!(entity.language, Language::Python);
    assert_eq!(entity.repository_id, "test-repo");
    assert_eq!(entity.signature.as_deref(), Some("def greet(name)"));
    assert_eq!(entity.docstring.as_deref(), Some("Say hello."));
    assert_eq!(entity.span.start_line, 2);
    assert!(entity.source_text.as_deref().unwrap_or_default().contains("return"));
}

#[tokio::test]
async fn test_stub_files_are_python() {
    let result = extract("typings/api.pyi", "def fetch(url: str) -> bytes: ...\n").await;
    let functions = filter_by_kind(&result.entities, EntityKind::Function);
    assert_eq!(functions.len(), 1);
    assert_eq!(functions[0].qualified_name, "typings.api.fetch");
}

#[tokio::test]
async fn test_package_init_names_the_package() {
    let result = extract("shop/__init__.py", "from .cart import Cart\n").await;

    let modules = filter_by_kind(&result.entities, EntityKind::Module);
    assert_eq!(modules.len(), 1);
    assert_eq!(modules[0].qualified_name, "shop");
    assert_eq!(
        unresolved_targets(&result, RelationKind::Imports),
        vec!["shop.cart.Cart"]
    );
}

#[tokio::test]
async fn test_relative_import_used_in_function() {
    let source = "from .core import Engine\n\ndef start():\n    return Engine()\n";
    let result = extract("shop/service.py", source).await;

    let instantiation = result
        .unresolved
        .iter()
        .find(|r| r.kind == RelationKind::Instantiates)
        .expect("Engine() is an instantiation");
    assert_eq!(instantiation.target_qualified_name, "shop.core.Engine");
    assert_eq!(instantiation.source_qualified_name, "shop.service.start");
    assert_eq!(instantiation.line_number, Some(4));
}

#[tokio::test]
async fn test_aliased_module_import_qualifies_calls() {
    let result = extract("calc.py", "import numpy as np\n\nnp.array([1, 2])\n").await;
    assert_eq!(
        unresolved_targets(&result, RelationKind::Calls),
        vec!["numpy.array"]
    );
}

#[tokio::test]
async fn test_visibility_follows_naming_convention() {
    let source = "def public():\n    pass\n\ndef _internal():\n    pass\n\nclass Box:\n    def __init__(self):\n        pass\n\n    def __hidden(self):\n        pass\n";
    let result = extract("vis.py", source).await;

    let visibility = |name: &str| {
        result
            .entities
            .iter()
            .find(|e| e.qualified_name == name)
            .map(|e| e.visibility)
    };
    assert_eq!(visibility("vis.public"), Some(Visibility::Public));
    assert_eq!(visibility("vis._internal"), Some(Visibility::Protected));
    assert_eq!(visibility("vis.Box.__init__"), Some(Visibility::Public));
    assert_eq!(visibility("vis.Box.__hidden"), Some(Visibility::Private));
}

#[tokio::test]
async fn test_syntax_errors_still_extract_module() {
    let result = extract("broken.py", "def ok():\n    pass\n\ndef broken(:\n").await;
    let modules = filter_by_kind(&result.entities, EntityKind::Module);
    assert_eq!(modules.len(), 1);
    assert_eq!(modules[0].qualified_name, "broken");
}

#[tokio::test]
async fn test_entity_ids_are_unique() {
    let source = "class A:\n    def run(self):\n        pass\n\nclass B:\n    def run(self):\n        pass\n";
    let result = extract("dup.py", source).await;
    let mut ids: Vec<&str> = result.entities.iter().map(|e| e.id.as_str()).collect();
    let total = ids.len();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), total);
    assert_eq!(filter_by_kind(&result.entities, EntityKind::Method).len(), 2);
}
