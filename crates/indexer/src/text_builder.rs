//! Text sent to the embedding provider for each entity

use codeweave_core::CodeEntity;

/// Source longer than this many characters is cut off
pub const MAX_SOURCE_CHARS: usize = 2000;

/// Build the embedding text of an entity
///
/// ```text
/// function: pkg.module.foo
/// Signature: def foo(x)
/// Description: Does foo.
/// Code:
/// def foo(x): ...
/// ```
///
/// Signature, description and code lines appear only when the entity has them.
pub fn build_embedding_text(entity: &CodeEntity) -> String {
    let mut parts = vec![format!("{}: {}", entity.kind, entity.qualified_name)];

    if let Some(signature) = non_empty(&entity.signature) {
        parts.push(format!("Signature: {signature}"));
    }
    if let Some(docstring) = non_empty(&entity.docstring) {
        parts.push(format!("Description: {docstring}"));
    }
    if let Some(source) = non_empty(&entity.source_text) {
        let truncated: String = source.chars().take(MAX_SOURCE_CHARS).collect();
        parts.push(format!("Code:\n{truncated}"));
    }

    parts.join("\n")
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeweave_core::{CodeEntityBuilder, EntityKind, Language};
    use pretty_assertions::assert_eq;

    fn entity() -> CodeEntityBuilder {
        let mut builder = CodeEntityBuilder::default();
        builder
            .repository_id("repo".to_string())
            .qualified_name("pkg.a.foo".to_string())
            .simple_name("foo".to_string())
            .kind(EntityKind::Function)
            .language(Language::Python);
        builder
    }

    #[test]
    fn test_full_entity() {
        let entity = entity()
            .signature(Some("def foo(x)".to_string()))
            .docstring(Some("Does foo.".to_string()))
            .source_text(Some("def foo(x):\n    return x".to_string()))
            .build()
            .unwrap();

        assert_eq!(
            build_embedding_text(&entity),
            "function: pkg.a.foo\nSignature: def foo(x)\nDescription: Does foo.\nCode:\ndef foo(x):\n    return x"
        );
    }

    #[test]
    fn test_missing_parts_are_omitted() {
        let entity = entity().build().unwrap();
        assert_eq!(build_embedding_text(&entity), "function: pkg.a.foo");
    }

    #[test]
    fn test_source_truncated_by_characters() {
        let source = "é".repeat(MAX_SOURCE_CHARS + 10);
        let entity = entity().source_text(Some(source)).build().unwrap();
        let text = build_embedding_text(&entity);
        let code = text.split_once("Code:\n").unwrap().1;
        assert_eq!(code.chars().count(), MAX_SOURCE_CHARS);
    }
}
