//! Code entities, relations and the vector records derived from them

use chrono::{DateTime, Utc};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Kind of code entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntityKind {
    Module,
    Class,
    Interface,
    Function,
    Method,
    Variable,
    Constant,
    TypeAlias,
    Enum,
}

/// Programming language of a file or entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Language {
    Python,
    Rust,
    JavaScript,
    TypeScript,
    Go,
    Unknown,
}

impl Language {
    /// Guess the language from a file path's extension
    pub fn from_path(path: &str) -> Self {
        let extension = path.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
        match extension {
            "py" | "pyi" => Self::Python,
            "rs" => Self::Rust,
            "js" | "jsx" | "mjs" | "cjs" => Self::JavaScript,
            "ts" | "tsx" => Self::TypeScript,
            "go" => Self::Go,
            _ => Self::Unknown,
        }
    }
}

/// Visibility of an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Visibility {
    Public,
    Private,
    Protected,
}

/// Source span, 1-indexed lines and 0-indexed columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceSpan {
    pub start_line: usize,
    pub end_line: usize,
    pub start_column: usize,
    pub end_column: usize,
}

impl SourceSpan {
    pub fn new(start_line: usize, end_line: usize, start_column: usize, end_column: usize) -> Self {
        Self {
            start_line,
            end_line,
            start_column,
            end_column,
        }
    }
}

/// A code entity produced by the most recent extraction of a file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[builder(setter(into))]
pub struct CodeEntity {
    /// Opaque identifier, fresh for every extraction
    #[builder(default = "uuid::Uuid::new_v4().to_string()")]
    pub id: String,

    /// Owning repository
    pub repository_id: String,

    /// Owning file; filled in by the pipeline when the extractor does not know it
    #[builder(default)]
    pub file_id: String,

    /// Fully scoped name, e.g. `pkg.module.Class.method`
    pub qualified_name: String,

    /// Last segment of the qualified name
    pub simple_name: String,

    pub kind: EntityKind,

    pub language: Language,

    #[builder(default)]
    pub span: SourceSpan,

    #[builder(default = "None")]
    pub signature: Option<String>,

    #[builder(default = "None")]
    pub docstring: Option<String>,

    #[builder(default = "None")]
    pub source_text: Option<String>,

    #[builder(default = "Visibility::Public")]
    pub visibility: Visibility,

    /// Identifier of the vector stored for this entity, once embedded
    #[builder(default = "None")]
    pub vector_id: Option<String>,
}

/// Kind of directed relation between two entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RelationKind {
    Contains,
    Extends,
    Implements,
    Imports,
    Calls,
    Instantiates,
    UsesType,
    References,
}

impl RelationKind {
    /// Entity kinds a reference of this kind most plausibly targets, best first
    pub fn preferred_target_kinds(&self) -> &'static [EntityKind] {
        match self {
            Self::Extends => &[EntityKind::Class, EntityKind::Interface],
            Self::Implements => &[EntityKind::Interface],
            Self::Calls => &[EntityKind::Function, EntityKind::Method],
            Self::Imports => &[EntityKind::Module, EntityKind::Class, EntityKind::Function],
            Self::Instantiates => &[EntityKind::Class],
            Self::UsesType => &[
                EntityKind::Class,
                EntityKind::TypeAlias,
                EntityKind::Interface,
            ],
            Self::Contains | Self::References => &[],
        }
    }
}

/// Directed edge between two entities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeRelation {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    pub kind: RelationKind,
    /// Repository of the source entity
    pub repository_id: String,
    pub is_cross_repository: bool,
    pub line_number: Option<usize>,
}

impl CodeRelation {
    /// Create a same-repository relation with a fresh id
    pub fn new(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        kind: RelationKind,
        repository_id: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_id: source_id.into(),
            target_id: target_id.into(),
            kind,
            repository_id: repository_id.into(),
            is_cross_repository: false,
            line_number: None,
        }
    }

    pub fn with_line(mut self, line_number: Option<usize>) -> Self {
        self.line_number = line_number;
        self
    }

    pub fn cross_repository(mut self, is_cross_repository: bool) -> Self {
        self.is_cross_repository = is_cross_repository;
        self
    }
}

/// Status of a deferred reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReferenceStatus {
    Pending,
    Resolved,
    Failed,
}

/// A symbol mention whose target was not known when its file was indexed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingReference {
    pub id: String,
    pub source_entity_id: String,
    pub source_qualified_name: String,
    pub source_repository_id: String,
    /// Full or partial (suffix) qualified name of the target
    pub target_qualified_name: String,
    pub kind: RelationKind,
    pub status: ReferenceStatus,
    pub attempts: u32,
    pub resolved_target_id: Option<String>,
    pub line_number: Option<usize>,
    /// Receiver of a method call (`client` in `client.send()`), used as a hint
    pub receiver_expr: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PendingReference {
    /// Create a fresh pending reference from an unresolved extraction result
    pub fn from_unresolved(reference: &UnresolvedReference, source_repository_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_entity_id: reference.source_entity_id.clone(),
            source_qualified_name: reference.source_qualified_name.clone(),
            source_repository_id: source_repository_id.to_string(),
            target_qualified_name: reference.target_qualified_name.clone(),
            kind: reference.kind,
            status: ReferenceStatus::Pending,
            attempts: 0,
            resolved_target_id: None,
            line_number: reference.line_number,
            receiver_expr: reference.receiver_expr.clone(),
            created_at: Utc::now(),
        }
    }
}

/// A reference reported by the extractor that it could not bind itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedReference {
    pub source_entity_id: String,
    pub source_qualified_name: String,
    pub target_qualified_name: String,
    pub kind: RelationKind,
    pub line_number: Option<usize>,
    pub receiver_expr: Option<String>,
}

/// Metadata stored next to a vector and used for filtering at query time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorMetadata {
    pub repository_id: String,
    pub file_id: String,
    pub file_path: String,
    pub qualified_name: String,
    pub kind: EntityKind,
    pub language: Language,
}

/// Embedding of one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub entity_id: String,
    pub vector: Vec<f32>,
    pub metadata: VectorMetadata,
}

/// Nearest-neighbour hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredVector {
    pub entity_id: String,
    /// Cosine similarity, higher is closer
    pub score: f32,
    pub metadata: VectorMetadata,
}

/// Metadata filters applied to vector search
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilters {
    pub repository_id: Option<String>,
    pub language: Option<Language>,
    pub kind: Option<EntityKind>,
    pub file_path: Option<String>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.repository_id.is_none()
            && self.language.is_none()
            && self.kind.is_none()
            && self.file_path.is_none()
    }

    /// Whether a vector's metadata passes every set filter
    pub fn matches(&self, metadata: &VectorMetadata) -> bool {
        self.repository_id
            .as_ref()
            .is_none_or(|repo| repo == &metadata.repository_id)
            && self.language.is_none_or(|lang| lang == metadata.language)
            && self.kind.is_none_or(|kind| kind == metadata.kind)
            && self
                .file_path
                .as_ref()
                .is_none_or(|path| path == &metadata.file_path)
    }
}

/// Cosine similarity of two equally sized vectors; 0.0 when either is all zeros
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
