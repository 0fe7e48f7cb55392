//! The extraction capability: turns file contents into entities and relations

use crate::entities::{CodeEntity, CodeRelation, Language, UnresolvedReference};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Output of extracting one file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub entities: Vec<CodeEntity>,
    /// Relations whose both ends are among `entities`
    pub relations: Vec<CodeRelation>,
    /// References the extractor could not bind within the file
    pub unresolved: Vec<UnresolvedReference>,
}

impl ExtractionResult {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Parses a file into entities and relations
///
/// Implementations report failures as [`crate::Error::Extraction`], flagging
/// whether retrying the same bytes could succeed.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Whether this extractor handles `language`
    fn supports(&self, language: Language) -> bool;

    /// Extract entities from one file
    ///
    /// # Arguments
    /// * `path` - Path relative to the repository root
    /// * `bytes` - Raw file contents
    /// * `repository_id` - Repository the file belongs to
    ///
    /// # Returns
    /// Entities with fresh ids, relations between them, and unresolved references
    async fn extract(&self, path: &str, bytes: &[u8], repository_id: &str)
        -> Result<ExtractionResult>;
}
