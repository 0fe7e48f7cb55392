//! Language extractors for codeweave
//!
//! Ships a tree-sitter Python extractor and a registry that dispatches files
//! to the extractor for their language.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

mod python;
pub mod syntax;

pub use python::module_path::{derive_module_path, ModulePath};
pub use python::PythonExtractor;

use async_trait::async_trait;
use codeweave_core::{Error, ExtractionResult, Extractor, Language, Result};
use std::sync::Arc;

/// Dispatches extraction to the first registered extractor supporting the
/// file's language
#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    extractors: Vec<Arc<dyn Extractor>>,
}

impl ExtractorRegistry {
    /// Registry with every bundled extractor
    pub fn with_defaults() -> Self {
        Self::default().register(Arc::new(PythonExtractor::new()))
    }

    pub fn register(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractors.push(extractor);
        self
    }

    fn extractor_for(&self, language: Language) -> Option<&Arc<dyn Extractor>> {
        self.extractors.iter().find(|e| e.supports(language))
    }
}

#[async_trait]
impl Extractor for ExtractorRegistry {
    fn supports(&self, language: Language) -> bool {
        self.extractor_for(language).is_some()
    }

    async fn extract(
        &self,
        path: &str,
        bytes: &[u8],
        repository_id: &str,
    ) -> Result<ExtractionResult> {
        let language = Language::from_path(path);
        let Some(extractor) = self.extractor_for(language) else {
            return Err(Error::extraction(
                path,
                format!("No extractor for language '{language}'"),
                false,
            ));
        };
        extractor.extract(path, bytes, repository_id).await
    }
}
