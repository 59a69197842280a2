//! Knowledge-base retrieval.
//!
//! `KnowledgeRetriever` is the seam between Stage 2 and whatever search
//! backend holds the customer's KB. `HttpRetriever` talks to a remote
//! retrieval service; `StaticRetriever` ranks an in-memory document set and
//! backs offline runs and tests.

pub mod http;

use crate::config::{RetrieverConfig, RetrieverKind};
use crate::error::{ConfigError, GroundcheckError, RetrieverError};
use crate::types::KbPassage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

pub use http::HttpRetriever;

/// Fetches the passages of one knowledge base most relevant to a question.
#[async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    /// Return at most `k` passages. An empty list means the KB has nothing
    /// relevant, which is not an error.
    async fn retrieve(
        &self,
        question: &str,
        kb_id: &str,
        k: usize,
    ) -> Result<Vec<KbPassage>, RetrieverError>;

    /// Probe the backend. Retrievers without a remote dependency are always healthy.
    async fn health_check(&self) -> Result<(), RetrieverError> {
        Ok(())
    }

    /// Short name used in logs and the health endpoint.
    fn name(&self) -> &str;
}

#[async_trait]
impl<R: KnowledgeRetriever + ?Sized> KnowledgeRetriever for Arc<R> {
    async fn retrieve(
        &self,
        question: &str,
        kb_id: &str,
        k: usize,
    ) -> Result<Vec<KbPassage>, RetrieverError> {
        (**self).retrieve(question, kb_id, k).await
    }

    async fn health_check(&self) -> Result<(), RetrieverError> {
        (**self).health_check().await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// A document stored in a static knowledge base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KbDocument {
    pub source: String,
    pub content: String,
}

/// One knowledge base in a KB file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub id: String,
    #[serde(default)]
    pub documents: Vec<KbDocument>,
}

/// On-disk layout of a static KB file (TOML or JSON).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeBaseFile {
    #[serde(default)]
    pub knowledge_bases: Vec<KnowledgeBase>,
}

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had",
    "do", "does", "did", "will", "would", "shall", "should", "may", "might", "must", "can",
    "could", "of", "in", "to", "for", "with", "on", "at", "from", "by", "about", "as", "into",
    "this", "that", "these", "those", "it", "its", "and", "but", "or", "how", "what", "where",
    "when", "why", "which", "who", "you", "your", "our", "there", "any", "not",
];

/// Distinct lowercase keywords of a text, stop words removed.
fn keywords(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2 && !STOP_WORDS.contains(w))
        .map(String::from)
        .collect()
}

/// In-memory retriever ranking documents by keyword overlap with the question.
///
/// Confidence is the share of the question's keywords found in the document.
/// Documents with no overlap are never returned.
#[derive(Debug, Clone, Default)]
pub struct StaticRetriever {
    knowledge_bases: HashMap<String, Vec<KbDocument>>,
}

impl StaticRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a document to a knowledge base, creating the KB if needed.
    pub fn with_document(
        mut self,
        kb_id: impl Into<String>,
        source: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        self.insert(
            kb_id.into(),
            KbDocument {
                source: source.into(),
                content: content.into(),
            },
        );
        self
    }

    fn insert(&mut self, kb_id: String, document: KbDocument) {
        self.knowledge_bases.entry(kb_id).or_default().push(document);
    }

    pub fn from_kb_file(file: KnowledgeBaseFile) -> Self {
        let mut retriever = Self::new();
        for kb in file.knowledge_bases {
            for doc in kb.documents {
                retriever.insert(kb.id.clone(), doc);
            }
        }
        retriever
    }

    /// Load knowledge bases from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self, GroundcheckError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }
            .into());
        }
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let file: KnowledgeBaseFile = if is_json {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content).map_err(|e| ConfigError::ParseError {
                message: format!("{}: {}", path.display(), e),
            })?
        };
        let retriever = Self::from_kb_file(file);
        tracing::info!(
            path = %path.display(),
            knowledge_bases = retriever.knowledge_bases.len(),
            documents = retriever.document_count(),
            "Loaded static knowledge bases"
        );
        Ok(retriever)
    }

    pub fn document_count(&self) -> usize {
        self.knowledge_bases.values().map(Vec::len).sum()
    }

    fn rank(&self, question: &str, kb_id: &str, k: usize) -> Vec<KbPassage> {
        let Some(documents) = self.knowledge_bases.get(kb_id) else {
            return Vec::new();
        };
        let terms = keywords(question);
        if terms.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<KbPassage> = documents
            .iter()
            .filter_map(|doc| {
                let doc_terms = keywords(&doc.content);
                let matched = terms.iter().filter(|t| doc_terms.contains(*t)).count();
                if matched == 0 {
                    return None;
                }
                Some(KbPassage::new(
                    doc.content.clone(),
                    doc.source.clone(),
                    matched as f64 / terms.len() as f64,
                ))
            })
            .collect();
        // Stable sort keeps file order among equal scores.
        scored.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        scored.truncate(k);
        scored
    }
}

#[async_trait]
impl KnowledgeRetriever for StaticRetriever {
    async fn retrieve(
        &self,
        question: &str,
        kb_id: &str,
        k: usize,
    ) -> Result<Vec<KbPassage>, RetrieverError> {
        Ok(self.rank(question, kb_id, k))
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// Build the retriever selected by configuration.
pub fn create_retriever(
    config: &RetrieverConfig,
) -> Result<Arc<dyn KnowledgeRetriever>, GroundcheckError> {
    match config.kind {
        RetrieverKind::Http => Ok(Arc::new(HttpRetriever::new(config)?)),
        RetrieverKind::Static => match &config.kb_file {
            Some(path) => Ok(Arc::new(StaticRetriever::from_file(path)?)),
            None => {
                tracing::warn!("Static retriever has no kb_file; every question will be out of scope");
                Ok(Arc::new(StaticRetriever::new()))
            }
        },
    }
}
