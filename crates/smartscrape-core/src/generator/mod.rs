//! Script generator collaborator.
//!
//! The refinement engine never talks to a model directly: it asks a
//! [`ScriptGenerator`] for an initial script or for a repair of a failing
//! one. [`ChatGenerator`] is the chat-completions implementation.

pub mod chat;
pub mod extract;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::diagnostics::DiagnosticPayload;

pub use chat::{ChatConfig, ChatGenerator};
pub use extract::extract_source;

/// What the page analyser hands over about the target page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageSpec {
    pub url: String,
    pub target_description: String,
    pub suggested_selectors: Vec<String>,
    /// Expected record shape, e.g. `{"name": "string", "price": "number"}`.
    pub data_structure: serde_json::Value,
    pub page_type: String,
}

/// Everything the generator needs to repair a failing revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairRequest {
    pub url: String,
    pub goal: String,
    pub failing_source: String,
    pub diagnostic: DiagnosticPayload,
}

#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("generator not configured: {0} is not set")]
    MissingConfig(&'static str),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("generator returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unusable generator response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for GeneratorError {
    fn from(err: reqwest::Error) -> Self {
        GeneratorError::Http(err.to_string())
    }
}

#[async_trait]
pub trait ScriptGenerator: Send + Sync {
    /// Produce an initial script for `goal` on the described page.
    async fn generate(&self, goal: &str, page: &PageSpec) -> Result<String, GeneratorError>;

    /// Produce the next revision from a failing one and its diagnostic.
    async fn repair(&self, request: &RepairRequest) -> Result<String, GeneratorError>;
}
