//! Error types for magicmail-infra

use thiserror::Error;

/// Main error type for magicmail-infra operations
#[derive(Error, Debug)]
pub enum InfraError {
    #[error(
        "Context variable '{key}' must be set in cdk.json or via --context (e.g. -c {key}=value)"
    )]
    MissingContext { key: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Resource graph error: {0}")]
    Graph(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("User-data error: {0}")]
    UserData(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Command execution failed: {0}")]
    Command(String),

    #[error("Timeout waiting for {0}")]
    Timeout(String),
}

impl InfraError {
    /// Create a missing context error
    pub fn missing_context(key: impl Into<String>) -> Self {
        Self::MissingContext { key: key.into() }
    }

    /// Create a graph error
    pub fn graph(message: impl Into<String>) -> Self {
        Self::Graph(message.into())
    }
}

impl From<reqwest::Error> for InfraError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

impl From<minijinja::Error> for InfraError {
    fn from(e: minijinja::Error) -> Self {
        Self::Template(e.to_string())
    }
}
