//! Context loader
//!
//! Loads context values from a `cdk.json`-style file and layers command line
//! overrides on top. Later sources take precedence.

use super::Context;
use crate::InfraError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Default context file name
pub const DEFAULT_CONTEXT_FILE: &str = "cdk.json";

/// On-disk shape of a context file; everything but `context` is ignored
#[derive(Debug, Default, Deserialize)]
struct ContextFile {
    #[serde(default)]
    context: Context,
}

/// Load the `context` section of a file
///
/// A missing file yields `Ok(None)`. Files ending in `.yaml`/`.yml` are parsed
/// as YAML, everything else as JSON.
pub fn load_context_file(path: impl AsRef<Path>) -> Result<Option<Context>, InfraError> {
    let path = path.as_ref();

    if !path.exists() {
        debug!("No context file at {}", path.display());
        return Ok(None);
    }

    let content = std::fs::read_to_string(path)?;
    let is_yaml = path
        .extension()
        .is_some_and(|e| e == "yaml" || e == "yml");

    let file: ContextFile = if is_yaml {
        serde_yaml::from_str(&content)?
    } else {
        serde_json::from_str(&content)?
    };

    info!(
        "Loaded {} context values from {}",
        file.context.len(),
        path.display()
    );
    Ok(Some(file.context))
}

/// Parse a `key=value` override as given to `--context`
pub fn parse_override(raw: &str) -> Result<(String, String), InfraError> {
    let (key, value) = raw.split_once('=').ok_or_else(|| {
        InfraError::Config(format!("Context override '{}' is not of the form key=value", raw))
    })?;

    let key = key.trim();
    if key.is_empty() {
        return Err(InfraError::Config(format!(
            "Context override '{}' has an empty key",
            raw
        )));
    }

    Ok((key.to_string(), value.to_string()))
}

/// Context loader builder
pub struct ContextLoader {
    file: Option<PathBuf>,
    overrides: Vec<(String, String)>,
}

impl ContextLoader {
    /// Create a loader that reads `cdk.json` from the working directory
    pub fn new() -> Self {
        Self {
            file: Some(PathBuf::from(DEFAULT_CONTEXT_FILE)),
            overrides: Vec::new(),
        }
    }

    /// Read context from a specific file
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Skip the context file entirely
    pub fn skip_file(mut self) -> Self {
        self.file = None;
        self
    }

    /// Add a single override
    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.push((key.into(), value.into()));
        self
    }

    /// Add raw `key=value` overrides
    pub fn with_raw_overrides<I, S>(mut self, raw: I) -> Result<Self, InfraError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for item in raw {
            self.overrides.push(parse_override(item.as_ref())?);
        }
        Ok(self)
    }

    /// Load the file (if any) and apply overrides
    pub fn load(self) -> Result<Context, InfraError> {
        let mut context = Context::new();

        if let Some(path) = &self.file
            && let Some(file_context) = load_context_file(path)?
        {
            context.merge(file_context);
        }

        for (key, value) in self.overrides {
            debug!("Context override {}={}", key, value);
            context.set(key, value);
        }

        Ok(context)
    }
}

impl Default for ContextLoader {
    fn default() -> Self {
        Self::new()
    }
}
