//! Synthesis-time configuration
//!
//! Context values (`environment`, `project`, ...) and the deployment target
//! (account/region) that every stack is built against.

pub mod loader;

pub use loader::ContextLoader;

use crate::InfraError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Context key holding the deployment environment name
pub const ENVIRONMENT_KEY: &str = "environment";

/// Context key holding the project name
pub const PROJECT_KEY: &str = "project";

/// Optional context key pinning the compute stack to a specific VPC
pub const VPC_ID_KEY: &str = "vpc-id";

/// Public subnet for the GitLab server; set together with [`VPC_ID_KEY`]
pub const SUBNET_ID_KEY: &str = "subnet-id";

/// Environment value that selects production retention behavior
pub const PRODUCTION_ENVIRONMENT: &str = "prod";

/// Named configuration values resolved at synthesis time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context {
    values: BTreeMap<String, serde_json::Value>,
}

impl Context {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a context value, replacing any previous value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Builder-style variant of [`Context::set`]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Look up a value as a string
    ///
    /// Scalars are stringified; `null`, empty and whitespace-only strings are
    /// treated as absent. Arrays and objects are rendered as JSON.
    pub fn get(&self, key: &str) -> Option<String> {
        let value = match self.values.get(key)? {
            serde_json::Value::Null => return None,
            serde_json::Value::String(s) => s.trim().to_string(),
            other => other.to_string(),
        };

        if value.is_empty() { None } else { Some(value) }
    }

    /// Look up a value that must be present
    pub fn require(&self, key: &str) -> Result<String, InfraError> {
        self.get(key).ok_or_else(|| InfraError::missing_context(key))
    }

    /// Merge another context on top of this one (the overlay wins)
    pub fn merge(&mut self, overlay: Context) {
        self.values.extend(overlay.values);
    }

    /// Number of values in the context
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the context holds no values
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Account and region a stack is deployed to
///
/// Passed explicitly into every stack; nothing below the CLI reads the
/// process environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentTarget {
    pub account: Option<String>,
    pub region: Option<String>,
}

impl DeploymentTarget {
    /// Create a fully specified target
    pub fn new(account: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            account: Some(account.into()),
            region: Some(region.into()),
        }
    }

    /// Environment string used in the cloud assembly manifest
    pub fn environment_string(&self) -> String {
        format!(
            "aws://{}/{}",
            self.account.as_deref().unwrap_or("unknown-account"),
            self.region.as_deref().unwrap_or("unknown-region")
        )
    }

    /// Whether both account and region are known
    pub fn is_resolved(&self) -> bool {
        self.account.is_some() && self.region.is_some()
    }
}
