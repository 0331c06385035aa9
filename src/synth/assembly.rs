//! Cloud assembly output
//!
//! Layout of the synthesis output directory:
//! - `<stack>.template.json` - one template per stack
//! - `manifest.json` - stack artifacts with their target environment

use super::synthesize;
use crate::stacks::App;
use crate::InfraError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Default output directory
pub const DEFAULT_OUTPUT_DIR: &str = "cdk.out";

/// Manifest schema version written to `manifest.json`
pub const MANIFEST_VERSION: &str = "36.0.0";

const STACK_ARTIFACT_TYPE: &str = "aws:cloudformation:stack";

/// `manifest.json` contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub artifacts: BTreeMap<String, Artifact>,
}

/// One deployable artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub environment: String,
    pub properties: ArtifactProperties,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactProperties {
    pub template_file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Result of writing an assembly
#[derive(Debug, Clone)]
pub struct Assembly {
    pub directory: PathBuf,
    pub manifest: Manifest,
}

impl Assembly {
    /// Path of a stack's template inside the assembly
    pub fn template_path(&self, stack: &str) -> Option<PathBuf> {
        self.manifest
            .artifacts
            .get(stack)
            .map(|a| self.directory.join(&a.properties.template_file))
    }
}

/// File name of a stack template
pub fn template_file_name(stack: &str) -> String {
    format!("{}.template.json", stack)
}

/// Synthesize every stack and write templates plus manifest to `dir`
///
/// All stacks are synthesized before anything is written, so a failing stack
/// leaves no partial assembly behind.
pub fn write_assembly(app: &App, dir: impl AsRef<Path>) -> Result<Assembly, InfraError> {
    let dir = dir.as_ref();

    let mut rendered = Vec::with_capacity(app.stacks().len());
    for stack in app.stacks() {
        rendered.push((stack, synthesize(stack)?));
    }

    std::fs::create_dir_all(dir)?;

    let mut artifacts = BTreeMap::new();
    for (stack, template) in rendered {
        let file_name = template_file_name(stack.name());
        std::fs::write(dir.join(&file_name), serde_json::to_string_pretty(&template)?)?;
        info!("Wrote {}", dir.join(&file_name).display());

        artifacts.insert(
            stack.name().to_string(),
            Artifact {
                artifact_type: STACK_ARTIFACT_TYPE.to_string(),
                environment: stack.target().environment_string(),
                properties: ArtifactProperties {
                    template_file: file_name,
                    description: stack.description().map(String::from),
                },
                display_name: Some(stack.name().to_string()),
            },
        );
    }

    let manifest = Manifest {
        version: MANIFEST_VERSION.to_string(),
        artifacts,
    };
    std::fs::write(
        dir.join("manifest.json"),
        serde_json::to_string_pretty(&manifest)?,
    )?;

    Ok(Assembly {
        directory: dir.to_path_buf(),
        manifest,
    })
}
