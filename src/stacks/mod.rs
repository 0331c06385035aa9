//! Stacks and the app that composes them
//!
//! A stack is a named resource graph with outputs, deployed to one
//! [`DeploymentTarget`]. The app owns every stack and the tags applied to all
//! of them.

pub mod compute;
pub mod storage;

use crate::config::DeploymentTarget;
use crate::graph::{Expr, Graph, Tags};
use crate::InfraError;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Named stack output
#[derive(Debug, Clone, PartialEq)]
pub struct Output {
    pub value: Expr,
    pub description: Option<String>,
    /// Cross-stack export name; must be unique per account and region
    pub export_name: Option<String>,
}

/// A named, independently deployed unit of resources
#[derive(Debug, Clone)]
pub struct Stack {
    name: String,
    description: Option<String>,
    target: DeploymentTarget,
    pub graph: Graph,
    outputs: BTreeMap<String, Output>,
    tags: Tags,
}

impl Stack {
    pub fn new(name: impl Into<String>, target: &DeploymentTarget) -> Self {
        Self {
            name: name.into(),
            description: None,
            target: target.clone(),
            graph: Graph::new(),
            outputs: BTreeMap::new(),
            tags: Tags::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn target(&self) -> &DeploymentTarget {
        &self.target
    }

    /// Declare an output; ids must be unique within the stack
    pub fn add_output(&mut self, id: impl Into<String>, output: Output) -> Result<(), InfraError> {
        let id = id.into();
        if self.outputs.contains_key(&id) {
            return Err(InfraError::graph(format!(
                "Duplicate output '{}' in stack {}",
                id, self.name
            )));
        }
        self.outputs.insert(id, output);
        Ok(())
    }

    pub fn outputs(&self) -> &BTreeMap<String, Output> {
        &self.outputs
    }

    pub fn output(&self, id: &str) -> Option<&Output> {
        self.outputs.get(id)
    }

    /// Stack-wide tag; resource-level tags with the same key take precedence
    pub fn add_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(key.into(), value.into());
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    /// Effective tags of a taggable resource: stack tags overlaid by its own
    pub fn effective_tags(&self, own: &Tags) -> Tags {
        let mut tags = self.tags.clone();
        tags.extend(own.iter().map(|(k, v)| (k.clone(), v.clone())));
        tags
    }
}

/// Root of the deployment: every stack plus app-wide tags
#[derive(Debug, Default)]
pub struct App {
    stacks: Vec<Stack>,
}

impl App {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stack; names must be unique
    pub fn add_stack(&mut self, stack: Stack) -> Result<(), InfraError> {
        if self.stack(stack.name()).is_some() {
            return Err(InfraError::graph(format!(
                "Duplicate stack name '{}'",
                stack.name()
            )));
        }
        info!(
            "Added stack {} ({} resources)",
            stack.name(),
            stack.graph.len()
        );
        self.stacks.push(stack);
        Ok(())
    }

    /// Apply a tag to every stack in the app
    pub fn add_tag(&mut self, key: &str, value: &str) {
        for stack in &mut self.stacks {
            debug!("Tagging stack {} with {}={}", stack.name(), key, value);
            stack.add_tag(key, value);
        }
    }

    pub fn stacks(&self) -> &[Stack] {
        &self.stacks
    }

    pub fn stack(&self, name: &str) -> Option<&Stack> {
        self.stacks.iter().find(|s| s.name() == name)
    }

    pub fn stack_names(&self) -> Vec<&str> {
        self.stacks.iter().map(Stack::name).collect()
    }
}
