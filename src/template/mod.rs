//! Jinja2-compatible template rendering
//!
//! Renders shell script templates with named substitution points. Undefined
//! variables are an error, so a template can never silently emit an empty
//! path where a value was expected.

use crate::InfraError;
use minijinja::{Environment, UndefinedBehavior, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// Template renderer with a fixed variable context
pub struct TemplateRenderer {
    env: Environment<'static>,
    context: BTreeMap<String, Value>,
}

impl TemplateRenderer {
    /// Create a new template renderer
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);

        Self {
            env,
            context: BTreeMap::new(),
        }
    }

    /// Add a variable to the context
    pub fn add_var(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.context.insert(name.into(), value.into());
    }

    /// Add a serializable value (lists, maps) to the context
    pub fn add_serialized<T: serde::Serialize>(&mut self, name: impl Into<String>, value: &T) {
        self.context.insert(name.into(), Value::from_serialize(value));
    }

    /// Whether a variable is set
    pub fn has_var(&self, name: &str) -> bool {
        self.context.contains_key(name)
    }

    /// Render a template string
    ///
    /// `name` only identifies the template in log lines and error messages.
    pub fn render(&self, name: &str, template: &str) -> Result<String, InfraError> {
        debug!("Rendering template {}", name);

        self.env
            .render_str(template, &self.context)
            .map_err(|e| InfraError::Template(format!("{}: {}", name, e)))
    }
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_simple() {
        let mut renderer = TemplateRenderer::new();
        renderer.add_var("mount_point", "/var/opt/gitlab");

        let rendered = renderer
            .render("t.sh", "mkdir -p \"{{ mount_point }}\"\n")
            .unwrap();
        assert_eq!(rendered, "mkdir -p \"/var/opt/gitlab\"\n");
    }

    #[test]
    fn test_shell_syntax_passes_through() {
        let renderer = TemplateRenderer::new();
        let script = "UUID=$(blkid -s UUID -o value \"$DATA_DEVICE\")\n[ -b \"${DEV}\" ] || true";
        assert_eq!(renderer.render("t.sh", script).unwrap(), script);
    }

    #[test]
    fn test_render_list_join() {
        let mut renderer = TemplateRenderer::new();
        renderer.add_serialized("packages", &vec!["curl", "perl"]);

        let rendered = renderer
            .render("t.sh", "apt-get install -y {{ packages | join(\" \") }}")
            .unwrap();
        assert_eq!(rendered, "apt-get install -y curl perl");
    }

    #[test]
    fn test_render_missing_variable_is_error() {
        let renderer = TemplateRenderer::new();
        let result = renderer.render("t.sh", "mkdir -p {{ missing_var }}");
        assert!(matches!(result, Err(InfraError::Template(_))));
    }

    #[test]
    fn test_render_invalid_syntax() {
        let renderer = TemplateRenderer::new();
        let result = renderer.render("t.sh", "value: {{ invalid");
        assert!(result.is_err());
    }

    #[test]
    fn test_has_var() {
        let mut renderer = TemplateRenderer::default();
        assert!(!renderer.has_var("x"));
        renderer.add_var("x", 1);
        assert!(renderer.has_var("x"));
    }
}
