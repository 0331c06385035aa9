//! Template value expressions
//!
//! A small subset of CloudFormation intrinsic functions, enough to express
//! references between nodes and the composed output strings.

use super::LogicalId;
use serde_json::{Value, json};

/// A value that may reference other nodes or template parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// Plain string
    Literal(String),
    /// `Ref` of a node or parameter
    Ref(LogicalId),
    /// `Fn::GetAtt` of a node attribute
    GetAtt(LogicalId, String),
    /// `Fn::Join` with an empty delimiter
    Join(Vec<Expr>),
    /// `Fn::Base64`
    Base64(Box<Expr>),
    /// `AWS::Partition` pseudo parameter
    Partition,
}

impl Expr {
    pub fn literal(s: impl Into<String>) -> Self {
        Self::Literal(s.into())
    }

    pub fn reference(id: &LogicalId) -> Self {
        Self::Ref(id.clone())
    }

    pub fn get_att(id: &LogicalId, attribute: impl Into<String>) -> Self {
        Self::GetAtt(id.clone(), attribute.into())
    }

    /// Logical ids this expression refers to
    pub fn references(&self) -> Vec<&LogicalId> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a LogicalId>) {
        match self {
            Expr::Ref(id) | Expr::GetAtt(id, _) => out.push(id),
            Expr::Join(parts) => parts.iter().for_each(|p| p.collect_references(out)),
            Expr::Base64(inner) => inner.collect_references(out),
            Expr::Literal(_) | Expr::Partition => {}
        }
    }

    /// Render as template JSON
    pub fn to_json(&self) -> Value {
        match self {
            Expr::Literal(s) => Value::String(s.clone()),
            Expr::Ref(id) => json!({ "Ref": id.as_str() }),
            Expr::GetAtt(id, attr) => json!({ "Fn::GetAtt": [id.as_str(), attr] }),
            Expr::Join(parts) => {
                let parts: Vec<Value> = parts.iter().map(Expr::to_json).collect();
                json!({ "Fn::Join": ["", parts] })
            }
            Expr::Base64(inner) => json!({ "Fn::Base64": inner.to_json() }),
            Expr::Partition => json!({ "Ref": "AWS::Partition" }),
        }
    }
}

impl From<&str> for Expr {
    fn from(s: &str) -> Self {
        Self::literal(s)
    }
}

impl From<String> for Expr {
    fn from(s: String) -> Self {
        Self::Literal(s)
    }
}
