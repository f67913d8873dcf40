//! Payload and result shapes of the forwarded server requests

use lsp_types::{InlineValueContext, Position, Range};
use serde::{Deserialize, Serialize};

/// Inline value variants: literal text, variable lookup or expression
pub use lsp_types::InlineValue;

/// Request names understood by the server
pub mod methods {
    pub const GET_TESTS_FROM_WORKSPACE: &str = "discovering/getTestsFromWorkspace";
    pub const GET_TESTS_FROM_DOCUMENT: &str = "discovering/getTestsFromDocument";
    pub const GET_EVALUATABLE_EXPRESSION: &str = "debugging/getEvaluatableExpression";
    pub const GET_INLINE_VALUES: &str = "debugging/getInlineValues";
    pub const CLEAR_CACHE: &str = "cache/clear";
}

/// Node of the discovered test tree
///
/// `children: None` is a node not expanded yet; `Some(vec![])` is a node
/// known to be empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<TestItem>>,
    pub label: String,
    pub long_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<Range>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl TestItem {
    pub fn is_expanded(&self) -> bool {
        self.children.is_some()
    }

    /// Depth-first walk over this item and its descendants
    pub fn walk(&self) -> Vec<&TestItem> {
        let mut items = vec![self];
        for child in self.children.iter().flatten() {
            items.extend(child.walk());
        }
        items
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetTestsFromWorkspaceParams {
    pub workspace_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paths: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suites: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetTestsFromDocumentParams {
    pub document_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluatableExpressionParams {
    pub document_uri: String,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluatableExpression {
    pub range: Range,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineValuesParams {
    pub document_uri: String,
    pub viewport: Range,
    pub context: InlineValueContext,
}
