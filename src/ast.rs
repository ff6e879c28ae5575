use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════════════════════════
// COMPONENT DEFINITION
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

/// One component as handed over by the front-end parser.
/// Immutable for the whole compile invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDefinition {
    pub name: String,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub states: Vec<StateDeclaration>,
    #[serde(default)]
    pub handlers: Vec<HandlerDeclaration>,
    pub root: MarkupNode,
}

/// Reactivity kinds a state declaration may carry. Only mutable scalars exist;
/// derived/computed state is not part of the language.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ReactivityKind {
    #[default]
    MutableScalar,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDeclaration {
    pub name: String,
    /// JavaScript expression source
    pub initial_value: String,
    #[serde(default)]
    pub kind: ReactivityKind,
    #[serde(default)]
    pub location: SourceLocation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerDeclaration {
    pub name: String,
    /// JavaScript statement source, parameter-less
    pub body: String,
    #[serde(default)]
    pub location: SourceLocation,
}

// ═══════════════════════════════════════════════════════════════════════════════
// MARKUP TREE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MarkupNode {
    Element(ElementNode),
    Text(TextNode),
    TextExpression(TextExpressionNode),
    Conditional(ConditionalNode),
    Loop(LoopNode),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementNode {
    pub tag: String,
    #[serde(default)]
    pub attributes: Vec<AttributeIR>,
    #[serde(default)]
    pub children: Vec<MarkupNode>,
    /// event name -> handler identifier, in declaration order
    #[serde(default)]
    pub events: IndexMap<String, String>,
    #[serde(default)]
    pub location: SourceLocation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextNode {
    pub value: String,
    #[serde(default)]
    pub location: SourceLocation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextExpressionNode {
    pub expression: String,
    #[serde(default)]
    pub location: SourceLocation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalNode {
    pub condition: String,
    pub consequent: Vec<MarkupNode>,
    #[serde(default)]
    pub alternate: Vec<MarkupNode>,
    #[serde(default)]
    pub location: SourceLocation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopNode {
    pub source: String,
    pub item_var: String,
    #[serde(default)]
    pub index_var: Option<String>,
    /// Key expression over the loop variables. Items are keyed by identity when absent.
    #[serde(default)]
    pub key: Option<String>,
    pub body: Vec<MarkupNode>,
    #[serde(default)]
    pub location: SourceLocation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Static(String),
    Dynamic(ExpressionIR),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpressionIR {
    pub code: String,
    #[serde(default)]
    pub location: SourceLocation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeIR {
    pub name: String,
    pub value: AttributeValue,
    #[serde(default)]
    pub location: SourceLocation,
}

impl MarkupNode {
    pub fn location(&self) -> &SourceLocation {
        match self {
            MarkupNode::Element(e) => &e.location,
            MarkupNode::Text(t) => &t.location,
            MarkupNode::TextExpression(t) => &t.location,
            MarkupNode::Conditional(c) => &c.location,
            MarkupNode::Loop(l) => &l.location,
        }
    }

    /// Short label used in diagnostics and log lines.
    pub fn label(&self) -> String {
        match self {
            MarkupNode::Element(e) => format!("<{}>", e.tag),
            MarkupNode::Text(_) => "text".to_string(),
            MarkupNode::TextExpression(t) => format!("{{{}}}", t.expression.trim()),
            MarkupNode::Conditional(c) => format!("if ({})", c.condition.trim()),
            MarkupNode::Loop(l) => format!("each {} as {}", l.source.trim(), l.item_var),
        }
    }
}
