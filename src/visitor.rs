use crate::ast::{ComponentDefinition, ConditionalNode, ElementNode, LoopNode, MarkupNode, TextExpressionNode, TextNode};

/// The MarkupVisitor trait is the single traversal mechanism for markup trees.
///
/// Rules:
/// 1. Traversal is pre-order, children left to right.
/// 2. Implementers override `visit_*` methods to add behavior.
/// 3. Implementers call the matching `walk_*` function to continue traversal unless pruning is intended.
pub trait MarkupVisitor {
    fn visit_component(&mut self, component: &ComponentDefinition) {
        walk_component(self, component);
    }

    fn visit_node(&mut self, node: &MarkupNode) {
        walk_node(self, node);
    }

    fn visit_element(&mut self, element: &ElementNode) {
        walk_element(self, element);
    }

    fn visit_text(&mut self, _text: &TextNode) {}

    fn visit_text_expression(&mut self, _text: &TextExpressionNode) {}

    fn visit_conditional(&mut self, conditional: &ConditionalNode) {
        walk_conditional(self, conditional);
    }

    fn visit_loop(&mut self, lp: &LoopNode) {
        walk_loop(self, lp);
    }

    fn visit_children(&mut self, children: &[MarkupNode]) {
        walk_children(self, children);
    }
}

pub fn walk_component<V: MarkupVisitor + ?Sized>(visitor: &mut V, component: &ComponentDefinition) {
    visitor.visit_node(&component.root);
}

pub fn walk_children<V: MarkupVisitor + ?Sized>(visitor: &mut V, children: &[MarkupNode]) {
    for node in children {
        visitor.visit_node(node);
    }
}

pub fn walk_node<V: MarkupVisitor + ?Sized>(visitor: &mut V, node: &MarkupNode) {
    match node {
        MarkupNode::Element(el) => visitor.visit_element(el),
        MarkupNode::Text(t) => visitor.visit_text(t),
        MarkupNode::TextExpression(t) => visitor.visit_text_expression(t),
        MarkupNode::Conditional(c) => visitor.visit_conditional(c),
        MarkupNode::Loop(l) => visitor.visit_loop(l),
    }
}

pub fn walk_element<V: MarkupVisitor + ?Sized>(visitor: &mut V, element: &ElementNode) {
    visitor.visit_children(&element.children);
}

pub fn walk_conditional<V: MarkupVisitor + ?Sized>(visitor: &mut V, conditional: &ConditionalNode) {
    visitor.visit_children(&conditional.consequent);
    visitor.visit_children(&conditional.alternate);
}

pub fn walk_loop<V: MarkupVisitor + ?Sized>(visitor: &mut V, lp: &LoopNode) {
    visitor.visit_children(&lp.body);
}

/// Counts markup nodes by kind. Used for stage logging.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NodeCensus {
    pub elements: usize,
    pub texts: usize,
    pub expressions: usize,
    pub conditionals: usize,
    pub loops: usize,
}

impl MarkupVisitor for NodeCensus {
    fn visit_element(&mut self, element: &ElementNode) {
        self.elements += 1;
        walk_element(self, element);
    }

    fn visit_text(&mut self, _text: &TextNode) {
        self.texts += 1;
    }

    fn visit_text_expression(&mut self, _text: &TextExpressionNode) {
        self.expressions += 1;
    }

    fn visit_conditional(&mut self, conditional: &ConditionalNode) {
        self.conditionals += 1;
        walk_conditional(self, conditional);
    }

    fn visit_loop(&mut self, lp: &LoopNode) {
        self.loops += 1;
        walk_loop(self, lp);
    }
}

impl NodeCensus {
    pub fn of(component: &ComponentDefinition) -> Self {
        let mut census = NodeCensus::default();
        census.visit_component(component);
        census
    }
}
