use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

use crate::analyze::{
    AnalyzedAttribute, AnalyzedExpr, AnalyzedNode, ComponentAnalysis, DependencySet, EventBinding,
};
use crate::ast::SourceLocation;
use crate::error::{CompilerError, ErrorKind};

// ═══════════════════════════════════════════════════════════════════════════════
// HANDLES
// ═══════════════════════════════════════════════════════════════════════════════

/// Runtime handle of a node that is referenced after `create()`. Numbered from 1 per fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SlotId(pub u32);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FragmentId(pub u32);

impl fmt::Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fragment_{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block_{}", self.0)
    }
}

/// Either a slot or a create-time temporary that nothing touches after `create()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "kebab-case")]
pub enum NodeRef {
    Slot(SlotId),
    Temp(u32),
}

impl NodeRef {
    pub fn slot(self) -> Option<SlotId> {
        match self {
            NodeRef::Slot(slot) => Some(slot),
            NodeRef::Temp(_) => None,
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRef::Slot(slot) => slot.fmt(f),
            NodeRef::Temp(n) => write!(f, "t{}", n),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PLAN
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Branch {
    Consequent,
    Alternate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum FragmentKind {
    Root,
    #[serde(rename_all = "camelCase")]
    ConditionalBranch {
        parent: FragmentId,
        block: BlockId,
        branch: Branch,
    },
    #[serde(rename_all = "camelCase")]
    LoopItem {
        parent: FragmentId,
        block: BlockId,
        item_var: String,
        index_var: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PlannedNodeKind {
    Element {
        tag: String,
        attributes: Vec<AnalyzedAttribute>,
        events: Vec<EventBinding>,
    },
    Text {
        value: String,
    },
    /// Text produced by an expression, static or not
    DynamicText {
        expr: AnalyzedExpr,
    },
    /// Comment node the block's fragments are inserted before
    Anchor {
        block: BlockId,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedNode {
    pub node: NodeRef,
    /// `None` for root-level nodes of the fragment
    pub parent: Option<NodeRef>,
    pub kind: PlannedNodeKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedFragment {
    pub id: FragmentId,
    pub kind: FragmentKind,
    /// Every node of the fragment in depth-first, left-to-right order
    pub nodes: Vec<PlannedNode>,
    /// Root-level slots in document order
    pub roots: Vec<SlotId>,
    /// Loop variables visible inside the fragment, outermost first
    pub locals: Vec<String>,
}

impl PlannedFragment {
    /// Blocks anchored in this fragment, in slot order.
    pub fn owned_blocks(&self) -> Vec<BlockId> {
        self.nodes
            .iter()
            .filter_map(|n| match n.kind {
                PlannedNodeKind::Anchor { block } => Some(block),
                _ => None,
            })
            .collect()
    }

    pub fn slot_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.node.slot().is_some()).count()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BlockKind {
    Conditional {
        condition: AnalyzedExpr,
        consequent: Option<FragmentId>,
        alternate: Option<FragmentId>,
    },
    #[serde(rename_all = "camelCase")]
    Loop {
        source: AnalyzedExpr,
        item_var: String,
        index_var: Option<String>,
        key: Option<AnalyzedExpr>,
        body: FragmentId,
    },
}

/// A conditional or loop region, owned by the fragment holding its anchor.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlBlock {
    pub id: BlockId,
    pub owner: FragmentId,
    pub anchor: SlotId,
    pub deps: DependencySet,
    pub kind: BlockKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentPlan {
    /// Sorted by id; the root fragment comes first
    pub fragments: Vec<PlannedFragment>,
    /// Sorted by id
    pub blocks: Vec<ControlBlock>,
}

impl FragmentPlan {
    pub fn fragment(&self, id: FragmentId) -> Option<&PlannedFragment> {
        self.fragments.iter().find(|f| f.id == id)
    }

    pub fn block(&self, id: BlockId) -> Option<&ControlBlock> {
        self.blocks.iter().find(|b| b.id == id)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PLANNER
// ═══════════════════════════════════════════════════════════════════════════════

/// Component-wide counters and results, threaded through the traversal.
struct PlannerState<'a> {
    component: &'a str,
    next_fragment: u32,
    next_block: u32,
    fragments: Vec<PlannedFragment>,
    blocks: Vec<ControlBlock>,
}

impl<'a> PlannerState<'a> {
    fn allocate_fragment(&mut self) -> FragmentId {
        let id = FragmentId(self.next_fragment);
        self.next_fragment += 1;
        id
    }

    fn allocate_block(&mut self) -> BlockId {
        self.next_block += 1;
        BlockId(self.next_block)
    }
}

/// Per-fragment counters.
struct FragmentBuilder {
    id: FragmentId,
    next_slot: u32,
    next_temp: u32,
    nodes: Vec<PlannedNode>,
    roots: Vec<SlotId>,
}

impl FragmentBuilder {
    fn new(id: FragmentId) -> Self {
        FragmentBuilder {
            id,
            next_slot: 0,
            next_temp: 0,
            nodes: Vec::new(),
            roots: Vec::new(),
        }
    }

    fn allocate_slot(&mut self) -> SlotId {
        self.next_slot += 1;
        SlotId(self.next_slot)
    }

    fn allocate(&mut self, needs_slot: bool) -> NodeRef {
        if needs_slot {
            NodeRef::Slot(self.allocate_slot())
        } else {
            self.next_temp += 1;
            NodeRef::Temp(self.next_temp)
        }
    }

    fn push(&mut self, node: NodeRef, parent: Option<NodeRef>, kind: PlannedNodeKind) {
        if parent.is_none() {
            if let Some(slot) = node.slot() {
                self.roots.push(slot);
            }
        }
        self.nodes.push(PlannedNode { node, parent, kind });
    }

    /// No two nodes may share a handle.
    fn verify(&self, component: &str) -> Result<(), CompilerError> {
        let mut seen = HashSet::new();
        let collision = self.nodes.iter().find(|n| !seen.insert(n.node));
        debug_assert!(collision.is_none(), "slot collision in {}", self.id);
        match collision {
            None => Ok(()),
            Some(node) => Err(CompilerError::new(
                ErrorKind::AmbiguousSlot,
                format!("{} is assigned twice in {}.", node.node, self.id),
                component,
                self.id.to_string(),
                &SourceLocation::default(),
            )),
        }
    }
}

/// Partition the analyzed tree into fragments and assign slots.
pub fn plan_component(analysis: &ComponentAnalysis) -> Result<FragmentPlan, CompilerError> {
    let mut state = PlannerState {
        component: &analysis.name,
        next_fragment: 0,
        next_block: 0,
        fragments: Vec::new(),
        blocks: Vec::new(),
    };
    let root = state.allocate_fragment();
    plan_fragment(
        &mut state,
        root,
        FragmentKind::Root,
        std::slice::from_ref(&analysis.root),
        Vec::new(),
    )?;

    let mut fragments = state.fragments;
    let mut blocks = state.blocks;
    fragments.sort_by_key(|f| f.id);
    blocks.sort_by_key(|b| b.id);

    log::debug!(
        "planned `{}`: {} fragment(s), {} block(s), {} slot(s)",
        analysis.name,
        fragments.len(),
        blocks.len(),
        fragments.iter().map(|f| f.slot_count()).sum::<usize>()
    );
    Ok(FragmentPlan { fragments, blocks })
}

fn plan_fragment(
    state: &mut PlannerState,
    id: FragmentId,
    kind: FragmentKind,
    children: &[AnalyzedNode],
    locals: Vec<String>,
) -> Result<(), CompilerError> {
    let mut builder = FragmentBuilder::new(id);
    for child in children {
        plan_node(state, &mut builder, child, None, &locals)?;
    }
    builder.verify(state.component)?;
    state.fragments.push(PlannedFragment {
        id,
        kind,
        nodes: builder.nodes,
        roots: builder.roots,
        locals,
    });
    Ok(())
}

fn plan_node(
    state: &mut PlannerState,
    builder: &mut FragmentBuilder,
    node: &AnalyzedNode,
    parent: Option<NodeRef>,
    locals: &[String],
) -> Result<(), CompilerError> {
    let is_root = parent.is_none();
    match node {
        AnalyzedNode::Element(el) => {
            let referenced = !el.events.is_empty()
                || el.attributes.iter().any(|a| match a {
                    AnalyzedAttribute::Dynamic { expr, .. } => !expr.is_static(),
                    AnalyzedAttribute::Static { .. } => false,
                });
            let handle = builder.allocate(is_root || referenced);
            builder.push(
                handle,
                parent,
                PlannedNodeKind::Element {
                    tag: el.tag.clone(),
                    attributes: el.attributes.clone(),
                    events: el.events.clone(),
                },
            );
            for child in &el.children {
                plan_node(state, builder, child, Some(handle), locals)?;
            }
        }
        AnalyzedNode::Text { value } => {
            let handle = builder.allocate(is_root);
            builder.push(handle, parent, PlannedNodeKind::Text { value: value.clone() });
        }
        AnalyzedNode::TextExpression { expr } => {
            let handle = builder.allocate(is_root || !expr.is_static());
            builder.push(handle, parent, PlannedNodeKind::DynamicText { expr: expr.clone() });
        }
        AnalyzedNode::Conditional(cond) => {
            let block = state.allocate_block();
            let anchor = plan_anchor(builder, block, parent);

            let owner = builder.id;
            let consequent = plan_branch(state, owner, block, Branch::Consequent, &cond.consequent, locals)?;
            let alternate = plan_branch(state, owner, block, Branch::Alternate, &cond.alternate, locals)?;

            state.blocks.push(ControlBlock {
                id: block,
                owner: builder.id,
                anchor,
                deps: cond.condition.deps.clone(),
                kind: BlockKind::Conditional {
                    condition: cond.condition.clone(),
                    consequent,
                    alternate,
                },
            });
        }
        AnalyzedNode::Loop(lp) => {
            let block = state.allocate_block();
            let anchor = plan_anchor(builder, block, parent);

            let body = state.allocate_fragment();
            let mut item_locals = locals.to_vec();
            item_locals.push(lp.item_var.clone());
            item_locals.extend(lp.index_var.clone());
            plan_fragment(
                state,
                body,
                FragmentKind::LoopItem {
                    parent: builder.id,
                    block,
                    item_var: lp.item_var.clone(),
                    index_var: lp.index_var.clone(),
                },
                &lp.body,
                item_locals,
            )?;

            state.blocks.push(ControlBlock {
                id: block,
                owner: builder.id,
                anchor,
                deps: lp.deps.clone(),
                kind: BlockKind::Loop {
                    source: lp.source.clone(),
                    item_var: lp.item_var.clone(),
                    index_var: lp.index_var.clone(),
                    key: lp.key.clone(),
                    body,
                },
            });
        }
    }
    Ok(())
}

/// Empty branches get no fragment.
fn plan_branch(
    state: &mut PlannerState,
    owner: FragmentId,
    block: BlockId,
    branch: Branch,
    children: &[AnalyzedNode],
    locals: &[String],
) -> Result<Option<FragmentId>, CompilerError> {
    if children.is_empty() {
        return Ok(None);
    }
    let id = state.allocate_fragment();
    let kind = FragmentKind::ConditionalBranch {
        parent: owner,
        block,
        branch,
    };
    plan_fragment(state, id, kind, children, locals.to_vec())?;
    Ok(Some(id))
}

fn plan_anchor(builder: &mut FragmentBuilder, block: BlockId, parent: Option<NodeRef>) -> SlotId {
    let slot = builder.allocate_slot();
    builder.push(NodeRef::Slot(slot), parent, PlannedNodeKind::Anchor { block });
    slot
}
