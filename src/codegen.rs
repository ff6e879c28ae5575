//! Codegen module
//!
//! Turns a fragment plan into per-fragment programs (`create` / `mount` / update
//! callbacks) and prints them as one JavaScript module per component.

use serde::Serialize;

use crate::analyze::{AnalyzedAttribute, AnalyzedExpr, AnalyzedState, ComponentAnalysis, DependencySet, HandlerEffects};
use crate::plan::{
    BlockId, BlockKind, ControlBlock, FragmentId, FragmentKind, FragmentPlan, NodeRef,
    PlannedFragment, PlannedNodeKind, SlotId,
};
use crate::scope::{literal_ranges, RESERVED_CONTEXT};
use crate::wiring::{
    emit_instance_registration, emit_instance_release, emit_site_object, emit_state_subscriptions, Wiring,
};
use crate::CompileOptions;

// ═══════════════════════════════════════════════════════════════════════════════
// PROGRAM TYPES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum CreateOp {
    CreateElement { node: NodeRef, tag: String },
    CreateText { node: NodeRef, value: String },
    /// Text evaluated once at create time; kept current by updates when it has dependencies
    CreateDynamicText { node: NodeRef, expr: AnalyzedExpr },
    CreateAnchor { node: SlotId, block: BlockId },
    SetAttribute { node: NodeRef, name: String, value: String },
    SetDynamicAttribute { node: NodeRef, name: String, expr: AnalyzedExpr },
    Listen { node: SlotId, event: String, handler: String },
    Append { parent: NodeRef, child: NodeRef },
    /// Build the block and create its initial fragments (not mounted yet)
    InitBlock { block: BlockId },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum MountOp {
    Insert { node: SlotId },
    MountBlock { block: BlockId },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum UpdateOp {
    SetText { node: SlotId, expr: AnalyzedExpr },
    SetAttribute { node: SlotId, name: String, expr: AnalyzedExpr },
    UpdateBlock { node: SlotId, block: BlockId },
}

impl UpdateOp {
    pub fn slot(&self) -> SlotId {
        match self {
            UpdateOp::SetText { node, .. }
            | UpdateOp::SetAttribute { node, .. }
            | UpdateOp::UpdateBlock { node, .. } => *node,
        }
    }

    pub fn to_js(&self) -> String {
        match self {
            UpdateOp::SetText { node, expr } => format!("{}.data = String({});", node, expr.code),
            UpdateOp::SetAttribute { node, name, expr } => {
                format!("setAttr({}, {}, {});", node, js_string(name), expr.code)
            }
            UpdateOp::UpdateBlock { block, .. } => format!("{}.update();", block),
        }
    }
}

/// An update callback for one dynamic site, keyed by what it reads.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteUpdate {
    pub deps: DependencySet,
    pub op: UpdateOp,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentProgram {
    pub id: FragmentId,
    /// Name of the emitted fragment function
    pub function: String,
    pub kind: FragmentKind,
    pub locals: Vec<String>,
    pub slots: Vec<SlotId>,
    pub roots: Vec<SlotId>,
    pub blocks: Vec<BlockId>,
    pub create: Vec<CreateOp>,
    pub mount: Vec<MountOp>,
    /// In slot order
    pub updates: Vec<SiteUpdate>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentProgram {
    pub name: String,
    pub states: Vec<AnalyzedState>,
    pub handlers: Vec<HandlerEffects>,
    /// Sorted by id; `fragments[0]` is the root
    pub fragments: Vec<FragmentProgram>,
    pub blocks: Vec<ControlBlock>,
}

impl ComponentProgram {
    pub fn fragment(&self, id: FragmentId) -> Option<&FragmentProgram> {
        self.fragments.iter().find(|f| f.id == id)
    }

    pub fn block(&self, id: BlockId) -> Option<&ControlBlock> {
        self.blocks.iter().find(|b| b.id == id)
    }

    fn uses_set_attr(&self) -> bool {
        self.fragments.iter().any(|f| {
            f.create
                .iter()
                .any(|op| matches!(op, CreateOp::SetDynamicAttribute { .. }))
        })
    }

    fn uses_conditionals(&self) -> bool {
        self.blocks
            .iter()
            .any(|b| matches!(b.kind, BlockKind::Conditional { .. }))
    }

    fn uses_loops(&self) -> bool {
        self.blocks.iter().any(|b| matches!(b.kind, BlockKind::Loop { .. }))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROGRAM GENERATION
// ═══════════════════════════════════════════════════════════════════════════════

pub fn fragment_function_name(component: &str, id: FragmentId) -> String {
    format!("{}${}", component, id)
}

pub fn generate_program(analysis: &ComponentAnalysis, plan: &FragmentPlan) -> ComponentProgram {
    let fragments: Vec<FragmentProgram> = plan
        .fragments
        .iter()
        .map(|f| generate_fragment(&analysis.name, f, plan))
        .collect();

    log::debug!(
        "generated `{}`: {} create op(s), {} update callback(s)",
        analysis.name,
        fragments.iter().map(|f| f.create.len()).sum::<usize>(),
        fragments.iter().map(|f| f.updates.len()).sum::<usize>()
    );

    ComponentProgram {
        name: analysis.name.clone(),
        states: analysis.states.clone(),
        handlers: analysis.handlers.clone(),
        fragments,
        blocks: plan.blocks.clone(),
    }
}

fn generate_fragment(component: &str, fragment: &PlannedFragment, plan: &FragmentPlan) -> FragmentProgram {
    let mut create = Vec::new();
    let mut updates = Vec::new();
    let mut slots = Vec::new();

    for planned in &fragment.nodes {
        let node = planned.node;
        if let Some(slot) = node.slot() {
            slots.push(slot);
        }

        match &planned.kind {
            PlannedNodeKind::Element { tag, attributes, events } => {
                create.push(CreateOp::CreateElement { node, tag: tag.clone() });
                for attr in attributes {
                    match attr {
                        AnalyzedAttribute::Static { name, value } => create.push(CreateOp::SetAttribute {
                            node,
                            name: name.clone(),
                            value: value.clone(),
                        }),
                        AnalyzedAttribute::Dynamic { name, expr } => {
                            create.push(CreateOp::SetDynamicAttribute {
                                node,
                                name: name.clone(),
                                expr: expr.clone(),
                            });
                            if let (Some(slot), false) = (node.slot(), expr.is_static()) {
                                updates.push(SiteUpdate {
                                    deps: expr.deps.clone(),
                                    op: UpdateOp::SetAttribute {
                                        node: slot,
                                        name: name.clone(),
                                        expr: expr.clone(),
                                    },
                                });
                            }
                        }
                    }
                }
                if let Some(slot) = node.slot() {
                    for binding in events {
                        create.push(CreateOp::Listen {
                            node: slot,
                            event: binding.event.clone(),
                            handler: binding.handler.clone(),
                        });
                    }
                }
            }
            PlannedNodeKind::Text { value } => create.push(CreateOp::CreateText {
                node,
                value: value.clone(),
            }),
            PlannedNodeKind::DynamicText { expr } => {
                if let Some(value) = &expr.folded {
                    create.push(CreateOp::CreateText {
                        node,
                        value: value.clone(),
                    });
                } else {
                    create.push(CreateOp::CreateDynamicText {
                        node,
                        expr: expr.clone(),
                    });
                }
                if let (Some(slot), false) = (node.slot(), expr.is_static()) {
                    updates.push(SiteUpdate {
                        deps: expr.deps.clone(),
                        op: UpdateOp::SetText {
                            node: slot,
                            expr: expr.clone(),
                        },
                    });
                }
            }
            PlannedNodeKind::Anchor { block } => {
                if let Some(slot) = node.slot() {
                    create.push(CreateOp::CreateAnchor { node: slot, block: *block });
                }
            }
        }

        // Attach right after creation: a parent is in place before any child is appended to it.
        if let Some(parent) = planned.parent {
            create.push(CreateOp::Append { parent, child: node });
        }

        if let PlannedNodeKind::Anchor { block } = &planned.kind {
            create.push(CreateOp::InitBlock { block: *block });
            let deps = plan.block(*block).map(|b| b.deps.clone()).unwrap_or_default();
            if let (Some(slot), false) = (node.slot(), deps.is_empty()) {
                updates.push(SiteUpdate {
                    deps,
                    op: UpdateOp::UpdateBlock {
                        node: slot,
                        block: *block,
                    },
                });
            }
        }
    }

    let blocks = fragment.owned_blocks();
    let mount = fragment
        .roots
        .iter()
        .map(|&node| MountOp::Insert { node })
        .chain(blocks.iter().map(|&block| MountOp::MountBlock { block }))
        .collect();

    FragmentProgram {
        id: fragment.id,
        function: fragment_function_name(component, fragment.id),
        kind: fragment.kind.clone(),
        locals: fragment.locals.clone(),
        slots,
        roots: fragment.roots.clone(),
        blocks,
        create,
        mount,
        updates,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// JAVASCRIPT EMISSION
// ═══════════════════════════════════════════════════════════════════════════════

const SET_ATTR_HELPER: &str = r#"function setAttr(node, name, value) {
  if (value == null || value === false) {
    node.removeAttribute(name);
  } else {
    node.setAttribute(name, value === true ? "" : String(value));
  }
}"#;

const CONDITIONAL_HELPER: &str = r#"function conditionalBlock(ctx, anchor, test, consequent, alternate) {
  let branch = null;
  let current = null;
  let mounted = false;
  return {
    update() {
      const next = test() ? consequent : alternate;
      if (next === branch) return;
      if (current) current.destroy();
      branch = next;
      current = next ? next(ctx) : null;
      if (current) {
        current.create();
        if (mounted) current.mount(anchor.parentNode, anchor);
      }
    },
    mount() {
      mounted = true;
      if (current) current.mount(anchor.parentNode, anchor);
    },
    destroy() {
      if (current) current.destroy();
      branch = null;
      current = null;
      mounted = false;
    },
  };
}"#;

const LOOP_HELPER: &str = r#"function keyedLoop(ctx, anchor, source, keyOf, itemVar, indexVar, body) {
  let entries = [];
  let mounted = false;
  return {
    update() {
      const items = source();
      const list = items == null ? [] : Array.from(items);
      const pool = new Map();
      for (const entry of entries) {
        const bucket = pool.get(entry.key);
        if (bucket) bucket.push(entry);
        else pool.set(entry.key, [entry]);
      }
      const next = list.map((item, index) => {
        const key = keyOf(item, index);
        const bucket = pool.get(key);
        const reused = bucket && bucket.shift();
        if (reused) {
          reused.locals[itemVar].value = item;
          if (indexVar) reused.locals[indexVar].value = index;
          return reused;
        }
        const locals = { ...ctx.locals, [itemVar]: signal(item) };
        if (indexVar) locals[indexVar] = signal(index);
        const fragment = body({ ...ctx, locals });
        fragment.create();
        return { key, locals, fragment };
      });
      for (const bucket of pool.values()) {
        for (const stale of bucket) stale.fragment.destroy();
      }
      entries = next;
      if (mounted) {
        for (const entry of entries) entry.fragment.mount(anchor.parentNode, anchor);
      }
    },
    mount() {
      mounted = true;
      for (const entry of entries) entry.fragment.mount(anchor.parentNode, anchor);
    },
    destroy() {
      for (const entry of entries) entry.fragment.destroy();
      entries = [];
      mounted = false;
    },
  };
}"#;

/// Line writer with two-space indentation.
pub(crate) struct Emitter {
    out: String,
    depth: usize,
}

impl Emitter {
    pub(crate) fn new() -> Self {
        Emitter {
            out: String::new(),
            depth: 0,
        }
    }

    pub(crate) fn line(&mut self, text: impl AsRef<str>) {
        let text = text.as_ref();
        if !text.is_empty() {
            for _ in 0..self.depth {
                self.out.push_str("  ");
            }
            self.out.push_str(text);
        }
        self.out.push('\n');
    }

    /// Multi-line text, each line at the current depth.
    pub(crate) fn block(&mut self, text: &str) {
        for line in text.lines() {
            self.line(line.trim_end());
        }
    }

    /// Source text, re-indented line by line except where a line starts inside one
    /// of `literals`. Such lines are part of a string or template and stay verbatim.
    pub(crate) fn source_block(&mut self, text: &str, literals: &[(usize, usize)]) {
        let mut start = 0;
        for line in text.split('\n') {
            if literals.iter().any(|&(from, to)| from < start && start < to) {
                self.out.push_str(line);
                self.out.push('\n');
            } else {
                self.line(line);
            }
            start += line.len() + 1;
        }
    }

    pub(crate) fn open(&mut self, text: impl AsRef<str>) {
        self.line(text);
        self.depth += 1;
    }

    pub(crate) fn close(&mut self, text: impl AsRef<str>) {
        self.depth = self.depth.saturating_sub(1);
        self.line(text);
    }

    pub(crate) fn finish(self) -> String {
        self.out
    }
}

fn escape_js_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// Double-quoted JavaScript string literal.
pub fn js_string(s: &str) -> String {
    format!("\"{}\"", escape_js_string(s))
}

fn declare(node: NodeRef) -> String {
    match node {
        NodeRef::Slot(slot) => format!("{} = ", slot),
        NodeRef::Temp(_) => format!("const {} = ", node),
    }
}

fn fragment_reference(program: &ComponentProgram, id: Option<FragmentId>) -> String {
    match id {
        Some(id) => fragment_function_name(&program.name, id),
        None => "null".to_string(),
    }
}

fn emit_init_block(e: &mut Emitter, program: &ComponentProgram, block: &ControlBlock) {
    match &block.kind {
        BlockKind::Conditional {
            condition,
            consequent,
            alternate,
        } => e.line(format!(
            "{} = conditionalBlock({}, {}, () => ({}), {}, {});",
            block.id,
            RESERVED_CONTEXT,
            block.anchor,
            condition.code,
            fragment_reference(program, *consequent),
            fragment_reference(program, *alternate),
        )),
        BlockKind::Loop {
            source,
            item_var,
            index_var,
            key,
            body,
        } => {
            let params = match index_var {
                Some(index) => format!("{}, {}", item_var, index),
                None => item_var.clone(),
            };
            let key_code = key.as_ref().map(|k| k.code.as_str()).unwrap_or(item_var.as_str());
            let index_name = index_var
                .as_deref()
                .map(js_string)
                .unwrap_or_else(|| "null".to_string());
            e.line(format!(
                "{} = keyedLoop({}, {}, () => ({}), ({}) => ({}), {}, {}, {});",
                block.id,
                RESERVED_CONTEXT,
                block.anchor,
                source.code,
                params,
                key_code,
                js_string(item_var),
                index_name,
                fragment_function_name(&program.name, *body),
            ));
        }
    }
    e.line(format!("{}.update();", block.id));
}

fn emit_create_op(e: &mut Emitter, program: &ComponentProgram, op: &CreateOp) {
    match op {
        CreateOp::CreateElement { node, tag } => e.line(format!(
            "{}document.createElement({});",
            declare(*node),
            js_string(tag)
        )),
        CreateOp::CreateText { node, value } => e.line(format!(
            "{}document.createTextNode({});",
            declare(*node),
            js_string(value)
        )),
        CreateOp::CreateDynamicText { node, expr } => e.line(format!(
            "{}document.createTextNode(String({}));",
            declare(*node),
            expr.code
        )),
        CreateOp::CreateAnchor { node, block } => e.line(format!(
            "{} = document.createComment({});",
            node,
            js_string(&block.to_string())
        )),
        CreateOp::SetAttribute { node, name, value } => e.line(format!(
            "{}.setAttribute({}, {});",
            node,
            js_string(name),
            js_string(value)
        )),
        CreateOp::SetDynamicAttribute { node, name, expr } => e.line(format!(
            "setAttr({}, {}, {});",
            node,
            js_string(name),
            expr.code
        )),
        CreateOp::Listen { node, event, handler } => e.line(format!(
            "{}.addEventListener({}, {}.handlers.{});",
            node,
            js_string(event),
            RESERVED_CONTEXT,
            handler
        )),
        CreateOp::Append { parent, child } => e.line(format!("{}.appendChild({});", parent, child)),
        CreateOp::InitBlock { block } => {
            if let Some(block) = program.block(*block) {
                emit_init_block(e, program, block);
            }
        }
    }
}

fn emit_fragment(e: &mut Emitter, program: &ComponentProgram, fragment: &FragmentProgram, wiring: &Wiring) {
    e.open(format!("function {}({}) {{", fragment.function, RESERVED_CONTEXT));
    e.line("const subscriptions = [];");
    if !fragment.slots.is_empty() {
        let slots: Vec<String> = fragment.slots.iter().map(|s| s.to_string()).collect();
        e.line(format!("let {};", slots.join(", ")));
    }
    if !fragment.blocks.is_empty() {
        let blocks: Vec<String> = fragment.blocks.iter().map(|b| b.to_string()).collect();
        e.line(format!("let {};", blocks.join(", ")));
    }
    let fragment_wiring = wiring.fragment(fragment.id);
    if let Some(fragment_wiring) = fragment_wiring {
        emit_site_object(e, fragment_wiring);
    }

    e.open("return {");
    e.open("create() {");
    for op in &fragment.create {
        emit_create_op(e, program, op);
    }
    if let Some(fragment_wiring) = fragment_wiring {
        emit_instance_registration(e, fragment_wiring);
    }
    e.close("},");

    e.open("mount(target, anchor = null) {");
    for op in &fragment.mount {
        match op {
            MountOp::Insert { node } => e.line(format!("target.insertBefore({}, anchor);", node)),
            MountOp::MountBlock { block } => e.line(format!("{}.mount();", block)),
        }
    }
    e.close("},");

    e.open("destroy() {");
    if let Some(fragment_wiring) = fragment_wiring {
        emit_instance_release(e, fragment_wiring);
    }
    e.line("for (const unsubscribe of subscriptions.splice(0)) unsubscribe();");
    for block in &fragment.blocks {
        e.line(format!("{}.destroy();", block));
    }
    for root in &fragment.roots {
        e.line(format!("{}.remove();", root));
    }
    e.close("},");
    e.close("};");
    e.close("}");
}

fn emit_component_class(e: &mut Emitter, program: &ComponentProgram, wiring: &Wiring) {
    e.open(format!("export class {} {{", program.name));
    e.open("constructor() {");
    let sites = vec!["new Set()"; program.fragments.len()].join(", ");
    e.line(format!(
        "const {} = {{ state: {{}}, handlers: {{}}, locals: {{}}, sites: [{}] }};",
        RESERVED_CONTEXT, sites
    ));
    for state in &program.states {
        e.line(format!(
            "{}.state.{} = signal({});",
            RESERVED_CONTEXT, state.name, state.initial.code
        ));
    }
    for handler in &program.handlers {
        let body = handler.code.trim();
        e.open(format!("{}.handlers.{} = () => {{", RESERVED_CONTEXT, handler.name));
        e.source_block(body, &literal_ranges(body).unwrap_or_default());
        e.close("};");
    }
    let Some(root) = program.fragments.first() else {
        e.close("}");
        e.close("}");
        return;
    };
    if wiring.states.is_empty() {
        e.line(format!("return {}({});", root.function, RESERVED_CONTEXT));
    } else {
        e.line(format!("const root = {}({});", root.function, RESERVED_CONTEXT));
        e.line("const subscriptions = [];");
        emit_state_subscriptions(e, wiring);
        e.open("return {");
        e.line("...root,");
        e.open("destroy() {");
        e.line("root.destroy();");
        e.line("for (const unsubscribe of subscriptions.splice(0)) unsubscribe();");
        e.close("},");
        e.close("};");
    }
    e.close("}");
    e.close("}");
}

/// Print the whole module. Identical programs print byte-identical text.
pub fn emit_module(program: &ComponentProgram, wiring: &Wiring, options: &CompileOptions, fingerprint: &str) -> String {
    let mut e = Emitter::new();

    if options.emit_header {
        e.line("/**");
        e.line(" * GENERATED FILE - DO NOT EDIT");
        e.line(format!(" * Component: {}", program.name));
        e.line(format!(" * Source fingerprint: sha256:{}", fingerprint));
        e.line(" */");
    }
    if !program.states.is_empty() || program.uses_loops() {
        e.line(format!("import {{ signal }} from {};", js_string(&options.runtime_module)));
        e.line("");
    }

    let helpers = [
        (program.uses_set_attr(), SET_ATTR_HELPER),
        (program.uses_conditionals(), CONDITIONAL_HELPER),
        (program.uses_loops(), LOOP_HELPER),
    ];
    for (_, helper) in helpers.iter().filter(|(used, _)| *used) {
        e.block(helper);
        e.line("");
    }

    for fragment in &program.fragments {
        emit_fragment(&mut e, program, fragment, wiring);
        e.line("");
    }
    emit_component_class(&mut e, program, wiring);

    let code = e.finish();
    log::debug!("emitted `{}`: {} byte(s)", program.name, code.len());
    code
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
