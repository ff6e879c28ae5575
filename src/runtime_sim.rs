//! In-memory DOM and signal runtime that executes a `ComponentProgram` the way the
//! emitted JavaScript does. Expressions are evaluated from their qualified code
//! against a `ctx` object with `static_eval`, handler bodies with a small statement
//! interpreter. A name the renamer failed to qualify does not resolve and panics.

use indexmap::IndexMap;
use oxc_ast::ast::{BindingPattern, Expression, SimpleAssignmentTarget, Statement};
use oxc_syntax::operator::{AssignmentOperator, BinaryOperator, UpdateOperator};
use std::collections::HashMap;

use crate::analyze::{AnalyzedExpr, Dependency};
use crate::codegen::{ComponentProgram, CreateOp, MountOp, UpdateOp};
use crate::plan::{BlockId, BlockKind, FragmentId, NodeRef, SlotId};
use crate::scope::{with_parsed_statements, RESERVED_CONTEXT};
use crate::static_eval::{apply_binary, evaluate, evaluate_source, Scope, Value};
use crate::wiring::{wire_component, Wiring};

// ═══════════════════════════════════════════════════════════════════════════════
// DOM
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone)]
pub enum DomKind {
    Container,
    Element {
        tag: String,
        attributes: IndexMap<String, String>,
        listeners: Vec<(String, String)>,
    },
    Text(String),
    Comment,
}

#[derive(Debug, Clone)]
pub struct DomNode {
    pub kind: DomKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

#[derive(Debug, Default)]
pub struct Dom {
    nodes: Vec<DomNode>,
    /// Nodes whose text or attributes were written, in write order
    mutations: Vec<NodeId>,
}

impl Dom {
    fn push(&mut self, kind: DomKind) -> NodeId {
        self.nodes.push(DomNode {
            kind,
            parent: None,
            children: Vec::new(),
        });
        NodeId(self.nodes.len() - 1)
    }

    pub fn create_container(&mut self) -> NodeId {
        self.push(DomKind::Container)
    }

    fn create_element(&mut self, tag: &str) -> NodeId {
        self.push(DomKind::Element {
            tag: tag.to_string(),
            attributes: IndexMap::new(),
            listeners: Vec::new(),
        })
    }

    pub fn node(&self, id: NodeId) -> &DomNode {
        &self.nodes[id.0]
    }

    fn detach(&mut self, child: NodeId) {
        if let Some(parent) = self.nodes[child.0].parent.take() {
            self.nodes[parent.0].children.retain(|c| *c != child);
        }
    }

    fn insert_before(&mut self, parent: NodeId, child: NodeId, anchor: Option<NodeId>) {
        self.detach(child);
        let children = &mut self.nodes[parent.0].children;
        let position = anchor
            .and_then(|a| children.iter().position(|c| *c == a))
            .unwrap_or(children.len());
        children.insert(position, child);
        self.nodes[child.0].parent = Some(parent);
    }

    fn append(&mut self, parent: NodeId, child: NodeId) {
        assert!(
            self.nodes[parent.0].children.iter().all(|c| *c != child),
            "node appended twice"
        );
        self.insert_before(parent, child, None);
    }

    fn set_text(&mut self, node: NodeId, value: String) {
        if let DomKind::Text(data) = &mut self.nodes[node.0].kind {
            *data = value;
        }
        self.mutations.push(node);
    }

    /// `setAttr` helper of the generated module.
    fn set_attr(&mut self, node: NodeId, name: &str, value: &Value) {
        if let DomKind::Element { attributes, .. } = &mut self.nodes[node.0].kind {
            match value {
                Value::Undefined | Value::Null | Value::Bool(false) => {
                    attributes.shift_remove(name);
                }
                Value::Bool(true) => {
                    attributes.insert(name.to_string(), String::new());
                }
                other => {
                    attributes.insert(name.to_string(), other.to_js_string());
                }
            }
        }
        self.mutations.push(node);
    }

    pub fn take_mutations(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.mutations)
    }

    pub fn attribute(&self, node: NodeId, name: &str) -> Option<&str> {
        match &self.nodes[node.0].kind {
            DomKind::Element { attributes, .. } => attributes.get(name).map(String::as_str),
            _ => None,
        }
    }

    pub fn text_content(&self, node: NodeId) -> String {
        match &self.nodes[node.0].kind {
            DomKind::Text(data) => data.clone(),
            DomKind::Comment => String::new(),
            _ => self.nodes[node.0]
                .children
                .iter()
                .map(|c| self.text_content(*c))
                .collect(),
        }
    }

    /// Markup of the children of `node`; comment anchors are left out.
    pub fn inner_html(&self, node: NodeId) -> String {
        self.nodes[node.0].children.iter().map(|c| self.outer_html(*c)).collect()
    }

    fn outer_html(&self, node: NodeId) -> String {
        match &self.nodes[node.0].kind {
            DomKind::Text(data) => data.clone(),
            DomKind::Comment => String::new(),
            DomKind::Container => self.inner_html(node),
            DomKind::Element { tag, attributes, .. } => {
                let attrs: String = attributes
                    .iter()
                    .map(|(k, v)| format!(" {}=\"{}\"", k, v))
                    .collect();
                format!("<{}{}>{}</{}>", tag, attrs, self.inner_html(node), tag)
            }
        }
    }

    /// Elements below `root` with the given tag, in document order.
    pub fn find_all(&self, root: NodeId, tag: &str) -> Vec<NodeId> {
        let mut found = Vec::new();
        for child in &self.nodes[root.0].children {
            if matches!(&self.nodes[child.0].kind, DomKind::Element { tag: t, .. } if t == tag) {
                found.push(*child);
            }
            found.extend(self.find_all(*child, tag));
        }
        found
    }

    pub fn find(&self, root: NodeId, tag: &str) -> NodeId {
        self.find_all(root, tag)
            .first()
            .copied()
            .unwrap_or_else(|| panic!("no <{}> element", tag))
    }

    /// Text nodes below `root`, in document order.
    pub fn text_nodes(&self, root: NodeId) -> Vec<NodeId> {
        let mut found = Vec::new();
        for child in &self.nodes[root.0].children {
            if matches!(self.nodes[child.0].kind, DomKind::Text(_)) {
                found.push(*child);
            }
            found.extend(self.text_nodes(*child));
        }
        found
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RUNTIME
// ═══════════════════════════════════════════════════════════════════════════════

struct Signal {
    value: Value,
    subscribers: Vec<usize>,
}

#[derive(Clone)]
enum Notify {
    /// Component-level subscription of a state: runs the registered sites
    Sites { state: String },
    /// Loop-variable subscription of one instance
    Instance { instance: usize, updates: Vec<UpdateOp> },
}

struct Subscriber {
    notify: Notify,
    active: bool,
}

struct Instance {
    fragment: FragmentId,
    locals: IndexMap<String, usize>,
    nodes: HashMap<NodeRef, NodeId>,
    subscriptions: Vec<usize>,
    alive: bool,
}

enum BlockState {
    Conditional {
        anchor: NodeId,
        selected: Option<FragmentId>,
        current: Option<usize>,
        mounted: bool,
    },
    Loop {
        anchor: NodeId,
        entries: Vec<(Value, usize)>,
        mounted: bool,
    },
}

pub struct Runtime<'p> {
    program: &'p ComponentProgram,
    wiring: Wiring,
    pub dom: Dom,
    signals: Vec<Signal>,
    states: IndexMap<String, usize>,
    instances: Vec<Instance>,
    blocks: HashMap<(usize, BlockId), BlockState>,
    subscribers: Vec<Subscriber>,
    /// `ctx.sites`: instances in registration order. Destroyed ones are skipped.
    sites: HashMap<FragmentId, Vec<usize>>,
    /// Subscriptions made by the component constructor
    component_subscriptions: Vec<usize>,
    /// Variables declared by the running handler, innermost last
    handler_env: Vec<(String, Value)>,
    /// Every update callback run: (fragment, slot)
    pub update_log: Vec<(FragmentId, SlotId)>,
    pub root: usize,
}

/// Resolves `ctx` and a few plain bindings (key parameters, handler variables).
struct ContextScope {
    context: Value,
    bindings: Vec<(String, Value)>,
}

impl Scope for ContextScope {
    fn lookup(&self, name: &str) -> Option<Value> {
        if let Some((_, value)) = self.bindings.iter().rev().find(|(n, _)| n == name) {
            return Some(value.clone());
        }
        (name == RESERVED_CONTEXT).then(|| self.context.clone())
    }
}

/// `{ value }` as seen through a signal
fn signal_object(value: Value) -> Value {
    Value::Object(IndexMap::from([("value".to_string(), value)]))
}

enum Flow {
    Continue,
    Return,
}

/// Where a handler assignment writes.
enum Place {
    State(String),
    Variable(usize),
}

impl<'p> Runtime<'p> {
    /// Equivalent of `new Component()`: state signals and their subscriptions exist,
    /// nothing is created yet.
    pub fn new(program: &'p ComponentProgram) -> Self {
        let mut runtime = Runtime {
            program,
            wiring: wire_component(program),
            dom: Dom::default(),
            signals: Vec::new(),
            states: IndexMap::new(),
            instances: Vec::new(),
            blocks: HashMap::new(),
            subscribers: Vec::new(),
            sites: HashMap::new(),
            component_subscriptions: Vec::new(),
            handler_env: Vec::new(),
            update_log: Vec::new(),
            root: 0,
        };
        for state in &program.states {
            let value = evaluate_source(&state.initial.code, &runtime.scope(None, Vec::new()))
                .unwrap_or_else(|| panic!("cannot evaluate initial value of `{}`", state.name));
            let signal = runtime.new_signal(value);
            runtime.states.insert(state.name.clone(), signal);
        }
        runtime.root = runtime.new_instance(FragmentId(0), IndexMap::new());
        for subscription in runtime.wiring.states.clone() {
            let signal = runtime.states[&subscription.state];
            let subscriber = runtime.subscribe(signal, Notify::Sites { state: subscription.state });
            runtime.component_subscriptions.push(subscriber);
        }
        runtime
    }

    /// Create and mount into a fresh container.
    pub fn mounted(program: &'p ComponentProgram) -> (Self, NodeId) {
        let mut runtime = Runtime::new(program);
        let container = runtime.dom.create_container();
        runtime.create(runtime.root);
        runtime.mount(runtime.root, container, None);
        runtime.dom.take_mutations();
        runtime.update_log.clear();
        (runtime, container)
    }

    fn new_signal(&mut self, value: Value) -> usize {
        self.signals.push(Signal {
            value,
            subscribers: Vec::new(),
        });
        self.signals.len() - 1
    }

    fn new_instance(&mut self, fragment: FragmentId, locals: IndexMap<String, usize>) -> usize {
        self.instances.push(Instance {
            fragment,
            locals,
            nodes: HashMap::new(),
            subscriptions: Vec::new(),
            alive: true,
        });
        self.instances.len() - 1
    }

    pub fn state(&self, name: &str) -> Value {
        self.signals[self.states[name]].value.clone()
    }

    pub fn set_state(&mut self, name: &str, value: Value) {
        let signal = self.states[name];
        self.write_signal(signal, value);
    }

    pub fn subscription_count(&self) -> usize {
        self.subscribers.iter().filter(|s| s.active).count()
    }

    /// Live instances of `fragment`, in creation order.
    pub fn live_instances(&self, fragment: FragmentId) -> Vec<usize> {
        (0..self.instances.len())
            .filter(|i| self.instances[*i].alive && self.instances[*i].fragment == fragment)
            .collect()
    }

    /// Live instances currently registered in `ctx.sites` for `fragment`.
    pub fn registered_sites(&self, fragment: FragmentId) -> usize {
        self.sites
            .get(&fragment)
            .map(|sites| sites.iter().filter(|i| self.instances[**i].alive).count())
            .unwrap_or(0)
    }

    fn write_signal(&mut self, signal: usize, value: Value) {
        let old = &self.signals[signal].value;
        let primitive = !matches!(value, Value::Array(_) | Value::Object(_));
        let unchanged = primitive && (old.strict_equals(&value) || (old == &value));
        if unchanged {
            return;
        }
        self.signals[signal].value = value;
        let subscribers = self.signals[signal].subscribers.clone();
        for subscriber in subscribers {
            if self.subscribers[subscriber].active {
                self.run_subscriber(subscriber);
            }
        }
    }

    /// `signal.subscribe(callback)`, which runs the callback once immediately.
    fn subscribe(&mut self, signal: usize, notify: Notify) -> usize {
        self.subscribers.push(Subscriber { notify, active: true });
        let subscriber = self.subscribers.len() - 1;
        self.signals[signal].subscribers.push(subscriber);
        self.run_subscriber(subscriber);
        subscriber
    }

    fn run_subscriber(&mut self, subscriber: usize) {
        match self.subscribers[subscriber].notify.clone() {
            Notify::Sites { state } => self.run_sites(&state),
            Notify::Instance { instance, updates } => {
                for update in &updates {
                    self.run_update(instance, update);
                }
            }
        }
    }

    /// `for (const site of ctx.sites[N]) site.state();` for every dependent fragment.
    /// Instances registered while iterating are visited too, like a `Set`.
    fn run_sites(&mut self, state: &str) {
        let Some(subscription) = self.wiring.state(state) else {
            return;
        };
        for fragment in subscription.fragments.clone() {
            let updates = self
                .wiring
                .fragment(fragment)
                .map(|w| w.updates_for_state(state).to_vec())
                .unwrap_or_default();
            let mut index = 0;
            while let Some(&instance) = self.sites.get(&fragment).and_then(|sites| sites.get(index)) {
                if self.instances[instance].alive {
                    for update in &updates {
                        self.run_update(instance, update);
                    }
                }
                index += 1;
            }
        }
    }

    /// The `ctx` object an instance sees: state and loop-variable signals.
    fn context(&self, instance: Option<usize>) -> Value {
        let state = self
            .states
            .iter()
            .map(|(name, signal)| (name.clone(), signal_object(self.signals[*signal].value.clone())))
            .collect();
        let locals = instance
            .map(|i| {
                self.instances[i]
                    .locals
                    .iter()
                    .map(|(name, signal)| (name.clone(), signal_object(self.signals[*signal].value.clone())))
                    .collect()
            })
            .unwrap_or_default();
        Value::Object(IndexMap::from([
            ("state".to_string(), Value::Object(state)),
            ("handlers".to_string(), Value::Object(IndexMap::new())),
            ("locals".to_string(), Value::Object(locals)),
        ]))
    }

    fn scope(&self, instance: Option<usize>, bindings: Vec<(String, Value)>) -> ContextScope {
        ContextScope {
            context: self.context(instance),
            bindings,
        }
    }

    fn eval(&self, instance: usize, expr: &AnalyzedExpr) -> Value {
        evaluate_source(&expr.code, &self.scope(Some(instance), Vec::new()))
            .unwrap_or_else(|| panic!("cannot evaluate `{}`", expr.code))
    }

    fn node(&self, instance: usize, node: NodeRef) -> NodeId {
        self.instances[instance].nodes[&node]
    }

    // ── fragment interface ──────────────────────────────────────────────────────

    pub fn create(&mut self, instance: usize) {
        let program = self.program;
        let fragment_id = self.instances[instance].fragment;
        let Some(fragment) = program.fragment(fragment_id) else {
            panic!("unknown {}", fragment_id);
        };

        for op in &fragment.create {
            match op {
                CreateOp::CreateElement { node, tag } => {
                    let id = self.dom.create_element(tag);
                    self.instances[instance].nodes.insert(*node, id);
                }
                CreateOp::CreateText { node, value } => {
                    let id = self.dom.push(DomKind::Text(value.clone()));
                    self.instances[instance].nodes.insert(*node, id);
                }
                CreateOp::CreateDynamicText { node, expr } => {
                    let value = self.eval(instance, expr).to_js_string();
                    let id = self.dom.push(DomKind::Text(value));
                    self.instances[instance].nodes.insert(*node, id);
                }
                CreateOp::CreateAnchor { node, block } => {
                    let id = self.dom.push(DomKind::Comment);
                    self.instances[instance].nodes.insert(NodeRef::Slot(*node), id);
                }
                CreateOp::SetAttribute { node, name, value } => {
                    let id = self.node(instance, *node);
                    self.dom.set_attr(id, name, &Value::Str(value.clone()));
                }
                CreateOp::SetDynamicAttribute { node, name, expr } => {
                    let id = self.node(instance, *node);
                    let value = self.eval(instance, expr);
                    self.dom.set_attr(id, name, &value);
                }
                CreateOp::Listen { node, event, handler } => {
                    let id = self.node(instance, NodeRef::Slot(*node));
                    if let DomKind::Element { listeners, .. } = &mut self.dom.nodes[id.0].kind {
                        listeners.push((event.clone(), handler.clone()));
                    }
                }
                CreateOp::Append { parent, child } => {
                    let parent = self.node(instance, *parent);
                    let child = self.node(instance, *child);
                    self.dom.append(parent, child);
                }
                CreateOp::InitBlock { block } => self.init_block(instance, *block),
            }
        }

        let Some(wiring) = self.wiring.fragment(fragment_id).cloned() else {
            return;
        };
        if wiring.registers_sites() {
            self.sites.entry(fragment_id).or_default().push(instance);
        }
        for subscription in wiring.local_subscriptions {
            let Dependency::Local(name) = &subscription.dependency else {
                continue;
            };
            let signal = self.instances[instance].locals[name];
            let subscriber = self.subscribe(
                signal,
                Notify::Instance {
                    instance,
                    updates: subscription.updates,
                },
            );
            self.instances[instance].subscriptions.push(subscriber);
        }
    }

    pub fn mount(&mut self, instance: usize, target: NodeId, anchor: Option<NodeId>) {
        let program = self.program;
        let fragment_id = self.instances[instance].fragment;
        let Some(fragment) = program.fragment(fragment_id) else {
            panic!("unknown {}", fragment_id);
        };
        for op in &fragment.mount {
            match op {
                MountOp::Insert { node } => {
                    let id = self.node(instance, NodeRef::Slot(*node));
                    self.dom.insert_before(target, id, anchor);
                }
                MountOp::MountBlock { block } => self.mount_block(instance, *block),
            }
        }
    }

    pub fn destroy(&mut self, instance: usize) {
        let program = self.program;
        for subscriber in std::mem::take(&mut self.instances[instance].subscriptions) {
            self.subscribers[subscriber].active = false;
        }
        if instance == self.root {
            for subscriber in std::mem::take(&mut self.component_subscriptions) {
                self.subscribers[subscriber].active = false;
            }
        }
        // leaves `ctx.sites`
        self.instances[instance].alive = false;
        let fragment_id = self.instances[instance].fragment;
        let Some(fragment) = program.fragment(fragment_id) else {
            panic!("unknown {}", fragment_id);
        };
        for block in &fragment.blocks {
            match self.blocks.remove(&(instance, *block)) {
                Some(BlockState::Conditional { current, .. }) => {
                    if let Some(current) = current {
                        self.destroy(current);
                    }
                }
                Some(BlockState::Loop { entries, .. }) => {
                    for (_, entry) in entries {
                        self.destroy(entry);
                    }
                }
                None => {}
            }
        }
        for root in &fragment.roots {
            let id = self.node(instance, NodeRef::Slot(*root));
            self.dom.detach(id);
        }
    }

    // ── blocks ──────────────────────────────────────────────────────────────────

    fn init_block(&mut self, instance: usize, block: BlockId) {
        let program = self.program;
        let Some(control) = program.block(block) else {
            panic!("unknown {}", block);
        };
        let anchor = self.node(instance, NodeRef::Slot(control.anchor));
        let state = match control.kind {
            BlockKind::Conditional { .. } => BlockState::Conditional {
                anchor,
                selected: None,
                current: None,
                mounted: false,
            },
            BlockKind::Loop { .. } => BlockState::Loop {
                anchor,
                entries: Vec::new(),
                mounted: false,
            },
        };
        self.blocks.insert((instance, block), state);
        self.update_block(instance, block);
    }

    fn mount_block(&mut self, instance: usize, block: BlockId) {
        let mut children = Vec::new();
        let mut anchor_node = None;
        match self.blocks.get_mut(&(instance, block)) {
            Some(BlockState::Conditional {
                anchor,
                current,
                mounted,
                ..
            }) => {
                *mounted = true;
                anchor_node = Some(*anchor);
                children.extend(*current);
            }
            Some(BlockState::Loop {
                anchor,
                entries,
                mounted,
            }) => {
                *mounted = true;
                anchor_node = Some(*anchor);
                children.extend(entries.iter().map(|(_, i)| *i));
            }
            None => {}
        }
        if let Some(anchor) = anchor_node {
            self.mount_children(anchor, &children);
        }
    }

    fn mount_children(&mut self, anchor: NodeId, children: &[usize]) {
        let parent = self.dom.node(anchor).parent.expect("block anchor is not attached");
        for child in children {
            self.mount(*child, parent, Some(anchor));
        }
    }

    fn update_block(&mut self, instance: usize, block: BlockId) {
        let program = self.program;
        let Some(control) = program.block(block) else {
            panic!("unknown {}", block);
        };
        match &control.kind {
            BlockKind::Conditional {
                condition,
                consequent,
                alternate,
            } => {
                let next = if self.eval(instance, condition).truthy() {
                    *consequent
                } else {
                    *alternate
                };
                let Some(BlockState::Conditional {
                    anchor,
                    selected,
                    current,
                    mounted,
                }) = self.blocks.remove(&(instance, block))
                else {
                    panic!("{} is not initialized", block);
                };
                if next == selected {
                    self.blocks.insert(
                        (instance, block),
                        BlockState::Conditional {
                            anchor,
                            selected,
                            current,
                            mounted,
                        },
                    );
                    return;
                }
                if let Some(current) = current {
                    self.destroy(current);
                }
                let current = next.map(|fragment| {
                    let locals = self.instances[instance].locals.clone();
                    self.new_instance(fragment, locals)
                });
                if let Some(current) = current {
                    self.create(current);
                    if mounted {
                        self.mount_children(anchor, &[current]);
                    }
                }
                self.blocks.insert(
                    (instance, block),
                    BlockState::Conditional {
                        anchor,
                        selected: next,
                        current,
                        mounted,
                    },
                );
            }
            BlockKind::Loop {
                source,
                item_var,
                index_var,
                key,
                body,
            } => {
                let items = match self.eval(instance, source) {
                    Value::Array(items) => items,
                    Value::Undefined | Value::Null => Vec::new(),
                    other => panic!("loop source is not an array: {:?}", other),
                };
                let Some(BlockState::Loop {
                    anchor,
                    entries,
                    mounted,
                }) = self.blocks.remove(&(instance, block))
                else {
                    panic!("{} is not initialized", block);
                };

                let mut pool = entries;
                let mut next = Vec::with_capacity(items.len());
                for (index, item) in items.into_iter().enumerate() {
                    let index_value = Value::Number(index as f64);
                    let key_value = match key {
                        None => item.clone(),
                        Some(key) => {
                            let mut params = vec![(item_var.clone(), item.clone())];
                            if let Some(index_var) = index_var {
                                params.push((index_var.clone(), index_value.clone()));
                            }
                            evaluate_source(&key.code, &self.scope(Some(instance), params))
                                .unwrap_or_else(|| panic!("cannot evaluate key `{}`", key.code))
                        }
                    };

                    // first-come-first-served among equal keys
                    if let Some(position) = pool.iter().position(|(k, _)| *k == key_value) {
                        let (_, reused) = pool.remove(position);
                        let item_signal = self.instances[reused].locals[item_var.as_str()];
                        self.write_signal(item_signal, item);
                        if let Some(index_var) = index_var {
                            let index_signal = self.instances[reused].locals[index_var.as_str()];
                            self.write_signal(index_signal, index_value);
                        }
                        next.push((key_value, reused));
                        continue;
                    }

                    let mut locals = self.instances[instance].locals.clone();
                    let item_signal = self.new_signal(item);
                    locals.insert(item_var.clone(), item_signal);
                    if let Some(index_var) = index_var {
                        let index_signal = self.new_signal(index_value);
                        locals.insert(index_var.clone(), index_signal);
                    }
                    let created = self.new_instance(*body, locals);
                    self.create(created);
                    next.push((key_value, created));
                }

                for (_, stale) in pool {
                    self.destroy(stale);
                }
                if mounted {
                    let children: Vec<usize> = next.iter().map(|(_, i)| *i).collect();
                    self.mount_children(anchor, &children);
                }
                self.blocks.insert(
                    (instance, block),
                    BlockState::Loop {
                        anchor,
                        entries: next,
                        mounted,
                    },
                );
            }
        }
    }

    fn run_update(&mut self, instance: usize, update: &UpdateOp) {
        let fragment = self.instances[instance].fragment;
        self.update_log.push((fragment, update.slot()));
        match update {
            UpdateOp::SetText { node, expr } => {
                let value = self.eval(instance, expr).to_js_string();
                let id = self.node(instance, NodeRef::Slot(*node));
                self.dom.set_text(id, value);
            }
            UpdateOp::SetAttribute { node, name, expr } => {
                let value = self.eval(instance, expr);
                let id = self.node(instance, NodeRef::Slot(*node));
                self.dom.set_attr(id, name, &value);
            }
            UpdateOp::UpdateBlock { block, .. } => self.update_block(instance, *block),
        }
    }

    // ── events and handlers ─────────────────────────────────────────────────────

    /// Fire `event` on `node`: every listener bound to it runs, in binding order.
    pub fn dispatch(&mut self, node: NodeId, event: &str) {
        let handlers: Vec<String> = match &self.dom.node(node).kind {
            DomKind::Element { listeners, .. } => listeners
                .iter()
                .filter(|(e, _)| e == event)
                .map(|(_, h)| h.clone())
                .collect(),
            _ => Vec::new(),
        };
        for handler in handlers {
            self.call_handler(&handler);
        }
    }

    pub fn click(&mut self, node: NodeId) {
        self.dispatch(node, "click");
    }

    pub fn call_handler(&mut self, name: &str) {
        let program = self.program;
        let Some(handler) = program.handlers.iter().find(|h| h.name == name) else {
            panic!("unknown handler `{}`", name);
        };
        self.handler_env.clear();
        let parsed = with_parsed_statements(&handler.code, |program, _| {
            let Some(Statement::FunctionDeclaration(function)) = program.body.first() else {
                panic!("handler wrapper missing");
            };
            if let Some(body) = &function.body {
                self.run_statements(&body.statements);
            }
        });
        if let Err(reason) = parsed {
            panic!("handler `{}` does not parse: {}", name, reason);
        }
    }

    /// Runs a block; its declarations go out of scope at the end.
    fn run_statements(&mut self, statements: &[Statement]) -> Flow {
        let depth = self.handler_env.len();
        let mut flow = Flow::Continue;
        for statement in statements {
            if let Flow::Return = self.run_statement(statement) {
                flow = Flow::Return;
                break;
            }
        }
        self.handler_env.truncate(depth);
        flow
    }

    fn run_statement(&mut self, statement: &Statement) -> Flow {
        match statement {
            Statement::ExpressionStatement(stmt) => {
                self.run_expression(&stmt.expression);
                Flow::Continue
            }
            Statement::VariableDeclaration(decl) => {
                for declarator in &decl.declarations {
                    let BindingPattern::BindingIdentifier(id) = &declarator.id else {
                        panic!("only plain declarations are supported");
                    };
                    let value = declarator
                        .init
                        .as_ref()
                        .map(|init| self.handler_eval(init))
                        .unwrap_or(Value::Undefined);
                    self.handler_env.push((id.name.to_string(), value));
                }
                Flow::Continue
            }
            Statement::BlockStatement(block) => self.run_statements(&block.body),
            Statement::IfStatement(stmt) => {
                let test = self.handler_eval(&stmt.test);
                if test.truthy() {
                    self.run_statement(&stmt.consequent)
                } else if let Some(alternate) = &stmt.alternate {
                    self.run_statement(alternate)
                } else {
                    Flow::Continue
                }
            }
            Statement::ReturnStatement(_) => Flow::Return,
            Statement::EmptyStatement(_) => Flow::Continue,
            _ => panic!("statement not supported by the simulator"),
        }
    }

    fn handler_eval(&self, expr: &Expression) -> Value {
        let scope = self.scope(None, self.handler_env.clone());
        evaluate(expr, &scope).unwrap_or_else(|| panic!("cannot evaluate handler expression"))
    }

    /// `ctx.state.x.value` or a variable the handler declared.
    fn place(&self, target: &SimpleAssignmentTarget) -> Place {
        match target {
            SimpleAssignmentTarget::AssignmentTargetIdentifier(id) => {
                let name = id.name.as_str();
                match self.handler_env.iter().rposition(|(n, _)| n == name) {
                    Some(index) => Place::Variable(index),
                    None => panic!("write to unqualified `{}`", name),
                }
            }
            SimpleAssignmentTarget::StaticMemberExpression(member) if member.property.name.as_str() == "value" => {
                match state_signal(&member.object) {
                    Some(name) => Place::State(name.to_string()),
                    None => panic!("write to a member that is not a state signal"),
                }
            }
            _ => panic!("assignment target not supported by the simulator"),
        }
    }

    fn read_place(&self, place: &Place) -> Value {
        match place {
            Place::State(name) => self.state(name),
            Place::Variable(index) => self.handler_env[*index].1.clone(),
        }
    }

    fn write_place(&mut self, place: Place, value: Value) {
        match place {
            Place::State(name) => self.set_state(&name, value),
            Place::Variable(index) => self.handler_env[index].1 = value,
        }
    }

    fn run_expression(&mut self, expr: &Expression) {
        match expr {
            Expression::AssignmentExpression(assign) => {
                let Some(target) = assign.left.as_simple_assignment_target() else {
                    panic!("destructuring assignments are not supported by the simulator");
                };
                let place = self.place(target);
                let right = self.handler_eval(&assign.right);
                let value = match assign.operator {
                    AssignmentOperator::Assign => right,
                    operator => {
                        let binary = match operator {
                            AssignmentOperator::Addition => BinaryOperator::Addition,
                            AssignmentOperator::Subtraction => BinaryOperator::Subtraction,
                            AssignmentOperator::Multiplication => BinaryOperator::Multiplication,
                            AssignmentOperator::Division => BinaryOperator::Division,
                            AssignmentOperator::Remainder => BinaryOperator::Remainder,
                            _ => panic!("assignment operator not supported"),
                        };
                        apply_binary(binary, &self.read_place(&place), &right)
                            .unwrap_or_else(|| panic!("cannot apply {:?}", operator))
                    }
                };
                self.write_place(place, value);
            }
            Expression::UpdateExpression(update) => {
                let place = self.place(&update.argument);
                let delta = match update.operator {
                    UpdateOperator::Increment => 1.0,
                    UpdateOperator::Decrement => -1.0,
                };
                let value = Value::Number(self.read_place(&place).to_number() + delta);
                self.write_place(place, value);
            }
            Expression::ParenthesizedExpression(paren) => self.run_expression(&paren.expression),
            Expression::SequenceExpression(sequence) => {
                for expression in &sequence.expressions {
                    self.run_expression(expression);
                }
            }
            // calls and other expressions have no effect on state
            _ => {}
        }
    }
}

/// `x` of `ctx.state.x`
fn state_signal<'e>(expr: &'e Expression) -> Option<&'e str> {
    let Expression::StaticMemberExpression(signal) = expr else {
        return None;
    };
    let Expression::StaticMemberExpression(state) = &signal.object else {
        return None;
    };
    let Expression::Identifier(root) = &state.object else {
        return None;
    };
    (root.name.as_str() == RESERVED_CONTEXT && state.property.name.as_str() == "state").then(|| signal.property.name.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{compile_component, CompileOptions, ComponentDefinition};
    use serde_json::json;

    fn program(value: serde_json::Value) -> ComponentProgram {
        let component: ComponentDefinition = serde_json::from_value(value).unwrap();
        compile_component(&component, &CompileOptions::default())
            .unwrap()
            .program
    }

    #[test]
    fn test_dom_insert_before_and_render() {
        let mut dom = Dom::default();
        let root = dom.create_container();
        let a = dom.create_element("a");
        let b = dom.create_element("b");
        dom.append(root, b);
        dom.insert_before(root, a, Some(b));
        dom.set_attr(a, "href", &Value::Str("#".into()));
        dom.set_attr(b, "hidden", &Value::Bool(true));
        assert_eq!(dom.inner_html(root), "<a href=\"#\"></a><b hidden=\"\"></b>");
        dom.set_attr(b, "hidden", &Value::Bool(false));
        assert_eq!(dom.inner_html(root), "<a href=\"#\"></a><b></b>");
    }

    #[test]
    fn test_handler_interpreter() {
        let program = program(json!({
            "name": "Calc",
            "states": [{ "name": "n", "initialValue": "1" }, { "name": "log", "initialValue": "''" }],
            "handlers": [{ "name": "go", "body": "n *= 3; if (n > 2) { log += 'big'; return; } log = 'small';" }],
            "root": { "type": "element", "tag": "p", "children": [
                { "type": "text-expression", "expression": "n + ':' + log" }
            ]}
        }));
        let (mut rt, container) = Runtime::mounted(&program);
        assert_eq!(rt.dom.text_content(container), "1:");
        rt.call_handler("go");
        assert_eq!(rt.state("n"), Value::Number(3.0));
        assert_eq!(rt.dom.text_content(container), "3:big");
    }

    fn bump_program() -> ComponentProgram {
        program(json!({
            "name": "Bump",
            "states": [{ "name": "count", "initialValue": "0" }],
            "handlers": [{ "name": "bump", "body": "let step = 2;\n{ let step = 5; }\ncount += step;" }],
            "root": { "type": "element", "tag": "p", "children": [
                { "type": "text-expression", "expression": "count" }
            ]}
        }))
    }

    #[test]
    fn test_handler_variables_are_block_scoped() {
        let program = bump_program();
        let (mut rt, container) = Runtime::mounted(&program);
        rt.call_handler("bump");
        assert_eq!(rt.dom.text_content(container), "2");
    }

    #[test]
    #[should_panic(expected = "write to unqualified `count`")]
    fn test_unqualified_handler_write_is_caught() {
        let mut program = bump_program();
        program.handlers[0].code = program.handlers[0].source.clone();
        let (mut rt, _) = Runtime::mounted(&program);
        rt.call_handler("bump");
    }

    #[test]
    #[should_panic(expected = "cannot evaluate `count`")]
    fn test_unqualified_markup_read_is_caught() {
        let mut program = bump_program();
        program.fragments[0].create.iter_mut().for_each(|op| {
            if let CreateOp::CreateDynamicText { expr, .. } = op {
                expr.code = expr.source.clone();
            }
        });
        Runtime::mounted(&program);
    }
}
