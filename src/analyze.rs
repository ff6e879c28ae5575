use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};

use crate::ast::{
    AttributeIR, AttributeValue, ComponentDefinition, ConditionalNode, ElementNode, LoopNode,
    MarkupNode, SourceLocation,
};
use crate::error::{CompilerError, ErrorKind};
use crate::renamer::{qualify_expression, qualify_statements};
use crate::scope::{
    collect_expression, collect_statements, IdentifierCategory, ScopeBindings, RESERVED_CONTEXT,
};
use crate::static_eval::{static_eval, static_eval_attribute};

lazy_static! {
    static ref IDENTIFIER_RE: Regex = Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*$").unwrap();
    static ref TAG_RE: Regex = Regex::new(r"^[A-Za-z][A-Za-z0-9]*(-[A-Za-z0-9]+)*$").unwrap();
    static ref ATTRIBUTE_RE: Regex = Regex::new(r"^[A-Za-z_:][A-Za-z0-9_.:-]*$").unwrap();
    static ref EVENT_RE: Regex = Regex::new(r"^[A-Za-z][A-Za-z0-9_:-]*$").unwrap();
    static ref JS_RESERVED: HashSet<&'static str> = [
        "break", "case", "catch", "class", "const", "continue", "debugger", "default", "delete",
        "do", "else", "enum", "export", "extends", "false", "finally", "for", "function", "if",
        "import", "in", "instanceof", "let", "new", "null", "return", "super", "switch", "this",
        "throw", "true", "try", "typeof", "var", "void", "while", "with", "yield", "await",
        "static", "implements", "interface", "package", "private", "protected", "public",
        "arguments", "eval", "undefined", "NaN", "Infinity",
    ]
    .into_iter()
    .collect();
}

// ═══════════════════════════════════════════════════════════════════════════════
// DEPENDENCIES
// ═══════════════════════════════════════════════════════════════════════════════

/// A reactive value a dynamic site reads.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "kebab-case")]
pub enum Dependency {
    State(String),
    /// Loop variable, exposed to item fragments as a fragment-local signal
    Local(String),
}

impl Dependency {
    pub fn name(&self) -> &str {
        match self {
            Dependency::State(n) | Dependency::Local(n) => n,
        }
    }
}

pub type DependencySet = BTreeSet<Dependency>;

/// One expression site after analysis.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzedExpr {
    /// Source as written, used for diagnostics and simulation.
    pub source: String,
    /// Source with every state, loop variable and handler qualified through `ctx`.
    pub code: String,
    pub deps: DependencySet,
    /// Compile-time value when the site is static and evaluable.
    pub folded: Option<String>,
}

impl AnalyzedExpr {
    pub fn is_static(&self) -> bool {
        self.deps.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ANALYZED TREE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AnalyzedNode {
    Element(AnalyzedElement),
    Text { value: String },
    TextExpression { expr: AnalyzedExpr },
    Conditional(AnalyzedConditional),
    Loop(AnalyzedLoop),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzedElement {
    pub tag: String,
    pub attributes: Vec<AnalyzedAttribute>,
    pub events: Vec<EventBinding>,
    pub children: Vec<AnalyzedNode>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AnalyzedAttribute {
    Static { name: String, value: String },
    Dynamic { name: String, expr: AnalyzedExpr },
}

impl AnalyzedAttribute {
    pub fn name(&self) -> &str {
        match self {
            AnalyzedAttribute::Static { name, .. } | AnalyzedAttribute::Dynamic { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBinding {
    /// Normalized DOM event name (`onClick` -> `click`)
    pub event: String,
    pub handler: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzedConditional {
    pub condition: AnalyzedExpr,
    pub consequent: Vec<AnalyzedNode>,
    pub alternate: Vec<AnalyzedNode>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzedLoop {
    pub source: AnalyzedExpr,
    pub item_var: String,
    pub index_var: Option<String>,
    /// Key expression; its own loop variables stay bare, everything else is qualified.
    pub key: Option<AnalyzedExpr>,
    /// Source and key dependencies minus the loop's own variables.
    pub deps: DependencySet,
    pub body: Vec<AnalyzedNode>,
}

impl AnalyzedNode {
    /// Whether this node, rendered on its own, can change after `create()`.
    pub fn is_dynamic(&self) -> bool {
        match self {
            AnalyzedNode::Element(el) => {
                !el.events.is_empty()
                    || el.attributes.iter().any(|a| matches!(a, AnalyzedAttribute::Dynamic { .. }))
            }
            AnalyzedNode::Text { .. } => false,
            AnalyzedNode::TextExpression { expr } => !expr.is_static(),
            AnalyzedNode::Conditional(_) | AnalyzedNode::Loop(_) => true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DECLARATIONS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzedState {
    pub name: String,
    pub initial: AnalyzedExpr,
}

/// What a handler reads and writes, and its qualified body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerEffects {
    pub name: String,
    pub source: String,
    pub code: String,
    /// State read, first-read order
    pub reads: Vec<String>,
    /// State written, first-write order
    pub writes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentAnalysis {
    pub name: String,
    #[serde(skip)]
    pub scope: ScopeBindings,
    pub states: Vec<AnalyzedState>,
    pub handlers: Vec<HandlerEffects>,
    pub root: AnalyzedNode,
    /// Number of expression sites analyzed (text, attributes, guards, sources, keys)
    pub site_count: usize,
}

/// `onClick` / `on:click` -> `click`; anything else is kept as written.
pub fn normalize_event_name(raw: &str) -> String {
    if let Some(rest) = raw.strip_prefix("on:") {
        return rest.to_string();
    }
    if let Some(rest) = raw.strip_prefix("on") {
        if rest.chars().next().is_some_and(|c| c.is_ascii_uppercase()) {
            return rest.to_ascii_lowercase();
        }
    }
    raw.to_string()
}

fn is_valid_identifier(name: &str) -> bool {
    IDENTIFIER_RE.is_match(name) && !JS_RESERVED.contains(name)
}

// ═══════════════════════════════════════════════════════════════════════════════
// ANALYZER
// ═══════════════════════════════════════════════════════════════════════════════

struct Analyzer<'c> {
    component: &'c ComponentDefinition,
    scope: ScopeBindings,
    /// Loop variables of enclosing loops, innermost last
    locals: Vec<String>,
    /// Labels of enclosing nodes for diagnostics
    path: Vec<String>,
    errors: Vec<CompilerError>,
    site_count: usize,
    /// State read by at least one markup site
    observed: HashSet<String>,
}

/// Analyze one component. Every problem found is reported; the component compiles
/// only when the returned error list would have been empty.
pub fn analyze_component(component: &ComponentDefinition) -> Result<ComponentAnalysis, Vec<CompilerError>> {
    let scope = ScopeBindings::new(
        component.states.iter().map(|s| s.name.clone()).collect(),
        component.handlers.iter().map(|h| h.name.clone()).collect(),
    );
    let mut analyzer = Analyzer {
        component,
        scope,
        locals: Vec::new(),
        path: Vec::new(),
        errors: Vec::new(),
        site_count: 0,
        observed: HashSet::new(),
    };

    analyzer.check_declarations();
    let states = analyzer.analyze_states();
    let handlers = analyzer.analyze_handlers();
    let root = analyzer.analyze_node(&component.root);

    if !analyzer.errors.is_empty() {
        log::debug!(
            "analysis of `{}` failed with {} error(s)",
            component.name,
            analyzer.errors.len()
        );
        return Err(analyzer.errors);
    }

    for state in &component.states {
        if !analyzer.observed.contains(&state.name) {
            log::warn!(
                "state `{}` of `{}` is never read by markup; its subscription updates nothing",
                state.name,
                component.name
            );
        }
    }
    log::debug!(
        "analyzed `{}`: {} states, {} handlers, {} expression sites",
        component.name,
        states.len(),
        handlers.len(),
        analyzer.site_count
    );

    Ok(ComponentAnalysis {
        name: component.name.clone(),
        scope: analyzer.scope,
        states,
        handlers,
        root,
        site_count: analyzer.site_count,
    })
}

impl<'c> Analyzer<'c> {
    fn error(
        &mut self,
        kind: ErrorKind,
        message: String,
        site: String,
        location: &SourceLocation,
    ) -> &mut CompilerError {
        let error = CompilerError::new(kind, message, &self.component.name, site, location)
            .in_file(&self.component.file_path);
        self.errors.push(error);
        let last = self.errors.len() - 1;
        &mut self.errors[last]
    }

    fn site(&self, leaf: &str) -> String {
        if self.path.is_empty() {
            leaf.to_string()
        } else {
            format!("{} > {}", self.path.join(" > "), leaf)
        }
    }

    fn check_declarations(&mut self) {
        let component = self.component;
        if !is_valid_identifier(&component.name) {
            self.error(
                ErrorKind::InvalidDeclaration,
                format!("Component name '{}' is not a valid class name.", component.name),
                "component".to_string(),
                &SourceLocation::default(),
            );
        }

        let mut seen: Vec<(&str, &str)> = Vec::new();
        let declared = component
            .states
            .iter()
            .map(|s| ("state", s.name.as_str(), &s.location))
            .chain(component.handlers.iter().map(|h| ("handler", h.name.as_str(), &h.location)));

        for (kind, name, location) in declared {
            let site = format!("{} {}", kind, name);
            if name == RESERVED_CONTEXT {
                self.error(
                    ErrorKind::InvalidDeclaration,
                    format!("'{}' is reserved for the generated fragment context.", name),
                    site,
                    location,
                )
                .with_hint("Rename the declaration.");
            } else if !is_valid_identifier(name) {
                self.error(
                    ErrorKind::InvalidDeclaration,
                    format!("'{}' is not a valid identifier.", name),
                    site,
                    location,
                );
            } else if let Some((previous_kind, _)) = seen.iter().find(|(_, n)| *n == name) {
                let message = format!(
                    "Duplicate declaration '{}': already declared as a {}.",
                    name, previous_kind
                );
                self.error(ErrorKind::InvalidDeclaration, message, site, location);
            }
            seen.push((kind, name));
        }
    }

    fn analyze_states(&mut self) -> Vec<AnalyzedState> {
        let component = self.component;
        let mut states = Vec::with_capacity(component.states.len());
        for (index, state) in component.states.iter().enumerate() {
            let site = format!("state {}", state.name);
            let earlier: Vec<&str> = component.states[..index].iter().map(|s| s.name.as_str()).collect();

            let facts = match collect_expression(&state.initial_value) {
                Ok(facts) => facts,
                Err(reason) => {
                    self.error(
                        ErrorKind::InvalidExpression,
                        format!("Invalid initial value for '{}': {}", state.name, reason),
                        site,
                        &state.location,
                    );
                    continue;
                }
            };
            self.site_count += 1;

            let mut ok = true;
            for name in facts.free_references() {
                let message = match self.scope.classify(&name, &[]) {
                    Some(IdentifierCategory::Global) => continue,
                    Some(IdentifierCategory::State) if earlier.contains(&name.as_str()) => continue,
                    Some(IdentifierCategory::State) => (
                        ErrorKind::InvalidDeclaration,
                        format!(
                            "Initial value of '{}' reads '{}', which is not declared before it.",
                            state.name, name
                        ),
                    ),
                    Some(IdentifierCategory::Handler) => (
                        ErrorKind::InvalidBinding,
                        format!("Handler '{}' cannot be used as a value.", name),
                    ),
                    _ => (ErrorKind::UnresolvedIdentifier, format!("Unknown identifier '{}'.", name)),
                };
                self.error(message.0, message.1, site.clone(), &state.location);
                ok = false;
            }
            if let Some(written) = facts.free_writes().first() {
                self.error(
                    ErrorKind::ReactivityBoundary,
                    format!("Initial value of '{}' assigns '{}'.", state.name, written),
                    site.clone(),
                    &state.location,
                );
                ok = false;
            }
            if !ok {
                continue;
            }

            let initial = self.finish_expression(&state.initial_value, &[], DependencySet::new(), &site, &state.location);
            if let Some(initial) = initial {
                states.push(AnalyzedState {
                    name: state.name.clone(),
                    initial,
                });
            }
        }
        states
    }

    fn analyze_handlers(&mut self) -> Vec<HandlerEffects> {
        let component = self.component;
        let mut handlers = Vec::with_capacity(component.handlers.len());
        for handler in &component.handlers {
            let site = format!("handler {}", handler.name);
            let facts = match collect_statements(&handler.body) {
                Ok(facts) => facts,
                Err(reason) => {
                    self.error(
                        ErrorKind::InvalidExpression,
                        format!("Invalid body for handler '{}': {}", handler.name, reason),
                        site,
                        &handler.location,
                    );
                    continue;
                }
            };

            let mut ok = true;
            let mut reads = Vec::new();
            for name in facts.free_references() {
                match self.scope.classify(&name, &[]) {
                    Some(IdentifierCategory::State) => reads.push(name),
                    Some(_) => {}
                    None => {
                        self.error(
                            ErrorKind::UnresolvedIdentifier,
                            format!("Unknown identifier '{}' in handler '{}'.", name, handler.name),
                            site.clone(),
                            &handler.location,
                        );
                        ok = false;
                    }
                }
            }

            let mut writes = Vec::new();
            for name in facts.free_writes() {
                match self.scope.classify(&name, &[]) {
                    Some(IdentifierCategory::State) => writes.push(name),
                    Some(category) => {
                        let what = match category {
                            IdentifierCategory::Handler => "handler",
                            _ => "global",
                        };
                        self.error(
                            ErrorKind::InvalidBinding,
                            format!("Handler '{}' assigns to {} '{}'.", handler.name, what, name),
                            site.clone(),
                            &handler.location,
                        )
                        .with_hint("Handlers may only assign declared state.");
                        ok = false;
                    }
                    // reported above as unresolved
                    None => {}
                }
            }
            if !ok {
                continue;
            }

            let qualified = qualify_statements(&handler.body, &|name: &str| self.qualify(name, &[]));
            match qualified {
                Ok(code) => handlers.push(HandlerEffects {
                    name: handler.name.clone(),
                    source: handler.body.clone(),
                    code,
                    reads,
                    writes,
                }),
                Err(reason) => {
                    self.error(
                        ErrorKind::InvalidExpression,
                        format!("Invalid body for handler '{}': {}", handler.name, reason),
                        site,
                        &handler.location,
                    );
                }
            }
        }
        handlers
    }

    /// Replacement text for a free identifier in generated code.
    fn qualify(&self, name: &str, locals: &[String]) -> Option<String> {
        match self.scope.classify(name, locals)? {
            IdentifierCategory::Local => Some(format!("{}.locals.{}.value", RESERVED_CONTEXT, name)),
            IdentifierCategory::State => Some(format!("{}.state.{}.value", RESERVED_CONTEXT, name)),
            IdentifierCategory::Handler => Some(format!("{}.handlers.{}", RESERVED_CONTEXT, name)),
            IdentifierCategory::Global => None,
        }
    }

    /// Analyze one markup expression: resolve, collect dependencies, reject writes.
    fn analyze_expression(&mut self, code: &str, leaf: &str, location: &SourceLocation) -> Option<AnalyzedExpr> {
        let site = self.site(leaf);
        self.site_count += 1;
        let facts = match collect_expression(code) {
            Ok(facts) => facts,
            Err(reason) => {
                self.error(
                    ErrorKind::InvalidExpression,
                    format!("Invalid expression `{}`: {}", code.trim(), reason),
                    site,
                    location,
                );
                return None;
            }
        };

        let mut ok = true;
        let mut deps = DependencySet::new();
        for name in facts.free_references() {
            match self.scope.classify(&name, &self.locals) {
                Some(IdentifierCategory::State) => {
                    self.observed.insert(name.clone());
                    deps.insert(Dependency::State(name));
                }
                Some(IdentifierCategory::Local) => {
                    deps.insert(Dependency::Local(name));
                }
                Some(IdentifierCategory::Global) => {}
                Some(IdentifierCategory::Handler) => {
                    self.error(
                        ErrorKind::InvalidBinding,
                        format!("Handler '{}' cannot be used as a value in markup.", name),
                        site.clone(),
                        location,
                    )
                    .with_hint("Bind handlers through element events.");
                    ok = false;
                }
                None => {
                    self.error(
                        ErrorKind::UnresolvedIdentifier,
                        format!("Unknown identifier '{}'.", name),
                        site.clone(),
                        location,
                    );
                    ok = false;
                }
            }
        }
        for name in facts.free_writes() {
            self.error(
                ErrorKind::ReactivityBoundary,
                format!("Markup expression assigns '{}'.", name),
                site.clone(),
                location,
            )
            .with_hint("Move the assignment into an event handler.");
            ok = false;
        }
        if !ok {
            return None;
        }

        let locals = self.locals.clone();
        self.finish_expression(code, &locals, deps, &site, location)
    }

    fn finish_expression(
        &mut self,
        code: &str,
        locals: &[String],
        deps: DependencySet,
        site: &str,
        location: &SourceLocation,
    ) -> Option<AnalyzedExpr> {
        let qualified = qualify_expression(code, &|name: &str| self.qualify(name, locals));
        match qualified {
            Ok(qualified) => {
                let folded = if deps.is_empty() { static_eval(code) } else { None };
                Some(AnalyzedExpr {
                    source: code.trim().to_string(),
                    code: qualified.trim().to_string(),
                    deps,
                    folded,
                })
            }
            Err(reason) => {
                self.error(
                    ErrorKind::InvalidExpression,
                    format!("Invalid expression `{}`: {}", code.trim(), reason),
                    site.to_string(),
                    location,
                );
                None
            }
        }
    }

    fn analyze_children(&mut self, children: &[MarkupNode]) -> Vec<AnalyzedNode> {
        children.iter().map(|c| self.analyze_node(c)).collect()
    }

    fn analyze_node(&mut self, node: &MarkupNode) -> AnalyzedNode {
        match node {
            MarkupNode::Element(el) => AnalyzedNode::Element(self.analyze_element(el)),
            MarkupNode::Text(t) => AnalyzedNode::Text { value: t.value.clone() },
            MarkupNode::TextExpression(t) => {
                let leaf = node.label();
                match self.analyze_expression(&t.expression, &leaf, &t.location) {
                    Some(expr) => AnalyzedNode::TextExpression { expr },
                    // Errors are reported; the partial tree is discarded.
                    None => AnalyzedNode::Text { value: String::new() },
                }
            }
            MarkupNode::Conditional(c) => self.analyze_conditional(c, &node.label()),
            MarkupNode::Loop(l) => self.analyze_loop(l, &node.label()),
        }
    }

    fn analyze_element(&mut self, el: &ElementNode) -> AnalyzedElement {
        let label = format!("<{}>", el.tag);
        if !TAG_RE.is_match(&el.tag) {
            let site = self.site(&label);
            self.error(
                ErrorKind::InvalidDeclaration,
                format!("'{}' is not a valid tag name.", el.tag),
                site,
                &el.location,
            );
        }
        self.path.push(label);

        let attributes = el
            .attributes
            .iter()
            .filter_map(|attr| self.analyze_attribute(attr))
            .collect();

        let mut events: Vec<EventBinding> = Vec::new();
        for (raw, handler) in &el.events {
            let event = normalize_event_name(raw);
            let site = self.site(&format!("@{}", event));
            if !EVENT_RE.is_match(&event) {
                self.error(
                    ErrorKind::InvalidDeclaration,
                    format!("'{}' is not a valid event name.", raw),
                    site,
                    &el.location,
                );
                continue;
            }
            if events.iter().any(|e| e.event == event) {
                self.error(
                    ErrorKind::InvalidDeclaration,
                    format!("Event '{}' is bound more than once.", event),
                    site,
                    &el.location,
                );
                continue;
            }
            match self.scope.classify(handler, &self.locals) {
                Some(IdentifierCategory::Handler) => events.push(EventBinding {
                    event,
                    handler: handler.clone(),
                }),
                None => {
                    self.error(
                        ErrorKind::UnresolvedIdentifier,
                        format!("Event '{}' is bound to unknown handler '{}'.", event, handler),
                        site,
                        &el.location,
                    );
                }
                Some(category) => {
                    let what = match category {
                        IdentifierCategory::State => "state",
                        IdentifierCategory::Local => "loop variable",
                        _ => "global",
                    };
                    self.error(
                        ErrorKind::InvalidBinding,
                        format!("Event '{}' is bound to {} '{}', which is not a handler.", event, what, handler),
                        site,
                        &el.location,
                    );
                }
            }
        }

        let children = self.analyze_children(&el.children);
        self.path.pop();

        AnalyzedElement {
            tag: el.tag.clone(),
            attributes,
            events,
            children,
        }
    }

    fn analyze_attribute(&mut self, attr: &AttributeIR) -> Option<AnalyzedAttribute> {
        let site = self.site(&format!("[{}]", attr.name));
        if !ATTRIBUTE_RE.is_match(&attr.name) {
            self.error(
                ErrorKind::InvalidDeclaration,
                format!("'{}' is not a valid attribute name.", attr.name),
                site,
                &attr.location,
            );
            return None;
        }
        if attr.name.len() > 2 && attr.name[..2].eq_ignore_ascii_case("on") {
            self.error(
                ErrorKind::InvalidBinding,
                format!("Inline event attribute '{}' is not allowed.", attr.name),
                site,
                &attr.location,
            )
            .with_hint(format!("Bind the handler through events: {{ \"{}\": <handler> }}.", normalize_event_name(&attr.name)));
            return None;
        }

        match &attr.value {
            AttributeValue::Static(value) => Some(AnalyzedAttribute::Static {
                name: attr.name.clone(),
                value: value.clone(),
            }),
            AttributeValue::Dynamic(expr) => {
                let analyzed = self.analyze_expression(&expr.code, &format!("[{}]", attr.name), &expr.location)?;
                if analyzed.is_static() {
                    match static_eval_attribute(&expr.code) {
                        Some(Some(value)) => {
                            return Some(AnalyzedAttribute::Static {
                                name: attr.name.clone(),
                                value,
                            })
                        }
                        Some(None) => return None,
                        None => {}
                    }
                }
                Some(AnalyzedAttribute::Dynamic {
                    name: attr.name.clone(),
                    expr: AnalyzedExpr {
                        // folding for attributes is decided above
                        folded: None,
                        ..analyzed
                    },
                })
            }
        }
    }

    fn analyze_conditional(&mut self, cond: &ConditionalNode, label: &str) -> AnalyzedNode {
        let condition = self.analyze_expression(&cond.condition, label, &cond.location);
        self.path.push(label.to_string());
        let consequent = self.analyze_children(&cond.consequent);
        let alternate = self.analyze_children(&cond.alternate);
        self.path.pop();

        match condition {
            Some(condition) => AnalyzedNode::Conditional(AnalyzedConditional {
                condition,
                consequent,
                alternate,
            }),
            None => AnalyzedNode::Text { value: String::new() },
        }
    }

    fn analyze_loop(&mut self, lp: &LoopNode, label: &str) -> AnalyzedNode {
        let site = self.site(label);
        let mut vars_ok = true;
        let vars = std::iter::once(&lp.item_var).chain(lp.index_var.iter());
        for var in vars {
            if var == RESERVED_CONTEXT || !is_valid_identifier(var) {
                self.error(
                    ErrorKind::InvalidDeclaration,
                    format!("'{}' is not a valid loop variable.", var),
                    site.clone(),
                    &lp.location,
                );
                vars_ok = false;
            }
        }
        if lp.index_var.as_deref() == Some(lp.item_var.as_str()) {
            self.error(
                ErrorKind::InvalidDeclaration,
                format!("Loop item and index are both named '{}'.", lp.item_var),
                site.clone(),
                &lp.location,
            );
            vars_ok = false;
        }

        let source = self.analyze_expression(&lp.source, label, &lp.location);

        let own: Vec<String> = std::iter::once(lp.item_var.clone())
            .chain(lp.index_var.clone())
            .collect();
        let outer_len = self.locals.len();
        self.locals.extend(own.iter().cloned());

        let key = lp
            .key
            .as_ref()
            .and_then(|key| self.analyze_key(key, &own, label, &lp.location));
        self.path.push(label.to_string());
        let body = self.analyze_children(&lp.body);
        self.path.pop();
        self.locals.truncate(outer_len);

        let (Some(source), true) = (source, vars_ok) else {
            return AnalyzedNode::Text { value: String::new() };
        };
        if lp.key.is_some() && key.is_none() {
            return AnalyzedNode::Text { value: String::new() };
        }

        let is_own = |d: &Dependency| matches!(d, Dependency::Local(n) if own.contains(n));
        let deps: DependencySet = source
            .deps
            .iter()
            .chain(key.iter().flat_map(|k| k.deps.iter()))
            .filter(|d| !is_own(*d))
            .cloned()
            .collect();

        AnalyzedNode::Loop(AnalyzedLoop {
            source,
            item_var: lp.item_var.clone(),
            index_var: lp.index_var.clone(),
            key,
            deps,
            body,
        })
    }

    /// Keys are computed outside any item fragment, so the loop's own variables
    /// stay plain parameters of the key function.
    fn analyze_key(&mut self, key: &str, own: &[String], label: &str, location: &SourceLocation) -> Option<AnalyzedExpr> {
        let leaf = format!("{} key", label);
        let analyzed = self.analyze_expression(key, &leaf, location)?;
        let outer: Vec<String> = self.locals[..self.locals.len() - own.len()].to_vec();
        let site = self.site(&leaf);
        let code = qualify_expression(key, &|name: &str| {
            if own.iter().any(|o| o == name) {
                None
            } else {
                self.qualify(name, &outer)
            }
        });
        match code {
            Ok(code) => Some(AnalyzedExpr {
                code: code.trim().to_string(),
                ..analyzed
            }),
            Err(reason) => {
                self.error(ErrorKind::InvalidExpression, reason, site, location);
                None
            }
        }
    }
}
