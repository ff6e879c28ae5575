use oxc_allocator::Allocator;
use oxc_ast::ast::{
    AssignmentTargetPropertyIdentifier, BindingIdentifier, Class, ClassType, Expression, Function,
    FunctionType, IdentifierReference, Program, SimpleAssignmentTarget, StringLiteral, TemplateLiteral,
    VariableDeclarator,
};
use oxc_ast_visit::Visit;
use oxc_parser::Parser;
use oxc_span::{SourceType, Span};
use oxc_syntax::scope::{ScopeFlags, ScopeId};
use std::cell::Cell;
use std::collections::HashSet;

lazy_static::lazy_static! {
    /// Names every expression may read without a declaration.
    pub static ref RUNTIME_GLOBALS: HashSet<&'static str> = {
        let mut s = HashSet::new();
        s.insert("Math");
        s.insert("console");
        s.insert("JSON");
        s.insert("Date");
        s.insert("String");
        s.insert("Number");
        s.insert("Boolean");
        s.insert("Array");
        s.insert("Object");
        s.insert("Map");
        s.insert("Set");
        s.insert("Error");
        s.insert("undefined");
        s.insert("NaN");
        s.insert("Infinity");
        s.insert("parseInt");
        s.insert("parseFloat");
        s.insert("isNaN");
        s.insert("isFinite");
        s.insert("encodeURIComponent");
        s.insert("decodeURIComponent");
        s.insert("window"); // Browser environment
        s.insert("document");
        s
    };
}

/// Identifier that generated code reserves for the fragment context.
pub const RESERVED_CONTEXT: &str = "ctx";

/// Handler bodies are statement lists; they are parsed inside this wrapper so that
/// `return` is legal. Spans are shifted back by the prefix length.
pub(crate) const HANDLER_PREFIX: &str = "function __handler() {\n";
pub(crate) const HANDLER_SUFFIX: &str = "\n}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentifierCategory {
    /// Loop variable of an enclosing loop
    Local,
    State,
    Handler,
    Global,
}

/// Declared names of one component, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct ScopeBindings {
    pub states: Vec<String>,
    pub handlers: Vec<String>,
}

impl ScopeBindings {
    pub fn new(states: Vec<String>, handlers: Vec<String>) -> Self {
        ScopeBindings { states, handlers }
    }

    pub fn is_state(&self, name: &str) -> bool {
        self.states.iter().any(|s| s == name)
    }

    pub fn is_handler(&self, name: &str) -> bool {
        self.handlers.iter().any(|h| h == name)
    }

    /// Locals shadow state, state shadows handlers, globals come last.
    pub fn classify(&self, name: &str, locals: &[String]) -> Option<IdentifierCategory> {
        if locals.iter().any(|l| l == name) {
            Some(IdentifierCategory::Local)
        } else if self.is_state(name) {
            Some(IdentifierCategory::State)
        } else if self.is_handler(name) {
            Some(IdentifierCategory::Handler)
        } else if RUNTIME_GLOBALS.contains(name) {
            Some(IdentifierCategory::Global)
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EXPRESSION FACTS
// ═══════════════════════════════════════════════════════════════════════════════

/// One identifier occurrence. `bound` is set when a declaration inside the analyzed
/// code (parameter, `let`/`const`/`var`, function, class, catch) is in scope for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub name: String,
    /// Relative to the input text
    pub span: Span,
    pub bound: bool,
}

/// What one expression (or handler body) reads and writes.
#[derive(Debug, Clone, Default)]
pub struct ExpressionFacts {
    /// Every identifier reference in source order.
    pub references: Vec<Reference>,
    /// Identifiers assigned or updated, in source order, duplicates kept.
    pub writes: Vec<Reference>,
}

impl ExpressionFacts {
    /// Free references, deduplicated, first-seen order.
    pub fn free_references(&self) -> Vec<String> {
        dedup_free(&self.references)
    }

    /// Free names written, deduplicated, first-write order.
    pub fn free_writes(&self) -> Vec<String> {
        dedup_free(&self.writes)
    }

    /// Start offsets of every free reference; identifies occurrences for rewriting.
    pub fn free_offsets(&self) -> HashSet<u32> {
        self.references
            .iter()
            .filter(|r| !r.bound)
            .map(|r| r.span.start)
            .collect()
    }
}

fn dedup_free(references: &[Reference]) -> Vec<String> {
    let mut seen = HashSet::new();
    references
        .iter()
        .filter(|r| !r.bound)
        .filter(|r| seen.insert(r.name.as_str()))
        .map(|r| r.name.clone())
        .collect()
}

struct ScopeFrame {
    parent: Option<usize>,
    /// Function (or top-level) scope: target of `var` hoisting
    hoists: bool,
    names: HashSet<String>,
}

/// Builds the scope tree of the visited code, then resolves each recorded reference
/// against the scope it occurred in. Resolution happens after the walk so that
/// hoisted and later-declared names are visible to earlier references.
struct ScopeAwareCollector {
    scopes: Vec<ScopeFrame>,
    stack: Vec<usize>,
    references: Vec<(String, Span, usize)>,
    writes: Vec<(String, Span, usize)>,
    offset: u32,
}

impl ScopeAwareCollector {
    fn new(offset: u32) -> Self {
        ScopeAwareCollector {
            scopes: vec![ScopeFrame {
                parent: None,
                hoists: true,
                names: HashSet::new(),
            }],
            stack: vec![0],
            references: Vec::new(),
            writes: Vec::new(),
            offset,
        }
    }

    fn shift(&self, span: Span) -> Span {
        Span::new(span.start - self.offset, span.end - self.offset)
    }

    fn current(&self) -> usize {
        self.stack.last().copied().unwrap_or(0)
    }

    fn push_scope(&mut self, hoists: bool) {
        let parent = Some(self.current());
        self.scopes.push(ScopeFrame {
            parent,
            hoists,
            names: HashSet::new(),
        });
        self.stack.push(self.scopes.len() - 1);
    }

    fn pop_scope(&mut self) {
        if self.stack.len() > 1 {
            self.stack.pop();
        }
    }

    fn bind(&mut self, scope: usize, name: &str) {
        self.scopes[scope].names.insert(name.to_string());
    }

    fn hoist_target(&self) -> usize {
        self.stack
            .iter()
            .rev()
            .copied()
            .find(|&i| self.scopes[i].hoists)
            .unwrap_or(0)
    }

    fn is_bound(&self, name: &str, mut scope: usize) -> bool {
        loop {
            let frame = &self.scopes[scope];
            if frame.names.contains(name) {
                return true;
            }
            match frame.parent {
                Some(parent) => scope = parent,
                None => return false,
            }
        }
    }

    fn record_write(&mut self, name: &str, span: Span) {
        let span = self.shift(span);
        let scope = self.current();
        self.writes.push((name.to_string(), span, scope));
    }

    fn finish(self) -> ExpressionFacts {
        let resolve = |entries: &[(String, Span, usize)]| -> Vec<Reference> {
            entries
                .iter()
                .map(|(name, span, scope)| Reference {
                    name: name.clone(),
                    span: *span,
                    bound: self.is_bound(name, *scope),
                })
                .collect()
        };
        ExpressionFacts {
            references: resolve(&self.references),
            writes: resolve(&self.writes),
        }
    }
}

impl<'a> Visit<'a> for ScopeAwareCollector {
    fn enter_scope(&mut self, flags: ScopeFlags, _scope_id: &Cell<Option<ScopeId>>) {
        self.push_scope(flags.is_function() || flags.is_top());
    }

    fn leave_scope(&mut self) {
        self.pop_scope();
    }

    fn visit_identifier_reference(&mut self, ident: &IdentifierReference<'a>) {
        let span = self.shift(ident.span);
        let scope = self.current();
        self.references.push((ident.name.to_string(), span, scope));
    }

    fn visit_binding_identifier(&mut self, ident: &BindingIdentifier<'a>) {
        let scope = self.current();
        self.bind(scope, &ident.name);
    }

    fn visit_function(&mut self, func: &Function<'a>, flags: ScopeFlags) {
        // A declaration's name belongs to the enclosing scope; an expression's
        // name is only visible inside its own body.
        if matches!(func.r#type, FunctionType::FunctionDeclaration) {
            if let Some(id) = &func.id {
                let scope = self.current();
                self.bind(scope, &id.name);
            }
        }
        oxc_ast_visit::walk::walk_function(self, func, flags);
    }

    fn visit_class(&mut self, class: &Class<'a>) {
        if matches!(class.r#type, ClassType::ClassExpression) && class.id.is_some() {
            self.push_scope(false);
            oxc_ast_visit::walk::walk_class(self, class);
            self.pop_scope();
        } else {
            oxc_ast_visit::walk::walk_class(self, class);
        }
    }

    fn visit_variable_declarator(&mut self, declarator: &VariableDeclarator<'a>) {
        if declarator.kind.is_var() {
            let target = self.hoist_target();
            for id in declarator.id.get_binding_identifiers() {
                self.bind(target, &id.name);
            }
        }
        oxc_ast_visit::walk::walk_variable_declarator(self, declarator);
    }

    fn visit_simple_assignment_target(&mut self, target: &SimpleAssignmentTarget<'a>) {
        if let SimpleAssignmentTarget::AssignmentTargetIdentifier(id) = target {
            self.record_write(&id.name, id.span);
        }
        oxc_ast_visit::walk::walk_simple_assignment_target(self, target);
    }

    fn visit_assignment_target_property_identifier(
        &mut self,
        prop: &AssignmentTargetPropertyIdentifier<'a>,
    ) {
        self.record_write(&prop.binding.name, prop.binding.span);
        oxc_ast_visit::walk::walk_assignment_target_property_identifier(self, prop);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PARSING
// ═══════════════════════════════════════════════════════════════════════════════

fn source_type() -> SourceType {
    SourceType::default().with_module(true)
}

fn describe_errors<E: std::fmt::Display>(errors: &[E]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Parse `code` as a single expression and hand the AST to `f`.
pub fn with_parsed_expression<R>(
    code: &str,
    f: impl for<'a> FnOnce(&Expression<'a>) -> R,
) -> Result<R, String> {
    if code.trim().is_empty() {
        return Err("empty expression".to_string());
    }
    let allocator = Allocator::default();
    match Parser::new(&allocator, code, source_type()).parse_expression() {
        Ok(expr) => Ok(f(&expr)),
        Err(errors) => Err(describe_errors(&errors)),
    }
}

/// Parse `body` as handler statements and hand the wrapped program to `f`
/// together with the span offset of the body inside the wrapper.
pub fn with_parsed_statements<R>(
    body: &str,
    f: impl for<'a> FnOnce(&Program<'a>, u32) -> R,
) -> Result<R, String> {
    let wrapped = format!("{HANDLER_PREFIX}{body}{HANDLER_SUFFIX}");
    let allocator = Allocator::default();
    let ret = Parser::new(&allocator, &wrapped, source_type()).parse();
    if !ret.errors.is_empty() {
        return Err(describe_errors(&ret.errors));
    }
    Ok(f(&ret.program, HANDLER_PREFIX.len() as u32))
}

pub fn collect_expression(code: &str) -> Result<ExpressionFacts, String> {
    with_parsed_expression(code, |expr| {
        let mut collector = ScopeAwareCollector::new(0);
        collector.visit_expression(expr);
        collector.finish()
    })
}

pub fn collect_statements(body: &str) -> Result<ExpressionFacts, String> {
    with_parsed_statements(body, |program, offset| {
        let mut collector = ScopeAwareCollector::new(offset);
        collector.visit_program(program);
        collector.finish()
    })
}

/// Byte ranges of string and template literals in a handler body.
struct LiteralRanges {
    offset: u32,
    ranges: Vec<(usize, usize)>,
}

impl LiteralRanges {
    fn push(&mut self, span: Span) {
        let start = span.start.saturating_sub(self.offset) as usize;
        let end = span.end.saturating_sub(self.offset) as usize;
        self.ranges.push((start, end));
    }
}

impl<'a> Visit<'a> for LiteralRanges {
    fn visit_string_literal(&mut self, it: &StringLiteral<'a>) {
        self.push(it.span);
    }

    fn visit_template_literal(&mut self, it: &TemplateLiteral<'a>) {
        self.push(it.span);
        for expression in &it.expressions {
            self.visit_expression(expression);
        }
    }
}

/// Literal ranges of `body`, which the emitter must not re-indent.
pub fn literal_ranges(body: &str) -> Result<Vec<(usize, usize)>, String> {
    with_parsed_statements(body, |program, offset| {
        let mut ranges = LiteralRanges {
            offset,
            ranges: Vec::new(),
        };
        ranges.visit_program(program);
        ranges.ranges
    })
}
