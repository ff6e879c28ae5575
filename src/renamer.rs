use oxc_ast::ast::{AssignmentTargetPropertyIdentifier, Expression, IdentifierReference, ObjectProperty};
use oxc_ast_visit::Visit;
use std::collections::HashSet;

use crate::scope::{collect_expression, collect_statements, with_parsed_expression, with_parsed_statements};

/// Maps a free identifier to the code that replaces it, or `None` to leave it alone.
pub type Resolver<'r> = &'r dyn Fn(&str) -> Option<String>;

/// Collects span replacements that turn free identifiers into context accesses.
/// Only the occurrences listed in `free` (start offsets from the scope collector) are
/// rewritten; an occurrence bound by an enclosing declaration is left alone.
pub struct QualifyingRenamer<'r> {
    resolve: Resolver<'r>,
    free: &'r HashSet<u32>,
    offset: u32,
    pub replacements: Vec<(u32, u32, String)>,
}

impl<'r> QualifyingRenamer<'r> {
    pub fn new(resolve: Resolver<'r>, free: &'r HashSet<u32>, offset: u32) -> Self {
        QualifyingRenamer {
            resolve,
            free,
            offset,
            replacements: Vec::new(),
        }
    }

    fn lookup(&self, name: &str, start: u32) -> Option<String> {
        if !self.free.contains(&(start - self.offset)) {
            return None;
        }
        (self.resolve)(name)
    }

    fn push(&mut self, start: u32, end: u32, text: String) {
        self.replacements
            .push((start - self.offset, end - self.offset, text));
    }
}

impl<'a, 'r> Visit<'a> for QualifyingRenamer<'r> {
    fn visit_identifier_reference(&mut self, ident: &IdentifierReference<'a>) {
        if let Some(qualified) = self.lookup(&ident.name, ident.span.start) {
            log::trace!("qualify `{}` -> `{}`", ident.name, qualified);
            self.push(ident.span.start, ident.span.end, qualified);
        }
    }

    fn visit_object_property(&mut self, prop: &ObjectProperty<'a>) {
        // `{ count }` must keep its key: `{ count: ctx.state.count.value }`
        if prop.shorthand {
            if let Expression::Identifier(id) = &prop.value {
                if let Some(qualified) = self.lookup(&id.name, id.span.start) {
                    let replacement = format!("{}: {}", id.name, qualified);
                    self.push(prop.span.start, prop.span.end, replacement);
                    return;
                }
            }
        }
        oxc_ast_visit::walk::walk_object_property(self, prop);
    }

    fn visit_assignment_target_property_identifier(
        &mut self,
        prop: &AssignmentTargetPropertyIdentifier<'a>,
    ) {
        if let Some(qualified) = self.lookup(&prop.binding.name, prop.binding.span.start) {
            let replacement = format!("{}: {}", prop.binding.name, qualified);
            self.push(prop.binding.span.start, prop.binding.span.end, replacement);
            if let Some(init) = &prop.init {
                self.visit_expression(init);
            }
            return;
        }
        oxc_ast_visit::walk::walk_assignment_target_property_identifier(self, prop);
    }
}

/// Apply `(start, end, text)` replacements to `code`. Replacements must not overlap.
pub fn apply_replacements(code: &str, mut replacements: Vec<(u32, u32, String)>) -> String {
    // Back to front so earlier offsets stay valid
    replacements.sort_by(|a, b| b.0.cmp(&a.0));
    let mut result = code.to_string();
    for (start, end, text) in replacements {
        result.replace_range(start as usize..end as usize, &text);
    }
    result
}

/// Rewrite every free identifier of an expression that `resolve` knows about.
pub fn qualify_expression(code: &str, resolve: Resolver<'_>) -> Result<String, String> {
    let free = collect_expression(code)?.free_offsets();
    let replacements = with_parsed_expression(code, |expr| {
        let mut renamer = QualifyingRenamer::new(resolve, &free, 0);
        renamer.visit_expression(expr);
        renamer.replacements
    })?;
    Ok(apply_replacements(code.trim_end(), replacements))
}

/// Same as [`qualify_expression`] for a handler body.
pub fn qualify_statements(body: &str, resolve: Resolver<'_>) -> Result<String, String> {
    let free = collect_statements(body)?.free_offsets();
    let replacements = with_parsed_statements(body, |program, offset| {
        let mut renamer = QualifyingRenamer::new(resolve, &free, offset);
        renamer.visit_program(program);
        renamer.replacements
    })?;
    Ok(apply_replacements(body, replacements))
}
