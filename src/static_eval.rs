//! Static Expression Evaluator
//!
//! Evaluates expressions at compile time. A markup site whose expression reads no
//! state and no loop variable is folded to a literal so `create()` does not need to
//! evaluate it at all. Evaluation follows JavaScript semantics for the subset it
//! understands and gives up (`None`) on everything else.

use indexmap::IndexMap;
use oxc_ast::ast::{
    Argument, ArrayExpressionElement, BindingPattern, CallExpression, Expression, ObjectPropertyKind, PropertyKey,
};
use oxc_syntax::operator::{BinaryOperator, LogicalOperator, UnaryOperator};

use crate::scope::with_parsed_expression;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Array(Vec<Value>),
    Object(IndexMap<String, Value>),
}

impl Value {
    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) => true,
        }
    }

    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Number(n) => *n,
            Value::Str(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    0.0
                } else {
                    trimmed.parse::<f64>().unwrap_or(f64::NAN)
                }
            }
            Value::Array(items) => match items.as_slice() {
                [] => 0.0,
                [single] => Value::Str(single.to_js_string()).to_number(),
                _ => f64::NAN,
            },
            Value::Object(_) => f64::NAN,
        }
    }

    /// `String(value)`
    pub fn to_js_string(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::Str(s) => s.clone(),
            Value::Array(items) => items
                .iter()
                .map(|v| match v {
                    Value::Undefined | Value::Null => String::new(),
                    other => other.to_js_string(),
                })
                .collect::<Vec<_>>()
                .join(","),
            Value::Object(_) => "[object Object]".to_string(),
        }
    }

    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Null | Value::Array(_) | Value::Object(_) => "object",
        }
    }

    fn is_primitive(&self) -> bool {
        !matches!(self, Value::Array(_) | Value::Object(_))
    }

    pub fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a == b,
            // Arrays and objects compare by identity, which a value model cannot express.
            (Value::Array(_), _) | (Value::Object(_), _) => false,
            (a, b) => a == b,
        }
    }

    fn loose_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined | Value::Null, Value::Undefined | Value::Null) => true,
            (Value::Undefined | Value::Null, _) | (_, Value::Undefined | Value::Null) => false,
            (a, b) if a.type_of() == b.type_of() => a.strict_equals(b),
            (a, b) if a.is_primitive() && b.is_primitive() => a.to_number() == b.to_number(),
            _ => false,
        }
    }

    /// Property read, `None` when the access would throw.
    pub fn get(&self, key: &str) -> Option<Value> {
        match self {
            Value::Undefined | Value::Null => None,
            Value::Str(s) if key == "length" => Some(Value::Number(s.chars().count() as f64)),
            Value::Array(items) if key == "length" => Some(Value::Number(items.len() as f64)),
            Value::Array(items) => Some(
                key.parse::<usize>()
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .unwrap_or(Value::Undefined),
            ),
            Value::Object(map) => Some(map.get(key).cloned().unwrap_or(Value::Undefined)),
            _ => Some(Value::Undefined),
        }
    }
}

/// `Number.prototype.toString()` for the ranges where Rust's shortest formatting agrees.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        let sign = if n > 0.0 { "" } else { "-" };
        format!("{}Infinity", sign)
    } else if n == n.trunc() && n.abs() < 1e21 {
        format!("{}", n as i128)
    } else {
        format!("{}", n)
    }
}

/// Whether `format_number` matches JavaScript for `n`.
fn is_foldable_number(n: f64) -> bool {
    n == 0.0 || (n.is_finite() && n.abs() >= 1e-6 && n.abs() < 1e21)
}

// ═══════════════════════════════════════════════════════════════════════════════
// EVALUATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Identifier lookup during evaluation.
pub trait Scope {
    fn lookup(&self, name: &str) -> Option<Value>;
}

/// No bindings at all: only literals and literal-only operators evaluate.
pub struct EmptyScope;

impl Scope for EmptyScope {
    fn lookup(&self, _name: &str) -> Option<Value> {
        None
    }
}

pub fn evaluate(expr: &Expression, scope: &dyn Scope) -> Option<Value> {
    match expr {
        Expression::NumericLiteral(lit) => Some(Value::Number(lit.value)),
        Expression::StringLiteral(lit) => Some(Value::Str(lit.value.to_string())),
        Expression::BooleanLiteral(lit) => Some(Value::Bool(lit.value)),
        Expression::NullLiteral(_) => Some(Value::Null),
        Expression::Identifier(id) => match id.name.as_str() {
            "undefined" => Some(Value::Undefined),
            "NaN" => Some(Value::Number(f64::NAN)),
            "Infinity" => Some(Value::Number(f64::INFINITY)),
            name => scope.lookup(name),
        },
        Expression::ParenthesizedExpression(paren) => evaluate(&paren.expression, scope),
        Expression::TemplateLiteral(tpl) => {
            let mut out = String::new();
            for (i, quasi) in tpl.quasis.iter().enumerate() {
                out.push_str(quasi.value.cooked.as_ref()?.as_str());
                if let Some(e) = tpl.expressions.get(i) {
                    out.push_str(&evaluate(e, scope)?.to_js_string());
                }
            }
            Some(Value::Str(out))
        }
        Expression::ArrayExpression(arr) => {
            let mut items = Vec::with_capacity(arr.elements.len());
            for elem in &arr.elements {
                match elem {
                    ArrayExpressionElement::SpreadElement(spread) => match evaluate(&spread.argument, scope)? {
                        Value::Array(inner) => items.extend(inner),
                        _ => return None,
                    },
                    ArrayExpressionElement::Elision(_) => items.push(Value::Undefined),
                    other => items.push(evaluate(other.as_expression()?, scope)?),
                }
            }
            Some(Value::Array(items))
        }
        Expression::ObjectExpression(obj) => {
            let mut map = IndexMap::new();
            for prop in &obj.properties {
                let ObjectPropertyKind::ObjectProperty(p) = prop else {
                    return None;
                };
                if p.computed || p.method {
                    return None;
                }
                let key = match &p.key {
                    PropertyKey::StaticIdentifier(id) => id.name.to_string(),
                    PropertyKey::StringLiteral(s) => s.value.to_string(),
                    PropertyKey::NumericLiteral(n) => format_number(n.value),
                    _ => return None,
                };
                map.insert(key, evaluate(&p.value, scope)?);
            }
            Some(Value::Object(map))
        }
        Expression::StaticMemberExpression(member) => {
            let object = evaluate(&member.object, scope)?;
            if member.optional && matches!(object, Value::Undefined | Value::Null) {
                return Some(Value::Undefined);
            }
            object.get(&member.property.name)
        }
        Expression::ComputedMemberExpression(member) => {
            let object = evaluate(&member.object, scope)?;
            let key = evaluate(&member.expression, scope)?;
            object.get(&key.to_js_string())
        }
        Expression::UnaryExpression(unary) => {
            let value = evaluate(&unary.argument, scope)?;
            match unary.operator {
                UnaryOperator::LogicalNot => Some(Value::Bool(!value.truthy())),
                UnaryOperator::UnaryNegation => Some(Value::Number(-value.to_number())),
                UnaryOperator::UnaryPlus => Some(Value::Number(value.to_number())),
                UnaryOperator::Typeof => Some(Value::Str(value.type_of().to_string())),
                UnaryOperator::Void => Some(Value::Undefined),
                _ => None,
            }
        }
        Expression::BinaryExpression(bin) => {
            let left = evaluate(&bin.left, scope)?;
            let right = evaluate(&bin.right, scope)?;
            apply_binary(bin.operator, &left, &right)
        }
        Expression::LogicalExpression(logical) => {
            let left = evaluate(&logical.left, scope)?;
            match logical.operator {
                LogicalOperator::And if !left.truthy() => Some(left),
                LogicalOperator::Or if left.truthy() => Some(left),
                LogicalOperator::Coalesce if !matches!(left, Value::Undefined | Value::Null) => {
                    Some(left)
                }
                _ => evaluate(&logical.right, scope),
            }
        }
        Expression::ConditionalExpression(cond) => {
            if evaluate(&cond.test, scope)?.truthy() {
                evaluate(&cond.consequent, scope)
            } else {
                evaluate(&cond.alternate, scope)
            }
        }
        Expression::CallExpression(call) => evaluate_call(call, scope),
        _ => None,
    }
}

/// Parameters bound over an outer scope.
struct Shadowed<'s> {
    outer: &'s dyn Scope,
    names: Vec<(&'s str, Value)>,
}

impl Scope for Shadowed<'_> {
    fn lookup(&self, name: &str) -> Option<Value> {
        match self.names.iter().find(|(n, _)| *n == name) {
            Some((_, value)) => Some(value.clone()),
            None => self.outer.lookup(name),
        }
    }
}

/// `(item, index) => expression` with plain parameters.
struct Callback<'e, 'a> {
    params: Vec<&'e str>,
    body: &'e Expression<'a>,
}

impl<'e, 'a> Callback<'e, 'a> {
    fn from_argument(argument: &'e Argument<'a>) -> Option<Self> {
        let Expression::ArrowFunctionExpression(arrow) = argument.as_expression()? else {
            return None;
        };
        if arrow.r#async || arrow.params.rest.is_some() {
            return None;
        }
        let body = arrow.get_expression()?;
        let params = arrow
            .params
            .items
            .iter()
            .map(|param| match &param.pattern {
                BindingPattern::BindingIdentifier(id) if param.initializer.is_none() => Some(id.name.as_str()),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()?;
        Some(Callback { params, body })
    }

    fn call(&self, scope: &dyn Scope, args: &[Value]) -> Option<Value> {
        let names = self
            .params
            .iter()
            .enumerate()
            .map(|(i, name)| (*name, args.get(i).cloned().unwrap_or(Value::Undefined)))
            .collect();
        evaluate(self.body, &Shadowed { outer: scope, names })
    }
}

/// Side-effect free methods of arrays and strings.
fn evaluate_call(call: &CallExpression, scope: &dyn Scope) -> Option<Value> {
    let Expression::StaticMemberExpression(member) = &call.callee else {
        return None;
    };
    if call.optional || member.optional {
        return None;
    }
    let method = member.property.name.as_str();
    match evaluate(&member.object, scope)? {
        Value::Array(items) => array_method(&items, method, &call.arguments, scope),
        Value::Str(s) if call.arguments.is_empty() => match method {
            "toUpperCase" => Some(Value::Str(s.to_uppercase())),
            "toLowerCase" => Some(Value::Str(s.to_lowercase())),
            "trim" => Some(Value::Str(s.trim().to_string())),
            _ => None,
        },
        _ => None,
    }
}

fn argument_value(arguments: &[Argument], index: usize, scope: &dyn Scope) -> Option<Value> {
    match arguments.get(index) {
        Some(argument) => evaluate(argument.as_expression()?, scope),
        None => Some(Value::Undefined),
    }
}

fn array_method(items: &[Value], method: &str, arguments: &[Argument], scope: &dyn Scope) -> Option<Value> {
    match method {
        "join" => {
            let separator = match argument_value(arguments, 0, scope)? {
                Value::Undefined => ",".to_string(),
                other => other.to_js_string(),
            };
            let parts: Vec<String> = items
                .iter()
                .map(|v| match v {
                    Value::Undefined | Value::Null => String::new(),
                    other => other.to_js_string(),
                })
                .collect();
            Some(Value::Str(parts.join(&separator)))
        }
        "includes" => {
            let needle = argument_value(arguments, 0, scope)?;
            let nan = |v: &Value| matches!(v, Value::Number(n) if n.is_nan());
            Some(Value::Bool(
                items.iter().any(|v| v.strict_equals(&needle) || (nan(v) && nan(&needle))),
            ))
        }
        "map" | "filter" | "some" | "every" | "find" => {
            let [argument] = arguments else {
                return None;
            };
            let callback = Callback::from_argument(argument)?;
            let results = items
                .iter()
                .enumerate()
                .map(|(index, item)| callback.call(scope, &[item.clone(), Value::Number(index as f64)]))
                .collect::<Option<Vec<_>>>()?;
            if method == "map" {
                return Some(Value::Array(results));
            }
            let mut kept = items.iter().zip(&results).filter(|(_, r)| r.truthy()).map(|(i, _)| i.clone());
            match method {
                "filter" => Some(Value::Array(kept.collect())),
                "some" => Some(Value::Bool(results.iter().any(Value::truthy))),
                "every" => Some(Value::Bool(results.iter().all(Value::truthy))),
                _ => Some(kept.next().unwrap_or(Value::Undefined)),
            }
        }
        _ => None,
    }
}

pub fn apply_binary(operator: BinaryOperator, left: &Value, right: &Value) -> Option<Value> {
    let number = |f: fn(f64, f64) -> f64| Some(Value::Number(f(left.to_number(), right.to_number())));
    match operator {
        BinaryOperator::Addition => {
            let concat = matches!(left, Value::Str(_))
                || matches!(right, Value::Str(_))
                || !left.is_primitive()
                || !right.is_primitive();
            if concat {
                Some(Value::Str(format!("{}{}", left.to_js_string(), right.to_js_string())))
            } else {
                number(|a, b| a + b)
            }
        }
        BinaryOperator::Subtraction => number(|a, b| a - b),
        BinaryOperator::Multiplication => number(|a, b| a * b),
        BinaryOperator::Division => number(|a, b| a / b),
        BinaryOperator::Remainder => number(|a, b| a % b),
        BinaryOperator::Exponential => number(f64::powf),
        BinaryOperator::StrictEquality => Some(Value::Bool(left.strict_equals(right))),
        BinaryOperator::StrictInequality => Some(Value::Bool(!left.strict_equals(right))),
        BinaryOperator::Equality => Some(Value::Bool(left.loose_equals(right))),
        BinaryOperator::Inequality => Some(Value::Bool(!left.loose_equals(right))),
        BinaryOperator::LessThan
        | BinaryOperator::LessEqualThan
        | BinaryOperator::GreaterThan
        | BinaryOperator::GreaterEqualThan => {
            let ordering = match (left, right) {
                (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
                _ => left.to_number().partial_cmp(&right.to_number()),
            };
            // NaN compares false on every side
            let Some(ordering) = ordering else {
                return Some(Value::Bool(false));
            };
            let result = match operator {
                BinaryOperator::LessThan => ordering.is_lt(),
                BinaryOperator::LessEqualThan => ordering.is_le(),
                BinaryOperator::GreaterThan => ordering.is_gt(),
                _ => ordering.is_ge(),
            };
            Some(Value::Bool(result))
        }
        _ => None,
    }
}

/// Parse and evaluate `code` against `scope`.
pub fn evaluate_source(code: &str, scope: &dyn Scope) -> Option<Value> {
    with_parsed_expression(code, |expr| evaluate(expr, scope)).ok().flatten()
}

/// Try to evaluate an expression to the string it renders as.
/// Returns `None` if the expression reads anything that is not a literal.
pub fn static_eval(code: &str) -> Option<String> {
    let value = evaluate_source(code, &EmptyScope)?;
    if let Value::Number(n) = value {
        if !is_foldable_number(n) {
            return None;
        }
    }
    match value {
        Value::Object(_) => None,
        other => Some(other.to_js_string()),
    }
}

/// Attribute counterpart of [`static_eval`], following `setAttr` in generated code:
/// `Some(None)` means the attribute is not rendered at all.
pub fn static_eval_attribute(code: &str) -> Option<Option<String>> {
    match evaluate_source(code, &EmptyScope)? {
        Value::Undefined | Value::Null | Value::Bool(false) => Some(None),
        Value::Bool(true) => Some(Some(String::new())),
        Value::Number(n) if !is_foldable_number(n) => None,
        Value::Object(_) => None,
        other => Some(Some(other.to_js_string())),
    }
}
