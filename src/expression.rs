//! Expression Evaluation
//!
//! Data filters, switch conditions, collection selectors and argument
//! templates are jq expressions. The engine only talks to the
//! [`ExpressionEvaluator`] trait, so another query language can be swapped
//! in without touching the state executors. [`JqEvaluator`] is the default.
//!
//! Expressions may be written bare (`.order.total`) or wrapped the CNCF way
//! (`${ .order.total }`). Inside argument templates only wrapped strings are
//! evaluated; everything else is a literal.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use jaq_core::load::{Arena, File as JaqFile, Loader};
use jaq_core::{Compiler, Ctx, RcIter};
use jaq_json::Val;
use serde_json::{Map, Value};

use crate::error::ExpressionError;

/// Evaluates a query expression against a JSON input.
pub trait ExpressionEvaluator: Send + Sync {
    /// Returns the first value the expression produces, or `null` when it
    /// produces none.
    fn evaluate(&self, expression: &str, input: &Value) -> Result<Value, ExpressionError>;
}

/// jq evaluator backed by `jaq`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JqEvaluator;

impl JqEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl ExpressionEvaluator for JqEvaluator {
    fn evaluate(&self, expression: &str, input: &Value) -> Result<Value, ExpressionError> {
        let code = unwrap_expression(expression).unwrap_or_else(|| expression.trim());

        // An empty filter is the identity.
        if code.is_empty() {
            return Ok(input.clone());
        }

        run_jq(code, input).map_err(|cause| ExpressionError::new(expression, cause))
    }
}

type JqFilter = jaq_core::Filter<jaq_core::Native<Val>>;

/// Compiled filters are kept per thread, keyed by their code.
const FILTER_CACHE_CAPACITY: usize = 512;

thread_local! {
    static COMPILED: RefCell<HashMap<String, Rc<JqFilter>>> = RefCell::new(HashMap::new());
}

/// Runs `code`, treating indexing of `null` as jq does (it yields `null`).
///
/// jaq rejects `.key` on `null`. When a run fails that way the path chains
/// of the expression are rewritten to step over `null` and the run is
/// retried; if the rewrite changes nothing or fails too, the first error
/// is reported.
fn run_jq(code: &str, input: &Value) -> Result<Value, String> {
    match run_compiled(code, input) {
        Err(cause) if cause.contains("cannot use null as") => {
            let tolerant = null_safe_paths(code);
            if tolerant == code {
                return Err(cause);
            }
            run_compiled(&tolerant, input).map_err(|_| cause)
        }
        result => result,
    }
}

fn run_compiled(code: &str, input: &Value) -> Result<Value, String> {
    let filter = compiled(code)?;
    let inputs = RcIter::new(core::iter::empty());
    let mut out = filter.run((Ctx::new([], &inputs), Val::from(input.clone())));

    match out.next() {
        None => Ok(Value::Null),
        Some(Ok(val)) => Ok(Value::from(val)),
        Some(Err(e)) => Err(format!("runtime error: {}", e)),
    }
}

fn compiled(code: &str) -> Result<Rc<JqFilter>, String> {
    if let Some(filter) = COMPILED.with(|cache| cache.borrow().get(code).cloned()) {
        return Ok(filter);
    }

    let filter = Rc::new(compile(code)?);
    COMPILED.with(|cache| {
        let mut cache = cache.borrow_mut();
        if cache.len() >= FILTER_CACHE_CAPACITY {
            cache.clear();
        }
        cache.insert(code.to_string(), filter.clone());
    });
    Ok(filter)
}

fn compile(code: &str) -> Result<JqFilter, String> {
    let loader = Loader::new(jaq_std::defs().chain(jaq_json::defs()));
    let arena = Arena::default();

    let program = JaqFile { code, path: () };

    let modules = loader
        .load(&arena, program)
        .map_err(|errs| format!("parse error: {:?}", errs))?;

    Compiler::default()
        .with_funs(jaq_std::funs().chain(jaq_json::funs()))
        .compile(modules)
        .map_err(|errs| format!("compile error: {:?}", errs))
}

#[derive(Debug, Clone, Copy)]
enum Lexeme {
    Str,
    /// `\( ... )` inside a string, with its open parenthesis depth
    Interpolation(usize),
}

/// Rewrites every `.key.key` path chain (and `$var.key` chain) so that each
/// step passes `null` through instead of failing. String literals are kept
/// as written; code inside their interpolations is rewritten.
fn null_safe_paths(code: &str) -> String {
    let chars: Vec<char> = code.chars().collect();
    let mut out = String::with_capacity(code.len() * 2);
    let mut lexemes: Vec<Lexeme> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if let Some(Lexeme::Str) = lexemes.last() {
            out.push(c);
            match c {
                '\\' if chars.get(i + 1) == Some(&'(') => {
                    out.push('(');
                    lexemes.push(Lexeme::Interpolation(0));
                    i += 2;
                }
                '\\' => {
                    if let Some(&escaped) = chars.get(i + 1) {
                        out.push(escaped);
                    }
                    i += 2;
                }
                '"' => {
                    lexemes.pop();
                    i += 1;
                }
                _ => i += 1,
            }
            continue;
        }

        match c {
            '"' => lexemes.push(Lexeme::Str),
            '(' => {
                if let Some(Lexeme::Interpolation(depth)) = lexemes.last_mut() {
                    *depth += 1;
                }
            }
            ')' => {
                if let Some(Lexeme::Interpolation(0)) = lexemes.last() {
                    lexemes.pop();
                } else if let Some(Lexeme::Interpolation(depth)) = lexemes.last_mut() {
                    *depth -= 1;
                }
            }
            '.' | '$' if starts_path(&chars, i) => {
                let (chain, next) = guarded_path(&chars, i);
                out.push_str(&chain);
                i = next;
                continue;
            }
            _ => {}
        }

        out.push(c);
        i += 1;
    }

    out
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn ident_end(chars: &[char], mut i: usize) -> usize {
    while chars.get(i).map_or(false, |&c| is_ident(c)) {
        i += 1;
    }
    i
}

/// A path starts at `.key` or `$var` that does not continue an earlier term.
fn starts_path(chars: &[char], i: usize) -> bool {
    let follows_term = i > 0 && {
        let prev = chars[i - 1];
        is_ident(prev) || matches!(prev, ')' | ']' | '}' | '"' | '.' | '?' | '$')
    };
    !follows_term && chars.get(i + 1).map_or(false, |&c| is_ident_start(c))
}

/// Reads the path at `start` and returns its null-tolerant form with the
/// index just past it.
fn guarded_path(chars: &[char], start: usize) -> (String, usize) {
    let mut i = start;
    let mut variable = None;
    if chars[i] == '$' {
        let end = ident_end(chars, i + 1);
        variable = Some(chars[i..end].iter().collect::<String>());
        i = end;
    }

    let mut steps = Vec::new();
    while chars.get(i) == Some(&'.') && chars.get(i + 1).map_or(false, |&c| is_ident_start(c)) {
        let end = ident_end(chars, i + 1);
        let mut step: String = chars[i..end].iter().collect();
        i = end;
        if chars.get(i) == Some(&'?') && chars.get(i + 1) != Some(&'/') {
            step.push('?');
            i += 1;
        }
        steps.push(format!("if . == null then null else {} end", step));
    }

    let chain = match variable {
        Some(variable) if steps.is_empty() => variable,
        Some(variable) => format!("({} | {})", variable, steps.join(" | ")),
        None => format!("({})", steps.join(" | ")),
    };
    (chain, i)
}

/// Returns the inner expression of a `${ ... }` string.
pub fn unwrap_expression(text: &str) -> Option<&str> {
    text.trim()
        .strip_prefix("${")?
        .strip_suffix('}')
        .map(str::trim)
}

/// jq truthiness: only `false` and `null` are falsy.
pub fn is_truthy(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(false))
}

/// Builds a value from a template, evaluating every `${ ... }` string in it.
pub fn evaluate_template(
    evaluator: &dyn ExpressionEvaluator,
    template: &Value,
    input: &Value,
) -> Result<Value, ExpressionError> {
    match template {
        Value::String(text) => match unwrap_expression(text) {
            Some(expression) => evaluator.evaluate(expression, input),
            None => Ok(template.clone()),
        },
        Value::Array(items) => items
            .iter()
            .map(|item| evaluate_template(evaluator, item, input))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(fields) => {
            let mut built = Map::with_capacity(fields.len());
            for (key, value) in fields {
                built.insert(key.clone(), evaluate_template(evaluator, value, input)?);
            }
            Ok(Value::Object(built))
        }
        literal => Ok(literal.clone()),
    }
}

/// Short name of a JSON value's type, for error messages.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_path_expression() {
        let input = json!({"order": {"total": 42}});
        let result = JqEvaluator.evaluate(".order.total", &input).unwrap();
        assert_eq!(result, json!(42));
    }

    #[test]
    fn test_wrapped_expression() {
        let input = json!({"value": 60});
        let result = JqEvaluator.evaluate("${ .value + 2 }", &input).unwrap();
        assert_eq!(result, json!(62));
    }

    #[test]
    fn test_empty_expression_is_identity() {
        let input = json!({"a": 1});
        assert_eq!(JqEvaluator.evaluate("", &input).unwrap(), input);
        assert_eq!(JqEvaluator.evaluate("${ }", &input).unwrap(), input);
    }

    #[test]
    fn test_object_construction() {
        let input = json!({"items": [1, 2, 3], "value": 60});
        let result = JqEvaluator
            .evaluate("{count: (.items | length), value}", &input)
            .unwrap();
        assert_eq!(result, json!({"count": 3, "value": 60}));
    }

    #[test]
    fn test_string_result() {
        let input = json!({"name": "world"});
        let result = JqEvaluator.evaluate("\"hello \" + .name", &input).unwrap();
        assert_eq!(result, json!("hello world"));
    }

    #[test]
    fn test_no_output_is_null() {
        let result = JqEvaluator.evaluate("empty", &json!({})).unwrap();
        assert_eq!(result, Value::Null);
    }

    #[test]
    fn test_malformed_expression() {
        let err = JqEvaluator.evaluate(".foo[", &json!({})).unwrap_err();
        assert_eq!(err.expression, ".foo[");
        assert!(err.cause.contains("parse"));
    }

    #[test]
    fn test_type_mismatch() {
        let err = JqEvaluator.evaluate(".foo", &json!(5)).unwrap_err();
        assert!(err.cause.contains("runtime"));
    }

    #[test]
    fn test_missing_path_is_null() {
        assert_eq!(JqEvaluator.evaluate(".a.b", &json!({})).unwrap(), Value::Null);
        assert_eq!(JqEvaluator.evaluate(".a.b.c", &json!({"a": {}})).unwrap(), Value::Null);
        assert_eq!(JqEvaluator.evaluate(".a", &Value::Null).unwrap(), Value::Null);
        assert_eq!(JqEvaluator.evaluate("null | .b", &json!({})).unwrap(), Value::Null);
    }

    #[test]
    fn test_alternative_over_missing_path() {
        let input = json!({});
        assert_eq!(JqEvaluator.evaluate(".a.b // 0", &input).unwrap(), json!(0));
        assert_eq!(
            JqEvaluator.evaluate("(.IncrementOutput.inc // 0) >= 3", &input).unwrap(),
            json!(false)
        );
        assert_eq!(
            JqEvaluator
                .evaluate("{x: .a.b, y: [.a.b], z: (.a.b == null)}", &input)
                .unwrap(),
            json!({"x": null, "y": [null], "z": true})
        );
    }

    #[test]
    fn test_missing_path_under_variable() {
        let result = JqEvaluator
            .evaluate(". as $root | $root.user.name // \"anonymous\"", &json!({}))
            .unwrap();
        assert_eq!(result, json!("anonymous"));
    }

    #[test]
    fn test_indexing_a_scalar_still_fails() {
        let err = JqEvaluator.evaluate(".a.b", &json!({"a": "text"})).unwrap_err();
        assert!(err.cause.contains("runtime"));
    }

    #[test]
    fn test_null_safe_paths_leaves_strings_alone() {
        assert_eq!(
            null_safe_paths(r#"".a.b" + .a.b"#),
            r#"".a.b" + (if . == null then null else .a end | if . == null then null else .b end)"#
        );
        assert_eq!(
            null_safe_paths(r#""\(.a.b)""#),
            r#""\((if . == null then null else .a end | if . == null then null else .b end))""#
        );
        assert_eq!(null_safe_paths(".items[0].id"), "(if . == null then null else .items end)[0].id");
        assert_eq!(null_safe_paths("1.5 + $x"), "1.5 + $x");
    }

    #[test]
    fn test_repeated_expression_uses_cached_filter() {
        for n in 0..3 {
            let result = JqEvaluator.evaluate(".n * 2", &json!({"n": n})).unwrap();
            assert_eq!(result, json!(n * 2));
        }
        COMPILED.with(|cache| assert!(cache.borrow().contains_key(".n * 2")));
    }

    #[test]
    fn test_unwrap_expression() {
        assert_eq!(unwrap_expression("${ .a }"), Some(".a"));
        assert_eq!(unwrap_expression("  ${.a}  "), Some(".a"));
        assert_eq!(unwrap_expression(".a"), None);
        assert_eq!(unwrap_expression("plain text"), None);
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&json!(false)));
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(0)));
        assert!(is_truthy(&json!("")));
        assert!(is_truthy(&json!([])));
    }

    #[test]
    fn test_template_mixes_literals_and_expressions() {
        let input = json!({"user": {"id": 7}, "tags": ["a", "b"]});
        let template = json!({
            "id": "${ .user.id }",
            "label": ".user.id",
            "count": 3,
            "nested": ["${ .tags[0] }", true]
        });

        let result = evaluate_template(&JqEvaluator, &template, &input).unwrap();
        assert_eq!(
            result,
            json!({"id": 7, "label": ".user.id", "count": 3, "nested": ["a", true]})
        );
    }

    #[test]
    fn test_template_whole_value_expression() {
        let input = json!({"item": {"value": "30"}});
        let result = evaluate_template(&JqEvaluator, &json!("${ .item }"), &input).unwrap();
        assert_eq!(result, json!({"value": "30"}));
    }

    #[test]
    fn test_type_name() {
        assert_eq!(type_name(&json!({})), "an object");
        assert_eq!(type_name(&json!(1)), "a number");
        assert_eq!(type_name(&Value::Null), "null");
    }
}
