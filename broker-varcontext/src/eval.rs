//! `${...}` template evaluation.
//!
//! Every `${expr}` interpolation is rendered with Tera's expression grammar,
//! so `${a}`, `${1 + 1}`, `${name | upper}` and `${request.instance_id}` all
//! work. Text outside interpolations is copied verbatim and `$${` produces a
//! literal `${`.
//!
//! A template that is exactly one `${expr}` keeps the type of its result, so
//! `${tags}` yields the object itself rather than its display text. `assert`
//! takes `condition` and `message`, either by keyword or by position.

use serde_json::{Map, Value};
use std::collections::HashMap;
use tera::{Context as TeraContext, Tera};

const ONE_OFF: &str = "__tera_one_off";
const RESULT: &str = "__result";
const ASSERT_PARAMS: [&str; 2] = ["condition", "message"];

/// Render `template` against `scope`.
///
/// The error is a human readable description of the first failure.
pub fn evaluate(template: &str, scope: &Map<String, Value>) -> Result<String, String> {
    if !template.contains("${") {
        return Ok(template.to_string());
    }
    render(&to_tera_source(template)?, scope)
}

/// Like [`evaluate`], but a template made of a single interpolation returns
/// the value the expression produced instead of its rendering.
pub fn evaluate_value(template: &str, scope: &Map<String, Value>) -> Result<Value, String> {
    let Some(expr) = sole_interpolation(template) else {
        return evaluate(template, scope).map(Value::String);
    };

    let source = format!(
        "{{% set {RESULT} = {} %}}{{{{ {RESULT} | json_encode() }}}}",
        translate_expr(&expr)
    );
    let encoded = render(&source, scope)?;
    serde_json::from_str(&encoded).map_err(|e| format!("{template:?} did not produce JSON: {e}"))
}

fn render(source: &str, scope: &Map<String, Value>) -> Result<String, String> {
    let mut context = TeraContext::new();
    for (key, value) in scope {
        context.insert(key.as_str(), value);
    }

    let mut tera = Tera::default();
    tera.register_function("assert", assert_fn);
    tera.render_str(source, &context).map_err(|e| describe(&e))
}

/// The body of `template` when it is one `${...}` and nothing else.
fn sole_interpolation(template: &str) -> Option<String> {
    let chars: Vec<char> = template.chars().collect();
    if chars.len() < 3 || chars[0] != '$' || chars[1] != '{' {
        return None;
    }
    let end = matching_brace(&chars, 2)?;
    let expr: String = chars[2..end].iter().collect();
    (end == chars.len() - 1 && !expr.trim().is_empty()).then_some(expr)
}

fn assert_fn(args: &HashMap<String, Value>) -> tera::Result<Value> {
    let condition = match args.get("condition") {
        Some(Value::Bool(b)) => *b,
        Some(other) => {
            return Err(tera::Error::msg(format!(
                "assert: condition must be a boolean, got {other}"
            )))
        }
        None => return Err(tera::Error::msg("assert: missing `condition` argument")),
    };

    if condition {
        return Ok(Value::Bool(true));
    }

    let message = args
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("assertion failed");
    Err(tera::Error::msg(format!("assert: assertion failed: {message}")))
}

/// Flatten an error and its sources into one line, skipping the wrapper
/// Tera adds around one-off renders.
fn describe(err: &tera::Error) -> String {
    let mut parts = Vec::new();
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        let text = e.to_string();
        if !text.contains(ONE_OFF) || e.source().is_none() {
            parts.push(text.replace(&format!(" while rendering '{ONE_OFF}'"), ""));
        }
        current = e.source();
    }
    parts.join(": ")
}

/// Translate `${...}` interpolations into a Tera template.
fn to_tera_source(template: &str) -> Result<String, String> {
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::with_capacity(template.len() + 16);
    let mut literal = String::new();
    let mut i = 0;

    while i < chars.len() {
        if chars[i] == '$' && chars.get(i + 1) == Some(&'$') && chars.get(i + 2) == Some(&'{') {
            literal.push_str("${");
            i += 3;
            continue;
        }

        if chars[i] == '$' && chars.get(i + 1) == Some(&'{') {
            let end = matching_brace(&chars, i + 2)
                .ok_or_else(|| format!("unterminated interpolation in {template:?}"))?;
            flush_literal(&mut out, &mut literal);
            let expr: String = chars[i + 2..end].iter().collect();
            if expr.trim().is_empty() {
                return Err(format!("empty interpolation in {template:?}"));
            }
            out.push_str("{{ ");
            out.push_str(&translate_expr(&expr));
            out.push_str(" }}");
            i = end + 1;
            continue;
        }

        literal.push(chars[i]);
        i += 1;
    }

    flush_literal(&mut out, &mut literal);
    Ok(out)
}

fn flush_literal(out: &mut String, literal: &mut String) {
    if literal.is_empty() {
        return;
    }
    if literal.contains('{') || literal.contains('}') {
        out.push_str("{% raw %}");
        out.push_str(literal);
        out.push_str("{% endraw %}");
    } else {
        out.push_str(literal);
    }
    literal.clear();
}

/// Index of the `}` closing an interpolation whose body starts at `start`.
fn matching_brace(chars: &[char], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut i = start;

    while i < chars.len() {
        let c = chars[i];
        match quote {
            Some(q) => {
                if c == '\\' {
                    i += 1;
                } else if c == q {
                    quote = None;
                }
            }
            None => match c {
                '"' | '\'' | '`' => quote = Some(c),
                '{' => depth += 1,
                '}' if depth == 0 => return Some(i),
                '}' => depth -= 1,
                _ => {}
            },
        }
        i += 1;
    }
    None
}

fn translate_expr(expr: &str) -> String {
    keyword_asserts(expr.trim())
}

/// Rewrite positional `assert(cond, "msg")` calls into the keyword form Tera
/// requires. Calls already using keywords are left alone.
fn keyword_asserts(expr: &str) -> String {
    let chars: Vec<char> = expr.chars().collect();
    let mut out = String::with_capacity(expr.len() + 24);
    let mut quote: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if let Some(q) = quote {
            out.push(c);
            if c == '\\' {
                if let Some(&next) = chars.get(i + 1) {
                    out.push(next);
                    i += 1;
                }
            } else if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }

        if matches!(c, '"' | '\'' | '`') {
            quote = Some(c);
        } else if is_assert_call(&chars, i) {
            let open = i + "assert".len();
            if let Some(close) = closing_paren(&chars, open + 1) {
                let body: String = chars[open + 1..close].iter().collect();
                out.push_str("assert(");
                out.push_str(&keyword_args(&body));
                out.push(')');
                i = close + 1;
                continue;
            }
        }
        out.push(c);
        i += 1;
    }
    out
}

fn is_assert_call(chars: &[char], at: usize) -> bool {
    let name: Vec<char> = "assert(".chars().collect();
    let boundary = at == 0 || !matches!(chars[at - 1], c if c.is_alphanumeric() || c == '_' || c == '.');
    boundary && chars[at..].starts_with(&name)
}

fn keyword_args(body: &str) -> String {
    let args = split_top_level(body);
    let args: Vec<String> = args.iter().map(|a| keyword_asserts(a.trim())).collect();
    if args.len() > ASSERT_PARAMS.len() || args.iter().any(|a| is_keyword_arg(a)) {
        return args.join(", ");
    }
    ASSERT_PARAMS
        .iter()
        .zip(&args)
        .map(|(param, arg)| format!("{param}={arg}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn is_keyword_arg(arg: &str) -> bool {
    let rest = arg.trim_start_matches(|c: char| c.is_alphanumeric() || c == '_');
    rest.len() < arg.len() && {
        let rest = rest.trim_start();
        rest.starts_with('=') && !rest.starts_with("==")
    }
}

/// Index of the `)` matching an opening paren just before `start`.
fn closing_paren(chars: &[char], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut i = start;

    while i < chars.len() {
        let c = chars[i];
        match quote {
            Some(q) => {
                if c == '\\' {
                    i += 1;
                } else if c == q {
                    quote = None;
                }
            }
            None => match c {
                '"' | '\'' | '`' => quote = Some(c),
                '(' | '[' | '{' => depth += 1,
                ')' if depth == 0 => return Some(i),
                ')' | ']' | '}' => depth = depth.saturating_sub(1),
                _ => {}
            },
        }
        i += 1;
    }
    None
}

/// Split call arguments on commas that are not nested or quoted.
fn split_top_level(body: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for c in body.chars() {
        if let Some(q) = quote {
            current.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' | '`' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                args.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    if !current.trim().is_empty() {
        args.push(current);
    }
    args
}
