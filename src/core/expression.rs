use std::sync::LazyLock;

use regex::Regex;

use crate::core::NodeValue;
use crate::core::error::RenderError;
use crate::core::template::{TemplateScope, find_closing_brace, split_hier_path};

/// `name[0][1]` style path part.
static INDEX_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([^\[\]]*)((?:\[\d+\])*)$").expect("static regex is valid")
});

static INDEX_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d+)\]").expect("static regex is valid"));

/// Binary operators grouped from loosest to tightest binding.
const OPERATOR_GROUPS: &[&[&str]] = &[&["||"], &["&&"], &["==", "!=", ">=", "<=", ">", "<"]];

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Evaluates a restricted expression against a [`TemplateScope`].
///
/// A bare path that resolves to nothing is an error at the top level, but evaluates to
/// `null` as an operand so that `a || b` can fall back.
pub fn evaluate(expression: &str, scope: &TemplateScope<'_>) -> Result<NodeValue, RenderError> {
    eval(expression, scope, true)
}

fn eval(expr: &str, scope: &TemplateScope<'_>, strict: bool) -> Result<NodeValue, RenderError> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(RenderError::InvalidExpression("empty expression".into()));
    }

    for group in OPERATOR_GROUPS {
        if let Some((pos, op)) = find_operator(expr, group) {
            let left = &expr[..pos];
            let right = &expr[pos + op.len()..];
            if left.trim().is_empty() || right.trim().is_empty() {
                return Err(RenderError::InvalidExpression(expr.to_string()));
            }
            return apply(op, left, right, scope);
        }
    }

    eval_atom(expr, scope, strict)
}

fn apply(
    op: &str,
    left: &str,
    right: &str,
    scope: &TemplateScope<'_>,
) -> Result<NodeValue, RenderError> {
    let lhs = eval(left, scope, false)?;
    match op {
        "||" => {
            if lhs.is_null() {
                eval(right, scope, false)
            } else {
                Ok(lhs)
            }
        }
        "&&" => {
            if !is_truthy(&lhs) {
                return Ok(NodeValue::Bool(false));
            }
            Ok(NodeValue::Bool(is_truthy(&eval(right, scope, false)?)))
        }
        _ => {
            let rhs = eval(right, scope, false)?;
            compare(op, &lhs, &rhs).map(NodeValue::Bool)
        }
    }
}

fn compare(op: &str, lhs: &NodeValue, rhs: &NodeValue) -> Result<bool, RenderError> {
    match op {
        "==" => Ok(values_equal(lhs, rhs)),
        "!=" => Ok(!values_equal(lhs, rhs)),
        _ => {
            let ordering = match (lhs, rhs) {
                (NodeValue::Number(a), NodeValue::Number(b)) => {
                    let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
                    a.partial_cmp(&b)
                }
                (NodeValue::String(a), NodeValue::String(b)) => Some(a.cmp(b)),
                _ => None,
            };
            let ordering = ordering.ok_or_else(|| {
                RenderError::InvalidExpression(format!("cannot compare {lhs} {op} {rhs}"))
            })?;
            match op {
                ">" => Ok(ordering.is_gt()),
                "<" => Ok(ordering.is_lt()),
                ">=" => Ok(ordering.is_ge()),
                "<=" => Ok(ordering.is_le()),
                _ => Err(RenderError::InvalidExpression(format!("unknown operator {op}"))),
            }
        }
    }
}

fn values_equal(lhs: &NodeValue, rhs: &NodeValue) -> bool {
    match (lhs, rhs) {
        (NodeValue::Number(a), NodeValue::Number(b)) => a.as_f64() == b.as_f64(),
        _ => lhs == rhs,
    }
}

/// Python-style truthiness over JSON values.
pub fn is_truthy(value: &NodeValue) -> bool {
    match value {
        NodeValue::Null => false,
        NodeValue::Bool(b) => *b,
        NodeValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        NodeValue::String(s) => !s.is_empty(),
        NodeValue::Array(a) => !a.is_empty(),
        NodeValue::Object(o) => !o.is_empty(),
    }
}

/// Finds the rightmost top-level occurrence of any operator in `group`, skipping text
/// inside quotes, brackets and braces. Rightmost keeps chains left-associative.
fn find_operator(expr: &str, group: &[&'static str]) -> Option<(usize, &'static str)> {
    let bytes = expr.as_bytes();
    let mut depth = 0i32;
    let mut quote: Option<u8> = None;
    let mut found = None;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match c {
            b'\'' | b'"' => quote = Some(c),
            b'{' | b'[' | b'(' => depth += 1,
            b'}' | b']' | b')' => depth -= 1,
            _ if depth == 0 => {
                if let Some(op) = group.iter().find(|op| bytes[i..].starts_with(op.as_bytes())) {
                    found = Some((i, *op));
                    i += op.len();
                    continue;
                }
            }
            _ => {}
        }
        i += 1;
    }
    found
}

fn eval_atom(atom: &str, scope: &TemplateScope<'_>, strict: bool) -> Result<NodeValue, RenderError> {
    if let Some(literal) = parse_literal(atom) {
        return Ok(literal);
    }

    let resolved = if let Some(rest) = atom.strip_prefix("$hier{") {
        let close = find_closing_brace(rest)
            .ok_or_else(|| RenderError::InvalidExpression(atom.to_string()))?;
        let reference = rest[..close].trim();
        let (path, tail) = split_hier_path(&rest[close + 1..]);
        if !tail.trim().is_empty() {
            return Err(RenderError::InvalidExpression(atom.to_string()));
        }
        let root = scope.hierarchy_value(reference);
        if root.is_none() && strict {
            return Err(RenderError::UnresolvedHierarchy(reference.to_string()));
        }
        root.and_then(|root| lookup_path(&root, path.trim_start_matches('.')))
    } else if let Some(rest) = atom.strip_prefix("$var{") {
        let name = rest
            .strip_suffix('}')
            .ok_or_else(|| RenderError::InvalidExpression(atom.to_string()))?;
        let value = scope.variable(name.trim());
        if value.is_none() && strict {
            return Err(RenderError::UnresolvedVariable(name.trim().to_string()));
        }
        value
    } else {
        if !is_path(atom) {
            return Err(RenderError::InvalidExpression(atom.to_string()));
        }
        resolve_path(atom, scope)
    };

    match resolved {
        Some(value) => Ok(value),
        None if strict => Err(RenderError::UnresolvedExpression(atom.to_string())),
        None => Ok(NodeValue::Null),
    }
}

fn parse_literal(atom: &str) -> Option<NodeValue> {
    match atom {
        "true" => return Some(NodeValue::Bool(true)),
        "false" => return Some(NodeValue::Bool(false)),
        "null" => return Some(NodeValue::Null),
        _ => {}
    }
    let quoted = (atom.starts_with('"') && atom.ends_with('"'))
        || (atom.starts_with('\'') && atom.ends_with('\''));
    if quoted && atom.len() >= 2 {
        return Some(NodeValue::String(atom[1..atom.len() - 1].to_string()));
    }
    if let Ok(i) = atom.parse::<i64>() {
        return Some(NodeValue::from(i));
    }
    if let Ok(f) = atom.parse::<f64>() {
        return serde_json::Number::from_f64(f).map(NodeValue::Number);
    }
    None
}

fn is_path(atom: &str) -> bool {
    atom.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '[' | ']'))
}

/// Resolves a dotted path whose first part is a variable or a node result id.
fn resolve_path(path: &str, scope: &TemplateScope<'_>) -> Option<NodeValue> {
    let mut segments = parse_path(path)?;
    let Segment::Key(first) = segments.remove(0) else {
        return None;
    };
    let root = scope
        .variable(&first)
        .or_else(|| scope.hierarchy_value(&first))?;
    walk(root, &segments)
}

/// Walks a dotted path (with `[n]` indexing) into `value`. An empty path returns the
/// value itself.
pub fn lookup_path(value: &NodeValue, path: &str) -> Option<NodeValue> {
    if path.is_empty() {
        return Some(value.clone());
    }
    let segments = parse_path(path)?;
    walk(value.clone(), &segments)
}

fn walk(mut current: NodeValue, segments: &[Segment]) -> Option<NodeValue> {
    for segment in segments {
        current = match (segment, current) {
            (Segment::Key(key), NodeValue::Object(mut map)) => map.remove(key)?,
            (Segment::Key(key), NodeValue::Array(mut items)) => {
                let idx: usize = key.parse().ok()?;
                if idx < items.len() {
                    items.swap_remove(idx)
                } else {
                    return None;
                }
            }
            (Segment::Index(idx), NodeValue::Array(mut items)) if *idx < items.len() => {
                items.swap_remove(*idx)
            }
            _ => return None,
        };
    }
    Some(current)
}

fn parse_path(path: &str) -> Option<Vec<Segment>> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        let captures = INDEX_PATTERN.captures(part.trim())?;
        let name = captures.get(1).map_or("", |m| m.as_str());
        if !name.is_empty() {
            segments.push(Segment::Key(name.to_string()));
        }
        if let Some(indices) = captures.get(2) {
            for idx in INDEX_ITEM.captures_iter(indices.as_str()) {
                segments.push(Segment::Index(idx[1].parse().ok()?));
            }
        }
    }
    if segments.is_empty() { None } else { Some(segments) }
}
