//! Placeholder rendering for node settings.
//!
//! Three placeholder forms are recognised:
//!
//! - `$var{name}`: a lookup in the supplied variables (run variables such as `run_dir`
//!   and `node_hier` are merged in by the execution context).
//! - `$expr{expression}`: a restricted expression, see [`crate::core::expression`].
//! - `$hier{reference}.path`: a recorded result addressed by `previous`, a node id or a
//!   slash-separated hierarchy path, followed by an optional dotted field path.
//!
//! Doubling the dollar (`$$var{x}`) renders the placeholder literally. A template that
//! consists of exactly one placeholder renders to the raw typed value.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::NodeValue;
use crate::core::error::RenderError;
use crate::core::expression::{self, lookup_path};

/// Variable bindings visible to `$var{}` and bare names in `$expr{}`.
pub type Bindings = HashMap<String, NodeValue>;

const PLACEHOLDER_KINDS: [&str; 3] = ["$var{", "$expr{", "$hier{"];

static HIER_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^((?:\.[A-Za-z0-9_-]+|\[\d+\])*)").expect("static regex is valid")
});

/// Read access to recorded results, implemented by the execution context.
pub trait ResultLookup: Sync {
    /// Returns the serialized result addressed by `reference`, if one was recorded.
    fn hierarchy_value(&self, reference: &str) -> Option<NodeValue>;
}

/// Everything a template may read while rendering.
#[derive(Clone, Copy)]
pub struct TemplateScope<'a> {
    variables: &'a Bindings,
    results: Option<&'a dyn ResultLookup>,
}

impl<'a> TemplateScope<'a> {
    pub fn new(variables: &'a Bindings) -> Self {
        Self {
            variables,
            results: None,
        }
    }

    pub fn with_results(mut self, results: &'a dyn ResultLookup) -> Self {
        self.results = Some(results);
        self
    }

    /// Looks up a variable; dotted and indexed paths descend into its value.
    pub fn variable(&self, name: &str) -> Option<NodeValue> {
        if let Some(value) = self.variables.get(name) {
            return Some(value.clone());
        }
        let split = name.find(['.', '['])?;
        let (head, tail) = name.split_at(split);
        let root = self.variables.get(head)?;
        lookup_path(root, tail.trim_start_matches('.'))
    }

    pub fn hierarchy_value(&self, reference: &str) -> Option<NodeValue> {
        self.results?.hierarchy_value(reference)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Piece<'t> {
    Text(String),
    Var(&'t str),
    Expr(&'t str),
    Hier { reference: &'t str, path: &'t str },
}

/// Stateless renderer for the three placeholder forms.
pub struct TemplateEngine;

impl TemplateEngine {
    /// Renders `template`. A lone placeholder yields its typed value, anything else a
    /// string.
    pub fn render(template: &str, scope: &TemplateScope<'_>) -> Result<NodeValue, RenderError> {
        let pieces = parse(template);
        if let [piece] = pieces.as_slice() {
            if !matches!(piece, Piece::Text(_)) {
                return resolve(piece, scope);
            }
        }

        let mut out = String::with_capacity(template.len());
        for piece in &pieces {
            match piece {
                Piece::Text(text) => out.push_str(text),
                other => out.push_str(&stringify(&resolve(other, scope)?)),
            }
        }
        Ok(NodeValue::String(out))
    }

    /// Renders `template` and flattens the result to a string.
    pub fn render_string(template: &str, scope: &TemplateScope<'_>) -> Result<String, RenderError> {
        Self::render(template, scope).map(|value| stringify(&value))
    }

    /// Evaluates a bare expression (no `$expr{}` wrapper).
    pub fn evaluate(expression: &str, scope: &TemplateScope<'_>) -> Result<NodeValue, RenderError> {
        let trimmed = expression.trim();
        if trimmed.contains("$expr{") {
            return Self::render(trimmed, scope);
        }
        expression::evaluate(trimmed, scope)
    }

    /// Renders every string inside a JSON value, leaving other leaves untouched.
    pub fn render_value(value: &NodeValue, scope: &TemplateScope<'_>) -> Result<NodeValue, RenderError> {
        match value {
            NodeValue::String(template) => Self::render(template, scope),
            NodeValue::Array(items) => items
                .iter()
                .map(|item| Self::render_value(item, scope))
                .collect::<Result<Vec<_>, _>>()
                .map(NodeValue::Array),
            NodeValue::Object(map) => {
                let mut rendered = serde_json::Map::with_capacity(map.len());
                for (key, item) in map {
                    rendered.insert(key.clone(), Self::render_value(item, scope)?);
                }
                Ok(NodeValue::Object(rendered))
            }
            other => Ok(other.clone()),
        }
    }
}

/// Text form of a rendered value: strings verbatim, `null` empty, the rest compact JSON.
pub fn stringify(value: &NodeValue) -> String {
    match value {
        NodeValue::String(s) => s.clone(),
        NodeValue::Null => String::new(),
        other => other.to_string(),
    }
}

fn resolve(piece: &Piece<'_>, scope: &TemplateScope<'_>) -> Result<NodeValue, RenderError> {
    match piece {
        Piece::Text(text) => Ok(NodeValue::String(text.clone())),
        Piece::Var(name) => scope
            .variable(name.trim())
            .ok_or_else(|| RenderError::UnresolvedVariable(name.trim().to_string())),
        Piece::Expr(expr) => expression::evaluate(expr, scope),
        Piece::Hier { reference, path } => {
            let reference = reference.trim();
            let root = scope
                .hierarchy_value(reference)
                .ok_or_else(|| RenderError::UnresolvedHierarchy(reference.to_string()))?;
            lookup_path(&root, path.trim_start_matches('.'))
                .ok_or_else(|| RenderError::UnresolvedHierarchy(format!("{reference}{path}")))
        }
    }
}

fn parse(template: &str) -> Vec<Piece<'_>> {
    let mut pieces = Vec::new();
    let mut text = String::new();
    let mut rest = template;

    while let Some(pos) = rest.find('$') {
        text.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        match match_placeholder(tail) {
            Some((consumed, piece)) => {
                match piece {
                    Piece::Text(literal) => text.push_str(&literal),
                    piece => {
                        if !text.is_empty() {
                            pieces.push(Piece::Text(std::mem::take(&mut text)));
                        }
                        pieces.push(piece);
                    }
                }
                rest = &tail[consumed..];
            }
            None => {
                text.push('$');
                rest = &tail[1..];
            }
        }
    }
    text.push_str(rest);
    if !text.is_empty() || pieces.is_empty() {
        pieces.push(Piece::Text(text));
    }
    pieces
}

/// Matches a placeholder (or an escaped one) at the start of `tail`, returning the
/// number of bytes consumed.
fn match_placeholder(tail: &str) -> Option<(usize, Piece<'_>)> {
    if let Some(escaped) = tail.strip_prefix('$') {
        for kind in PLACEHOLDER_KINDS {
            if let Some(after) = escaped.strip_prefix(kind) {
                let close = find_closing_brace(after)?;
                let end = 1 + kind.len() + close + 1;
                return Some((end, Piece::Text(tail[1..end].to_string())));
            }
        }
    }

    for kind in PLACEHOLDER_KINDS {
        let Some(after) = tail.strip_prefix(kind) else {
            continue;
        };
        let close = find_closing_brace(after)?;
        let inner = &after[..close];
        let mut consumed = kind.len() + close + 1;
        let piece = match kind {
            "$var{" => Piece::Var(inner),
            "$expr{" => Piece::Expr(inner),
            _ => {
                let (path, _) = split_hier_path(&after[close + 1..]);
                consumed += path.len();
                Piece::Hier {
                    reference: inner,
                    path,
                }
            }
        };
        return Some((consumed, piece));
    }
    None
}

/// Index of the brace closing an already-opened `{`, honouring nesting.
pub(crate) fn find_closing_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '{' => depth += 1,
            '}' if depth == 0 => return Some(i),
            '}' => depth -= 1,
            _ => {}
        }
    }
    None
}

/// Splits the field path that may follow a `$hier{}` placeholder from the remainder.
pub(crate) fn split_hier_path(s: &str) -> (&str, &str) {
    let len = HIER_PATH.find(s).map_or(0, |m| m.end());
    s.split_at(len)
}
