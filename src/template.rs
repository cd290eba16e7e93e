//! Template adapter.
//!
//! Flow documents reference context state through double-brace expressions
//! (`{{ outputs.character.name | title }}`). The underlying engine is
//! `liquid`; this adapter adds the pieces flow semantics need on top of it:
//!
//! - `title`, `upper` and `lower` filters alongside the liquid stdlib,
//! - a logical-OR default (`{{ name || 'Unnamed' }}`) evaluated
//!   candidate-by-candidate, where a candidate is rejected when it is
//!   absent, empty, `false` or `0`,
//! - typed resolution: a bare reference path, or a sole `{{ path }}`
//!   expression, resolves to the referenced value preserving its type
//!   instead of flattening to a string.
//!
//! Rendering never mutates the context: callers pass a plain globals tree.

use serde_json::Value;

use crate::error::TemplateError;
use crate::path::{self, RefPath};

pub struct TemplateEngine {
    parser: liquid::Parser,
    strict: bool,
}

enum Part {
    Text(String),
    Expr(String),
}

impl TemplateEngine {
    pub fn new(strict: bool) -> Result<Self, TemplateError> {
        let parser = liquid::ParserBuilder::with_stdlib()
            .filter(filters::Upper)
            .filter(filters::Lower)
            .filter(filters::Title)
            .build()
            .map_err(|e| TemplateError::Syntax {
                message: e.to_string(),
            })?;
        Ok(Self { parser, strict })
    }

    /// Render `template` against `globals` to a string.
    pub fn render(&self, template: &str, globals: &Value) -> Result<String, TemplateError> {
        if !template.contains("{{") && !template.contains("{%") {
            return Ok(template.to_string());
        }

        let parts = scan_parts(template)?;

        // Block tags are handed to liquid whole; only the `||` chains are
        // resolved up front since liquid has no such operator.
        if template.contains("{%") {
            let mut rewritten = String::new();
            for part in &parts {
                match part {
                    Part::Text(text) => rewritten.push_str(text),
                    Part::Expr(body) => {
                        let candidates = split_top_level_or(body);
                        if candidates.len() > 1 {
                            rewritten.push_str(&self.eval_chain_string(&candidates, globals)?);
                        } else {
                            rewritten.push_str("{{");
                            rewritten.push_str(body);
                            rewritten.push_str("}}");
                        }
                    }
                }
            }
            return self.render_liquid(&rewritten, globals);
        }

        let mut out = String::new();
        for part in &parts {
            match part {
                Part::Text(text) => out.push_str(text),
                Part::Expr(body) => {
                    let candidates = split_top_level_or(body);
                    if candidates.len() > 1 {
                        out.push_str(&self.eval_chain_string(&candidates, globals)?);
                    } else {
                        match self.render_span(body, globals) {
                            Ok(s) => out.push_str(&s),
                            Err(TemplateError::Unresolved { reference }) => {
                                if self.strict {
                                    return Err(TemplateError::Unresolved { reference });
                                }
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    /// Resolve `input` to a typed value.
    ///
    /// Bare reference paths and sole `{{ path }}` expressions return the
    /// referenced value as-is; everything else renders to a string.
    pub fn resolve(&self, input: &str, globals: &Value) -> Result<Value, TemplateError> {
        let trimmed = input.trim();

        if RefPath::looks_like_path(trimmed) {
            return self.lookup_required(trimmed, globals);
        }

        if let Some(body) = sole_expression(trimmed) {
            let candidates = split_top_level_or(&body);
            if candidates.len() > 1 {
                return self.eval_chain_typed(&candidates, globals);
            }
            let body = body.trim();
            if RefPath::looks_like_path(body) {
                return self.lookup_required(body, globals);
            }
        }

        self.render(input, globals).map(Value::String)
    }

    fn lookup_required(&self, raw: &str, globals: &Value) -> Result<Value, TemplateError> {
        let path = RefPath::parse(raw).map_err(|_| TemplateError::Unresolved {
            reference: raw.to_string(),
        })?;
        match lookup(globals, &path) {
            Some(value) => Ok(value),
            None if self.strict => Err(TemplateError::Unresolved {
                reference: raw.to_string(),
            }),
            None => Ok(Value::Null),
        }
    }

    fn eval_chain_string(
        &self,
        candidates: &[String],
        globals: &Value,
    ) -> Result<String, TemplateError> {
        self.eval_chain_typed(candidates, globals)
            .map(|v| value_to_string(&v))
    }

    fn eval_chain_typed(
        &self,
        candidates: &[String],
        globals: &Value,
    ) -> Result<Value, TemplateError> {
        let (last, rest) = candidates
            .split_last()
            .expect("or-chain has at least one candidate");
        for candidate in rest {
            if let Some(value) = self.eval_candidate(candidate, globals)? {
                if value_truthy(&value) {
                    return Ok(value);
                }
            }
        }
        match self.eval_candidate(last, globals)? {
            Some(value) => Ok(value),
            None if self.strict => Err(TemplateError::Unresolved {
                reference: candidates.join(" || "),
            }),
            None => Ok(Value::Null),
        }
    }

    /// Evaluate one `||` alternative. `None` means the reference is absent.
    fn eval_candidate(
        &self,
        candidate: &str,
        globals: &Value,
    ) -> Result<Option<Value>, TemplateError> {
        let candidate = candidate.trim();
        if candidate.is_empty() {
            return Ok(Some(Value::String(String::new())));
        }

        if let Some(literal) = quoted_literal(candidate) {
            return Ok(Some(Value::String(literal)));
        }
        match candidate {
            "true" => return Ok(Some(Value::Bool(true))),
            "false" => return Ok(Some(Value::Bool(false))),
            _ => {}
        }
        if let Ok(n) = candidate.parse::<i64>() {
            return Ok(Some(Value::from(n)));
        }
        if let Ok(f) = candidate.parse::<f64>() {
            return Ok(Some(Value::from(f)));
        }

        if RefPath::looks_like_path(candidate) {
            if let Ok(path) = RefPath::parse(candidate) {
                return Ok(lookup(globals, &path));
            }
        }

        match self.render_span(candidate, globals) {
            Ok(s) => Ok(Some(Value::String(s))),
            Err(TemplateError::Unresolved { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn render_span(&self, body: &str, globals: &Value) -> Result<String, TemplateError> {
        self.render_liquid(&format!("{{{{{}}}}}", body), globals)
    }

    fn render_liquid(&self, template: &str, globals: &Value) -> Result<String, TemplateError> {
        let parsed = self
            .parser
            .parse(template)
            .map_err(|e| TemplateError::Syntax {
                message: e.to_string(),
            })?;
        let object = to_liquid_object(globals)?;
        parsed.render(&object).map_err(|e| {
            let message = e.to_string();
            if is_unknown_reference(&message) {
                TemplateError::Unresolved {
                    reference: template.to_string(),
                }
            } else {
                TemplateError::Syntax { message }
            }
        })
    }
}

/// Boolean reading of a rendered string: non-empty, non-"false", non-"0"
/// strings are true.
pub fn truthy(text: &str) -> bool {
    let t = text.trim();
    !(t.is_empty() || t.eq_ignore_ascii_case("false") || t == "0")
}

pub fn value_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => truthy(s),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

pub(crate) fn lookup(globals: &Value, path: &RefPath) -> Option<Value> {
    let root = globals.get(path.root.as_str())?;
    path::read_value(root, &path.segments, path.as_str())
        .ok()
        .cloned()
}

fn to_liquid_object(globals: &Value) -> Result<liquid::Object, TemplateError> {
    let value = liquid::model::to_value(globals).map_err(|e| TemplateError::Syntax {
        message: e.to_string(),
    })?;
    match value {
        liquid::model::Value::Object(object) => Ok(object),
        _ => Err(TemplateError::Syntax {
            message: "template globals must be a mapping".to_string(),
        }),
    }
}

fn is_unknown_reference(message: &str) -> bool {
    message.contains("Unknown variable")
        || message.contains("Unknown index")
        || message.contains("requested variable")
}

fn scan_parts(template: &str) -> Result<Vec<Part>, TemplateError> {
    let mut parts = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        if open > 0 {
            parts.push(Part::Text(rest[..open].to_string()));
        }
        let after = &rest[open + 2..];
        let close = after.find("}}").ok_or_else(|| TemplateError::Syntax {
            message: format!("unterminated expression in template: {}", template),
        })?;
        parts.push(Part::Expr(after[..close].to_string()));
        rest = &after[close + 2..];
    }
    if !rest.is_empty() {
        parts.push(Part::Text(rest.to_string()));
    }
    Ok(parts)
}

fn sole_expression(text: &str) -> Option<String> {
    let body = text.strip_prefix("{{")?.strip_suffix("}}")?;
    if body.contains("{{") || body.contains("}}") {
        return None;
    }
    Some(body.to_string())
}

fn quoted_literal(text: &str) -> Option<String> {
    for quote in ['\'', '"'] {
        if text.len() >= 2 && text.starts_with(quote) && text.ends_with(quote) {
            let inner = &text[1..text.len() - 1];
            if !inner.contains(quote) {
                return Some(inner.to_string());
            }
        }
    }
    None
}

/// Split an expression body on `||` outside of quotes. A single `|` is a
/// filter pipe and never splits.
fn split_top_level_or(body: &str) -> Vec<String> {
    let mut candidates = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    current.push(c);
                }
                '|' if chars.peek() == Some(&'|') => {
                    chars.next();
                    candidates.push(current.trim().to_string());
                    current = String::new();
                }
                _ => current.push(c),
            },
        }
    }
    candidates.push(current.trim().to_string());
    candidates
}

mod filters {
    use liquid_core::{
        Display_filter, Filter, FilterReflection, ParseFilter, Result, Runtime, Value, ValueView,
    };

    #[derive(Clone, ParseFilter, FilterReflection)]
    #[filter(
        name = "upper",
        description = "Uppercases every character of the input.",
        parsed(UpperFilter)
    )]
    pub struct Upper;

    #[derive(Debug, Default, Display_filter)]
    #[name = "upper"]
    struct UpperFilter;

    impl Filter for UpperFilter {
        fn evaluate(&self, input: &dyn ValueView, _runtime: &dyn Runtime) -> Result<Value> {
            Ok(Value::scalar(input.to_kstr().to_uppercase()))
        }
    }

    #[derive(Clone, ParseFilter, FilterReflection)]
    #[filter(
        name = "lower",
        description = "Lowercases every character of the input.",
        parsed(LowerFilter)
    )]
    pub struct Lower;

    #[derive(Debug, Default, Display_filter)]
    #[name = "lower"]
    struct LowerFilter;

    impl Filter for LowerFilter {
        fn evaluate(&self, input: &dyn ValueView, _runtime: &dyn Runtime) -> Result<Value> {
            Ok(Value::scalar(input.to_kstr().to_lowercase()))
        }
    }

    #[derive(Clone, ParseFilter, FilterReflection)]
    #[filter(
        name = "title",
        description = "Capitalizes the first letter of each word.",
        parsed(TitleFilter)
    )]
    pub struct Title;

    #[derive(Debug, Default, Display_filter)]
    #[name = "title"]
    struct TitleFilter;

    impl Filter for TitleFilter {
        fn evaluate(&self, input: &dyn ValueView, _runtime: &dyn Runtime) -> Result<Value> {
            let text = input.to_kstr();
            let titled = text
                .split_whitespace()
                .map(|word| {
                    let mut chars = word.chars();
                    match chars.next() {
                        Some(first) => {
                            first.to_uppercase().collect::<String>()
                                + &chars.as_str().to_lowercase()
                        }
                        None => String::new(),
                    }
                })
                .collect::<Vec<_>>()
                .join(" ");
            Ok(Value::scalar(titled))
        }
    }
}
