//! `{placeholder}` substitution for stage commands, artifact paths and check
//! expressions. `{{` and `}}` produce literal braces.

use crate::core::param::ParameterVector;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::path::Path;

/// Values available to a template.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    values: BTreeMap<String, String>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context seeded with every axis of a parameter vector.
    pub fn from_params(params: &ParameterVector) -> Self {
        let mut ctx = Self::new();
        for (axis, value) in params.iter() {
            ctx.set(axis, value.to_string());
        }
        ctx
    }

    /// Context for check expressions. Axes with a numeric view become
    /// parenthesized numbers, so `{x}^2` with `x = -1` reads `(-1)^2`.
    /// Other axes keep their text.
    pub fn numeric_from_params(params: &ParameterVector) -> Self {
        let mut ctx = Self::new();
        for (axis, value) in params.iter() {
            match value.as_f64() {
                Some(n) => ctx.set(axis, format!("({})", n)),
                None => ctx.set(axis, value.to_string()),
            };
        }
        ctx
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.values.insert(name.to_string(), value.into());
        self
    }

    pub fn set_path(&mut self, name: &str, path: &Path) -> &mut Self {
        self.set(name, path.to_string_lossy().to_string())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

enum Piece<'a> {
    Text(&'a str),
    Brace(char),
    Placeholder(&'a str),
}

fn parse(template: &str) -> Result<Vec<Piece<'_>>> {
    let mut pieces = Vec::new();
    let mut rest = template;
    while let Some(pos) = rest.find(['{', '}']) {
        if pos > 0 {
            pieces.push(Piece::Text(&rest[..pos]));
        }
        let tail = &rest[pos..];
        if tail.starts_with("{{") {
            pieces.push(Piece::Brace('{'));
            rest = &tail[2..];
        } else if tail.starts_with("}}") {
            pieces.push(Piece::Brace('}'));
            rest = &tail[2..];
        } else if tail.starts_with('}') {
            return Err(Error::Template(format!("unmatched '}}' in '{}'", template)));
        } else {
            let end = tail
                .find('}')
                .ok_or_else(|| Error::Template(format!("unclosed '{{' in '{}'", template)))?;
            let name = tail[1..end].trim();
            if name.is_empty() {
                return Err(Error::Template(format!("empty placeholder in '{}'", template)));
            }
            pieces.push(Piece::Placeholder(name));
            rest = &tail[end + 1..];
        }
    }
    if !rest.is_empty() {
        pieces.push(Piece::Text(rest));
    }
    Ok(pieces)
}

/// Names of all placeholders in `template`, in order of appearance.
pub fn placeholders(template: &str) -> Result<Vec<String>> {
    Ok(parse(template)?
        .into_iter()
        .filter_map(|p| match p {
            Piece::Placeholder(name) => Some(name.to_string()),
            _ => None,
        })
        .collect())
}

/// Substitute every placeholder from `ctx`. Unknown names are an error.
pub fn render(template: &str, ctx: &TemplateContext) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    for piece in parse(template)? {
        match piece {
            Piece::Text(text) => out.push_str(text),
            Piece::Brace(c) => out.push(c),
            Piece::Placeholder(name) => {
                let value = ctx.get(name).ok_or_else(|| {
                    Error::Template(format!("no value for '{{{}}}' in '{}'", name, template))
                })?;
                out.push_str(value);
            }
        }
    }
    Ok(out)
}
