//! Field-scoped validation errors.
//!
//! Errors carry the path of the offending field so nested validators can
//! report `plan.properties.size` rather than just `size`. Several errors
//! combine with [`FieldError::also`]; errors sharing a message render on one
//! line with their paths joined.

use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldError {
    message: String,
    paths: Vec<String>,
    details: Option<String>,
    others: Vec<FieldError>,
}

impl FieldError {
    pub fn new(message: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            paths: vec![path.into()],
            ..Self::default()
        }
    }

    pub fn missing(fields: &[&str]) -> Self {
        Self {
            message: "missing field(s)".to_string(),
            paths: fields.iter().map(|f| f.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn invalid_value(value: impl fmt::Display, path: impl Into<String>) -> Self {
        Self::new(format!("invalid value: {value}"), path)
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Prefix every path in this error (and those combined into it) with `prefix`.
    pub fn via_field(mut self, prefix: &str) -> Self {
        for path in &mut self.paths {
            *path = if path.is_empty() {
                prefix.to_string()
            } else {
                format!("{prefix}.{path}")
            };
        }
        self.others = self
            .others
            .into_iter()
            .map(|e| e.via_field(prefix))
            .collect();
        self
    }

    /// Combine two errors into one.
    pub fn also(mut self, other: FieldError) -> Self {
        if self.message.is_empty() && self.others.is_empty() {
            return other;
        }
        self.others.push(other);
        self
    }

    /// Combine an optional error into an optional accumulator.
    pub fn merge(acc: Option<FieldError>, next: FieldError) -> Option<FieldError> {
        Some(match acc {
            Some(existing) => existing.also(next),
            None => next,
        })
    }

    fn flatten<'a>(&'a self, out: &mut Vec<&'a FieldError>) {
        if !self.message.is_empty() {
            out.push(self);
        }
        for other in &self.others {
            other.flatten(out);
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut leaves = Vec::new();
        self.flatten(&mut leaves);

        let mut grouped: BTreeMap<&str, (Vec<&str>, Vec<&str>)> = BTreeMap::new();
        for leaf in leaves {
            let entry = grouped.entry(leaf.message.as_str()).or_default();
            entry.0.extend(leaf.paths.iter().map(String::as_str));
            if let Some(details) = &leaf.details {
                entry.1.push(details.as_str());
            }
        }

        let lines: Vec<String> = grouped
            .into_iter()
            .map(|(message, (mut paths, details))| {
                paths.sort_unstable();
                paths.dedup();
                let mut line = format!("{message}: {}", paths.join(", "));
                if !details.is_empty() {
                    line.push('\n');
                    line.push_str(&details.join("\n"));
                }
                line
            })
            .collect();

        f.write_str(&lines.join("\n"))
    }
}

impl std::error::Error for FieldError {}
