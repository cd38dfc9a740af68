//! Backend-ready entries: label sets and line rendering.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{Fields, Value};

/// A validated set of labels attached to an entry.
///
/// Label names follow the usual `[a-zA-Z_][a-zA-Z0-9_]*` rule; inserts with
/// an invalid name or an empty value are silently dropped, per the backend's
/// ingestion behavior.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Labels(BTreeMap<String, String>);

impl Labels {
    /// Creates an empty label set.
    pub fn new() -> Self {
        Labels(BTreeMap::new())
    }

    /// Inserts a label, dropping it when the name or value is invalid.
    ///
    /// Returns whether the label was kept.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> bool {
        let name = name.into();
        let value = value.into();
        if !valid_label_name(&name) || value.is_empty() {
            return false;
        }
        self.0.insert(name, value);
        true
    }

    /// Removes a label by name.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(name)
    }

    /// Looks up a label value.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Number of labels in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates labels in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut labels = Labels::new();
        for (name, value) in iter {
            labels.insert(name, value);
        }
        labels
    }
}

fn valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Replaces the separators Kubernetes allows in label names with `_` so the
/// result passes backend validation.
pub fn sanitize_label_name(name: &str) -> String {
    name.replace(['/', '.', '-'], "_")
}

/// The internal form handed to a send chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Stream labels.
    pub labels: Labels,
    /// Moment of observation.
    pub timestamp: DateTime<Utc>,
    /// The rendered log line.
    pub line: String,
}

impl Entry {
    /// Approximate in-flight size used for batch accounting.
    pub fn size(&self) -> usize {
        self.line.len()
            + self
                .labels
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}

/// Line rendering format.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LineFormat {
    /// JSON object serialization of the field tree.
    #[default]
    Json,
    /// `key=value` pairs, keys sorted ascending by Unicode codepoint.
    KvPair,
}

/// Renders the field tree as one log line in the requested format.
pub fn render_line(fields: &Fields, format: LineFormat) -> String {
    match format {
        LineFormat::Json => render_json(fields),
        LineFormat::KvPair => render_logfmt(fields),
    }
}

fn render_json(fields: &Fields) -> String {
    // A string-keyed map of serializable values cannot fail to serialize.
    serde_json::to_string(fields).unwrap_or_default()
}

fn render_logfmt(fields: &Fields) -> String {
    let mut line = String::with_capacity(64);
    for (key, value) in fields {
        if !line.is_empty() {
            line.push(' ');
        }
        line.push_str(key);
        line.push('=');
        let rendered = value.to_string();
        if needs_quoting(&rendered) {
            line.push('"');
            for c in rendered.chars() {
                match c {
                    '"' | '\\' => {
                        line.push('\\');
                        line.push(c);
                    }
                    '\n' => line.push_str("\\n"),
                    _ => line.push(c),
                }
            }
            line.push('"');
        } else if rendered.is_empty() {
            line.push_str("\"\"");
        } else {
            let _ = write!(line, "{rendered}");
        }
    }
    line
}

fn needs_quoting(value: &str) -> bool {
    value
        .chars()
        .any(|c| c == ' ' || c == '=' || c == '"' || c == '\n')
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::event::Value;

    fn fields(entries: Vec<(&str, Value)>) -> Fields {
        entries
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v))
            .collect::<BTreeMap<_, _>>()
    }

    #[test]
    fn labels_reject_invalid_names() {
        let mut labels = Labels::new();
        assert!(labels.insert("valid_name", "v"));
        assert!(!labels.insert("0starts_with_digit", "v"));
        assert!(!labels.insert("has-dash", "v"));
        assert!(!labels.insert("", "v"));
        assert!(!labels.insert("empty_value", ""));
        assert_eq!(labels.len(), 1);
    }

    #[test]
    fn sanitize_replaces_separators() {
        assert_eq!(
            sanitize_label_name("app.kubernetes.io/name"),
            "app_kubernetes_io_name"
        );
        assert_eq!(sanitize_label_name("gardener-role"), "gardener_role");
    }

    #[test]
    fn json_line_roundtrips_scalars() {
        let fields = fields(vec![
            ("log", Value::Text("hi there".into())),
            ("count", Value::Integer(3)),
            ("healthy", Value::Boolean(true)),
        ]);
        let line = render_line(&fields, LineFormat::Json);
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["log"], "hi there");
        assert_eq!(parsed["count"], 3);
        assert_eq!(parsed["healthy"], true);
    }

    #[test]
    fn logfmt_sorts_keys_and_quotes_values() {
        let fields = fields(vec![
            ("zeta", Value::Text("plain".into())),
            ("alpha", Value::Text("needs quoting".into())),
        ]);
        let line = render_line(&fields, LineFormat::KvPair);
        assert_eq!(line, r#"alpha="needs quoting" zeta=plain"#);
    }

    #[test]
    fn logfmt_is_deterministic() {
        let a = fields(vec![
            ("b", Value::Integer(2)),
            ("a", Value::Integer(1)),
            ("c", Value::Text("x y".into())),
        ]);
        let b = a.clone();
        assert_eq!(
            render_line(&a, LineFormat::KvPair),
            render_line(&b, LineFormat::KvPair)
        );
    }

    #[test]
    fn logfmt_renders_nested_values_as_json() {
        let fields = fields(vec![(
            "nested",
            Value::Map(
                [("k".to_owned(), Value::Integer(1))]
                    .into_iter()
                    .collect(),
            ),
        )]);
        let line = render_line(&fields, LineFormat::KvPair);
        assert_eq!(line, r#"nested="{\"k\":1}""#);
    }
}
