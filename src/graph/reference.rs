//! Parsing of `${...}` placeholders in declared attribute values.
//!
//! `${run.suffix}`, `${project.name}` and `${project.environment}` are run
//! values and are substituted while parsing. Any other `${node.output}` becomes
//! an [`OutputRef`] resolved later by the executor.

use serde_json::Value;
use std::collections::BTreeMap;

use super::model::{AttrValue, OutputRef, Segment};

/// Run-scoped values substituted at graph construction time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    /// Naming suffix, fixed once per state and reused on every run.
    pub suffix: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
}

/// Ids reserved for run values; resources may not use them.
pub const RESERVED_IDS: &[&str] = &["run", "project"];

impl RunContext {
    /// Creates a run context.
    #[must_use]
    pub fn new(
        suffix: impl Into<String>,
        project: impl Into<String>,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            suffix: suffix.into(),
            project: project.into(),
            environment: environment.into(),
        }
    }

    fn lookup(&self, scope: &str, key: &str) -> Option<Option<&str>> {
        match scope {
            "run" => Some((key == "suffix").then_some(self.suffix.as_str())),
            "project" => Some(match key {
                "name" => Some(self.project.as_str()),
                "environment" => Some(self.environment.as_str()),
                _ => None,
            }),
            _ => None,
        }
    }
}

/// Parses a declared JSON value into an [`AttrValue`].
///
/// # Errors
///
/// Returns the raw text of the first malformed placeholder or unknown run value.
pub fn parse_value(value: &Value, ctx: &RunContext) -> Result<AttrValue, String> {
    match value {
        Value::String(s) => parse_string(s, ctx),
        Value::Array(items) => {
            let parsed = items
                .iter()
                .map(|item| parse_value(item, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            if parsed.iter().all(AttrValue::is_literal) {
                Ok(AttrValue::Literal(Value::Array(
                    parsed.into_iter().filter_map(into_literal).collect(),
                )))
            } else {
                Ok(AttrValue::List(parsed))
            }
        }
        Value::Object(entries) => {
            let parsed = entries
                .iter()
                .map(|(k, v)| Ok((k.clone(), parse_value(v, ctx)?)))
                .collect::<Result<BTreeMap<_, _>, String>>()?;
            if parsed.values().all(AttrValue::is_literal) {
                Ok(AttrValue::Literal(Value::Object(
                    parsed
                        .into_iter()
                        .filter_map(|(k, v)| into_literal(v).map(|v| (k, v)))
                        .collect(),
                )))
            } else {
                Ok(AttrValue::Map(parsed))
            }
        }
        other => Ok(AttrValue::Literal(other.clone())),
    }
}

fn into_literal(value: AttrValue) -> Option<Value> {
    match value {
        AttrValue::Literal(v) => Some(v),
        _ => None,
    }
}

fn parse_string(input: &str, ctx: &RunContext) -> Result<AttrValue, String> {
    let mut segments: Vec<Segment> = Vec::new();
    let mut text = String::new();
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        text.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| rest[start..].to_string())?;
        let inner = after[..end].trim();
        let raw = &rest[start..start + 2 + end + 1];

        let (scope, key) = split_reference(inner).ok_or_else(|| raw.to_string())?;
        match ctx.lookup(scope, key) {
            Some(Some(value)) => text.push_str(value),
            Some(None) => return Err(raw.to_string()),
            None => {
                if !text.is_empty() {
                    segments.push(Segment::Text(std::mem::take(&mut text)));
                }
                segments.push(Segment::Reference(OutputRef::new(scope, key)));
            }
        }
        rest = &after[end + 1..];
    }
    text.push_str(rest);

    if segments.is_empty() {
        return Ok(AttrValue::Literal(Value::String(text)));
    }
    if text.is_empty() && segments.len() == 1 {
        if let Some(Segment::Reference(r)) = segments.pop() {
            return Ok(AttrValue::Reference(r));
        }
    }
    if !text.is_empty() {
        segments.push(Segment::Text(text));
    }
    Ok(AttrValue::Template(segments))
}

fn split_reference(inner: &str) -> Option<(&str, &str)> {
    let (node, output) = inner.split_once('.')?;
    let valid = |part: &str| {
        !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    };
    (valid(node) && valid(output)).then_some((node, output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> RunContext {
        RunContext::new("a1b2c3d4", "platform", "dev")
    }

    #[test]
    fn test_plain_string_is_literal() {
        let parsed = parse_value(&json!("10.0.0.0/16"), &ctx()).unwrap();
        assert_eq!(parsed, AttrValue::Literal(json!("10.0.0.0/16")));
    }

    #[test]
    fn test_run_values_substituted() {
        let parsed = parse_value(&json!("${project.name}-${project.environment}-${run.suffix}"), &ctx())
            .unwrap();
        assert_eq!(parsed, AttrValue::Literal(json!("platform-dev-a1b2c3d4")));
    }

    #[test]
    fn test_exact_reference() {
        let parsed = parse_value(&json!("${vpc.id}"), &ctx()).unwrap();
        assert_eq!(parsed, AttrValue::Reference(OutputRef::new("vpc", "id")));
    }

    #[test]
    fn test_mixed_template() {
        let parsed = parse_value(&json!("${cluster.name}-pool-${run.suffix}"), &ctx()).unwrap();
        assert_eq!(
            parsed,
            AttrValue::Template(vec![
                Segment::Reference(OutputRef::new("cluster", "name")),
                Segment::Text(String::from("-pool-a1b2c3d4")),
            ])
        );
    }

    #[test]
    fn test_nested_values() {
        let parsed = parse_value(
            &json!({"subnets": ["${subnet_a.id}", "subnet-static"], "tags": {"env": "dev"}}),
            &ctx(),
        )
        .unwrap();

        let AttrValue::Map(entries) = parsed else {
            panic!("expected a map");
        };
        assert_eq!(entries["tags"], AttrValue::Literal(json!({"env": "dev"})));
        assert!(matches!(entries["subnets"], AttrValue::List(ref items) if items.len() == 2));
    }

    #[test]
    fn test_malformed_references() {
        assert_eq!(parse_value(&json!("${vpc"), &ctx()), Err(String::from("${vpc")));
        assert_eq!(parse_value(&json!("x-${vpc}"), &ctx()), Err(String::from("${vpc}")));
        assert_eq!(
            parse_value(&json!("${run.region}"), &ctx()),
            Err(String::from("${run.region}"))
        );
    }
}
