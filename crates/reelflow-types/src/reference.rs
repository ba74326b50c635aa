//! Reference expressions embedded in step parameters.
//!
//! A parameter string may contain `${source.path}` references:
//!
//! - `${<step_id>.<field>[.<nested>...]}` -- a field of a completed step's output
//! - `${input.<field>[...]}` -- a job input
//! - `${job.<field>[...]}` -- job metadata (`job_id`, `workflow`, `created_at`, `notes`)
//!
//! A string that is exactly one reference resolves to the referenced value
//! with its JSON type intact. References embedded in surrounding text are
//! interpolated as strings. `$${` escapes a literal `${`.
//!
//! This module only parses; resolution against a job document lives in
//! `reelflow-core`.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// Source namespace for the reserved job inputs.
pub const INPUT_SOURCE: &str = "input";

/// Source namespace for job metadata.
pub const JOB_SOURCE: &str = "job";

/// A malformed reference expression.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("empty reference '${{}}' in '{0}'")]
    Empty(String),

    #[error("unterminated reference in '{0}'")]
    Unterminated(String),

    #[error("reference '{0}' must name a field (e.g. '${{step.field}}')")]
    MissingField(String),

    #[error("reference '{0}' has an empty or invalid path segment")]
    InvalidSegment(String),
}

/// Where a reference reads its value from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RefSource {
    /// The job's literal inputs.
    Input,
    /// Job metadata.
    Job,
    /// The output of another step instance.
    Step(String),
}

/// A parsed `${source.path}` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    pub source: RefSource,
    /// Field path below the source; never empty.
    pub path: Vec<String>,
}

impl Reference {
    /// The step instance this reference depends on, if any.
    pub fn step_id(&self) -> Option<&str> {
        match &self.source {
            RefSource::Step(id) => Some(id.as_str()),
            RefSource::Input | RefSource::Job => None,
        }
    }

    fn parse_inner(inner: &str, raw: &str) -> Result<Self, ReferenceError> {
        let inner = inner.trim();
        if inner.is_empty() {
            return Err(ReferenceError::Empty(raw.to_string()));
        }

        let mut parts = inner.split('.');
        let head = parts.next().unwrap_or_default();
        let path: Vec<String> = parts.map(str::to_string).collect();

        let valid = |s: &str| {
            !s.is_empty()
                && s.chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        };
        if !valid(head) || path.iter().any(|p| !valid(p)) {
            return Err(ReferenceError::InvalidSegment(format!("${{{inner}}}")));
        }
        if path.is_empty() {
            return Err(ReferenceError::MissingField(format!("${{{inner}}}")));
        }

        let source = match head {
            INPUT_SOURCE => RefSource::Input,
            JOB_SOURCE => RefSource::Job,
            other => RefSource::Step(other.to_string()),
        };

        Ok(Self { source, path })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let head = match &self.source {
            RefSource::Input => INPUT_SOURCE,
            RefSource::Job => JOB_SOURCE,
            RefSource::Step(id) => id.as_str(),
        };
        write!(f, "${{{head}.{}}}", self.path.join("."))
    }
}

/// One piece of a parsed template string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Ref(Reference),
}

/// A parameter string split into literal text and references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    /// Parse a parameter string.
    pub fn parse(raw: &str) -> Result<Self, ReferenceError> {
        let mut segments = Vec::new();
        let mut text = String::new();
        let mut rest = raw;

        while let Some(pos) = rest.find('$') {
            text.push_str(&rest[..pos]);
            let tail = &rest[pos..];

            if let Some(after) = tail.strip_prefix("$${") {
                text.push_str("${");
                rest = after;
            } else if let Some(after) = tail.strip_prefix("${") {
                let end = after
                    .find('}')
                    .ok_or_else(|| ReferenceError::Unterminated(raw.to_string()))?;
                if !text.is_empty() {
                    segments.push(Segment::Text(std::mem::take(&mut text)));
                }
                segments.push(Segment::Ref(Reference::parse_inner(&after[..end], raw)?));
                rest = &after[end + 1..];
            } else {
                text.push('$');
                rest = &tail[1..];
            }
        }
        text.push_str(rest);
        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }

        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Returns the reference when the whole string is exactly one reference.
    pub fn as_single_ref(&self) -> Option<&Reference> {
        match self.segments.as_slice() {
            [Segment::Ref(r)] => Some(r),
            _ => None,
        }
    }

    pub fn has_refs(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, Segment::Ref(_)))
    }

    pub fn references(&self) -> impl Iterator<Item = &Reference> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Ref(r) => Some(r),
            Segment::Text(_) => None,
        })
    }
}

/// Collect every reference found anywhere inside a JSON value.
///
/// Object keys are never treated as references; only string values are
/// scanned.
pub fn collect_references(value: &Value) -> Result<Vec<Reference>, ReferenceError> {
    let mut out = Vec::new();
    collect_into(value, &mut out)?;
    Ok(out)
}

fn collect_into(value: &Value, out: &mut Vec<Reference>) -> Result<(), ReferenceError> {
    match value {
        Value::String(s) => {
            if s.contains('$') {
                out.extend(Template::parse(s)?.references().cloned());
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_into(item, out)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_into(item, out)?;
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}
