//! Reference resolution against the current job document.
//!
//! Turns declared params into resolved params. Literals pass through
//! unchanged; references are looked up in the job's inputs, its metadata,
//! or the output of a completed step. Resolution is repeated on every
//! execution and never cached.

use reelflow_types::ValueMap;
use reelflow_types::job::{JobDocument, StepStatus};
use reelflow_types::reference::{RefSource, Reference, ReferenceError, Segment, Template};
use serde_json::Value;
use thiserror::Error;

/// A reference that cannot be satisfied by the job document as it stands.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("step '{step}' cannot resolve '{reference}': {reason}")]
pub struct UnresolvedReferenceError {
    /// The step whose params were being resolved.
    pub step: String,
    pub reference: String,
    pub reason: UnresolvedReason,
}

impl UnresolvedReferenceError {
    /// The referenced step settled without output (skipped, or failed).
    ///
    /// Such a reference will not resolve on its own; a `pending` target
    /// only means the document was edited out of order.
    pub fn is_dependency_failure(&self) -> bool {
        matches!(
            self.reason,
            UnresolvedReason::NotCompleted {
                status: StepStatus::Skipped | StepStatus::Failed,
                ..
            }
        )
    }
}

/// Why a reference did not resolve.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum UnresolvedReason {
    #[error("step '{0}' does not exist")]
    UnknownStep(String),

    #[error("step '{step}' is {status}, not completed")]
    NotCompleted { step: String, status: StepStatus },

    #[error("field '{0}' not found")]
    MissingField(String),

    #[error("{0}")]
    Malformed(ReferenceError),
}

/// Resolve every reference inside `params` for step `step_id`.
pub fn resolve_params(
    step_id: &str,
    params: &ValueMap,
    job: &JobDocument,
) -> Result<ValueMap, UnresolvedReferenceError> {
    let resolver = Resolver { step_id, job };
    params
        .iter()
        .map(|(k, v)| Ok((k.clone(), resolver.value(v)?)))
        .collect()
}

struct Resolver<'a> {
    step_id: &'a str,
    job: &'a JobDocument,
}

impl Resolver<'_> {
    fn value(&self, value: &Value) -> Result<Value, UnresolvedReferenceError> {
        match value {
            Value::String(s) if s.contains('$') => self.string(s),
            Value::Array(items) => items
                .iter()
                .map(|item| self.value(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), self.value(v)?)))
                .collect::<Result<ValueMap, _>>()
                .map(Value::Object),
            other => Ok(other.clone()),
        }
    }

    fn string(&self, raw: &str) -> Result<Value, UnresolvedReferenceError> {
        let template = Template::parse(raw).map_err(|e| UnresolvedReferenceError {
            step: self.step_id.to_string(),
            reference: raw.to_string(),
            reason: UnresolvedReason::Malformed(e),
        })?;

        if let Some(reference) = template.as_single_ref() {
            return self.lookup(reference);
        }

        let mut out = String::new();
        for segment in template.segments() {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Ref(reference) => match self.lookup(reference)? {
                    Value::String(s) => out.push_str(&s),
                    other => out.push_str(&other.to_string()),
                },
            }
        }
        Ok(Value::String(out))
    }

    fn lookup(&self, reference: &Reference) -> Result<Value, UnresolvedReferenceError> {
        let fail = |reason| UnresolvedReferenceError {
            step: self.step_id.to_string(),
            reference: reference.to_string(),
            reason,
        };

        let root = match &reference.source {
            RefSource::Input => Value::Object(self.job.inputs.clone()),
            RefSource::Job => self.job.metadata(),
            RefSource::Step(target) => {
                let record = self
                    .job
                    .step(target)
                    .ok_or_else(|| fail(UnresolvedReason::UnknownStep(target.clone())))?;
                match (&record.status, &record.output) {
                    (StepStatus::Completed, Some(output)) => Value::Object(output.clone()),
                    (status, _) => {
                        return Err(fail(UnresolvedReason::NotCompleted {
                            step: target.clone(),
                            status: *status,
                        }));
                    }
                }
            }
        };

        let mut current = &root;
        for segment in &reference.path {
            let next = match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            current = next.ok_or_else(|| fail(UnresolvedReason::MissingField(segment.clone())))?;
        }
        Ok(current.clone())
    }
}
