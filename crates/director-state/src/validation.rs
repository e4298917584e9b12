//! Instance validation.
//!
//! Every rule is evaluated before anything is reported, so a caller sees all
//! problems with a draft at once rather than fixing them one by one.

use std::fmt;

use serde_json::Value;

use crate::error::{StateError, StateResult};
use crate::types::{Instance, InstanceDraft, InstanceState, RecordId};

/// The rule a field violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationRule {
    MissingField,
    UniquenessViolation,
    InvalidType,
    InvalidEnumValue,
}

impl fmt::Display for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValidationRule::MissingField => "missing field",
            ValidationRule::UniquenessViolation => "uniqueness violation",
            ValidationRule::InvalidType => "invalid type",
            ValidationRule::InvalidEnumValue => "invalid enum value",
        })
    }
}

/// A single violated rule.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {rule} ({reason})")]
pub struct ValidationError {
    pub field: &'static str,
    pub rule: ValidationRule,
    pub reason: String,
}

impl ValidationError {
    fn new(field: &'static str, rule: ValidationRule, reason: impl Into<String>) -> Self {
        Self {
            field,
            rule,
            reason: reason.into(),
        }
    }
}

/// Every rule a draft violated, in evaluation order. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrors(Vec<ValidationError>);

impl ValidationErrors {
    pub fn errors(&self) -> &[ValidationError] {
        &self.0
    }

    /// Whether `field` violated `rule`.
    pub fn contains(&self, field: &str, rule: ValidationRule) -> bool {
        self.0.iter().any(|e| e.field == field && e.rule == rule)
    }

    pub(crate) fn single(field: &'static str, rule: ValidationRule, reason: impl Into<String>) -> Self {
        Self(vec![ValidationError::new(field, rule, reason)])
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("validation failed: ")?;
        for (i, error) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Lookups over existing instances needed by the uniqueness rules.
///
/// The store implements this over the tables of the write transaction that
/// will commit the record, so the check and the write see the same snapshot.
pub trait InstanceIndex {
    /// Id of the instance occupying the given job/index slot.
    fn slot_holder(&self, deployment_id: RecordId, job: &str, index: u32) -> StateResult<Option<RecordId>>;

    /// Id of the instance assigned to the given VM.
    fn vm_holder(&self, vm_id: RecordId) -> StateResult<Option<RecordId>>;
}

impl InstanceDraft {
    /// Validate the draft as the record with surrogate id `id`.
    ///
    /// Records already holding `id` are not counted as conflicts, so an
    /// update that keeps its own slot or VM passes.
    pub fn validate(&self, id: RecordId, existing: &impl InstanceIndex) -> StateResult<Instance> {
        let mut errors = Vec::new();

        let deployment_id = self.deployment_id;
        if deployment_id.is_none() {
            errors.push(ValidationError::new("deployment_id", ValidationRule::MissingField, "is not present"));
        }

        let job = self.job.as_deref().filter(|job| !job.is_empty());
        if job.is_none() {
            errors.push(ValidationError::new("job", ValidationRule::MissingField, "is not present"));
        }

        let index = match self.index.as_ref().filter(|v| !v.is_null()) {
            None => {
                errors.push(ValidationError::new("index", ValidationRule::MissingField, "is not present"));
                None
            }
            Some(value) => {
                let parsed = parse_index(value);
                if parsed.is_none() {
                    errors.push(ValidationError::new(
                        "index",
                        ValidationRule::InvalidType,
                        format!("{value} is not a non-negative integer"),
                    ));
                }
                parsed
            }
        };

        let state = match self.state.as_deref() {
            None => {
                errors.push(ValidationError::new("state", ValidationRule::MissingField, "is not present"));
                None
            }
            Some(raw) => match raw.parse::<InstanceState>() {
                Ok(state) => Some(state),
                Err(_) => {
                    errors.push(ValidationError::new(
                        "state",
                        ValidationRule::InvalidEnumValue,
                        format!("{raw:?} is not one of started, stopped, detached"),
                    ));
                    None
                }
            },
        };

        if let (Some(deployment_id), Some(job), Some(index)) = (deployment_id, job, index) {
            if let Some(holder) = existing.slot_holder(deployment_id, job, index)? {
                if holder != id {
                    errors.push(ValidationError::new(
                        "deployment_id, job, index",
                        ValidationRule::UniquenessViolation,
                        format!("{job}/{index} is already taken by instance {holder}"),
                    ));
                }
            }
        }

        if let Some(vm_id) = self.vm_id {
            if let Some(holder) = existing.vm_holder(vm_id)? {
                if holder != id {
                    errors.push(ValidationError::new(
                        "vm_id",
                        ValidationRule::UniquenessViolation,
                        format!("vm {vm_id} is already assigned to instance {holder}"),
                    ));
                }
            }
        }

        match (deployment_id, job, index, state) {
            (Some(deployment_id), Some(job), Some(index), Some(state)) if errors.is_empty() => Ok(Instance {
                id,
                deployment_id,
                job: job.to_string(),
                index,
                state,
                vm_id: self.vm_id,
            }),
            _ => Err(StateError::Validation(ValidationErrors(errors))),
        }
    }
}

/// Integral JSON numbers and decimal strings that fit a `u32`.
fn parse_index(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => match n.as_u64() {
            Some(n) => u32::try_from(n).ok(),
            None => n
                .as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= 0.0 && *f <= f64::from(u32::MAX))
                .map(|f| f as u32),
        },
        Value::String(s) => {
            let s = s.trim();
            if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
                s.parse().ok()
            } else {
                None
            }
        }
        _ => None,
    }
}
