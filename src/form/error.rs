use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::controller::SubmitState;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum FormError {
    ShapeMismatch {
        path: String,
        expected: &'static str,
        found: String,
    },
    MissingFormContext,
    MissingSectionContext,
    ReferenceAlreadyBound,
    ReentrantMutation(&'static str),
    NestedForm,
    InvalidStateTransition {
        from: SubmitState,
        to: SubmitState,
    },
    AlreadySubmitting,
    DraftLoadFailed(String),
    DraftSaveFailed(String),
    DraftClearFailed(String),
}

impl FormError {
    pub(crate) fn shape(path: impl Into<String>, expected: &'static str, found: &Value) -> Self {
        FormError::ShapeMismatch {
            path: path.into(),
            expected,
            found: value_kind(found).to_string(),
        }
    }
}

impl Display for FormError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FormError::ShapeMismatch {
                path,
                expected,
                found,
            } => write!(f, "value at `{path}` has wrong shape: expected {expected}, found {found}"),
            FormError::MissingFormContext => {
                f.write_str("form value requested outside of any form")
            }
            FormError::MissingSectionContext => {
                f.write_str("section value requested for a model without owner")
            }
            FormError::ReferenceAlreadyBound => {
                f.write_str("model reference is already bound to a different model")
            }
            FormError::ReentrantMutation(operation) => {
                write!(f, "structural `{operation}` attempted from inside a validator")
            }
            FormError::NestedForm => f.write_str("a form cannot be registered as a child model"),
            FormError::InvalidStateTransition { from, to } => {
                write!(f, "invalid submit state transition: {from:?} -> {to:?}")
            }
            FormError::AlreadySubmitting => f.write_str("form submit is already in progress"),
            FormError::DraftLoadFailed(error) => write!(f, "failed to load draft: {error}"),
            FormError::DraftSaveFailed(error) => write!(f, "failed to save draft: {error}"),
            FormError::DraftClearFailed(error) => write!(f, "failed to clear draft: {error}"),
        }
    }
}

impl std::error::Error for FormError {}

pub type FormResult<T> = Result<T, FormError>;

pub(crate) fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// User-facing validation outcome.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ValidationError {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: None,
            actual: None,
            expect: None,
            limit: None,
            extra: Map::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_actual(mut self, actual: impl Into<Value>) -> Self {
        self.actual = Some(actual.into());
        self
    }

    pub fn with_expect(mut self, expect: impl Into<Value>) -> Self {
        self.expect = Some(expect.into());
        self
    }

    pub fn with_limit(mut self, limit: impl Into<Value>) -> Self {
        self.limit = Some(limit.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or(&self.name)
    }
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// A validator implementation failing, as opposed to a value failing validation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValidatorFault {
    message: String,
}

impl ValidatorFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn from_error(error: &dyn std::error::Error) -> Self {
        Self::new(error.to_string())
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for ValidatorFault {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "validator failed: {}", self.message)
    }
}

impl std::error::Error for ValidatorFault {}

impl From<FormError> for ValidatorFault {
    fn from(error: FormError) -> Self {
        Self::from_error(&error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validation_error_serializes_flat_record() {
        let error = ValidationError::new("maxLength")
            .with_actual(7)
            .with_limit(5)
            .with_extra("field", "name");
        assert_eq!(
            serde_json::to_value(&error).expect("serialize"),
            json!({ "name": "maxLength", "actual": 7, "limit": 5, "field": "name" })
        );
        assert_eq!(error.message(), "maxLength");
    }

    #[test]
    fn shape_mismatch_names_both_kinds() {
        let error = FormError::shape("profile", "object", &json!([1]));
        assert_eq!(
            error.to_string(),
            "value at `profile` has wrong shape: expected object, found array"
        );
    }
}
