use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

use super::context::{FormContext, StructureChange, ValidatorFaultReport};
use super::error::{FormError, FormResult, ValidationError};
use super::field::FieldModel;
use super::field_array::{FieldArrayModel, ItemFactory};
use super::field_set::FieldSetModel;
use super::model::{Model, ModelId};
use super::validation::{ValidateOption, ValidationFuture, Validator};
use crate::reactive::{EventStream, StateStream};

static FORM_ID_ALLOCATOR: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FormId(pub u64);

impl FormId {
    pub fn next() -> Self {
        Self(FORM_ID_ALLOCATOR.fetch_add(1, Ordering::SeqCst))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubmitState {
    Idle,
    Validating,
    Submitting,
    Succeeded,
    Failed,
}

impl SubmitState {
    pub fn can_transition(self, next: SubmitState) -> bool {
        self == next
            || matches!(
                (self, next),
                (SubmitState::Idle, SubmitState::Validating)
                    | (SubmitState::Validating, SubmitState::Submitting)
                    | (SubmitState::Validating, SubmitState::Failed)
                    | (SubmitState::Submitting, SubmitState::Succeeded)
                    | (SubmitState::Submitting, SubmitState::Failed)
                    | (SubmitState::Succeeded, SubmitState::Validating)
                    | (SubmitState::Failed, SubmitState::Validating)
                    | (_, SubmitState::Idle)
            )
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FormOptions {
    /// Options for [`FormModel::validate_all`] and submit. Root validation
    /// always includes children.
    pub validate_option: ValidateOption,
    pub log_validator_faults: bool,
}

impl Default for FormOptions {
    fn default() -> Self {
        Self {
            validate_option: ValidateOption::IGNORE_TOUCHED,
            log_validator_faults: true,
        }
    }
}

struct FormInner {
    set: FieldSetModel,
    context: Arc<FormContext>,
    submit_state: StateStream<SubmitState>,
    submit_count: StateStream<u32>,
}

/// Root of a form tree. Owns the in-flight validator set, the fault channel
/// and the structural change stream shared by every node beneath it.
#[derive(Clone)]
pub struct FormModel {
    inner: Arc<FormInner>,
}

impl Default for FormModel {
    fn default() -> Self {
        Self::new()
    }
}

impl FormModel {
    pub fn new() -> Self {
        Self::with_options(FormOptions::default())
    }

    pub fn with_options(options: FormOptions) -> Self {
        let set = FieldSetModel::new();
        let context = Arc::new(FormContext::new(FormId::next(), options));
        context.set_root(&set);
        set.to_model().propagate_context(Some(context.clone()));
        tracing::debug!(form = context.id.0, "form created");
        Self {
            inner: Arc::new(FormInner {
                set,
                context,
                submit_state: StateStream::new(SubmitState::Idle),
                submit_count: StateStream::new(0),
            }),
        }
    }

    pub fn form_id(&self) -> FormId {
        self.inner.context.id
    }

    pub fn id(&self) -> ModelId {
        self.inner.set.id()
    }

    pub fn options(&self) -> FormOptions {
        self.inner.context.options
    }

    /// The keyed group backing this form.
    pub fn as_set(&self) -> &FieldSetModel {
        &self.inner.set
    }

    pub fn to_model(&self) -> Model {
        Model::Form(self.clone())
    }

    pub fn with_validator(self, validator: Validator) -> Self {
        self.inner.set.core().add_validator(validator);
        self
    }

    pub fn register(&self, name: impl Into<String>, model: impl Into<Model>) -> FormResult<()> {
        self.inner.set.register(name, model)
    }

    pub fn remove(&self, name: &str) -> FormResult<Option<Model>> {
        self.inner.set.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Model> {
        self.inner.set.get(name)
    }

    pub fn field(&self, name: &str, default_value: impl Into<Value>) -> FormResult<FieldModel> {
        self.inner.set.field(name, default_value)
    }

    pub fn field_set(&self, name: &str) -> FormResult<FieldSetModel> {
        self.inner.set.field_set(name)
    }

    pub fn field_array(
        &self,
        name: &str,
        factory: Option<ItemFactory>,
    ) -> FormResult<FieldArrayModel> {
        self.inner.set.field_array(name, factory)
    }

    pub fn get_raw_value(&self) -> Value {
        self.inner.set.get_raw_value()
    }

    pub fn patch_value(&self, value: Value) -> FormResult<()> {
        self.inner.set.patch_value(value)
    }

    pub fn initialize(&self, value: Value) -> FormResult<()> {
        self.inner.set.initialize(value)
    }

    pub fn reset(&self) {
        self.inner.set.reset();
    }

    pub fn clear(&self) {
        self.inner.set.clear();
    }

    pub fn touched(&self) -> bool {
        self.inner.set.touched()
    }

    pub fn dirty(&self) -> bool {
        self.inner.set.dirty()
    }

    pub fn pristine(&self) -> bool {
        !self.dirty()
    }

    pub fn valid(&self) -> bool {
        self.inner.set.valid()
    }

    pub fn error(&self) -> Option<ValidationError> {
        self.inner.set.error()
    }

    pub fn error_stream(&self) -> &StateStream<Option<ValidationError>> {
        self.inner.set.error_stream()
    }

    pub fn validate(&self, option: ValidateOption) -> ValidationFuture {
        self.inner
            .set
            .validate(option | ValidateOption::INCLUDE_CHILDREN)
    }

    /// Validates the whole tree with the form's configured options.
    pub fn validate_all(&self) -> ValidationFuture {
        self.validate(self.options().validate_option)
    }

    /// True while any asynchronous validator in the tree is running.
    pub fn is_validating(&self) -> bool {
        self.inner.context.validating().get()
    }

    pub fn validating(&self) -> &StateStream<bool> {
        self.inner.context.validating()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.context.in_flight.len()
    }

    /// Validator faults raised anywhere beneath this form.
    pub fn faults(&self) -> &EventStream<ValidatorFaultReport> {
        &self.inner.context.faults
    }

    /// Structural changes anywhere beneath this form.
    pub fn change(&self) -> &EventStream<StructureChange> {
        &self.inner.context.change
    }

    pub fn submit_state(&self) -> SubmitState {
        self.inner.submit_state.get()
    }

    pub fn submit_state_stream(&self) -> &StateStream<SubmitState> {
        &self.inner.submit_state
    }

    pub fn submit_count(&self) -> u32 {
        self.inner.submit_count.get()
    }

    pub fn submit_count_stream(&self) -> &StateStream<u32> {
        &self.inner.submit_count
    }

    pub fn reset_submit_state(&self) -> FormResult<()> {
        self.transition(SubmitState::Idle)
    }

    /// Validates synchronously, skipping asynchronous validators, then calls
    /// `f` with the raw value if the tree is valid. A validator that does not
    /// settle synchronously is cancelled.
    pub fn submit(&self, f: impl FnOnce(&Value) -> FormResult<()>) -> FormResult<()> {
        self.begin_submit()?;
        drop(self.validate(self.options().validate_option | ValidateOption::IGNORE_ASYNC));
        let Some(value) = self.after_validation()? else {
            return Ok(());
        };
        let result = f(&value);
        self.complete_submit(&result)?;
        result
    }

    pub async fn submit_async<F, Fut>(&self, f: F) -> FormResult<()>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = FormResult<()>>,
    {
        self.begin_submit()?;
        self.validate_all().await;
        let Some(value) = self.after_validation()? else {
            return Ok(());
        };
        let result = f(value).await;
        self.complete_submit(&result)?;
        result
    }

    fn begin_submit(&self) -> FormResult<()> {
        if self.submit_state() == SubmitState::Submitting {
            return Err(FormError::AlreadySubmitting);
        }
        self.transition(SubmitState::Validating)?;
        self.inner
            .submit_count
            .update(|count| *count = count.saturating_add(1));
        Ok(())
    }

    fn after_validation(&self) -> FormResult<Option<Value>> {
        if !self.valid() {
            tracing::debug!(form = self.form_id().0, "submit blocked by validation");
            self.transition(SubmitState::Failed)?;
            return Ok(None);
        }
        self.transition(SubmitState::Submitting)?;
        Ok(Some(self.get_raw_value()))
    }

    fn complete_submit(&self, result: &FormResult<()>) -> FormResult<()> {
        match result {
            Ok(()) => self.transition(SubmitState::Succeeded),
            Err(error) => {
                tracing::warn!(form = self.form_id().0, %error, "submit handler failed");
                self.transition(SubmitState::Failed)
            }
        }
    }

    fn transition(&self, next: SubmitState) -> FormResult<()> {
        let current = self.submit_state();
        if current == next {
            return Ok(());
        }
        if !current.can_transition(next) {
            return Err(FormError::InvalidStateTransition {
                from: current,
                to: next,
            });
        }
        self.inner.submit_state.set(next);
        Ok(())
    }
}

impl std::fmt::Debug for FormModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormModel")
            .field("id", &self.form_id())
            .field("value", &self.get_raw_value())
            .field("submit_state", &self.submit_state())
            .finish()
    }
}
