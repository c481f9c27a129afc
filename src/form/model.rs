use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use serde_json::Value;

use super::context::FormContext;
use super::controller::FormModel;
use super::error::{FormError, FormResult, ValidationError};
use super::field::FieldModel;
use super::field_array::{ArrayInner, FieldArrayModel};
use super::field_set::{FieldSetModel, SetInner};
use super::validation::{Pipeline, ValidateOption, ValidationFuture, Validator, run_validators};
use crate::lock::{read_lock, write_lock};
use crate::reactive::{EventStream, StateStream};

static MODEL_ID_ALLOCATOR: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ModelId(pub u64);

impl ModelId {
    pub fn next() -> Self {
        Self(MODEL_ID_ALLOCATOR.fetch_add(1, Ordering::SeqCst))
    }
}

/// Navigation-only back pointer to the composite holding a model.
#[derive(Clone)]
pub(crate) enum Owner {
    Set(Weak<SetInner>),
    Array(Weak<ArrayInner>),
}

impl Owner {
    pub(crate) fn upgrade(&self) -> Option<Model> {
        match self {
            Owner::Set(weak) => weak
                .upgrade()
                .map(|inner| Model::Set(FieldSetModel::from_inner(inner))),
            Owner::Array(weak) => weak
                .upgrade()
                .map(|inner| Model::Array(FieldArrayModel::from_inner(inner))),
        }
    }
}

#[derive(Clone, Default)]
pub(crate) struct Attachment {
    pub(crate) owner: Option<Owner>,
    pub(crate) key: Option<String>,
    pub(crate) context: Option<Arc<FormContext>>,
}

/// Lifecycle state shared by every model variant.
pub(crate) struct ModelCore {
    pub(crate) id: ModelId,
    pub(crate) error: StateStream<Option<ValidationError>>,
    pub(crate) requests: EventStream<ValidateOption>,
    pub(crate) pipeline: Pipeline,
    validators: RwLock<Vec<Validator>>,
    attachment: RwLock<Attachment>,
}

impl ModelCore {
    pub(crate) fn new() -> Self {
        Self {
            id: ModelId::next(),
            error: StateStream::new(None),
            requests: EventStream::new(),
            pipeline: Pipeline::default(),
            validators: RwLock::new(Vec::new()),
            attachment: RwLock::new(Attachment::default()),
        }
    }

    pub(crate) fn validators(&self) -> Vec<Validator> {
        read_lock(&self.validators).clone()
    }

    pub(crate) fn add_validator(&self, validator: Validator) {
        write_lock(&self.validators).push(validator);
    }

    pub(crate) fn set_validators(&self, validators: Vec<Validator>) {
        *write_lock(&self.validators) = validators;
    }

    pub(crate) fn context(&self) -> Option<Arc<FormContext>> {
        read_lock(&self.attachment).context.clone()
    }

    pub(crate) fn owner(&self) -> Option<Model> {
        read_lock(&self.attachment)
            .owner
            .as_ref()
            .and_then(Owner::upgrade)
    }

    pub(crate) fn key(&self) -> Option<String> {
        read_lock(&self.attachment).key.clone()
    }

    pub(crate) fn set_key(&self, key: String) {
        write_lock(&self.attachment).key = Some(key);
    }

    pub(crate) fn set_attachment(&self, attachment: Attachment) {
        *write_lock(&self.attachment) = attachment;
    }

    pub(crate) fn set_context(&self, context: Option<Arc<FormContext>>) {
        write_lock(&self.attachment).context = context;
    }

    pub(crate) fn notify_change(&self, path: impl FnOnce() -> String) {
        if let Some(context) = self.context() {
            context.notify_change(path());
        }
    }
}

/// One node of the form tree.
#[derive(Clone)]
pub enum Model {
    Field(FieldModel),
    Set(FieldSetModel),
    Array(FieldArrayModel),
    Form(FormModel),
}

impl Model {
    pub(crate) fn core(&self) -> &ModelCore {
        match self {
            Model::Field(field) => field.core(),
            Model::Set(set) => set.core(),
            Model::Array(array) => array.core(),
            Model::Form(form) => form.as_set().core(),
        }
    }

    pub fn id(&self) -> ModelId {
        self.core().id
    }

    pub fn key(&self) -> Option<String> {
        self.core().key()
    }

    pub fn owner(&self) -> Option<Model> {
        self.core().owner()
    }

    /// Dotted path from the root, e.g. `contacts.0.email`.
    pub fn path(&self) -> String {
        let Some(key) = self.key() else {
            return String::new();
        };
        match self.owner().map(|owner| owner.path()) {
            Some(parent) if !parent.is_empty() => format!("{parent}.{key}"),
            _ => key,
        }
    }

    pub fn error(&self) -> Option<ValidationError> {
        self.core().error.get()
    }

    pub fn error_stream(&self) -> &StateStream<Option<ValidationError>> {
        &self.core().error
    }

    pub fn validate_requests(&self) -> &EventStream<ValidateOption> {
        &self.core().requests
    }

    pub fn validators(&self) -> Vec<Validator> {
        self.core().validators()
    }

    pub fn add_validator(&self, validator: Validator) {
        self.core().add_validator(validator);
    }

    pub fn set_validators(&self, validators: Vec<Validator>) {
        self.core().set_validators(validators);
    }

    pub fn get_raw_value(&self) -> Value {
        match self {
            Model::Field(field) => field.get_raw_value(),
            Model::Set(set) => set.get_raw_value(),
            Model::Array(array) => array.get_raw_value(),
            Model::Form(form) => form.get_raw_value(),
        }
    }

    pub fn patch_value(&self, value: Value) -> FormResult<()> {
        match self {
            Model::Field(field) => field.patch_value(value),
            Model::Set(set) => set.patch_value(value),
            Model::Array(array) => array.patch_value(value),
            Model::Form(form) => form.patch_value(value),
        }
    }

    pub fn initialize(&self, value: Value) -> FormResult<()> {
        match self {
            Model::Field(field) => field.initialize(value),
            Model::Set(set) => set.initialize(value),
            Model::Array(array) => array.initialize(value),
            Model::Form(form) => form.initialize(value),
        }
    }

    pub fn reset(&self) {
        match self {
            Model::Field(field) => field.reset(),
            Model::Set(set) => set.reset(),
            Model::Array(array) => array.reset(),
            Model::Form(form) => form.reset(),
        }
    }

    pub fn clear(&self) {
        match self {
            Model::Field(field) => field.clear(),
            Model::Set(set) => set.clear(),
            Model::Array(array) => array.clear(),
            Model::Form(form) => form.clear(),
        }
    }

    /// Starts a validate request. Synchronous validators run before this
    /// returns; the rest runs while the future is polled, and dropping the
    /// future cancels it.
    pub fn validate(&self, option: ValidateOption) -> ValidationFuture {
        match self {
            Model::Field(field) => field.validate(option),
            Model::Set(set) => set.validate(option),
            Model::Array(array) => array.validate(option),
            Model::Form(form) => form.validate(option),
        }
    }

    pub fn touched(&self) -> bool {
        match self {
            Model::Field(field) => field.touched(),
            Model::Set(set) => set.touched(),
            Model::Array(array) => array.touched(),
            Model::Form(form) => form.touched(),
        }
    }

    pub fn dirty(&self) -> bool {
        match self {
            Model::Field(field) => field.dirty(),
            Model::Set(set) => set.dirty(),
            Model::Array(array) => array.dirty(),
            Model::Form(form) => form.dirty(),
        }
    }

    pub fn pristine(&self) -> bool {
        !self.dirty()
    }

    pub fn valid(&self) -> bool {
        match self {
            Model::Field(field) => field.valid(),
            Model::Set(set) => set.valid(),
            Model::Array(array) => array.valid(),
            Model::Form(form) => form.valid(),
        }
    }

    /// Whether this node has a validate request that has not settled yet.
    pub fn is_validating(&self) -> bool {
        self.core().pipeline.is_running()
    }

    pub(crate) fn run_own_validators(&self, option: ValidateOption) -> ValidationFuture {
        run_validators(self, option)
    }

    /// Moves the model under `owner`, handing it the owner's form context.
    pub(crate) fn attach(
        &self,
        owner: Owner,
        key: String,
        context: Option<Arc<FormContext>>,
    ) -> FormResult<()> {
        if matches!(self, Model::Form(_)) {
            return Err(FormError::NestedForm);
        }
        self.core().set_attachment(Attachment {
            owner: Some(owner),
            key: Some(key),
            context: context.clone(),
        });
        self.propagate_context(context);
        Ok(())
    }

    /// Cancels pending validation beneath this model and cuts it loose.
    pub(crate) fn detach(&self) {
        self.cancel_validation();
        self.core().set_attachment(Attachment::default());
        self.propagate_context(None);
    }

    pub(crate) fn propagate_context(&self, context: Option<Arc<FormContext>>) {
        self.core().set_context(context.clone());
        match self {
            Model::Field(_) => {}
            Model::Set(set) => set.propagate_context(context),
            Model::Array(array) => array.propagate_context(context),
            Model::Form(_) => {}
        }
    }

    pub(crate) fn cancel_validation(&self) {
        self.core().pipeline.cancel();
        match self {
            Model::Field(_) => {}
            Model::Set(set) => set.for_each_child(|child| child.cancel_validation()),
            Model::Array(array) => array.for_each_model(|child| child.cancel_validation()),
            Model::Form(form) => form.as_set().for_each_child(|child| child.cancel_validation()),
        }
    }
}

impl From<FieldModel> for Model {
    fn from(field: FieldModel) -> Self {
        Model::Field(field)
    }
}

impl From<FieldSetModel> for Model {
    fn from(set: FieldSetModel) -> Self {
        Model::Set(set)
    }
}

impl From<FieldArrayModel> for Model {
    fn from(array: FieldArrayModel) -> Self {
        Model::Array(array)
    }
}

impl From<FormModel> for Model {
    fn from(form: FormModel) -> Self {
        Model::Form(form)
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Model::Field(_) => "Field",
            Model::Set(_) => "Set",
            Model::Array(_) => "Array",
            Model::Form(_) => "Form",
        };
        f.debug_struct(kind)
            .field("id", &self.id())
            .field("path", &self.path())
            .field("value", &self.get_raw_value())
            .finish()
    }
}
