use std::fmt::{Debug, Formatter};
use std::sync::{Arc, RwLock};

use futures::FutureExt;
use futures::future;
use serde_json::Value;

use super::context::FormContext;
use super::error::{FormError, FormResult};
use super::model::{Attachment, Model, Owner};
use super::validation::{ValidateOption, ValidationFuture, ensure_not_validating};
use crate::lock::{read_lock, write_lock};
use crate::reactive::StateStream;

struct RefInner {
    model: StateStream<Option<Model>>,
    default_value: Option<Value>,
    initial_value: RwLock<Option<Value>>,
    patched_value: RwLock<Option<Value>>,
    attachment: RwLock<Attachment>,
}

/// Late-binding slot for one list position. Values written before a model
/// is bound are kept and used to seed it: the initial value (or the default)
/// becomes the model's baseline, a patched value its current value.
///
/// A reference holds at most one model. Binding a different model while one
/// is bound fails with [`FormError::ReferenceAlreadyBound`]; call
/// [`unbind`](Self::unbind) first.
#[derive(Clone)]
pub struct ModelRef {
    inner: Arc<RefInner>,
}

impl Default for ModelRef {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRef {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Reference that reads as `value` until something else is written.
    pub fn with_value(value: Value) -> Self {
        Self::build(Some(value))
    }

    fn build(default_value: Option<Value>) -> Self {
        Self {
            inner: Arc::new(RefInner {
                model: StateStream::new(None),
                default_value,
                initial_value: RwLock::new(None),
                patched_value: RwLock::new(None),
                attachment: RwLock::new(Attachment::default()),
            }),
        }
    }

    pub fn get_model(&self) -> Option<Model> {
        self.inner.model.get()
    }

    pub fn model_stream(&self) -> &StateStream<Option<Model>> {
        &self.inner.model
    }

    pub fn is_bound(&self) -> bool {
        self.inner.model.with(Option::is_some)
    }

    pub fn initial_value(&self) -> Option<Value> {
        read_lock(&self.inner.initial_value).clone()
    }

    pub fn patched_value(&self) -> Option<Value> {
        read_lock(&self.inner.patched_value).clone()
    }

    pub fn set_model(&self, model: impl Into<Model>) -> FormResult<()> {
        ensure_not_validating("set_model")?;
        let model = model.into();
        if let Some(current) = self.get_model() {
            if current.id() == model.id() {
                return Ok(());
            }
            return Err(FormError::ReferenceAlreadyBound);
        }
        if matches!(model, Model::Form(_)) {
            return Err(FormError::NestedForm);
        }

        let attachment = read_lock(&self.inner.attachment).clone();
        if let (Some(owner), Some(key)) = (attachment.owner, attachment.key) {
            model.attach(owner, key, attachment.context)?;
        }
        if let Some(baseline) = self.baseline()
            && let Err(error) = model.initialize(baseline)
        {
            tracing::warn!(model = model.id().0, %error, "initial value rejected");
        }
        let patched = write_lock(&self.inner.patched_value).take();
        if let Some(patched) = patched
            && let Err(error) = model.patch_value(patched)
        {
            tracing::warn!(model = model.id().0, %error, "patched value rejected");
        }

        tracing::trace!(model = model.id().0, path = %model.path(), "reference bound");
        self.inner.model.set(Some(model.clone()));
        self.notify_change(&model);
        Ok(())
    }

    /// Releases the bound model. Its last value is kept so a later binding
    /// starts from it.
    pub fn unbind(&self) -> FormResult<Option<Model>> {
        ensure_not_validating("unbind")?;
        let Some(model) = self.get_model() else {
            return Ok(None);
        };
        *write_lock(&self.inner.patched_value) = Some(model.get_raw_value());
        self.notify_change(&model);
        model.detach();
        self.inner.model.set(None);
        Ok(Some(model))
    }

    pub fn get_raw_value(&self) -> Value {
        if let Some(model) = self.get_model() {
            return model.get_raw_value();
        }
        self.patched_value()
            .or_else(|| self.baseline())
            .unwrap_or(Value::Null)
    }

    fn baseline(&self) -> Option<Value> {
        self.initial_value()
            .or_else(|| self.inner.default_value.clone())
    }

    pub fn patch_value(&self, value: Value) -> FormResult<()> {
        match self.get_model() {
            Some(model) => model.patch_value(value),
            None => {
                *write_lock(&self.inner.patched_value) = Some(value);
                Ok(())
            }
        }
    }

    pub fn initialize(&self, value: Value) -> FormResult<()> {
        *write_lock(&self.inner.initial_value) = Some(value.clone());
        match self.get_model() {
            Some(model) => model.initialize(value),
            None => {
                *write_lock(&self.inner.patched_value) = None;
                Ok(())
            }
        }
    }

    pub fn reset(&self) {
        match self.get_model() {
            Some(model) => model.reset(),
            None => *write_lock(&self.inner.patched_value) = None,
        }
    }

    pub fn clear(&self) {
        *write_lock(&self.inner.initial_value) = None;
        *write_lock(&self.inner.patched_value) = None;
        if let Some(model) = self.get_model() {
            model.clear();
        }
    }

    pub fn touched(&self) -> bool {
        self.get_model().is_some_and(|model| model.touched())
    }

    pub fn dirty(&self) -> bool {
        self.get_model().is_some_and(|model| model.dirty())
    }

    pub fn pristine(&self) -> bool {
        !self.dirty()
    }

    pub fn valid(&self) -> bool {
        self.get_model().is_none_or(|model| model.valid())
    }

    pub fn validate(&self, option: ValidateOption) -> ValidationFuture {
        match self.get_model() {
            Some(model) => model.validate(option),
            None => future::ready(None).boxed(),
        }
    }

    pub(crate) fn attach(
        &self,
        owner: Owner,
        key: String,
        context: Option<Arc<FormContext>>,
    ) -> FormResult<()> {
        *write_lock(&self.inner.attachment) = Attachment {
            owner: Some(owner.clone()),
            key: Some(key.clone()),
            context: context.clone(),
        };
        match self.get_model() {
            Some(model) => model.attach(owner, key, context),
            None => Ok(()),
        }
    }

    pub(crate) fn detach(&self) {
        *write_lock(&self.inner.attachment) = Attachment::default();
        if let Some(model) = self.get_model() {
            model.detach();
        }
    }

    pub(crate) fn set_key(&self, key: String) {
        write_lock(&self.inner.attachment).key = Some(key.clone());
        if let Some(model) = self.get_model() {
            model.core().set_key(key);
        }
    }

    pub(crate) fn propagate_context(&self, context: Option<Arc<FormContext>>) {
        write_lock(&self.inner.attachment).context = context.clone();
        if let Some(model) = self.get_model() {
            model.propagate_context(context);
        }
    }

    fn notify_change(&self, model: &Model) {
        model.core().notify_change(|| model.path());
    }
}

impl Debug for ModelRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRef")
            .field("model", &self.get_model())
            .field("value", &self.get_raw_value())
            .finish()
    }
}
