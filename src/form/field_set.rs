use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, Weak};

use futures::FutureExt;
use futures::future::join_all;
use serde_json::{Map, Value};

use super::context::FormContext;
use super::error::{FormError, FormResult, ValidationError};
use super::field::FieldModel;
use super::field_array::{FieldArrayModel, ItemFactory};
use super::model::{Model, ModelCore, ModelId, Owner};
use super::validation::{ValidateOption, ValidationFuture, Validator, ensure_not_validating};
use crate::lock::{read_lock, write_lock};
use crate::reactive::{EventStream, StateStream};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChildEvent {
    Registered(String),
    Removed(String),
}

pub(crate) struct SetInner {
    core: ModelCore,
    children: RwLock<BTreeMap<String, Model>>,
    patched_value: RwLock<Map<String, Value>>,
    initial_value: RwLock<Option<Map<String, Value>>>,
    child_events: EventStream<ChildEvent>,
}

/// Keyed group of child models. Its raw value is an object keyed by child
/// name; keys are iterated in sorted order.
#[derive(Clone)]
pub struct FieldSetModel {
    inner: Arc<SetInner>,
}

impl Default for FieldSetModel {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldSetModel {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SetInner {
                core: ModelCore::new(),
                children: RwLock::new(BTreeMap::new()),
                patched_value: RwLock::new(Map::new()),
                initial_value: RwLock::new(None),
                child_events: EventStream::new(),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<SetInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<SetInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn core(&self) -> &ModelCore {
        &self.inner.core
    }

    pub fn id(&self) -> ModelId {
        self.core().id
    }

    pub fn to_model(&self) -> Model {
        Model::Set(self.clone())
    }

    pub fn with_validator(self, validator: Validator) -> Self {
        self.core().add_validator(validator);
        self
    }

    pub fn get(&self, name: &str) -> Option<Model> {
        read_lock(&self.inner.children).get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        read_lock(&self.inner.children).contains_key(name)
    }

    pub fn keys(&self) -> Vec<String> {
        read_lock(&self.inner.children).keys().cloned().collect()
    }

    pub fn children(&self) -> Vec<(String, Model)> {
        read_lock(&self.inner.children)
            .iter()
            .map(|(key, model)| (key.clone(), model.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        read_lock(&self.inner.children).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn child_events(&self) -> &EventStream<ChildEvent> {
        &self.inner.child_events
    }

    /// Pending values for keys that have no child yet.
    pub fn patched_value(&self) -> Map<String, Value> {
        read_lock(&self.inner.patched_value).clone()
    }

    pub fn initial_value(&self) -> Option<Map<String, Value>> {
        read_lock(&self.inner.initial_value).clone()
    }

    /// Registers `model` under `name`, replacing any previous child. The new
    /// child is seeded from this group's initial value and from any value
    /// patched for `name` before it existed.
    pub fn register(&self, name: impl Into<String>, model: impl Into<Model>) -> FormResult<()> {
        ensure_not_validating("register")?;
        let name = name.into();
        let model = model.into();
        model.attach(
            Owner::Set(self.downgrade()),
            name.clone(),
            self.core().context(),
        )?;
        self.seed(&name, &model);

        let previous = write_lock(&self.inner.children).insert(name.clone(), model.clone());
        if let Some(previous) = previous
            && previous.id() != model.id()
        {
            previous.detach();
            self.inner
                .child_events
                .emit(&ChildEvent::Removed(name.clone()));
        }
        tracing::trace!(set = self.id().0, child = %name, "child registered");
        self.inner
            .child_events
            .emit(&ChildEvent::Registered(name.clone()));
        self.core()
            .notify_change(|| join_path(&self.to_model().path(), &name));
        Ok(())
    }

    pub fn remove(&self, name: &str) -> FormResult<Option<Model>> {
        ensure_not_validating("remove")?;
        let Some(model) = write_lock(&self.inner.children).remove(name) else {
            return Ok(None);
        };
        model.detach();
        self.inner
            .child_events
            .emit(&ChildEvent::Removed(name.to_string()));
        self.core()
            .notify_change(|| join_path(&self.to_model().path(), name));
        Ok(Some(model))
    }

    /// Returns the field registered under `name`, creating it with
    /// `default_value` when missing. A value patched for `name` earlier takes
    /// precedence over `default_value` as the new field's current value.
    pub fn field(&self, name: &str, default_value: impl Into<Value>) -> FormResult<FieldModel> {
        if let Some(Model::Field(field)) = self.get(name) {
            return Ok(field);
        }
        let field = FieldModel::new(default_value);
        self.register(name, field.clone())?;
        Ok(field)
    }

    pub fn field_set(&self, name: &str) -> FormResult<FieldSetModel> {
        if let Some(Model::Set(set)) = self.get(name) {
            return Ok(set);
        }
        let set = FieldSetModel::new();
        self.register(name, set.clone())?;
        Ok(set)
    }

    pub fn field_array(
        &self,
        name: &str,
        factory: Option<ItemFactory>,
    ) -> FormResult<FieldArrayModel> {
        if let Some(Model::Array(array)) = self.get(name) {
            return Ok(array);
        }
        let array = match factory {
            Some(factory) => FieldArrayModel::with_factory(Vec::new(), factory),
            None => FieldArrayModel::new(Vec::new()),
        };
        self.register(name, array.clone())?;
        Ok(array)
    }

    pub fn get_raw_value(&self) -> Value {
        Value::Object(
            self.children()
                .into_iter()
                .map(|(key, model)| (key, model.get_raw_value()))
                .collect(),
        )
    }

    /// Patches registered children by key. Keys without a child are kept
    /// for later registration. A failing child does not stop its siblings.
    pub fn patch_value(&self, value: Value) -> FormResult<()> {
        let Value::Object(values) = value else {
            return Err(FormError::shape(self.to_model().path(), "object", &value));
        };
        for (key, value) in values {
            match self.get(&key) {
                Some(child) => {
                    if let Err(error) = child.patch_value(value) {
                        tracing::warn!(
                            set = self.id().0,
                            child = %key,
                            %error,
                            "child patch rejected"
                        );
                    }
                }
                None => {
                    write_lock(&self.inner.patched_value).insert(key, value);
                }
            }
        }
        Ok(())
    }

    pub fn initialize(&self, value: Value) -> FormResult<()> {
        let Value::Object(values) = value else {
            return Err(FormError::shape(self.to_model().path(), "object", &value));
        };
        *write_lock(&self.inner.initial_value) = Some(values.clone());
        for (key, child) in self.children() {
            if let Some(value) = values.get(&key) {
                if let Err(error) = child.initialize(value.clone()) {
                    tracing::warn!(
                        set = self.id().0,
                        child = %key,
                        %error,
                        "child initialize rejected"
                    );
                }
            }
        }
        Ok(())
    }

    pub fn reset(&self) {
        self.for_each_child(Model::reset);
    }

    pub fn clear(&self) {
        *write_lock(&self.inner.initial_value) = None;
        write_lock(&self.inner.patched_value).clear();
        self.for_each_child(Model::clear);
    }

    pub fn touched(&self) -> bool {
        read_lock(&self.inner.children).values().any(Model::touched)
    }

    pub fn dirty(&self) -> bool {
        read_lock(&self.inner.children).values().any(Model::dirty)
    }

    pub fn pristine(&self) -> bool {
        !self.dirty()
    }

    pub fn valid(&self) -> bool {
        self.core().error.with(Option::is_none)
            && read_lock(&self.inner.children).values().all(Model::valid)
    }

    pub fn error(&self) -> Option<ValidationError> {
        self.core().error.get()
    }

    pub fn error_stream(&self) -> &StateStream<Option<ValidationError>> {
        &self.core().error
    }

    pub fn validate(&self, option: ValidateOption) -> ValidationFuture {
        let own = self.to_model().run_own_validators(option);
        if !option.contains(ValidateOption::INCLUDE_CHILDREN) {
            return own;
        }
        let children = self
            .children()
            .into_iter()
            .map(|(_, child)| child.validate(option))
            .collect::<Vec<_>>();
        async move {
            join_all(children).await;
            own.await
        }
        .boxed()
    }

    pub(crate) fn for_each_child(&self, f: impl Fn(&Model)) {
        for (_, child) in self.children() {
            f(&child);
        }
    }

    pub(crate) fn propagate_context(&self, context: Option<Arc<FormContext>>) {
        self.for_each_child(|child| child.propagate_context(context.clone()));
    }

    fn seed(&self, name: &str, model: &Model) {
        let initial = read_lock(&self.inner.initial_value)
            .as_ref()
            .and_then(|values| values.get(name).cloned());
        if let Some(initial) = initial
            && let Err(error) = model.initialize(initial)
        {
            tracing::warn!(set = self.id().0, child = %name, %error, "initial value rejected");
        }
        let patched = write_lock(&self.inner.patched_value).remove(name);
        if let Some(patched) = patched
            && let Err(error) = model.patch_value(patched)
        {
            tracing::warn!(set = self.id().0, child = %name, %error, "patched value rejected");
        }
    }
}

pub(crate) fn join_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}
