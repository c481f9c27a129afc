use std::sync::{Arc, RwLock, Weak};

use futures::FutureExt;
use futures::future::join_all;
use serde_json::Value;

use super::context::FormContext;
use super::error::{FormError, FormResult, ValidationError};
use super::model::{Model, ModelCore, ModelId, Owner};
use super::reference::ModelRef;
use super::validation::{ValidateOption, ValidationFuture, Validator, ensure_not_validating};
use crate::lock::{read_lock, write_lock};
use crate::reactive::StateStream;

/// Builds the child model for one list position from that position's value.
pub type ItemFactory = Arc<dyn Fn(Value) -> Model + Send + Sync>;

/// One position of a [`FieldArrayModel`]: an eagerly built model, or a
/// reference the consumer binds later.
#[derive(Clone, Debug)]
pub enum ArrayItem {
    Model(Model),
    Ref(ModelRef),
}

impl ArrayItem {
    /// The model at this position, if one is bound.
    pub fn model(&self) -> Option<Model> {
        match self {
            ArrayItem::Model(model) => Some(model.clone()),
            ArrayItem::Ref(reference) => reference.get_model(),
        }
    }

    pub fn reference(&self) -> Option<&ModelRef> {
        match self {
            ArrayItem::Ref(reference) => Some(reference),
            ArrayItem::Model(_) => None,
        }
    }

    pub fn get_raw_value(&self) -> Value {
        match self {
            ArrayItem::Model(model) => model.get_raw_value(),
            ArrayItem::Ref(reference) => reference.get_raw_value(),
        }
    }

    pub fn patch_value(&self, value: Value) -> FormResult<()> {
        match self {
            ArrayItem::Model(model) => model.patch_value(value),
            ArrayItem::Ref(reference) => reference.patch_value(value),
        }
    }

    pub fn initialize(&self, value: Value) -> FormResult<()> {
        match self {
            ArrayItem::Model(model) => model.initialize(value),
            ArrayItem::Ref(reference) => reference.initialize(value),
        }
    }

    pub fn reset(&self) {
        match self {
            ArrayItem::Model(model) => model.reset(),
            ArrayItem::Ref(reference) => reference.reset(),
        }
    }

    pub fn clear(&self) {
        match self {
            ArrayItem::Model(model) => model.clear(),
            ArrayItem::Ref(reference) => reference.clear(),
        }
    }

    pub fn touched(&self) -> bool {
        self.model().is_some_and(|model| model.touched())
    }

    pub fn dirty(&self) -> bool {
        self.model().is_some_and(|model| model.dirty())
    }

    pub fn valid(&self) -> bool {
        self.model().is_none_or(|model| model.valid())
    }

    fn attach(
        &self,
        owner: Owner,
        key: String,
        context: Option<Arc<FormContext>>,
    ) -> FormResult<()> {
        match self {
            ArrayItem::Model(model) => model.attach(owner, key, context),
            ArrayItem::Ref(reference) => reference.attach(owner, key, context),
        }
    }

    fn detach(&self) {
        match self {
            ArrayItem::Model(model) => model.detach(),
            ArrayItem::Ref(reference) => reference.detach(),
        }
    }

    fn set_key(&self, key: String) {
        match self {
            ArrayItem::Model(model) => model.core().set_key(key),
            ArrayItem::Ref(reference) => reference.set_key(key),
        }
    }

    fn propagate_context(&self, context: Option<Arc<FormContext>>) {
        match self {
            ArrayItem::Model(model) => model.propagate_context(context),
            ArrayItem::Ref(reference) => reference.propagate_context(context),
        }
    }
}

impl From<Model> for ArrayItem {
    fn from(model: Model) -> Self {
        ArrayItem::Model(model)
    }
}

impl From<ModelRef> for ArrayItem {
    fn from(reference: ModelRef) -> Self {
        ArrayItem::Ref(reference)
    }
}

pub(crate) struct ArrayInner {
    core: ModelCore,
    items: StateStream<Vec<ArrayItem>>,
    factory: Option<ItemFactory>,
    default_value: Vec<Value>,
    initial_value: RwLock<Option<Vec<Value>>>,
}

/// Ordered list of child models. Every structural edit publishes the whole
/// item list at once.
#[derive(Clone)]
pub struct FieldArrayModel {
    inner: Arc<ArrayInner>,
}

impl FieldArrayModel {
    /// List whose positions are [`ModelRef`]s bound later by the consumer.
    pub fn new(default_value: Vec<Value>) -> Self {
        Self::build(default_value, None)
    }

    /// List whose positions are built eagerly by `factory`.
    pub fn with_factory(default_value: Vec<Value>, factory: ItemFactory) -> Self {
        Self::build(default_value, Some(factory))
    }

    fn build(default_value: Vec<Value>, factory: Option<ItemFactory>) -> Self {
        let array = Self {
            inner: Arc::new(ArrayInner {
                core: ModelCore::new(),
                items: StateStream::new(Vec::new()),
                factory,
                default_value,
                initial_value: RwLock::new(None),
            }),
        };
        let mut items = Vec::with_capacity(array.inner.default_value.len());
        for value in &array.inner.default_value {
            let item = array.make_item(value.clone());
            match item.attach(Owner::Array(array.downgrade()), items.len().to_string(), None) {
                Ok(()) => items.push(item),
                Err(error) => tracing::warn!(array = array.id().0, %error, "item rejected"),
            }
        }
        array.inner.items.set(items);
        array
    }

    pub(crate) fn from_inner(inner: Arc<ArrayInner>) -> Self {
        Self { inner }
    }

    fn downgrade(&self) -> Weak<ArrayInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn core(&self) -> &ModelCore {
        &self.inner.core
    }

    pub fn id(&self) -> ModelId {
        self.core().id
    }

    pub fn to_model(&self) -> Model {
        Model::Array(self.clone())
    }

    pub fn with_validator(self, validator: Validator) -> Self {
        self.core().add_validator(validator);
        self
    }

    pub fn items(&self) -> Vec<ArrayItem> {
        self.inner.items.get()
    }

    pub fn items_stream(&self) -> &StateStream<Vec<ArrayItem>> {
        &self.inner.items
    }

    pub fn get(&self, index: usize) -> Option<ArrayItem> {
        self.inner.items.with(|items| items.get(index).cloned())
    }

    pub fn len(&self) -> usize {
        self.inner.items.with(Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn default_value(&self) -> &[Value] {
        &self.inner.default_value
    }

    pub fn initial_value(&self) -> Option<Vec<Value>> {
        read_lock(&self.inner.initial_value).clone()
    }

    pub fn push(&self, value: Value) -> FormResult<()> {
        let len = self.len();
        self.splice(len, 0, vec![value]).map(drop)
    }

    pub fn pop(&self) -> FormResult<Option<ArrayItem>> {
        let Some(last) = self.len().checked_sub(1) else {
            ensure_not_validating("pop")?;
            return Ok(None);
        };
        Ok(self.splice(last, 1, Vec::new())?.pop())
    }

    pub fn shift(&self) -> FormResult<Option<ArrayItem>> {
        Ok(self.splice(0, 1, Vec::new())?.pop())
    }

    pub fn unshift(&self, value: Value) -> FormResult<()> {
        self.splice(0, 0, vec![value]).map(drop)
    }

    /// Removes `delete_count` items at `start` and inserts one new item per
    /// value there. `start` and `delete_count` are clamped to the list.
    pub fn splice(
        &self,
        start: usize,
        delete_count: usize,
        values: Vec<Value>,
    ) -> FormResult<Vec<ArrayItem>> {
        let inserted = values.into_iter().map(|value| self.make_item(value)).collect();
        self.splice_items(start, delete_count, inserted)
    }

    /// Like [`splice`](Self::splice) but inserts caller-built items.
    pub fn splice_items(
        &self,
        start: usize,
        delete_count: usize,
        inserted: Vec<ArrayItem>,
    ) -> FormResult<Vec<ArrayItem>> {
        ensure_not_validating("splice")?;
        let mut items = self.items();
        let start = start.min(items.len());
        let end = start.saturating_add(delete_count).min(items.len());

        if inserted
            .iter()
            .any(|item| matches!(item, ArrayItem::Model(Model::Form(_))))
        {
            return Err(FormError::NestedForm);
        }
        let context = self.core().context();
        for (offset, item) in inserted.iter().enumerate() {
            item.attach(
                Owner::Array(self.downgrade()),
                (start + offset).to_string(),
                context.clone(),
            )?;
        }
        let removed = items.splice(start..end, inserted).collect::<Vec<_>>();
        for (index, item) in items.iter().enumerate().skip(start) {
            item.set_key(index.to_string());
        }
        self.inner.items.set(items);
        for item in &removed {
            item.detach();
        }
        tracing::trace!(
            array = self.id().0,
            start,
            removed = removed.len(),
            len = self.len(),
            "items spliced"
        );
        self.core().notify_change(|| self.to_model().path());
        Ok(removed)
    }

    pub fn get_raw_value(&self) -> Value {
        Value::Array(
            self.inner
                .items
                .with(|items| items.iter().map(ArrayItem::get_raw_value).collect()),
        )
    }

    /// Patches by position: extra items are dropped, missing ones appended.
    pub fn patch_value(&self, value: Value) -> FormResult<()> {
        let Value::Array(values) = value else {
            return Err(FormError::shape(self.to_model().path(), "array", &value));
        };
        let items = self.items();
        if values.len() < items.len() {
            self.splice(values.len(), items.len() - values.len(), Vec::new())?;
        }
        let mut appended = Vec::new();
        for (index, value) in values.into_iter().enumerate() {
            match items.get(index) {
                Some(item) => {
                    if let Err(error) = item.patch_value(value) {
                        tracing::warn!(array = self.id().0, index, %error, "item patch rejected");
                    }
                }
                None => appended.push(value),
            }
        }
        if !appended.is_empty() {
            let len = self.len();
            self.splice(len, 0, appended)?;
        }
        Ok(())
    }

    pub fn initialize(&self, value: Value) -> FormResult<()> {
        let Value::Array(values) = value else {
            return Err(FormError::shape(self.to_model().path(), "array", &value));
        };
        *write_lock(&self.inner.initial_value) = Some(values.clone());
        self.align(values, true)
    }

    /// Realigns positions with the initial value, or the default when none
    /// was given. Bound models stay in place.
    pub fn reset(&self) {
        let result = match self.initial_value() {
            Some(initial) => self.align(initial, false),
            None => self.align(self.inner.default_value.clone(), false),
        };
        if let Err(error) = result {
            tracing::warn!(array = self.id().0, %error, "reset rejected");
        }
    }

    pub fn clear(&self) {
        *write_lock(&self.inner.initial_value) = None;
        for item in self.items() {
            item.clear();
        }
        self.reset();
    }

    pub fn touched(&self) -> bool {
        self.inner.items.with(|items| items.iter().any(ArrayItem::touched))
    }

    pub fn dirty(&self) -> bool {
        let baseline = self
            .initial_value()
            .map_or(self.inner.default_value.len(), |initial| initial.len());
        self.inner
            .items
            .with(|items| items.len() != baseline || items.iter().any(ArrayItem::dirty))
    }

    pub fn pristine(&self) -> bool {
        !self.dirty()
    }

    pub fn valid(&self) -> bool {
        self.core().error.with(Option::is_none)
            && self.inner.items.with(|items| items.iter().all(ArrayItem::valid))
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
        let mut children = Vec::new();
        self.for_each_model(|child| children.push(child.validate(option)));
        async move {
            join_all(children).await;
            own.await
        }
        .boxed()
    }

    /// Visits the bound model at every position.
    pub(crate) fn for_each_model(&self, mut f: impl FnMut(&Model)) {
        for item in self.items() {
            if let Some(model) = item.model() {
                f(&model);
            }
        }
    }

    pub(crate) fn propagate_context(&self, context: Option<Arc<FormContext>>) {
        for item in self.items() {
            item.propagate_context(context.clone());
        }
    }

    fn make_item(&self, value: Value) -> ArrayItem {
        match &self.inner.factory {
            Some(factory) => ArrayItem::Model(factory(value)),
            None => ArrayItem::Ref(ModelRef::with_value(value)),
        }
    }

    /// Truncates or extends the list to `values` and brings every position
    /// to its value, either as a new baseline or by resetting.
    fn align(&self, values: Vec<Value>, initialize: bool) -> FormResult<()> {
        let items = self.items();
        if values.len() < items.len() {
            self.splice_items(values.len(), items.len() - values.len(), Vec::new())?;
        }
        let mut appended = Vec::new();
        for (index, value) in values.into_iter().enumerate() {
            let result = match items.get(index) {
                Some(item) if initialize => item.initialize(value),
                Some(item) => {
                    item.reset();
                    if item.get_raw_value() == value {
                        Ok(())
                    } else {
                        item.patch_value(value)
                    }
                }
                None => {
                    let item = self.make_item(value.clone());
                    let result = if initialize { item.initialize(value) } else { Ok(()) };
                    appended.push(item);
                    result
                }
            };
            if let Err(error) = result {
                tracing::warn!(array = self.id().0, index, %error, "item value rejected");
            }
        }
        if !appended.is_empty() {
            self.splice_items(items.len(), 0, appended)?;
        }
        Ok(())
    }
}
