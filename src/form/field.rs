use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::error::{FormError, FormResult, ValidationError};
use super::model::{Model, ModelCore, ModelId};
use super::validation::{ValidateOption, ValidationFuture, Validator, run_validators};
use crate::lock::{read_lock, write_lock};
use crate::reactive::StateStream;

type ShapeCheck = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

struct Shape {
    expected: &'static str,
    accepts: ShapeCheck,
}

struct FieldInner {
    core: ModelCore,
    default_value: Value,
    value: StateStream<Value>,
    initial_value: RwLock<Option<Value>>,
    touched: StateStream<bool>,
    compositing: AtomicBool,
    destroy_on_unmount: AtomicBool,
    shape: Option<Shape>,
}

/// Leaf model holding a single value.
#[derive(Clone)]
pub struct FieldModel {
    inner: Arc<FieldInner>,
}

impl FieldModel {
    pub fn new(default_value: impl Into<Value>) -> Self {
        Self::build(default_value.into(), None)
    }

    fn build(default_value: Value, shape: Option<Shape>) -> Self {
        Self {
            inner: Arc::new(FieldInner {
                core: ModelCore::new(),
                value: StateStream::new(default_value.clone()),
                default_value,
                initial_value: RwLock::new(None),
                touched: StateStream::new(false),
                compositing: AtomicBool::new(false),
                destroy_on_unmount: AtomicBool::new(false),
                shape,
            }),
        }
    }

    pub fn with_validator(self, validator: Validator) -> Self {
        self.core().add_validator(validator);
        self
    }

    pub(crate) fn core(&self) -> &ModelCore {
        &self.inner.core
    }

    pub fn id(&self) -> ModelId {
        self.core().id
    }

    pub fn to_model(&self) -> Model {
        Model::Field(self.clone())
    }

    pub fn value(&self) -> Value {
        self.inner.value.get()
    }

    pub fn value_stream(&self) -> &StateStream<Value> {
        &self.inner.value
    }

    pub fn default_value(&self) -> &Value {
        &self.inner.default_value
    }

    pub fn initial_value(&self) -> Option<Value> {
        read_lock(&self.inner.initial_value).clone()
    }

    /// External write. Validation is left to the caller.
    pub fn set_value(&self, value: Value) -> FormResult<()> {
        self.check_shape(&value)?;
        self.inner.value.set(value);
        Ok(())
    }

    pub fn patch_value(&self, value: Value) -> FormResult<()> {
        self.set_value(value)
    }

    pub fn initialize(&self, value: Value) -> FormResult<()> {
        self.check_shape(&value)?;
        *write_lock(&self.inner.initial_value) = Some(value.clone());
        self.inner.value.set(value);
        Ok(())
    }

    pub fn reset(&self) {
        let baseline = self
            .initial_value()
            .unwrap_or_else(|| self.inner.default_value.clone());
        self.inner.value.set(baseline);
    }

    pub fn clear(&self) {
        *write_lock(&self.inner.initial_value) = None;
        self.inner.value.set(self.inner.default_value.clone());
    }

    pub fn get_raw_value(&self) -> Value {
        self.value()
    }

    pub fn touched(&self) -> bool {
        self.inner.touched.get()
    }

    /// Latches the touched flag, typically on blur.
    pub fn touch(&self) {
        self.inner.touched.set_if_changed(true);
    }

    pub fn set_touched(&self, touched: bool) {
        self.inner.touched.set_if_changed(touched);
    }

    pub fn touched_stream(&self) -> &StateStream<bool> {
        &self.inner.touched
    }

    /// True while an IME composition is in progress; value changes during
    /// composition should not trigger validation.
    pub fn is_compositing(&self) -> bool {
        self.inner.compositing.load(Ordering::SeqCst)
    }

    pub fn set_compositing(&self, compositing: bool) {
        self.inner.compositing.store(compositing, Ordering::SeqCst);
    }

    pub fn destroy_on_unmount(&self) -> bool {
        self.inner.destroy_on_unmount.load(Ordering::SeqCst)
    }

    pub fn set_destroy_on_unmount(&self, destroy: bool) {
        self.inner.destroy_on_unmount.store(destroy, Ordering::SeqCst);
    }

    pub fn dirty(&self) -> bool {
        let baseline = read_lock(&self.inner.initial_value);
        let baseline = baseline.as_ref().unwrap_or(&self.inner.default_value);
        self.inner.value.with(|value| value != baseline)
    }

    pub fn pristine(&self) -> bool {
        !self.dirty()
    }

    pub fn valid(&self) -> bool {
        self.inner.core.error.with(Option::is_none)
    }

    pub fn error(&self) -> Option<ValidationError> {
        self.core().error.get()
    }

    pub fn error_stream(&self) -> &StateStream<Option<ValidationError>> {
        &self.core().error
    }

    pub fn validate(&self, option: ValidateOption) -> ValidationFuture {
        run_validators(&self.to_model(), option)
    }

    fn check_shape(&self, value: &Value) -> FormResult<()> {
        match &self.inner.shape {
            Some(shape) if !(shape.accepts)(value) => {
                Err(FormError::shape(self.to_model().path(), shape.expected, value))
            }
            _ => Ok(()),
        }
    }
}

/// Field whose value has the semantic type `V`. Values that do not
/// deserialize into `V` are rejected with [`FormError::ShapeMismatch`], also
/// when they arrive through a parent composite.
pub struct TypedField<V> {
    field: FieldModel,
    _marker: PhantomData<fn() -> V>,
}

impl<V> Clone for TypedField<V> {
    fn clone(&self) -> Self {
        Self {
            field: self.field.clone(),
            _marker: PhantomData,
        }
    }
}

impl<V> TypedField<V>
where
    V: Serialize + DeserializeOwned + 'static,
{
    pub fn new(default_value: V) -> FormResult<Self> {
        let expected = std::any::type_name::<V>();
        let default_value = encode(&default_value, expected)?;
        let shape = Shape {
            expected,
            accepts: Arc::new(|value: &Value| V::deserialize(value).is_ok()),
        };
        Ok(Self {
            field: FieldModel::build(default_value, Some(shape)),
            _marker: PhantomData,
        })
    }

    pub fn field(&self) -> &FieldModel {
        &self.field
    }

    pub fn value(&self) -> FormResult<V> {
        let value = self.field.value();
        V::deserialize(&value).map_err(|_| {
            FormError::shape(
                self.field.to_model().path(),
                std::any::type_name::<V>(),
                &value,
            )
        })
    }

    pub fn set_value(&self, value: V) -> FormResult<()> {
        self.field.set_value(encode(&value, std::any::type_name::<V>())?)
    }

    pub fn initialize(&self, value: V) -> FormResult<()> {
        self.field.initialize(encode(&value, std::any::type_name::<V>())?)
    }
}

impl<V> From<TypedField<V>> for Model {
    fn from(field: TypedField<V>) -> Self {
        Model::Field(field.field)
    }
}

fn encode<V: Serialize>(value: &V, expected: &'static str) -> FormResult<Value> {
    serde_json::to_value(value).map_err(|error| FormError::ShapeMismatch {
        path: String::new(),
        expected,
        found: error.to_string(),
    })
}
