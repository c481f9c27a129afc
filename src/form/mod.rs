mod context;
mod controller;
mod draft;
mod error;
mod field;
mod field_array;
mod field_set;
mod model;
mod reference;
mod validation;
pub mod validators;


pub use context::{ExecutionId, StructureChange, ValidatorFaultReport};
pub use controller::{FormId, FormModel, FormOptions, SubmitState};
pub use draft::{FormDraftStore, InMemoryDraftStore};
pub use error::{FormError, FormResult, ValidationError, ValidatorFault};
pub use field::{FieldModel, TypedField};
pub use field_array::{ArrayItem, FieldArrayModel, ItemFactory};
pub use field_set::{ChildEvent, FieldSetModel};
pub use model::{Model, ModelId};
pub use reference::ModelRef;
pub use validation::{
    CancelToken, Outcome, ValidateOption, ValidationFuture, Validator, ValidatorContext,
    ValidatorResult,
};
