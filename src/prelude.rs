pub use crate::form::validators;
pub use crate::form::{
    ArrayItem, CancelToken, FieldArrayModel, FieldModel, FieldSetModel, FormError, FormModel,
    FormOptions, FormResult, Model, ModelRef, Outcome, SubmitState, TypedField, ValidateOption,
    ValidationError, Validator, ValidatorContext, ValidatorFault,
};
pub use crate::reactive::{EventStream, StateStream, Subscription};
